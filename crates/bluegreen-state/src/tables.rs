//! redb table definitions for the deployment state store.

use redb::TableDefinition;

/// Deployment records keyed by environment name.
pub const DEPLOYMENT_RECORDS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deployment_records");
