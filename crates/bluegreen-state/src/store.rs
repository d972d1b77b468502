//! StateStore: redb-backed deployment records.
//!
//! Records are read freely; after `initialize` they change only through
//! `compare_and_swap`. The comparison and the write happen inside one redb
//! write transaction, and redb admits a single writer at a time, so two
//! racing swaps against the same expected record cannot both succeed.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DEPLOYMENT_RECORDS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store `record` unless the environment already has one.
    ///
    /// Returns `true` if the record was written.
    pub fn initialize(&self, record: &DeploymentRecord) -> StateResult<bool> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let mut table = txn.open_table(DEPLOYMENT_RECORDS).map_err(map_err!(Table))?;
            created = table
                .get(record.environment.as_str())
                .map_err(map_err!(Read))?
                .is_none();
            if created {
                table
                    .insert(record.environment.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(environment = %record.environment, created, "deployment record initialised");
        Ok(created)
    }

    /// Read an environment's record.
    pub fn read(&self, environment: &str) -> StateResult<DeploymentRecord> {
        self.get(environment)?
            .ok_or_else(|| StateError::NotFound(environment.to_string()))
    }

    /// Read an environment's record, `None` if it was never initialised.
    pub fn get(&self, environment: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENT_RECORDS).map_err(map_err!(Table))?;
        match table.get(environment).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all records.
    pub fn list(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENT_RECORDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Replace the record with `new` if the stored record equals `expected`.
    ///
    /// On success returns the stored record (revision bumped). Fails with
    /// `StateError::Conflict` if the stored record differs from `expected`
    /// and with `StateError::NotFound` if there is none.
    pub fn compare_and_swap(
        &self,
        environment: &str,
        expected: &DeploymentRecord,
        new: &DeploymentRecord,
    ) -> StateResult<DeploymentRecord> {
        let mut stored = new.clone();
        stored.environment = environment.to_string();
        stored.revision = expected.revision + 1;
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENT_RECORDS).map_err(map_err!(Table))?;
            let current: DeploymentRecord = match table.get(environment).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(environment.to_string())),
            };
            if &current != expected {
                debug!(
                    %environment,
                    expected_revision = expected.revision,
                    current_revision = current.revision,
                    "compare-and-swap conflict"
                );
                // Dropping the uncommitted transaction aborts it.
                return Err(StateError::Conflict(environment.to_string()));
            }
            table
                .insert(environment, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %environment,
            revision = stored.revision,
            active_color = %stored.active_color,
            transition_in_progress = stored.transition_in_progress,
            "deployment record swapped"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluegreen_core::{Color, TargetGroupRef};

    fn beta() -> DeploymentRecord {
        DeploymentRecord::new("beta", Color::Blue, TargetGroupRef::new("tg-beta-blue"))
    }

    #[test]
    fn initialize_then_read() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.initialize(&beta()).unwrap());

        let record = store.read("beta").unwrap();
        assert_eq!(record, beta());
    }

    #[test]
    fn initialize_does_not_overwrite() {
        let store = StateStore::open_in_memory().unwrap();
        store.initialize(&beta()).unwrap();

        let mut other = beta();
        other.active_color = Color::Green;
        assert!(!store.initialize(&other).unwrap());
        assert_eq!(store.read("beta").unwrap().active_color, Color::Blue);
    }

    #[test]
    fn read_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(store.read("nope"), Err(StateError::NotFound(_))));
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn cas_succeeds_against_current_record() {
        let store = StateStore::open_in_memory().unwrap();
        store.initialize(&beta()).unwrap();

        let current = store.read("beta").unwrap();
        let locked = store
            .compare_and_swap("beta", &current, &current.locked("attempt-1"))
            .unwrap();
        assert_eq!(locked.revision, 1);
        assert!(locked.transition_in_progress);
        assert_eq!(store.read("beta").unwrap(), locked);
    }

    #[test]
    fn cas_with_stale_expectation_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        store.initialize(&beta()).unwrap();
        let stale = store.read("beta").unwrap();

        store
            .compare_and_swap("beta", &stale, &stale.locked("attempt-1"))
            .unwrap();

        // Second writer still holds the pre-lock view.
        let err = store
            .compare_and_swap("beta", &stale, &stale.locked("attempt-2"))
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.read("beta").unwrap().is_locked_by("attempt-1"));
    }

    #[test]
    fn cas_on_missing_environment_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .compare_and_swap("beta", &beta(), &beta().locked("x"))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn full_transition_sequence() {
        let store = StateStore::open_in_memory().unwrap();
        store.initialize(&beta()).unwrap();

        let r0 = store.read("beta").unwrap();
        let r1 = store.compare_and_swap("beta", &r0, &r0.locked("a")).unwrap();
        let r2 = store
            .compare_and_swap(
                "beta",
                &r1,
                &r1.committed(Color::Green, TargetGroupRef::new("tg-beta-green"), 42),
            )
            .unwrap();

        assert_eq!(r2.revision, 2);
        let status = store.read("beta").unwrap().status();
        assert_eq!(status.active_color, Color::Green);
        assert!(!status.transition_in_progress);
        assert_eq!(status.last_transition_time, 42);
    }

    #[test]
    fn list_returns_every_environment() {
        let store = StateStore::open_in_memory().unwrap();
        store.initialize(&beta()).unwrap();
        store
            .initialize(&DeploymentRecord::new(
                "prod",
                Color::Green,
                TargetGroupRef::new("tg-prod-green"),
            ))
            .unwrap();

        let mut names: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.environment)
            .collect();
        names.sort();
        assert_eq!(names, vec!["beta", "prod"]);
    }

    #[test]
    fn concurrent_lockers_only_one_wins() {
        let store = StateStore::open_in_memory().unwrap();
        store.initialize(&beta()).unwrap();
        let snapshot = store.read("beta").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let snapshot = snapshot.clone();
                std::thread::spawn(move || {
                    store
                        .compare_and_swap("beta", &snapshot, &snapshot.locked(&format!("t{i}")))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.initialize(&beta()).unwrap();
            let r = store.read("beta").unwrap();
            store
                .compare_and_swap(
                    "beta",
                    &r,
                    &r.committed(Color::Green, TargetGroupRef::new("tg-beta-green"), 9),
                )
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let record = store.read("beta").unwrap();
        assert_eq!(record.active_color, Color::Green);
        assert_eq!(record.revision, 1);
    }
}
