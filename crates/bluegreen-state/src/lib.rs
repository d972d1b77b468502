//! bluegreen-state — durable deployment records.
//!
//! Backed by [redb](https://docs.rs/redb). One `DeploymentRecord` per
//! environment, JSON-serialized into a `&[u8]` value column keyed by the
//! environment name. The only mutation primitive after initialisation is
//! `compare_and_swap`, executed inside a single redb write transaction so
//! concurrent writers serialize on it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
