//! couchline - change feed dispatch and bulk mutations for CouchDB-style
//! document stores.
//!
//! Two subsystems sit on top of a [`DocumentStore`]:
//!
//! - [`ChangeDispatcher`] subscribes to the store's change feed, groups
//!   changes by table and operation, and notifies an [`ObserverNotifier`].
//! - [`BulkMutationCoordinator`] turns the store's per-item bulk results
//!   into all-or-nothing create/read/update/delete results carrying
//!   document revisions.

pub mod bulk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod interfaces;
pub mod metadata;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;

pub use bulk::{BulkMutationCoordinator, RawResponse};
pub use config::Config;
pub use dispatch::{ChangeDispatcher, DispatchError, DispatcherConfig, DispatcherState};
pub use error::PersistenceError;
pub use feed::OperationKind;
pub use interfaces::{DocumentStore, ObserverNotifier};
pub use metadata::Revisioned;
