//! Observer notification interface.

use async_trait::async_trait;

use crate::feed::OperationKind;

/// Errors returned by an observer notifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    #[error("Observer rejected refresh: {0}")]
    Rejected(String),

    #[error("Observer unavailable: {0}")]
    Unavailable(String),
}

/// Receives table-level refresh signals from the change dispatcher.
///
/// Called once per `(table, operation)` group per processed batch with every
/// affected entity id. A returned error is logged and withholds the
/// checkpoint for that group only.
#[async_trait]
pub trait ObserverNotifier: Send + Sync {
    async fn notify(
        &self,
        table: &str,
        operation: OperationKind,
        ids: &[String],
    ) -> Result<(), ObserverError>;
}
