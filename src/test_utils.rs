//! Test utilities and mock implementations.
//!
//! Provides a recording observer notifier for exercising the change
//! dispatcher without a real observer layer. The mock document store lives
//! in `storage::mock`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::feed::OperationKind;
use crate::interfaces::{ObserverError, ObserverNotifier};

/// One recorded `notify` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyCall {
    pub table: String,
    pub operation: OperationKind,
    pub ids: Vec<String>,
}

impl NotifyCall {
    pub fn new(table: &str, operation: OperationKind, ids: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            operation,
            ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

/// Mock observer notifier that records every call.
///
/// Failing tables still have their calls recorded before the error is
/// returned.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: RwLock<Vec<NotifyCall>>,
    failing_tables: RwLock<HashSet<String>>,
    delay: RwLock<Option<Duration>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make notifications for `table` fail.
    pub async fn fail_table(&self, table: &str) {
        self.failing_tables.write().await.insert(table.to_string());
    }

    pub async fn recover_table(&self, table: &str) {
        self.failing_tables.write().await.remove(table);
    }

    /// Sleep this long inside every notification.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub async fn calls(&self) -> Vec<NotifyCall> {
        self.calls.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn clear(&self) {
        self.calls.write().await.clear();
    }

    /// Poll until at least `count` calls were recorded or `timeout` elapses.
    ///
    /// Returns whether the count was reached.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.call_count().await < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl ObserverNotifier for RecordingNotifier {
    async fn notify(
        &self,
        table: &str,
        operation: OperationKind,
        ids: &[String],
    ) -> Result<(), ObserverError> {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.write().await.push(NotifyCall {
            table: table.to_string(),
            operation,
            ids: ids.to_vec(),
        });

        if self.failing_tables.read().await.contains(table) {
            return Err(ObserverError::Unavailable(format!(
                "Mock failure for table {table}"
            )));
        }
        Ok(())
    }
}
