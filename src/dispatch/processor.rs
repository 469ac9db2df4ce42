//! Per-batch change processing and checkpointing.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, trace, warn};

use crate::feed::{self, GroupKey};
use crate::interfaces::{FeedDelivery, FeedPayload, ObserverNotifier};

/// What happened to one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Groups whose observers were notified, in processing order.
    pub notified: Vec<GroupKey>,
    /// Groups whose notification failed.
    pub failed: Vec<GroupKey>,
    /// Feed rows that were neither changes nor the footer.
    pub skipped: usize,
}

/// Turns feed batches into observer notifications.
///
/// Owns the dispatcher checkpoint: the revision of the last group whose
/// notification succeeded. A failed notification never moves it.
pub struct FeedProcessor {
    notifier: Arc<dyn ObserverNotifier>,
    separator: String,
    checkpoint: RwLock<Option<String>>,
}

impl FeedProcessor {
    pub fn new(notifier: Arc<dyn ObserverNotifier>, separator: impl Into<String>) -> Self {
        Self {
            notifier,
            separator: separator.into(),
            checkpoint: RwLock::new(None),
        }
    }

    /// Last successfully notified token, `None` until the first success.
    pub async fn checkpoint(&self) -> Option<String> {
        self.checkpoint.read().await.clone()
    }

    /// Process one delivery from the change feed.
    ///
    /// Feed-level errors and malformed bodies are logged and leave all
    /// state untouched. Otherwise every `(table, operation)` group is
    /// notified in key order; each success advances the checkpoint, each
    /// failure is logged and skipped.
    pub async fn process(&self, delivery: FeedDelivery) -> BatchOutcome {
        match delivery {
            FeedDelivery::Error(e) => {
                error!(error = %e, "Error in change request");
                BatchOutcome::default()
            }
            FeedDelivery::Batch(payload) => self.process_payload(payload).await,
        }
    }

    pub async fn process_payload(&self, payload: FeedPayload) -> BatchOutcome {
        let entries = match feed::normalize(payload) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Error parsing change feed");
                return BatchOutcome::default();
            }
        };
        if entries.is_empty() {
            return BatchOutcome::default();
        }

        debug!(count = entries.len(), "Received changes, processing");
        let batch = feed::parse_batch(entries);

        if let Some(last_seq) = batch.footer.as_ref().and_then(|f| f.last_seq.as_deref()) {
            let checkpoint = self.checkpoint.read().await;
            if let Some(expected) = checkpoint.as_deref() {
                if expected != last_seq {
                    warn!(
                        expected = %expected,
                        last_seq = %last_seq,
                        "Change feed footer does not match last dispatched update"
                    );
                }
            }
        }

        let mut outcome = BatchOutcome {
            skipped: batch.skipped,
            ..Default::default()
        };

        for ((table, operation), group) in feed::group_changes(batch.records, &self.separator) {
            let ids: Vec<String> = group.ids.into_iter().collect();
            match self.notifier.notify(&table, operation, &ids).await {
                Ok(()) => {
                    *self.checkpoint.write().await = Some(group.last_seen);
                    debug!(table = %table, operation = %operation, "Observer refresh dispatched");
                    trace!(table = %table, pks = ?ids, "Dispatched ids");
                    outcome.notified.push((table, operation));
                }
                Err(e) => {
                    error!(
                        table = %table,
                        operation = %operation,
                        error = %e,
                        "Failed to dispatch observer refresh"
                    );
                    outcome.failed.push((table, operation));
                }
            }
        }

        outcome
    }
}
