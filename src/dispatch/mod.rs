//! Continuous change feed dispatcher.
//!
//! Subscribes to the store's change feed and fans batches out as
//! table-level observer notifications.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start()--> Subscribing --ok--> Active --close()--> Closed
//!                        |
//!                        +--retries exhausted--> Failed
//! ```
//!
//! Batches are pushed by the store into a bounded channel and consumed by a
//! single worker task, so batches are processed in order and never overlap.

mod processor;

pub use processor::{BatchOutcome, FeedProcessor};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::interfaces::document_store::SINCE_NOW;
use crate::interfaces::{
    ChangesOptions, DocumentStore, FeedDelivery, FeedMode, ObserverNotifier, StoreError,
};
use crate::metadata::DEFAULT_SEPARATOR;
use crate::utils::retry::subscribe_backoff;

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Feed idle timeout, also the wait between subscribe attempts.
    pub timeout_ms: u64,
    /// Subscribe retries after the first failed attempt.
    pub max_subscribe_retries: u32,
    /// Capacity of the delivery channel between store and worker.
    pub channel_capacity: usize,
    /// Ask the store to embed documents in feed rows.
    pub include_docs: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_subscribe_retries: 3,
            channel_capacity: 64,
            include_docs: false,
        }
    }
}

impl DispatcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Subscribing,
    Active,
    /// Subscribe retries exhausted. Terminal.
    Failed,
    /// Closed by the owner. Terminal.
    Closed,
}

impl DispatcherState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Errors surfaced by the dispatcher lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to subscribe to change feed after {attempts} attempts: {source}")]
    SubscribeFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Dispatcher closed")]
    Closed,

    #[error("Dispatcher failed to subscribe and cannot be restarted")]
    Failed,
}

/// Subscribes to a document store's change feed and notifies observers.
pub struct ChangeDispatcher {
    store: Arc<dyn DocumentStore>,
    processor: Arc<FeedProcessor>,
    config: DispatcherConfig,
    state: watch::Sender<DispatcherState>,
    attempts: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeDispatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn ObserverNotifier>,
        config: DispatcherConfig,
    ) -> Self {
        Self::with_separator(store, notifier, config, DEFAULT_SEPARATOR)
    }

    /// Create a dispatcher for stores using a non-default compound id separator.
    pub fn with_separator(
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn ObserverNotifier>,
        config: DispatcherConfig,
        separator: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            store,
            processor: Arc::new(FeedProcessor::new(notifier, separator)),
            config,
            state,
            attempts: AtomicU32::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Last successfully dispatched token.
    pub async fn checkpoint(&self) -> Option<String> {
        self.processor.checkpoint().await
    }

    /// Failed subscribe attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Subscribe to the change feed.
    ///
    /// Resolves once the subscription is established; batches are processed
    /// in the background afterwards. A failed subscribe call is retried after
    /// `timeout_ms`, up to `max_subscribe_retries` times, then the dispatcher
    /// moves to `Failed` and the error is returned. Calling `start` while
    /// subscribing or active does nothing. Dropping the returned future
    /// before it resolves leaves the dispatcher `Idle`, ready to start again.
    #[tracing::instrument(name = "dispatcher.start", skip_all)]
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut gate = Ok(false);
        self.state.send_if_modified(|state| match *state {
            DispatcherState::Idle => {
                *state = DispatcherState::Subscribing;
                gate = Ok(true);
                true
            }
            DispatcherState::Subscribing | DispatcherState::Active => false,
            DispatcherState::Closed => {
                gate = Err(DispatchError::Closed);
                false
            }
            DispatcherState::Failed => {
                gate = Err(DispatchError::Failed);
                false
            }
        });
        if !gate? {
            debug!("Dispatcher already started");
            return Ok(());
        }

        // Back to Idle if this future is dropped while still subscribing.
        let _reset = SubscribingReset(&self.state);

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let worker = tokio::spawn(run_worker(
            self.processor.clone(),
            receiver,
            self.state.subscribe(),
        ));
        if let Some(previous) = self.worker.lock().await.replace(worker) {
            previous.abort();
        }

        let result = (|| self.subscribe_once(sender.clone()))
            .retry(subscribe_backoff(
                self.config.timeout(),
                self.config.max_subscribe_retries,
            ))
            .when(|e: &DispatchError| matches!(e, DispatchError::SubscribeFailed { .. }))
            .notify(|e: &DispatchError, delay: Duration| {
                info!(error = %e, delay = ?delay, "Failed to subscribe to change feed, retrying");
            })
            .await;

        match result {
            Ok(()) => {
                let activated = self.transition(DispatcherState::Subscribing, DispatcherState::Active);
                if activated {
                    info!("Subscribed to change feed");
                    Ok(())
                } else {
                    debug!("Dispatcher closed while subscribing, discarding subscription");
                    Err(DispatchError::Closed)
                }
            }
            Err(e @ DispatchError::SubscribeFailed { .. }) => {
                self.transition(DispatcherState::Subscribing, DispatcherState::Failed);
                error!(error = %e, "Giving up on change feed subscription");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the dispatcher.
    ///
    /// Prevents any further subscribe attempts and stops batch processing.
    /// A batch already being processed is allowed to finish. Safe to call
    /// from any state, any number of times.
    pub async fn close(&self) {
        let closed = self.state.send_if_modified(|state| {
            if *state == DispatcherState::Closed {
                return false;
            }
            *state = DispatcherState::Closed;
            true
        });
        if closed {
            info!("Change dispatcher closed");
        }

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Change dispatcher worker ended abnormally");
            }
        }
    }

    async fn subscribe_once(&self, sender: mpsc::Sender<FeedDelivery>) -> Result<(), DispatchError> {
        if self.state().is_terminal() {
            return Err(DispatchError::Closed);
        }

        let since = self
            .processor
            .checkpoint()
            .await
            .unwrap_or_else(|| SINCE_NOW.to_string());
        let options = ChangesOptions {
            feed: FeedMode::Continuous,
            include_docs: self.config.include_docs,
            since,
            timeout: self.config.timeout(),
        };

        self.store
            .subscribe_changes(options, sender)
            .await
            .map_err(|source| DispatchError::SubscribeFailed {
                attempts: self.attempts.fetch_add(1, Ordering::SeqCst) + 1,
                source,
            })
    }

    fn transition(&self, from: DispatcherState, to: DispatcherState) -> bool {
        self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }
}

/// Resets `Subscribing` to `Idle` on drop. Any other state is left alone.
struct SubscribingReset<'a>(&'a watch::Sender<DispatcherState>);

impl Drop for SubscribingReset<'_> {
    fn drop(&mut self) {
        let reset = self.0.send_if_modified(|state| {
            if *state != DispatcherState::Subscribing {
                return false;
            }
            *state = DispatcherState::Idle;
            true
        });
        if reset {
            debug!("Start cancelled while subscribing, dispatcher back to idle");
        }
    }
}

async fn run_worker(
    processor: Arc<FeedProcessor>,
    mut receiver: mpsc::Receiver<FeedDelivery>,
    mut state: watch::Receiver<DispatcherState>,
) {
    loop {
        tokio::select! {
            delivery = receiver.recv() => {
                let Some(delivery) = delivery else {
                    debug!("Change feed ended");
                    break;
                };
                if state.borrow().is_terminal() {
                    break;
                }
                processor.process(delivery).await;
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    break;
                }
            }
        }
    }
    debug!("Change dispatcher worker stopped");
}
