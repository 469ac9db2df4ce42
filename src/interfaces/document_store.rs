//! Document store interface.
//!
//! Models only the parts of a CouchDB-style store that the change dispatcher
//! and the bulk coordinator depend on. Bodies are plain JSON objects; reserved
//! fields (`_id`, `_rev`, `_deleted`) follow the CouchDB naming.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// A raw document body as exchanged with the store.
pub type Document = Map<String, Value>;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store answered with an error body (`{"error": .., "reason": ..}`).
    #[error("{error}{}", .reason.as_deref().map(|r| format!(" - {r}")).unwrap_or_default())]
    Request {
        status: Option<u16>,
        error: String,
        reason: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store connection closed")]
    Closed,
}

impl StoreError {
    /// Build a request error from a status and CouchDB error code.
    pub fn request(status: u16, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            status: Some(status),
            error: error.into(),
            reason: Some(reason.into()),
        }
    }

    /// The CouchDB error code, when the store reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Request { error, .. } => Some(error.as_str()),
            _ => None,
        }
    }
}

/// Response to a single-document write (insert/destroy).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub rev: String,
}

/// Per-item outcome of a bulk write.
///
/// Successful items carry `id` and `rev`; failed items carry `error` and,
/// usually, a human readable `reason`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkItemResult {
    pub fn success(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            ok: Some(true),
            id: Some(id.into()),
            rev: Some(rev.into()),
            ..Default::default()
        }
    }

    pub fn failure(
        id: impl Into<String>,
        error: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(error.into()),
            reason,
            ..Default::default()
        }
    }
}

/// One row of a multi-key fetch (`_all_docs?include_docs=true`).
///
/// A row carries a document, an error, or (for deleted documents) only
/// its `value`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchRow {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Index definition passed to `createIndex`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    pub index: IndexFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddoc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl IndexRequest {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            index: IndexFields {
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
            ddoc: None,
            name: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFields {
    pub fields: Vec<String>,
}

/// Response to `createIndex`. `result` is `"created"` or `"existing"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResponse {
    pub result: String,
    pub id: String,
    pub name: String,
}

/// A structured (Mango) query forwarded verbatim to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MangoQuery {
    pub selector: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_index: Option<Value>,
}

impl MangoQuery {
    pub fn new(selector: Value) -> Self {
        Self {
            selector,
            ..Default::default()
        }
    }
}

/// Envelope returned by `find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindResponse {
    pub docs: Vec<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_stats: Option<Value>,
}

/// Change feed delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedMode {
    Normal,
    Longpoll,
    #[default]
    Continuous,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Longpoll => "longpoll",
            Self::Continuous => "continuous",
        }
    }
}

/// Options for a change feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesOptions {
    pub feed: FeedMode,
    pub include_docs: bool,
    /// Cursor to start from; `"now"` means only future changes.
    pub since: String,
    /// Idle timeout after which the store may end the long-poll.
    pub timeout: Duration,
}

/// Sentinel cursor meaning "start from the current end of the log".
pub const SINCE_NOW: &str = "now";

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            feed: FeedMode::Continuous,
            include_docs: false,
            since: SINCE_NOW.to_string(),
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Raw feed body in any of the wire shapes the store may produce.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPayload {
    /// Newline-delimited JSON text.
    Text(String),
    /// An already-decoded array of entries.
    Array(Vec<Value>),
    /// A single decoded object.
    Object(Value),
}

/// One delivery on a change feed subscription.
#[derive(Debug)]
pub enum FeedDelivery {
    /// The store reported a feed-level error for this batch.
    Error(StoreError),
    /// A batch of feed entries.
    Batch(FeedPayload),
}

/// Interface for the document store consumed by couchline.
///
/// Implementations:
/// - `MockDocumentStore`: in-memory store with a live change log, for tests
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by its full id.
    async fn get(&self, id: &str) -> Result<Document>;

    /// Fetch many documents by full id, one row per key, positionally aligned.
    async fn fetch(&self, keys: &[String]) -> Result<Vec<FetchRow>>;

    /// Insert or update one document. Updates must carry the current `_rev`.
    async fn insert(&self, doc: Document) -> Result<WriteResponse>;

    /// Write many documents in one call. Results are positionally aligned
    /// with `docs` and report per-item success or failure.
    async fn bulk(&self, docs: Vec<Document>) -> Result<Vec<BulkItemResult>>;

    /// Delete one document. `rev` must be its current revision.
    async fn destroy(&self, id: &str, rev: &str) -> Result<WriteResponse>;

    /// Create a secondary index.
    async fn create_index(&self, index: IndexRequest) -> Result<IndexResponse>;

    /// Run a structured query.
    async fn find(&self, query: MangoQuery) -> Result<FindResponse>;

    /// Open a change feed subscription.
    ///
    /// Returns once the subscription is established; batches are then pushed
    /// into `sink` for the lifetime of the subscription. The subscription ends
    /// when the store gives up or `sink`'s receiver is dropped.
    async fn subscribe_changes(
        &self,
        options: ChangesOptions,
        sink: mpsc::Sender<FeedDelivery>,
    ) -> Result<()>;
}
