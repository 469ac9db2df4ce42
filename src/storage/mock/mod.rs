//! Mock document store for testing.
//!
//! Keeps documents in memory with CouchDB revision semantics
//! (`<generation>-<hash>`, compare-and-swap on `_rev`, tombstones on delete)
//! and a live change log that feeds every open subscription. Failure
//! injection hooks cover the partial-failure shapes the coordinator and the
//! dispatcher must handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::feed::revision_generation;
use crate::interfaces::document_store::{Result, SINCE_NOW};
use crate::interfaces::{
    BulkItemResult, ChangesOptions, Document, DocumentStore, FeedDelivery, FeedPayload, FetchRow,
    FindResponse, IndexRequest, IndexResponse, MangoQuery, StoreError, WriteResponse,
};
use crate::metadata::{DELETED_FIELD, ID_FIELD, REV_FIELD};

/// Warning returned by `find` when no index covers the selector.
pub const NO_INDEX_WARNING: &str =
    "No matching index found, create an index to optimize query time.";

struct StoredDoc {
    body: Document,
    rev: String,
    deleted: bool,
}

struct ChangeEntry {
    seq: u64,
    id: String,
    rev: String,
    deleted: bool,
}

impl ChangeEntry {
    fn to_row(&self) -> Value {
        let mut row = json!({
            "seq": seq_token(self.seq),
            "id": self.id,
            "changes": [{ "rev": self.rev }],
        });
        if self.deleted {
            row["deleted"] = Value::Bool(true);
        }
        row
    }
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, StoredDoc>,
    changes: Vec<ChangeEntry>,
    seq: u64,
    subscribers: Vec<mpsc::Sender<FeedDelivery>>,
    indexes: HashMap<String, Vec<String>>,
}

impl Inner {
    /// Apply one write under CouchDB revision rules and log the change.
    fn apply_write(
        &mut self,
        id: &str,
        mut body: Document,
        rev: Option<&str>,
        deleted: bool,
    ) -> Result<String> {
        body.remove(ID_FIELD);
        body.remove(REV_FIELD);
        body.remove(DELETED_FIELD);

        let generation = match self.docs.get(id) {
            Some(existing) if !existing.deleted => {
                if rev != Some(existing.rev.as_str()) {
                    return Err(StoreError::request(
                        409,
                        "conflict",
                        "Document update conflict.",
                    ));
                }
                revision_generation(&existing.rev).unwrap_or(0) + 1
            }
            Some(_) if deleted => return Err(StoreError::request(404, "not_found", "deleted")),
            Some(tombstone) => revision_generation(&tombstone.rev).unwrap_or(0) + 1,
            None if deleted => return Err(StoreError::request(404, "not_found", "missing")),
            None if rev.is_some() => {
                return Err(StoreError::request(
                    409,
                    "conflict",
                    "Document update conflict.",
                ))
            }
            None => 1,
        };

        let new_rev = format!("{}-{}", generation, Uuid::new_v4().simple());
        self.docs.insert(
            id.to_string(),
            StoredDoc {
                body: if deleted { Document::new() } else { body },
                rev: new_rev.clone(),
                deleted,
            },
        );
        self.seq += 1;
        self.changes.push(ChangeEntry {
            seq: self.seq,
            id: id.to_string(),
            rev: new_rev.clone(),
            deleted,
        });
        Ok(new_rev)
    }

    fn live(&self, id: &str) -> Option<Document> {
        let stored = self.docs.get(id).filter(|d| !d.deleted)?;
        let mut doc = stored.body.clone();
        doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        doc.insert(REV_FIELD.to_string(), Value::String(stored.rev.clone()));
        Some(doc)
    }

    /// Rows for changes logged after `from_seq`, with a trailing footer.
    fn batch_since(&self, from_seq: u64) -> Option<FeedPayload> {
        let mut rows: Vec<Value> = self
            .changes
            .iter()
            .filter(|c| c.seq > from_seq)
            .map(ChangeEntry::to_row)
            .collect();
        if rows.is_empty() {
            return None;
        }
        rows.push(json!({ "last_seq": seq_token(self.seq) }));
        Some(FeedPayload::Array(rows))
    }

    fn live_subscribers(&mut self) -> Vec<mpsc::Sender<FeedDelivery>> {
        self.subscribers.retain(|s| !s.is_closed());
        self.subscribers.clone()
    }
}

fn seq_token(seq: u64) -> String {
    format!("{seq}-g1AAAA")
}

fn document_id(doc: &Document) -> Option<String> {
    doc.get(ID_FIELD).and_then(Value::as_str).map(str::to_string)
}

fn is_deleted(doc: &Document) -> bool {
    doc.get(DELETED_FIELD).and_then(Value::as_bool).unwrap_or(false)
}

/// In-memory document store with a live change feed.
#[derive(Default)]
pub struct MockDocumentStore {
    inner: RwLock<Inner>,
    failing_subscribes: AtomicU32,
    subscribe_calls: AtomicU32,
    subscribe_options: RwLock<Vec<ChangesOptions>>,
    reject_inserts: AtomicBool,
    bulk_errors: RwLock<HashMap<String, (String, Option<String>)>>,
    fetch_errors: RwLock<HashMap<String, String>>,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` subscribe calls fail with a transport error.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Number of subscribe calls received, failed ones included.
    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Options of every successful subscribe call, in order.
    pub async fn subscribe_options(&self) -> Vec<ChangesOptions> {
        self.subscribe_options.read().await.clone()
    }

    /// When set, `insert` answers `ok: false` without writing.
    pub fn reject_inserts(&self, reject: bool) {
        self.reject_inserts.store(reject, Ordering::SeqCst);
    }

    /// Make bulk writes of `id` report a per-item error.
    pub async fn inject_bulk_error(&self, id: &str, error: &str, reason: Option<&str>) {
        self.bulk_errors.write().await.insert(
            id.to_string(),
            (error.to_string(), reason.map(str::to_string)),
        );
    }

    /// Make fetch rows for `key` report `error`.
    pub async fn inject_fetch_error(&self, key: &str, error: &str) {
        self.fetch_errors
            .write()
            .await
            .insert(key.to_string(), error.to_string());
    }

    /// Push a raw batch to every subscriber, bypassing the change log.
    pub async fn push_batch(&self, payload: FeedPayload) {
        let subscribers = self.inner.write().await.live_subscribers();
        for subscriber in subscribers {
            let _ = subscriber.send(FeedDelivery::Batch(payload.clone())).await;
        }
    }

    /// Push a feed-level error to every subscriber.
    pub async fn push_feed_error(&self, error: &str, reason: &str) {
        let subscribers = self.inner.write().await.live_subscribers();
        for subscriber in subscribers {
            let delivery = FeedDelivery::Error(StoreError::request(500, error, reason));
            let _ = subscriber.send(delivery).await;
        }
    }

    /// Number of documents, tombstones excluded.
    pub async fn live_count(&self) -> usize {
        self.inner
            .read()
            .await
            .docs
            .values()
            .filter(|d| !d.deleted)
            .count()
    }

    /// Deliver changes logged after `from_seq` to current subscribers.
    async fn publish_from(&self, from_seq: u64) {
        let (payload, subscribers) = {
            let mut inner = self.inner.write().await;
            (inner.batch_since(from_seq), inner.live_subscribers())
        };
        let Some(payload) = payload else {
            return;
        };
        for subscriber in subscribers {
            if subscriber
                .send(FeedDelivery::Batch(payload.clone()))
                .await
                .is_err()
            {
                debug!("Dropping closed change feed subscriber");
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn get(&self, id: &str) -> Result<Document> {
        let inner = self.inner.read().await;
        match inner.docs.get(id) {
            Some(d) if d.deleted => Err(StoreError::request(404, "not_found", "deleted")),
            Some(_) => inner
                .live(id)
                .ok_or_else(|| StoreError::request(404, "not_found", "missing")),
            None => Err(StoreError::request(404, "not_found", "missing")),
        }
    }

    async fn fetch(&self, keys: &[String]) -> Result<Vec<FetchRow>> {
        let fetch_errors = self.fetch_errors.read().await;
        let inner = self.inner.read().await;
        Ok(keys
            .iter()
            .map(|key| {
                if let Some(error) = fetch_errors.get(key) {
                    return FetchRow {
                        key: key.clone(),
                        error: Some(error.clone()),
                        ..Default::default()
                    };
                }
                match inner.docs.get(key) {
                    Some(stored) if stored.deleted => FetchRow {
                        key: key.clone(),
                        value: Some(json!({ "rev": stored.rev, "deleted": true })),
                        ..Default::default()
                    },
                    Some(stored) => FetchRow {
                        key: key.clone(),
                        doc: inner.live(key),
                        value: Some(json!({ "rev": stored.rev })),
                        ..Default::default()
                    },
                    None => FetchRow {
                        key: key.clone(),
                        error: Some("not_found".to_string()),
                        ..Default::default()
                    },
                }
            })
            .collect())
    }

    async fn insert(&self, doc: Document) -> Result<WriteResponse> {
        let id = document_id(&doc).unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Ok(WriteResponse {
                ok: false,
                id,
                rev: String::new(),
            });
        }

        let (from_seq, rev) = {
            let mut inner = self.inner.write().await;
            let from_seq = inner.seq;
            let rev = doc.get(REV_FIELD).and_then(Value::as_str).map(str::to_string);
            let deleted = is_deleted(&doc);
            (from_seq, inner.apply_write(&id, doc, rev.as_deref(), deleted)?)
        };
        self.publish_from(from_seq).await;

        Ok(WriteResponse { ok: true, id, rev })
    }

    async fn bulk(&self, docs: Vec<Document>) -> Result<Vec<BulkItemResult>> {
        let bulk_errors = self.bulk_errors.read().await.clone();
        let (from_seq, results) = {
            let mut inner = self.inner.write().await;
            let from_seq = inner.seq;
            let results: Vec<BulkItemResult> = docs
                .into_iter()
                .map(|doc| {
                    let id =
                        document_id(&doc).unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                    if let Some((error, reason)) = bulk_errors.get(&id) {
                        return BulkItemResult::failure(id, error.clone(), reason.clone());
                    }
                    let rev = doc.get(REV_FIELD).and_then(Value::as_str).map(str::to_string);
                    let deleted = is_deleted(&doc);
                    match inner.apply_write(&id, doc, rev.as_deref(), deleted) {
                        Ok(rev) => BulkItemResult::success(id, rev),
                        Err(StoreError::Request { error, reason, .. }) => {
                            BulkItemResult::failure(id, error, reason)
                        }
                        Err(other) => {
                            BulkItemResult::failure(id, "unknown_error", Some(other.to_string()))
                        }
                    }
                })
                .collect();
            (from_seq, results)
        };
        self.publish_from(from_seq).await;

        Ok(results)
    }

    async fn destroy(&self, id: &str, rev: &str) -> Result<WriteResponse> {
        let (from_seq, new_rev) = {
            let mut inner = self.inner.write().await;
            let from_seq = inner.seq;
            (from_seq, inner.apply_write(id, Document::new(), Some(rev), true)?)
        };
        self.publish_from(from_seq).await;

        Ok(WriteResponse {
            ok: true,
            id: id.to_string(),
            rev: new_rev,
        })
    }

    async fn create_index(&self, index: IndexRequest) -> Result<IndexResponse> {
        let name = index
            .name
            .clone()
            .unwrap_or_else(|| format!("idx-{}", index.index.fields.join("-")));
        let id = index
            .ddoc
            .clone()
            .unwrap_or_else(|| format!("_design/{name}"));

        let mut inner = self.inner.write().await;
        let result = if inner.indexes.contains_key(&name) {
            "existing"
        } else {
            inner.indexes.insert(name.clone(), index.index.fields);
            "created"
        };
        Ok(IndexResponse {
            result: result.to_string(),
            id,
            name,
        })
    }

    async fn find(&self, query: MangoQuery) -> Result<FindResponse> {
        let selector = query
            .selector
            .as_object()
            .cloned()
            .ok_or_else(|| StoreError::request(400, "bad_request", "selector must be an object"))?;

        let inner = self.inner.read().await;
        let mut ids: Vec<&String> = inner
            .docs
            .iter()
            .filter(|(_, d)| !d.deleted)
            .map(|(id, _)| id)
            .collect();
        ids.sort();

        let mut docs: Vec<Document> = ids
            .into_iter()
            .filter_map(|id| inner.live(id))
            .filter(|doc| {
                selector
                    .iter()
                    .all(|(field, expected)| matches_condition(doc.get(field), expected))
            })
            .skip(query.skip.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        if let Some(fields) = &query.fields {
            for doc in &mut docs {
                *doc = doc
                    .iter()
                    .filter(|(k, _)| fields.iter().any(|f| f == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
            }
        }

        let indexed = inner.indexes.values().any(|fields| {
            !selector.is_empty() && selector.keys().all(|k| fields.iter().any(|f| f == k))
        });

        Ok(FindResponse {
            docs,
            bookmark: None,
            warning: (!indexed).then(|| NO_INDEX_WARNING.to_string()),
            execution_stats: None,
        })
    }

    async fn subscribe_changes(
        &self,
        options: ChangesOptions,
        sink: mpsc::Sender<FeedDelivery>,
    ) -> Result<()> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Transport("connection refused".to_string()));
        }

        // Cursors are resolved by their numeric prefix; anything at or after
        // it may be redelivered.
        let backlog = if options.since == SINCE_NOW {
            None
        } else {
            let from = revision_generation(&options.since)
                .or_else(|| options.since.parse().ok())
                .unwrap_or(0);
            self.inner
                .read()
                .await
                .batch_since(from.saturating_sub(1))
        };

        self.subscribe_options.write().await.push(options);
        if let Some(payload) = backlog {
            let _ = sink.send(FeedDelivery::Batch(payload)).await;
        }
        self.inner.write().await.subscribers.push(sink);
        Ok(())
    }
}

/// Equality, or a `$eq`/`$ne`/`$exists` operator object.
fn matches_condition(actual: Option<&Value>, expected: &Value) -> bool {
    match expected.as_object() {
        Some(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
            ops.iter().all(|(op, operand)| match op.as_str() {
                "$eq" => actual == Some(operand),
                "$ne" => actual != Some(operand),
                "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
                _ => false,
            })
        }
        _ => actual == Some(expected),
    }
}
