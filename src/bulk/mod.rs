//! Bulk mutation coordinator.
//!
//! Uniform create/read/update/delete over a store whose multi-item
//! primitives report per-item outcomes. Callers get all-or-nothing results
//! with store revisions attached as [`Revisioned`] metadata.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{parse_error, parse_error_code, PersistenceError, Result};
use crate::interfaces::{
    BulkItemResult, Document, DocumentStore, FetchRow, FindResponse, IndexRequest, MangoQuery,
};
use crate::metadata::{
    assign_metadata, generate_id, inline_revision, Revisioned, DEFAULT_SEPARATOR, DELETED_FIELD,
    ID_FIELD, REV_FIELD,
};
use crate::storage::StoreConfig;

/// Result of a raw query: bare documents or the full store envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    Docs(Vec<Document>),
    Envelope(FindResponse),
}

/// Coordinates single and multi-document mutations against a document store.
pub struct BulkMutationCoordinator {
    store: Arc<dyn DocumentStore>,
    separator: String,
}

impl BulkMutationCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_separator(store, DEFAULT_SEPARATOR)
    }

    pub fn with_separator(store: Arc<dyn DocumentStore>, separator: impl Into<String>) -> Self {
        Self {
            store,
            separator: separator.into(),
        }
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, config: &StoreConfig) -> Self {
        Self::with_separator(store, config.separator.clone())
    }

    /// Compound document id of `id` in `table`.
    pub fn generate_id(&self, table: &str, id: impl fmt::Display) -> String {
        generate_id(table, id, &self.separator)
    }

    /// Insert one document.
    ///
    /// Fills `_id` from `table` and `id` when the model has none. A store
    /// answer without `ok` fails with [`PersistenceError::OperationFailed`].
    #[tracing::instrument(name = "coordinator.create", skip_all, fields(table = %table))]
    pub async fn create(
        &self,
        table: &str,
        id: impl fmt::Display,
        model: Document,
    ) -> Result<Revisioned<Document>> {
        self.write_one("insert", table, id.to_string(), model).await
    }

    /// Insert many documents in one bulk call; fails as a whole if any item fails.
    #[tracing::instrument(name = "coordinator.create_all", skip_all, fields(table = %table, count = models.len()))]
    pub async fn create_all<K: fmt::Display>(
        &self,
        table: &str,
        ids: &[K],
        models: Vec<Document>,
    ) -> Result<Vec<Revisioned<Document>>> {
        self.write_all(table, ids, models).await
    }

    #[tracing::instrument(name = "coordinator.read", skip_all, fields(table = %table))]
    pub async fn read(&self, table: &str, id: impl fmt::Display) -> Result<Revisioned<Document>> {
        let key = self.generate_id(table, id);
        let doc = self.store.get(&key).await.map_err(parse_error)?;
        revisioned(doc, &key)
    }

    /// Read many documents in one fetch, positionally aligned with `ids`.
    ///
    /// Any row reporting an error fails the whole read.
    #[tracing::instrument(name = "coordinator.read_all", skip_all, fields(table = %table, count = ids.len()))]
    pub async fn read_all<K: fmt::Display>(
        &self,
        table: &str,
        ids: &[K],
    ) -> Result<Vec<Revisioned<Document>>> {
        let keys = self.keys(table, ids);
        let rows = self.store.fetch(&keys).await.map_err(parse_error)?;
        resolve_rows(rows)
    }

    /// Write one document. The model must carry its current `_rev`.
    #[tracing::instrument(name = "coordinator.update", skip_all, fields(table = %table))]
    pub async fn update(
        &self,
        table: &str,
        id: impl fmt::Display,
        model: Document,
    ) -> Result<Revisioned<Document>> {
        self.write_one("update", table, id.to_string(), model).await
    }

    #[tracing::instrument(name = "coordinator.update_all", skip_all, fields(table = %table, count = models.len()))]
    pub async fn update_all<K: fmt::Display>(
        &self,
        table: &str,
        ids: &[K],
        models: Vec<Document>,
    ) -> Result<Vec<Revisioned<Document>>> {
        self.write_all(table, ids, models).await
    }

    /// Delete one document, returning it as it was before deletion.
    ///
    /// Reads first to learn the current revision, then destroys with it.
    #[tracing::instrument(name = "coordinator.delete", skip_all, fields(table = %table))]
    pub async fn delete(&self, table: &str, id: impl fmt::Display) -> Result<Revisioned<Document>> {
        let key = self.generate_id(table, id);
        let doc = self.store.get(&key).await.map_err(parse_error)?;
        let current = revisioned(doc, &key)?;
        self.store
            .destroy(&key, current.revision())
            .await
            .map_err(parse_error)?;
        Ok(current)
    }

    /// Delete many documents with one fetch and one bulk write.
    ///
    /// Fetch errors fail the call before anything is deleted. Per-item
    /// errors of the deletion write are logged, not returned; the result
    /// is every document as it was before deletion.
    #[tracing::instrument(name = "coordinator.delete_all", skip_all, fields(table = %table, count = ids.len()))]
    pub async fn delete_all<K: fmt::Display>(
        &self,
        table: &str,
        ids: &[K],
    ) -> Result<Vec<Revisioned<Document>>> {
        let keys = self.keys(table, ids);
        let rows = self.store.fetch(&keys).await.map_err(parse_error)?;
        let current = resolve_rows(rows)?;

        let tombstones: Vec<Document> = current
            .iter()
            .map(|doc| {
                let mut tombstone = doc.value().clone();
                tombstone.insert(
                    REV_FIELD.to_string(),
                    Value::String(doc.revision().to_string()),
                );
                tombstone.insert(DELETED_FIELD.to_string(), Value::Bool(true));
                tombstone
            })
            .collect();

        let results = self.store.bulk(tombstones).await.map_err(parse_error)?;
        for (index, result) in results.iter().enumerate() {
            if let Some(error) = &result.error {
                warn!(
                    index,
                    id = ?result.id,
                    error = %error,
                    reason = ?result.reason,
                    "Failed to delete document in bulk"
                );
            }
        }

        Ok(current)
    }

    /// Forward a structured query to the store.
    ///
    /// Returns the documents alone when `docs_only`, otherwise the whole
    /// envelope. A store warning is logged, never raised.
    #[tracing::instrument(name = "coordinator.raw", skip_all)]
    pub async fn raw(&self, query: MangoQuery, docs_only: bool) -> Result<RawResponse> {
        let response = self.store.find(query).await.map_err(parse_error)?;
        if let Some(warning) = &response.warning {
            warn!(warning = %warning, "Store query warning");
        }
        Ok(if docs_only {
            RawResponse::Docs(response.docs)
        } else {
            RawResponse::Envelope(response)
        })
    }

    /// Create indexes; an index that already exists is a conflict.
    pub async fn create_indexes(&self, indexes: &[IndexRequest]) -> Result<()> {
        for index in indexes {
            let response = self
                .store
                .create_index(index.clone())
                .await
                .map_err(parse_error)?;
            if response.result == "existing" {
                return Err(PersistenceError::Conflict(format!(
                    "Index for table {} with id {}",
                    response.name, response.id
                )));
            }
            debug!(name = %response.name, id = %response.id, "Index created");
        }
        Ok(())
    }

    fn keys<K: fmt::Display>(&self, table: &str, ids: &[K]) -> Vec<String> {
        ids.iter().map(|id| self.generate_id(table, id)).collect()
    }

    fn with_id(&self, table: &str, id: &str, mut model: Document) -> Document {
        if !model.contains_key(ID_FIELD) {
            model.insert(
                ID_FIELD.to_string(),
                Value::String(self.generate_id(table, id)),
            );
        }
        model
    }

    async fn write_one(
        &self,
        operation: &'static str,
        table: &str,
        id: String,
        model: Document,
    ) -> Result<Revisioned<Document>> {
        let model = self.with_id(table, &id, model);
        let response = self.store.insert(model.clone()).await.map_err(parse_error)?;
        if !response.ok {
            return Err(PersistenceError::OperationFailed {
                operation,
                table: table.to_string(),
                id,
            });
        }
        Ok(assign_metadata(model, response.rev))
    }

    async fn write_all<K: fmt::Display>(
        &self,
        table: &str,
        ids: &[K],
        models: Vec<Document>,
    ) -> Result<Vec<Revisioned<Document>>> {
        if ids.len() != models.len() {
            return Err(PersistenceError::Internal(format!(
                "{} ids given for {} models",
                ids.len(),
                models.len()
            )));
        }
        let models: Vec<Document> = ids
            .iter()
            .zip(models)
            .map(|(id, model)| self.with_id(table, &id.to_string(), model))
            .collect();

        let results = self.store.bulk(models.clone()).await.map_err(parse_error)?;
        if let Some(message) = compose_bulk_errors(&results) {
            return Err(PersistenceError::BulkFailed(message));
        }
        if results.len() != models.len() {
            return Err(PersistenceError::Impossible(format!(
                "{} bulk results for {} documents",
                results.len(),
                models.len()
            )));
        }

        models
            .into_iter()
            .zip(results)
            .enumerate()
            .map(|(index, (model, result))| {
                let rev = result.rev.ok_or_else(|| {
                    PersistenceError::Impossible(format!("el {index}: success without revision"))
                })?;
                Ok(assign_metadata(model, rev))
            })
            .collect()
    }
}

/// One line per failing item: `el <index>: <error>[ - <reason>]`.
///
/// Returns `None` when every item succeeded.
pub fn compose_bulk_errors(results: &[BulkItemResult]) -> Option<String> {
    let lines: Vec<String> = results
        .iter()
        .enumerate()
        .filter_map(|(index, result)| {
            let error = result.error.as_ref()?;
            Some(match &result.reason {
                Some(reason) => format!("el {index}: {error} - {reason}"),
                None => format!("el {index}: {error}"),
            })
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn revisioned(doc: Document, key: &str) -> Result<Revisioned<Document>> {
    let rev = inline_revision(&doc)
        .map(str::to_string)
        .ok_or_else(|| PersistenceError::Internal(format!("document {key} has no revision")))?;
    Ok(assign_metadata(doc, rev))
}

fn resolve_rows(rows: Vec<FetchRow>) -> Result<Vec<Revisioned<Document>>> {
    rows.into_iter()
        .map(|row| {
            if let Some(error) = &row.error {
                return Err(parse_error_code(error, Some(&format!("key {}", row.key))));
            }
            match row.doc {
                Some(doc) => revisioned(doc, &row.key),
                None => Err(PersistenceError::Impossible(format!(
                    "row {} has neither document nor error",
                    row.key
                ))),
            }
        })
        .collect()
}
