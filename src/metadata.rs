//! Revision metadata and composite key helpers.
//!
//! Documents of every table share one database, so each document id is the
//! table name and the entity id joined by a separator. Store-assigned
//! revisions travel beside the payload in [`Revisioned`], never inside it.

use std::fmt;
use std::ops::Deref;

use serde_json::Value;

use crate::interfaces::Document;

/// Reserved document id field.
pub const ID_FIELD: &str = "_id";
/// Reserved revision field.
pub const REV_FIELD: &str = "_rev";
/// Reserved deletion marker field.
pub const DELETED_FIELD: &str = "_deleted";
/// Default table/id separator in compound ids.
pub const DEFAULT_SEPARATOR: &str = "__";

/// Build the compound document id for an entity of `table`.
pub fn generate_id(table: &str, id: impl fmt::Display, separator: &str) -> String {
    format!("{table}{separator}{id}")
}

/// Split a compound id into `(table, entity_id)` on the first separator.
///
/// Returns `None` when there is no separator or either side is empty.
pub fn split_compound_id<'a>(compound: &'a str, separator: &str) -> Option<(&'a str, &'a str)> {
    compound
        .split_once(separator)
        .filter(|(table, id)| !table.is_empty() && !id.is_empty())
}

/// A value with its store-assigned revision attached as side-channel metadata.
///
/// Equality only considers the value; two reads of the same entity at
/// different revisions compare equal if their payloads do.
#[derive(Debug, Clone)]
pub struct Revisioned<T> {
    value: T,
    revision: String,
}

impl<T> Revisioned<T> {
    pub fn new(value: T, revision: impl Into<String>) -> Self {
        Self {
            value,
            revision: revision.into(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn into_parts(self) -> (T, String) {
        (self.value, self.revision)
    }
}

impl Revisioned<Document> {
    /// Re-embed the revision as `_rev`, ready for a compare-and-swap write.
    pub fn into_document(self) -> Document {
        let (mut doc, rev) = self.into_parts();
        doc.insert(REV_FIELD.to_string(), Value::String(rev));
        doc
    }
}

impl<T: PartialEq> PartialEq for Revisioned<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Deref for Revisioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Strip the inline `_rev` from a document and carry `rev` as metadata.
pub(crate) fn assign_metadata(mut doc: Document, rev: impl Into<String>) -> Revisioned<Document> {
    doc.remove(REV_FIELD);
    Revisioned::new(doc, rev)
}

/// Read the inline revision of a stored document.
pub(crate) fn inline_revision(doc: &Document) -> Option<&str> {
    doc.get(REV_FIELD).and_then(Value::as_str)
}
