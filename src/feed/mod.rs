//! Change feed parsing and grouping.
//!
//! Turns raw feed bodies into [`ChangeRecord`]s and collapses them into
//! per-`(table, operation)` [`ChangeGroup`]s. Everything here is pure; the
//! dispatcher owns delivery and checkpointing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::interfaces::FeedPayload;
use crate::metadata::split_compound_id;

/// Errors raised while decoding a feed body.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Malformed feed line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Kind of mutation a change record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// Derive the operation from a record's own fields.
    ///
    /// Deleted records are deletes; otherwise a revision whose prefix before
    /// `-` (the whole token when there is none) is exactly `"1"` is a create,
    /// anything else an update. `"01-a"` is an update.
    pub fn derive(deleted: bool, revision: &str) -> Self {
        if deleted {
            return Self::Delete;
        }
        match revision.split('-').next() {
            Some("1") => Self::Create,
            _ => Self::Update,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation counter of a revision token (`"3-abc"` → 3).
pub fn revision_generation(revision: &str) -> Option<u64> {
    revision.split_once('-')?.0.parse().ok()
}

/// One change from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// `<table><separator><entity id>`.
    pub compound_id: String,
    /// Latest revision in the record's change list.
    pub revision: String,
    pub deleted: bool,
    /// Store sequence of this change, when the row carries one.
    pub sequence_token: Option<String>,
}

#[derive(Deserialize)]
struct RawChange {
    id: String,
    #[serde(default)]
    deleted: bool,
    changes: Vec<RawRevision>,
    #[serde(default)]
    seq: Option<Value>,
}

#[derive(Deserialize)]
struct RawRevision {
    rev: String,
}

impl ChangeRecord {
    /// Decode one feed row. Returns `None` for rows that are not changes
    /// (error rows, rows with an empty change list).
    pub fn from_entry(entry: &Value) -> Option<Self> {
        let raw: RawChange = serde_json::from_value(entry.clone()).ok()?;
        let revision = raw.changes.last()?.rev.clone();
        Some(Self {
            compound_id: raw.id,
            revision,
            deleted: raw.deleted,
            sequence_token: raw.seq.as_ref().map(token_string),
        })
    }

    pub fn operation(&self) -> OperationKind {
        OperationKind::derive(self.deleted, &self.revision)
    }
}

/// Trailing feed entry carrying the batch's terminal sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footer {
    pub last_seq: Option<String>,
}

/// A normalized, decoded batch.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<ChangeRecord>,
    pub footer: Option<Footer>,
    /// Rows that were neither changes nor a footer.
    pub skipped: usize,
}

/// Convert any feed wire shape into one ordered sequence of entries.
///
/// - Text is newline-delimited JSON; blank lines are ignored.
/// - An array is taken as is.
/// - An object with a `results` array (a non-continuous feed response) is
///   expanded to its rows followed by a `last_seq` footer; any other object
///   becomes a one-entry sequence.
pub fn normalize(payload: FeedPayload) -> Result<Vec<Value>, FeedError> {
    match payload {
        FeedPayload::Text(text) => text
            .split('\n')
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .map(|(line, raw)| {
                serde_json::from_str(raw).map_err(|source| FeedError::Parse {
                    line: line + 1,
                    source,
                })
            })
            .collect(),
        FeedPayload::Array(entries) => Ok(entries),
        FeedPayload::Object(Value::Object(mut object)) => match object.remove("results") {
            Some(Value::Array(mut rows)) => {
                if let Some(last_seq) = object.remove("last_seq") {
                    rows.push(serde_json::json!({ "last_seq": last_seq }));
                }
                Ok(rows)
            }
            Some(other) => {
                object.insert("results".to_string(), other);
                Ok(vec![Value::Object(object)])
            }
            None => Ok(vec![Value::Object(object)]),
        },
        FeedPayload::Object(other) => Ok(vec![other]),
    }
}

/// Split normalized entries into change records and the footer.
///
/// The final entry is the footer slot unless it is itself a change row.
/// An error object in that slot is logged and counted as skipped.
pub fn parse_batch(mut entries: Vec<Value>) -> ParsedBatch {
    let mut batch = ParsedBatch::default();

    let footer_slot = entries
        .last()
        .map(|last| last.get("id").is_none())
        .unwrap_or(false);
    if footer_slot {
        if let Some(last) = entries.pop() {
            if let Some(error) = last.get("error") {
                error!(
                    error = %error,
                    reason = ?last.get("reason"),
                    "Error in change request"
                );
                batch.skipped += 1;
            } else {
                batch.footer = Some(Footer {
                    last_seq: last.get("last_seq").map(token_string),
                });
            }
        }
    }

    for (index, entry) in entries.iter().enumerate() {
        if let Some(error) = entry.get("error") {
            warn!(index, error = %error, "Error row in change feed, skipping");
            batch.skipped += 1;
            continue;
        }
        match ChangeRecord::from_entry(entry) {
            Some(record) => batch.records.push(record),
            None => {
                warn!(index, entry = %entry, "Unrecognized change feed row, skipping");
                batch.skipped += 1;
            }
        }
    }

    batch
}

/// Grouping key: `(table, operation)`. Orders by table, then operation.
pub type GroupKey = (String, OperationKind);

/// Deduplicated ids affected by one `(table, operation)` within a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeGroup {
    pub ids: BTreeSet<String>,
    /// Revision of the latest record processed for this group.
    pub last_seen: String,
}

/// Collapse records into groups, in record order.
///
/// Repeated ids collapse to one membership; `last_seen` always follows the
/// most recently processed record of the group. Records whose id does not
/// split into table and entity id are skipped.
pub fn group_changes<I>(records: I, separator: &str) -> BTreeMap<GroupKey, ChangeGroup>
where
    I: IntoIterator<Item = ChangeRecord>,
{
    let mut groups: BTreeMap<GroupKey, ChangeGroup> = BTreeMap::new();
    for record in records {
        let Some((table, id)) = split_compound_id(&record.compound_id, separator) else {
            debug!(id = %record.compound_id, "Change for non-entity document, skipping");
            continue;
        };
        let group = groups
            .entry((table.to_string(), record.operation()))
            .or_default();
        group.ids.insert(id.to_string());
        group.last_seen = record.revision;
    }
    groups
}

fn token_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests;
