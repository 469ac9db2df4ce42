use serde_json::json;

use super::*;

fn row(id: &str, rev: &str, deleted: bool) -> Value {
    json!({ "id": id, "deleted": deleted, "changes": [{ "rev": rev }] })
}

fn records(entries: Vec<Value>) -> Vec<ChangeRecord> {
    parse_batch(entries).records
}

#[test]
fn test_operation_from_revision_generation() {
    assert_eq!(OperationKind::derive(false, "1-a"), OperationKind::Create);
    assert_eq!(OperationKind::derive(false, "2-b"), OperationKind::Update);
    assert_eq!(OperationKind::derive(false, "11-b"), OperationKind::Update);
    assert_eq!(OperationKind::derive(true, "1-a"), OperationKind::Delete);
    assert_eq!(OperationKind::derive(false, "garbage"), OperationKind::Update);
}

#[test]
fn test_operation_compares_prefix_as_text() {
    assert_eq!(OperationKind::derive(false, "1"), OperationKind::Create);
    assert_eq!(OperationKind::derive(false, "01-a"), OperationKind::Update);
    assert_eq!(OperationKind::derive(false, "1-"), OperationKind::Create);
}

#[test]
fn test_record_uses_latest_revision_in_change_list() {
    let entry = json!({
        "seq": 12,
        "id": "users__1",
        "changes": [{ "rev": "1-a" }, { "rev": "3-c" }]
    });
    let record = ChangeRecord::from_entry(&entry).unwrap();
    assert_eq!(record.revision, "3-c");
    assert!(!record.deleted);
    assert_eq!(record.sequence_token.as_deref(), Some("12"));
    assert_eq!(record.operation(), OperationKind::Update);
}

#[test]
fn test_normalize_text_skips_blank_lines() {
    let text = format!(
        "{}\n\n{}\n{}\n",
        row("users__1", "1-a", false),
        row("users__2", "1-b", false),
        json!({ "last_seq": "4-g1" })
    );
    let entries = normalize(FeedPayload::Text(text)).unwrap();
    assert_eq!(entries.len(), 3);
}

#[test]
fn test_normalize_text_reports_bad_line() {
    let text = format!("{}\n{{not-json}}\n", row("users__1", "1-a", false));
    let err = normalize(FeedPayload::Text(text)).unwrap_err();
    assert!(matches!(err, FeedError::Parse { line: 2, .. }));
}

#[test]
fn test_normalize_single_object() {
    let entries = normalize(FeedPayload::Object(json!({ "last_seq": "9-x" }))).unwrap();
    assert_eq!(entries, vec![json!({ "last_seq": "9-x" })]);
}

#[test]
fn test_normalize_results_envelope() {
    let payload = json!({
        "results": [row("users__1", "1-a", false)],
        "last_seq": "5-e",
        "pending": 0
    });
    let entries = normalize(FeedPayload::Object(payload)).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1], json!({ "last_seq": "5-e" }));
}

#[test]
fn test_parse_batch_separates_footer() {
    let batch = parse_batch(vec![
        row("users__1", "1-a", false),
        json!({ "last_seq": "8-q" }),
    ]);
    assert_eq!(batch.records.len(), 1);
    assert_eq!(
        batch.footer,
        Some(Footer {
            last_seq: Some("8-q".to_string())
        })
    );
}

#[test]
fn test_parse_batch_keeps_trailing_change_row() {
    let batch = parse_batch(vec![
        row("users__1", "1-a", false),
        row("users__2", "1-b", false),
    ]);
    assert_eq!(batch.records.len(), 2);
    assert!(batch.footer.is_none());
}

#[test]
fn test_parse_batch_skips_error_rows() {
    let batch = parse_batch(vec![
        json!({ "id": "users__1", "error": "not_found" }),
        row("users__2", "1-b", false),
        json!({ "last_seq": "3-c" }),
    ]);
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.skipped, 1);
}

#[test]
fn test_parse_batch_error_object_in_footer_slot() {
    let batch = parse_batch(vec![
        row("users__1", "1-a", false),
        json!({ "error": "unauthorized", "reason": "session expired" }),
    ]);
    assert_eq!(batch.records.len(), 1);
    assert!(batch.footer.is_none());
    assert_eq!(batch.skipped, 1);

    let only_error = parse_batch(vec![json!({ "error": "timeout" })]);
    assert!(only_error.records.is_empty());
    assert!(only_error.footer.is_none());
    assert_eq!(only_error.skipped, 1);
}

#[test]
fn test_group_deduplicates_and_tracks_last_processed() {
    let recs = records(vec![
        row("users__1", "2-b", false),
        row("users__1", "3-c", false),
        row("users__2", "2-a", false),
    ]);
    let groups = group_changes(recs, "__");
    assert_eq!(groups.len(), 1);

    let group = &groups[&("users".to_string(), OperationKind::Update)];
    assert_eq!(group.ids.len(), 2);
    // Last processed, not highest generation.
    assert_eq!(group.last_seen, "2-a");
}

#[test]
fn test_group_splits_by_operation() {
    let recs = records(vec![
        row("users__1", "1-a", false),
        row("users__1", "2-b", false),
        row("orders__9", "7-z", true),
    ]);
    let groups = group_changes(recs, "__");
    let keys: Vec<_> = groups.keys().cloned().collect();
    assert_eq!(
        keys,
        vec![
            ("orders".to_string(), OperationKind::Delete),
            ("users".to_string(), OperationKind::Create),
            ("users".to_string(), OperationKind::Update),
        ]
    );
}

#[test]
fn test_group_skips_ids_without_separator() {
    let recs = records(vec![
        row("_design/idx", "1-a", false),
        row("users__1", "1-a", false),
    ]);
    let groups = group_changes(recs, "__");
    assert_eq!(groups.len(), 1);
}

#[test]
fn test_grouping_is_stable_under_reordering_of_distinct_ids() {
    let forward = records(vec![
        row("users__1", "1-a", false),
        row("users__2", "1-b", false),
    ]);
    let mut backward = forward.clone();
    backward.reverse();

    let a = group_changes(forward, "__");
    let b = group_changes(backward, "__");
    let key = ("users".to_string(), OperationKind::Create);
    assert_eq!(a[&key].ids, b[&key].ids);
}
