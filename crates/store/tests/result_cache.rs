//! Result cache behavior: publication, projection, export, eviction.

use brapi_protocol::{Record, ResultSet, unix_now};
use brapi_store::{ResultStore, StoreError};
use serde_json::json;
use std::time::Duration;

fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn sample_set(result_id: &str, created_at: u64) -> ResultSet {
    let columns = vec!["id".to_string(), "name".to_string(), "yield".to_string()];
    let rows = vec![
        record(&[("id", json!("g1")), ("name", json!("acc-1")), ("yield", json!(12.5))]),
        record(&[("id", json!("g2")), ("name", json!("acc-2")), ("yield", json!(9.1))]),
        record(&[("id", json!("g3")), ("name", json!("acc-3")), ("yield", serde_json::Value::Null)]),
    ];
    ResultSet {
        session_id: "sess0001".to_string(),
        result_id: result_id.to_string(),
        columns,
        returned_count: rows.len() as u64,
        rows,
        total_matches: 10,
        truncated: true,
        created_at,
    }
}

#[test]
fn put_then_summary_and_load_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");

    let put_summary = store.put(&sample_set("aaaa111122223333", unix_now())).expect("put");
    assert_eq!(put_summary.row_count, 3);

    let summary = store.get_summary("aaaa111122223333").expect("summary");
    assert_eq!(summary.columns, vec!["id", "name", "yield"]);
    assert_eq!(summary.column_count, 3);
    assert_eq!(summary.total_matches, 10);
    assert!(summary.truncated);
    assert!(summary.approx_size_bytes > 0);

    let loaded = store
        .load("aaaa111122223333", None, None, 0)
        .expect("load");
    assert_eq!(loaded.rows.len(), 3);
    assert_eq!(loaded.rows[0].get("id"), Some(&json!("g1")));
    assert_eq!(loaded.rows[2].get("yield"), Some(&serde_json::Value::Null));
}

#[test]
fn duplicate_put_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");

    store.put(&sample_set("bbbb111122223333", unix_now())).expect("first put");
    let err = store
        .put(&sample_set("bbbb111122223333", unix_now()))
        .expect_err("second put must fail");
    assert!(matches!(err, StoreError::DuplicateResult(_)));

    // The original entry is untouched.
    assert_eq!(store.get_summary("bbbb111122223333").expect("summary").row_count, 3);
}

#[test]
fn load_projects_requested_columns_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");
    store.put(&sample_set("cccc111122223333", unix_now())).expect("put");

    let projected = store
        .load(
            "cccc111122223333",
            Some(&["yield".to_string(), "id".to_string()]),
            None,
            0,
        )
        .expect("load");
    assert_eq!(projected.columns, vec!["yield", "id"]);
    let keys: Vec<&str> = projected.rows[0].keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["yield", "id"]);
}

#[test]
fn unknown_column_fails_the_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");
    store.put(&sample_set("dddd111122223333", unix_now())).expect("put");

    let err = store
        .load(
            "dddd111122223333",
            Some(&["nope".to_string()]),
            None,
            0,
        )
        .expect_err("unknown column");
    assert!(matches!(err, StoreError::UnknownColumn(name) if name == "nope"));
}

#[test]
fn offset_beyond_rows_is_empty_not_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");
    store.put(&sample_set("eeee111122223333", unix_now())).expect("put");

    let loaded = store
        .load("eeee111122223333", None, Some(10), 99)
        .expect("load");
    assert!(loaded.rows.is_empty());
}

#[test]
fn load_is_idempotent_for_identical_arguments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");
    store.put(&sample_set("ffff111122223333", unix_now())).expect("put");

    let columns = vec!["name".to_string()];
    let first = store
        .load("ffff111122223333", Some(&columns), Some(2), 1)
        .expect("first load");
    let second = store
        .load("ffff111122223333", Some(&columns), Some(2), 1)
        .expect("second load");
    assert_eq!(
        serde_json::to_vec(&first).expect("encode"),
        serde_json::to_vec(&second).expect("encode")
    );
}

#[test]
fn export_location_is_deterministic_and_real_after_put() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");

    // Derivable before any put, no state lookup involved.
    let expected = dir
        .path()
        .join("results")
        .join("abcd111122223333")
        .join("rows.csv");
    assert_eq!(store.export_location("abcd111122223333"), expected);

    store.put(&sample_set("abcd111122223333", unix_now())).expect("put");
    let csv = std::fs::read_to_string(store.export_location("abcd111122223333")).expect("read csv");
    assert!(csv.starts_with("id,name,yield"));
    assert!(csv.contains("g2,acc-2,9.1"));
}

#[test]
fn missing_result_reads_fail_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");

    assert!(matches!(
        store.get_summary("feedfeedfeedfeed"),
        Err(StoreError::UnknownSessionOrResult(_))
    ));
    assert!(matches!(
        store.load("feedfeedfeedfeed", None, None, 0),
        Err(StoreError::UnknownSessionOrResult(_))
    ));
    assert!(!store.delete_result("feedfeedfeedfeed").expect("delete"));
}

#[test]
fn eviction_respects_the_retention_boundary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");

    let retention = Duration::from_secs(30 * 86_400);
    let created = 1_700_000_000u64;
    store.put(&sample_set("0123456789abcdef", created)).expect("put");

    // One second inside the window: still present.
    let evicted = store
        .evict_expired_at(retention, created + retention.as_secs() - 1)
        .expect("sweep");
    assert_eq!(evicted, 0);
    assert!(store.get_summary("0123456789abcdef").is_ok());

    // One second past the window: gone.
    let evicted = store
        .evict_expired_at(retention, created + retention.as_secs() + 1)
        .expect("sweep");
    assert_eq!(evicted, 1);
    assert!(matches!(
        store.get_summary("0123456789abcdef"),
        Err(StoreError::UnknownSessionOrResult(_))
    ));
}

#[test]
fn eviction_leaves_fresh_entries_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");

    let retention = Duration::from_secs(30 * 86_400);
    let now = unix_now();
    store.put(&sample_set("0000aaaa0000aaaa", now - retention.as_secs() - 100)).expect("old");
    store.put(&sample_set("1111bbbb1111bbbb", now)).expect("fresh");

    let evicted = store.evict_expired(retention).expect("sweep");
    assert_eq!(evicted, 1);
    assert!(store.get_summary("1111bbbb1111bbbb").is_ok());

    let listed = store.list_results().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].result_id, "1111bbbb1111bbbb");
}

#[test]
fn concurrent_puts_of_distinct_ids_both_publish() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();

    let handles: Vec<_> = ["aa11aa11aa11aa11", "bb22bb22bb22bb22"]
        .into_iter()
        .map(|result_id| {
            let root = root.clone();
            std::thread::spawn(move || {
                let store = ResultStore::open(&root).expect("open");
                store.put(&sample_set(result_id, unix_now())).expect("put");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    let store = ResultStore::open(&root).expect("open");
    assert_eq!(store.list_results().expect("list").len(), 2);
}

#[test]
fn staging_entries_are_invisible_to_readers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::open(dir.path()).expect("open");
    store.put(&sample_set("9999cccc9999cccc", unix_now())).expect("put");

    // A half-written entry as a crashed put would leave it.
    let abandoned = dir.path().join("tmp").join("dead0000dead0000.0a0a0a0a");
    std::fs::create_dir_all(&abandoned).expect("mkdir");
    std::fs::write(abandoned.join("rows.json"), b"{").expect("write");

    let listed = store.list_results().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].result_id, "9999cccc9999cccc");
    assert!(matches!(
        store.get_summary("dead0000dead0000"),
        Err(StoreError::UnknownSessionOrResult(_))
    ));
}
