mod common;

use common::{assert_same_multiset, doc, seeded};
use oxidelite::Error;
use serde_json::json;

fn big_rows() -> serde_json::Value {
    let rows: Vec<serde_json::Value> = (0..500)
        .map(|i| json!({"n": i, "payload": "x".repeat(200)}))
        .collect();
    serde_json::Value::Array(rows)
}

#[test]
fn quez_mode_streams_all_documents() {
    let (_conn, coll) = seeded("big", big_rows());
    // A one-byte threshold forces the compressed-queue path.
    let mut cursor = coll
        .aggregate(vec![json!({"$match": {"n": {"$gte": 100}}})])
        .use_quez(true)
        .memory_threshold(1);
    let res = cursor.to_list().unwrap();
    assert_eq!(res.len(), 400);

    let plain = coll
        .aggregate(vec![json!({"$match": {"n": {"$gte": 100}}})])
        .to_list()
        .unwrap();
    assert_same_multiset(res, plain);
}

#[test]
fn quez_partial_iteration_then_to_list() {
    let (_conn, coll) = seeded("big", big_rows());
    let mut cursor = coll
        .aggregate(vec![doc_stage()])
        .use_quez(true)
        .memory_threshold(1)
        .batch_size(16);

    let mut consumed = 0;
    for _ in 0..10 {
        assert!(cursor.try_next().unwrap().is_some());
        consumed += 1;
    }
    let rest = cursor.to_list().unwrap();
    assert_eq!(consumed + rest.len(), 500);
}

fn doc_stage() -> serde_json::Value {
    json!({"$match": {}})
}

#[test]
fn quez_stats_report_compression() {
    let (_conn, coll) = seeded("big", big_rows());
    let mut cursor = coll
        .aggregate(vec![doc_stage()])
        .use_quez(true)
        .memory_threshold(1)
        .batch_size(64);

    // Pull one document so the producer is running and the queue warm.
    assert!(cursor.try_next().unwrap().is_some());
    let stats = cursor.get_quez_stats().expect("quez active");
    if stats.count > 0 {
        assert!(stats.compressed_size_bytes <= stats.raw_size_bytes);
        assert!(stats.compression_ratio_pct() >= 0.0);
    }
    cursor.close();
}

#[test]
fn quez_rejects_sort_and_indexing() {
    let (_conn, coll) = seeded("big", big_rows());
    let mut cursor = coll
        .aggregate(vec![doc_stage()])
        .use_quez(true)
        .memory_threshold(1);
    assert!(cursor.try_next().unwrap().is_some());

    let err = cursor.sort_results(&doc(json!({"n": 1}))).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(_)));
    let err = cursor.get(0).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(_)));
}

#[test]
fn below_threshold_stays_materialised() {
    let (_conn, coll) = seeded("small", json!([{"n": 1}, {"n": 2}]));
    let mut cursor = coll.aggregate(vec![doc_stage()]).use_quez(true);
    let res = cursor.to_list().unwrap();
    assert_eq!(res.len(), 2);
    assert!(cursor.get_quez_stats().is_none());
}

#[test]
fn early_close_stops_producer() {
    let (_conn, coll) = seeded("big", big_rows());
    let mut cursor = coll
        .aggregate(vec![doc_stage()])
        .use_quez(true)
        .memory_threshold(1)
        .batch_size(4);
    assert!(cursor.try_next().unwrap().is_some());
    // Close with the bounded queue full upstream; the producer must
    // observe the close and exit rather than deadlock.
    cursor.close();
}
