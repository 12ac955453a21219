mod common;

use common::{doc, seeded};
use serde_json::json;

#[test]
fn cursor_sort_skip_limit_projection() {
    let (_conn, coll) = seeded(
        "nums",
        json!([
            {"n": 3, "junk": 1},
            {"n": 1, "junk": 1},
            {"n": 5, "junk": 1},
            {"n": 2, "junk": 1},
            {"n": 4, "junk": 1}
        ]),
    );
    let res = coll
        .find(doc(json!({})))
        .sort(doc(json!({"n": -1})))
        .skip(1)
        .limit(2)
        .projection(doc(json!({"n": 1, "_id": 0})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 2);
    assert_eq!(res[0], doc(json!({"n": 4})));
    assert_eq!(res[1], doc(json!({"n": 3})));
}

#[test]
fn cursor_iterates_lazily() {
    let (_conn, coll) = seeded("nums", json!([{"n": 1}, {"n": 2}, {"n": 3}]));
    let mut cursor = coll.find(doc(json!({"n": {"$gte": 2}})));
    let first = cursor.try_next().unwrap().unwrap();
    assert_eq!(first["n"], json!(2));
    let rest: Vec<_> = cursor.map(|r| r.unwrap()).collect();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0]["n"], json!(3));
}

#[test]
fn host_sort_on_fallback_path() {
    let (_conn, coll) = seeded(
        "nums",
        json!([
            {"xs": [{"v": 9}], "n": 2},
            {"xs": [{"v": 1}], "n": 1}
        ]),
    );
    // $elemMatch forces the fallback path; sort still applies.
    let res = coll
        .find(doc(json!({"xs": {"$elemMatch": {"v": {"$gte": 0}}}})))
        .sort(doc(json!({"n": 1})))
        .to_list()
        .unwrap();
    assert_eq!(res[0]["n"], json!(1));
    assert_eq!(res[1]["n"], json!(2));
}

#[test]
fn raw_batches_frame_ndjson() {
    let (_conn, coll) = seeded(
        "nums",
        json!([{"n": 1}, {"n": 2}, {"n": 3}, {"n": 4}, {"n": 5}]),
    );
    let batches: Vec<_> = coll
        .find_raw_batches(doc(json!({})), Some(2))
        .unwrap()
        .collect();
    assert_eq!(batches.len(), 3);
    for batch in &batches {
        let text = std::str::from_utf8(batch).unwrap();
        assert!(text.ends_with('\n'));
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.is_object());
        }
    }
    assert_eq!(batches[0].iter().filter(|b| **b == b'\n').count(), 2);
    assert_eq!(batches[2].iter().filter(|b| **b == b'\n').count(), 1);
}

#[test]
fn aggregate_raw_batches_single_frame() {
    let (_conn, coll) = seeded("nums", json!([{"n": 1}, {"n": 2}, {"n": 3}]));
    let batches: Vec<_> = coll
        .aggregate_raw_batches(vec![json!({"$match": {"n": {"$gte": 2}}})])
        .unwrap()
        .collect();
    assert_eq!(batches.len(), 1);
    let text = std::str::from_utf8(&batches[0]).unwrap();
    assert_eq!(text.lines().count(), 2);
}

#[test]
fn aggregation_cursor_random_access_and_sort() {
    let (_conn, coll) = seeded("nums", json!([{"n": 2}, {"n": 1}]));
    let mut cursor = coll.aggregate(vec![json!({"$match": {}})]);
    cursor.sort_results(&doc(json!({"n": 1}))).unwrap();
    assert_eq!(cursor.get(0).unwrap()["n"], json!(1));
    assert_eq!(cursor.get(1).unwrap()["n"], json!(2));
}
