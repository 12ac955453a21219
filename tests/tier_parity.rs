mod common;

use common::{assert_same_multiset, doc, docs};
use oxidelite::{Connection, Document, IndexOptions};
use serde_json::{Value, json};

fn seed_catalog(conn: &Connection) -> oxidelite::Collection {
    let coll = conn.collection("products").unwrap();
    let categories = ["Electronics", "Books", "Clothing", "Food", "Toys"];
    let statuses = ["active", "inactive"];
    let mut batch = Vec::new();
    for i in 0..5000 {
        batch.push(doc(json!({
            "sku": format!("sku-{i}"),
            "category": categories[i % categories.len()],
            "status": statuses[i % statuses.len()],
            "price": (i % 97) as i64,
            "tags": [format!("t{}", i % 7), format!("t{}", i % 3)]
        })));
    }
    coll.insert_many(batch).unwrap();
    coll.create_index(&[("category", 1)], &IndexOptions::default())
        .unwrap();
    coll
}

#[test]
fn indexed_match_with_limit() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = seed_catalog(&conn);

    let res = coll
        .aggregate(vec![
            json!({"$match": {"category": "Electronics", "status": "active"}}),
            json!({"$limit": 10}),
        ])
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 10);
    for d in &res {
        assert_eq!(d["category"], json!("Electronics"));
        assert_eq!(d["status"], json!("active"));
    }
}

fn run_both_tiers(pipeline: Vec<Value>, rows: Value) -> (Vec<Document>, Vec<Document>) {
    let mut conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("items").unwrap();
    coll.insert_many(docs(rows.clone())).unwrap();
    let sql_result = coll.aggregate(pipeline.clone()).to_list().unwrap();

    conn.set_force_fallback(true);
    let coll = conn.collection("items").unwrap();
    let fallback_result = coll.aggregate(pipeline).to_list().unwrap();
    (sql_result, fallback_result)
}

#[test]
fn kill_switch_parity_across_pipelines() {
    let rows = json!([
        {"cat": "A", "tags": [1, 2, 3], "score": 10, "ts": "2023-01-15T08:30:00"},
        {"cat": "A", "tags": [2], "score": 25, "ts": "2023-01-15T18:20:15"},
        {"cat": "B", "tags": [3], "score": 40, "ts": "2023-02-20T14:45:30"},
        {"cat": "B", "tags": [], "score": 5},
        {"cat": "C", "tags": null, "score": 7}
    ]);

    let pipelines = vec![
        vec![json!({"$match": {"cat": "A"}})],
        vec![json!({"$match": {"score": {"$gte": 10, "$lt": 40}}})],
        vec![json!({"$unwind": "$tags"})],
        vec![json!({"$unwind": {
            "path": "$tags",
            "includeArrayIndex": "i",
            "preserveNullAndEmptyArrays": true
        }})],
        vec![
            json!({"$unwind": "$tags"}),
            json!({"$group": {"_id": "$cat", "t": {"$push": "$tags"}}}),
        ],
        vec![
            json!({"$match": {"score": {"$gt": 5}}}),
            json!({"$sort": {"score": -1}}),
            json!({"$skip": 1}),
            json!({"$limit": 2}),
        ],
        vec![json!({"$group": {"_id": "$cat", "n": {"$sum": 1}, "hi": {"$max": "$score"}}})],
        vec![json!({"$match": {"$expr": {"$gt": ["$score", 9]}}})],
    ];

    for pipeline in pipelines {
        let (sql_result, fallback_result) = run_both_tiers(pipeline.clone(), rows.clone());
        assert_same_multiset(sql_result, fallback_result);
    }
}

#[test]
fn kill_switch_parity_for_finds() {
    let rows = json!([
        {"a": 1, "s": "x"},
        {"a": 2, "s": "y"},
        {"a": null},
        {"s": "z"}
    ]);
    let filters = vec![
        json!({}),
        json!({"a": 1}),
        json!({"a": {"$ne": 1}}),
        json!({"a": {"$exists": true}}),
        json!({"a": null}),
        json!({"$or": [{"a": 2}, {"s": "z"}]}),
        json!({"a": {"$in": [1, null]}}),
    ];

    for filter in filters {
        let mut conn = Connection::open_in_memory().unwrap();
        let coll = conn.collection("items").unwrap();
        coll.insert_many(docs(rows.clone())).unwrap();
        let sql_result = coll.find(doc(filter.clone())).to_list().unwrap();

        conn.set_force_fallback(true);
        let coll = conn.collection("items").unwrap();
        let fallback_result = coll.find(doc(filter.clone())).to_list().unwrap();
        assert_same_multiset(sql_result, fallback_result);
    }
}

#[test]
fn reordering_preserves_results() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("items").unwrap();
    coll.insert_many(docs(json!([
        {"cat": "a", "tags": [1, 2]},
        {"cat": "b", "tags": [3]},
        {"cat": "a", "tags": [4, 5, 6]}
    ])))
    .unwrap();
    coll.create_index(&[("cat", 1)], &IndexOptions::default())
        .unwrap();

    // The indexed subclause can hoist before the unwind; results must
    // not change.
    let res = coll
        .aggregate(vec![
            json!({"$unwind": "$tags"}),
            json!({"$match": {"cat": "a", "tags": {"$gte": 2}}}),
        ])
        .to_list()
        .unwrap();
    let tags: Vec<i64> = res.iter().map(|d| d["tags"].as_i64().unwrap()).collect();
    assert_eq!(tags, vec![2, 4, 5, 6]);
}

#[test]
fn global_kill_switch_forces_fallback() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("items").unwrap();
    coll.insert_many(docs(json!([{"a": 1}, {"a": 2}])))
        .unwrap();

    oxidelite::set_force_fallback(true);
    let forced = coll.find(doc(json!({"a": {"$gt": 0}}))).to_list().unwrap();
    oxidelite::set_force_fallback(false);
    let normal = coll.find(doc(json!({"a": {"$gt": 0}}))).to_list().unwrap();
    assert_same_multiset(forced, normal);
}
