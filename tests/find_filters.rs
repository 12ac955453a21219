mod common;

use common::{doc, seeded};
use oxidelite::Error;
use serde_json::json;

#[test]
fn equality_and_ranges() {
    let (_conn, coll) = seeded(
        "people",
        json!([
            {"name": "ada", "age": 36},
            {"name": "grace", "age": 45},
            {"name": "alan", "age": 41},
            {"name": "noage"}
        ]),
    );

    let res = coll.find(doc(json!({"age": {"$gt": 40}}))).to_list().unwrap();
    assert_eq!(res.len(), 2);
    assert!(res.iter().all(|d| d["age"].as_i64().unwrap() > 40));

    let res = coll
        .find(doc(json!({"age": {"$gte": 36, "$lt": 45}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 2);

    let res = coll.find(doc(json!({"name": "ada"}))).to_list().unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["age"], json!(36));
}

#[test]
fn in_nin_exists() {
    let (_conn, coll) = seeded(
        "people",
        json!([
            {"name": "a", "tag": "x"},
            {"name": "b", "tag": "y"},
            {"name": "c"}
        ]),
    );

    let res = coll
        .find(doc(json!({"tag": {"$in": ["x", "z"]}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["name"], json!("a"));

    let res = coll
        .find(doc(json!({"tag": {"$nin": ["x"]}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["name"], json!("b"));

    let res = coll
        .find(doc(json!({"tag": {"$exists": false}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["name"], json!("c"));
}

#[test]
fn logical_operators() {
    let (_conn, coll) = seeded(
        "items",
        json!([
            {"n": 1, "cat": "a"},
            {"n": 2, "cat": "b"},
            {"n": 3, "cat": "a"}
        ]),
    );

    let res = coll
        .find(doc(json!({"$or": [{"n": 1}, {"cat": "b"}]})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 2);

    let res = coll
        .find(doc(json!({"$and": [{"cat": "a"}, {"n": {"$gt": 1}}]})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["n"], json!(3));

    let res = coll
        .find(doc(json!({"$nor": [{"cat": "a"}, {"n": 2}]})))
        .to_list()
        .unwrap();
    assert!(res.is_empty());
}

#[test]
fn nested_paths_and_size_mod_contains() {
    let (_conn, coll) = seeded(
        "items",
        json!([
            {"meta": {"owner": "ada"}, "tags": ["red", "blue"], "n": 10},
            {"meta": {"owner": "alan"}, "tags": ["red"], "n": 7}
        ]),
    );

    let res = coll
        .find(doc(json!({"meta.owner": "ada"})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);

    let res = coll
        .find(doc(json!({"tags": {"$size": 2}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["meta"]["owner"], json!("ada"));

    let res = coll
        .find(doc(json!({"n": {"$mod": [5, 0]}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["n"], json!(10));

    let res = coll
        .find(doc(json!({"meta.owner": {"$contains": "AL"}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["meta"]["owner"], json!("alan"));
}

#[test]
fn regex_and_fallback_operators() {
    let (_conn, coll) = seeded(
        "items",
        json!([
            {"name": "neon sign"},
            {"name": "Neat thing"},
            {"xs": [{"v": 4}, {"v": 9}]}
        ]),
    );

    let res = coll
        .find(doc(json!({"name": {"$regex": "^ne", "$options": "i"}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 2);

    // $elemMatch has no SQL shape; the fallback tier answers it.
    let res = coll
        .find(doc(json!({"xs": {"$elemMatch": {"v": {"$gt": 5}}}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);

    // Array-index paths downgrade to the fallback tier too.
    let res = coll.find(doc(json!({"xs[0].v": 4}))).to_list().unwrap();
    assert_eq!(res.len(), 1);
}

#[test]
fn where_raises_malformed_query() {
    let (_conn, coll) = seeded("items", json!([{"a": 1}]));
    let err = coll
        .find(doc(json!({"$where": "this.a == 1"})))
        .to_list()
        .unwrap_err();
    assert!(matches!(err, Error::MalformedQuery(_)));
}

#[test]
fn null_equality_matches_missing_and_null() {
    let (_conn, coll) = seeded(
        "items",
        json!([{"a": null, "tag": "null"}, {"tag": "missing"}, {"a": 1, "tag": "set"}]),
    );
    let res = coll.find(doc(json!({"a": null}))).to_list().unwrap();
    assert_eq!(res.len(), 2);
    assert!(res.iter().all(|d| d["tag"] != json!("set")));
}

#[test]
fn count_and_distinct() {
    let (_conn, coll) = seeded(
        "items",
        json!([
            {"cat": "a", "tags": [1, 2]},
            {"cat": "b", "tags": [2, 3]},
            {"cat": "a"}
        ]),
    );
    assert_eq!(coll.count_documents(doc(json!({"cat": "a"}))).unwrap(), 2);
    assert_eq!(coll.estimated_document_count().unwrap(), 3);

    let mut distinct = coll.distinct("cat", None).unwrap();
    distinct.sort_by_key(|v| v.as_str().unwrap().to_string());
    assert_eq!(distinct, vec![json!("a"), json!("b")]);

    // Array values flatten.
    let tags = coll.distinct("tags", None).unwrap();
    assert_eq!(tags.len(), 3);
}
