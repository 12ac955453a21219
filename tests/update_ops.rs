mod common;

use common::{doc, seeded};
use oxidelite::Error;
use serde_json::json;

#[test]
fn set_inc_unset() {
    let (_conn, coll) = seeded("items", json!([{"a": 1, "junk": true}]));

    let res = coll
        .update_one(
            doc(json!({"a": 1})),
            doc(json!({"$set": {"b": "x"}, "$inc": {"a": 4}, "$unset": {"junk": ""}})),
            false,
        )
        .unwrap();
    assert_eq!(res.matched_count, 1);
    assert_eq!(res.modified_count, 1);

    let d = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(d["a"], json!(5));
    assert_eq!(d["b"], json!("x"));
    assert!(!d.contains_key("junk"));
}

#[test]
fn inc_treats_missing_as_zero() {
    let (_conn, coll) = seeded("items", json!([{"name": "a"}]));
    coll.update_one(doc(json!({})), doc(json!({"$inc": {"n": 3}})), false)
        .unwrap();
    let d = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(d["n"], json!(3));

    coll.update_one(doc(json!({})), doc(json!({"$mul": {"n": 2.5}})), false)
        .unwrap();
    let d = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(d["n"], json!(7.5));
}

#[test]
fn identity_set_modifies_nothing() {
    let (_conn, coll) = seeded("items", json!([{"a": 1}]));
    let res = coll
        .update_one(doc(json!({})), doc(json!({"$set": {"a": 1}})), false)
        .unwrap();
    assert_eq!(res.matched_count, 1);
    assert_eq!(res.modified_count, 0);
}

#[test]
fn min_max() {
    let (_conn, coll) = seeded("items", json!([{"lo": 10, "hi": 10}]));
    coll.update_one(
        doc(json!({})),
        doc(json!({"$min": {"lo": 3}, "$max": {"hi": 30}})),
        false,
    )
    .unwrap();
    let d = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(d["lo"], json!(3));
    assert_eq!(d["hi"], json!(30));

    let res = coll
        .update_one(
            doc(json!({})),
            doc(json!({"$min": {"lo": 8}, "$max": {"hi": 8}})),
            false,
        )
        .unwrap();
    assert_eq!(res.modified_count, 0);
}

#[test]
fn inc_mul_reject_non_numeric() {
    let (_conn, coll) = seeded("items", json!([{"n": 1}]));
    for bad in [json!("x"), json!(true), json!([1]), json!({"v": 1}), json!(null)] {
        let err = coll
            .update_one(doc(json!({})), doc(json!({"$inc": {"n": bad}})), false)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedQuery(_)), "accepted {bad:?}");
    }
    let err = coll
        .update_one(doc(json!({})), doc(json!({"$mul": {"n": "2"}})), false)
        .unwrap_err();
    assert!(matches!(err, Error::MalformedQuery(_)));
}

#[test]
fn unknown_update_operator_is_malformed() {
    let (_conn, coll) = seeded("items", json!([{"n": 1}]));
    let err = coll
        .update_one(doc(json!({})), doc(json!({"$bump": {"n": 1}})), false)
        .unwrap_err();
    assert!(matches!(err, Error::MalformedQuery(_)));
}

#[test]
fn array_operators_via_fallback() {
    let (_conn, coll) = seeded("items", json!([{"xs": [1, 2]}]));

    coll.update_one(doc(json!({})), doc(json!({"$push": {"xs": 3}})), false)
        .unwrap();
    coll.update_one(
        doc(json!({})),
        doc(json!({"$addToSet": {"xs": {"$each": [2, 4]}}})),
        false,
    )
    .unwrap();
    let d = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(d["xs"], json!([1, 2, 3, 4]));

    coll.update_one(doc(json!({})), doc(json!({"$pull": {"xs": {"$gte": 3}}})), false)
        .unwrap();
    coll.update_one(doc(json!({})), doc(json!({"$pop": {"xs": -1}})), false)
        .unwrap();
    let d = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(d["xs"], json!([2]));
}

#[test]
fn rename_moves_value() {
    let (_conn, coll) = seeded("items", json!([{"old": {"deep": 1}}]));
    coll.update_one(doc(json!({})), doc(json!({"$rename": {"old": "new"}})), false)
        .unwrap();
    let d = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(d["new"], json!({"deep": 1}));
    assert!(!d.contains_key("old"));
}

#[test]
fn update_many_touches_all_matches() {
    let (_conn, coll) = seeded(
        "items",
        json!([{"cat": "a", "n": 1}, {"cat": "a", "n": 2}, {"cat": "b", "n": 3}]),
    );
    let res = coll
        .update_many(doc(json!({"cat": "a"})), doc(json!({"$inc": {"n": 10}})), false)
        .unwrap();
    assert_eq!(res.matched_count, 2);
    assert_eq!(res.modified_count, 2);
    let total: i64 = coll
        .find(doc(json!({})))
        .to_list()
        .unwrap()
        .iter()
        .map(|d| d["n"].as_i64().unwrap())
        .sum();
    assert_eq!(total, 1 + 2 + 3 + 20);
}

#[test]
fn upsert_inserts_seeded_document() {
    let (_conn, coll) = seeded("items", json!([]));
    let res = coll
        .update_one(
            doc(json!({"key": "k1"})),
            doc(json!({"$set": {"v": 1}, "$setOnInsert": {"created": true}})),
            true,
        )
        .unwrap();
    assert_eq!(res.matched_count, 0);
    assert!(res.upserted_id.is_some());

    let d = coll.find_one(doc(json!({"key": "k1"}))).unwrap().unwrap();
    assert_eq!(d["v"], json!(1));
    assert_eq!(d["created"], json!(true));

    // Second time it matches; $setOnInsert no longer applies.
    let res = coll
        .update_one(
            doc(json!({"key": "k1"})),
            doc(json!({"$set": {"v": 2}, "$setOnInsert": {"created": false}})),
            true,
        )
        .unwrap();
    assert_eq!(res.matched_count, 1);
    assert!(res.upserted_id.is_none());
    let d = coll.find_one(doc(json!({"key": "k1"}))).unwrap().unwrap();
    assert_eq!(d["v"], json!(2));
    assert_eq!(d["created"], json!(true));
}

#[test]
fn replace_one_keeps_row_identity() {
    let (_conn, coll) = seeded("items", json!([{"a": 1}, {"a": 2}]));
    let res = coll
        .replace_one(doc(json!({"a": 1})), doc(json!({"b": "fresh"})), false)
        .unwrap();
    assert_eq!(res.matched_count, 1);
    assert_eq!(res.modified_count, 1);

    let d = coll.find_one(doc(json!({"b": "fresh"}))).unwrap().unwrap();
    assert!(!d.contains_key("a"));
    // The other row is untouched.
    assert_eq!(coll.count_documents(doc(json!({"a": 2}))).unwrap(), 1);
}

#[test]
fn find_one_and_update_returns_pre_image() {
    let (_conn, coll) = seeded("items", json!([{"n": 1}]));
    let before = coll
        .find_one_and_update(doc(json!({})), doc(json!({"$inc": {"n": 1}})))
        .unwrap()
        .unwrap();
    assert_eq!(before["n"], json!(1));
    let after = coll.find_one(doc(json!({}))).unwrap().unwrap();
    assert_eq!(after["n"], json!(2));
}

#[test]
fn find_one_and_delete_removes_row() {
    let (_conn, coll) = seeded("items", json!([{"n": 1}, {"n": 2}]));
    let removed = coll
        .find_one_and_delete(doc(json!({"n": 1})))
        .unwrap()
        .unwrap();
    assert_eq!(removed["n"], json!(1));
    assert_eq!(coll.estimated_document_count().unwrap(), 1);
}

#[test]
fn delete_one_and_many() {
    let (_conn, coll) = seeded(
        "items",
        json!([{"cat": "a"}, {"cat": "a"}, {"cat": "b"}]),
    );
    assert_eq!(
        coll.delete_one(doc(json!({"cat": "a"}))).unwrap().deleted_count,
        1
    );
    assert_eq!(
        coll.delete_many(doc(json!({"cat": "a"}))).unwrap().deleted_count,
        1
    );
    assert_eq!(coll.estimated_document_count().unwrap(), 1);
}
