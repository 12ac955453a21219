mod common;

use common::{doc, seeded};
use oxidelite::binary::Binary;
use oxidelite::{Connection, ObjectId};
use serde_json::json;

#[test]
fn integer_id_round_trip() {
    let (_conn, coll) = seeded("items", json!([{"name": "a"}]));
    let d = coll.find_one(doc(json!({"name": "a"}))).unwrap().unwrap();
    let id = d["_id"].as_i64().unwrap();

    let by_id = coll.find_one(doc(json!({"_id": id}))).unwrap().unwrap();
    assert_eq!(by_id["name"], json!("a"));
    // The bare `id` key is auto-corrected to the identifier.
    let by_bare = coll.find_one(doc(json!({"id": id}))).unwrap().unwrap();
    assert_eq!(by_bare["name"], json!("a"));
}

#[test]
fn objectid_round_trip_in_every_representation() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("items").unwrap();
    let oid = ObjectId::new();
    let mut d = oxidelite::Document::new();
    d.insert("_id".to_string(), oid.to_value());
    d.insert("name".to_string(), json!("tagged"));
    let inserted = coll.insert_one(d).unwrap();
    assert_eq!(inserted.inserted_id, oid.to_value());

    // Tagged form.
    let by_value = coll
        .find_one(doc(json!({"_id": oid.to_value()})))
        .unwrap()
        .unwrap();
    assert_eq!(by_value["name"], json!("tagged"));

    // Hex-24 string form.
    let by_hex = coll
        .find_one(doc(json!({"_id": oid.to_hex()})))
        .unwrap()
        .unwrap();
    assert_eq!(by_hex["name"], json!("tagged"));

    // Stored representation survives unchanged.
    assert_eq!(by_hex["_id"], oid.to_value());
}

#[test]
fn hex_string_insert_normalises_to_tagged_form() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("items").unwrap();
    let hex = ObjectId::new().to_hex();
    coll.insert_one(doc(json!({"_id": hex, "k": 1}))).unwrap();

    let found = coll.find_one(doc(json!({"_id": hex}))).unwrap().unwrap();
    assert_eq!(found["k"], json!(1));
    assert!(oxidelite::objectid::is_objectid_value(&found["_id"]));
}

#[test]
fn duplicate_explicit_id_is_integrity_error() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("items").unwrap();
    coll.insert_one(doc(json!({"_id": "custom", "v": 1}))).unwrap();
    let err = coll
        .insert_one(doc(json!({"_id": "custom", "v": 2})))
        .unwrap_err();
    assert!(matches!(err, oxidelite::Error::Integrity(_)));
    assert_eq!(coll.estimated_document_count().unwrap(), 1);
}

#[test]
fn objectid_timestamp_prefix() {
    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let oid = ObjectId::new();
    assert!((oid.timestamp() - before).abs() <= 2);
}

#[test]
fn binary_round_trips_through_storage() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("blobs").unwrap();
    let bin = Binary::with_subtype(vec![0u8, 1, 2, 3, 255], 128);
    coll.insert_one(doc(json!({"name": "b", "payload": bin.to_value()})))
        .unwrap();

    let found = coll.find_one(doc(json!({"name": "b"}))).unwrap().unwrap();
    let loaded = Binary::from_value(&found["payload"]).unwrap();
    assert_eq!(loaded, bin);
    assert_eq!(loaded.subtype(), 128);
}

#[test]
fn binary_equality_filter() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("blobs").unwrap();
    let bin = Binary::new(vec![9u8, 9, 9]);
    coll.insert_one(doc(json!({"payload": bin.to_value()}))).unwrap();
    coll.insert_one(doc(json!({"payload": Binary::new(vec![1u8]).to_value()})))
        .unwrap();

    // Object equality has no SQL shape; the fallback tier answers it.
    let res = coll
        .find(doc(json!({"payload": bin.to_value()})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
}
