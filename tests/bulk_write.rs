mod common;

use common::{doc, seeded};
use oxidelite::{Error, WriteModel};
use serde_json::json;

#[test]
fn mixed_bulk_reports_counts() {
    let (_conn, coll) = seeded(
        "items",
        json!([{"k": "a", "n": 1}, {"k": "b", "n": 2}, {"k": "c", "n": 3}]),
    );
    let result = coll
        .bulk_write(
            vec![
                WriteModel::InsertOne {
                    document: doc(json!({"k": "d", "n": 4})),
                },
                WriteModel::UpdateOne {
                    filter: doc(json!({"k": "a"})),
                    update: doc(json!({"$inc": {"n": 10}})),
                    upsert: false,
                },
                WriteModel::UpdateMany {
                    filter: doc(json!({"n": {"$gte": 2}})),
                    update: doc(json!({"$set": {"seen": true}})),
                    upsert: false,
                },
                WriteModel::DeleteOne {
                    filter: doc(json!({"k": "b"})),
                },
                WriteModel::UpdateOne {
                    filter: doc(json!({"k": "zz"})),
                    update: doc(json!({"$set": {"n": 0}})),
                    upsert: true,
                },
            ],
            true,
        )
        .unwrap();

    assert_eq!(result.inserted_count, 1);
    assert_eq!(result.matched_count, 4);
    assert!(result.modified_count >= 3);
    assert_eq!(result.deleted_count, 1);
    assert_eq!(result.upserted_count, 1);
    assert_eq!(result.upserted_ids.len(), 1);
    assert_eq!(*result.upserted_ids.keys().next().unwrap(), 4usize);

    assert_eq!(coll.estimated_document_count().unwrap(), 4);
    let a = coll.find_one(doc(json!({"k": "a"}))).unwrap().unwrap();
    assert_eq!(a["n"], json!(11));
}

#[test]
fn first_failure_rolls_back_everything() {
    let (_conn, coll) = seeded("items", json!([{"k": "a"}]));
    let err = coll
        .bulk_write(
            vec![
                WriteModel::InsertOne {
                    document: doc(json!({"k": "b"})),
                },
                WriteModel::UpdateOne {
                    filter: doc(json!({"k": "a"})),
                    update: doc(json!({"$inc": {"n": "not a number"}})),
                    upsert: false,
                },
                WriteModel::InsertOne {
                    document: doc(json!({"k": "c"})),
                },
            ],
            true,
        )
        .unwrap_err();
    assert!(matches!(err, Error::MalformedQuery(_)));

    // Partial effects are not visible.
    assert_eq!(coll.estimated_document_count().unwrap(), 1);
    assert!(coll.find_one(doc(json!({"k": "b"}))).unwrap().is_none());
}

#[test]
fn unordered_shares_transactional_contract() {
    let (_conn, coll) = seeded("items", json!([]));
    let err = coll
        .bulk_write(
            vec![
                WriteModel::InsertOne {
                    document: doc(json!({"_id": "dup"})),
                },
                WriteModel::InsertOne {
                    document: doc(json!({"_id": "dup"})),
                },
            ],
            false,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
    assert_eq!(coll.estimated_document_count().unwrap(), 0);
}

#[test]
fn replace_one_in_bulk() {
    let (_conn, coll) = seeded("items", json!([{"k": "a", "v": 1}]));
    let result = coll
        .bulk_write(
            vec![WriteModel::ReplaceOne {
                filter: doc(json!({"k": "a"})),
                replacement: doc(json!({"k": "a", "v": 2})),
                upsert: false,
            }],
            true,
        )
        .unwrap();
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);
    let d = coll.find_one(doc(json!({"k": "a"}))).unwrap().unwrap();
    assert_eq!(d["v"], json!(2));
}
