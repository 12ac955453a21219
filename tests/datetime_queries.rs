mod common;

use common::{assert_same_multiset, doc, docs};
use oxidelite::Connection;
use serde_json::json;

fn seed() -> (Connection, oxidelite::Collection) {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("events").unwrap();
    coll.insert_many(docs(json!([
        {"name": "early", "ts": "2023-01-15T08:30:00"},
        {"name": "late", "ts": "2023-01-15T18:20:15"},
        {"name": "next_month", "ts": "2023-02-20T14:45:30"}
    ])))
    .unwrap();
    (conn, coll)
}

#[test]
fn datetime_range_query() {
    let (_conn, coll) = seed();
    let res = coll
        .find(doc(json!({"ts": {
            "$gte": "2023-01-15T00:00:00",
            "$lt": "2023-01-16T00:00:00"
        }})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 2);
    assert!(res.iter().all(|d| d["name"] != json!("next_month")));
}

#[test]
fn datetime_range_parity_with_fallback() {
    let (mut conn, coll) = seed();
    let filter = json!({"ts": {
        "$gte": "2023-01-15T00:00:00",
        "$lt": "2023-01-16T00:00:00"
    }});
    let sql_result = coll.find(doc(filter.clone())).to_list().unwrap();

    conn.set_force_fallback(true);
    let coll = conn.collection("events").unwrap();
    let fallback_result = coll.find(doc(filter)).to_list().unwrap();
    assert_eq!(sql_result.len(), 2);
    assert_same_multiset(sql_result, fallback_result);
}

#[test]
fn complex_datetime_predicate_uses_temp_table_tier() {
    let (_conn, coll) = seed();
    let res = coll
        .find(doc(json!({"$or": [
            {"ts": {"$lt": "2023-01-15T12:00:00"}},
            {"name": "next_month"}
        ]})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 2);
}

#[test]
fn non_canonical_stored_forms_match_across_tiers() {
    let mut conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("events").unwrap();
    // Stored values in non-canonical shapes: space-separated and
    // date-only alongside the canonical form.
    coll.insert_many(docs(json!([
        {"name": "space", "ts": "2023-01-15 08:30:00"},
        {"name": "date_only", "ts": "2023-01-15"},
        {"name": "canonical", "ts": "2023-01-15T18:20:15"},
        {"name": "outside", "ts": "2023-02-20 14:45:30"}
    ])))
    .unwrap();

    let sql_coll = conn.collection("events").unwrap();
    conn.set_force_fallback(true);
    let fallback_coll = conn.collection("events").unwrap();

    let cases = [
        (
            json!({"ts": {"$gte": "2023-01-15T00:00:00", "$lt": "2023-01-16T00:00:00"}}),
            3,
        ),
        (json!({"ts": "2023-01-15T08:30:00"}), 1),
        (json!({"ts": {"$gte": "2023-01-15"}}), 4),
        (
            json!({"$or": [
                {"ts": {"$lt": "2023-01-15T12:00:00"}},
                {"name": "outside"}
            ]}),
            3,
        ),
    ];

    for (filter, expected) in cases {
        let sql_result = sql_coll.find(doc(filter.clone())).to_list().unwrap();
        let fallback_result = fallback_coll.find(doc(filter.clone())).to_list().unwrap();
        assert_eq!(sql_result.len(), expected, "filter {filter}");
        assert_same_multiset(sql_result, fallback_result);
    }
}

#[test]
fn us_format_dates_normalise() {
    let conn = Connection::open_in_memory().unwrap();
    let coll = conn.collection("events").unwrap();
    coll.insert_many(docs(json!([
        {"d": "2023-03-01T00:00:00"},
        {"d": "2023-06-15T00:00:00"}
    ])))
    .unwrap();
    let res = coll
        .find(doc(json!({"d": {"$gt": "03/15/2023"}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["d"], json!("2023-06-15T00:00:00"));
}

#[test]
fn date_only_strings_compare() {
    let (_conn, coll) = seed();
    let res = coll
        .find(doc(json!({"ts": {"$gte": "2023-02-01"}})))
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["name"], json!("next_month"));
}

#[test]
fn date_expression_operators() {
    let (_conn, coll) = seed();
    let res = coll
        .aggregate(vec![
            json!({"$addFields": {
                "year": {"$year": "$ts"},
                "month": {"$month": "$ts"},
                "day_label": {"$dateToString": {"date": "$ts", "format": "%Y-%m-%d"}}
            }}),
            json!({"$match": {"month": 1}}),
        ])
        .to_list()
        .unwrap();
    assert_eq!(res.len(), 2);
    assert_eq!(res[0]["year"], json!(2023));
    assert_eq!(res[0]["day_label"], json!("2023-01-15"));
}
