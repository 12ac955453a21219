#![allow(dead_code)]

use oxidelite::{Collection, Connection, Document};
use serde_json::Value;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Honour `RUST_LOG` in test runs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn doc(v: Value) -> Document {
    v.as_object().expect("object literal").clone()
}

pub fn docs(v: Value) -> Vec<Document> {
    v.as_array()
        .expect("array literal")
        .iter()
        .map(|d| d.as_object().expect("object literal").clone())
        .collect()
}

pub fn seeded(name: &str, rows: Value) -> (Connection, Collection) {
    init_tracing();
    let conn = Connection::open_in_memory().expect("open");
    let coll = conn.collection(name).expect("collection");
    coll.insert_many(docs(rows)).expect("seed");
    (conn, coll)
}

/// Strip `_id` so result comparisons ignore row identity.
pub fn without_ids(mut docs: Vec<Document>) -> Vec<Document> {
    for d in &mut docs {
        d.remove("_id");
    }
    docs
}

/// Compare two result sets as multisets.
pub fn assert_same_multiset(mut a: Vec<Document>, mut b: Vec<Document>) {
    let key = |d: &Document| serde_json::to_string(&Value::Object(d.clone())).expect("serialise");
    a.sort_by_key(&key);
    b.sort_by_key(&key);
    assert_eq!(a, b);
}
