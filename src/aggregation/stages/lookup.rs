use crate::aggregation::pipeline::LookupSpec;
use crate::aggregation::values::values_equal;
use crate::document::{Document, get_path, set_path};
use serde_json::Value;

/// Left-outer join against an already-fetched foreign collection. A
/// missing or null local value joins nothing, so the `as` field becomes
/// the empty array.
pub fn execute(
    docs: Vec<Document>,
    foreign_docs: &[Document],
    spec: &LookupSpec,
) -> anyhow::Result<Vec<Document>> {
    let mut result = Vec::new();
    for doc in docs {
        let local = get_path(&doc, &spec.local_field);
        let matches: Vec<Value> = match local {
            Some(local) if !local.is_null() => foreign_docs
                .iter()
                .filter(|f| {
                    get_path(f, &spec.foreign_field)
                        .is_some_and(|fv| values_equal(fv, local))
                })
                .map(|f| Value::Object(f.clone()))
                .collect(),
            _ => Vec::new(),
        };
        let mut joined = doc;
        set_path(&mut joined, &spec.as_field, Value::Array(matches));
        result.push(joined);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(v: serde_json::Value) -> Vec<Document> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn unmatched_local_gets_empty_array() {
        let orders = docs(json!([{"item": "a"}, {"item": "zz"}, {"other": 1}]));
        let products = docs(json!([{"sku": "a", "price": 10}]));
        let spec = LookupSpec {
            from: "products".into(),
            local_field: "item".into(),
            foreign_field: "sku".into(),
            as_field: "product".into(),
        };
        let out = execute(orders, &products, &spec).unwrap();
        assert_eq!(
            out[0].get("product"),
            Some(&json!([{"sku": "a", "price": 10}]))
        );
        assert_eq!(out[1].get("product"), Some(&json!([])));
        assert_eq!(out[2].get("product"), Some(&json!([])));
    }
}
