use crate::aggregation::pipeline::UnwindSpec;
use crate::document::{Document, get_path, set_path};
use serde_json::Value;

pub fn execute(docs: Vec<Document>, spec: &UnwindSpec) -> anyhow::Result<Vec<Document>> {
    let mut result = Vec::new();

    for doc in docs {
        match get_path(&doc, &spec.path).cloned() {
            // A missing field always excludes the document, preserve or not.
            None => {}
            Some(Value::Null) => {
                if spec.preserve_null_and_empty_arrays {
                    result.push(preserved_row(&doc, spec));
                }
            }
            Some(Value::Array(items)) if items.is_empty() => {
                if spec.preserve_null_and_empty_arrays {
                    result.push(preserved_row(&doc, spec));
                }
            }
            Some(Value::Array(items)) => {
                for (idx, item) in items.into_iter().enumerate() {
                    let mut row = doc.clone();
                    set_path(&mut row, &spec.path, item);
                    if let Some(index_field) = &spec.include_array_index {
                        set_path(&mut row, index_field, Value::from(idx as i64));
                    }
                    result.push(row);
                }
            }
            // Scalars pass through as a single element.
            Some(_) => {
                let mut row = doc.clone();
                if let Some(index_field) = &spec.include_array_index {
                    set_path(&mut row, index_field, Value::Null);
                }
                result.push(row);
            }
        }
    }

    Ok(result)
}

fn preserved_row(doc: &Document, spec: &UnwindSpec) -> Document {
    let mut row = doc.clone();
    set_path(&mut row, &spec.path, Value::Null);
    if let Some(index_field) = &spec.include_array_index {
        set_path(&mut row, index_field, Value::Null);
    }
    row
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
    fn missing_field_always_excluded() {
        let spec = UnwindSpec {
            path: "s".into(),
            include_array_index: Some("i".into()),
            preserve_null_and_empty_arrays: true,
        };
        let input = docs(json!([
            {"n": "A", "s": [85, 90]},
            {"n": "B", "s": []},
            {"n": "C", "s": null},
            {"n": "D"}
        ]));
        let out = execute(input, &spec).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].get("i"), Some(&json!(0)));
        assert_eq!(out[1].get("i"), Some(&json!(1)));
        assert_eq!(out[2].get("n"), Some(&json!("B")));
        assert_eq!(out[2].get("i"), Some(&json!(null)));
        assert_eq!(out[3].get("n"), Some(&json!("C")));
        assert!(!out.iter().any(|d| d.get("n") == Some(&json!("D"))));
    }

    #[test]
    fn plain_unwind_drops_null_and_empty() {
        let spec = UnwindSpec {
            path: "s".into(),
            include_array_index: None,
            preserve_null_and_empty_arrays: false,
        };
        let input = docs(json!([
            {"n": "A", "s": [1]},
            {"n": "B", "s": []},
            {"n": "C", "s": null},
            {"n": "D"}
        ]));
        let out = execute(input, &spec).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("s"), Some(&json!(1)));
    }
}
