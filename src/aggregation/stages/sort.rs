use crate::aggregation::values::json_cmp;
use crate::document::Document;
use crate::matcher::resolve_path;
use crate::translate::parse_sort_spec;
use serde_json::Value;
use std::cmp::Ordering;

pub fn execute(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    let sort_specs = parse_sort_spec(spec).map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut result = docs;
    result.sort_by(|a, b| {
        for (field, direction) in &sort_specs {
            let a_val = resolve_path(a, field).unwrap_or(&Value::Null);
            let b_val = resolve_path(b, field).unwrap_or(&Value::Null);
            let cmp = json_cmp(a_val, b_val);
            if cmp != Ordering::Equal {
                return if *direction >= 0 { cmp } else { cmp.reverse() };
            }
        }
        Ordering::Equal
    });
    Ok(result)
}
