use crate::aggregation::expr::{EvalContext, REMOVE, eval_expr, parse_expr};
use crate::document::{Document, get_path, remove_path, set_path};
use serde_json::Value;

pub fn execute(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    let mut has_inclusion = false;
    let mut has_exclusion = false;
    let mut id_spec = None;

    for (key, value) in spec {
        if key == "_id" {
            id_spec = Some(value);
            continue;
        }
        match value {
            Value::Number(n) if n.as_i64() == Some(0) => has_exclusion = true,
            Value::Bool(false) => has_exclusion = true,
            _ => has_inclusion = true,
        }
    }

    if has_inclusion && has_exclusion {
        anyhow::bail!("cannot mix inclusion and exclusion in $project (except _id)");
    }
    let exclusion_mode = has_exclusion && !has_inclusion;
    let id_excluded =
        id_spec.is_some_and(|v| v.as_i64() == Some(0) || v == &Value::Bool(false));

    let mut result = Vec::new();
    for doc in docs {
        let mut projected = if exclusion_mode {
            let mut kept = doc.clone();
            for (key, value) in spec {
                if key == "_id" {
                    continue;
                }
                let excluded = value.as_i64() == Some(0) || value == &Value::Bool(false);
                if !excluded {
                    anyhow::bail!("cannot use computed fields in exclusion mode");
                }
                remove_path(&mut kept, key);
            }
            kept
        } else {
            let ctx = EvalContext::new(doc.clone());
            let mut projected = Document::new();
            for (key, value) in spec {
                if key == "_id" {
                    continue;
                }
                let included = value.as_i64() == Some(1) || value == &Value::Bool(true);
                if included {
                    if let Some(field_val) = get_path(&doc, key).cloned() {
                        set_path(&mut projected, key, field_val);
                    }
                } else {
                    let expr = parse_expr(value)?;
                    let evaluated = eval_expr(&expr, &ctx)?;
                    if evaluated.as_str() != Some(REMOVE) {
                        set_path(&mut projected, key, evaluated);
                    }
                }
            }
            if let Some(id) = doc.get("_id") {
                projected.insert("_id".to_string(), id.clone());
            }
            projected
        };

        if id_excluded {
            projected.remove("_id");
        }
        result.push(projected);
    }

    Ok(result)
}
