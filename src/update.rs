//! Update operator handling: translation of `$set`-family operators into
//! a single `json_set`/`json_remove` fragment for `UPDATE ... SET data =
//! <fragment>`, and the host-side applier covering the array operators
//! and `$rename`, which have no single-statement SQL shape.

use crate::aggregation::values::{Numeric, coerce_numeric, json_cmp, values_equal};
use crate::document::{Document, get_path, remove_path, set_path};
use crate::error::{Error, Result};
use crate::matcher::value_matches_condition;
use crate::translate::{SqlParams, escape_sql, json_path};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::cmp::Ordering;

/// Builds the `SET data = ...` expression for translatable updates.
pub struct UpdateTranslator {
    jsonb: bool,
}

impl UpdateTranslator {
    pub fn new(jsonb: bool) -> Self {
        Self { jsonb }
    }

    fn set_fn(&self) -> &'static str {
        if self.jsonb { "jsonb_set" } else { "json_set" }
    }

    fn remove_fn(&self) -> &'static str {
        if self.jsonb { "jsonb_remove" } else { "json_remove" }
    }

    /// Translate an update document into a column expression and its
    /// parameters, or `None` when any operator needs the host applier.
    pub fn build(&self, update: &Document) -> Result<Option<(String, SqlParams)>> {
        validate_update(update)?;
        let mut expr = "data".to_string();
        let mut params: SqlParams = Vec::new();

        for (op, arg) in update {
            let fields = arg.as_object().ok_or_else(|| {
                Error::MalformedQuery(format!("{op} requires a document of field updates"))
            })?;
            // Array-index paths have no quoted JSON path form; the host
            // applier handles them.
            if fields
                .keys()
                .any(|field| field.contains('[') || crate::translate::path_has_numeric_segment(field))
            {
                return Ok(None);
            }
            match op.as_str() {
                "$set" => {
                    for (field, value) in fields {
                        let path = escape_sql(&json_path(field));
                        match value_param(value) {
                            ValueParam::Scalar(p) => {
                                expr = format!("{}({expr}, '{path}', ?)", self.set_fn());
                                params.push(p);
                            }
                            ValueParam::Json(text) => {
                                expr = format!("{}({expr}, '{path}', json(?))", self.set_fn());
                                params.push(SqlValue::Text(text));
                            }
                        }
                    }
                }
                "$unset" => {
                    let paths: Vec<String> = fields
                        .keys()
                        .map(|field| format!("'{}'", escape_sql(&json_path(field))))
                        .collect();
                    expr = format!("{}({expr}, {})", self.remove_fn(), paths.join(", "));
                }
                "$inc" | "$mul" => {
                    let (sql_op, identity) = if op == "$inc" { ("+", 0) } else { ("*", 0) };
                    for (field, value) in fields {
                        let path = escape_sql(&json_path(field));
                        expr = format!(
                            "{}({expr}, '{path}', coalesce(json_extract(data, '{path}'), {identity}) {sql_op} ?)",
                            self.set_fn()
                        );
                        params.push(numeric_param(value));
                    }
                }
                "$min" | "$max" => {
                    let func = if op == "$min" { "min" } else { "max" };
                    for (field, value) in fields {
                        let path = escape_sql(&json_path(field));
                        let p = match value_param(value) {
                            ValueParam::Scalar(p) => p,
                            ValueParam::Json(_) => return Ok(None),
                        };
                        expr = format!(
                            "{}({expr}, '{path}', {func}(coalesce(json_extract(data, '{path}'), ?), ?))",
                            self.set_fn()
                        );
                        params.push(p.clone());
                        params.push(p);
                    }
                }
                "$rename" | "$push" | "$addToSet" | "$pop" | "$pull" | "$pullAll"
                | "$setOnInsert" => return Ok(None),
                other => {
                    return Err(Error::MalformedQuery(format!(
                        "unknown update operator: {other}"
                    )));
                }
            }
        }

        if expr == "data" {
            return Err(Error::MalformedQuery("empty update document".into()));
        }
        Ok(Some((expr, params)))
    }
}

enum ValueParam {
    Scalar(SqlValue),
    Json(String),
}

fn value_param(value: &Value) -> ValueParam {
    match value {
        Value::Null => ValueParam::Scalar(SqlValue::Null),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ValueParam::Scalar(SqlValue::Integer(i))
            } else {
                ValueParam::Scalar(SqlValue::Real(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => ValueParam::Scalar(SqlValue::Text(s.clone())),
        // Booleans, arrays, and objects go through json() so the stored
        // value keeps its JSON type.
        other => ValueParam::Json(other.to_string()),
    }
}

fn numeric_param(value: &Value) -> SqlValue {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        _ => SqlValue::Null,
    }
}

/// Reject malformed operator arguments up front, before any translation
/// or host application.
pub fn validate_update(update: &Document) -> Result<()> {
    if update.is_empty() {
        return Err(Error::MalformedQuery("empty update document".into()));
    }
    for (op, arg) in update {
        if !op.starts_with('$') {
            return Err(Error::MalformedQuery(format!(
                "update field {op:?} must be an operator"
            )));
        }
        let fields = arg.as_object().ok_or_else(|| {
            Error::MalformedQuery(format!("{op} requires a document of field updates"))
        })?;
        if op == "$inc" || op == "$mul" {
            for (field, value) in fields {
                let valid = matches!(value, Value::Number(n) if n.as_f64().is_some_and(f64::is_finite));
                if !valid {
                    return Err(Error::MalformedQuery(format!(
                        "{op} requires a numeric argument for field {field:?}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Apply an update document in host code. Handles every operator,
/// including the array operators the SQL translator declines. Returns
/// whether the document changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<bool> {
    apply_update_inner(doc, update, false)
}

/// Variant used when the update materialises a new document (upsert
/// insert); `$setOnInsert` applies only here.
pub fn apply_update_on_insert(doc: &mut Document, update: &Document) -> Result<bool> {
    apply_update_inner(doc, update, true)
}

fn apply_update_inner(doc: &mut Document, update: &Document, on_insert: bool) -> Result<bool> {
    validate_update(update)?;
    let before = doc.clone();

    for (op, arg) in update {
        let fields = arg.as_object().expect("validated");
        match op.as_str() {
            "$set" => {
                for (field, value) in fields {
                    set_path(doc, field, value.clone());
                }
            }
            "$setOnInsert" => {
                if on_insert {
                    for (field, value) in fields {
                        set_path(doc, field, value.clone());
                    }
                }
            }
            "$unset" => {
                for field in fields.keys() {
                    remove_path(doc, field);
                }
            }
            "$inc" | "$mul" => {
                let is_inc = op == "$inc";
                for (field, value) in fields {
                    let arg_num = coerce_numeric(value).expect("validated");
                    let current = get_path(doc, field)
                        .cloned()
                        .unwrap_or(Value::from(0));
                    let Some(cur_num) = coerce_numeric(&current) else {
                        return Err(Error::MalformedQuery(format!(
                            "cannot apply {op} to non-numeric field {field:?}"
                        )));
                    };
                    let result = match (cur_num, arg_num, is_inc) {
                        (Numeric::Int(a), Numeric::Int(b), true) => Value::from(a + b),
                        (Numeric::Int(a), Numeric::Int(b), false) => Value::from(a * b),
                        (a, b, true) => float_value(a.as_f64() + b.as_f64()),
                        (a, b, false) => float_value(a.as_f64() * b.as_f64()),
                    };
                    set_path(doc, field, result);
                }
            }
            "$min" | "$max" => {
                let want = if op == "$min" {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                for (field, value) in fields {
                    match get_path(doc, field) {
                        Some(current) => {
                            if json_cmp(value, current) == want {
                                set_path(doc, field, value.clone());
                            }
                        }
                        None => set_path(doc, field, value.clone()),
                    }
                }
            }
            "$rename" => {
                for (field, target) in fields {
                    let target = target.as_str().ok_or_else(|| {
                        Error::MalformedQuery("$rename target must be a string".into())
                    })?;
                    if let Some(value) = remove_path(doc, field) {
                        set_path(doc, target, value);
                    }
                }
            }
            "$push" => {
                for (field, spec) in fields {
                    let additions = each_values(spec);
                    let slot = array_slot(doc, field, op)?;
                    slot.extend(additions);
                }
            }
            "$addToSet" => {
                for (field, spec) in fields {
                    let additions = each_values(spec);
                    let slot = array_slot(doc, field, op)?;
                    for value in additions {
                        if !slot.iter().any(|existing| values_equal(existing, &value)) {
                            slot.push(value);
                        }
                    }
                }
            }
            "$pop" => {
                for (field, which) in fields {
                    let which = which.as_i64().ok_or_else(|| {
                        Error::MalformedQuery("$pop requires 1 or -1".into())
                    })?;
                    if let Some(Value::Array(mut items)) = get_path(doc, field).cloned() {
                        if !items.is_empty() {
                            if which < 0 {
                                items.remove(0);
                            } else {
                                items.pop();
                            }
                        }
                        set_path(doc, field, Value::Array(items));
                    }
                }
            }
            "$pull" => {
                for (field, cond) in fields {
                    if let Some(Value::Array(items)) = get_path(doc, field).cloned() {
                        let mut kept = Vec::new();
                        for item in items {
                            if !value_matches_condition(&item, cond)? {
                                kept.push(item);
                            }
                        }
                        set_path(doc, field, Value::Array(kept));
                    }
                }
            }
            "$pullAll" => {
                for (field, values) in fields {
                    let targets = values.as_array().ok_or_else(|| {
                        Error::MalformedQuery("$pullAll requires an array".into())
                    })?;
                    if let Some(Value::Array(items)) = get_path(doc, field).cloned() {
                        let kept: Vec<Value> = items
                            .into_iter()
                            .filter(|item| !targets.iter().any(|t| values_equal(item, t)))
                            .collect();
                        set_path(doc, field, Value::Array(kept));
                    }
                }
            }
            other => {
                return Err(Error::MalformedQuery(format!(
                    "unknown update operator: {other}"
                )));
            }
        }
    }

    Ok(*doc != before)
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Values a `$push`/`$addToSet` argument contributes: either the single
/// value, or the `$each` list.
fn each_values(spec: &Value) -> Vec<Value> {
    if let Some(each) = spec
        .as_object()
        .and_then(|o| o.get("$each"))
        .and_then(Value::as_array)
    {
        each.clone()
    } else {
        vec![spec.clone()]
    }
}

fn array_slot<'a>(doc: &'a mut Document, field: &str, op: &str) -> Result<&'a mut Vec<Value>> {
    if get_path(doc, field).is_none() {
        set_path(doc, field, Value::Array(Vec::new()));
    }
    match get_path_mut(doc, field) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(Error::MalformedQuery(format!(
            "{op} requires an array field: {field:?}"
        ))),
    }
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc.get_mut(parts[0])?;
    for part in &parts[1..] {
        current = current.as_object_mut()?.get_mut(*part)?;
    }
    Some(current)
}

/// Seed an upserted document from the equality predicates of a filter.
pub fn seed_from_filter(filter: &Document) -> Document {
    let mut doc = Document::new();
    for (field, value) in filter {
        if field.starts_with('$') || field.contains('.') {
            continue;
        }
        match value {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                if let Some(eq) = ops.get("$eq") {
                    doc.insert(field.clone(), eq.clone());
                }
            }
            other => {
                doc.insert(field.clone(), other.clone());
            }
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn set_and_unset_fragment() {
        let tr = UpdateTranslator::new(false);
        let (sql, params) = tr
            .build(&doc(json!({"$set": {"a": 1, "b.c": "x"}})))
            .unwrap()
            .unwrap();
        assert!(sql.starts_with("json_set(json_set(data"));
        assert_eq!(params.len(), 2);

        let (sql, _) = tr
            .build(&doc(json!({"$unset": {"a": ""}})))
            .unwrap()
            .unwrap();
        assert!(sql.contains("json_remove"));
    }

    #[test]
    fn inc_uses_coalesce() {
        let tr = UpdateTranslator::new(false);
        let (sql, params) = tr
            .build(&doc(json!({"$inc": {"n": 2}})))
            .unwrap()
            .unwrap();
        assert!(sql.contains("coalesce(json_extract(data"));
        assert!(sql.contains("+ ?"));
        assert_eq!(params, vec![SqlValue::Integer(2)]);
    }

    #[test]
    fn jsonb_switches_function_family() {
        let tr = UpdateTranslator::new(true);
        let (sql, _) = tr
            .build(&doc(json!({"$set": {"a": 1}})))
            .unwrap()
            .unwrap();
        assert!(sql.starts_with("jsonb_set("));
    }

    #[test]
    fn array_operators_are_unsupported_in_sql() {
        let tr = UpdateTranslator::new(false);
        assert!(tr.build(&doc(json!({"$push": {"xs": 1}}))).unwrap().is_none());
        assert!(tr
            .build(&doc(json!({"$rename": {"a": "b"}})))
            .unwrap()
            .is_none());
    }

    #[test]
    fn inc_rejects_non_numeric() {
        for bad in [json!("x"), json!(true), json!([1]), json!({"a": 1}), json!(null)] {
            let update = doc(json!({"$inc": {"n": bad}}));
            assert!(validate_update(&update).is_err());
        }
    }

    #[test]
    fn host_applier_set_inc_rename() {
        let mut d = doc(json!({"a": 1, "old": "v"}));
        let changed = apply_update(
            &mut d,
            &doc(json!({"$set": {"b": 2}, "$inc": {"a": 3}, "$rename": {"old": "new"}})),
        )
        .unwrap();
        assert!(changed);
        assert_eq!(d.get("a"), Some(&json!(4)));
        assert_eq!(d.get("b"), Some(&json!(2)));
        assert_eq!(d.get("new"), Some(&json!("v")));
        assert!(!d.contains_key("old"));
    }

    #[test]
    fn identity_set_reports_unchanged() {
        let mut d = doc(json!({"a": 1}));
        let changed = apply_update(&mut d, &doc(json!({"$set": {"a": 1}}))).unwrap();
        assert!(!changed);
    }

    #[test]
    fn push_add_to_set_pull() {
        let mut d = doc(json!({"xs": [1, 2]}));
        apply_update(&mut d, &doc(json!({"$push": {"xs": 3}}))).unwrap();
        assert_eq!(d.get("xs"), Some(&json!([1, 2, 3])));

        apply_update(&mut d, &doc(json!({"$addToSet": {"xs": {"$each": [2, 4]}}}))).unwrap();
        assert_eq!(d.get("xs"), Some(&json!([1, 2, 3, 4])));

        apply_update(&mut d, &doc(json!({"$pull": {"xs": {"$gte": 3}}}))).unwrap();
        assert_eq!(d.get("xs"), Some(&json!([1, 2])));

        apply_update(&mut d, &doc(json!({"$pop": {"xs": -1}}))).unwrap();
        assert_eq!(d.get("xs"), Some(&json!([2])));
    }

    #[test]
    fn min_max_handle_missing_field() {
        let mut d = doc(json!({}));
        apply_update(&mut d, &doc(json!({"$min": {"lo": 5}}))).unwrap();
        apply_update(&mut d, &doc(json!({"$max": {"lo": 3}}))).unwrap();
        assert_eq!(d.get("lo"), Some(&json!(5)));
        apply_update(&mut d, &doc(json!({"$max": {"lo": 9}}))).unwrap();
        assert_eq!(d.get("lo"), Some(&json!(9)));
    }
}
