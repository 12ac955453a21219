//! Host-code query predicate evaluation, the fallback tier's counterpart
//! to the SQL clause builder. Semantics mirror the SQL shapes so every
//! tier agrees on the matched set: an explicit JSON null behaves like a
//! missing field, comparisons use storage-engine ordering, and scalar
//! equality never matches inside arrays.

use crate::aggregation::values::{coerce_numeric, json_cmp, values_equal};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::objectid::id_values_equal;
use crate::objectid::normalize_id_value;
use serde_json::Value;
use std::cmp::Ordering;

pub struct Matcher<'a> {
    /// Fields backed by text indexes; `$text` scans these. When empty,
    /// `$text` scans every string value in the document.
    text_fields: &'a [String],
}

impl<'a> Matcher<'a> {
    pub fn new(text_fields: &'a [String]) -> Self {
        Self { text_fields }
    }

    pub fn matches(&self, doc: &Document, query: &Document) -> Result<bool> {
        for (key, value) in query {
            let ok = match key.as_str() {
                "$and" => self.all(doc, value)?,
                "$or" => self.any(doc, value)?,
                "$nor" => !self.any(doc, value)?,
                "$not" => {
                    let sub = value
                        .as_object()
                        .ok_or_else(|| Error::MalformedQuery("$not requires a document".into()))?;
                    !self.matches(doc, sub)?
                }
                "$expr" => {
                    let expr = crate::aggregation::expr::parse_expr(value)
                        .map_err(|e| Error::MalformedQuery(e.to_string()))?;
                    let ctx = crate::aggregation::expr::EvalContext::new(doc.clone());
                    let v = crate::aggregation::expr::eval_expr(&expr, &ctx)
                        .map_err(|e| Error::MalformedQuery(e.to_string()))?;
                    crate::aggregation::expr::is_truthy(&v)
                }
                "$text" => self.text_matches(doc, value)?,
                "$where" => {
                    return Err(Error::MalformedQuery("$where is not supported".into()));
                }
                k if k.starts_with('$') => {
                    return Err(Error::MalformedQuery(format!("unknown operator: {k}")));
                }
                field => self.field_matches(doc, field, value)?,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn all(&self, doc: &Document, value: &Value) -> Result<bool> {
        for sub in logical_operands(value)? {
            if !self.matches(doc, sub)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn any(&self, doc: &Document, value: &Value) -> Result<bool> {
        for sub in logical_operands(value)? {
            if self.matches(doc, sub)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn text_matches(&self, doc: &Document, value: &Value) -> Result<bool> {
        let search = value
            .as_object()
            .and_then(|o| o.get("$search"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedQuery("$text requires {$search: <string>}".into()))?;
        let needle = search.to_lowercase();
        if self.text_fields.is_empty() {
            return Ok(any_string_contains(&Value::Object(doc.clone()), &needle));
        }
        for field in self.text_fields {
            if let Some(Value::String(s)) = resolve_path(doc, field) {
                if s.to_lowercase().contains(&needle) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn field_matches(&self, doc: &Document, field: &str, value: &Value) -> Result<bool> {
        let actual = if field == "id" {
            doc.get("_id")
        } else {
            resolve_path(doc, field)
        };
        if field == "_id" || field == "id" {
            if let Some(ok) = self.id_matches(doc, value)? {
                return Ok(ok);
            }
        }
        match value {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                for (op, arg) in ops {
                    if op == "$options" {
                        continue;
                    }
                    if !self.operator_matches(actual, op, arg, ops)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Ok(equality_matches(actual, value)),
        }
    }

    /// Identifier auto-correction mirroring the clause builder: integers
    /// compare against the row id, hex-24 strings and tagged ObjectIds
    /// against either representation. Returns `None` for shapes that
    /// take the generic path.
    fn id_matches(&self, doc: &Document, value: &Value) -> Result<Option<bool>> {
        let stored = doc.get("_id");
        match value {
            Value::Number(_) | Value::String(_) | Value::Object(_)
                if !value
                    .as_object()
                    .is_some_and(|o| o.keys().any(|k| k.starts_with('$'))) =>
            {
                let target = normalize_id_value(value);
                Ok(Some(
                    stored.is_some_and(|s| id_values_equal(&normalize_id_value(s), &target)),
                ))
            }
            Value::Object(ops) => {
                if let Some(arg) = ops.get("$eq") {
                    if ops.len() == 1 {
                        return self.id_matches(doc, arg);
                    }
                }
                if let Some(Value::Array(items)) = ops.get("$in") {
                    if ops.len() == 1 {
                        for item in items {
                            if self.id_matches(doc, item)? == Some(true) {
                                return Ok(Some(true));
                            }
                        }
                        return Ok(Some(false));
                    }
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn operator_matches(
        &self,
        actual: Option<&Value>,
        op: &str,
        arg: &Value,
        ops: &Document,
    ) -> Result<bool> {
        match op {
            "$eq" => Ok(equality_matches(actual, arg)),
            "$ne" => match arg {
                Value::Null => Ok(present(actual)),
                _ => Ok(present(actual) && !values_equal(actual.expect("present"), arg)),
            },
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let Some(v) = actual.filter(|v| !v.is_null()) else {
                    return Ok(false);
                };
                if arg.is_null() {
                    return Ok(false);
                }
                let ord = json_cmp(v, arg);
                Ok(match op {
                    "$gt" => ord == Ordering::Greater,
                    "$gte" => ord != Ordering::Less,
                    "$lt" => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                })
            }
            "$in" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| Error::MalformedQuery("$in requires an array".into()))?;
                Ok(items.iter().any(|item| equality_matches(actual, item)))
            }
            "$nin" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| Error::MalformedQuery("$nin requires an array".into()))?;
                if items.iter().any(Value::is_null) {
                    return Ok(present(actual)
                        && !items.iter().any(|item| equality_matches(actual, item)));
                }
                Ok(present(actual) && !items.iter().any(|item| equality_matches(actual, item)))
            }
            "$exists" => {
                let wanted = arg
                    .as_bool()
                    .ok_or_else(|| Error::MalformedQuery("$exists requires a boolean".into()))?;
                Ok(present(actual) == wanted)
            }
            "$mod" => {
                let pair = arg
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| Error::MalformedQuery("$mod requires [divisor, remainder]".into()))?;
                let divisor = pair[0]
                    .as_i64()
                    .ok_or_else(|| Error::MalformedQuery("$mod divisor must be numeric".into()))?;
                let remainder = pair[1]
                    .as_i64()
                    .ok_or_else(|| Error::MalformedQuery("$mod remainder must be numeric".into()))?;
                if divisor == 0 {
                    return Err(Error::MalformedQuery("$mod divisor must be non-zero".into()));
                }
                let Some(n) = actual.and_then(coerce_numeric) else {
                    return Ok(false);
                };
                Ok((n.as_f64() as i64) % divisor == remainder)
            }
            "$size" => {
                let n = arg
                    .as_i64()
                    .ok_or_else(|| Error::MalformedQuery("$size requires an integer".into()))?;
                Ok(actual
                    .and_then(Value::as_array)
                    .is_some_and(|a| a.len() as i64 == n))
            }
            "$contains" => {
                let needle = match arg.as_str() {
                    Some(s) => s.to_lowercase(),
                    None => return Ok(false),
                };
                Ok(actual
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.to_lowercase().contains(&needle)))
            }
            "$regex" => {
                let pattern = arg
                    .as_str()
                    .ok_or_else(|| Error::MalformedQuery("$regex requires a string".into()))?;
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let pattern = if options.contains('i') {
                    format!("(?i){pattern}")
                } else {
                    pattern.to_string()
                };
                let re = regex::Regex::new(&pattern)
                    .map_err(|e| Error::MalformedQuery(format!("invalid $regex: {e}")))?;
                Ok(actual.and_then(Value::as_str).is_some_and(|s| re.is_match(s)))
            }
            "$all" => {
                let wanted = arg
                    .as_array()
                    .ok_or_else(|| Error::MalformedQuery("$all requires an array".into()))?;
                let Some(elems) = actual.and_then(Value::as_array) else {
                    return Ok(false);
                };
                Ok(wanted
                    .iter()
                    .all(|w| elems.iter().any(|e| values_equal(e, w))))
            }
            "$elemMatch" => {
                let sub = arg
                    .as_object()
                    .ok_or_else(|| Error::MalformedQuery("$elemMatch requires a document".into()))?;
                let Some(elems) = actual.and_then(Value::as_array) else {
                    return Ok(false);
                };
                for elem in elems {
                    if self.elem_matches(elem, sub)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "$not" => {
                let sub = arg
                    .as_object()
                    .ok_or_else(|| Error::MalformedQuery("$not requires a document".into()))?;
                for (inner_op, inner_arg) in sub {
                    if self.operator_matches(actual, inner_op, inner_arg, sub)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            "$type" => Ok(type_matches(actual, arg)?),
            _ => Err(Error::MalformedQuery(format!("unknown operator: {op}"))),
        }
    }

    fn elem_matches(&self, elem: &Value, sub: &Document) -> Result<bool> {
        if sub.keys().all(|k| k.starts_with('$')) {
            for (op, arg) in sub {
                if !self.operator_matches(Some(elem), op, arg, sub)? {
                    return Ok(false);
                }
            }
            Ok(true)
        } else {
            match elem.as_object() {
                Some(obj) => self.matches(obj, sub),
                None => Ok(false),
            }
        }
    }
}

/// Match a single value against a `$pull`-style condition: an operator
/// document, a nested query document, or a plain value.
pub fn value_matches_condition(value: &Value, cond: &Value) -> Result<bool> {
    let matcher = Matcher::new(&[]);
    match cond {
        Value::Object(sub) if sub.keys().any(|k| k.starts_with('$')) => {
            for (op, arg) in sub {
                if op == "$options" {
                    continue;
                }
                if !matcher.operator_matches(Some(value), op, arg, sub)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Value::Object(sub) => match value.as_object() {
            Some(obj) => matcher.matches(obj, sub),
            None => Ok(false),
        },
        _ => Ok(values_equal(value, cond)),
    }
}

fn logical_operands(value: &Value) -> Result<impl Iterator<Item = &Document>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::MalformedQuery("logical operator requires an array".into()))?;
    for item in items {
        if !item.is_object() {
            return Err(Error::MalformedQuery(
                "logical operand must be a document".into(),
            ));
        }
    }
    Ok(items.iter().filter_map(Value::as_object))
}

/// Present means the field resolves to a non-null value; explicit null
/// reads as missing, matching the SQL `IS NULL` shape.
fn present(actual: Option<&Value>) -> bool {
    actual.is_some_and(|v| !v.is_null())
}

fn equality_matches(actual: Option<&Value>, target: &Value) -> bool {
    match target {
        Value::Null => !present(actual),
        _ => actual.is_some_and(|v| values_equal(v, target)),
    }
}

fn type_matches(actual: Option<&Value>, arg: &Value) -> Result<bool> {
    let name = arg
        .as_str()
        .ok_or_else(|| Error::MalformedQuery("$type requires a type name".into()))?;
    let Some(v) = actual else {
        return Ok(false);
    };
    let ok = match name {
        "null" => v.is_null(),
        "bool" => v.is_boolean(),
        "int" | "long" => v.as_i64().is_some(),
        "double" => v.is_f64(),
        "number" => v.is_number(),
        "string" => v.is_string(),
        "array" => v.is_array(),
        "object" => v.is_object() && !crate::objectid::is_objectid_value(v),
        "objectId" => crate::objectid::is_objectid_value(v),
        "binData" => crate::binary::is_binary_value(v),
        "date" => v
            .as_str()
            .is_some_and(crate::datetime::looks_like_datetime),
        other => {
            return Err(Error::MalformedQuery(format!("unknown $type: {other}")));
        }
    };
    Ok(ok)
}

/// Resolve a dotted path, also accepting numeric segments and bracket
/// indexing (`tags.0`, `tags[0]`) into arrays.
pub fn resolve_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let segs = split_path(path);
    let mut iter = segs.iter();
    let mut current = match iter.next()? {
        PathSeg::Key(k) => doc.get(k.as_str())?,
        PathSeg::Index(_) => return None,
    };
    for seg in iter {
        current = match (seg, current) {
            (PathSeg::Key(k), Value::Object(map)) => map.get(k.as_str())?,
            (PathSeg::Index(i), Value::Array(items)) => items.get(*i)?,
            (PathSeg::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

enum PathSeg {
    Key(String),
    Index(usize),
}

fn split_path(path: &str) -> Vec<PathSeg> {
    let mut out = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        while let Some(open) = rest.find('[') {
            if open > 0 {
                out.push(PathSeg::Key(rest[..open].to_string()));
            }
            match rest[open..].find(']') {
                Some(close) => {
                    let idx = &rest[open + 1..open + close];
                    match idx.parse::<usize>() {
                        Ok(i) => out.push(PathSeg::Index(i)),
                        Err(_) => out.push(PathSeg::Key(idx.to_string())),
                    }
                    rest = &rest[open + close + 1..];
                }
                None => {
                    out.push(PathSeg::Key(rest.to_string()));
                    rest = "";
                }
            }
        }
        if !rest.is_empty() {
            out.push(PathSeg::Key(rest.to_string()));
        }
    }
    out
}

fn any_string_contains(v: &Value, needle: &str) -> bool {
    match v {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items.iter().any(|i| any_string_contains(i, needle)),
        Value::Object(map) => map.values().any(|i| any_string_contains(i, needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().unwrap().clone()
    }

    fn m(d: serde_json::Value, q: serde_json::Value) -> bool {
        Matcher::new(&[])
            .matches(&doc(d), q.as_object().unwrap())
            .unwrap()
    }

    #[test]
    fn equality_and_ranges() {
        assert!(m(json!({"a": 5}), json!({"a": 5})));
        assert!(m(json!({"a": 5}), json!({"a": {"$gt": 3, "$lte": 5}})));
        assert!(!m(json!({"a": 5}), json!({"a": {"$gt": 5}})));
    }

    #[test]
    fn null_equality_matches_missing() {
        assert!(m(json!({}), json!({"a": null})));
        assert!(m(json!({"a": null}), json!({"a": null})));
        assert!(!m(json!({"a": 1}), json!({"a": null})));
    }

    #[test]
    fn exists_treats_null_as_missing() {
        assert!(!m(json!({"a": null}), json!({"a": {"$exists": true}})));
        assert!(m(json!({"a": null}), json!({"a": {"$exists": false}})));
        assert!(m(json!({"a": 0}), json!({"a": {"$exists": true}})));
    }

    #[test]
    fn logical_operators() {
        let d = json!({"a": 1, "b": 2});
        assert!(m(d.clone(), json!({"$or": [{"a": 9}, {"b": 2}]})));
        assert!(m(d.clone(), json!({"$and": [{"a": 1}, {"b": 2}]})));
        assert!(m(d.clone(), json!({"$nor": [{"a": 9}, {"b": 9}]})));
        assert!(!m(d, json!({"$not": {"a": 1}})));
    }

    #[test]
    fn elem_match() {
        let d = json!({"xs": [{"v": 1}, {"v": 7}]});
        assert!(m(d.clone(), json!({"xs": {"$elemMatch": {"v": {"$gt": 5}}}})));
        assert!(!m(d, json!({"xs": {"$elemMatch": {"v": {"$gt": 9}}}})));
        assert!(m(
            json!({"ns": [3, 8]}),
            json!({"ns": {"$elemMatch": {"$gte": 8}}})
        ));
    }

    #[test]
    fn array_index_paths() {
        let d = json!({"tags": ["a", "b"]});
        assert!(m(d.clone(), json!({"tags[0]": "a"})));
        assert!(m(d.clone(), json!({"tags.1": "b"})));
        assert!(!m(d, json!({"tags[2]": "a"})));
    }

    #[test]
    fn size_and_all() {
        let d = json!({"tags": [1, 2, 3]});
        assert!(m(d.clone(), json!({"tags": {"$size": 3}})));
        assert!(m(d.clone(), json!({"tags": {"$all": [1, 3]}})));
        assert!(!m(d, json!({"tags": {"$all": [1, 9]}})));
    }

    #[test]
    fn where_is_an_error() {
        let err = Matcher::new(&[])
            .matches(&doc(json!({})), json!({"$where": "x"}).as_object().unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedQuery(_)));
    }

    #[test]
    fn id_auto_correction() {
        let oid = crate::objectid::ObjectId::new();
        let d = doc(json!({"_id": oid.to_value(), "x": 1}));
        let matcher = Matcher::new(&[]);
        assert!(matcher
            .matches(&d, json!({"_id": oid.to_hex()}).as_object().unwrap())
            .unwrap());
        assert!(matcher
            .matches(&d, json!({"id": oid.to_hex()}).as_object().unwrap())
            .unwrap());
    }
}
