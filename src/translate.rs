//! Query-to-SQL translation: field path accessors, per-operator clause
//! translation, and the composing clause builder.
//!
//! A return of `None` means "not expressible in SQL" and tells the caller
//! to fall back to host-code evaluation. It is never an error.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::objectid::{is_hex24, objectid_hex};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

pub type SqlParams = Vec<SqlValue>;

/// JSON path for a dotted field: `a.b` → `$."a"."b"`.
pub fn json_path(field: &str) -> String {
    let mut out = String::from("$");
    for seg in field.split('.') {
        out.push_str(".\"");
        out.push_str(&seg.replace('"', "\\\""));
        out.push('"');
    }
    out
}

/// SQL expression extracting a dotted field from the document column.
pub fn field_expr(field: &str) -> String {
    format!("json_extract(data, '{}')", escape_sql(&json_path(field)))
}

/// Escape a string for inclusion in a single-quoted SQL literal.
pub fn escape_sql(s: &str) -> String {
    s.replace('\'', "''")
}

/// True when any dotted segment is purely numeric. The host tier reads
/// such segments as array indexes, while the quoted JSON path form
/// would read an object key; those paths stay on the host tier.
pub fn path_has_numeric_segment(field: &str) -> bool {
    field
        .split('.')
        .any(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
}

/// Bind a scalar JSON value as a SQL parameter. Arrays and objects do
/// not bind; those comparisons go through the fallback tier.
pub fn json_to_param(v: &Value) -> Option<SqlValue> {
    match v {
        Value::Null => Some(SqlValue::Null),
        Value::Bool(b) => Some(SqlValue::Integer(*b as i64)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SqlValue::Integer(i))
            } else {
                n.as_f64().map(SqlValue::Real)
            }
        }
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Clause builder over a query document. Holds the per-collection facts
/// the translation needs: companion FTS tables and REGEXP availability.
pub struct ClauseBuilder<'a> {
    fts_tables: &'a [String],
    has_regexp: bool,
}

impl<'a> ClauseBuilder<'a> {
    pub fn new(fts_tables: &'a [String], has_regexp: bool) -> Self {
        Self {
            fts_tables,
            has_regexp,
        }
    }

    /// Build a `WHERE` fragment (without the keyword) for a query.
    ///
    /// `Ok(Some(("", _)))` is the empty query; `Ok(None)` means some
    /// clause is not expressible in SQL and the whole query must fall
    /// back.
    pub fn build(&self, query: &Document) -> Result<Option<(String, SqlParams)>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: SqlParams = Vec::new();

        for (key, value) in query {
            let translated = match key.as_str() {
                "$and" => self.build_logical(value, " AND ", false)?,
                "$or" => self.build_logical(value, " OR ", false)?,
                "$nor" => self.build_logical(value, " OR ", true)?,
                "$not" => {
                    let sub = value.as_object().ok_or_else(|| {
                        Error::MalformedQuery("$not requires a document".into())
                    })?;
                    match self.build(sub)? {
                        Some((sql, p)) if !sql.is_empty() => Some((format!("NOT ({sql})"), p)),
                        Some(_) => Some(("NOT (1 = 1)".to_string(), Vec::new())),
                        None => None,
                    }
                }
                "$expr" => crate::aggregation::sql_expr::boolean_expr_sql(value)?,
                "$text" => self.build_text(value)?,
                "$where" => None,
                k if k.starts_with('$') => {
                    return Err(Error::MalformedQuery(format!("unknown operator: {k}")));
                }
                field => self.build_field(field, value)?,
            };
            match translated {
                Some((sql, p)) => {
                    clauses.push(sql);
                    params.extend(p);
                }
                None => return Ok(None),
            }
        }

        if clauses.is_empty() {
            return Ok(Some((String::new(), Vec::new())));
        }
        Ok(Some((clauses.join(" AND "), params)))
    }

    fn build_logical(
        &self,
        value: &Value,
        joiner: &str,
        negate: bool,
    ) -> Result<Option<(String, SqlParams)>> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::MalformedQuery("logical operator requires an array".into()))?;
        let mut parts = Vec::new();
        let mut params = Vec::new();
        for item in items {
            let sub = item
                .as_object()
                .ok_or_else(|| Error::MalformedQuery("logical operand must be a document".into()))?;
            match self.build(sub)? {
                Some((sql, p)) if !sql.is_empty() => {
                    parts.push(format!("({sql})"));
                    params.extend(p);
                }
                Some(_) => parts.push("(1 = 1)".to_string()),
                None => return Ok(None),
            }
        }
        if parts.is_empty() {
            return Ok(Some((String::new(), Vec::new())));
        }
        let joined = parts.join(joiner);
        let sql = if negate {
            format!("NOT ({joined})")
        } else {
            format!("({joined})")
        };
        Ok(Some((sql, params)))
    }

    fn build_text(&self, value: &Value) -> Result<Option<(String, SqlParams)>> {
        let search = value
            .as_object()
            .and_then(|o| o.get("$search"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedQuery("$text requires {$search: <string>}".into()))?;
        if self.fts_tables.is_empty() {
            return Ok(None);
        }
        let mut parts = Vec::new();
        let mut params = Vec::new();
        for table in self.fts_tables {
            parts.push(format!(
                "rowid IN (SELECT rowid FROM {t} WHERE {t} MATCH ?)",
                t = crate::store::q_ident(table)
            ));
            params.push(SqlValue::Text(search.to_string()));
        }
        let joined = parts.join(" OR ");
        let sql = if parts.len() > 1 {
            format!("({joined})")
        } else {
            joined
        };
        Ok(Some((sql, params)))
    }

    fn build_field(&self, field: &str, value: &Value) -> Result<Option<(String, SqlParams)>> {
        if field.contains('[') || path_has_numeric_segment(field) {
            // Array indexing in paths is not translated.
            return Ok(None);
        }
        if field == "_id" || field == "id" {
            return self.build_id(value);
        }
        match value {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                let mut parts = Vec::new();
                let mut params = Vec::new();
                for (op, arg) in ops {
                    if op == "$options" {
                        continue;
                    }
                    match self.translate_operator(field, op, arg, ops)? {
                        Some((sql, p)) => {
                            parts.push(sql);
                            params.extend(p);
                        }
                        None => return Ok(None),
                    }
                }
                if parts.is_empty() {
                    return Ok(Some((String::new(), Vec::new())));
                }
                Ok(Some((parts.join(" AND "), params)))
            }
            _ => self.build_equality(field, value),
        }
    }

    fn build_equality(&self, field: &str, value: &Value) -> Result<Option<(String, SqlParams)>> {
        let expr = field_expr(field);
        match value {
            Value::Null => Ok(Some((format!("{expr} IS NULL"), Vec::new()))),
            _ => match json_to_param(value) {
                Some(p) => Ok(Some((format!("{expr} = ?"), vec![p]))),
                None => Ok(None),
            },
        }
    }

    /// `_id`/`id` auto-correction: integers hit the row id column,
    /// ObjectId values (tagged or 24-hex text) hit both the tagged and
    /// the raw representation, other scalars hit the stored `_id`.
    fn build_id(&self, value: &Value) -> Result<Option<(String, SqlParams)>> {
        if let Value::Object(ops) = value {
            if let Some(hex) = objectid_hex(value) {
                return Ok(Some(id_hex_clause(hex)));
            }
            // Operator document: route $eq through auto-correction and
            // integer comparisons through the row id column.
            let mut parts = Vec::new();
            let mut params = Vec::new();
            for (op, arg) in ops {
                let clause = match op.as_str() {
                    "$eq" => self.build_id(arg)?,
                    "$in" => {
                        let items = arg.as_array().ok_or_else(|| {
                            Error::MalformedQuery("$in requires an array".into())
                        })?;
                        let mut alts = Vec::new();
                        let mut alt_params = Vec::new();
                        for item in items {
                            match self.build_id(item)? {
                                Some((sql, p)) => {
                                    alts.push(format!("({sql})"));
                                    alt_params.extend(p);
                                }
                                None => return Ok(None),
                            }
                        }
                        if alts.is_empty() {
                            Some(("1 = 0".to_string(), Vec::new()))
                        } else {
                            Some((format!("({})", alts.join(" OR ")), alt_params))
                        }
                    }
                    "$gt" | "$gte" | "$lt" | "$lte" | "$ne" if arg.is_i64() => {
                        let sql_op = comparison_sql_op(op).expect("comparison operator");
                        Some((
                            format!("id {sql_op} ?"),
                            vec![json_to_param(arg).expect("integer param")],
                        ))
                    }
                    _ => None,
                };
                match clause {
                    Some((sql, p)) => {
                        parts.push(sql);
                        params.extend(p);
                    }
                    None => return Ok(None),
                }
            }
            if parts.is_empty() {
                return Ok(None);
            }
            return Ok(Some((parts.join(" AND "), params)));
        }

        match value {
            Value::Number(n) if n.is_i64() => Ok(Some((
                "(id = ? AND json_extract(data, '$._id') IS NULL \
                 OR json_extract(data, '$._id') = ?)"
                    .to_string(),
                vec![
                    SqlValue::Integer(n.as_i64().expect("integer")),
                    SqlValue::Integer(n.as_i64().expect("integer")),
                ],
            ))),
            Value::String(s) if is_hex24(s) => Ok(Some(id_hex_clause(s))),
            Value::Null => Ok(Some((
                "json_extract(data, '$._id') IS NULL AND 1 = 0".to_string(),
                Vec::new(),
            ))),
            _ => match json_to_param(value) {
                Some(p) => Ok(Some((
                    "json_extract(data, '$._id') = ?".to_string(),
                    vec![p],
                ))),
                None => Ok(None),
            },
        }
    }

    fn translate_operator(
        &self,
        field: &str,
        op: &str,
        arg: &Value,
        ops: &Document,
    ) -> Result<Option<(String, SqlParams)>> {
        let expr = field_expr(field);
        match op {
            "$eq" => self.build_equality(field, arg),
            "$ne" => match arg {
                Value::Null => Ok(Some((format!("{expr} IS NOT NULL"), Vec::new()))),
                _ => match json_to_param(arg) {
                    Some(p) => Ok(Some((format!("{expr} != ?"), vec![p]))),
                    None => Ok(None),
                },
            },
            "$gt" | "$gte" | "$lt" | "$lte" => {
                let sql_op = comparison_sql_op(op).expect("comparison operator");
                match json_to_param(arg) {
                    Some(SqlValue::Null) => Ok(None),
                    Some(p) => Ok(Some((format!("{expr} {sql_op} ?"), vec![p]))),
                    None => Ok(None),
                }
            }
            "$in" | "$nin" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| Error::MalformedQuery(format!("{op} requires an array")))?;
                let negate = op == "$nin";
                if items.is_empty() {
                    let sql = if negate { "1 = 1" } else { "1 = 0" };
                    return Ok(Some((sql.to_string(), Vec::new())));
                }
                let mut has_null = false;
                let mut params = Vec::new();
                for item in items {
                    if item.is_null() {
                        has_null = true;
                        continue;
                    }
                    match json_to_param(item) {
                        Some(p) => params.push(p),
                        None => return Ok(None),
                    }
                }
                let placeholders = vec!["?"; params.len()].join(",");
                let base = if params.is_empty() {
                    String::new()
                } else if negate {
                    format!("{expr} NOT IN ({placeholders})")
                } else {
                    format!("{expr} IN ({placeholders})")
                };
                let sql = match (negate, has_null, base.is_empty()) {
                    (false, true, false) => format!("({base} OR {expr} IS NULL)"),
                    (false, true, true) => format!("{expr} IS NULL"),
                    (true, true, false) => format!("({base} AND {expr} IS NOT NULL)"),
                    (true, true, true) => format!("{expr} IS NOT NULL"),
                    (_, false, _) => base,
                };
                Ok(Some((sql, params)))
            }
            "$exists" => {
                let wanted = arg
                    .as_bool()
                    .ok_or_else(|| Error::MalformedQuery("$exists requires a boolean".into()))?;
                let sql = if wanted {
                    format!("{expr} IS NOT NULL")
                } else {
                    format!("{expr} IS NULL")
                };
                Ok(Some((sql, Vec::new())))
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
                Ok(Some((
                    format!("{expr} % ? = ?"),
                    vec![SqlValue::Integer(divisor), SqlValue::Integer(remainder)],
                )))
            }
            "$size" => {
                let n = arg
                    .as_i64()
                    .ok_or_else(|| Error::MalformedQuery("$size requires an integer".into()))?;
                let path = escape_sql(&json_path(field));
                Ok(Some((
                    format!(
                        "(json_type(data, '{path}') = 'array' AND json_array_length(data, '{path}') = ?)"
                    ),
                    vec![SqlValue::Integer(n)],
                )))
            }
            "$contains" => match arg {
                Value::String(s) => Ok(Some((
                    format!("lower({expr}) LIKE ?"),
                    vec![SqlValue::Text(format!("%{}%", s.to_lowercase()))],
                ))),
                _ => Ok(None),
            },
            "$regex" => {
                if !self.has_regexp {
                    return Ok(None);
                }
                let pattern = arg
                    .as_str()
                    .ok_or_else(|| Error::MalformedQuery("$regex requires a string".into()))?;
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let pattern = if options.contains('i') {
                    format!("(?i){pattern}")
                } else {
                    pattern.to_string()
                };
                Ok(Some((
                    format!("{expr} REGEXP ?"),
                    vec![SqlValue::Text(pattern)],
                )))
            }
            "$all" | "$elemMatch" | "$type" | "$not" => Ok(None),
            _ => Err(Error::MalformedQuery(format!("unknown operator: {op}"))),
        }
    }
}

fn id_hex_clause(hex: &str) -> (String, SqlParams) {
    let hex = hex.to_lowercase();
    (
        "(json_extract(data, '$._id.id') = ? OR json_extract(data, '$._id') = ?)".to_string(),
        vec![SqlValue::Text(hex.clone()), SqlValue::Text(hex)],
    )
}

pub fn comparison_sql_op(op: &str) -> Option<&'static str> {
    match op {
        "$eq" => Some("="),
        "$ne" => Some("!="),
        "$gt" => Some(">"),
        "$gte" => Some(">="),
        "$lt" => Some("<"),
        "$lte" => Some("<="),
        _ => None,
    }
}

/// `ORDER BY` fragment for a sort specification of `(field, direction)`.
pub fn build_order_by(sort: &[(String, i64)]) -> String {
    if sort.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = sort
        .iter()
        .map(|(field, dir)| {
            let ord = if *dir < 0 { "DESC" } else { "ASC" };
            if field == "_id" {
                format!("id {ord}")
            } else {
                format!("{} {ord}", field_expr(field))
            }
        })
        .collect();
    format!("ORDER BY {}", parts.join(", "))
}

/// Parse a `{field: 1|-1}` sort document into ordered pairs.
pub fn parse_sort_spec(spec: &Document) -> Result<Vec<(String, i64)>> {
    let mut out = Vec::new();
    for (field, dir) in spec {
        let dir = dir
            .as_i64()
            .or_else(|| dir.as_f64().map(|f| if f < 0.0 { -1 } else { 1 }))
            .ok_or_else(|| Error::MalformedQuery("sort direction must be 1 or -1".into()))?;
        if dir != 1 && dir != -1 {
            return Err(Error::MalformedQuery("sort direction must be 1 or -1".into()));
        }
        out.push((field.clone(), dir));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(query: serde_json::Value) -> Option<(String, SqlParams)> {
        let builder = ClauseBuilder::new(&[], true);
        builder
            .build(query.as_object().expect("query object"))
            .expect("translatable")
    }

    #[test]
    fn empty_query_is_empty_clause() {
        let (sql, params) = build(json!({})).unwrap();
        assert_eq!(sql, "");
        assert!(params.is_empty());
    }

    #[test]
    fn scalar_equality() {
        let (sql, params) = build(json!({"name": "alice"})).unwrap();
        assert_eq!(sql, r#"json_extract(data, '$."name"') = ?"#);
        assert_eq!(params, vec![SqlValue::Text("alice".into())]);
    }

    #[test]
    fn range_operators_compose_with_and() {
        let (sql, _) = build(json!({"age": {"$gte": 18, "$lt": 65}})).unwrap();
        assert!(sql.contains(">= ?"));
        assert!(sql.contains("< ?"));
        assert!(sql.contains(" AND "));
    }

    #[test]
    fn in_with_null_adds_is_null() {
        let (sql, params) = build(json!({"x": {"$in": [1, null, 3]}})).unwrap();
        assert!(sql.contains("IN (?,?)"));
        assert!(sql.contains("IS NULL"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn elem_match_is_unsupported() {
        assert!(build(json!({"x": {"$elemMatch": {"a": 1}}})).is_none());
    }

    #[test]
    fn where_is_unsupported_not_error() {
        assert!(build(json!({"$where": "this.a > 1"})).is_none());
    }

    #[test]
    fn array_index_path_is_unsupported() {
        assert!(build(json!({"tags[0]": "x"})).is_none());
    }

    #[test]
    fn numeric_dotted_path_is_unsupported() {
        // The host tier reads `tags.0` as an array index; the quoted
        // JSON path would read an object key.
        assert!(build(json!({"tags.0": "x"})).is_none());
        assert!(build(json!({"a.0.b": 1})).is_none());
        assert!(path_has_numeric_segment("tags.0"));
        assert!(!path_has_numeric_segment("v2.name"));
    }

    #[test]
    fn unknown_operator_is_malformed() {
        let builder = ClauseBuilder::new(&[], true);
        let query = json!({"x": {"$frobnicate": 1}});
        assert!(builder.build(query.as_object().unwrap()).is_err());
    }

    #[test]
    fn nor_negates_disjunction() {
        let (sql, _) = build(json!({"$nor": [{"a": 1}, {"b": 2}]})).unwrap();
        assert!(sql.starts_with("NOT ("));
        assert!(sql.contains(" OR "));
    }

    #[test]
    fn id_integer_routes_to_row_id() {
        let (sql, _) = build(json!({"_id": 5})).unwrap();
        assert!(sql.contains("id = ?"));
    }

    #[test]
    fn id_hex_matches_both_representations() {
        let (sql, params) = build(json!({"_id": "0123456789abcdef01234567"})).unwrap();
        assert!(sql.contains("'$._id.id'"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn nested_path_quoting() {
        assert_eq!(json_path("a.b"), r#"$."a"."b""#);
        assert_eq!(field_expr("a"), r#"json_extract(data, '$."a"')"#);
    }
}
