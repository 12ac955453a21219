//! Datetime-typed predicate handling: detection, value normalisation,
//! and a three-tier processor (SQL, temp table, host) with its own kill
//! switch independent of the process-wide flag.

use crate::aggregation::expr::DatePart;
use crate::document::{Document, decode_document};
use crate::error::{Error, Result};
use crate::fallback::FallbackConfig;
use crate::matcher::{Matcher, resolve_path};
use crate::store::{SqliteStore, q_ident};
use crate::translate::{ClauseBuilder, SqlParams, field_expr};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::OnceLock;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn iso_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"^\d{4}-\d{2}-\d{2}([ T]\d{2}:\d{2}:\d{2}(\.\d+)?([+-]\d{2}:\d{2}|Z)?)?$",
        )
        .expect("static regex")
    })
}

fn us_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\d{2}/\d{2}/\d{4}$").expect("static regex"))
}

/// True when a string has a recognised datetime shape (ISO-8601 or
/// US `MM/DD/YYYY`).
pub fn looks_like_datetime(s: &str) -> bool {
    iso_regex().is_match(s) || us_regex().is_match(s)
}

/// A parsed datetime: the wall-clock value plus the offset when the
/// source carried one. Naive and aware values are never compared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedDateTime {
    pub naive: NaiveDateTime,
    pub offset: Option<FixedOffset>,
}

pub fn parse_datetime_str(s: &str) -> Option<ParsedDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(ParsedDateTime {
            naive: dt.naive_local(),
            offset: Some(*dt.offset()),
        });
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ParsedDateTime {
                naive,
                offset: None,
            });
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(ParsedDateTime {
                naive: date.and_hms_opt(0, 0, 0)?,
                offset: None,
            });
        }
    }
    None
}

pub fn parse_json_datetime(v: &Value) -> Option<ParsedDateTime> {
    match v {
        Value::String(s) => parse_datetime_str(s),
        Value::Number(n) => {
            let millis = n.as_i64()?;
            DateTime::from_timestamp_millis(millis).map(|dt| ParsedDateTime {
                naive: dt.naive_utc(),
                offset: None,
            })
        }
        _ => None,
    }
}

/// Canonical ISO form. Aware values normalise to UTC wall-clock, the
/// same convention `strftime` applies.
pub fn to_iso_string(dt: &ParsedDateTime) -> String {
    normalized_naive(dt).format(ISO_FORMAT).to_string()
}

fn normalized_naive(dt: &ParsedDateTime) -> NaiveDateTime {
    match dt.offset {
        Some(offset) => dt.naive - chrono::Duration::seconds(offset.local_minus_utc() as i64),
        None => dt.naive,
    }
}

pub fn date_part(dt: &ParsedDateTime, part: DatePart) -> i64 {
    let n = dt.naive;
    match part {
        DatePart::Year => n.year() as i64,
        DatePart::Month => n.month() as i64,
        DatePart::DayOfMonth => n.day() as i64,
        DatePart::Hour => n.hour() as i64,
        DatePart::Minute => n.minute() as i64,
        DatePart::Second => n.second() as i64,
        DatePart::DayOfWeek => n.weekday().num_days_from_sunday() as i64 + 1,
    }
}

/// Render with a MongoDB-style format string (`%Y-%m-%d` codes).
pub fn format_datetime(dt: &ParsedDateTime, format: &str) -> String {
    let mut chrono_format = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            chrono_format.push(c);
            continue;
        }
        match chars.next() {
            Some('L') => chrono_format.push_str("%3f"),
            Some('j') => chrono_format.push_str("%j"),
            Some(code) => {
                chrono_format.push('%');
                chrono_format.push(code);
            }
            None => chrono_format.push('%'),
        }
    }
    dt.naive.format(&chrono_format).to_string()
}

/// Compare two datetimes; `None` when one is aware and the other naive.
pub fn cmp_datetime(a: &ParsedDateTime, b: &ParsedDateTime) -> Option<Ordering> {
    match (a.offset, b.offset) {
        (None, None) => Some(a.naive.cmp(&b.naive)),
        (Some(_), Some(_)) => Some(normalized_naive(a).cmp(&normalized_naive(b))),
        _ => None,
    }
}

/// Does any predicate of the query involve a datetime value? Checks ISO
/// and US string shapes, `$type: "date"`, and datetime-shaped regex
/// patterns.
pub fn query_involves_datetime(query: &Document) -> bool {
    query.iter().any(|(key, value)| match key.as_str() {
        "$and" | "$or" | "$nor" => value
            .as_array()
            .is_some_and(|items| items.iter().filter_map(Value::as_object).any(query_involves_datetime)),
        "$not" => value.as_object().is_some_and(query_involves_datetime),
        _ => value_involves_datetime(value),
    })
}

fn value_involves_datetime(value: &Value) -> bool {
    match value {
        Value::String(s) => looks_like_datetime(s),
        Value::Object(ops) => ops.iter().any(|(op, arg)| match op.as_str() {
            "$type" => arg.as_str() == Some("date"),
            "$regex" => arg.as_str().is_some_and(datetime_shaped_pattern),
            "$in" | "$nin" => arg
                .as_array()
                .is_some_and(|items| items.iter().any(value_involves_datetime)),
            _ => value_involves_datetime(arg),
        }),
        Value::Array(items) => items.iter().any(value_involves_datetime),
        _ => false,
    }
}

fn datetime_shaped_pattern(pattern: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"\\d\{4\}-\\d\{2\}|\d{4}-\d{2}-\d{2}").expect("static regex")
    });
    re.is_match(pattern)
}

/// Normalise every datetime string literal in a query to canonical ISO
/// so lexicographic SQL comparison agrees with chronological order.
pub fn normalize_query_datetimes(query: &Document) -> Document {
    let mut out = Document::new();
    for (key, value) in query {
        out.insert(key.clone(), normalize_value(value));
    }
    out
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) if looks_like_datetime(s) => match parse_datetime_str(s) {
            Some(dt) => Value::String(to_iso_string(&dt)),
            None => value.clone(),
        },
        Value::Object(map) => {
            let mut out = Document::new();
            for (k, v) in map {
                if k == "$regex" || k == "$options" {
                    out.insert(k.clone(), v.clone());
                } else {
                    out.insert(k.clone(), normalize_value(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        other => other.clone(),
    }
}

/// Three-tier processor for datetime-typed predicates.
pub struct DateTimeQueryProcessor<'a> {
    store: &'a SqliteStore,
    config: FallbackConfig,
}

impl<'a> DateTimeQueryProcessor<'a> {
    pub fn new(store: &'a SqliteStore, config: FallbackConfig) -> Self {
        Self { store, config }
    }

    /// Execute a find whose query involves datetimes. Returns the
    /// matching documents; never declines (the host tier is total).
    pub fn process(&self, coll: &str, query: &Document) -> Result<Vec<Document>> {
        if self.config.effective() {
            return self.host_tier(coll, query);
        }
        let normalized = normalize_query_datetimes(query);
        if query_is_simple(&normalized) {
            if let Some(docs) = self.sql_tier(coll, &normalized)? {
                tracing::debug!(op = "datetime_query", tier = "sql", collection = %coll);
                return Ok(docs);
            }
        } else if let Some(docs) = self.temp_table_tier(coll, &normalized)? {
            tracing::debug!(op = "datetime_query", tier = "temp_table", collection = %coll);
            return Ok(docs);
        }
        tracing::debug!(op = "datetime_query", tier = "host", collection = %coll);
        self.host_tier(coll, query)
    }

    /// Single-statement tier: datetime predicates compare the stored
    /// value normalised in place with `strftime`, so non-canonical
    /// stored forms order the same way the other tiers see them.
    fn sql_tier(&self, coll: &str, query: &Document) -> Result<Option<Vec<Document>>> {
        let Some((where_sql, params)) = self.build_ts_clause(query, None)? else {
            return Ok(None);
        };
        let sql = if where_sql.is_empty() {
            format!(
                "SELECT id, {} FROM {} ORDER BY id",
                self.store.data_read_expr(),
                q_ident(coll)
            )
        } else {
            format!(
                "SELECT id, {} FROM {} WHERE {} ORDER BY id",
                self.store.data_read_expr(),
                q_ident(coll),
                where_sql
            )
        };
        Ok(Some(run_select(self.store, &sql, params)?))
    }

    /// Materialise `id, data, ts_parsed` into a temp table and run the
    /// rewritten predicate against it.
    fn temp_table_tier(&self, coll: &str, query: &Document) -> Result<Option<Vec<Document>>> {
        let Some(ts_field) = first_datetime_field(query) else {
            return Ok(None);
        };
        let Some((where_sql, params)) = self.build_ts_clause(query, Some(ts_field.as_str()))? else {
            return Ok(None);
        };

        let table = format!("dtq_{}", uuid::Uuid::new_v4().simple());
        let create = format!(
            "CREATE TEMP TABLE {} AS SELECT id, {} AS data, strftime('{}', {}) AS ts_parsed FROM {}",
            q_ident(&table),
            self.store.data_read_expr(),
            ISO_FORMAT,
            field_expr(&ts_field),
            q_ident(coll)
        );
        self.store.lock().execute_batch(&create)?;

        let select = if where_sql.is_empty() {
            format!("SELECT id, data FROM {} ORDER BY id", q_ident(&table))
        } else {
            format!(
                "SELECT id, data FROM {} WHERE {} ORDER BY id",
                q_ident(&table),
                where_sql
            )
        };
        let result = run_select(self.store, &select, params);
        let _ = self
            .store
            .lock()
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", q_ident(&table)));
        result.map(Some)
    }

    /// WHERE fragment where datetime predicates compare the normalised
    /// stored value: the materialised `ts_parsed` column when
    /// `parsed_field` names the field, an inline `strftime` otherwise.
    /// Everything else goes through the ordinary clause builder.
    fn build_ts_clause(
        &self,
        query: &Document,
        parsed_field: Option<&str>,
    ) -> Result<Option<(String, SqlParams)>> {
        let mut parts = Vec::new();
        let mut params = Vec::new();
        for (key, value) in query {
            let clause = match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let Some(items) = value.as_array() else {
                        return Err(Error::MalformedQuery(
                            "logical operator requires an array".into(),
                        ));
                    };
                    let mut sub_parts = Vec::new();
                    let mut sub_params = Vec::new();
                    for item in items {
                        let Some(sub) = item.as_object() else {
                            return Err(Error::MalformedQuery(
                                "logical operand must be a document".into(),
                            ));
                        };
                        match self.build_ts_clause(sub, parsed_field)? {
                            Some((sql, p)) if !sql.is_empty() => {
                                sub_parts.push(format!("({sql})"));
                                sub_params.extend(p);
                            }
                            Some(_) => sub_parts.push("(1 = 1)".to_string()),
                            None => return Ok(None),
                        }
                    }
                    let joiner = if key == "$and" { " AND " } else { " OR " };
                    let joined = sub_parts.join(joiner);
                    let sql = if key == "$nor" {
                        format!("NOT ({joined})")
                    } else {
                        format!("({joined})")
                    };
                    Some((sql, sub_params))
                }
                field if !field.starts_with('$') && value_involves_datetime(value) => {
                    if field.contains('[') || crate::translate::path_has_numeric_segment(field) {
                        None
                    } else {
                        ts_predicate(&normalized_field_expr(field, parsed_field), value)
                    }
                }
                _ => {
                    // Datetime values under any other combinator keep
                    // full fidelity on the host tier.
                    if value_involves_datetime(value) {
                        None
                    } else {
                        let mut single = Document::new();
                        single.insert(key.clone(), value.clone());
                        ClauseBuilder::new(&[], self.store.has_regexp()).build(&single)?
                    }
                }
            };
            match clause {
                Some((sql, p)) if !sql.is_empty() => {
                    parts.push(sql);
                    params.extend(p);
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        Ok(Some((parts.join(" AND "), params)))
    }

    fn host_tier(&self, coll: &str, query: &Document) -> Result<Vec<Document>> {
        let rows = self.store.fetch_all(coll)?;
        let mut out = Vec::new();
        for (id, data) in rows {
            let doc = decode_document(id, &data)?;
            if datetime_matches(&doc, query)? {
                out.push(doc);
            }
        }
        Ok(out)
    }
}

fn run_select(store: &SqliteStore, sql: &str, params: SqlParams) -> Result<Vec<Document>> {
    let conn = store.lock();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    drop(conn);
    rows.into_iter()
        .map(|(id, data)| decode_document(id, &data))
        .collect()
}

/// A query is simple when every top-level entry is a field predicate
/// (no logical combinators).
fn query_is_simple(query: &Document) -> bool {
    query.keys().all(|k| !k.starts_with('$'))
}

fn first_datetime_field(query: &Document) -> Option<String> {
    for (key, value) in query {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Some(found) = item.as_object().and_then(first_datetime_field) {
                            return Some(found);
                        }
                    }
                }
            }
            k if k.starts_with('$') => {}
            field => {
                if value_involves_datetime(value) {
                    return Some(field.to_string());
                }
            }
        }
    }
    None
}

/// Stored-side expression for a datetime field: the materialised
/// `ts_parsed` column when available, otherwise an inline `strftime`
/// normalisation of the extracted value.
fn normalized_field_expr(field: &str, parsed_field: Option<&str>) -> String {
    if parsed_field == Some(field) {
        "ts_parsed".to_string()
    } else {
        format!("strftime('{ISO_FORMAT}', {})", field_expr(field))
    }
}

fn ts_predicate(ts_expr: &str, value: &Value) -> Option<(String, SqlParams)> {
    match value {
        Value::String(s) => Some((
            format!("{ts_expr} = ?"),
            vec![SqlValue::Text(s.clone())],
        )),
        Value::Object(ops) => {
            let mut parts = Vec::new();
            let mut params = Vec::new();
            for (op, arg) in ops {
                let sql_op = crate::translate::comparison_sql_op(op)?;
                let s = arg.as_str().filter(|s| looks_like_datetime(s))?;
                parts.push(format!("{ts_expr} {sql_op} ?"));
                params.push(SqlValue::Text(s.to_string()));
            }
            Some((parts.join(" AND "), params))
        }
        _ => None,
    }
}

/// Host matcher with datetime awareness: comparisons where both sides
/// parse as datetimes use chronological order; a naive value never
/// matches an aware one. Everything else defers to the plain matcher.
pub fn datetime_matches(doc: &Document, query: &Document) -> Result<bool> {
    for (key, value) in query {
        let ok = match key.as_str() {
            "$and" => {
                let items = logical_items(value)?;
                let mut all = true;
                for sub in items {
                    if !datetime_matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let items = logical_items(value)?;
                let mut any = false;
                for sub in items {
                    if datetime_matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let items = logical_items(value)?;
                let mut any = false;
                for sub in items {
                    if datetime_matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                !any
            }
            "$not" => {
                let sub = value
                    .as_object()
                    .ok_or_else(|| Error::MalformedQuery("$not requires a document".into()))?;
                !datetime_matches(doc, sub)?
            }
            k if k.starts_with('$') => {
                let mut single = Document::new();
                single.insert(k.to_string(), value.clone());
                Matcher::new(&[]).matches(doc, &single)?
            }
            field => field_datetime_matches(doc, field, value)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_items(value: &Value) -> Result<Vec<&Document>> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .ok_or_else(|| Error::MalformedQuery("logical operator requires an array".into()))
}

fn field_datetime_matches(doc: &Document, field: &str, value: &Value) -> Result<bool> {
    let actual = resolve_path(doc, field);
    let actual_dt = actual.and_then(parse_json_datetime);

    match value {
        Value::String(s) if looks_like_datetime(s) => {
            let Some(target) = parse_datetime_str(s) else {
                return Ok(false);
            };
            Ok(actual_dt
                .and_then(|a| cmp_datetime(&a, &target))
                .is_some_and(|ord| ord == Ordering::Equal))
        }
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            for (op, arg) in ops {
                let target = arg.as_str().and_then(parse_datetime_str);
                let ok = match (op.as_str(), target, actual_dt) {
                    ("$eq" | "$gt" | "$gte" | "$lt" | "$lte" | "$ne", Some(t), Some(a)) => {
                        match cmp_datetime(&a, &t) {
                            Some(ord) => match op.as_str() {
                                "$eq" => ord == Ordering::Equal,
                                "$ne" => ord != Ordering::Equal,
                                "$gt" => ord == Ordering::Greater,
                                "$gte" => ord != Ordering::Less,
                                "$lt" => ord == Ordering::Less,
                                _ => ord != Ordering::Greater,
                            },
                            // Naive vs aware: no match, no error.
                            None => false,
                        }
                    }
                    _ => {
                        let mut single = Document::new();
                        let mut inner = Document::new();
                        inner.insert(op.clone(), arg.clone());
                        single.insert(field.to_string(), Value::Object(inner));
                        Matcher::new(&[]).matches(doc, &single)?
                    }
                };
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => {
            let mut single = Document::new();
            single.insert(field.to_string(), value.clone());
            Matcher::new(&[]).matches(doc, &single)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_datetime_shapes() {
        assert!(looks_like_datetime("2023-01-15T08:30:00"));
        assert!(looks_like_datetime("2023-01-15 08:30:00"));
        assert!(looks_like_datetime("2023-01-15"));
        assert!(looks_like_datetime("01/15/2023"));
        assert!(!looks_like_datetime("not a date"));
        assert!(!looks_like_datetime("1234"));
    }

    #[test]
    fn query_detection_recurses() {
        let q = json!({"$or": [{"a": 1}, {"ts": {"$gte": "2023-01-01"}}]});
        assert!(query_involves_datetime(q.as_object().unwrap()));
        let q = json!({"a": {"$gt": 5}});
        assert!(!query_involves_datetime(q.as_object().unwrap()));
    }

    #[test]
    fn us_dates_normalize_to_iso() {
        let dt = parse_datetime_str("01/15/2023").unwrap();
        assert_eq!(to_iso_string(&dt), "2023-01-15T00:00:00");
    }

    #[test]
    fn aware_normalises_to_utc() {
        let dt = parse_datetime_str("2023-01-15T10:00:00+02:00").unwrap();
        assert_eq!(to_iso_string(&dt), "2023-01-15T08:00:00");
    }

    #[test]
    fn naive_vs_aware_never_match() {
        let naive = parse_datetime_str("2023-01-15T08:00:00").unwrap();
        let aware = parse_datetime_str("2023-01-15T08:00:00Z").unwrap();
        assert!(cmp_datetime(&naive, &aware).is_none());
    }

    #[test]
    fn host_matcher_compares_chronologically() {
        let doc = json!({"ts": "2023-01-15 08:30:00"});
        let q = json!({"ts": {"$gte": "2023-01-15T00:00:00", "$lt": "2023-01-16T00:00:00"}});
        assert!(
            datetime_matches(doc.as_object().unwrap(), q.as_object().unwrap()).unwrap()
        );
    }
}
