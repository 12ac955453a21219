//! Tier-2 aggregation: each stage materialises into a short-lived temp
//! table with the same `(id, data)` shape, created from the previous
//! stage's table (the first stage reads the base collection). Stages
//! with no SQL shape stop the staging; the host tier picks up from the
//! last materialised table. Temp tables are dropped on every exit path
//! via the returned guard.

use crate::aggregation::pipeline::{LookupSpec, Stage, UnwindSpec};
use crate::aggregation::sql_expr::expr_to_sql;
use crate::aggregation::stages::group::{AccumulatorType, parse_accumulator_type};
use crate::aggregation::expr::parse_expr;
use crate::document::Document;
use crate::error::Result;
use crate::store::{SqliteStore, q_ident};
use crate::translate::{
    ClauseBuilder, SqlParams, escape_sql, field_expr, json_path, parse_sort_spec,
    path_has_numeric_segment,
};
use rusqlite::Connection;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Owns the temp tables of one staged run; drops them when released.
pub struct TempTableGuard {
    conn: Arc<Mutex<Connection>>,
    tables: Vec<String>,
}

impl TempTableGuard {
    fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            tables: Vec::new(),
        }
    }

    pub fn cleanup(&mut self) {
        if self.tables.is_empty() {
            return;
        }
        if let Ok(conn) = self.conn.lock() {
            for table in self.tables.drain(..) {
                let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", q_ident(&table)));
            }
        }
    }
}

impl Drop for TempTableGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Outcome of staging: the last materialised table (None when no stage
/// could be staged) and the stages left for the host tier.
pub struct StagedResult {
    pub guard: TempTableGuard,
    pub last_table: Option<String>,
    pub remaining: Vec<Stage>,
}

pub struct TempTableProcessor<'a> {
    store: &'a SqliteStore,
    coll: &'a str,
    fts_tables: &'a [String],
    prefix: String,
}

impl<'a> TempTableProcessor<'a> {
    pub fn new(store: &'a SqliteStore, coll: &'a str, fts_tables: &'a [String]) -> Self {
        Self {
            store,
            coll,
            fts_tables,
            prefix: format!("agg_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn process(&self, stages: &[Stage]) -> Result<StagedResult> {
        let mut guard = TempTableGuard::new(self.store.conn());
        let mut last_table: Option<String> = None;

        for (idx, stage) in stages.iter().enumerate() {
            let source = match &last_table {
                Some(table) => SourceTable::Temp(table.clone()),
                None => SourceTable::Base,
            };
            match self.stage_sql(stage, &source, idx)? {
                Some((select_sql, params)) => {
                    let table = format!("{}_{}", self.prefix, idx);
                    let create = format!(
                        "CREATE TEMP TABLE {} AS {select_sql}",
                        q_ident(&table)
                    );
                    tracing::debug!(op = "tier2_stage", stage = stage.name(), table = %table);
                    self.store
                        .lock()
                        .execute(&create, rusqlite::params_from_iter(params))?;
                    guard.tables.push(table.clone());
                    last_table = Some(table);
                }
                None => {
                    return Ok(StagedResult {
                        guard,
                        last_table,
                        remaining: stages[idx..].to_vec(),
                    });
                }
            }
        }

        Ok(StagedResult {
            guard,
            last_table,
            remaining: Vec::new(),
        })
    }

    fn stage_sql(
        &self,
        stage: &Stage,
        source: &SourceTable,
        idx: usize,
    ) -> Result<Option<(String, SqlParams)>> {
        let from = match source {
            SourceTable::Base => q_ident(self.coll),
            SourceTable::Temp(t) => q_ident(t),
        };
        let data_expr = match source {
            SourceTable::Base => self.store.data_read_expr(),
            SourceTable::Temp(_) => "data",
        };

        match stage {
            Stage::Match(query) => {
                if idx > 0 && query_mentions(query, "$text") {
                    return Ok(None);
                }
                let builder = ClauseBuilder::new(self.fts_tables, self.store.has_regexp());
                let Some((where_sql, params)) = builder.build(query)? else {
                    return Ok(None);
                };
                // rowid order is the previous stage's materialised order
                // (and the storage order for the base collection).
                let sql = if where_sql.is_empty() {
                    format!("SELECT id, {data_expr} AS data FROM {from} ORDER BY rowid")
                } else {
                    format!(
                        "SELECT id, {data_expr} AS data FROM {from} WHERE {where_sql} ORDER BY rowid"
                    )
                };
                Ok(Some((sql, params)))
            }
            Stage::AddFields(spec) => {
                let mut expr = data_expr.to_string();
                let mut params = Vec::new();
                for (field, value) in spec {
                    if field.contains('[') || path_has_numeric_segment(field) {
                        return Ok(None);
                    }
                    let parsed = parse_expr(value)
                        .map_err(|e| crate::error::Error::MalformedQuery(e.to_string()))?;
                    let Some((value_sql, p)) = expr_to_sql(&parsed) else {
                        return Ok(None);
                    };
                    expr = format!(
                        "json_set({expr}, '{}', {value_sql})",
                        escape_sql(&json_path(field))
                    );
                    params.extend(p);
                }
                Ok(Some((
                    format!("SELECT id, {expr} AS data FROM {from}"),
                    params,
                )))
            }
            Stage::Project(spec) => self.project_sql(spec, &from, data_expr),
            Stage::ReplaceRoot(replacement) => {
                let parsed = parse_expr(replacement)
                    .map_err(|e| crate::error::Error::MalformedQuery(e.to_string()))?;
                let Some((value_sql, params)) = expr_to_sql(&parsed) else {
                    return Ok(None);
                };
                Ok(Some((
                    format!("SELECT id, {value_sql} AS data FROM {from}"),
                    params,
                )))
            }
            Stage::Unwind(spec) => Ok(self.unwind_sql(spec, &from, data_expr)),
            Stage::Group { id, accumulators } => Ok(self.group_sql(id, accumulators, &from)),
            Stage::Sort(spec) => {
                let sort_spec = parse_sort_spec(spec)?;
                let mut parts = Vec::new();
                for (field, dir) in &sort_spec {
                    if field.contains('[') || path_has_numeric_segment(field) {
                        return Ok(None);
                    }
                    let ord = if *dir < 0 { "DESC" } else { "ASC" };
                    parts.push(format!("{} {ord}", stored_field_expr(field)));
                }
                Ok(Some((
                    format!(
                        "SELECT id, {data_expr} AS data FROM {from} ORDER BY {}",
                        parts.join(", ")
                    ),
                    Vec::new(),
                )))
            }
            Stage::Skip(n) => Ok(Some((
                format!(
                    "SELECT id, {data_expr} AS data FROM {from} ORDER BY rowid LIMIT -1 OFFSET {n}"
                ),
                Vec::new(),
            ))),
            Stage::Limit(n) => Ok(Some((
                format!("SELECT id, {data_expr} AS data FROM {from} ORDER BY rowid LIMIT {n}"),
                Vec::new(),
            ))),
            Stage::Lookup(spec) => Ok(self.lookup_sql(spec, &from, data_expr)),
        }
    }

    fn project_sql(
        &self,
        spec: &Document,
        from: &str,
        data_expr: &str,
    ) -> Result<Option<(String, SqlParams)>> {
        let mut has_inclusion = false;
        let mut has_exclusion = false;
        for (key, value) in spec {
            if key == "_id" {
                continue;
            }
            if value.as_i64() == Some(0) || value == &Value::Bool(false) {
                has_exclusion = true;
            } else {
                has_inclusion = true;
            }
        }
        if has_inclusion && has_exclusion {
            return Err(crate::error::Error::MalformedQuery(
                "cannot mix inclusion and exclusion in $project".into(),
            ));
        }
        let id_excluded = spec
            .get("_id")
            .is_some_and(|v| v.as_i64() == Some(0) || v == &Value::Bool(false));

        if has_exclusion {
            let paths: Vec<String> = spec
                .iter()
                .filter(|(k, _)| k.as_str() != "_id")
                .map(|(k, _)| format!("'{}'", escape_sql(&json_path(k))))
                .collect();
            let mut expr = if paths.is_empty() {
                data_expr.to_string()
            } else {
                format!("json_remove({data_expr}, {})", paths.join(", "))
            };
            if id_excluded {
                expr = format!("json_remove({expr}, '$._id')");
            }
            return Ok(Some((
                format!("SELECT id, {expr} AS data FROM {from}"),
                Vec::new(),
            )));
        }

        let mut parts = Vec::new();
        let mut params = Vec::new();
        if !id_excluded {
            parts.push(format!(
                "'_id', coalesce(json_extract({data_expr}, '$._id'), id)"
            ));
        }
        for (key, value) in spec {
            if key == "_id" {
                continue;
            }
            if key.contains('[') || path_has_numeric_segment(key) {
                return Ok(None);
            }
            let value_sql = if value.as_i64() == Some(1) || value == &Value::Bool(true) {
                stored_field_expr(key)
            } else {
                let parsed = parse_expr(value)
                    .map_err(|e| crate::error::Error::MalformedQuery(e.to_string()))?;
                match expr_to_sql(&parsed) {
                    Some((sql, p)) => {
                        params.extend(p);
                        sql
                    }
                    None => return Ok(None),
                }
            };
            // Dotted inclusion paths need nested reconstruction; leave
            // those to the host tier.
            if key.contains('.') {
                return Ok(None);
            }
            parts.push(format!("'{}', {value_sql}", escape_sql(key)));
        }
        Ok(Some((
            format!(
                "SELECT id, json_object({}) AS data FROM {from}",
                parts.join(", ")
            ),
            params,
        )))
    }

    fn unwind_sql(&self, spec: &UnwindSpec, from: &str, data_expr: &str) -> Option<(String, SqlParams)> {
        if spec.path.contains('[') || path_has_numeric_segment(&spec.path) {
            return None;
        }
        let path = escape_sql(&json_path(&spec.path));
        let base = format!("json_extract({data_expr}, '{path}')");
        let mut doc = format!("json_set({data_expr}, '{path}', je.value)");

        let (source, gate) = if spec.preserve_null_and_empty_arrays {
            let ty = format!("json_type({base})");
            (
                format!(
                    "CASE WHEN {ty} IS NULL THEN NULL \
                     WHEN {ty} = 'null' THEN '[null]' \
                     WHEN {ty} = 'array' AND json_array_length({base}) = 0 THEN '[null]' \
                     ELSE {base} END"
                ),
                None,
            )
        } else {
            (base.clone(), Some(format!("{base} IS NOT NULL")))
        };

        if let Some(index_field) = &spec.include_array_index {
            let index_sql = format!(
                "CASE WHEN json_type({base}) = 'array' AND json_array_length({base}) > 0 \
                 THEN je.key ELSE NULL END"
            );
            doc = format!(
                "json_set({doc}, '{}', {index_sql})",
                escape_sql(&json_path(index_field))
            );
        }

        let mut sql = format!("SELECT id, {doc} AS data FROM {from}, json_each({source}) AS je");
        if let Some(gate) = gate {
            sql.push_str(&format!(" WHERE {gate}"));
        }
        Some((sql, Vec::new()))
    }

    fn group_sql(
        &self,
        id: &Value,
        accumulators: &Document,
        from: &str,
    ) -> Option<(String, SqlParams)> {
        let (key_sql, key_params) = match id {
            Value::Null => ("NULL".to_string(), Vec::new()),
            other => {
                let parsed = parse_expr(other).ok()?;
                expr_to_sql(&parsed)?
            }
        };
        // The key expression is emitted twice (projection and GROUP BY),
        // so its parameters bind twice.
        let mut params = key_params.clone();

        let mut object_parts = vec![format!("'_id', {key_sql}")];
        for (field, acc) in accumulators {
            let acc_doc = acc.as_object()?;
            let (op, arg) = acc_doc.iter().next()?;
            let acc_type = parse_accumulator_type(op).ok()?;
            let mut arg_sql = || -> Option<String> {
                let parsed = parse_expr(arg).ok()?;
                let (sql, p) = expr_to_sql(&parsed)?;
                params.extend(p);
                Some(sql)
            };
            let acc_sql = match acc_type {
                AccumulatorType::Sum => {
                    if arg.as_i64() == Some(1) {
                        "COUNT(*)".to_string()
                    } else {
                        format!("SUM({})", arg_sql()?)
                    }
                }
                AccumulatorType::Count => "COUNT(*)".to_string(),
                AccumulatorType::Avg => format!("AVG({})", arg_sql()?),
                AccumulatorType::Min => format!("MIN({})", arg_sql()?),
                AccumulatorType::Max => format!("MAX({})", arg_sql()?),
                AccumulatorType::Push => format!("json_group_array({})", arg_sql()?),
                AccumulatorType::AddToSet => format!("json_group_array(DISTINCT {})", arg_sql()?),
                // Scan order is the previous stage's materialised order;
                // without a preceding $sort it is the storage order.
                AccumulatorType::First => {
                    format!("json_extract(json_group_array({}), '$[0]')", arg_sql()?)
                }
                AccumulatorType::Last => {
                    format!("json_extract(json_group_array({}), '$[#-1]')", arg_sql()?)
                }
            };
            object_parts.push(format!("'{}', {acc_sql}", escape_sql(field)));
        }
        params.extend(key_params);

        Some((
            format!(
                "SELECT min(id) AS id, json_object({}) AS data FROM {from} GROUP BY {key_sql}",
                object_parts.join(", ")
            ),
            params,
        ))
    }

    fn lookup_sql(&self, spec: &LookupSpec, from: &str, data_expr: &str) -> Option<(String, SqlParams)> {
        if spec.local_field.contains('[')
            || spec.foreign_field.contains('[')
            || path_has_numeric_segment(&spec.local_field)
            || path_has_numeric_segment(&spec.foreign_field)
        {
            return None;
        }
        let local = format!(
            "json_extract({data_expr}, '{}')",
            escape_sql(&json_path(&spec.local_field))
        );
        let subquery = format!(
            "SELECT json_group_array(json(CASE WHEN json_extract(f.data, '$._id') IS NULL \
             THEN json_set(f.data, '$._id', f.id) ELSE f.data END)) \
             FROM {} AS f WHERE json_extract(f.data, '{}') = {local}",
            q_ident(&spec.from),
            escape_sql(&json_path(&spec.foreign_field))
        );
        let doc = format!(
            "json_set({data_expr}, '{}', json(coalesce(({subquery}), '[]')))",
            escape_sql(&json_path(&spec.as_field))
        );
        Some((format!("SELECT id, {doc} AS data FROM {from}"), Vec::new()))
    }
}

enum SourceTable {
    Base,
    Temp(String),
}

fn stored_field_expr(field: &str) -> String {
    if field == "_id" {
        "coalesce(json_extract(data, '$._id'), id)".to_string()
    } else {
        field_expr(field)
    }
}

fn query_mentions(query: &Document, operator: &str) -> bool {
    fn value_mentions(value: &Value, operator: &str) -> bool {
        match value {
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| k == operator || value_mentions(v, operator)),
            Value::Array(items) => items.iter().any(|v| value_mentions(v, operator)),
            _ => false,
        }
    }
    query
        .iter()
        .any(|(k, v)| k == operator || value_mentions(v, operator))
}
