//! Single-statement SQL aggregation for recognised pipeline patterns:
//! `$match`, `$sort`/`$skip`/`$limit`, chained `$unwind` over nested
//! paths via `json_each`, `$unwind`+`$group` with supported
//! accumulators, and `$lookup` as a correlated subquery. Anything else
//! declines and the staged tiers take over.

use crate::aggregation::pipeline::{LookupSpec, Stage, UnwindSpec};
use crate::aggregation::stages::group::{AccumulatorType, parse_accumulator_type};
use crate::document::Document;
use crate::error::Result;
use crate::store::q_ident;
use crate::translate::{
    ClauseBuilder, SqlParams, escape_sql, field_expr, json_path, parse_sort_spec,
    path_has_numeric_segment,
};
use serde_json::Value;

struct UnwindJoin {
    spec: UnwindSpec,
    alias: String,
    /// Path segments below the parent unwind, or the full path when the
    /// unwind roots at the document.
    source_sql: String,
    gate_sql: Option<String>,
    index_sql: String,
}

pub struct Tier1Builder<'a> {
    coll: &'a str,
    fts_tables: &'a [String],
    has_regexp: bool,
    /// Read expression for the document column (`json(data)` under
    /// JSONB storage).
    data_expr: &'a str,
}

impl<'a> Tier1Builder<'a> {
    pub fn new(
        coll: &'a str,
        fts_tables: &'a [String],
        has_regexp: bool,
        data_expr: &'a str,
    ) -> Self {
        Self {
            coll,
            fts_tables,
            has_regexp,
            data_expr,
        }
    }

    /// Attempt to encode the whole pipeline as one SQL statement
    /// producing `(id, data)` rows.
    pub fn build(&self, stages: &[Stage]) -> Result<Option<(String, SqlParams)>> {
        let mut where_clauses: Vec<String> = Vec::new();
        let mut params: SqlParams = Vec::new();
        let mut unwinds: Vec<UnwindJoin> = Vec::new();
        let mut lookups: Vec<LookupSpec> = Vec::new();
        let mut group: Option<(String, Vec<(String, String)>)> = None;
        let mut order_sql: Option<String> = None;
        let mut limit: Option<i64> = None;
        let mut offset: Option<i64> = None;
        let mut open_for_match = true;

        for stage in stages {
            match stage {
                Stage::Match(query) => {
                    if !open_for_match {
                        return Ok(None);
                    }
                    let builder = ClauseBuilder::new(self.fts_tables, self.has_regexp);
                    match builder.build(query)? {
                        Some((sql, p)) if !sql.is_empty() => {
                            where_clauses.push(format!("({sql})"));
                            params.extend(p);
                        }
                        Some(_) => {}
                        None => return Ok(None),
                    }
                }
                Stage::Unwind(spec) => {
                    // An unwind over a looked-up field would read `data`,
                    // where the joined array does not exist.
                    if group.is_some()
                        || order_sql.is_some()
                        || limit.is_some()
                        || offset.is_some()
                        || !lookups.is_empty()
                    {
                        return Ok(None);
                    }
                    open_for_match = false;
                    match self.push_unwind(spec, &mut unwinds) {
                        Some(()) => {}
                        None => return Ok(None),
                    }
                }
                Stage::Group { id, accumulators } => {
                    if group.is_some()
                        || order_sql.is_some()
                        || limit.is_some()
                        || offset.is_some()
                        || !lookups.is_empty()
                    {
                        return Ok(None);
                    }
                    open_for_match = false;
                    match self.build_group(id, accumulators, &unwinds) {
                        Some(g) => group = Some(g),
                        None => return Ok(None),
                    }
                }
                Stage::Sort(spec) => {
                    if group.is_some() || limit.is_some() || offset.is_some() {
                        return Ok(None);
                    }
                    open_for_match = false;
                    let sort_spec = parse_sort_spec(spec)?;
                    let mut parts = Vec::new();
                    for (field, dir) in &sort_spec {
                        let references_lookup = lookups.iter().any(|l| {
                            field == &l.as_field
                                || field.starts_with(&format!("{}.", l.as_field))
                        });
                        if references_lookup {
                            return Ok(None);
                        }
                        let Some(expr) = self.resolve_field(field, &unwinds) else {
                            return Ok(None);
                        };
                        let ord = if *dir < 0 { "DESC" } else { "ASC" };
                        parts.push(format!("{expr} {ord}"));
                    }
                    order_sql = Some(parts.join(", "));
                }
                Stage::Skip(n) => {
                    if offset.is_some() || limit.is_some() {
                        return Ok(None);
                    }
                    open_for_match = false;
                    offset = Some(*n);
                }
                Stage::Limit(n) => {
                    if limit.is_some() {
                        return Ok(None);
                    }
                    open_for_match = false;
                    limit = Some(*n);
                }
                Stage::Lookup(spec) => {
                    if group.is_some() {
                        return Ok(None);
                    }
                    open_for_match = false;
                    if spec.local_field.contains('[')
                        || spec.foreign_field.contains('[')
                        || path_has_numeric_segment(&spec.local_field)
                        || path_has_numeric_segment(&spec.foreign_field)
                    {
                        return Ok(None);
                    }
                    lookups.push(spec.clone());
                }
                Stage::Project(_) | Stage::AddFields(_) | Stage::ReplaceRoot(_) => {
                    return Ok(None);
                }
            }
        }

        // Assemble FROM clause.
        let mut from = q_ident(self.coll).to_string();
        for join in &unwinds {
            from.push_str(&format!(", json_each({}) AS {}", join.source_sql, join.alias));
            if let Some(gate) = &join.gate_sql {
                where_clauses.push(gate.clone());
            }
        }

        let select = match &group {
            Some((key_sql, pairs)) => {
                let mut object_parts = vec![format!("'_id', {key_sql}")];
                for (field, acc_sql) in pairs {
                    object_parts.push(format!("'{}', {}", escape_sql(field), acc_sql));
                }
                format!(
                    "SELECT min(id) AS id, json_object({}) AS data",
                    object_parts.join(", ")
                )
            }
            None => {
                let doc_expr = self.doc_expr(&unwinds, &lookups);
                format!("SELECT id, {doc_expr} AS data")
            }
        };

        let mut sql = format!("{select} FROM {from}");
        if !where_clauses.is_empty() {
            sql.push_str(&format!(" WHERE {}", where_clauses.join(" AND ")));
        }
        if let Some((key_sql, _)) = &group {
            sql.push_str(&format!(" GROUP BY {key_sql}"));
        }
        match (&order_sql, &group) {
            (Some(order), _) => sql.push_str(&format!(" ORDER BY {order}")),
            // Unwound rows already scan in document-major, element-minor
            // order; an ORDER BY would not preserve the element order.
            (None, None) if unwinds.is_empty() => sql.push_str(" ORDER BY id"),
            _ => {}
        }
        match (limit, offset) {
            (Some(l), Some(o)) => sql.push_str(&format!(" LIMIT {l} OFFSET {o}")),
            (Some(l), None) => sql.push_str(&format!(" LIMIT {l}")),
            (None, Some(o)) => sql.push_str(&format!(" LIMIT -1 OFFSET {o}")),
            (None, None) => {}
        }

        tracing::debug!(op = "tier1_sql", collection = %self.coll, sql = %sql);
        Ok(Some((sql, params)))
    }

    fn push_unwind(&self, spec: &UnwindSpec, unwinds: &mut Vec<UnwindJoin>) -> Option<()> {
        if spec.path.contains('[') || path_has_numeric_segment(&spec.path) {
            return None;
        }
        let alias = format!("je{}", unwinds.len() + 1);

        // Nested unwinds read from the parent's unwound value.
        let parent = unwinds.iter().rev().find(|join| {
            spec.path.starts_with(&join.spec.path)
                && spec.path[join.spec.path.len()..].starts_with('.')
        });
        let source_base = match parent {
            Some(parent) => {
                let rest = &spec.path[parent.spec.path.len() + 1..];
                format!(
                    "json_extract({}.value, '{}')",
                    parent.alias,
                    escape_sql(&json_path(rest))
                )
            }
            None => field_expr(&spec.path),
        };

        let (source_sql, gate_sql, index_guard) = if spec.preserve_null_and_empty_arrays {
            // Explicit null and [] produce one null element; an absent
            // field produces no rows (json_each over SQL NULL).
            let ty = format!("json_type({source_base})");
            let source = format!(
                "CASE WHEN {ty} IS NULL THEN NULL \
                 WHEN {ty} = 'null' THEN '[null]' \
                 WHEN {ty} = 'array' AND json_array_length({source_base}) = 0 THEN '[null]' \
                 ELSE {source_base} END"
            );
            let guard = format!("{ty} = 'array' AND json_array_length({source_base}) > 0");
            (source, None, Some(guard))
        } else {
            (
                source_base.clone(),
                Some(format!("{source_base} IS NOT NULL")),
                None,
            )
        };

        let index_sql = match &index_guard {
            Some(guard) => format!("CASE WHEN {guard} THEN {alias}.key ELSE NULL END"),
            None => format!(
                "CASE WHEN json_type({source_base}) = 'array' THEN {alias}.key ELSE NULL END"
            ),
        };

        unwinds.push(UnwindJoin {
            spec: spec.clone(),
            alias,
            source_sql,
            gate_sql,
            index_sql,
        });
        Some(())
    }

    /// Document expression with every unwound value and lookup result
    /// patched back in.
    fn doc_expr(&self, unwinds: &[UnwindJoin], lookups: &[LookupSpec]) -> String {
        let mut expr = self.data_expr.to_string();
        for join in unwinds {
            expr = format!(
                "json_set({expr}, '{}', {}.value)",
                escape_sql(&json_path(&join.spec.path)),
                join.alias
            );
            if let Some(index_field) = &join.spec.include_array_index {
                expr = format!(
                    "json_set({expr}, '{}', {})",
                    escape_sql(&json_path(index_field)),
                    join.index_sql
                );
            }
        }
        for lookup in lookups {
            let local = self
                .resolve_field(&lookup.local_field, unwinds)
                .unwrap_or_else(|| field_expr(&lookup.local_field));
            let subquery = format!(
                "SELECT json_group_array(json(CASE WHEN json_extract(f.data, '$._id') IS NULL \
                 THEN json_set(f.data, '$._id', f.id) ELSE f.data END)) \
                 FROM {} AS f WHERE json_extract(f.data, '{}') = {}",
                q_ident(&lookup.from),
                escape_sql(&json_path(&lookup.foreign_field)),
                local
            );
            expr = format!(
                "json_set({expr}, '{}', json(coalesce(({subquery}), '[]')))",
                escape_sql(&json_path(&lookup.as_field))
            );
        }
        expr
    }

    /// SQL expression reading a field, honouring the unwind chain.
    fn resolve_field(&self, field: &str, unwinds: &[UnwindJoin]) -> Option<String> {
        if field.contains('[') || path_has_numeric_segment(field) {
            return None;
        }
        for join in unwinds.iter().rev() {
            if field == join.spec.path {
                return Some(format!("{}.value", join.alias));
            }
            if field.starts_with(&join.spec.path)
                && field[join.spec.path.len()..].starts_with('.')
            {
                let rest = &field[join.spec.path.len() + 1..];
                return Some(format!(
                    "json_extract({}.value, '{}')",
                    join.alias,
                    escape_sql(&json_path(rest))
                ));
            }
            if join.spec.include_array_index.as_deref() == Some(field) {
                return Some(join.index_sql.clone());
            }
        }
        if field == "_id" {
            return Some("coalesce(json_extract(data, '$._id'), id)".to_string());
        }
        Some(field_expr(field))
    }

    /// GROUP BY key and accumulator SQL. Only field references (and the
    /// null key) are Tier-1 group keys; expressions decline.
    fn build_group(
        &self,
        id: &Value,
        accumulators: &Document,
        unwinds: &[UnwindJoin],
    ) -> Option<(String, Vec<(String, String)>)> {
        let key_sql = match id {
            Value::Null => "NULL".to_string(),
            Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
                self.resolve_field(&s[1..], unwinds)?
            }
            _ => return None,
        };

        let mut pairs = Vec::new();
        for (field, acc) in accumulators {
            let acc_doc = acc.as_object()?;
            let (op, arg) = acc_doc.iter().next()?;
            let acc_type = parse_accumulator_type(op).ok()?;
            let arg_sql = match arg {
                Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
                    Some(self.resolve_field(&s[1..], unwinds)?)
                }
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
            let acc_sql = match acc_type {
                AccumulatorType::Sum => {
                    let arg_sql = arg_sql?;
                    if arg_sql == "1" {
                        "COUNT(*)".to_string()
                    } else {
                        format!("SUM({arg_sql})")
                    }
                }
                AccumulatorType::Count => "COUNT(*)".to_string(),
                AccumulatorType::Avg => format!("AVG({})", arg_sql?),
                AccumulatorType::Min => format!("MIN({})", arg_sql?),
                AccumulatorType::Max => format!("MAX({})", arg_sql?),
                AccumulatorType::Push => format!("json_group_array({})", arg_sql?),
                AccumulatorType::AddToSet => {
                    format!("json_group_array(DISTINCT {})", arg_sql?)
                }
                AccumulatorType::First | AccumulatorType::Last => return None,
            };
            pairs.push((field.clone(), acc_sql));
        }
        Some((key_sql, pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::pipeline::parse_pipeline;
    use serde_json::json;

    fn build(pipeline: serde_json::Value) -> Option<(String, SqlParams)> {
        let stages = parse_pipeline(pipeline.as_array().unwrap()).unwrap();
        Tier1Builder::new("items", &[], true, "data")
            .build(&stages)
            .unwrap()
    }

    #[test]
    fn match_sort_limit_single_statement() {
        let (sql, params) = build(json!([
            {"$match": {"status": "active"}},
            {"$sort": {"price": -1}},
            {"$skip": 2},
            {"$limit": 10}
        ]))
        .unwrap();
        assert!(sql.contains("WHERE"));
        assert!(sql.contains("ORDER BY"));
        assert!(sql.contains("DESC"));
        assert!(sql.contains("LIMIT 10 OFFSET 2"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn unwind_uses_json_each() {
        let (sql, _) = build(json!([{"$unwind": "$tags"}])).unwrap();
        assert!(sql.contains("json_each("));
        assert!(sql.contains("json_set(data"));
        assert!(sql.contains("IS NOT NULL"));
    }

    #[test]
    fn nested_unwind_chains_aliases() {
        let (sql, _) = build(json!([
            {"$unwind": "$orders"},
            {"$unwind": "$orders.items"}
        ]))
        .unwrap();
        assert!(sql.contains("je1"));
        assert!(sql.contains("je2"));
        assert!(sql.contains("json_extract(je1.value"));
    }

    #[test]
    fn unwind_group_push() {
        let (sql, _) = build(json!([
            {"$unwind": "$tags"},
            {"$group": {"_id": "$cat", "t": {"$push": "$tags"}}}
        ]))
        .unwrap();
        assert!(sql.contains("GROUP BY"));
        assert!(sql.contains("json_group_array(je1.value)"));
        assert!(sql.contains("min(id)"));
    }

    #[test]
    fn lookup_is_correlated_subquery() {
        let (sql, _) = build(json!([
            {"$lookup": {"from": "products", "localField": "item", "foreignField": "sku", "as": "product"}}
        ]))
        .unwrap();
        assert!(sql.contains("json_group_array"));
        assert!(sql.contains(r#""products" AS f"#));
        assert!(sql.contains("coalesce"));
    }

    #[test]
    fn project_declines() {
        assert!(build(json!([{"$project": {"a": 1}}])).is_none());
    }

    #[test]
    fn group_expression_key_declines() {
        assert!(build(json!([
            {"$group": {"_id": {"$toUpper": "$cat"}, "n": {"$sum": 1}}}
        ]))
        .is_none());
    }

    #[test]
    fn match_after_unwind_declines() {
        assert!(build(json!([
            {"$unwind": "$tags"},
            {"$match": {"tags": "x"}}
        ]))
        .is_none());
    }
}
