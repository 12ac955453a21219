//! Single-shot query orchestration: picks between SQL and host-side
//! evaluation for find/count/update/delete, routes datetime-typed
//! predicates through the datetime processor, and reports cost
//! estimates for the chosen plan.

use crate::aggregation::optimizer::estimate_predicate_cost;
use crate::aggregation::stages::sort as sort_stage;
use crate::datetime::{DateTimeQueryProcessor, datetime_matches, query_involves_datetime};
use crate::document::{Document, decode_document, encode_document};
use crate::error::{Error, Result};
use crate::fallback::FallbackConfig;
use crate::index::IndexManager;
use crate::matcher::Matcher;
use crate::store::{SqliteStore, q_ident};
use crate::translate::{ClauseBuilder, build_order_by, parse_sort_spec};
use crate::update::{
    UpdateTranslator, apply_update, apply_update_on_insert, seed_from_filter, validate_update,
};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Value>,
}

pub struct QueryHelper<'a> {
    store: &'a SqliteStore,
    coll: String,
    fallback: FallbackConfig,
}

impl<'a> QueryHelper<'a> {
    pub fn new(store: &'a SqliteStore, coll: &str, fallback: FallbackConfig) -> Self {
        Self {
            store,
            coll: coll.to_string(),
            fallback,
        }
    }

    fn indexes(&self) -> IndexManager<'_> {
        IndexManager::new(self.store, &self.coll)
    }

    fn text_fields(&self, fts_tables: &[String]) -> Vec<String> {
        let prefix = format!("{}_fts_", self.coll);
        fts_tables
            .iter()
            .filter_map(|t| t.strip_prefix(&prefix))
            .map(str::to_string)
            .collect()
    }

    pub fn find_docs(
        &self,
        filter: &Document,
        sort: Option<&Document>,
        skip: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        let fts_tables = self.indexes().fts_tables()?;

        if self.fallback.effective() {
            return self.find_host(filter, sort, skip, limit, &fts_tables);
        }

        if query_involves_datetime(filter) {
            let processor = DateTimeQueryProcessor::new(self.store, self.fallback);
            let docs = processor.process(&self.coll, filter)?;
            return apply_sort_skip_limit(docs, sort, skip, limit);
        }

        let builder = ClauseBuilder::new(&fts_tables, self.store.has_regexp());
        let Some((where_sql, params)) = builder.build(filter)? else {
            return self.find_host(filter, sort, skip, limit, &fts_tables);
        };

        let indexed = self.indexes().indexed_paths()?;
        let cost = estimate_predicate_cost(filter, &indexed);
        tracing::debug!(op = "find", collection = %self.coll, tier = "sql", cost);

        let order = match sort {
            Some(spec) => {
                let parsed = parse_sort_spec(spec)?;
                let host_only = parsed.iter().any(|(field, _)| {
                    field.contains('[') || crate::translate::path_has_numeric_segment(field)
                });
                if host_only {
                    return self.find_host(filter, sort, skip, limit, &fts_tables);
                }
                build_order_by(&parsed)
            }
            None => "ORDER BY id".to_string(),
        };

        let mut sql = format!(
            "SELECT id, {} FROM {}",
            self.store.data_read_expr(),
            q_ident(&self.coll)
        );
        if !where_sql.is_empty() {
            sql.push_str(&format!(" WHERE {where_sql}"));
        }
        if !order.is_empty() {
            sql.push_str(&format!(" {order}"));
        }
        match (limit, skip) {
            (Some(l), Some(s)) => sql.push_str(&format!(" LIMIT {l} OFFSET {s}")),
            (Some(l), None) => sql.push_str(&format!(" LIMIT {l}")),
            (None, Some(s)) => sql.push_str(&format!(" LIMIT -1 OFFSET {s}")),
            (None, None) => {}
        }

        let conn = self.store.lock();
        let mut stmt = conn.prepare(&sql)?;
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

    fn find_host(
        &self,
        filter: &Document,
        sort: Option<&Document>,
        skip: Option<i64>,
        limit: Option<i64>,
        fts_tables: &[String],
    ) -> Result<Vec<Document>> {
        tracing::debug!(op = "find", collection = %self.coll, tier = "host");
        let text_fields = self.text_fields(fts_tables);
        let matcher = Matcher::new(&text_fields);
        let datetime = query_involves_datetime(filter);
        let mut docs = Vec::new();
        for (id, data) in self.store.fetch_all(&self.coll)? {
            let doc = decode_document(id, &data)?;
            let matched = if datetime {
                datetime_matches(&doc, filter)?
            } else {
                matcher.matches(&doc, filter)?
            };
            if matched {
                docs.push(doc);
            }
        }
        apply_sort_skip_limit(docs, sort, skip, limit)
    }

    pub fn count(&self, filter: &Document) -> Result<i64> {
        if filter.is_empty() {
            return self.store.count_rows(&self.coll);
        }
        Ok(self.find_docs(filter, None, None, None)?.len() as i64)
    }

    pub fn distinct(&self, field: &str, filter: &Document) -> Result<Vec<Value>> {
        let docs = self.find_docs(filter, None, None, None)?;
        let mut out: Vec<Value> = Vec::new();
        for doc in &docs {
            let Some(value) = crate::matcher::resolve_path(doc, field) else {
                continue;
            };
            let candidates: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for v in candidates {
                if !out
                    .iter()
                    .any(|existing| crate::aggregation::values_equal(existing, v))
                {
                    out.push(v.clone());
                }
            }
        }
        Ok(out)
    }

    /// Row ids of matching documents, in id order.
    pub fn matching_ids(&self, filter: &Document, limit: Option<i64>) -> Result<Vec<i64>> {
        let fts_tables = self.indexes().fts_tables()?;
        let use_host = self.fallback.effective() || query_involves_datetime(filter);
        if !use_host {
            let builder = ClauseBuilder::new(&fts_tables, self.store.has_regexp());
            if let Some((where_sql, params)) = builder.build(filter)? {
                let mut sql = format!("SELECT id FROM {}", q_ident(&self.coll));
                if !where_sql.is_empty() {
                    sql.push_str(&format!(" WHERE {where_sql}"));
                }
                sql.push_str(" ORDER BY id");
                if let Some(l) = limit {
                    sql.push_str(&format!(" LIMIT {l}"));
                }
                let conn = self.store.lock();
                let mut stmt = conn.prepare(&sql)?;
                let ids = stmt
                    .query_map(rusqlite::params_from_iter(params), |row| {
                        row.get::<_, i64>(0)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                return Ok(ids);
            }
        }

        let text_fields = self.text_fields(&fts_tables);
        let matcher = Matcher::new(&text_fields);
        let datetime = query_involves_datetime(filter);
        let mut ids = Vec::new();
        for (id, data) in self.store.fetch_all(&self.coll)? {
            let doc = decode_document(id, &data)?;
            let matched = if datetime {
                datetime_matches(&doc, filter)?
            } else {
                matcher.matches(&doc, filter)?
            };
            if matched {
                ids.push(id);
                if limit.is_some_and(|l| ids.len() as i64 >= l) {
                    break;
                }
            }
        }
        Ok(ids)
    }

    /// Apply an update to matching rows. SQL-translatable operators run
    /// as a single `UPDATE` with a change guard so identity updates
    /// report zero modifications; the rest go through the host applier.
    pub fn update(
        &self,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        validate_update(update)?;
        let limit = if multi { None } else { Some(1) };
        let ids = self.matching_ids(filter, limit)?;

        if ids.is_empty() {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            return self.upsert_insert(filter, update);
        }

        let translator = UpdateTranslator::new(self.store.jsonb_supported());
        let fragment = if self.fallback.effective() {
            None
        } else {
            translator.build(update)?
        };

        match fragment {
            Some((frag, frag_params)) => {
                let placeholders = vec!["?"; ids.len()].join(",");
                let sql = format!(
                    "UPDATE {} SET data = {frag} WHERE id IN ({placeholders}) \
                     AND json(data) IS NOT json({frag})",
                    q_ident(&self.coll)
                );
                let mut params: Vec<SqlValue> = frag_params.clone();
                params.extend(ids.iter().map(|id| SqlValue::Integer(*id)));
                params.extend(frag_params);
                let conn = self.store.lock();
                let modified = conn.execute(&sql, rusqlite::params_from_iter(params))?;
                tracing::debug!(op = "update", collection = %self.coll, tier = "sql",
                    matched = ids.len(), modified);
                Ok(UpdateOutcome {
                    matched_count: ids.len() as u64,
                    modified_count: modified as u64,
                    upserted_id: None,
                })
            }
            None => {
                let mut modified = 0u64;
                for id in &ids {
                    let Some(data) = self.row_data(*id)? else {
                        continue;
                    };
                    let mut doc = decode_document(*id, &data)?;
                    if apply_update(&mut doc, update)? {
                        self.write_back(*id, &doc)?;
                        modified += 1;
                    }
                }
                tracing::debug!(op = "update", collection = %self.coll, tier = "host",
                    matched = ids.len(), modified);
                Ok(UpdateOutcome {
                    matched_count: ids.len() as u64,
                    modified_count: modified,
                    upserted_id: None,
                })
            }
        }
    }

    fn upsert_insert(&self, filter: &Document, update: &Document) -> Result<UpdateOutcome> {
        let mut doc = seed_from_filter(filter);
        apply_update_on_insert(&mut doc, update)?;
        let explicit_id = doc.get("_id").cloned();
        let json = encode_document(&doc)?;
        let row_id = self.store.insert_row(&self.coll, &json)?;
        let upserted_id = explicit_id.unwrap_or(Value::from(row_id));
        tracing::debug!(op = "upsert", collection = %self.coll, row_id);
        Ok(UpdateOutcome {
            matched_count: 0,
            modified_count: 0,
            upserted_id: Some(upserted_id),
        })
    }

    /// Replace the whole document of the first matching row, keeping
    /// the row id.
    pub fn replace(
        &self,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(Error::MalformedQuery(
                "replacement document must not contain operators".into(),
            ));
        }
        let ids = self.matching_ids(filter, Some(1))?;
        let Some(id) = ids.first() else {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let json = encode_document(replacement)?;
            let row_id = self.store.insert_row(&self.coll, &json)?;
            let upserted_id = replacement
                .get("_id")
                .cloned()
                .unwrap_or(Value::from(row_id));
            return Ok(UpdateOutcome {
                matched_count: 0,
                modified_count: 0,
                upserted_id: Some(upserted_id),
            });
        };

        let old = self.row_data(*id)?;
        let old_doc = old
            .as_deref()
            .map(|data| decode_document(*id, data))
            .transpose()?;
        let mut new_doc = replacement.clone();
        if let Some(old_doc) = &old_doc {
            if !new_doc.contains_key("_id") {
                if let Some(old_id) = old_doc.get("_id") {
                    new_doc.insert("_id".to_string(), old_id.clone());
                }
            }
        }
        let changed = old_doc.as_ref() != Some(&new_doc);
        if changed {
            self.write_back(*id, &new_doc)?;
        }
        Ok(UpdateOutcome {
            matched_count: 1,
            modified_count: changed as u64,
            upserted_id: None,
        })
    }

    pub fn delete(&self, filter: &Document, multi: bool) -> Result<u64> {
        let limit = if multi { None } else { Some(1) };
        let ids = self.matching_ids(filter, limit)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let conn = self.store.lock();
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE id IN ({placeholders})",
                q_ident(&self.coll)
            ),
            rusqlite::params_from_iter(ids.iter().map(|id| SqlValue::Integer(*id))),
        )?;
        tracing::debug!(op = "delete", collection = %self.coll, deleted);
        Ok(deleted as u64)
    }

    pub fn row_data(&self, id: i64) -> Result<Option<String>> {
        let conn = self.store.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?",
                    self.store.data_read_expr(),
                    q_ident(&self.coll)
                ),
                [id],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    pub fn write_back(&self, id: i64, doc: &Document) -> Result<()> {
        let json = encode_document(doc)?;
        let conn = self.store.lock();
        conn.execute(
            &format!(
                "UPDATE {} SET data = {} WHERE id = ?",
                q_ident(&self.coll),
                self.store.data_write_expr()
            ),
            rusqlite::params![json, id],
        )?;
        Ok(())
    }
}

pub fn apply_sort_skip_limit(
    docs: Vec<Document>,
    sort: Option<&Document>,
    skip: Option<i64>,
    limit: Option<i64>,
) -> Result<Vec<Document>> {
    let mut docs = match sort {
        Some(spec) => {
            sort_stage::execute(docs, spec).map_err(|e| Error::MalformedQuery(e.to_string()))?
        }
        None => docs,
    };
    if let Some(skip) = skip {
        docs = docs.into_iter().skip(skip.max(0) as usize).collect();
    }
    if let Some(limit) = limit {
        docs = docs.into_iter().take(limit.max(0) as usize).collect();
    }
    Ok(docs)
}
