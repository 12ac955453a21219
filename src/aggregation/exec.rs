//! Tier selection and the host-code (Tier-3) pipeline executor.
//!
//! Execution order: with the kill switch off, try the single-statement
//! tier, then the temp-table tier; stages the staged tier cannot encode
//! run host-side over the last materialised table. With the kill switch
//! on, everything runs host-side.

use crate::aggregation::pipeline::Stage;
use crate::aggregation::stages;
use crate::aggregation::temp_table::{TempTableGuard, TempTableProcessor};
use crate::aggregation::tier1::Tier1Builder;
use crate::document::{Document, decode_document};
use crate::error::{Error, Result};
use crate::fallback::FallbackConfig;
use crate::matcher::Matcher;
use crate::store::{SqliteStore, q_ident};
use crate::translate::SqlParams;

/// Everything pipeline execution needs to know about its collection.
pub struct ExecContext<'a> {
    pub store: &'a SqliteStore,
    pub coll: String,
    pub fts_tables: Vec<String>,
    pub fallback: FallbackConfig,
}

impl<'a> ExecContext<'a> {
    /// Fields covered by companion text indexes, recovered from the
    /// `<coll>_fts_<field>` naming shape.
    pub fn text_fields(&self) -> Vec<String> {
        let prefix = format!("{}_fts_", self.coll);
        self.fts_tables
            .iter()
            .filter_map(|t| t.strip_prefix(&prefix))
            .map(str::to_string)
            .collect()
    }
}

/// Execute a pipeline. The returned guard (if any) owns temp tables and
/// must live until the caller is done with the results.
pub fn execute_pipeline(
    ctx: &ExecContext<'_>,
    stages: &[Stage],
) -> Result<(Vec<Document>, Option<TempTableGuard>)> {
    if ctx.fallback.effective() {
        tracing::debug!(op = "aggregate", tier = 3, collection = %ctx.coll, forced = true);
        let docs = load_collection(ctx.store, &ctx.coll)?;
        let docs = apply_stages(ctx, docs, stages)?;
        return Ok((docs, None));
    }

    let tier1 = Tier1Builder::new(
        &ctx.coll,
        &ctx.fts_tables,
        ctx.store.has_regexp(),
        ctx.store.data_read_expr(),
    );
    if let Some((sql, params)) = tier1.build(stages)? {
        tracing::debug!(op = "aggregate", tier = 1, collection = %ctx.coll);
        return Ok((run_rows(ctx.store, &sql, params)?, None));
    }

    let processor = TempTableProcessor::new(ctx.store, &ctx.coll, &ctx.fts_tables);
    let staged = processor.process(stages)?;
    tracing::debug!(
        op = "aggregate",
        tier = 2,
        collection = %ctx.coll,
        staged = stages.len() - staged.remaining.len(),
        remaining = staged.remaining.len()
    );

    let docs = match &staged.last_table {
        Some(table) => {
            let sql = format!("SELECT id, data FROM {} ORDER BY rowid", q_ident(table));
            run_rows(ctx.store, &sql, Vec::new())?
        }
        None => load_collection(ctx.store, &ctx.coll)?,
    };
    let docs = apply_stages(ctx, docs, &staged.remaining)?;
    Ok((docs, Some(staged.guard)))
}

/// Apply stages in host code over decoded documents (Tier-3).
pub fn apply_stages(
    ctx: &ExecContext<'_>,
    mut docs: Vec<Document>,
    stages: &[Stage],
) -> Result<Vec<Document>> {
    for stage in stages {
        docs = match stage {
            Stage::Match(query) => {
                let text_fields = ctx.text_fields();
                let matcher = Matcher::new(&text_fields);
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matcher.matches(&doc, query)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            Stage::Project(spec) => stages::project::execute(docs, spec).map_err(stage_err)?,
            Stage::AddFields(spec) => {
                stages::add_fields::execute(docs, spec).map_err(stage_err)?
            }
            Stage::ReplaceRoot(replacement) => {
                stages::replace_root::execute(docs, replacement).map_err(stage_err)?
            }
            Stage::Unwind(spec) => stages::unwind::execute(docs, spec).map_err(stage_err)?,
            Stage::Group { id, accumulators } => {
                stages::group::execute(docs, id, accumulators).map_err(stage_err)?
            }
            Stage::Sort(spec) => stages::sort::execute(docs, spec).map_err(stage_err)?,
            Stage::Skip(n) => stages::skip::execute(docs, *n).map_err(stage_err)?,
            Stage::Limit(n) => stages::limit::execute(docs, *n).map_err(stage_err)?,
            Stage::Lookup(spec) => {
                let foreign = load_collection(ctx.store, &spec.from)?;
                stages::lookup::execute(docs, &foreign, spec).map_err(stage_err)?
            }
        };
    }
    Ok(docs)
}

fn stage_err(e: anyhow::Error) -> Error {
    Error::MalformedQuery(e.to_string())
}

pub fn load_collection(store: &SqliteStore, coll: &str) -> Result<Vec<Document>> {
    store
        .fetch_all(coll)?
        .into_iter()
        .map(|(id, data)| decode_document(id, &data))
        .collect()
}

fn run_rows(store: &SqliteStore, sql: &str, params: SqlParams) -> Result<Vec<Document>> {
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
