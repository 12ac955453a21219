//! Index management: SQL expression indexes over JSON paths (compound
//! and unique included), FTS5 companion tables with sync triggers, and
//! discovery of indexed paths from `sqlite_master`.

use crate::error::{Error, Result};
use crate::store::{SqliteStore, q_ident};
use crate::translate::{escape_sql, json_path};
use std::collections::HashSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub unique: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Vec<(String, i64)>,
    pub unique: bool,
    pub fts: bool,
}

pub struct IndexManager<'a> {
    store: &'a SqliteStore,
    coll: &'a str,
}

impl<'a> IndexManager<'a> {
    pub fn new(store: &'a SqliteStore, coll: &'a str) -> Self {
        Self { store, coll }
    }

    /// Create an expression index over one or more JSON paths. Returns
    /// the index name.
    pub fn create_index(&self, keys: &[(&str, i64)], options: &IndexOptions) -> Result<String> {
        if keys.is_empty() {
            return Err(Error::MalformedQuery("index requires at least one key".into()));
        }
        let name = options.name.clone().unwrap_or_else(|| {
            let fields: Vec<String> = keys
                .iter()
                .map(|(field, _)| field.replace('.', "_"))
                .collect();
            format!("idx_{}_{}", self.coll, fields.join("_"))
        });
        let columns: Vec<String> = keys
            .iter()
            .map(|(field, dir)| {
                let expr = format!("json_extract(data, '{}')", escape_sql(&json_path(field)));
                if *dir < 0 {
                    format!("{expr} DESC")
                } else {
                    expr
                }
            })
            .collect();
        let unique = if options.unique { "UNIQUE " } else { "" };
        let ddl = format!(
            "CREATE {unique}INDEX IF NOT EXISTS {} ON {} ({})",
            q_ident(&name),
            q_ident(self.coll),
            columns.join(", ")
        );
        self.store.lock().execute_batch(&ddl)?;
        tracing::debug!(op = "create_index", collection = %self.coll, index = %name, unique = options.unique);
        Ok(name)
    }

    /// Create an FTS5 companion table for a field, with `ai`/`au`/`ad`
    /// triggers mirroring the base table. Returns the table name.
    pub fn create_fts_index(&self, field: &str, tokenizer: Option<&str>) -> Result<String> {
        if let Some(name) = tokenizer {
            if !self.store.tokenizers().iter().any(|t| t == name) {
                return Err(Error::UnsupportedOperation(format!(
                    "tokenizer {name:?} was not registered at connection open"
                )));
            }
        }
        let table = fts_table_name(self.coll, field);
        let column = field.replace('.', "_");
        let tokenize = tokenizer
            .map(|t| format!(", tokenize = '{}'", escape_sql(t)))
            .unwrap_or_default();
        let extract = format!("json_extract(data, '{}')", escape_sql(&json_path(field)));

        let conn = self.store.lock();
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5({}{tokenize})",
            q_ident(&table),
            q_ident(&column)
        ))?;
        conn.execute_batch(&format!(
            "INSERT INTO {fts}(rowid, {col}) \
             SELECT id, {extract} FROM {base} WHERE {extract} IS NOT NULL",
            fts = q_ident(&table),
            col = q_ident(&column),
            base = q_ident(self.coll)
        ))?;
        for (suffix, body) in [
            (
                "ai",
                format!(
                    "INSERT INTO {fts}(rowid, {col}) \
                     SELECT new.id, json_extract(new.data, '{path}') \
                     WHERE json_extract(new.data, '{path}') IS NOT NULL;",
                    fts = q_ident(&table),
                    col = q_ident(&column),
                    path = escape_sql(&json_path(field))
                ),
            ),
            (
                "ad",
                format!("DELETE FROM {fts} WHERE rowid = old.id;", fts = q_ident(&table)),
            ),
            (
                "au",
                format!(
                    "DELETE FROM {fts} WHERE rowid = old.id; \
                     INSERT INTO {fts}(rowid, {col}) \
                     SELECT new.id, json_extract(new.data, '{path}') \
                     WHERE json_extract(new.data, '{path}') IS NOT NULL;",
                    fts = q_ident(&table),
                    col = q_ident(&column),
                    path = escape_sql(&json_path(field))
                ),
            ),
        ] {
            let event = match suffix {
                "ai" => "AFTER INSERT",
                "ad" => "AFTER DELETE",
                _ => "AFTER UPDATE",
            };
            conn.execute_batch(&format!(
                "CREATE TRIGGER IF NOT EXISTS {} {event} ON {} BEGIN {body} END",
                q_ident(&format!("{table}_{suffix}")),
                q_ident(self.coll)
            ))?;
        }
        drop(conn);
        tracing::debug!(op = "create_fts_index", collection = %self.coll, table = %table);
        Ok(table)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        if name.starts_with(&format!("{}_fts_", self.coll)) {
            let conn = self.store.lock();
            for suffix in ["ai", "au", "ad"] {
                conn.execute_batch(&format!(
                    "DROP TRIGGER IF EXISTS {}",
                    q_ident(&format!("{name}_{suffix}"))
                ))?;
            }
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", q_ident(name)))?;
            return Ok(());
        }
        self.store
            .lock()
            .execute_batch(&format!("DROP INDEX IF EXISTS {}", q_ident(name)))?;
        Ok(())
    }

    pub fn drop_indexes(&self) -> Result<()> {
        for info in self.list_indexes()? {
            self.drop_index(&info.name)?;
        }
        Ok(())
    }

    pub fn reindex(&self) -> Result<()> {
        self.store
            .lock()
            .execute_batch(&format!("REINDEX {}", q_ident(self.coll)))?;
        Ok(())
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        let mut out = Vec::new();
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL ORDER BY name",
        )?;
        let rows = stmt
            .query_map([self.coll], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);
        for (name, sql) in rows {
            let keys = parse_index_paths(&sql);
            if keys.is_empty() {
                continue;
            }
            out.push(IndexInfo {
                name,
                keys,
                unique: sql.to_uppercase().contains("UNIQUE"),
                fts: false,
            });
        }
        for table in self.store.companion_tables(self.coll)? {
            let field = table
                .strip_prefix(&format!("{}_fts_", self.coll))
                .unwrap_or(&table)
                .to_string();
            out.push(IndexInfo {
                name: table,
                keys: vec![(field, 1)],
                unique: false,
                fts: true,
            });
        }
        Ok(out)
    }

    /// Dotted paths usable for indexed lookup: single-column indexes
    /// and the leading column of compound indexes.
    pub fn indexed_paths(&self) -> Result<HashSet<String>> {
        let mut paths = HashSet::new();
        for info in self.list_indexes()? {
            if info.fts {
                continue;
            }
            if let Some((first, _)) = info.keys.first() {
                paths.insert(first.clone());
            }
        }
        Ok(paths)
    }

    pub fn fts_tables(&self) -> Result<Vec<String>> {
        self.store.companion_tables(self.coll)
    }
}

pub fn fts_table_name(coll: &str, field: &str) -> String {
    format!("{}_fts_{}", coll, field.replace('.', "_"))
}

/// Extract `(path, direction)` pairs from an expression index's DDL.
fn parse_index_paths(sql: &str) -> Vec<(String, i64)> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r#"json_extract\(data,\s*'([^']+)'\)(\s+DESC)?"#).expect("static regex")
    });
    re.captures_iter(sql)
        .filter_map(|caps| {
            let path = caps.get(1)?.as_str();
            let dir = if caps.get(2).is_some() { -1 } else { 1 };
            Some((json_path_to_dotted(path), dir))
        })
        .collect()
}

fn json_path_to_dotted(path: &str) -> String {
    path.trim_start_matches('$')
        .split('.')
        .filter(|seg| !seg.is_empty())
        .map(|seg| seg.trim_matches('"').replace("\\\"", "\""))
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConnectionOptions;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory(&ConnectionOptions::default()).unwrap();
        store.ensure_collection("docs").unwrap();
        store
    }

    #[test]
    fn create_and_discover_index() {
        let store = store();
        let mgr = IndexManager::new(&store, "docs");
        let name = mgr
            .create_index(&[("category", 1)], &IndexOptions::default())
            .unwrap();
        assert_eq!(name, "idx_docs_category");
        let paths = mgr.indexed_paths().unwrap();
        assert!(paths.contains("category"));
    }

    #[test]
    fn compound_index_exposes_leading_column() {
        let store = store();
        let mgr = IndexManager::new(&store, "docs");
        mgr.create_index(&[("a.b", 1), ("c", -1)], &IndexOptions::default())
            .unwrap();
        let infos = mgr.list_indexes().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(
            infos[0].keys,
            vec![("a.b".to_string(), 1), ("c".to_string(), -1)]
        );
        assert!(mgr.indexed_paths().unwrap().contains("a.b"));
        assert!(!mgr.indexed_paths().unwrap().contains("c"));
    }

    #[test]
    fn unique_index_round_trip() {
        let store = store();
        let mgr = IndexManager::new(&store, "docs");
        mgr.create_index(
            &[("email", 1)],
            &IndexOptions {
                unique: true,
                name: None,
            },
        )
        .unwrap();
        assert!(mgr.list_indexes().unwrap()[0].unique);
        mgr.drop_indexes().unwrap();
        assert!(mgr.list_indexes().unwrap().is_empty());
    }

    #[test]
    fn fts_index_creates_table_and_triggers() {
        let store = store();
        store.insert_row("docs", r#"{"content":"hello world"}"#).unwrap();
        let mgr = IndexManager::new(&store, "docs");
        let table = mgr.create_fts_index("content", None).unwrap();
        assert_eq!(table, "docs_fts_content");

        store.insert_row("docs", r#"{"content":"rust ftw"}"#).unwrap();
        let conn = store.lock();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM \"docs_fts_content\" WHERE \"docs_fts_content\" MATCH 'rust'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
