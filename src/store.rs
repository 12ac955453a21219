use crate::error::Result;
use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Options applied when a connection is opened.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// FTS5 tokenizers to register before any text index is created:
    /// `(tokenizer name, shared library path)`. The name is treated as an
    /// opaque string and handed to `tokenize=` verbatim.
    pub tokenizers: Vec<(String, PathBuf)>,
}

/// SQLite-backed document store shared by every collection of a
/// connection. One SQL statement executes at a time per connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    jsonb_supported: bool,
    has_regexp: bool,
    tokenizers: Vec<String>,
    collections_cache: Mutex<HashSet<String>>,
}

impl SqliteStore {
    pub fn open(path: &str, options: &ConnectionOptions) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, options)
    }

    pub fn open_in_memory(options: &ConnectionOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, options)
    }

    fn init(conn: Connection, options: &ConnectionOptions) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL")?;

        let mut tokenizers = Vec::new();
        for (name, path) in &options.tokenizers {
            unsafe {
                let _guard = rusqlite::LoadExtensionGuard::new(&conn)?;
                conn.load_extension(path, None)?;
            }
            tokenizers.push(name.clone());
        }

        let has_regexp = register_regexp(&conn).is_ok();
        let jsonb_supported = conn
            .query_row("SELECT jsonb('{}')", [], |_| Ok(()))
            .is_ok();
        tracing::debug!(op = "open", jsonb = jsonb_supported, regexp = has_regexp);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            jsonb_supported,
            has_regexp,
            tokenizers,
            collections_cache: Mutex::new(HashSet::new()),
        })
    }

    pub fn jsonb_supported(&self) -> bool {
        self.jsonb_supported
    }

    pub fn has_regexp(&self) -> bool {
        self.has_regexp
    }

    pub fn tokenizers(&self) -> &[String] {
        &self.tokenizers
    }

    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("connection lock")
    }

    /// Read-side expression for the document column: always textual JSON.
    pub fn data_read_expr(&self) -> &'static str {
        if self.jsonb_supported { "json(data)" } else { "data" }
    }

    /// Write-side placeholder for a JSON text parameter.
    pub fn data_write_expr(&self) -> &'static str {
        if self.jsonb_supported { "jsonb(?)" } else { "?" }
    }

    pub fn ensure_collection(&self, name: &str) -> Result<()> {
        if self
            .collections_cache
            .lock()
            .expect("cache lock")
            .contains(name)
        {
            return Ok(());
        }
        let t = Instant::now();
        let column_type = if self.jsonb_supported { "JSONB" } else { "TEXT" };
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, data {} NOT NULL)",
            q_ident(name),
            column_type
        );
        self.lock().execute_batch(&ddl)?;
        self.collections_cache
            .lock()
            .expect("cache lock")
            .insert(name.to_string());
        tracing::debug!(op = "ensure_collection", collection = %name, elapsed_ms = ?t.elapsed().as_millis());
        Ok(())
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Drop the collection table together with its companion FTS tables,
    /// their sync triggers, and any change-stream table.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let companions = self.companion_tables(name)?;
        let conn = self.lock();
        for table in &companions {
            for suffix in ["ai", "au", "ad"] {
                conn.execute_batch(&format!(
                    "DROP TRIGGER IF EXISTS {}",
                    q_ident(&format!("{table}_{suffix}"))
                ))?;
            }
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", q_ident(table)))?;
        }
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}",
            q_ident(&format!("{name}_changes"))
        ))?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", q_ident(name)))?;
        drop(conn);
        self.collections_cache
            .lock()
            .expect("cache lock")
            .remove(name);
        tracing::debug!(op = "drop_collection", collection = %name);
        Ok(())
    }

    pub fn rename_collection(&self, old: &str, new: &str) -> Result<()> {
        self.lock().execute_batch(&format!(
            "ALTER TABLE {} RENAME TO {}",
            q_ident(old),
            q_ident(new)
        ))?;
        let mut cache = self.collections_cache.lock().expect("cache lock");
        cache.remove(old);
        cache.insert(new.to_string());
        Ok(())
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '%_fts_%' \
             AND name NOT LIKE '%_changes' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Companion FTS tables for a collection, discovered by name shape.
    pub fn companion_tables(&self, name: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ? ESCAPE '\\' ORDER BY name",
        )?;
        let pattern = format!("{}\\_fts\\_%", like_escape(name));
        let names = stmt
            .query_map([pattern], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    pub fn insert_row(&self, coll: &str, json: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (data) VALUES ({})",
                q_ident(coll),
                self.data_write_expr()
            ),
            [json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch every row of a collection as `(row id, JSON text)`.
    pub fn fetch_all(&self, coll: &str) -> Result<Vec<(i64, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, {} FROM {} ORDER BY id",
            self.data_read_expr(),
            q_ident(coll)
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mean stored row size in bytes, for result-size estimation.
    pub fn avg_row_bytes(&self, coll: &str) -> Result<f64> {
        let conn = self.lock();
        let avg: f64 = conn.query_row(
            &format!(
                "SELECT COALESCE(AVG(LENGTH(data)), 0.0) FROM {}",
                q_ident(coll)
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    pub fn count_rows(&self, coll: &str) -> Result<i64> {
        let conn = self.lock();
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", q_ident(coll)),
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

/// Double-quote an identifier for use in DDL/DML.
pub fn q_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape LIKE metacharacters in a literal prefix (pairs with `ESCAPE '\'`).
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let re: Arc<regex::Regex> =
                ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                    Ok(regex::Regex::new(vr.as_str()?)?)
                })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(t) => std::str::from_utf8(t)
                    .map(|s| re.is_match(s))
                    .unwrap_or(false),
                _ => false,
            };
            Ok(matched)
        },
    )
}
