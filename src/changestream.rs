//! Change streams: a trigger-fed change table per watched collection
//! and a polling iterator over it. `max_await_time_ms` caps how long a
//! poll waits for new events before signalling end-of-stream.

use crate::document::{Document, decode_document};
use crate::error::Result;
use crate::store::{SqliteStore, q_ident};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn changes_table(coll: &str) -> String {
    format!("{coll}_changes")
}

pub(crate) fn ensure_change_capture(store: &SqliteStore, coll: &str) -> Result<()> {
    let table = changes_table(coll);
    let conn = store.lock();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         seq INTEGER PRIMARY KEY AUTOINCREMENT, \
         op TEXT NOT NULL, \
         doc_id INTEGER NOT NULL, \
         data TEXT)",
        q_ident(&table)
    ))?;
    for (suffix, event, body) in [
        (
            "ai",
            "AFTER INSERT",
            format!(
                "INSERT INTO {t}(op, doc_id, data) VALUES ('insert', new.id, json(new.data));",
                t = q_ident(&table)
            ),
        ),
        (
            "au",
            "AFTER UPDATE",
            format!(
                "INSERT INTO {t}(op, doc_id, data) VALUES ('update', new.id, json(new.data));",
                t = q_ident(&table)
            ),
        ),
        (
            "ad",
            "AFTER DELETE",
            format!(
                "INSERT INTO {t}(op, doc_id, data) VALUES ('delete', old.id, NULL);",
                t = q_ident(&table)
            ),
        ),
    ] {
        conn.execute_batch(&format!(
            "CREATE TRIGGER IF NOT EXISTS {} {event} ON {} BEGIN {body} END",
            q_ident(&format!("{table}_{suffix}")),
            q_ident(coll)
        ))?;
    }
    Ok(())
}

fn drop_change_capture(store: &SqliteStore, coll: &str) {
    let table = changes_table(coll);
    if let Ok(conn) = store.conn().lock() {
        for suffix in ["ai", "au", "ad"] {
            let _ = conn.execute_batch(&format!(
                "DROP TRIGGER IF EXISTS {}",
                q_ident(&format!("{table}_{suffix}"))
            ));
        }
        let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", q_ident(&table)));
    }
}

/// Polling iterator over a collection's change events.
pub struct ChangeStream {
    store: Arc<SqliteStore>,
    coll: String,
    last_seq: i64,
    max_await_time: Option<Duration>,
    full_document: bool,
    closed: bool,
}

impl ChangeStream {
    pub(crate) fn new(store: Arc<SqliteStore>, coll: String, full_document: bool) -> Result<Self> {
        ensure_change_capture(&store, &coll)?;
        let last_seq: i64 = {
            let conn = store.lock();
            conn.query_row(
                &format!(
                    "SELECT COALESCE(MAX(seq), 0) FROM {}",
                    q_ident(&changes_table(&coll))
                ),
                [],
                |row| row.get(0),
            )?
        };
        Ok(Self {
            store,
            coll,
            last_seq,
            max_await_time: None,
            full_document,
            closed: false,
        })
    }

    pub fn max_await_time_ms(mut self, ms: u64) -> Self {
        self.max_await_time = Some(Duration::from_millis(ms));
        self
    }

    /// Next change event; `None` when the await window expires (or
    /// immediately, with no window configured, when nothing is pending).
    pub fn try_next(&mut self) -> Result<Option<Document>> {
        if self.closed {
            return Ok(None);
        }
        let deadline = self.max_await_time.map(|window| Instant::now() + window);
        loop {
            if let Some(event) = self.poll_one()? {
                return Ok(Some(event));
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                _ => return Ok(None),
            }
        }
    }

    fn poll_one(&mut self) -> Result<Option<Document>> {
        let row = {
            let conn = self.store.lock();
            conn.query_row(
                &format!(
                    "SELECT seq, op, doc_id, data FROM {} WHERE seq > ? ORDER BY seq LIMIT 1",
                    q_ident(&changes_table(&self.coll))
                ),
                [self.last_seq],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
        };
        let Some((seq, op, doc_id, data)) = row else {
            return Ok(None);
        };
        self.last_seq = seq;

        let mut event = Map::new();
        event.insert("_id".to_string(), Value::from(seq));
        event.insert("operationType".to_string(), Value::String(op));
        let mut key = Map::new();
        key.insert("_id".to_string(), Value::from(doc_id));
        event.insert("documentKey".to_string(), Value::Object(key));
        event.insert(
            "ns".to_string(),
            serde_json::json!({ "coll": self.coll }),
        );
        if self.full_document {
            if let Some(data) = data {
                event.insert(
                    "fullDocument".to_string(),
                    Value::Object(decode_document(doc_id, &data)?),
                );
            }
        }
        Ok(Some(event))
    }

    /// Stop the stream and remove its triggers and change table.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            drop_change_capture(&self.store, &self.coll);
        }
    }
}

impl Iterator for ChangeStream {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.close();
    }
}
