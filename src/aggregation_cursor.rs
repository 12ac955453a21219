//! Cursor over aggregation results. When quez mode is enabled and the
//! estimated result size crosses the memory threshold, execution moves
//! to a producer thread that streams decoded documents into a
//! compressed bounded queue; the consumer decompresses one document at
//! a time. Sorting and random indexing are unavailable in quez mode.

use crate::aggregation::exec::{ExecContext, execute_pipeline};
use crate::aggregation::optimizer::{estimate_result_size_bytes, reorder_pipeline};
use crate::aggregation::pipeline::{Stage, parse_pipeline};
use crate::aggregation::temp_table::TempTableGuard;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::fallback::FallbackConfig;
use crate::index::IndexManager;
use crate::quez::{CompressedQueue, QueueError, QueueStats};
use crate::store::SqliteStore;
use serde_json::Value;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 100 * 1024 * 1024;

const DRAIN_POLL: Duration = Duration::from_millis(100);

enum State {
    Pending,
    Materialized {
        results: Vec<Document>,
        position: usize,
        _guard: Option<TempTableGuard>,
    },
    Quez {
        queue: Arc<CompressedQueue>,
        handle: Option<JoinHandle<()>>,
    },
    Closed,
}

pub struct AggregationCursor {
    store: Arc<SqliteStore>,
    coll: String,
    fallback: FallbackConfig,
    pipeline: Vec<Value>,
    batch_size: usize,
    memory_threshold: u64,
    quez_enabled: bool,
    state: State,
}

impl AggregationCursor {
    pub(crate) fn new(
        store: Arc<SqliteStore>,
        coll: String,
        fallback: FallbackConfig,
        pipeline: Vec<Value>,
    ) -> Self {
        Self {
            store,
            coll,
            fallback,
            pipeline,
            batch_size: DEFAULT_BATCH_SIZE,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            quez_enabled: false,
            state: State::Pending,
        }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold = bytes;
        self
    }

    /// Enable spooling into the compressed bounded queue once the
    /// estimated result size exceeds the memory threshold.
    pub fn use_quez(mut self, enabled: bool) -> Self {
        self.quez_enabled = enabled;
        self
    }

    fn execute(&mut self) -> Result<()> {
        match self.state {
            State::Pending => {}
            State::Closed => {
                return Err(Error::UnsupportedOperation("cursor is closed".into()));
            }
            _ => return Ok(()),
        }

        let stages =
            parse_pipeline(&self.pipeline).map_err(|e| Error::MalformedQuery(e.to_string()))?;
        let indexes = IndexManager::new(&self.store, &self.coll);
        let indexed = indexes.indexed_paths()?;
        let stages = reorder_pipeline(&stages, &indexed);

        let row_count = self.store.count_rows(&self.coll)?;
        let avg_bytes = self.store.avg_row_bytes(&self.coll)?;
        let estimate = estimate_result_size_bytes(row_count, avg_bytes, &stages);

        if self.quez_enabled && estimate > self.memory_threshold {
            tracing::debug!(op = "aggregate_cursor", mode = "quez", estimate);
            self.state = self.spawn_producer(stages);
        } else {
            let fts_tables = indexes.fts_tables()?;
            let ctx = ExecContext {
                store: &self.store,
                coll: self.coll.clone(),
                fts_tables,
                fallback: self.fallback,
            };
            let (results, guard) = execute_pipeline(&ctx, &stages)?;
            self.state = State::Materialized {
                results,
                position: 0,
                _guard: guard,
            };
        }
        Ok(())
    }

    fn spawn_producer(&self, stages: Vec<Stage>) -> State {
        let queue = Arc::new(CompressedQueue::new(self.batch_size * 2));
        let producer_queue = queue.clone();
        let store = self.store.clone();
        let coll = self.coll.clone();
        let fallback = self.fallback;

        let handle = std::thread::spawn(move || {
            // Close the queue on every exit path so the consumer's
            // final drain terminates.
            struct CloseOnExit(Arc<CompressedQueue>);
            impl Drop for CloseOnExit {
                fn drop(&mut self) {
                    self.0.close();
                }
            }
            let _closer = CloseOnExit(producer_queue.clone());

            let produce = || -> Result<()> {
                let fts_tables = IndexManager::new(&store, &coll).fts_tables()?;
                let ctx = ExecContext {
                    store: &store,
                    coll: coll.clone(),
                    fts_tables,
                    fallback,
                };
                let (results, _guard) = execute_pipeline(&ctx, &stages)?;
                for doc in results {
                    // Backpressure: blocks while the queue is full; the
                    // consumer closing the queue unblocks us.
                    if producer_queue.put(&doc, true, None).is_err() {
                        break;
                    }
                }
                Ok(())
            };
            if let Err(e) = produce() {
                tracing::warn!(op = "quez_producer", error = %e);
            }
        });

        State::Quez {
            queue,
            handle: Some(handle),
        }
    }

    pub fn try_next(&mut self) -> Result<Option<Document>> {
        self.execute()?;
        match &mut self.state {
            State::Materialized {
                results, position, ..
            } => {
                if *position < results.len() {
                    let doc = results[*position].clone();
                    *position += 1;
                    Ok(Some(doc))
                } else {
                    Ok(None)
                }
            }
            State::Quez { queue, .. } => loop {
                match queue.get(true, Some(DRAIN_POLL)) {
                    Ok(doc) => return Ok(Some(doc)),
                    Err(QueueError::Closed) => return Ok(None),
                    Err(QueueError::Empty) => continue,
                    Err(e) => {
                        return Err(Error::UnsupportedOperation(format!(
                            "queue failure: {e}"
                        )));
                    }
                }
            },
            State::Pending | State::Closed => Ok(None),
        }
    }

    /// Drain everything that has not been consumed yet, joining the
    /// producer in quez mode. Safe after partial iteration.
    pub fn to_list(&mut self) -> Result<Vec<Document>> {
        self.execute()?;
        match &mut self.state {
            State::Materialized {
                results, position, ..
            } => {
                let out = results.split_off(*position);
                *position = results.len();
                Ok(out)
            }
            State::Quez { queue, handle } => {
                let mut out = Vec::new();
                loop {
                    match queue.get(true, Some(DRAIN_POLL)) {
                        Ok(doc) => out.push(doc),
                        Err(QueueError::Closed) => break,
                        Err(QueueError::Empty) => continue,
                        Err(e) => {
                            return Err(Error::UnsupportedOperation(format!(
                                "queue failure: {e}"
                            )));
                        }
                    }
                }
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
                Ok(out)
            }
            State::Pending | State::Closed => Ok(Vec::new()),
        }
    }

    /// Sort already-materialised results in place.
    pub fn sort_results(&mut self, spec: &Document) -> Result<()> {
        self.execute()?;
        match &mut self.state {
            State::Quez { .. } => Err(Error::UnsupportedOperation(
                "sorting is not supported with quez memory-constrained processing".into(),
            )),
            State::Materialized { results, .. } => {
                let docs = std::mem::take(results);
                *results = crate::aggregation::stages::sort::execute(docs, spec)
                    .map_err(|e| Error::MalformedQuery(e.to_string()))?;
                Ok(())
            }
            State::Pending | State::Closed => Ok(()),
        }
    }

    /// Random access into the materialised result set.
    pub fn get(&mut self, index: usize) -> Result<Document> {
        self.execute()?;
        match &self.state {
            State::Quez { .. } => Err(Error::UnsupportedOperation(
                "indexing is not supported with quez memory-constrained processing".into(),
            )),
            State::Materialized { results, .. } => results
                .get(index)
                .cloned()
                .ok_or_else(|| Error::UnsupportedOperation(format!("index {index} out of range"))),
            State::Pending | State::Closed => {
                Err(Error::UnsupportedOperation("cursor has no results".into()))
            }
        }
    }

    /// Size accounting of the compressed queue, when quez is active.
    pub fn get_quez_stats(&self) -> Option<QueueStats> {
        match &self.state {
            State::Quez { queue, .. } => Some(queue.stats()),
            _ => None,
        }
    }

    /// Drop owned temp tables and stop the producer, if any.
    pub fn close(&mut self) {
        if let State::Quez { queue, handle } = &mut self.state {
            queue.close();
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        self.state = State::Closed;
    }
}

impl Iterator for AggregationCursor {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

impl Drop for AggregationCursor {
    fn drop(&mut self) {
        self.close();
    }
}
