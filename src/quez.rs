//! Compressed bounded queue used for memory-constrained cursor buffering.
//!
//! Items are held zlib-compressed in RAM and decompressed on `get`. The
//! queue is a mutex-guarded deque with condition variables for
//! backpressure on both ends.

use crate::document::Document;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("queue is closed")]
    Closed,
    #[error("codec failure: {0}")]
    Codec(String),
}

/// Snapshot of the queue's size accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    pub count: usize,
    pub raw_size_bytes: u64,
    pub compressed_size_bytes: u64,
}

impl QueueStats {
    pub fn compression_ratio_pct(&self) -> f64 {
        if self.raw_size_bytes == 0 {
            return 0.0;
        }
        (1.0 - self.compressed_size_bytes as f64 / self.raw_size_bytes as f64) * 100.0
    }
}

struct QueueState {
    items: VecDeque<(Vec<u8>, u64)>,
    raw_bytes: u64,
    compressed_bytes: u64,
    closed: bool,
}

pub struct CompressedQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    maxsize: usize,
}

impl CompressedQueue {
    /// A `maxsize` of 0 means unbounded.
    pub fn new(maxsize: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                raw_bytes: 0,
                compressed_bytes: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            maxsize,
        }
    }

    pub fn put(
        &self,
        item: &Document,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_vec(&serde_json::Value::Object(item.clone()))
            .map_err(|e| QueueError::Codec(e.to_string()))?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&raw)
            .and_then(|_| encoder.finish())
            .map_err(|e| QueueError::Codec(e.to_string()))
            .and_then(|compressed| {
                self.put_blob(compressed, raw.len() as u64, block, timeout)
            })
    }

    fn put_blob(
        &self,
        compressed: Vec<u8>,
        raw_len: u64,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().expect("queue lock");
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if self.maxsize == 0 || state.items.len() < self.maxsize {
                state.compressed_bytes += compressed.len() as u64;
                state.raw_bytes += raw_len;
                state.items.push_back((compressed, raw_len));
                self.not_empty.notify_one();
                return Ok(());
            }
            if !block {
                return Err(QueueError::Full);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Full);
                    }
                    let (guard, _) = self
                        .not_full
                        .wait_timeout(state, deadline - now)
                        .expect("queue lock");
                    guard
                }
                None => self.not_full.wait(state).expect("queue lock"),
            };
        }
    }

    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Document, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().expect("queue lock");
        loop {
            if let Some((compressed, raw_len)) = state.items.pop_front() {
                state.compressed_bytes -= compressed.len() as u64;
                state.raw_bytes -= raw_len;
                self.not_full.notify_one();
                drop(state);
                return decode(&compressed);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if !block {
                return Err(QueueError::Empty);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Empty);
                    }
                    let (guard, _) = self
                        .not_empty
                        .wait_timeout(state, deadline - now)
                        .expect("queue lock");
                    guard
                }
                None => self.not_empty.wait(state).expect("queue lock"),
            };
        }
    }

    pub fn qsize(&self) -> usize {
        self.state.lock().expect("queue lock").items.len()
    }

    pub fn empty(&self) -> bool {
        self.qsize() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().expect("queue lock");
        QueueStats {
            count: state.items.len(),
            raw_size_bytes: state.raw_bytes,
            compressed_size_bytes: state.compressed_bytes,
        }
    }

    /// Wake all blocked producers and consumers; further `put`s fail.
    /// Items already queued remain retrievable.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue lock");
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("queue lock").closed
    }
}

fn decode(compressed: &[u8]) -> Result<Document, QueueError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| QueueError::Codec(e.to_string()))?;
    match serde_json::from_slice(&raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(QueueError::Codec("queued item is not an object".into())),
        Err(e) => Err(QueueError::Codec(e.to_string())),
    }
}
