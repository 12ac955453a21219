//! Find cursors: lazy execution with sort/skip/limit pushed into SQL
//! when the filter translates, host-applied otherwise, plus raw NDJSON
//! batch framing for zero-copy forwarding.

use crate::collection::Collection;
use crate::document::Document;
use crate::error::{Error, Result};
use bytes::Bytes;
use serde_json::Value;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Lazy iterator over the documents matching a filter.
pub struct Cursor<'a> {
    collection: &'a Collection,
    filter: Document,
    projection: Option<Document>,
    sort: Option<Document>,
    skip: Option<i64>,
    limit: Option<i64>,
    batch_size: usize,
    results: Option<Vec<Document>>,
    position: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(collection: &'a Collection, filter: Document) -> Self {
        Self {
            collection,
            filter,
            projection: None,
            sort: None,
            skip: None,
            limit: None,
            batch_size: DEFAULT_BATCH_SIZE,
            results: None,
            position: 0,
        }
    }

    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn sort(mut self, spec: Document) -> Self {
        self.sort = Some(spec);
        self
    }

    pub fn skip(mut self, n: i64) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    fn execute(&mut self) -> Result<()> {
        if self.results.is_some() {
            return Ok(());
        }
        let docs = self.collection.helper().find_docs(
            &self.filter,
            self.sort.as_ref(),
            self.skip,
            self.limit,
        )?;
        let docs = match &self.projection {
            Some(projection) if !projection.is_empty() => {
                crate::aggregation::stages::project::execute(docs, projection)
                    .map_err(|e| Error::MalformedQuery(e.to_string()))?
            }
            _ => docs,
        };
        self.results = Some(docs);
        self.position = 0;
        Ok(())
    }

    pub fn try_next(&mut self) -> Result<Option<Document>> {
        self.execute()?;
        let results = self.results.as_ref().expect("executed");
        if self.position < results.len() {
            let doc = results[self.position].clone();
            self.position += 1;
            Ok(Some(doc))
        } else {
            Ok(None)
        }
    }

    pub fn to_list(mut self) -> Result<Vec<Document>> {
        self.execute()?;
        let results = self.results.take().expect("executed");
        Ok(results.into_iter().skip(self.position).collect())
    }

    pub fn count(&mut self) -> Result<usize> {
        self.execute()?;
        Ok(self.results.as_ref().expect("executed").len())
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

/// Batches of newline-separated JSON documents as raw bytes.
pub struct RawBatchCursor {
    batches: Vec<Bytes>,
    position: usize,
}

impl RawBatchCursor {
    /// Frame documents into NDJSON batches of `batch_size` documents.
    pub(crate) fn new(docs: Vec<Document>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::new();
        for chunk in docs.chunks(batch_size) {
            batches.push(encode_batch(chunk));
        }
        Self {
            batches,
            position: 0,
        }
    }

    /// One batch holding the entire result set.
    pub(crate) fn single_batch(docs: Vec<Document>) -> Self {
        let batches = if docs.is_empty() {
            Vec::new()
        } else {
            vec![encode_batch(&docs)]
        };
        Self {
            batches,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

fn encode_batch(docs: &[Document]) -> Bytes {
    let mut buf = Vec::new();
    for doc in docs {
        buf.extend_from_slice(
            serde_json::to_string(&Value::Object(doc.clone()))
                .expect("document serialises")
                .as_bytes(),
        );
        buf.push(b'\n');
    }
    Bytes::from(buf)
}

impl Iterator for RawBatchCursor {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position < self.batches.len() {
            let batch = self.batches[self.position].clone();
            self.position += 1;
            Some(batch)
        } else {
            None
        }
    }
}
