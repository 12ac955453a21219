//! MongoDB-compatible collection handle: document CRUD, aggregation,
//! indexing, bulk writes, and change streams over one SQLite table.

use crate::aggregation_cursor::AggregationCursor;
use crate::bulk::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult, WriteModel,
};
use crate::changestream::ChangeStream;
use crate::cursor::{Cursor, DEFAULT_BATCH_SIZE, RawBatchCursor};
use crate::document::{Document, decode_document, encode_document};
use crate::error::{Error, Result};
use crate::fallback::FallbackConfig;
use crate::index::{IndexInfo, IndexManager, IndexOptions};
use crate::objectid::{normalize_id_value, validate_objectids};
use crate::query::{QueryHelper, UpdateOutcome};
use crate::store::SqliteStore;
use crate::update::apply_update;
use serde_json::Value;
use std::sync::Arc;

pub struct Collection {
    store: Arc<SqliteStore>,
    name: String,
    fallback: FallbackConfig,
}

impl Collection {
    pub(crate) fn new(store: Arc<SqliteStore>, name: String, fallback: FallbackConfig) -> Self {
        Self {
            store,
            name,
            fallback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn helper(&self) -> QueryHelper<'_> {
        QueryHelper::new(&self.store, &self.name, self.fallback)
    }

    fn indexes(&self) -> IndexManager<'_> {
        IndexManager::new(&self.store, &self.name)
    }

    // --- inserts ---

    pub fn insert_one(&self, mut document: Document) -> Result<InsertOneResult> {
        validate_objectids(&Value::Object(document.clone()))?;
        if let Some(id) = document.get("_id").cloned() {
            let normalized = normalize_id_value(&id);
            document.insert("_id".to_string(), normalized.clone());
            let mut filter = Document::new();
            filter.insert("_id".to_string(), normalized.clone());
            if self.helper().matching_ids(&filter, Some(1))?.first().is_some() {
                return Err(Error::Integrity(format!(
                    "duplicate _id: {normalized}"
                )));
            }
            let json = encode_document(&document)?;
            self.store.insert_row(&self.name, &json)?;
            return Ok(InsertOneResult {
                inserted_id: normalized,
            });
        }
        let json = encode_document(&document)?;
        let row_id = self.store.insert_row(&self.name, &json)?;
        Ok(InsertOneResult {
            inserted_id: Value::from(row_id),
        })
    }

    pub fn insert_many(&self, documents: Vec<Document>) -> Result<InsertManyResult> {
        self.in_transaction(|| {
            let mut inserted_ids = Vec::with_capacity(documents.len());
            for document in documents {
                inserted_ids.push(self.insert_one(document)?.inserted_id);
            }
            Ok(InsertManyResult { inserted_ids })
        })
    }

    // --- reads ---

    pub fn find(&self, filter: Document) -> Cursor<'_> {
        Cursor::new(self, filter)
    }

    pub fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let mut docs = self.helper().find_docs(&filter, None, None, Some(1))?;
        Ok(docs.pop())
    }

    pub fn find_raw_batches(
        &self,
        filter: Document,
        batch_size: Option<usize>,
    ) -> Result<RawBatchCursor> {
        let docs = self.helper().find_docs(&filter, None, None, None)?;
        Ok(RawBatchCursor::new(
            docs,
            batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        ))
    }

    pub fn count_documents(&self, filter: Document) -> Result<u64> {
        Ok(self.helper().count(&filter)? as u64)
    }

    pub fn estimated_document_count(&self) -> Result<u64> {
        Ok(self.store.count_rows(&self.name)? as u64)
    }

    pub fn distinct(&self, field: &str, filter: Option<Document>) -> Result<Vec<Value>> {
        self.helper()
            .distinct(field, &filter.unwrap_or_default())
    }

    // --- updates ---

    pub fn update_one(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let outcome = self.helper().update(&filter, &update, false, upsert)?;
        Ok(to_update_result(outcome))
    }

    pub fn update_many(
        &self,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let outcome = self.helper().update(&filter, &update, true, upsert)?;
        Ok(to_update_result(outcome))
    }

    pub fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        validate_objectids(&Value::Object(replacement.clone()))?;
        let outcome = self.helper().replace(&filter, &replacement, upsert)?;
        Ok(to_update_result(outcome))
    }

    // --- deletes ---

    pub fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        Ok(DeleteResult {
            deleted_count: self.helper().delete(&filter, false)?,
        })
    }

    pub fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        Ok(DeleteResult {
            deleted_count: self.helper().delete(&filter, true)?,
        })
    }

    // --- find-and-modify ---

    /// Apply an update to the first match and return its pre-image.
    pub fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<Option<Document>> {
        let helper = self.helper();
        let Some(id) = helper.matching_ids(&filter, Some(1))?.first().copied() else {
            return Ok(None);
        };
        let Some(data) = helper.row_data(id)? else {
            return Ok(None);
        };
        let before = decode_document(id, &data)?;
        let mut after = before.clone();
        if apply_update(&mut after, &update)? {
            helper.write_back(id, &after)?;
        }
        Ok(Some(before))
    }

    /// Replace the first match wholesale and return its pre-image. The
    /// row id is never altered.
    pub fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
    ) -> Result<Option<Document>> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(Error::MalformedQuery(
                "replacement document must not contain operators".into(),
            ));
        }
        let helper = self.helper();
        let Some(id) = helper.matching_ids(&filter, Some(1))?.first().copied() else {
            return Ok(None);
        };
        let Some(data) = helper.row_data(id)? else {
            return Ok(None);
        };
        let before = decode_document(id, &data)?;
        let mut after = replacement;
        if !after.contains_key("_id") {
            if let Some(old_id) = before.get("_id") {
                after.insert("_id".to_string(), old_id.clone());
            }
        }
        helper.write_back(id, &after)?;
        Ok(Some(before))
    }

    pub fn find_one_and_delete(&self, filter: Document) -> Result<Option<Document>> {
        let helper = self.helper();
        let Some(id) = helper.matching_ids(&filter, Some(1))?.first().copied() else {
            return Ok(None);
        };
        let Some(data) = helper.row_data(id)? else {
            return Ok(None);
        };
        let doc = decode_document(id, &data)?;
        let mut filter_by_id = Document::new();
        filter_by_id.insert("_id".to_string(), Value::from(id));
        helper.delete(&filter_by_id, false)?;
        Ok(Some(doc))
    }

    // --- aggregation ---

    pub fn aggregate(&self, pipeline: Vec<Value>) -> AggregationCursor {
        AggregationCursor::new(
            self.store.clone(),
            self.name.clone(),
            self.fallback,
            pipeline,
        )
    }

    /// Aggregation results as one NDJSON byte batch.
    pub fn aggregate_raw_batches(&self, pipeline: Vec<Value>) -> Result<RawBatchCursor> {
        let mut cursor = self.aggregate(pipeline);
        let docs = cursor.to_list()?;
        Ok(RawBatchCursor::single_batch(docs))
    }

    // --- bulk writes ---

    /// Execute a batch of write models inside one transaction. The
    /// first failure rolls everything back and propagates; `ordered =
    /// false` shares the same transactional contract.
    pub fn bulk_write(&self, requests: Vec<WriteModel>, ordered: bool) -> Result<BulkWriteResult> {
        let _ = ordered;
        self.in_transaction(|| {
            let mut result = BulkWriteResult::default();
            for (index, request) in requests.into_iter().enumerate() {
                match request {
                    WriteModel::InsertOne { document } => {
                        self.insert_one(document)?;
                        result.inserted_count += 1;
                    }
                    WriteModel::UpdateOne {
                        filter,
                        update,
                        upsert,
                    } => {
                        let outcome = self.helper().update(&filter, &update, false, upsert)?;
                        merge_write_outcome(&mut result, index, outcome);
                    }
                    WriteModel::UpdateMany {
                        filter,
                        update,
                        upsert,
                    } => {
                        let outcome = self.helper().update(&filter, &update, true, upsert)?;
                        merge_write_outcome(&mut result, index, outcome);
                    }
                    WriteModel::ReplaceOne {
                        filter,
                        replacement,
                        upsert,
                    } => {
                        let outcome = self.helper().replace(&filter, &replacement, upsert)?;
                        merge_write_outcome(&mut result, index, outcome);
                    }
                    WriteModel::DeleteOne { filter } => {
                        result.deleted_count += self.helper().delete(&filter, false)?;
                    }
                    WriteModel::DeleteMany { filter } => {
                        result.deleted_count += self.helper().delete(&filter, true)?;
                    }
                }
            }
            Ok(result)
        })
    }

    fn in_transaction<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.store.lock().execute_batch("BEGIN IMMEDIATE")?;
        match body() {
            Ok(value) => {
                self.store.lock().execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.store.lock().execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // --- indexes ---

    pub fn create_index(&self, keys: &[(&str, i64)], options: &IndexOptions) -> Result<String> {
        self.indexes().create_index(keys, options)
    }

    pub fn create_indexes(&self, specs: &[&[(&str, i64)]]) -> Result<Vec<String>> {
        specs
            .iter()
            .map(|keys| self.create_index(keys, &IndexOptions::default()))
            .collect()
    }

    /// FTS5 companion index for full-text `$text` search.
    pub fn create_text_index(&self, field: &str, tokenizer: Option<&str>) -> Result<String> {
        self.indexes().create_fts_index(field, tokenizer)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.indexes().drop_index(name)
    }

    pub fn drop_indexes(&self) -> Result<()> {
        self.indexes().drop_indexes()
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        self.indexes().list_indexes()
    }

    pub fn reindex(&self) -> Result<()> {
        self.indexes().reindex()
    }

    // --- collection admin ---

    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        let companions = self.store.companion_tables(&self.name)?;
        let old_prefix = format!("{}_fts_", self.name);

        // Companion triggers reference the old names; rebuild them.
        for table in &companions {
            self.indexes().drop_index(table)?;
        }
        self.store.rename_collection(&self.name, new_name)?;
        let old_name = std::mem::replace(&mut self.name, new_name.to_string());
        for table in &companions {
            if let Some(field) = table.strip_prefix(&old_prefix) {
                self.indexes().create_fts_index(field, None)?;
            }
        }
        tracing::debug!(op = "rename_collection", from = %old_name, to = %new_name);
        Ok(())
    }

    pub fn drop(&self) -> Result<()> {
        self.store.drop_collection(&self.name)
    }

    /// Collection options; this engine stores none.
    pub fn options(&self) -> Document {
        Document::new()
    }

    // --- change streams ---

    pub fn watch(&self, full_document: bool) -> Result<ChangeStream> {
        ChangeStream::new(self.store.clone(), self.name.clone(), full_document)
    }
}

fn to_update_result(outcome: UpdateOutcome) -> UpdateResult {
    UpdateResult {
        matched_count: outcome.matched_count,
        modified_count: outcome.modified_count,
        upserted_id: outcome.upserted_id,
    }
}

fn merge_write_outcome(result: &mut BulkWriteResult, index: usize, outcome: UpdateOutcome) {
    result.matched_count += outcome.matched_count;
    result.modified_count += outcome.modified_count;
    if let Some(id) = outcome.upserted_id {
        result.upserted_count += 1;
        result.upserted_ids.insert(index, id);
    }
}
