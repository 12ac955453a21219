use crate::error::{Error, Result};
use serde_json::Value;

/// In-memory document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Decode a stored row into a document, injecting the row id as `_id`
/// when the stored object carries none.
pub fn decode_document(row_id: i64, data: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(data)? {
        Value::Object(mut map) => {
            if !map.contains_key("_id") {
                map.insert("_id".to_string(), Value::from(row_id));
            }
            Ok(map)
        }
        other => Err(Error::MalformedDocument(format!(
            "stored row {row_id} is not an object: {other}"
        ))),
    }
}

/// Serialise a document for storage.
pub fn encode_document(doc: &Document) -> Result<String> {
    serde_json::to_string(&Value::Object(doc.clone())).map_err(Into::into)
}

/// Resolve a dotted path against a document. Only object traversal; array
/// indexing in paths is not resolved here.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed. A
/// non-object intermediate value is replaced by an object.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for part in &parts[..parts.len() - 1] {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        current = entry.as_object_mut().expect("object entry");
    }
    current.insert(parts[parts.len() - 1].to_string(), value);
}

/// Remove a dotted path. Returns the removed value, if any.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for part in &parts[..parts.len() - 1] {
        current = current.get_mut(*part)?.as_object_mut()?;
    }
    current.remove(parts[parts.len() - 1])
}
