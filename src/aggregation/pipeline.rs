use crate::document::Document;
use serde_json::Value;

/// Unwind options: the path (without the leading `$`), the optional
/// index field, and whether null/empty sources survive.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

/// Pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Document),
    Project(Document),
    AddFields(Document),
    ReplaceRoot(Value),
    Unwind(UnwindSpec),
    Group { id: Value, accumulators: Document },
    Sort(Document),
    Skip(i64),
    Limit(i64),
    Lookup(LookupSpec),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::ReplaceRoot(_) => "$replaceRoot",
            Stage::Unwind(_) => "$unwind",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Lookup(_) => "$lookup",
        }
    }
}

/// Parse a pipeline from its JSON form.
pub fn parse_pipeline(stages: &[Value]) -> anyhow::Result<Vec<Stage>> {
    stages.iter().map(parse_stage).collect()
}

fn parse_stage(stage: &Value) -> anyhow::Result<Stage> {
    let doc = stage
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("pipeline stage must be a document"))?;
    if doc.len() != 1 {
        anyhow::bail!("pipeline stage must have exactly one operator");
    }
    let (name, value) = doc.iter().next().expect("non-empty");

    match name.as_str() {
        "$match" => Ok(Stage::Match(require_doc(name, value)?)),
        "$project" => {
            let spec = require_doc(name, value)?;
            if spec.is_empty() {
                anyhow::bail!("$project requires at least one field");
            }
            Ok(Stage::Project(spec))
        }
        "$addFields" | "$set" => Ok(Stage::AddFields(require_doc(name, value)?)),
        "$replaceRoot" => {
            let doc = require_doc(name, value)?;
            let new_root = doc
                .get("newRoot")
                .ok_or_else(|| anyhow::anyhow!("$replaceRoot requires newRoot"))?;
            Ok(Stage::ReplaceRoot(new_root.clone()))
        }
        "$replaceWith" => Ok(Stage::ReplaceRoot(value.clone())),
        "$unwind" => {
            if let Some(path) = value.as_str() {
                Ok(Stage::Unwind(UnwindSpec {
                    path: strip_dollar(path)?,
                    include_array_index: None,
                    preserve_null_and_empty_arrays: false,
                }))
            } else if let Some(doc) = value.as_object() {
                let path = doc
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("$unwind requires path"))?;
                Ok(Stage::Unwind(UnwindSpec {
                    path: strip_dollar(path)?,
                    include_array_index: doc
                        .get("includeArrayIndex")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    preserve_null_and_empty_arrays: doc
                        .get("preserveNullAndEmptyArrays")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }))
            } else {
                anyhow::bail!("$unwind must be a string or document")
            }
        }
        "$group" => {
            let doc = require_doc(name, value)?;
            let id = doc
                .get("_id")
                .ok_or_else(|| anyhow::anyhow!("$group requires _id"))?
                .clone();
            let mut accumulators = Document::new();
            for (k, v) in &doc {
                if k == "_id" {
                    continue;
                }
                v.as_object()
                    .filter(|o| o.len() == 1 && o.keys().next().is_some_and(|op| op.starts_with('$')))
                    .ok_or_else(|| {
                        anyhow::anyhow!("$group field {k:?} must be an accumulator document")
                    })?;
                accumulators.insert(k.clone(), v.clone());
            }
            Ok(Stage::Group { id, accumulators })
        }
        "$sort" => {
            let spec = require_doc(name, value)?;
            if spec.is_empty() {
                anyhow::bail!("$sort requires at least one field");
            }
            Ok(Stage::Sort(spec))
        }
        "$skip" => {
            let n = integer_arg(name, value)?;
            anyhow::ensure!(n >= 0, "$skip must be non-negative");
            Ok(Stage::Skip(n))
        }
        "$limit" => {
            let n = integer_arg(name, value)?;
            anyhow::ensure!(n >= 0, "$limit must be non-negative");
            Ok(Stage::Limit(n))
        }
        "$lookup" => {
            let doc = require_doc(name, value)?;
            let field = |key: &str| {
                doc.get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("$lookup requires {key}"))
            };
            Ok(Stage::Lookup(LookupSpec {
                from: field("from")?,
                local_field: field("localField")?,
                foreign_field: field("foreignField")?,
                as_field: field("as")?,
            }))
        }
        other => anyhow::bail!("unknown pipeline stage: {other}"),
    }
}

fn require_doc(name: &str, value: &Value) -> anyhow::Result<Document> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{name} value must be a document"))
}

fn integer_arg(name: &str, value: &Value) -> anyhow::Result<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| anyhow::anyhow!("{name} value must be an integer"))
}

fn strip_dollar(path: &str) -> anyhow::Result<String> {
    path.strip_prefix('$')
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("$unwind path must start with '$'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_common_stages() {
        let stages = parse_pipeline(&[
            json!({"$match": {"a": 1}}),
            json!({"$unwind": "$tags"}),
            json!({"$group": {"_id": "$cat", "n": {"$sum": 1}}}),
            json!({"$sort": {"n": -1}}),
            json!({"$limit": 5}),
        ])
        .unwrap();
        assert_eq!(stages.len(), 5);
        assert_eq!(stages[1].name(), "$unwind");
    }

    #[test]
    fn unwind_document_form() {
        let stages = parse_pipeline(&[json!({"$unwind": {
            "path": "$xs",
            "includeArrayIndex": "i",
            "preserveNullAndEmptyArrays": true
        }})])
        .unwrap();
        match &stages[0] {
            Stage::Unwind(spec) => {
                assert_eq!(spec.path, "xs");
                assert_eq!(spec.include_array_index.as_deref(), Some("i"));
                assert!(spec.preserve_null_and_empty_arrays);
            }
            other => panic!("unexpected stage {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_stage() {
        assert!(parse_pipeline(&[json!({"$frobnicate": 1})]).is_err());
        assert!(parse_pipeline(&[json!({"$unwind": "tags"})]).is_err());
        assert!(parse_pipeline(&[json!({"$limit": -1})]).is_err());
    }

    #[test]
    fn group_requires_id() {
        assert!(parse_pipeline(&[json!({"$group": {"n": {"$sum": 1}}})]).is_err());
    }
}
