//! Cost-based pipeline reordering: hoist `$match` stages (or their
//! indexed subclauses) to the earliest legal position, then keep
//! whichever of original and rewritten costs less. The rewrite is a
//! pure function of the input pipeline.

use crate::aggregation::pipeline::Stage;
use crate::document::Document;
use serde_json::Value;
use std::collections::HashSet;

const ARRAY_FAN_OUT: f64 = 4.0;
const SORT_WEIGHT: f64 = 0.5;
const GROUP_WEIGHT: f64 = 0.5;
const UNWIND_WEIGHT: f64 = 0.2;

/// Selectivity-style cost of a predicate in [0, 1]; lower is cheaper.
pub fn estimate_predicate_cost(query: &Document, indexed: &HashSet<String>) -> f64 {
    let mut cost = 1.0;
    for (key, value) in query {
        let clause_cost = match key.as_str() {
            "$and" => combine_and(value, indexed),
            "$or" | "$nor" => combine_or(value, indexed),
            "$not" => value
                .as_object()
                .map(|sub| 1.0 - estimate_predicate_cost(sub, indexed))
                .unwrap_or(1.0),
            k if k.starts_with('$') => 1.0,
            field => field_cost(field, value, indexed),
        };
        cost *= clause_cost;
    }
    cost.clamp(0.0, 1.0)
}

fn combine_and(value: &Value, indexed: &HashSet<String>) -> f64 {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|sub| estimate_predicate_cost(sub, indexed))
                .product()
        })
        .unwrap_or(1.0)
}

fn combine_or(value: &Value, indexed: &HashSet<String>) -> f64 {
    value
        .as_array()
        .map(|items| {
            let miss: f64 = items
                .iter()
                .filter_map(Value::as_object)
                .map(|sub| 1.0 - estimate_predicate_cost(sub, indexed))
                .product();
            1.0 - miss
        })
        .unwrap_or(1.0)
}

fn field_cost(field: &str, value: &Value, indexed: &HashSet<String>) -> f64 {
    if !indexed.contains(field) {
        return 1.0;
    }
    match value {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            let mut cost: f64 = 1.0;
            for op in ops.keys() {
                let c = match op.as_str() {
                    "$eq" => 0.1,
                    "$in" => 0.3,
                    "$gt" | "$gte" | "$lt" | "$lte" => 0.4,
                    _ => 1.0,
                };
                cost = cost.min(c);
            }
            cost
        }
        _ => 0.1,
    }
}

/// Cost of a whole pipeline under the current index set.
pub fn estimate_pipeline_cost(stages: &[Stage], indexed: &HashSet<String>) -> f64 {
    let mut cost = 0.0;
    let mut size_factor = 1.0;
    for stage in stages {
        match stage {
            Stage::Match(query) => {
                let selectivity = estimate_predicate_cost(query, indexed);
                cost += size_factor * selectivity;
                size_factor *= selectivity;
            }
            Stage::Unwind(_) => {
                size_factor *= ARRAY_FAN_OUT;
                cost += size_factor * UNWIND_WEIGHT;
            }
            Stage::Sort(_) => cost += size_factor * SORT_WEIGHT,
            Stage::Group { .. } => cost += size_factor * GROUP_WEIGHT,
            Stage::Limit(n) => {
                size_factor = size_factor.min(*n as f64 / 100.0).max(0.01);
            }
            Stage::Skip(_) => {}
            _ => cost += size_factor * 0.1,
        }
    }
    cost
}

/// Reorder a pipeline for earlier filtering. Equivalent in result
/// multiset to the input; returns the cheaper of input and rewrite.
pub fn reorder_pipeline(stages: &[Stage], indexed: &HashSet<String>) -> Vec<Stage> {
    let mut rewritten = split_matches(stages);
    hoist_matches(&mut rewritten);
    let rewritten = merge_adjacent_matches(rewritten);

    if estimate_pipeline_cost(&rewritten, indexed) < estimate_pipeline_cost(stages, indexed) {
        tracing::debug!(op = "pipeline_reorder", applied = true);
        rewritten
    } else {
        stages.to_vec()
    }
}

/// Split multi-clause `$match` stages into one stage per top-level
/// clause so each can be hoisted independently.
fn split_matches(stages: &[Stage]) -> Vec<Stage> {
    let mut out = Vec::new();
    for stage in stages {
        match stage {
            Stage::Match(query) if query.len() > 1 && query.keys().all(|k| !k.starts_with('$')) => {
                for (key, value) in query {
                    let mut single = Document::new();
                    single.insert(key.clone(), value.clone());
                    out.push(Stage::Match(single));
                }
            }
            other => out.push(other.clone()),
        }
    }
    out
}

fn hoist_matches(stages: &mut Vec<Stage>) {
    // Bubble every $match leftwards past stages it commutes with.
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..stages.len() {
            if let (true, Some(fields)) = (
                matches!(stages[i], Stage::Match(_)),
                match_fields(&stages[i]),
            ) {
                if can_swap(&stages[i - 1], &fields) {
                    stages.swap(i - 1, i);
                    changed = true;
                }
            }
        }
    }
}

fn merge_adjacent_matches(stages: Vec<Stage>) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::new();
    for stage in stages {
        if let (Some(Stage::Match(prev)), Stage::Match(next)) = (out.last_mut(), &stage) {
            if next.keys().all(|k| !prev.contains_key(k) && !k.starts_with('$'))
                && prev.keys().all(|k| !k.starts_with('$'))
            {
                for (k, v) in next {
                    prev.insert(k.clone(), v.clone());
                }
                continue;
            }
        }
        out.push(stage);
    }
    out
}

/// Fields a `$match` references, or `None` when they cannot be
/// determined (`$expr`, `$where`, `$text`).
fn match_fields(stage: &Stage) -> Option<HashSet<String>> {
    let Stage::Match(query) = stage else {
        return None;
    };
    let mut fields = HashSet::new();
    collect_fields(query, &mut fields)?;
    Some(fields)
}

fn collect_fields(query: &Document, fields: &mut HashSet<String>) -> Option<()> {
    for (key, value) in query {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                for sub in value.as_array()?.iter().filter_map(Value::as_object) {
                    collect_fields(sub, fields)?;
                }
            }
            "$not" => collect_fields(value.as_object()?, fields)?,
            "$expr" | "$where" | "$text" => return None,
            k if k.starts_with('$') => return None,
            field => {
                fields.insert(field.split('.').next().unwrap_or(field).to_string());
            }
        }
    }
    Some(())
}

/// May a `$match` over `fields` move before `stage` without changing
/// the result multiset?
fn can_swap(stage: &Stage, fields: &HashSet<String>) -> bool {
    match stage {
        Stage::Sort(_) => true,
        Stage::Match(_) => false,
        Stage::AddFields(spec) => spec
            .keys()
            .all(|k| !fields.contains(root_of(k))),
        Stage::Unwind(spec) => {
            let root = root_of(&spec.path).to_string();
            !fields.contains(&root)
                && spec
                    .include_array_index
                    .as_deref()
                    .is_none_or(|idx| !fields.contains(root_of(idx)))
        }
        Stage::Lookup(spec) => !fields.contains(root_of(&spec.as_field)),
        // Skip/limit, projections, group, and root replacement change
        // row identity or field visibility; a filter never crosses them.
        _ => false,
    }
}

fn root_of(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Byte estimate for a pipeline's result set: row count times mean row
/// size, scaled by unwind fan-out and capped by `$limit`.
pub fn estimate_result_size_bytes(
    row_count: i64,
    avg_row_bytes: f64,
    stages: &[Stage],
) -> u64 {
    let mut rows = row_count as f64;
    for stage in stages {
        match stage {
            Stage::Unwind(_) => rows *= ARRAY_FAN_OUT,
            Stage::Limit(n) => rows = rows.min(*n as f64),
            Stage::Match(_) => {}
            _ => {}
        }
    }
    (rows * avg_row_bytes).max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::pipeline::parse_pipeline;
    use serde_json::json;

    fn stages(v: serde_json::Value) -> Vec<Stage> {
        parse_pipeline(v.as_array().unwrap()).unwrap()
    }

    fn indexed(fields: &[&str]) -> HashSet<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn indexed_eq_is_cheap() {
        let q = json!({"category": "x"});
        let cost_indexed =
            estimate_predicate_cost(q.as_object().unwrap(), &indexed(&["category"]));
        let cost_plain = estimate_predicate_cost(q.as_object().unwrap(), &indexed(&[]));
        assert!(cost_indexed < cost_plain);
        assert!((0.0..=1.0).contains(&cost_indexed));
    }

    #[test]
    fn match_hoisted_before_unwind() {
        let input = stages(json!([
            {"$unwind": "$tags"},
            {"$match": {"category": "x"}}
        ]));
        let out = reorder_pipeline(&input, &indexed(&["category"]));
        assert_eq!(out[0].name(), "$match");
        assert_eq!(out[1].name(), "$unwind");
    }

    #[test]
    fn match_on_unwound_field_stays_put() {
        let input = stages(json!([
            {"$unwind": "$tags"},
            {"$match": {"tags": "x"}}
        ]));
        let out = reorder_pipeline(&input, &indexed(&["tags"]));
        assert_eq!(out[0].name(), "$unwind");
    }

    #[test]
    fn match_never_crosses_limit() {
        let input = stages(json!([
            {"$limit": 10},
            {"$match": {"category": "x"}}
        ]));
        let out = reorder_pipeline(&input, &indexed(&["category"]));
        assert_eq!(out[0].name(), "$limit");
    }

    #[test]
    fn indexed_subclause_splits_and_hoists() {
        let input = stages(json!([
            {"$unwind": "$tags"},
            {"$match": {"category": "x", "tags": "y"}}
        ]));
        let out = reorder_pipeline(&input, &indexed(&["category"]));
        assert_eq!(out[0].name(), "$match");
        match &out[0] {
            Stage::Match(q) => assert!(q.contains_key("category")),
            other => panic!("unexpected stage {other:?}"),
        }
        assert_eq!(out[1].name(), "$unwind");
        assert_eq!(out[2].name(), "$match");
    }
}
