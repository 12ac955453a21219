use crate::aggregation::expr::{EvalContext, eval_expr, parse_expr};
use crate::aggregation::values::{Numeric, coerce_numeric, json_cmp, values_equal};
use crate::document::Document;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

pub fn execute(
    docs: Vec<Document>,
    id: &Value,
    accumulators: &Document,
) -> anyhow::Result<Vec<Document>> {
    let id_expr = parse_expr(id)?;

    // Group key -> accumulator states, in first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Value, Vec<AccumulatorState>)> = HashMap::new();

    let mut specs = Vec::new();
    for (field, acc) in accumulators {
        let acc_doc = acc.as_object().expect("validated at parse");
        let (op, arg) = acc_doc.iter().next().expect("validated at parse");
        let acc_type = parse_accumulator_type(op)?;
        let arg_expr = parse_expr(arg)?;
        specs.push((field.clone(), acc_type, arg_expr));
    }

    for doc in &docs {
        let ctx = EvalContext::new(doc.clone());
        let group_id = eval_expr(&id_expr, &ctx)?;
        let group_key = group_id.to_string();

        let (_, states) = groups.entry(group_key.clone()).or_insert_with(|| {
            order.push(group_key.clone());
            (
                group_id.clone(),
                specs
                    .iter()
                    .map(|(_, acc_type, _)| AccumulatorState::new(*acc_type))
                    .collect(),
            )
        });

        for (idx, (_, _, arg_expr)) in specs.iter().enumerate() {
            let value = eval_expr(arg_expr, &ctx)?;
            states[idx].accumulate(value);
        }
    }

    let mut result = Vec::new();
    for key in order {
        let (group_id, states) = groups.remove(&key).expect("ordered key");
        let mut doc = Document::new();
        doc.insert("_id".to_string(), group_id);
        for ((field, _, _), state) in specs.iter().zip(states) {
            doc.insert(field.clone(), state.finish());
        }
        result.push(doc);
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorType {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

pub fn parse_accumulator_type(op: &str) -> anyhow::Result<AccumulatorType> {
    match op {
        "$sum" => Ok(AccumulatorType::Sum),
        "$count" => Ok(AccumulatorType::Count),
        "$avg" => Ok(AccumulatorType::Avg),
        "$min" => Ok(AccumulatorType::Min),
        "$max" => Ok(AccumulatorType::Max),
        "$first" => Ok(AccumulatorType::First),
        "$last" => Ok(AccumulatorType::Last),
        "$push" => Ok(AccumulatorType::Push),
        "$addToSet" => Ok(AccumulatorType::AddToSet),
        _ => Err(anyhow::anyhow!("unknown accumulator: {op}")),
    }
}

#[derive(Debug)]
struct AccumulatorState {
    acc_type: AccumulatorType,
    sum: Numeric,
    count: i64,
    extreme: Option<Value>,
    first: Option<Value>,
    last: Option<Value>,
    values: Vec<Value>,
}

impl AccumulatorState {
    fn new(acc_type: AccumulatorType) -> Self {
        Self {
            acc_type,
            sum: Numeric::Int(0),
            count: 0,
            extreme: None,
            first: None,
            last: None,
            values: Vec::new(),
        }
    }

    fn accumulate(&mut self, value: Value) {
        match self.acc_type {
            AccumulatorType::Sum | AccumulatorType::Avg => {
                // Non-numeric values do not contribute.
                if let Some(n) = coerce_numeric(&value) {
                    self.sum = match (self.sum, n) {
                        (Numeric::Int(a), Numeric::Int(b)) => Numeric::Int(a + b),
                        (a, b) => Numeric::Float(a.as_f64() + b.as_f64()),
                    };
                    self.count += 1;
                }
            }
            AccumulatorType::Count => self.count += 1,
            AccumulatorType::Min => {
                if !value.is_null()
                    && self
                        .extreme
                        .as_ref()
                        .is_none_or(|cur| json_cmp(&value, cur) == Ordering::Less)
                {
                    self.extreme = Some(value);
                }
            }
            AccumulatorType::Max => {
                if !value.is_null()
                    && self
                        .extreme
                        .as_ref()
                        .is_none_or(|cur| json_cmp(&value, cur) == Ordering::Greater)
                {
                    self.extreme = Some(value);
                }
            }
            AccumulatorType::First => {
                if self.first.is_none() {
                    self.first = Some(value);
                }
            }
            AccumulatorType::Last => self.last = Some(value),
            AccumulatorType::Push => self.values.push(value),
            AccumulatorType::AddToSet => {
                if !self.values.iter().any(|v| values_equal(v, &value)) {
                    self.values.push(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self.acc_type {
            AccumulatorType::Sum => self.sum.to_value(),
            AccumulatorType::Count => Value::from(self.count),
            AccumulatorType::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    serde_json::Number::from_f64(self.sum.as_f64() / self.count as f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            AccumulatorType::Min | AccumulatorType::Max => self.extreme.unwrap_or(Value::Null),
            AccumulatorType::First => self.first.unwrap_or(Value::Null),
            AccumulatorType::Last => self.last.unwrap_or(Value::Null),
            AccumulatorType::Push | AccumulatorType::AddToSet => Value::Array(self.values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(v: serde_json::Value) -> Vec<Document> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn sum_and_push_by_key() {
        let input = docs(json!([
            {"cat": "A", "v": 1},
            {"cat": "B", "v": 5},
            {"cat": "A", "v": 2}
        ]));
        let accs = json!({"total": {"$sum": "$v"}, "vs": {"$push": "$v"}});
        let out = execute(input, &json!("$cat"), accs.as_object().unwrap()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("_id"), Some(&json!("A")));
        assert_eq!(out[0].get("total"), Some(&json!(3)));
        assert_eq!(out[0].get("vs"), Some(&json!([1, 2])));
        assert_eq!(out[1].get("_id"), Some(&json!("B")));
    }

    #[test]
    fn null_id_groups_everything() {
        let input = docs(json!([{"v": 1}, {"v": 2}]));
        let accs = json!({"n": {"$sum": 1}});
        let out = execute(input, &json!(null), accs.as_object().unwrap()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("n"), Some(&json!(2)));
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let accs = json!({"n": {"$sum": 1}});
        let out = execute(Vec::new(), &json!(null), accs.as_object().unwrap()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn add_to_set_deduplicates() {
        let input = docs(json!([
            {"cat": "A", "t": 1},
            {"cat": "A", "t": 1},
            {"cat": "A", "t": 2}
        ]));
        let accs = json!({"ts": {"$addToSet": "$t"}});
        let out = execute(input, &json!("$cat"), accs.as_object().unwrap()).unwrap();
        assert_eq!(out[0].get("ts"), Some(&json!([1, 2])));
    }
}
