use crate::aggregation::expr::{EvalContext, eval_expr, parse_expr};
use crate::document::Document;
use serde_json::Value;

pub fn execute(docs: Vec<Document>, replacement: &Value) -> anyhow::Result<Vec<Document>> {
    let expr = parse_expr(replacement)?;
    let mut result = Vec::new();
    for doc in docs {
        let ctx = EvalContext::new(doc.clone());
        match eval_expr(&expr, &ctx)? {
            Value::Object(map) => result.push(map),
            other => anyhow::bail!(
                "$replaceRoot expression must evaluate to an object, got {}",
                crate::aggregation::expr::type_name(&other)
            ),
        }
    }
    Ok(result)
}
