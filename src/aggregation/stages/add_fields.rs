use crate::aggregation::expr::{EvalContext, REMOVE, eval_expr, parse_expr};
use crate::document::{Document, remove_path, set_path};

pub fn execute(docs: Vec<Document>, spec: &Document) -> anyhow::Result<Vec<Document>> {
    let mut result = Vec::new();
    for doc in docs {
        let ctx = EvalContext::new(doc.clone());
        let mut updated = doc;
        for (key, value) in spec {
            let expr = parse_expr(value)?;
            let evaluated = eval_expr(&expr, &ctx)?;
            if evaluated.as_str() == Some(REMOVE) {
                remove_path(&mut updated, key);
            } else {
                set_path(&mut updated, key, evaluated);
            }
        }
        result.push(updated);
    }
    Ok(result)
}
