use crate::document::Document;

pub fn execute(docs: Vec<Document>, n: i64) -> anyhow::Result<Vec<Document>> {
    if n < 0 {
        return Err(anyhow::anyhow!("$limit value must be non-negative"));
    }
    Ok(docs.into_iter().take(n as usize).collect())
}
