use super::Context;
use crate::api::DocumentInfo;
use anyhow::{Context as _, Result};

/// Documents that can be used as a chat filter.
pub fn ready(documents: Vec<DocumentInfo>) -> Vec<DocumentInfo> {
    documents.into_iter().filter(DocumentInfo::is_ready).collect()
}

pub async fn list(ctx: &Context, all: bool) -> Result<()> {
    let documents = ctx
        .client
        .list_documents()
        .await
        .context("fetching documents")?;
    let documents = if all { documents } else { ready(documents) };

    if documents.is_empty() {
        println!("No documents. Upload documents first, then ask questions here.");
        return Ok(());
    }
    for doc in documents {
        let marker = if ctx.config.document_id == Some(doc.id) {
            "*"
        } else {
            " "
        };
        println!("{} {:>5}  {:<12} {}", marker, doc.id, doc.status, doc.filename);
    }
    Ok(())
}
