//! Embedding indexer.
//!
//! Turns a document's chunk descriptors into persisted chunk rows with
//! vectors attached. Embedding calls run sequentially with a fixed
//! inter-call delay as backpressure against provider throttling. A
//! single chunk's failure is recorded and skipped; whatever succeeded is
//! persisted in one batch write. With no embedding backend configured
//! the indexer is a no-op and the document simply ends up unsearchable
//! until reprocessed.

use anyhow::Result;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EmbeddingConfig;
use crate::embedding::Embedder;
use crate::models::{ChunkDescriptor, ChunkRecord};
use crate::store;

#[derive(Debug, Default)]
pub struct IndexOutcome {
    pub indexed: usize,
    pub failed: usize,
}

/// Embed and persist all chunks for one document.
///
/// Never fails for a single chunk; returns an error only when the batch
/// write itself fails (which the orchestrator treats as a stage failure).
pub async fn index_chunks(
    pool: &SqlitePool,
    embedder: Option<&dyn Embedder>,
    config: &EmbeddingConfig,
    owner_id: &str,
    document_id: &str,
    descriptors: Vec<ChunkDescriptor>,
) -> Result<IndexOutcome> {
    let Some(embedder) = embedder else {
        info!(
            document_id,
            chunks = descriptors.len(),
            "no embedding backend configured, skipping indexing"
        );
        return Ok(IndexOutcome::default());
    };

    if descriptors.is_empty() {
        return Ok(IndexOutcome::default());
    }

    let delay = Duration::from_millis(config.request_delay_ms);
    let total = descriptors.len();

    // One Result per chunk, partitioned afterwards; failures stay
    // visible instead of being swallowed inside the loop.
    let mut attempts: Vec<Result<ChunkRecord>> = Vec::with_capacity(total);

    for (chunk_index, descriptor) in descriptors.into_iter().enumerate() {
        if chunk_index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let attempt = embedder
            .embed(&[descriptor.text.clone()])
            .await
            .and_then(|mut vectors| {
                if vectors.is_empty() {
                    anyhow::bail!("empty embedding response");
                }
                Ok(ChunkRecord {
                    id: Uuid::new_v4().to_string(),
                    owner_id: owner_id.to_string(),
                    document_id: document_id.to_string(),
                    chunk_index: chunk_index as i64,
                    page_number: descriptor.page_number,
                    source_type: descriptor.source_type,
                    source_image_id: descriptor.source_image_id.clone(),
                    text: descriptor.text.clone(),
                    embedding: vectors.swap_remove(0),
                })
            });

        if let Err(ref e) = attempt {
            warn!(document_id, chunk_index, error = %e, "chunk embedding failed, skipping");
        }
        attempts.push(attempt);
    }

    let (records, failures) = partition_results(attempts);

    store::insert_chunks(pool, &records, embedder.model_name(), embedder.dims()).await?;

    info!(
        document_id,
        indexed = records.len(),
        failed = failures.len(),
        "embedding indexing finished"
    );

    Ok(IndexOutcome {
        indexed: records.len(),
        failed: failures.len(),
    })
}

/// Split per-item results into successes and failures.
pub fn partition_results<T>(items: Vec<Result<T>>) -> (Vec<T>, Vec<anyhow::Error>) {
    let mut ok = Vec::new();
    let mut err = Vec::new();
    for item in items {
        match item {
            Ok(v) => ok.push(v),
            Err(e) => err.push(e),
        }
    }
    (ok, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_separates_ok_from_err() {
        let items: Vec<Result<i32>> = vec![
            Ok(1),
            Err(anyhow::anyhow!("boom")),
            Ok(2),
            Err(anyhow::anyhow!("bang")),
        ];
        let (ok, err) = partition_results(items);
        assert_eq!(ok, vec![1, 2]);
        assert_eq!(err.len(), 2);
    }
}
