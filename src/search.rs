//! Exact cosine-similarity search over an owner's chunk vectors.
//!
//! Retrieval sits on the hot path of an interactive chat, so this module
//! resolves every degraded condition — no backend, empty corpus, stale
//! vectors with the wrong dimensionality — to empty results or zero
//! scores rather than errors. The scan is exact and O(N) per query over
//! the owner's full vector set; acceptable at per-user corpus sizes.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::embedding::{self, Embedder};
use crate::models::{SearchHit, SourceType};
use crate::store;

/// Embed the query and rank the owner's chunks against it.
///
/// Returns up to `top_k` hits in strictly descending score order,
/// filtered to `score >= min_score` when supplied. An owner with no
/// indexed chunks, an empty query, or an unavailable embedding backend
/// all yield an empty list.
pub async fn search(
    pool: &SqlitePool,
    embedder: Option<&dyn Embedder>,
    owner_id: &str,
    query: &str,
    top_k: usize,
    min_score: Option<f32>,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let Some(embedder) = embedder else {
        warn!("search requested but no embedding backend is configured");
        return Ok(Vec::new());
    };

    let query_vec = match embedding::embed_query(embedder, query).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "query embedding failed, returning no results");
            return Ok(Vec::new());
        }
    };

    rank_by_vector(pool, owner_id, &query_vec, top_k, min_score).await
}

/// Score every stored vector for the owner against `query_vec` and take
/// the top K. Split out from [`search`] so ranking is exercisable
/// without an embedding backend.
pub async fn rank_by_vector(
    pool: &SqlitePool,
    owner_id: &str,
    query_vec: &[f32],
    top_k: usize,
    min_score: Option<f32>,
) -> Result<Vec<SearchHit>> {
    let stored = store::owner_vectors(pool, owner_id).await?;
    debug!(owner_id, candidates = stored.len(), "scoring owner corpus");

    let mut hits: Vec<SearchHit> = stored
        .into_iter()
        .map(|row| {
            let vector = embedding::blob_to_vec(&row.embedding);
            // Mismatched dimensionality scores 0 by contract.
            let score = embedding::cosine_similarity(query_vec, &vector);
            SearchHit {
                chunk_id: row.chunk_id,
                document_id: row.document_id,
                page_number: row.page_number,
                source_type: SourceType::parse(&row.source_type).unwrap_or(SourceType::PdfText),
                text: row.text,
                score,
            }
        })
        .collect();

    if let Some(threshold) = min_score {
        hits.retain(|h| h.score >= threshold);
    }

    // Score desc, chunk id asc as a deterministic tiebreaker.
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_k);

    Ok(hits)
}
