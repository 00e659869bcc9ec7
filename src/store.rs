//! Persistence operations over the SQLite schema.
//!
//! The pipeline is the only writer of document state; handlers and the
//! search engine read through these helpers. Batch writes (page images,
//! chunks) go through a single transaction each, and document deletion
//! cascades to images and chunks atomically.

use anyhow::{anyhow, bail, Result};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::models::{ChunkRecord, Document, DocumentStatus, OcrStatus, PageImage};

pub async fn create_document(
    pool: &SqlitePool,
    owner_id: &str,
    filename: &str,
    storage_path: &str,
) -> Result<Document> {
    let now = chrono::Utc::now().timestamp();
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO documents (id, owner_id, filename, storage_path, status, embedding_status,
                               page_count, image_count, processing_error, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'pending', 'pending', 0, 0, NULL, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(owner_id)
    .bind(filename)
    .bind(storage_path)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_document(pool, &id)
        .await?
        .ok_or_else(|| anyhow!("document {} vanished after insert", id))
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(row_to_document).transpose()
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let embedding_status: String = row.get("embedding_status");
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        filename: row.get("filename"),
        storage_path: row.get("storage_path"),
        status: DocumentStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid document status: {}", status))?,
        embedding_status: DocumentStatus::parse(&embedding_status)
            .ok_or_else(|| anyhow!("invalid embedding status: {}", embedding_status))?,
        page_count: row.get("page_count"),
        image_count: row.get("image_count"),
        processing_error: row.get("processing_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Move the document's lifecycle status forward. Backwards transitions
/// are rejected so a late writer can never regress a terminal state.
pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: DocumentStatus,
    error: Option<&str>,
) -> Result<()> {
    let doc = get_document(pool, id)
        .await?
        .ok_or_else(|| anyhow!("document not found: {}", id))?;

    if !doc.status.can_transition_to(status) {
        bail!(
            "illegal status transition for document {}: {} -> {}",
            id,
            doc.status.as_str(),
            status.as_str()
        );
    }

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE documents SET status = ?, processing_error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// The embedding sub-lifecycle is independent of the document lifecycle
/// and is not transition-checked; the orchestrator is its only writer.
pub async fn set_embedding_status(
    pool: &SqlitePool,
    id: &str,
    status: DocumentStatus,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE documents SET embedding_status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_page_count(pool: &SqlitePool, id: &str, page_count: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE documents SET page_count = ?, updated_at = ? WHERE id = ?")
        .bind(page_count)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_image_count(pool: &SqlitePool, id: &str, image_count: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE documents SET image_count = ?, updated_at = ? WHERE id = ?")
        .bind(image_count)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reset a document to its pre-pipeline state for reprocessing: derived
/// rows are deleted and counters zeroed, so the pipeline re-derives
/// everything instead of appending. This is a lifecycle restart, not a
/// status regression mid-run.
pub async fn reset_for_reprocessing(pool: &SqlitePool, id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM page_images WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE documents
        SET status = 'pending', embedding_status = 'pending',
            page_count = 0, image_count = 0, processing_error = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Insert all of a document's page images in one transaction.
pub async fn insert_page_images(pool: &SqlitePool, images: &[PageImage]) -> Result<()> {
    if images.is_empty() {
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    for img in images {
        sqlx::query(
            r#"
            INSERT INTO page_images
                (id, document_id, page_number, image_index, storage_path,
                 width, height, format, file_size, ocr_text, ocr_confidence, ocr_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, 'pending', ?)
            "#,
        )
        .bind(&img.id)
        .bind(&img.document_id)
        .bind(img.page_number)
        .bind(img.image_index)
        .bind(&img.storage_path)
        .bind(img.width)
        .bind(img.height)
        .bind(&img.format)
        .bind(img.file_size)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Pending OCR work for a document, ordered by page then image index.
pub async fn pending_ocr_images(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        r#"
        SELECT id, storage_path FROM page_images
        WHERE document_id = ? AND ocr_status = 'pending'
        ORDER BY page_number, image_index
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("id"), row.get("storage_path")))
        .collect())
}

pub async fn update_image_ocr(
    pool: &SqlitePool,
    image_id: &str,
    text: &str,
    confidence: f64,
    status: OcrStatus,
) -> Result<()> {
    sqlx::query(
        "UPDATE page_images SET ocr_text = ?, ocr_confidence = ?, ocr_status = ? WHERE id = ?",
    )
    .bind(text)
    .bind(confidence)
    .bind(status.as_str())
    .bind(image_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_page_images(pool: &SqlitePool, document_id: &str) -> Result<Vec<PageImage>> {
    let rows = sqlx::query(
        "SELECT * FROM page_images WHERE document_id = ? ORDER BY page_number, image_index",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    let mut images = Vec::with_capacity(rows.len());
    for row in rows {
        let status: String = row.get("ocr_status");
        images.push(PageImage {
            id: row.get("id"),
            document_id: row.get("document_id"),
            page_number: row.get("page_number"),
            image_index: row.get("image_index"),
            storage_path: row.get("storage_path"),
            width: row.get("width"),
            height: row.get("height"),
            format: row.get("format"),
            file_size: row.get("file_size"),
            ocr_text: row.get("ocr_text"),
            ocr_confidence: row.get("ocr_confidence"),
            ocr_status: OcrStatus::parse(&status)
                .ok_or_else(|| anyhow!("invalid ocr status: {}", status))?,
        });
    }
    Ok(images)
}

/// (completed-or-failed, total) OCR counts for the progress projector.
pub async fn ocr_progress(pool: &SqlitePool, document_id: &str) -> Result<(i64, i64)> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total,
               SUM(CASE WHEN ocr_status != 'pending' THEN 1 ELSE 0 END) AS done
        FROM page_images WHERE document_id = ?
        "#,
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    let total: i64 = row.get("total");
    let done: Option<i64> = row.get("done");
    Ok((done.unwrap_or(0), total))
}

/// Insert all successfully embedded chunks for one document in a single
/// transaction.
pub async fn insert_chunks(
    pool: &SqlitePool,
    chunks: &[ChunkRecord],
    model: &str,
    dims: usize,
) -> Result<()> {
    if chunks.is_empty() {
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    for chunk in chunks {
        let blob = crate::embedding::vec_to_blob(&chunk.embedding);
        sqlx::query(
            r#"
            INSERT INTO chunks
                (id, owner_id, document_id, chunk_index, page_number,
                 source_type, source_image_id, text, embedding, model, dims, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.owner_id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(chunk.page_number)
        .bind(chunk.source_type.as_str())
        .bind(&chunk.source_image_id)
        .bind(&chunk.text)
        .bind(blob)
        .bind(model)
        .bind(dims as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn count_chunks(pool: &SqlitePool, document_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// A stored chunk vector with the provenance needed to build a search hit.
pub struct StoredVector {
    pub chunk_id: String,
    pub document_id: String,
    pub page_number: i64,
    pub source_type: String,
    pub text: String,
    pub embedding: Vec<u8>,
}

/// Every chunk vector belonging to an owner. Search is account-wide by
/// contract, so there is no document filter here.
pub async fn owner_vectors(pool: &SqlitePool, owner_id: &str) -> Result<Vec<StoredVector>> {
    let rows = sqlx::query(
        r#"
        SELECT id, document_id, page_number, source_type, text, embedding
        FROM chunks WHERE owner_id = ?
        "#,
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| StoredVector {
            chunk_id: row.get("id"),
            document_id: row.get("document_id"),
            page_number: row.get("page_number"),
            source_type: row.get("source_type"),
            text: row.get("text"),
            embedding: row.get("embedding"),
        })
        .collect())
}

/// Delete a document and cascade to its images and chunks in one
/// transaction. Returns false when the document does not exist.
pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM page_images WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    if result.rows_affected() == 0 {
        warn!(document_id = id, "delete requested for unknown document");
        return Ok(false);
    }
    Ok(true)
}
