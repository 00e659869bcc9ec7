//! Ingestion orchestration.
//!
//! [`run_pipeline`] drives the five ordered stages for one document —
//! text extraction → image extraction → OCR → chunk+embed → finalize —
//! persisting each stage's output before the next starts. It is the only
//! writer of document-level state. Re-invoking it for the same document
//! re-derives all images and chunks instead of appending.
//!
//! [`IngestQueue`] detaches pipelines from the requests that trigger
//! them: the submitting handler hands over a document id and returns;
//! fixed worker tasks drain the queue. Stages within one document are
//! strictly sequential; documents run concurrently with no shared
//! mutable state beyond the database.

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunker::{self, OcrSource};
use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::extract;
use crate::indexer;
use crate::models::{Document, DocumentStatus, OcrStatus, PageImage};
use crate::ocr::{self, BatchOptions, OcrEngine, OcrItem};
use crate::raster::{self, RasterOptions};
use crate::store;

/// Everything a pipeline run needs, resolved once at startup. External
/// capabilities are explicit here — an absent engine or embedder means
/// that stage degrades, never that a null client gets probed.
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub ocr_primary: Option<Arc<dyn OcrEngine>>,
    pub ocr_fallback: Option<Arc<dyn OcrEngine>>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl PipelineContext {
    pub fn new(pool: SqlitePool, config: Arc<Config>) -> Result<Self> {
        let caps = config.capabilities();
        let (ocr_primary, ocr_fallback) = ocr::engines_from_config(&config.ocr, &caps);
        let embedder = if caps.embedding {
            embedding::create_embedder(&config.embedding)?.map(Arc::from)
        } else {
            None
        };

        info!(
            ocr_primary = caps.ocr_primary,
            ocr_fallback = caps.ocr_fallback,
            embedding = caps.embedding,
            "resolved external capabilities"
        );

        Ok(Self {
            pool,
            config,
            ocr_primary,
            ocr_fallback,
            embedder,
        })
    }
}

/// Run the full ingestion pipeline for one document.
///
/// Returns `Err` only when recording the document's own failure state
/// fails; every expected processing failure is absorbed into the
/// document row.
pub async fn run_pipeline(ctx: &PipelineContext, document_id: &str) -> Result<()> {
    let doc = store::get_document(&ctx.pool, document_id)
        .await?
        .ok_or_else(|| anyhow!("document not found: {}", document_id))?;
    let pdf_path = PathBuf::from(&doc.storage_path);
    let cfg = &ctx.config;

    // Re-derive, never append: clear anything a previous run left behind.
    store::reset_for_reprocessing(&ctx.pool, document_id).await?;
    store::set_status(&ctx.pool, document_id, DocumentStatus::Processing, None).await?;

    // Stage 1: text extraction. Fatal on failure.
    info!(document_id, "stage 1/5: text extraction");
    let extraction = match extract::parse_pdf(
        &pdf_path,
        cfg.pdf.max_pages,
        cfg.chunking.window_chars,
        cfg.chunking.overlap_chars,
    ) {
        Ok(extraction) => extraction,
        Err(e) => {
            fail_fatal(&ctx.pool, document_id, &e.to_string()).await;
            return Ok(());
        }
    };
    store::set_page_count(&ctx.pool, document_id, extraction.page_count as i64).await?;
    info!(
        document_id,
        pages = extraction.page_count,
        windows = extraction.windows.len(),
        "text extraction complete"
    );

    // Stage 2: image extraction. Later stages depend on its rows, so a
    // failure here is fatal too.
    info!(document_id, "stage 2/5: image extraction");
    let raster_opts = RasterOptions {
        dpi: cfg.pdf.dpi,
        quality: cfg.pdf.image_quality,
        min_words_for_render: cfg.pdf.min_words_for_render,
        min_image_px: cfg.pdf.min_image_px,
    };
    let extracted = match raster::extract_images(
        &pdf_path,
        document_id,
        &cfg.storage.output_dir,
        &extraction.pages,
        &raster_opts,
    ) {
        Ok(images) => images,
        Err(e) => {
            fail_fatal(&ctx.pool, document_id, &e.to_string()).await;
            return Ok(());
        }
    };

    let rows: Vec<PageImage> = extracted
        .iter()
        .map(|img| PageImage {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            page_number: img.page_number,
            image_index: img.image_index,
            storage_path: img.storage_path.display().to_string(),
            width: img.width,
            height: img.height,
            format: img.format.clone(),
            file_size: img.file_size,
            ocr_text: None,
            ocr_confidence: 0.0,
            ocr_status: OcrStatus::Pending,
        })
        .collect();
    store::insert_page_images(&ctx.pool, &rows).await?;
    store::set_image_count(&ctx.pool, document_id, rows.len() as i64).await?;
    info!(document_id, images = rows.len(), "image extraction complete");

    // Stages 3–5. Item-level failures are isolated inside; anything that
    // escapes fails the document but keeps the rows written so far.
    if let Err(e) = run_tail_stages(ctx, &doc, &extraction).await {
        error!(document_id, error = %e, "pipeline failed past extraction");
        if let Err(se) =
            store::set_embedding_status(&ctx.pool, document_id, DocumentStatus::Failed).await
        {
            error!(document_id, error = %se, "failed to record embedding failure");
        }
        store::set_status(
            &ctx.pool,
            document_id,
            DocumentStatus::Failed,
            Some(&e.to_string()),
        )
        .await?;
    }

    Ok(())
}

/// Stages 3 (OCR), 4 (chunk + embed), and 5 (finalize).
async fn run_tail_stages(
    ctx: &PipelineContext,
    doc: &Document,
    extraction: &extract::Extraction,
) -> Result<()> {
    let pool = &ctx.pool;
    let cfg = &ctx.config;
    let document_id = doc.id.as_str();

    // Stage 3: OCR. Partial coverage is an accepted degraded outcome;
    // this stage cannot fail the document.
    info!(document_id, "stage 3/5: OCR");
    let pending = store::pending_ocr_images(pool, document_id).await?;
    let items: Vec<OcrItem> = pending
        .into_iter()
        .map(|(image_id, path)| OcrItem {
            image_id,
            path: PathBuf::from(path),
        })
        .collect();

    let results = ocr::run_batch(
        ctx.ocr_primary.clone(),
        ctx.ocr_fallback.clone(),
        items,
        &BatchOptions::from_config(&cfg.ocr),
    )
    .await;

    for result in &results {
        store::update_image_ocr(
            pool,
            &result.image_id,
            &result.text,
            result.confidence,
            result.status,
        )
        .await?;
    }

    let (completed, failed) = ocr::partition(&results);
    if !failed.is_empty() {
        warn!(
            document_id,
            completed = completed.len(),
            failed = failed.len(),
            "OCR finished with per-image failures"
        );
    } else {
        info!(document_id, completed = completed.len(), "OCR complete");
    }

    // Stage 4: chunk + embed.
    info!(document_id, "stage 4/5: chunk and embed");
    let images = store::list_page_images(pool, document_id).await?;
    let ocr_sources: Vec<OcrSource> = images
        .iter()
        .filter(|img| img.ocr_status == OcrStatus::Completed)
        .filter_map(|img| {
            img.ocr_text.as_ref().map(|text| OcrSource {
                image_id: img.id.clone(),
                page_number: img.page_number,
                text: text.clone(),
            })
        })
        .collect();

    let descriptors = chunker::merge_sources(
        &extraction.windows,
        &ocr_sources,
        cfg.chunking.window_chars,
        cfg.chunking.overlap_chars,
    );

    store::set_embedding_status(pool, document_id, DocumentStatus::Processing).await?;
    let outcome = indexer::index_chunks(
        pool,
        ctx.embedder.as_deref(),
        &cfg.embedding,
        &doc.owner_id,
        document_id,
        descriptors,
    )
    .await?;
    store::set_embedding_status(pool, document_id, DocumentStatus::Completed).await?;
    info!(
        document_id,
        indexed = outcome.indexed,
        failed = outcome.failed,
        "chunk and embed complete"
    );

    // Stage 5: finalize.
    store::set_status(pool, document_id, DocumentStatus::Completed, None).await?;
    info!(document_id, "stage 5/5: finalized");

    Ok(())
}

async fn fail_fatal(pool: &SqlitePool, document_id: &str, message: &str) {
    error!(document_id, error = message, "fatal pipeline failure");
    if let Err(e) = store::set_status(pool, document_id, DocumentStatus::Failed, Some(message)).await
    {
        error!(document_id, error = %e, "failed to record document failure");
    }
}

/// Bounded job queue feeding a fixed pool of pipeline workers. The
/// document id is the sole handoff between the submitting request and
/// the background run.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<String>,
}

impl IngestQueue {
    pub fn start(ctx: Arc<PipelineContext>, workers: usize, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<String>(depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let ctx = ctx.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(document_id) => {
                            info!(worker, %document_id, "ingest worker picked up document");
                            if let Err(e) = run_pipeline(&ctx, &document_id).await {
                                error!(%document_id, error = %e, "pipeline aborted");
                            }
                        }
                        None => break,
                    }
                }
            });
        }

        Self { tx }
    }

    pub async fn submit(&self, document_id: String) -> Result<()> {
        self.tx
            .send(document_id)
            .await
            .map_err(|_| anyhow!("ingest queue is closed"))
    }
}
