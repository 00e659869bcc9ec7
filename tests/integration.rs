//! End-to-end pipeline, store, and retrieval tests over a real SQLite
//! database and generated PDF files. External engines are replaced with
//! in-process stubs; no network or system OCR binary is required.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, Stream};
use sqlx::SqlitePool;
use tempfile::TempDir;

use citeline::config::Config;
use citeline::embedding::Embedder;
use citeline::models::{ChunkRecord, DocumentStatus, OcrStatus, PageImage, SourceType};
use citeline::pipeline::{run_pipeline, PipelineContext};
use citeline::{db, migrate, progress, search, store};

// ============ Fixtures ============

fn test_config(root: &Path) -> Config {
    let toml_str = format!(
        r#"
[db]
path = "{root}/data/citeline.sqlite"

[server]
bind = "127.0.0.1:0"

[storage]
output_dir = "{root}/images"
"#,
        root = root.display()
    );
    toml::from_str(&toml_str).unwrap()
}

async fn setup_pool(root: &Path) -> SqlitePool {
    let pool = db::connect_path(&root.join("data/citeline.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

/// Write a PDF with one Helvetica text run per page.
fn build_pdf(path: &Path, pages: &[&str]) {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
        }),
    );
    let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    doc.save(path).unwrap();
}

/// A sentence with enough words that the page skips the render-for-OCR
/// path, built around a distinctive vocabulary.
fn page_text(words: &str) -> String {
    let mut out = String::new();
    for _ in 0..20 {
        out.push_str(words);
        out.push(' ');
    }
    out
}

/// Deterministic test embedder: 26-dim letter-frequency histogram.
/// Similar vocabulary produces similar vectors, which is all ranking
/// tests need.
struct HistogramEmbedder;

#[async_trait]
impl Embedder for HistogramEmbedder {
    fn model_name(&self) -> &str {
        "histogram-test"
    }
    fn dims(&self) -> usize {
        26
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 26];
                for c in text.chars() {
                    let c = c.to_ascii_lowercase();
                    if c.is_ascii_lowercase() {
                        v[(c as u8 - b'a') as usize] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

fn context(pool: SqlitePool, cfg: Config, embedder: Option<Arc<dyn Embedder>>) -> PipelineContext {
    PipelineContext {
        pool,
        config: Arc::new(cfg),
        ocr_primary: None,
        ocr_fallback: None,
        embedder,
    }
}

async fn ingest_fixture(
    ctx: &PipelineContext,
    root: &Path,
    owner: &str,
    pages: &[&str],
) -> citeline::models::Document {
    let pdf = root.join("fixture.pdf");
    build_pdf(&pdf, pages);
    let doc = store::create_document(&ctx.pool, owner, "fixture.pdf", &pdf.display().to_string())
        .await
        .unwrap();
    run_pipeline(ctx, &doc.id).await.unwrap();
    store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap()
}

// ============ Pipeline lifecycle ============

#[tokio::test]
async fn pipeline_completes_without_any_providers() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let pool = setup_pool(tmp.path()).await;
    let ctx = context(pool, cfg, None);

    let p1 = page_text("alpha bravo candle");
    let p2 = page_text("zephyr quartz zigzag");
    let doc = ingest_fixture(&ctx, tmp.path(), "owner-1", &[&p1, &p2]).await;

    // Degraded completion: no OCR, no embeddings, still completed.
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.embedding_status, DocumentStatus::Completed);
    assert_eq!(doc.page_count, 2);
    assert_eq!(doc.image_count, 0);
    assert!(doc.processing_error.is_none());
    assert_eq!(store::count_chunks(&ctx.pool, &doc.id).await.unwrap(), 0);

    let p = progress::project(doc.status, doc.embedding_status, doc.image_count, 0);
    assert_eq!(p.percent, 100);
    assert_eq!(p.stage, "completed");
}

#[tokio::test]
async fn pipeline_indexes_chunks_and_search_is_page_accurate() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let pool = setup_pool(tmp.path()).await;
    let ctx = context(pool, cfg, Some(Arc::new(HistogramEmbedder)));

    let p1 = page_text("alpha bravo candle dorado ember");
    let p2 = page_text("zephyr quartz zigzag quizzical");
    let p3 = page_text("mellow mango morning meadow");
    let doc = ingest_fixture(&ctx, tmp.path(), "owner-1", &[&p1, &p2, &p3]).await;

    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.embedding_status, DocumentStatus::Completed);
    assert_eq!(doc.page_count, 3);
    assert!(store::count_chunks(&ctx.pool, &doc.id).await.unwrap() >= 3);

    let hits = search::search(
        &ctx.pool,
        ctx.embedder.as_deref(),
        "owner-1",
        "zephyr quartz zigzag quizzical",
        5,
        None,
    )
    .await
    .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].page_number, 2);
    assert_eq!(hits[0].source_type, SourceType::PdfText);
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score, "ordering must be descending");
    }
}

#[tokio::test]
async fn invalid_pdf_fails_the_document_with_an_error() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let pool = setup_pool(tmp.path()).await;
    let ctx = context(pool, cfg, None);

    let bogus = tmp.path().join("bogus.pdf");
    std::fs::write(&bogus, b"this is not a pdf").unwrap();
    let doc = store::create_document(&ctx.pool, "owner-1", "bogus.pdf", &bogus.display().to_string())
        .await
        .unwrap();
    run_pipeline(&ctx, &doc.id).await.unwrap();

    let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(doc
        .processing_error
        .as_deref()
        .unwrap()
        .contains("failed to open PDF"));
    // Embedding never started.
    assert_eq!(doc.embedding_status, DocumentStatus::Pending);
}

#[tokio::test]
async fn reprocessing_rederives_instead_of_appending() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let pool = setup_pool(tmp.path()).await;
    let ctx = context(pool, cfg, Some(Arc::new(HistogramEmbedder)));

    let p1 = page_text("alpha bravo candle dorado ember");
    let doc = ingest_fixture(&ctx, tmp.path(), "owner-1", &[&p1]).await;
    let first_count = store::count_chunks(&ctx.pool, &doc.id).await.unwrap();
    assert!(first_count > 0);

    run_pipeline(&ctx, &doc.id).await.unwrap();

    let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(
        store::count_chunks(&ctx.pool, &doc.id).await.unwrap(),
        first_count
    );
}

// ============ Store invariants ============

fn image_row(doc_id: &str, page: i64, index: i64) -> PageImage {
    PageImage {
        id: uuid::Uuid::new_v4().to_string(),
        document_id: doc_id.to_string(),
        page_number: page,
        image_index: index,
        storage_path: format!("/tmp/{}_p{}_i{}.jpg", doc_id, page, index),
        width: 800,
        height: 600,
        format: "jpg".to_string(),
        file_size: 1024,
        ocr_text: None,
        ocr_confidence: 0.0,
        ocr_status: OcrStatus::Pending,
    }
}

#[tokio::test]
async fn page_and_image_index_are_unique_together() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(tmp.path()).await;
    let doc = store::create_document(&pool, "owner-1", "a.pdf", "/tmp/a.pdf")
        .await
        .unwrap();

    store::insert_page_images(&pool, &[image_row(&doc.id, 1, 0), image_row(&doc.id, 1, 1)])
        .await
        .unwrap();

    let dup = store::insert_page_images(&pool, &[image_row(&doc.id, 1, 0)]).await;
    assert!(dup.is_err(), "duplicate (page, index) must be rejected");
}

#[tokio::test]
async fn status_never_regresses() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(tmp.path()).await;
    let doc = store::create_document(&pool, "owner-1", "a.pdf", "/tmp/a.pdf")
        .await
        .unwrap();

    store::set_status(&pool, &doc.id, DocumentStatus::Processing, None)
        .await
        .unwrap();
    store::set_status(&pool, &doc.id, DocumentStatus::Completed, None)
        .await
        .unwrap();

    assert!(store::set_status(&pool, &doc.id, DocumentStatus::Processing, None)
        .await
        .is_err());
    assert!(store::set_status(&pool, &doc.id, DocumentStatus::Failed, None)
        .await
        .is_err());

    let doc = store::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn ocr_updates_feed_the_progress_counters() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(tmp.path()).await;
    let doc = store::create_document(&pool, "owner-1", "a.pdf", "/tmp/a.pdf")
        .await
        .unwrap();

    let images = vec![
        image_row(&doc.id, 1, 0),
        image_row(&doc.id, 2, 0),
        image_row(&doc.id, 2, 1),
    ];
    store::insert_page_images(&pool, &images).await.unwrap();

    let (done, total) = store::ocr_progress(&pool, &doc.id).await.unwrap();
    assert_eq!((done, total), (0, 3));

    store::update_image_ocr(&pool, &images[0].id, "recognized text", 92.5, OcrStatus::Completed)
        .await
        .unwrap();
    store::update_image_ocr(&pool, &images[1].id, "", 0.0, OcrStatus::Failed)
        .await
        .unwrap();

    let (done, total) = store::ocr_progress(&pool, &doc.id).await.unwrap();
    assert_eq!((done, total), (2, 3));

    let stored = store::list_page_images(&pool, &doc.id).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].ocr_status, OcrStatus::Completed);
    assert_eq!(stored[0].ocr_text.as_deref(), Some("recognized text"));
    assert_eq!(stored[1].ocr_status, OcrStatus::Failed);
    assert_eq!(stored[2].ocr_status, OcrStatus::Pending);
}

// ============ Retrieval ============

fn chunk_row(owner: &str, doc_id: &str, index: i64, page: i64, vector: Vec<f32>) -> ChunkRecord {
    ChunkRecord {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner.to_string(),
        document_id: doc_id.to_string(),
        chunk_index: index,
        page_number: page,
        source_type: SourceType::PdfText,
        source_image_id: None,
        text: format!("chunk {} on page {}", index, page),
        embedding: vector,
    }
}

#[tokio::test]
async fn ranking_is_descending_and_thresholded() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(tmp.path()).await;
    let doc = store::create_document(&pool, "owner-1", "a.pdf", "/tmp/a.pdf")
        .await
        .unwrap();

    let chunks = vec![
        chunk_row("owner-1", &doc.id, 0, 1, vec![0.6, 0.8]),  // cos 0.6 vs [1,0]
        chunk_row("owner-1", &doc.id, 1, 2, vec![1.0, 1.0]),  // cos ~0.707
        chunk_row("owner-1", &doc.id, 2, 3, vec![1.0, 0.0]),  // cos 1.0
        chunk_row("owner-1", &doc.id, 3, 4, vec![1.0, 0.0, 0.0]), // stale dims -> 0
    ];
    store::insert_chunks(&pool, &chunks, "histogram-test", 2)
        .await
        .unwrap();

    let query = vec![1.0f32, 0.0];

    let hits = search::rank_by_vector(&pool, "owner-1", &query, 10, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 4);
    assert_eq!(hits[0].page_number, 3);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    // Mismatched vector length ranks last at exactly zero, no error.
    assert_eq!(hits[3].page_number, 4);
    assert_eq!(hits[3].score, 0.0);

    // Top-K truncation.
    let top2 = search::rank_by_vector(&pool, "owner-1", &query, 2, None)
        .await
        .unwrap();
    assert_eq!(top2.len(), 2);

    // Threshold keeps only strong matches.
    let strong = search::rank_by_vector(&pool, "owner-1", &query, 10, Some(0.65))
        .await
        .unwrap();
    assert_eq!(strong.len(), 2);

    // Threshold above the best score yields an empty list.
    let none = search::rank_by_vector(&pool, "owner-1", &query, 10, Some(1.01))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn search_is_scoped_to_the_owner() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(tmp.path()).await;
    let doc_a = store::create_document(&pool, "owner-a", "a.pdf", "/tmp/a.pdf")
        .await
        .unwrap();
    let doc_b = store::create_document(&pool, "owner-b", "b.pdf", "/tmp/b.pdf")
        .await
        .unwrap();

    store::insert_chunks(
        &pool,
        &[chunk_row("owner-a", &doc_a.id, 0, 1, vec![1.0, 0.0])],
        "histogram-test",
        2,
    )
    .await
    .unwrap();
    store::insert_chunks(
        &pool,
        &[chunk_row("owner-b", &doc_b.id, 0, 1, vec![1.0, 0.0])],
        "histogram-test",
        2,
    )
    .await
    .unwrap();

    let hits = search::rank_by_vector(&pool, "owner-a", &[1.0, 0.0], 10, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, doc_a.id);
}

#[tokio::test]
async fn empty_corpus_returns_empty_not_error() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(tmp.path()).await;

    let hits = search::rank_by_vector(&pool, "nobody", &[1.0, 0.0], 10, None)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn deletion_cascades_and_empties_search() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    let pool = setup_pool(tmp.path()).await;
    let ctx = context(pool, cfg, Some(Arc::new(HistogramEmbedder)));

    let p1 = page_text("alpha bravo candle dorado ember");
    let doc = ingest_fixture(&ctx, tmp.path(), "owner-1", &[&p1]).await;
    assert!(store::count_chunks(&ctx.pool, &doc.id).await.unwrap() > 0);

    assert!(store::delete_document(&ctx.pool, &doc.id).await.unwrap());

    assert!(store::get_document(&ctx.pool, &doc.id).await.unwrap().is_none());
    assert_eq!(store::count_chunks(&ctx.pool, &doc.id).await.unwrap(), 0);
    assert!(store::list_page_images(&ctx.pool, &doc.id)
        .await
        .unwrap()
        .is_empty());

    let hits = search::search(
        &ctx.pool,
        ctx.embedder.as_deref(),
        "owner-1",
        "alpha bravo candle",
        10,
        None,
    )
    .await
    .unwrap();
    assert!(hits.is_empty(), "deleted documents must never be retrievable");

    // Deleting again reports not-found rather than erroring.
    assert!(!store::delete_document(&ctx.pool, &doc.id).await.unwrap());
}

#[tokio::test]
async fn search_without_backend_degrades_to_empty() {
    let tmp = TempDir::new().unwrap();
    let pool = setup_pool(tmp.path()).await;

    let hits = search::search(&pool, None, "owner-1", "anything", 5, Some(0.3))
        .await
        .unwrap();
    assert!(hits.is_empty());
}

// ============ PDF fixtures sanity ============

#[tokio::test]
async fn generated_pdfs_extract_with_page_numbers() {
    let tmp = TempDir::new().unwrap();
    let pdf = tmp.path().join("sanity.pdf");
    let p1 = page_text("alpha bravo candle");
    let p2 = page_text("zephyr quartz zigzag");
    build_pdf(&pdf, &[&p1, &p2]);

    let extraction = citeline::extract::parse_pdf(&pdf, 100, 500, 50).unwrap();
    assert_eq!(extraction.page_count, 2);
    assert_eq!(extraction.pages.len(), 2);
    assert!(extraction.pages[0].text.contains("alpha"));
    assert!(extraction.pages[1].text.contains("zephyr"));
    assert!(extraction.windows.iter().any(|w| w.page_number == 2));
    assert!(extraction.pages[0].word_count >= 50);
}

#[tokio::test]
async fn page_cap_is_enforced() {
    let tmp = TempDir::new().unwrap();
    let pdf = tmp.path().join("toolong.pdf");
    let page = page_text("alpha bravo candle");
    build_pdf(&pdf, &[&page, &page, &page]);

    let err = citeline::extract::parse_pdf(&pdf, 2, 500, 50).unwrap_err();
    assert!(err.to_string().contains("maximum is 2"));
}
