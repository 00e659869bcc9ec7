//! # Citeline CLI
//!
//! The `citeline` binary runs the ingestion/retrieval service and offers
//! one-off commands for operating on a database directly.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `citeline init` | Create the SQLite database and run schema migrations |
//! | `citeline serve` | Start the HTTP API and background ingest workers |
//! | `citeline ingest <file> --owner <id>` | Ingest one PDF inline and wait for it |
//! | `citeline status <id>` | Show a document's state and progress |
//! | `citeline reprocess <id>` | Re-run the pipeline for an existing document |
//! | `citeline search "<query>" --owner <id>` | Rank an owner's chunks against a query |
//! | `citeline delete <id>` | Delete a document with its images and chunks |
//!
//! ## Examples
//!
//! ```bash
//! citeline init --config ./config/citeline.toml
//! citeline serve --config ./config/citeline.toml
//! citeline ingest ./manuals/pump-a7.pdf --owner user-1
//! citeline search "impeller clearance" --owner user-1 --top-k 5
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use citeline::pipeline::{IngestQueue, PipelineContext};
use citeline::{config, db, migrate, pipeline, progress, search, server, store};

/// Citeline — a PDF ingestion pipeline and semantic retrieval service
/// for page-cited question answering.
#[derive(Parser)]
#[command(
    name = "citeline",
    about = "Citeline — PDF ingestion and semantic retrieval for page-cited answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/citeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, page_images, chunks). Idempotent.
    Init,

    /// Start the HTTP server and background ingest workers.
    Serve,

    /// Ingest a single PDF inline and wait for the pipeline to finish.
    Ingest {
        /// Path to the PDF file.
        file: PathBuf,

        /// Owner account id the document (and its chunks) belong to.
        #[arg(long)]
        owner: String,
    },

    /// Show a document's state and projected progress.
    Status {
        /// Document UUID.
        id: String,
    },

    /// Re-run the full pipeline for an existing document, re-deriving
    /// its images and chunks.
    Reprocess {
        /// Document UUID.
        id: String,
    },

    /// Search an owner's indexed chunks.
    Search {
        /// The search query string.
        query: String,

        /// Owner account id to search within.
        #[arg(long)]
        owner: String,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity score, 0.0–1.0.
        #[arg(long)]
        min_score: Option<f32>,
    },

    /// Delete a document and all of its images and chunks.
    Delete {
        /// Document UUID.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            std::fs::create_dir_all(&cfg.storage.output_dir)?;

            let cfg = Arc::new(cfg);
            let ctx = Arc::new(PipelineContext::new(pool, cfg.clone())?);
            let queue = IngestQueue::start(ctx.clone(), cfg.ingest.workers, cfg.ingest.queue_depth);

            server::run_server(ctx, queue).await?;
        }
        Commands::Ingest { file, owner } => {
            let pool = db::connect(&cfg).await?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document.pdf".to_string());
            let storage_path = std::fs::canonicalize(&file)?;

            let ctx = PipelineContext::new(pool, Arc::new(cfg))?;
            let doc = store::create_document(
                &ctx.pool,
                &owner,
                &filename,
                &storage_path.to_string_lossy(),
            )
            .await?;

            println!("ingest {}", doc.id);
            pipeline::run_pipeline(&ctx, &doc.id).await?;

            let doc = store::get_document(&ctx.pool, &doc.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("document vanished during ingest"))?;
            let chunks = store::count_chunks(&ctx.pool, &doc.id).await?;
            println!("  status: {}", doc.status.as_str());
            println!("  embedding: {}", doc.embedding_status.as_str());
            println!("  pages: {}", doc.page_count);
            println!("  images: {}", doc.image_count);
            println!("  chunks: {}", chunks);
            if let Some(err) = &doc.processing_error {
                println!("  error: {}", err);
            }
            ctx.pool.close().await;
        }
        Commands::Reprocess { id } => {
            let pool = db::connect(&cfg).await?;
            let ctx = PipelineContext::new(pool, Arc::new(cfg))?;
            if store::get_document(&ctx.pool, &id).await?.is_none() {
                println!("No document with id {}", id);
                ctx.pool.close().await;
                return Ok(());
            }

            pipeline::run_pipeline(&ctx, &id).await?;

            let doc = store::get_document(&ctx.pool, &id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("document vanished during reprocess"))?;
            println!("reprocess {}", doc.id);
            println!("  status: {}", doc.status.as_str());
            println!("  embedding: {}", doc.embedding_status.as_str());
            println!(
                "  pages: {}, images: {}, chunks: {}",
                doc.page_count,
                doc.image_count,
                store::count_chunks(&ctx.pool, &doc.id).await?
            );
            ctx.pool.close().await;
        }
        Commands::Status { id } => {
            let pool = db::connect(&cfg).await?;
            let Some(doc) = store::get_document(&pool, &id).await? else {
                println!("No document with id {}", id);
                pool.close().await;
                return Ok(());
            };
            let (ocr_done, _) = store::ocr_progress(&pool, &id).await?;
            let p = progress::project(
                doc.status,
                doc.embedding_status,
                doc.image_count,
                ocr_done,
            );

            println!("{} — {}", doc.id, doc.filename);
            println!("  status: {} ({}%, {})", doc.status.as_str(), p.percent, p.stage);
            println!("  embedding: {}", doc.embedding_status.as_str());
            println!("  pages: {}, images: {}", doc.page_count, doc.image_count);
            if let Some(err) = &doc.processing_error {
                println!("  error: {}", err);
            }
            pool.close().await;
        }
        Commands::Search {
            query,
            owner,
            top_k,
            min_score,
        } => {
            let pool = db::connect(&cfg).await?;
            let top_k = top_k.unwrap_or(cfg.search.top_k);
            let min_score = min_score.unwrap_or(cfg.search.min_score);

            let ctx = PipelineContext::new(pool, Arc::new(cfg))?;
            let hits = search::search(
                &ctx.pool,
                ctx.embedder.as_deref(),
                &owner,
                &query,
                top_k,
                Some(min_score),
            )
            .await?;

            if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] page {} ({})",
                        i + 1,
                        hit.score,
                        hit.page_number,
                        hit.source_type.as_str()
                    );
                    println!("    excerpt: \"{}\"", excerpt(&hit.text));
                    println!("    document: {}", hit.document_id);
                    println!();
                }
            }
            ctx.pool.close().await;
        }
        Commands::Delete { id } => {
            let pool = db::connect(&cfg).await?;
            if store::delete_document(&pool, &id).await? {
                println!("Deleted {}", id);
            } else {
                println!("No document with id {}", id);
            }
            pool.close().await;
        }
    }

    Ok(())
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.chars().count() <= 160 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(160).collect();
        format!("{}...", cut)
    }
}
