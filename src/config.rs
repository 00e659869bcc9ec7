use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pdf: PdfConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory for rendered page images and extracted embedded images.
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PdfConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_image_quality")]
    pub image_quality: u32,
    /// Pages with fewer words than this are rendered as images for OCR.
    #[serde(default = "default_min_words_for_render")]
    pub min_words_for_render: usize,
    /// Embedded images smaller than this on either axis are skipped
    /// (logos, icons).
    #[serde(default = "default_min_image_px")]
    pub min_image_px: i64,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            dpi: default_dpi(),
            image_quality: default_image_quality(),
            min_words_for_render: default_min_words_for_render(),
            min_image_px: default_min_image_px(),
        }
    }
}

fn default_max_pages() -> usize {
    1500
}
fn default_dpi() -> u32 {
    100
}
fn default_image_quality() -> u32 {
    85
}
fn default_min_words_for_render() -> usize {
    50
}
fn default_min_image_px() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_window_chars() -> usize {
    500
}
fn default_overlap_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// `"hosted"` or `"disabled"`. The hosted provider also requires the
    /// `OCR_SPACE_API_KEY` environment variable.
    #[serde(default = "default_ocr_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_ocr_engine")]
    pub engine: u32,
    #[serde(default = "default_ocr_language")]
    pub language: String,
    /// Concurrency cap for hosted OCR requests, independent of batch size.
    #[serde(default = "default_ocr_concurrency")]
    pub max_concurrency: usize,
    /// Worker count when the fallback engine processes a whole batch.
    #[serde(default = "default_fallback_workers")]
    pub fallback_workers: usize,
    /// When > 0, hosted requests are issued sequentially with this delay
    /// between them instead of the concurrency cap.
    #[serde(default)]
    pub rate_limit_delay_ms: u64,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
    #[serde(default = "default_fallback_cmd")]
    pub fallback_cmd: String,
    #[serde(default = "default_ocr_language")]
    pub fallback_language: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_ocr_provider(),
            endpoint: None,
            engine: default_ocr_engine(),
            language: default_ocr_language(),
            max_concurrency: default_ocr_concurrency(),
            fallback_workers: default_fallback_workers(),
            rate_limit_delay_ms: 0,
            timeout_secs: default_ocr_timeout_secs(),
            fallback_enabled: default_fallback_enabled(),
            fallback_cmd: default_fallback_cmd(),
            fallback_language: default_ocr_language(),
        }
    }
}

fn default_ocr_provider() -> String {
    "disabled".to_string()
}
fn default_ocr_engine() -> u32 {
    2
}
fn default_ocr_language() -> String {
    "eng".to_string()
}
fn default_ocr_concurrency() -> usize {
    4
}
fn default_fallback_workers() -> usize {
    4
}
fn default_ocr_timeout_secs() -> u64 {
    30
}
fn default_fallback_enabled() -> bool {
    true
}
fn default_fallback_cmd() -> String {
    "tesseract".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"voyage"`, `"ollama"`, or `"disabled"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Fixed delay between consecutive embedding calls while indexing —
    /// simple backpressure against provider throttling.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    100
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_ingest_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_ingest_workers() -> usize {
    2
}
fn default_queue_depth() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_min_score() -> f32 {
    0.3
}

/// Which external capabilities are actually usable, resolved once at
/// startup from config + environment. Callers branch on these booleans
/// instead of probing clients for presence.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub ocr_primary: bool,
    pub ocr_fallback: bool,
    pub embedding: bool,
}

impl Config {
    pub fn capabilities(&self) -> Capabilities {
        let ocr_primary =
            self.ocr.provider == "hosted" && std::env::var("OCR_SPACE_API_KEY").is_ok();
        let embedding = match self.embedding.provider.as_str() {
            "voyage" => std::env::var("VOYAGE_API_KEY").is_ok(),
            "ollama" => true,
            _ => false,
        };
        Capabilities {
            ocr_primary,
            ocr_fallback: self.ocr.fallback_enabled,
            embedding,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.window_chars == 0 {
        anyhow::bail!("chunking.window_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.window_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.window_chars");
    }

    if config.pdf.max_pages == 0 {
        anyhow::bail!("pdf.max_pages must be > 0");
    }

    match config.ocr.provider.as_str() {
        "disabled" | "hosted" => {}
        other => anyhow::bail!(
            "Unknown OCR provider: '{}'. Must be disabled or hosted.",
            other
        ),
    }
    if config.ocr.max_concurrency == 0 || config.ocr.fallback_workers == 0 {
        anyhow::bail!("ocr.max_concurrency and ocr.fallback_workers must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "voyage" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, voyage, or ollama.",
            other
        ),
    }

    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be > 0");
    }
    if config.search.top_k == 0 {
        anyhow::bail!("search.top_k must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
[db]
path = "/tmp/citeline.sqlite"

[server]
bind = "127.0.0.1:7431"

[storage]
output_dir = "/tmp/citeline-images"
"#
        .to_string()
    }

    #[test]
    fn defaults_fill_in() {
        let cfg: Config = toml::from_str(&base_toml()).unwrap();
        assert_eq!(cfg.chunking.window_chars, 500);
        assert_eq!(cfg.chunking.overlap_chars, 50);
        assert_eq!(cfg.pdf.min_words_for_render, 50);
        assert_eq!(cfg.ocr.provider, "disabled");
        assert_eq!(cfg.embedding.provider, "disabled");
        assert!(!cfg.embedding.is_enabled());
        validate(&cfg).unwrap();
    }

    #[test]
    fn rejects_overlap_at_window() {
        let toml = base_toml()
            + r#"
[chunking]
window_chars = 100
overlap_chars = 100
"#;
        let cfg: Config = toml::from_str(&toml).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let toml = base_toml()
            + r#"
[embedding]
provider = "voyage"
"#;
        let cfg: Config = toml::from_str(&toml).unwrap();
        assert!(validate(&cfg).is_err());

        let toml = base_toml()
            + r#"
[embedding]
provider = "voyage"
model = "voyage-large-2"
dims = 1536
"#;
        let cfg: Config = toml::from_str(&toml).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn unknown_providers_rejected() {
        let toml = base_toml()
            + r#"
[ocr]
provider = "easyocr"
"#;
        let cfg: Config = toml::from_str(&toml).unwrap();
        assert!(validate(&cfg).is_err());
    }
}
