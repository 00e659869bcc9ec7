//! OCR engines and the batch scheduler.
//!
//! Two engine implementations sit behind the [`OcrEngine`] trait: a
//! hosted HTTP provider (primary) and a local `tesseract` process
//! (fallback). The scheduler in [`run_batch`] fans a batch of page
//! images across the primary under a bounded concurrency cap, falls back
//! per item on primary errors or empty output, and always returns
//! exactly one result per input item.
//!
//! Confidence scores are heuristics for ordering, not calibrated
//! probabilities; the two engines compute them differently.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Capabilities, OcrConfig};
use crate::models::OcrStatus;

/// What an engine recognized in one image.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub text: String,
    pub confidence: f64,
}

/// A single OCR engine. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;
    async fn recognize(&self, image_path: &Path) -> Result<OcrOutcome>;
}

/// One unit of scheduler input.
#[derive(Debug, Clone)]
pub struct OcrItem {
    pub image_id: String,
    pub path: PathBuf,
}

/// One unit of scheduler output — exactly one per input item.
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub image_id: String,
    pub text: String,
    pub confidence: f64,
    pub status: OcrStatus,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Concurrency cap for primary-engine calls, independent of batch size.
    pub max_concurrency: usize,
    /// Worker count when only the fallback engine is available.
    pub fallback_workers: usize,
    /// When set, primary calls are issued sequentially with this delay
    /// between requests instead of using the concurrency cap. For
    /// providers with a strict requests-per-second ceiling.
    pub rate_limit_delay: Option<Duration>,
}

impl BatchOptions {
    pub fn from_config(config: &OcrConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            fallback_workers: config.fallback_workers,
            rate_limit_delay: match config.rate_limit_delay_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}

/// Run OCR over a batch of images.
///
/// Output is one-to-one with input, in input order. An item that fails
/// every available engine yields empty text, zero confidence, and
/// `failed` status; it never blocks the rest of the batch and is never
/// retried beyond the single fallback attempt.
pub async fn run_batch(
    primary: Option<Arc<dyn OcrEngine>>,
    fallback: Option<Arc<dyn OcrEngine>>,
    items: Vec<OcrItem>,
    opts: &BatchOptions,
) -> Vec<OcrResult> {
    if items.is_empty() {
        return Vec::new();
    }

    info!(
        batch = items.len(),
        primary = primary.as_ref().map(|e| e.name()).unwrap_or("none"),
        fallback = fallback.as_ref().map(|e| e.name()).unwrap_or("none"),
        "starting OCR batch"
    );

    if primary.is_none() && fallback.is_none() {
        return items
            .iter()
            .map(|item| failed_result(&item.image_id))
            .collect();
    }

    // Rate-limited mode: sequential with a fixed inter-request delay.
    if primary.is_some() {
        if let Some(delay) = opts.rate_limit_delay {
            let mut results = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(delay).await;
                }
                results.push(process_item(primary.as_deref(), fallback.as_deref(), item).await);
            }
            return results;
        }
    }

    // Concurrent mode: primary calls capped by a semaphore; with no
    // primary configured, the fallback runs as a bounded worker pool.
    let cap = if primary.is_some() {
        opts.max_concurrency
    } else {
        opts.fallback_workers
    };
    let semaphore = Arc::new(Semaphore::new(cap.max(1)));

    let mut set: JoinSet<(usize, OcrResult)> = JoinSet::new();
    for (idx, item) in items.iter().cloned().enumerate() {
        let primary = primary.clone();
        let fallback = fallback.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            // Permit release is tied to task scope; a panicking task
            // cannot leak a slot.
            let _permit = semaphore.acquire_owned().await;
            let result = process_item(primary.as_deref(), fallback.as_deref(), &item).await;
            (idx, result)
        });
    }

    // Pre-fill with failures so an aborted task still leaves a
    // one-to-one result list.
    let mut results: Vec<OcrResult> = items
        .iter()
        .map(|item| failed_result(&item.image_id))
        .collect();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, result)) => results[idx] = result,
            Err(e) => warn!(error = %e, "OCR task aborted"),
        }
    }

    results
}

/// Split a batch result into (completed, failed) views.
pub fn partition(results: &[OcrResult]) -> (Vec<&OcrResult>, Vec<&OcrResult>) {
    results
        .iter()
        .partition(|r| r.status == OcrStatus::Completed)
}

async fn process_item(
    primary: Option<&dyn OcrEngine>,
    fallback: Option<&dyn OcrEngine>,
    item: &OcrItem,
) -> OcrResult {
    if !item.path.exists() {
        warn!(image_id = %item.image_id, path = %item.path.display(), "image file missing");
        return failed_result(&item.image_id);
    }

    let mut empty_success = false;

    if let Some(engine) = primary {
        match engine.recognize(&item.path).await {
            Ok(outcome) if !outcome.text.trim().is_empty() => {
                return completed_result(&item.image_id, outcome);
            }
            Ok(_) => {
                debug!(image_id = %item.image_id, engine = engine.name(), "empty text, trying fallback");
                empty_success = true;
            }
            Err(e) => {
                warn!(image_id = %item.image_id, engine = engine.name(), error = %e, "primary OCR failed");
            }
        }
    }

    if let Some(engine) = fallback {
        match engine.recognize(&item.path).await {
            Ok(outcome) => {
                return completed_result(&item.image_id, outcome);
            }
            Err(e) => {
                warn!(image_id = %item.image_id, engine = engine.name(), error = %e, "fallback OCR failed");
            }
        }
    }

    // A primary that succeeded with no text is still a degraded success
    // when nothing better is available.
    if empty_success {
        return OcrResult {
            image_id: item.image_id.clone(),
            text: String::new(),
            confidence: 0.0,
            status: OcrStatus::Completed,
        };
    }

    failed_result(&item.image_id)
}

fn completed_result(image_id: &str, outcome: OcrOutcome) -> OcrResult {
    OcrResult {
        image_id: image_id.to_string(),
        text: clean_text(&outcome.text),
        confidence: outcome.confidence,
        status: OcrStatus::Completed,
    }
}

fn failed_result(image_id: &str) -> OcrResult {
    OcrResult {
        image_id: image_id.to_string(),
        text: String::new(),
        confidence: 0.0,
        status: OcrStatus::Failed,
    }
}

fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build (primary, fallback) engines from config and resolved
/// capabilities.
pub fn engines_from_config(
    config: &OcrConfig,
    caps: &Capabilities,
) -> (Option<Arc<dyn OcrEngine>>, Option<Arc<dyn OcrEngine>>) {
    let primary: Option<Arc<dyn OcrEngine>> = if caps.ocr_primary {
        match HostedOcr::from_config(config) {
            Ok(engine) => Some(Arc::new(engine)),
            Err(e) => {
                warn!(error = %e, "hosted OCR unavailable");
                None
            }
        }
    } else {
        None
    };

    let fallback: Option<Arc<dyn OcrEngine>> = if caps.ocr_fallback {
        Some(Arc::new(TesseractOcr {
            cmd: config.fallback_cmd.clone(),
            language: config.fallback_language.clone(),
        }))
    } else {
        None
    };

    (primary, fallback)
}

// ============ Hosted engine ============

/// Hosted OCR over HTTP (ocr.space wire format). The provider reports no
/// per-word confidence, so the score is a legibility heuristic: the
/// fraction of recognized tokens containing an alphanumeric character.
pub struct HostedOcr {
    endpoint: String,
    api_key: String,
    engine: u32,
    language: String,
    timeout_secs: u64,
}

impl HostedOcr {
    pub fn from_config(config: &OcrConfig) -> Result<Self> {
        let api_key = std::env::var("OCR_SPACE_API_KEY")
            .map_err(|_| anyhow::anyhow!("OCR_SPACE_API_KEY environment variable not set"))?;
        Ok(Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.ocr.space/parse/image".to_string()),
            api_key,
            engine: config.engine,
            language: config.language.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl OcrEngine for HostedOcr {
    fn name(&self) -> &str {
        "hosted"
    }

    async fn recognize(&self, image_path: &Path) -> Result<OcrOutcome> {
        let bytes = tokio::fs::read(image_path)
            .await
            .with_context(|| format!("failed to read image: {}", image_path.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let form = [
            (
                "base64Image",
                format!("data:image/jpeg;base64,{}", encoded),
            ),
            ("language", self.language.clone()),
            ("OCREngine", self.engine.to_string()),
            ("scale", "true".to_string()),
        ];

        let response = client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("OCR API error {}: {}", status, body);
        }

        let json: serde_json::Value = response.json().await?;

        if json
            .get("IsErroredOnProcessing")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            let message = json
                .get("ErrorMessage")
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unknown provider error".to_string());
            bail!("OCR provider error: {}", message);
        }

        let text = json
            .get("ParsedResults")
            .and_then(|r| r.as_array())
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r.get("ParsedText").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        let confidence = legibility_confidence(&text);
        Ok(OcrOutcome { text, confidence })
    }
}

fn legibility_confidence(text: &str) -> f64 {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let legible = tokens
        .iter()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .count();
    (legible as f64 / tokens.len() as f64 * 100.0).round()
}

// ============ Tesseract fallback ============

/// Local OCR via the `tesseract` binary in TSV mode. Slower than the
/// hosted engine but needs no credentials. Confidence is the mean of
/// tesseract's per-word scores.
pub struct TesseractOcr {
    pub cmd: String,
    pub language: String,
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, image_path: &Path) -> Result<OcrOutcome> {
        let output = tokio::process::Command::new(&self.cmd)
            .arg(image_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("tsv")
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.cmd))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse tesseract TSV output: keep rows with a word-level confidence,
/// join their text, average their scores.
fn parse_tsv(tsv: &str) -> OcrOutcome {
    let mut words = Vec::new();
    let mut confidences = Vec::new();

    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let conf: f64 = match cols[10].parse() {
            Ok(c) => c,
            Err(_) => continue,
        };
        let word = cols[11].trim();
        if conf < 0.0 || word.is_empty() {
            continue;
        }
        words.push(word);
        confidences.push(conf);
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    OcrOutcome {
        text: words.join(" "),
        confidence,
    }
}
