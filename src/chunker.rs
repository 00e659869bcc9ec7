//! Sliding-window text chunker.
//!
//! Splits text into overlapping fixed-size character windows after
//! collapsing whitespace runs to single spaces. Normalization means the
//! windows are readable but not byte-offset reproducible against the
//! original layout; provenance is tracked at page granularity instead.

use crate::models::{ChunkDescriptor, SourceType};

pub const DEFAULT_WINDOW_CHARS: usize = 500;
pub const DEFAULT_OVERLAP_CHARS: usize = 50;

/// Candidate windows shorter than this are dropped rather than emitted
/// as tiny, low-value chunks.
pub const MIN_CHUNK_CHARS: usize = 20;

/// OCR text shorter than this is not worth indexing.
pub const MIN_OCR_CHARS: usize = 50;

/// Split `text` into overlapping windows of `window` characters, each
/// window starting `window - overlap` after the previous one.
/// Empty or whitespace-only input yields an empty list.
pub fn chunk_text(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = normalized.chars().collect();
    let step = if overlap < window {
        window - overlap
    } else {
        window
    };

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let end = (start + window).min(chars.len());
        if end - start >= MIN_CHUNK_CHARS {
            chunks.push(chars[start..end].iter().collect());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Collapse all whitespace runs to single spaces and trim.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A text window produced by the extraction boundary, tagged with the
/// page it came from.
#[derive(Debug, Clone)]
pub struct TextWindow {
    pub text: String,
    pub chunk_index: i64,
    pub page_number: i64,
}

/// OCR output for one image, ready for merging into the chunk list.
#[derive(Debug, Clone)]
pub struct OcrSource {
    pub image_id: String,
    pub page_number: i64,
    pub text: String,
}

/// Merge native-text windows with chunked OCR text into one ordered
/// descriptor list. OCR text at or below [`MIN_OCR_CHARS`] characters is
/// skipped. Final chunk indices are assigned by the indexer over the
/// combined order.
pub fn merge_sources(
    windows: &[TextWindow],
    ocr_sources: &[OcrSource],
    window: usize,
    overlap: usize,
) -> Vec<ChunkDescriptor> {
    let mut descriptors: Vec<ChunkDescriptor> = windows
        .iter()
        .map(|w| ChunkDescriptor {
            text: w.text.clone(),
            page_number: w.page_number,
            source_type: SourceType::PdfText,
            source_image_id: None,
        })
        .collect();

    for source in ocr_sources {
        if source.text.trim().chars().count() <= MIN_OCR_CHARS {
            continue;
        }
        for piece in chunk_text(&source.text, window, overlap) {
            descriptors.push(ChunkDescriptor {
                text: piece,
                page_number: source.page_number,
                source_type: SourceType::ImageOcr,
                source_image_id: Some(source.image_id.clone()),
            });
        }
    }

    descriptors
}
