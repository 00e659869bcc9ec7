//! Text extraction boundary for uploaded PDFs.
//!
//! Wraps the PDF parser (lopdf) behind the shape the pipeline consumes:
//! full text, a page count, and pre-chunked text windows tagged with page
//! numbers. A document that cannot be opened (or exceeds the page cap)
//! fails the whole pipeline; a single page that fails to yield text is
//! recorded as empty and extraction continues.

use tracing::warn;

use crate::chunker::{self, TextWindow};

/// Extraction error. Any of these is fatal to the owning document's
/// pipeline run.
#[derive(Debug)]
pub enum ExtractError {
    Open(String),
    TooManyPages { got: usize, max: usize },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Open(e) => write!(f, "failed to open PDF: {}", e),
            ExtractError::TooManyPages { got, max } => {
                write!(f, "PDF has {} pages, maximum is {}", got, max)
            }
        }
    }
}

impl std::error::Error for ExtractError {}

/// Text content of one page.
#[derive(Debug, Clone)]
pub struct PageText {
    pub page_number: i64,
    pub text: String,
    pub word_count: usize,
}

/// Everything the text-extraction stage hands to the rest of the pipeline.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub page_count: usize,
    pub pages: Vec<PageText>,
    pub windows: Vec<TextWindow>,
}

/// Extract per-page text and pre-chunked windows from a PDF on disk.
pub fn parse_pdf(
    path: &std::path::Path,
    max_pages: usize,
    window_chars: usize,
    overlap_chars: usize,
) -> Result<Extraction, ExtractError> {
    let doc = lopdf::Document::load(path).map_err(|e| ExtractError::Open(e.to_string()))?;

    let page_map = doc.get_pages();
    let page_count = page_map.len();
    if page_count > max_pages {
        return Err(ExtractError::TooManyPages {
            got: page_count,
            max: max_pages,
        });
    }

    let mut pages = Vec::with_capacity(page_count);
    let mut windows = Vec::new();
    let mut chunk_index: i64 = 0;

    for &page_number in page_map.keys() {
        let text = match doc.extract_text(&[page_number]) {
            Ok(t) => t,
            Err(e) => {
                warn!(page = page_number, error = %e, "page text extraction failed");
                String::new()
            }
        };

        let word_count = text.split_whitespace().count();

        for piece in chunker::chunk_text(&text, window_chars, overlap_chars) {
            windows.push(TextWindow {
                text: piece,
                chunk_index,
                page_number: page_number as i64,
            });
            chunk_index += 1;
        }

        pages.push(PageText {
            page_number: page_number as i64,
            text,
            word_count,
        });
    }

    Ok(Extraction {
        page_count,
        pages,
        windows,
    })
}
