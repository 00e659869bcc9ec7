//! Core data models used throughout Citeline.
//!
//! These types represent the documents, page images, and chunks that flow
//! through the ingestion pipeline and retrieval engine.

use serde::{Deserialize, Serialize};

/// Lifecycle of a document (and, separately, of its embedding sub-lifecycle).
///
/// Document status only moves forward: pending → processing → completed,
/// or to failed from pending/processing. It never regresses; the store
/// layer rejects backwards transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    /// Identity transitions are allowed so status writes stay idempotent.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Processing) | (Pending, Failed) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

/// Per-image OCR state. Written once by the OCR stage; never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrStatus {
    Pending,
    Completed,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Pending => "pending",
            OcrStatus::Completed => "completed",
            OcrStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OcrStatus::Pending),
            "completed" => Some(OcrStatus::Completed),
            "failed" => Some(OcrStatus::Failed),
            _ => None,
        }
    }
}

/// Where a chunk's text came from: native PDF text or OCR over a page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    PdfText,
    ImageOcr,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::PdfText => "pdf_text",
            SourceType::ImageOcr => "image_ocr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf_text" => Some(SourceType::PdfText),
            "image_ocr" => Some(SourceType::ImageOcr),
            _ => None,
        }
    }
}

/// One uploaded document. Mutated only by the ingestion pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub storage_path: String,
    pub status: DocumentStatus,
    pub embedding_status: DocumentStatus,
    pub page_count: i64,
    pub image_count: i64,
    pub processing_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One raster image extracted from a document (full-page render or
/// embedded image). `(document_id, page_number, image_index)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct PageImage {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    pub image_index: i64,
    pub storage_path: String,
    pub width: i64,
    pub height: i64,
    pub format: String,
    pub file_size: i64,
    pub ocr_text: Option<String>,
    pub ocr_confidence: f64,
    pub ocr_status: OcrStatus,
}

/// A text window with provenance, before embedding.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub text: String,
    pub page_number: i64,
    pub source_type: SourceType,
    /// Set iff `source_type` is `ImageOcr`. Ownership relation only;
    /// chunks are deleted with their document, never with the image.
    pub source_image_id: Option<String>,
}

/// A persisted chunk with its embedding vector attached. Immutable.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub owner_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub page_number: i64,
    pub source_type: SourceType,
    pub source_image_id: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A ranked retrieval result returned by the search engine.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub page_number: i64,
    pub source_type: SourceType,
    pub text: String,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn status_roundtrip() {
        for s in ["pending", "processing", "completed", "failed"] {
            assert_eq!(DocumentStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(DocumentStatus::parse("bogus").is_none());
    }

    #[test]
    fn source_type_roundtrip() {
        assert_eq!(SourceType::parse("pdf_text"), Some(SourceType::PdfText));
        assert_eq!(SourceType::parse("image_ocr"), Some(SourceType::ImageOcr));
        assert_eq!(SourceType::ImageOcr.as_str(), "image_ocr");
        assert!(SourceType::parse("text").is_none());
    }
}
