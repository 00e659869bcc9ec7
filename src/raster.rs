//! Image extraction boundary for uploaded PDFs.
//!
//! Two sources of raster images per document:
//! 1. Pages with minimal native text are rendered whole (via the
//!    `pdftoppm` renderer) so OCR can recover scanned or diagram-heavy
//!    content. Rendered pages use image index 0.
//! 2. Embedded JPEG images (DCTDecode XObjects) are extracted directly
//!    from the PDF object tree, deduplicated by content hash, and saved
//!    with image indices starting at 1.
//!
//! Failing to open the PDF is fatal to the pipeline; failing to render
//! or extract one image is logged and skipped.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::extract::PageText;

#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub page_number: i64,
    pub image_index: i64,
    pub storage_path: PathBuf,
    pub width: i64,
    pub height: i64,
    pub format: String,
    pub file_size: i64,
}

#[derive(Debug, Clone)]
pub struct RasterOptions {
    pub dpi: u32,
    pub quality: u32,
    pub min_words_for_render: usize,
    pub min_image_px: i64,
}

/// Extract all raster images for a document: full renders of low-text
/// pages first, then embedded images.
pub fn extract_images(
    pdf_path: &Path,
    document_id: &str,
    out_dir: &Path,
    pages: &[PageText],
    opts: &RasterOptions,
) -> Result<Vec<ExtractedImage>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create image directory: {}", out_dir.display()))?;

    let doc = lopdf::Document::load(pdf_path)
        .with_context(|| format!("failed to open PDF: {}", pdf_path.display()))?;

    let mut images = Vec::new();

    for page in pages {
        if page.word_count >= opts.min_words_for_render {
            continue;
        }
        debug!(
            page = page.page_number,
            words = page.word_count,
            "rendering low-text page for OCR"
        );
        match render_page(pdf_path, &doc, document_id, out_dir, page.page_number, opts) {
            Ok(img) => images.push(img),
            Err(e) => {
                warn!(page = page.page_number, error = %e, "page render failed, skipping");
            }
        }
    }

    images.extend(extract_embedded(&doc, document_id, out_dir, opts));

    Ok(images)
}

/// Render one page to a JPEG via `pdftoppm`. Image index 0 is reserved
/// for full-page renders.
fn render_page(
    pdf_path: &Path,
    doc: &lopdf::Document,
    document_id: &str,
    out_dir: &Path,
    page_number: i64,
    opts: &RasterOptions,
) -> Result<ExtractedImage> {
    let prefix = out_dir.join(format!("{}_p{}_full", document_id, page_number));

    let output = Command::new("pdftoppm")
        .arg("-jpeg")
        .arg("-r")
        .arg(opts.dpi.to_string())
        .arg("-jpegopt")
        .arg(format!("quality={}", opts.quality))
        .arg("-f")
        .arg(page_number.to_string())
        .arg("-l")
        .arg(page_number.to_string())
        .arg("-singlefile")
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .context("failed to run pdftoppm")?;

    if !output.status.success() {
        anyhow::bail!(
            "pdftoppm exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let storage_path = PathBuf::from(format!("{}.jpg", prefix.display()));
    let file_size = std::fs::metadata(&storage_path)
        .with_context(|| format!("rendered image missing: {}", storage_path.display()))?
        .len() as i64;

    let (width, height) = page_pixel_dims(doc, page_number as u32, opts.dpi);

    Ok(ExtractedImage {
        page_number,
        image_index: 0,
        storage_path,
        width,
        height,
        format: "jpg".to_string(),
        file_size,
    })
}

/// Pull embedded JPEG XObjects out of every page. Non-JPEG images are
/// left alone; the full-page render path covers those pages when they
/// carry little text.
fn extract_embedded(
    doc: &lopdf::Document,
    document_id: &str,
    out_dir: &Path,
    opts: &RasterOptions,
) -> Vec<ExtractedImage> {
    let mut images = Vec::new();
    let mut seen_hashes: HashSet<[u8; 32]> = HashSet::new();

    for (&page_number, &page_id) in &doc.get_pages() {
        let Ok(page_dict) = doc.get_dictionary(page_id) else {
            continue;
        };
        let Some(resources) = page_dict.get(b"Resources").ok().and_then(|o| as_dict(doc, o))
        else {
            continue;
        };
        let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| as_dict(doc, o))
        else {
            continue;
        };

        let mut image_index: i64 = 1;
        for (_name, obj) in xobjects.iter() {
            let Some(stream) = as_stream(doc, obj) else {
                continue;
            };

            let is_image = stream
                .dict
                .get(b"Subtype")
                .ok()
                .and_then(|o| o.as_name().ok())
                .map(|n| n == b"Image")
                .unwrap_or(false);
            if !is_image || !has_dct_filter(&stream.dict) {
                continue;
            }

            let width = stream
                .dict
                .get(b"Width")
                .and_then(|o| o.as_i64())
                .unwrap_or(0);
            let height = stream
                .dict
                .get(b"Height")
                .and_then(|o| o.as_i64())
                .unwrap_or(0);

            // Small images are logos and icons, not content.
            if width < opts.min_image_px || height < opts.min_image_px {
                continue;
            }

            let hash: [u8; 32] = Sha256::digest(&stream.content).into();
            if !seen_hashes.insert(hash) {
                continue;
            }

            let storage_path =
                out_dir.join(format!("{}_p{}_img{}.jpg", document_id, page_number, image_index));
            if let Err(e) = std::fs::write(&storage_path, &stream.content) {
                warn!(page = page_number, error = %e, "failed to save embedded image, skipping");
                continue;
            }

            images.push(ExtractedImage {
                page_number: page_number as i64,
                image_index,
                storage_path,
                width,
                height,
                format: "jpg".to_string(),
                file_size: stream.content.len() as i64,
            });
            image_index += 1;
        }
    }

    images
}

fn as_dict<'a>(doc: &'a lopdf::Document, obj: &'a lopdf::Object) -> Option<&'a lopdf::Dictionary> {
    match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok().and_then(|o| o.as_dict().ok()),
        other => other.as_dict().ok(),
    }
}

fn as_stream<'a>(doc: &'a lopdf::Document, obj: &'a lopdf::Object) -> Option<&'a lopdf::Stream> {
    let resolved = match obj {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    match resolved {
        lopdf::Object::Stream(s) => Some(s),
        _ => None,
    }
}

fn has_dct_filter(dict: &lopdf::Dictionary) -> bool {
    match dict.get(b"Filter") {
        Ok(lopdf::Object::Name(n)) => n == b"DCTDecode",
        Ok(lopdf::Object::Array(arr)) => arr
            .iter()
            .any(|o| matches!(o, lopdf::Object::Name(n) if n == b"DCTDecode")),
        _ => false,
    }
}

/// Pixel dimensions of a rendered page: MediaBox points scaled by
/// dpi / 72, falling back to US Letter when the box is absent.
fn page_pixel_dims(doc: &lopdf::Document, page_number: u32, dpi: u32) -> (i64, i64) {
    let (w_pts, h_pts) = page_media_box(doc, page_number).unwrap_or((612.0, 792.0));
    let scale = dpi as f64 / 72.0;
    ((w_pts * scale).round() as i64, (h_pts * scale).round() as i64)
}

fn page_media_box(doc: &lopdf::Document, page_number: u32) -> Option<(f64, f64)> {
    let page_id = *doc.get_pages().get(&page_number)?;
    let page_dict = doc.get_dictionary(page_id).ok()?;
    let mb = page_dict.get(b"MediaBox").ok()?;
    let arr = match mb {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok()?.as_array().ok()?,
        other => other.as_array().ok()?,
    };
    if arr.len() != 4 {
        return None;
    }
    let nums: Vec<f64> = arr.iter().map(object_as_f64).collect();
    Some(((nums[2] - nums[0]).abs(), (nums[3] - nums[1]).abs()))
}

fn object_as_f64(obj: &lopdf::Object) -> f64 {
    match obj {
        lopdf::Object::Integer(i) => *i as f64,
        lopdf::Object::Real(r) => *r as f64,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unopenable_pdf_is_fatal() {
        let dir = std::env::temp_dir();
        let pdf = dir.join("citeline-raster-not-a-pdf.pdf");
        std::fs::write(&pdf, b"nope").unwrap();
        let opts = RasterOptions {
            dpi: 100,
            quality: 85,
            min_words_for_render: 50,
            min_image_px: 100,
        };
        let err = extract_images(&pdf, "doc1", &dir, &[], &opts).unwrap_err();
        assert!(err.to_string().contains("failed to open PDF"));
        let _ = std::fs::remove_file(&pdf);
    }

    #[test]
    fn dct_filter_detection() {
        let mut dict = lopdf::Dictionary::new();
        assert!(!has_dct_filter(&dict));

        dict.set("Filter", lopdf::Object::Name(b"FlateDecode".to_vec()));
        assert!(!has_dct_filter(&dict));

        dict.set("Filter", lopdf::Object::Name(b"DCTDecode".to_vec()));
        assert!(has_dct_filter(&dict));

        dict.set(
            "Filter",
            lopdf::Object::Array(vec![
                lopdf::Object::Name(b"ASCII85Decode".to_vec()),
                lopdf::Object::Name(b"DCTDecode".to_vec()),
            ]),
        );
        assert!(has_dct_filter(&dict));
    }
}
