use crate::error::{IngestError, Result};
use log::{debug, warn};
use std::panic;

/// Documents with fewer non-whitespace characters than this are treated as
/// having no extractable text (typically scanned images).
pub const MIN_TEXT_CHARS: usize = 10;

const PDF_MAGIC: &[u8] = b"%PDF-";
const HEADER_SEARCH_WINDOW: usize = 1024;
const PAGE_BREAK: char = '\x0C';

/// An uploaded file as received from the HTTP boundary.
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// Turns document bytes into plain text. CPU-bound; callers run it off the
/// async executor.
pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8]) -> Result<String>;
}

/// The production extractor, backed by `pdf-extract`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String> {
        extract_pdf_text(bytes)
    }
}

/// Rejects uploads that should never reach the extraction pipeline.
pub fn validate_upload(filename: &str, size: usize, max_size: usize) -> Result<()> {
    let invalid = |reason: String| IngestError::InvalidUpload {
        filename: filename.to_string(),
        reason,
    };

    if filename.trim().is_empty() {
        return Err(invalid("file has no name".to_string()));
    }

    let mime = mime_guess::from_path(filename).first_raw();
    if mime != Some("application/pdf") {
        return Err(invalid(format!(
            "only PDF files are accepted (detected {})",
            mime.unwrap_or("unknown type")
        )));
    }

    if size == 0 {
        return Err(invalid("file is empty".to_string()));
    }

    if size > max_size {
        return Err(invalid(format!(
            "file too large ({:.1} MB, max {:.1} MB)",
            size as f64 / (1024.0 * 1024.0),
            max_size as f64 / (1024.0 * 1024.0)
        )));
    }

    Ok(())
}

/// Converts PDF bytes into plain text, one page after another separated by a
/// newline, with surrounding whitespace stripped.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String> {
    let has_header = bytes
        .windows(PDF_MAGIC.len())
        .take(HEADER_SEARCH_WINDOW)
        .any(|window| window == PDF_MAGIC);
    if !has_header {
        return Err(IngestError::UnreadablePdf(
            "not a PDF document (missing %PDF header)".to_string(),
        ));
    }

    // pdf-extract panics on some malformed inputs instead of returning an error.
    let extracted = panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| {
            warn!("PDF parser aborted on a malformed document");
            IngestError::UnreadablePdf("document structure could not be parsed".to_string())
        })?
        .map_err(|e| IngestError::UnreadablePdf(e.to_string()))?;

    let text = join_pages(&extracted);
    let visible = text.chars().filter(|c| !c.is_whitespace()).count();
    if visible < MIN_TEXT_CHARS {
        return Err(IngestError::UnreadablePdf(
            "no extractable text (scanned image or encrypted document?)".to_string(),
        ));
    }

    debug!("Extracted {} characters of text from PDF", text.len());
    Ok(text)
}

/// Joins the page texts produced by the parser with single newlines.
pub fn join_pages(raw: &str) -> String {
    raw.split(PAGE_BREAK)
        .map(str::trim)
        .filter(|page| !page.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
