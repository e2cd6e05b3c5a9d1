//! Document text extraction.

use std::path::Path;
use std::sync::Arc;

use podforge_core::BlobRef;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use crate::error::{Stage, StageError};
use crate::services::{BlobStore, DocumentParser};
use crate::workspace::TempWorkspace;

/// Share of control characters above which extracted text is rejected.
pub const MAX_CONTROL_RATIO: f64 = 0.10;

/// Default cap on extracted text, in characters.
pub const DEFAULT_MAX_SOURCE_CHARS: usize = 100_000;

const SNIFF_LEN: u64 = 8;

/// PDF parser backed by `pdf-extract`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTextParser;

impl DocumentParser for PdfTextParser {
    fn extension(&self) -> &'static str {
        "pdf"
    }

    fn sniff(&self, header: &[u8]) -> bool {
        header.starts_with(b"%PDF-")
    }

    fn extract_text(&self, path: &Path) -> Result<String, String> {
        // pdf-extract panics on some malformed inputs.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pdf_extract::extract_text(path)
        }));
        match result {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(format!("PDF extraction failed: {e}")),
            Err(_) => Err("PDF extraction panicked (malformed PDF)".to_string()),
        }
    }
}

/// Downloads a source document into the workspace and turns it into text.
pub struct TextExtractor {
    blobs: Arc<dyn BlobStore>,
    parser: Arc<dyn DocumentParser>,
    max_chars: usize,
}

impl TextExtractor {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        parser: Arc<dyn DocumentParser>,
        max_chars: usize,
    ) -> Self {
        Self {
            blobs,
            parser,
            max_chars,
        }
    }

    /// Download, parse and validate the document behind `source`.
    ///
    /// The local copy is deleted as soon as parsing finishes, whatever the
    /// result. Returned text is capped at the configured number of characters.
    #[instrument(skip(self, workspace), fields(source = %source), err)]
    pub async fn extract(
        &self,
        source: &BlobRef,
        workspace: &TempWorkspace,
    ) -> Result<String, StageError> {
        let expected = self.parser.extension();
        match source.extension() {
            Some(ext) if ext == expected => {}
            Some(ext) => return Err(StageError::UnsupportedFormat(ext)),
            None => return Err(StageError::UnsupportedFormat("no file extension".to_string())),
        }

        let local = workspace.file(&format!("source.{expected}"));
        let size = self
            .blobs
            .download_to(source, &local)
            .await
            .map_err(|e| StageError::service(Stage::Download, e))?;
        debug!(bytes = size, "source downloaded");

        let parsed = self.parse_local(&local).await;
        if let Err(err) = tokio::fs::remove_file(&local).await {
            warn!(error = %err, path = %local.display(), "failed to delete local source copy");
        }

        let text = validate_text(&parsed?)?;
        let text = truncate_chars(&text, self.max_chars);
        debug!(chars = text.chars().count(), "text extracted");
        Ok(text.to_string())
    }

    async fn parse_local(&self, path: &Path) -> Result<String, StageError> {
        let mut header = Vec::with_capacity(SNIFF_LEN as usize);
        tokio::fs::File::open(path)
            .await?
            .take(SNIFF_LEN)
            .read_to_end(&mut header)
            .await?;
        if !self.parser.sniff(&header) {
            return Err(StageError::UnsupportedFormat(format!(
                "content is not a {} document",
                self.parser.extension()
            )));
        }

        let parser = Arc::clone(&self.parser);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || parser.extract_text(&path))
            .await
            .map_err(|e| StageError::Parse(e.to_string()))?
            .map_err(StageError::Parse)
    }
}

/// Reject empty and corrupted text.
///
/// Line breaks and tabs are not counted as control characters.
pub fn validate_text(text: &str) -> Result<String, StageError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(StageError::EmptyText);
    }

    let total = trimmed.chars().count();
    let control = trimmed
        .chars()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        .count();
    let ratio = control as f64 / total as f64;
    if ratio > MAX_CONTROL_RATIO {
        return Err(StageError::CorruptText {
            ratio_percent: ratio * 100.0,
        });
    }

    Ok(trimmed.to_string())
}

/// Longest prefix of `text` holding at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
