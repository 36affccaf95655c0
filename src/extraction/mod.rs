//! Text extraction for uploaded documents.
//!
//! PDFs go through OCR first and fall back to the local text layer; any
//! other upload must be UTF-8 text. The extractor holds no per-request
//! state.
//!
//! # Providers
//!
//! - [`GeminiOcrProvider`] - Gemini OCR (needs an API key and network)
//! - [`TextLayerProvider`] - embedded text layer via `lopdf` (always available)
//!
//! # Usage
//!
//! ```rust,ignore
//! use pdf_ask::extraction::DocumentExtractor;
//!
//! let extractor = DocumentExtractor::from_config(&config.ocr);
//! let text = extractor.extract(&bytes, "report.pdf").await?;
//! ```

mod gemini;
mod local;
mod provider;

pub use gemini::GeminiOcrProvider;
pub use local::TextLayerProvider;
pub use provider::{ExtractionError, PageTextProvider, ProviderError, frame_pages};

#[cfg(test)]
pub(crate) use local::fixtures;

use crate::config::OcrConfig;
use std::sync::Arc;

/// Whether `filename` names a PDF, judged by its extension.
pub fn is_pdf(filename: &str) -> bool {
    mime_guess::from_path(filename)
        .first()
        .is_some_and(|mime| mime.essence_str() == "application/pdf")
}

/// OCR-first document text extractor with a local fallback.
#[derive(Debug, Clone)]
pub struct DocumentExtractor {
    ocr: Option<Arc<dyn PageTextProvider>>,
    text_layer: Arc<dyn PageTextProvider>,
}

impl DocumentExtractor {
    pub fn new(
        ocr: Option<Arc<dyn PageTextProvider>>,
        text_layer: Arc<dyn PageTextProvider>,
    ) -> Self {
        Self { ocr, text_layer }
    }

    /// Gemini OCR when a key is configured, the text layer always.
    pub fn from_config(config: &OcrConfig) -> Self {
        let gemini = GeminiOcrProvider::new(config.clone());
        let ocr = gemini
            .is_configured()
            .then(|| Arc::new(gemini) as Arc<dyn PageTextProvider>);
        if ocr.is_none() {
            tracing::info!("No OCR API key configured; PDFs use the text layer only");
        }
        Self::new(ocr, Arc::new(TextLayerProvider::new()))
    }

    /// Whether an OCR backend will be tried for PDFs.
    pub fn has_ocr(&self) -> bool {
        self.ocr.is_some()
    }

    /// Extract plain text from an upload.
    ///
    /// Returns an empty string when a PDF has no recoverable text; callers
    /// treat that as "no document context".
    pub async fn extract(&self, bytes: &[u8], filename: &str) -> Result<String, ExtractionError> {
        if !is_pdf(filename) {
            return std::str::from_utf8(bytes)
                .map(ToString::to_string)
                .map_err(|_| ExtractionError::UnsupportedFormat);
        }

        if let Some(ocr) = &self.ocr {
            match ocr.extract_pages(bytes).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => {
                    tracing::warn!(
                        provider = ocr.provider_name(),
                        "OCR returned no text, falling back to text layer"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        provider = ocr.provider_name(),
                        error = %e,
                        "OCR failed, falling back to text layer"
                    );
                }
            }
        }

        let text = self
            .text_layer
            .extract_pages(bytes)
            .await
            .map_err(|e| ExtractionError::Unreadable(e.to_string()))?;

        tracing::info!(
            name: "extraction.text_layer.completed",
            provider = self.text_layer.provider_name(),
            chars = text.len(),
            "Extracted PDF text layer"
        );
        Ok(text)
    }
}
