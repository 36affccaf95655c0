//! Core trait and error types for PDF page-text providers.

use async_trait::async_trait;

/// Errors that can occur inside a single page-text provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider is not properly configured.
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error reported by the provider's API.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The document could not be parsed at all.
    #[error("Unreadable document: {0}")]
    Unreadable(String),
}

/// Errors surfaced to callers of [`DocumentExtractor`](super::DocumentExtractor).
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// A non-PDF upload that is not valid UTF-8 text.
    #[error("Unsupported file format")]
    UnsupportedFormat,

    /// A PDF that neither OCR nor the text layer could read.
    #[error("Failed to extract PDF text: {0}")]
    Unreadable(String),
}

/// Source of page-framed text for a PDF.
///
/// Implementations return the document text with every page introduced by a
/// `[Page N]` line. An empty string means the provider found no text.
#[async_trait]
pub trait PageTextProvider: Send + Sync + std::fmt::Debug {
    /// Extract page-framed text from raw PDF bytes.
    async fn extract_pages(&self, pdf: &[u8]) -> Result<String, ProviderError>;

    /// Get the provider name for logging and debugging.
    fn provider_name(&self) -> &'static str;
}

/// Frame non-empty page texts as `[Page N]` blocks separated by a blank line.
///
/// Pages are numbered from 1 in iteration order; blank pages keep their
/// number but produce no block.
pub fn frame_pages<I, S>(pages: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    pages
        .into_iter()
        .enumerate()
        .filter_map(|(idx, text)| {
            let text = text.as_ref().trim();
            (!text.is_empty()).then(|| format!("[Page {}]\n{text}", idx + 1))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_pages_skips_blank_pages() {
        let framed = frame_pages(["First", "  ", "Third\n"]);
        assert_eq!(framed, "[Page 1]\nFirst\n\n[Page 3]\nThird");
    }

    #[test]
    fn test_frame_pages_empty() {
        assert_eq!(frame_pages(Vec::<String>::new()), "");
    }
}
