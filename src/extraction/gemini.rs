//! Gemini OCR page-text provider.
//!
//! Sends the whole PDF inline to Gemini `generateContent` and asks for a
//! verbatim transcription framed per page. Much better than the text layer
//! for scanned documents.

use super::provider::{PageTextProvider, ProviderError};
use crate::config::OcrConfig;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};

const OCR_INSTRUCTION: &str = "Extract ALL text from this PDF. For each page, output exactly:\n\n\
[Page N]\n<all text on that page>\n\n\
Preserve the original text exactly as written: names, dates, numbers, abbreviations. \
Do not summarize or paraphrase. Include every line of text you can read.";

/// OCR provider backed by the Gemini API.
#[derive(Debug)]
pub struct GeminiOcrProvider {
    client: reqwest::Client,
    config: OcrConfig,
}

impl GeminiOcrProvider {
    pub fn new(config: OcrConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Check if the provider is properly configured for use.
    pub fn is_configured(&self) -> bool {
        self.config.api_key().is_some()
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

/// Concatenate the text parts of the first candidate.
fn response_text(result: &serde_json::Value) -> String {
    result
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[async_trait]
impl PageTextProvider for GeminiOcrProvider {
    async fn extract_pages(&self, pdf: &[u8]) -> Result<String, ProviderError> {
        let api_key = self.config.api_key().ok_or_else(|| {
            ProviderError::NotConfigured("Gemini API key not configured".to_string())
        })?;

        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "inlineData": { "mimeType": "application/pdf", "data": STANDARD.encode(pdf) } },
                    { "text": OCR_INSTRUCTION }
                ]
            }]
        });

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Provider(format!(
                "Gemini OCR error ({status}): {error_text}"
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Provider(e.to_string()))?;

        let text = response_text(&result);
        tracing::info!(
            name: "extraction.ocr.completed",
            chars = text.len(),
            "Gemini OCR extracted text from PDF"
        );
        Ok(text)
    }

    fn provider_name(&self) -> &'static str {
        "Gemini OCR"
    }
}
