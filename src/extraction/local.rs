//! Local text-layer provider.
//!
//! Reads the embedded text layer page by page with `lopdf`. No network, no
//! credentials, so it is always available as the OCR fallback. Scanned pages
//! without a text layer simply come back empty.

use super::provider::{PageTextProvider, ProviderError, frame_pages};
use async_trait::async_trait;
use lopdf::Document;

/// Page-by-page reader for the PDF text layer.
#[derive(Debug, Default)]
pub struct TextLayerProvider;

impl TextLayerProvider {
    pub fn new() -> Self {
        Self
    }
}

fn read_text_layer(pdf: &[u8]) -> Result<String, ProviderError> {
    let doc = Document::load_mem(pdf).map_err(|e| ProviderError::Unreadable(e.to_string()))?;

    let pages = doc.get_pages().into_keys().map(|page_number| {
        doc.extract_text(&[page_number]).unwrap_or_else(|e| {
            tracing::warn!(page = page_number, error = %e, "Skipping unreadable page");
            String::new()
        })
    });

    Ok(frame_pages(pages.collect::<Vec<_>>()))
}

#[async_trait]
impl PageTextProvider for TextLayerProvider {
    async fn extract_pages(&self, pdf: &[u8]) -> Result<String, ProviderError> {
        // lopdf parsing is CPU bound
        let bytes = pdf.to_vec();
        tokio::task::spawn_blocking(move || read_text_layer(&bytes))
            .await
            .map_err(|e| ProviderError::Provider(format!("Task join error: {e}")))?
    }

    fn provider_name(&self) -> &'static str {
        "Text layer"
    }
}

/// Build small PDFs for tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{Document, Object, Stream, dictionary};

    /// A PDF with one page per entry, each showing that text.
    pub(crate) fn pdf_with_pages(texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in texts {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
            });
            kids.push(page_id.into());
        }

        let count = i64::try_from(kids.len()).unwrap();
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }
}
