//! Prompt composition and skill files.
//!
//! The system prompt is a fixed document-analyst brief, optionally extended
//! by the `pdf_analysis` skill. Skills are plain `*.md` files in a directory,
//! keyed by file stem and loaded once at startup.

use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// Name of the skill appended to the system prompt.
pub const PDF_SKILL: &str = "pdf_analysis";

pub const PDF_SYSTEM_PROMPT: &str = "You are an expert PDF document analyst. You read and analyze PDF documents thoroughly.

When answering questions about a PDF:
1. Reference specific page numbers when possible
2. Quote relevant text from the document using <<highlight page=N>>exact quoted text<</highlight>> markers, where N is the page number. Keep the quoted text SHORT, use only the most relevant phrase (5-15 words max), not full paragraphs. Quote the exact text as it appears in the document.
3. Provide comprehensive, well-structured answers
4. If information is not found in the document, say so clearly

Format your responses in markdown when appropriate.
";

const HIGHLIGHT_INSTRUCTION: &str = "When referencing specific parts of the PDF, wrap the quoted text in <<highlight page=N>>exact quoted text<</highlight>> markers where N is the page number. Keep highlighted quotes SHORT (5-15 words), and quote the exact text as it appears in the document.";

/// Skill prompts loaded from disk, keyed by file stem.
#[derive(Debug, Clone, Default)]
pub struct SkillSet {
    skills: BTreeMap<String, String>,
}

impl SkillSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.skills.insert(name.into(), content.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.skills.get(name).map(String::as_str)
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.keys().map(String::as_str).collect()
    }

    /// Loads every `*.md` file in `dir`.
    ///
    /// A missing directory yields an empty set; unreadable files are logged
    /// and skipped.
    pub async fn load_from_dir(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        let mut skills = Self::new();
        if !dir.exists() {
            warn!("Skills directory not found: {:?}", dir);
            return Ok(skills);
        }

        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fs::read_to_string(&path).await {
                Ok(content) => {
                    info!("Loaded skill: {}", stem);
                    skills.add(stem, content);
                }
                Err(e) => warn!("Failed to load skill {:?}: {}", path, e),
            }
        }
        Ok(skills)
    }

    /// The full system prompt: the analyst brief plus the PDF skill, if any.
    pub fn system_prompt(&self) -> String {
        match self.get(PDF_SKILL) {
            Some(skill) if !skill.trim().is_empty() => format!("{PDF_SYSTEM_PROMPT}\n\n{skill}"),
            _ => PDF_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Compose the upstream prompt from extracted text and the question.
///
/// Without document text the question is sent as-is.
pub fn compose_prompt(document_text: &str, question: &str) -> String {
    if document_text.is_empty() {
        return question.to_string();
    }

    format!(
        "Here is the content of a PDF document:\n\n<pdf_content>\n{document_text}\n</pdf_content>\n\nQuestion: {question}\n\n{HIGHLIGHT_INSTRUCTION}"
    )
}
