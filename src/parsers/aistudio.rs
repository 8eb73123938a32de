//! Google AI Studio exports.
//!
//! The export is a single JSON object, sometimes preceded by a few bytes of
//! non-JSON preamble:
//!
//! ```json
//! {"chunkedPrompt": {"chunks": [
//!     {"role": "user",  "text": "hi"},
//!     {"role": "model", "text": "…", "isThought": true},
//!     {"role": "model", "text": "hello", "inlineImage": {"mimeType": "image/png", "data": "…"}}
//! ]}}
//! ```
//!
//! Newer exports split model output into `parts`, each optionally flagged
//! `thought: true`.

use super::{from_value, locate_payload, parse_json, ConversationParser, TurnPairer};
use crate::error::FormatError;
use crate::model::{ExchangeRecord, ImageRef};
use serde::Deserialize;
use std::path::Path;

pub const PLATFORM: &str = "aistudio";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Export {
    #[serde(default)]
    chunked_prompt: Option<ChunkedPrompt>,
}

#[derive(Debug, Deserialize)]
struct ChunkedPrompt {
    #[serde(default)]
    chunks: Vec<Chunk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Chunk {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_thought: bool,
    #[serde(default)]
    inline_image: Option<InlineImage>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineImage {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

impl Chunk {
    /// A chunk whose only content is flagged as thought.
    fn is_thought(&self) -> bool {
        self.is_thought
            || (self.text.is_none() && !self.parts.is_empty() && self.parts.iter().all(|p| p.thought))
    }

    fn content(&self) -> String {
        match &self.text {
            Some(text) => text.trim().to_string(),
            None => self
                .parts
                .iter()
                .filter(|p| !p.thought)
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
                .trim()
                .to_string(),
        }
    }
}

/// Parser for Google AI Studio `chunkedPrompt` exports.
#[derive(Debug, Default, Clone, Copy)]
pub struct AiStudioParser;

impl ConversationParser for AiStudioParser {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    fn display_name(&self) -> &'static str {
        "Google AI Studio"
    }

    fn parse_str(&self, raw: &str, source: &Path) -> Result<Vec<ExchangeRecord>, FormatError> {
        let payload = locate_payload(raw, '{', source)?;
        let export: Export = from_value(parse_json(payload, source)?, PLATFORM, source)?;
        let chunks = export.chunked_prompt.map(|c| c.chunks).unwrap_or_default();

        let mut pairer = TurnPairer::default();
        for (seq, chunk) in chunks.iter().enumerate() {
            if chunk.is_thought() {
                continue;
            }
            match chunk.role.as_deref() {
                Some("user") => pairer.user(seq, chunk.content()),
                Some("model") => {
                    let images = chunk
                        .inline_image
                        .as_ref()
                        .map(|img| vec![ImageRef::new(&img.mime_type, &img.data)])
                        .unwrap_or_default();
                    pairer.model(seq, chunk.content(), images);
                }
                _ => {}
            }
        }
        pairer.finish(source)
    }
}
