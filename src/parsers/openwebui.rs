//! Open WebUI chat exports.
//!
//! The export is a JSON array of chats. Only the first chat is read; its
//! messages live in a map keyed by message id, so order has to be rebuilt
//! from the per-message `timestamp`:
//!
//! ```json
//! [{"chat": {"history": {"messages": {
//!     "a1": {"role": "user", "content": "hi", "timestamp": 1700000000},
//!     "b2": {"role": "assistant", "content": "hello", "timestamp": 1700000005}
//! }}}}]
//! ```
//!
//! Reasoning models inline their chain of thought as
//! `<details type="reasoning">…</details>`; that block is removed, and a
//! message made of nothing else counts as a thought turn.

use super::{
    from_value, image_from_data_url, locate_payload, parse_json, ConversationParser, TurnPairer,
};
use crate::error::FormatError;
use crate::model::{ExchangeRecord, ImageRef};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub const PLATFORM: &str = "openwebui";

static RE_REASONING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<details\s+type="reasoning"[^>]*>.*?</details>"#).expect("valid regex")
});

#[derive(Debug, Deserialize)]
struct ChatEntry {
    #[serde(default)]
    chat: Option<Chat>,
    #[serde(default)]
    history: Option<History>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    #[serde(default)]
    history: Option<History>,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    messages: HashMap<String, Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    files: Vec<File>,
}

#[derive(Debug, Deserialize)]
struct File {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
}

impl Message {
    fn content(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    fn images(&self) -> Vec<ImageRef> {
        self.files
            .iter()
            .filter(|f| f.kind == "image")
            .filter_map(|f| image_from_data_url(&f.url))
            .collect()
    }
}

/// Parser for Open WebUI JSON exports.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenWebUiParser;

impl ConversationParser for OpenWebUiParser {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    fn display_name(&self) -> &'static str {
        "Open WebUI"
    }

    fn parse_str(&self, raw: &str, source: &Path) -> Result<Vec<ExchangeRecord>, FormatError> {
        let payload = locate_payload(raw, '[', source)?;
        let entries: Vec<ChatEntry> = from_value(parse_json(payload, source)?, PLATFORM, source)?;
        let first = entries.into_iter().next().ok_or_else(|| FormatError::Empty {
            path: source.to_path_buf(),
        })?;
        let history = first
            .chat
            .and_then(|c| c.history)
            .or(first.history)
            .ok_or_else(|| FormatError::UnexpectedSchema {
                path: source.to_path_buf(),
                platform: PLATFORM,
                detail: "first chat has no message history".into(),
            })?;

        let mut messages: Vec<(String, Message)> = history.messages.into_iter().collect();
        messages.sort_by(|(id_a, a), (id_b, b)| {
            let ta = a.timestamp.unwrap_or(f64::NEG_INFINITY);
            let tb = b.timestamp.unwrap_or(f64::NEG_INFINITY);
            ta.total_cmp(&tb).then_with(|| id_a.cmp(id_b))
        });

        let mut pairer = TurnPairer::default();
        for (seq, (_, message)) in messages.iter().enumerate() {
            match message.role.as_str() {
                "user" => pairer.user(seq, message.content().trim().to_string()),
                "assistant" => {
                    let had_reasoning = RE_REASONING.is_match(message.content());
                    let text = RE_REASONING.replace_all(message.content(), "").trim().to_string();
                    let images = message.images();
                    if had_reasoning && text.is_empty() && images.is_empty() {
                        continue;
                    }
                    pairer.model(seq, text, images);
                }
                _ => {}
            }
        }
        pairer.finish(source)
    }
}
