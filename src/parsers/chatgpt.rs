//! ChatGPT `conversations.json` exports.
//!
//! The export is an array of conversations; only the first is read. Its
//! messages hang off a `mapping` keyed by node id, forming a tree: every
//! regenerated answer or edited prompt starts a sibling branch. Only the
//! branch ending at `current_node` (the one the UI shows) is archived,
//! walked leaf to root through `parent` and then reversed. Exports without
//! a usable `current_node` fall back to all nodes ordered by `create_time`
//! (ties broken by node id).
//!
//! Reasoning models emit `thoughts` and `reasoning_recap` content, which are
//! treated as thought turns. `system` and `tool` messages, and anything the
//! UI hides, never reach the pairer.

use super::{from_value, locate_payload, parse_json, ConversationParser, TurnPairer};
use crate::error::FormatError;
use crate::model::ExchangeRecord;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

pub const PLATFORM: &str = "chatgpt";

const THOUGHT_CONTENT_TYPES: &[&str] = &["thoughts", "reasoning_recap"];

#[derive(Debug, Deserialize)]
struct Conversation {
    #[serde(default)]
    mapping: HashMap<String, Node>,
    #[serde(default)]
    current_node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Node {
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    author: Author,
    #[serde(default)]
    create_time: Option<f64>,
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct Author {
    role: String,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    parts: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    is_visually_hidden_from_conversation: bool,
}

impl Message {
    fn is_hidden(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|m| m.is_visually_hidden_from_conversation)
    }

    fn is_thought(&self) -> bool {
        self.content
            .as_ref()
            .is_some_and(|c| THOUGHT_CONTENT_TYPES.contains(&c.content_type.as_str()))
    }

    /// Concatenated string parts; image pointers and other objects are dropped.
    fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

/// Parser for ChatGPT data-export conversations.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChatGptParser;

impl ConversationParser for ChatGptParser {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    fn display_name(&self) -> &'static str {
        "ChatGPT"
    }

    fn parse_str(&self, raw: &str, source: &Path) -> Result<Vec<ExchangeRecord>, FormatError> {
        let payload = locate_payload(raw, '[', source)?;
        let conversations: Vec<Conversation> =
            from_value(parse_json(payload, source)?, PLATFORM, source)?;
        let first = conversations
            .into_iter()
            .next()
            .ok_or_else(|| FormatError::Empty {
                path: source.to_path_buf(),
            })?;

        let Conversation {
            mut mapping,
            current_node,
        } = first;
        let branch = current_node
            .as_deref()
            .and_then(|leaf| branch_ending_at(&mapping, leaf));
        let messages: Vec<(String, Message)> = match branch {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| {
                    let message = mapping.remove(&id)?.message?;
                    Some((id, message))
                })
                .collect(),
            None => by_create_time(mapping),
        };

        let mut pairer = TurnPairer::default();
        for (seq, (_, message)) in messages.iter().enumerate() {
            if message.is_hidden() || message.is_thought() {
                continue;
            }
            match message.author.role.as_str() {
                "user" => pairer.user(seq, message.text()),
                "assistant" => {
                    let text = message.text();
                    // tool-call stubs carry no visible text
                    if text.is_empty() {
                        continue;
                    }
                    pairer.model(seq, text, Vec::new());
                }
                _ => {}
            }
        }
        pairer.finish(source)
    }
}

/// Node ids from the root down to `leaf`, or `None` when `leaf` is unknown.
fn branch_ending_at(mapping: &HashMap<String, Node>, leaf: &str) -> Option<Vec<String>> {
    if !mapping.contains_key(leaf) {
        debug!("current_node {} not in mapping, ordering by time", leaf);
        return None;
    }
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = Some(leaf.to_string());
    while let Some(id) = cursor {
        if !seen.insert(id.clone()) {
            warn!("Cycle at node {} in conversation tree", id);
            break;
        }
        let Some(node) = mapping.get(&id) else {
            break;
        };
        cursor = node.parent.clone();
        ids.push(id);
    }
    ids.reverse();
    Some(ids)
}

fn by_create_time(mapping: HashMap<String, Node>) -> Vec<(String, Message)> {
    let mut messages: Vec<(String, Message)> = mapping
        .into_iter()
        .filter_map(|(id, node)| node.message.map(|m| (id, m)))
        .collect();
    messages.sort_by(|(id_a, a), (id_b, b)| {
        let ta = a.create_time.unwrap_or(f64::NEG_INFINITY);
        let tb = b.create_time.unwrap_or(f64::NEG_INFINITY);
        ta.total_cmp(&tb).then_with(|| id_a.cmp(id_b))
    });
    messages
}
