//! Conversation parsers: turn a vendor export file into [`ExchangeRecord`]s.
//!
//! Every platform implements [`ConversationParser`]. The [`ParserRegistry`]
//! maps a platform identifier (plus aliases) to its parser; unknown
//! identifiers resolve to the default platform instead of failing, so older
//! settings files that predate a rename keep working.
//!
//! All variants share the same pairing rule, implemented once in
//! [`TurnPairer`]: a user turn fills a single pending slot, the next model
//! turn consumes it. Thought turns are filtered out by the variant before
//! they ever reach the pairer.

pub mod aistudio;
pub mod chatgpt;
pub mod openwebui;

use crate::error::FormatError;
use crate::model::{ExchangeRecord, ImageRef, SequenceNumbers};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub use aistudio::AiStudioParser;
pub use chatgpt::ChatGptParser;
pub use openwebui::OpenWebUiParser;

/// Platform used when the requested identifier is unknown.
pub const DEFAULT_PLATFORM: &str = aistudio::PLATFORM;

/// Converts one platform's export format into ordered exchange records.
pub trait ConversationParser: Send + Sync {
    /// Canonical platform identifier, e.g. `"aistudio"`.
    fn platform(&self) -> &'static str;

    /// Human-readable name for listings.
    fn display_name(&self) -> &'static str;

    /// Parse raw file contents. `source` is only used for error messages.
    fn parse_str(&self, raw: &str, source: &Path) -> Result<Vec<ExchangeRecord>, FormatError>;

    /// Read and parse an export file.
    fn parse(&self, path: &Path) -> Result<Vec<ExchangeRecord>, FormatError> {
        let raw = read_source(path)?;
        let records = self.parse_str(&raw, path)?;
        debug!(
            "Parsed {} exchanges from {} ({})",
            records.len(),
            path.display(),
            self.platform()
        );
        Ok(records)
    }
}

/// Platform identifier → parser lookup.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: BTreeMap<&'static str, Arc<dyn ConversationParser>>,
    aliases: BTreeMap<String, &'static str>,
    default_platform: &'static str,
}

impl fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserRegistry")
            .field("platforms", &self.parsers.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .field("default_platform", &self.default_platform)
            .finish()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ParserRegistry {
    /// An empty registry whose fallback is `default_platform`.
    ///
    /// The fallback must be registered before [`ParserRegistry::resolve`] is
    /// called with an unknown name.
    pub fn new(default_platform: &'static str) -> Self {
        Self {
            parsers: BTreeMap::new(),
            aliases: BTreeMap::new(),
            default_platform,
        }
    }

    /// Registry with every built-in platform; `aistudio` is the default.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(DEFAULT_PLATFORM);
        registry.register(Arc::new(AiStudioParser), &["ai_studio", "google", "gemini"]);
        registry.register(Arc::new(OpenWebUiParser), &["open-webui", "open_webui"]);
        registry.register(Arc::new(ChatGptParser), &["openai"]);
        registry
    }

    /// Add (or replace) a parser under its platform id plus `aliases`.
    pub fn register(&mut self, parser: Arc<dyn ConversationParser>, aliases: &[&str]) {
        let platform = parser.platform();
        for alias in aliases {
            self.aliases.insert(normalise_name(alias), platform);
        }
        self.parsers.insert(platform, parser);
    }

    /// Exact lookup by id or alias, case-insensitive.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ConversationParser>> {
        let key = normalise_name(name);
        let platform = self
            .aliases
            .get(&key)
            .copied()
            .or_else(|| self.parsers.keys().find(|p| **p == key).copied())?;
        self.parsers.get(platform).cloned()
    }

    /// Lookup that falls back to the default platform for unknown names.
    ///
    /// Returns `None` only when the default platform itself is missing.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ConversationParser>> {
        if let Some(parser) = self.get(name) {
            return Some(parser);
        }
        warn!(
            "Unknown platform '{}', falling back to '{}'",
            name, self.default_platform
        );
        self.parsers.get(self.default_platform).cloned()
    }

    /// Parse `path` with the parser registered for `platform`.
    pub fn parse(&self, platform: &str, path: &Path) -> Result<Vec<ExchangeRecord>, FormatError> {
        match self.resolve(platform) {
            Some(parser) => parser.parse(path),
            None => Err(FormatError::UnexpectedSchema {
                path: path.to_path_buf(),
                platform: "unknown",
                detail: format!("no parser registered for '{platform}'"),
            }),
        }
    }

    /// `(platform, display name, aliases)` for every registered parser.
    pub fn platforms(&self) -> Vec<(&'static str, &'static str, Vec<String>)> {
        self.parsers
            .values()
            .map(|p| {
                let aliases = self
                    .aliases
                    .iter()
                    .filter(|(_, target)| **target == p.platform())
                    .map(|(alias, _)| alias.clone())
                    .collect();
                (p.platform(), p.display_name(), aliases)
            })
            .collect()
    }

    pub fn default_platform(&self) -> &'static str {
        self.default_platform
    }
}

fn normalise_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// Read an export file, mapping I/O failures to [`FormatError`].
pub(crate) fn read_source(path: &Path) -> Result<String, FormatError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FormatError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => FormatError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => FormatError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    // Exports are UTF-8; tolerate stray bytes in the preamble rather than
    // rejecting the whole file.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Slice from the first `opener` onward; exports may carry a non-JSON preamble.
pub(crate) fn locate_payload<'a>(
    raw: &'a str,
    opener: char,
    source: &Path,
) -> Result<&'a str, FormatError> {
    raw.find(opener)
        .map(|idx| &raw[idx..])
        .ok_or_else(|| FormatError::NoPayload {
            path: source.to_path_buf(),
            expected: if opener == '[' { "JSON array" } else { "JSON object" },
        })
}

/// Parse JSON text, keeping syntax errors apart from schema mismatches.
pub(crate) fn parse_json(payload: &str, source: &Path) -> Result<Value, FormatError> {
    serde_json::from_str(payload).map_err(|e| FormatError::InvalidJson {
        path: source.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Deserialize an already-parsed value into a platform schema.
pub(crate) fn from_value<T: DeserializeOwned>(
    value: Value,
    platform: &'static str,
    source: &Path,
) -> Result<T, FormatError> {
    serde_json::from_value(value).map_err(|e| FormatError::UnexpectedSchema {
        path: source.to_path_buf(),
        platform,
        detail: e.to_string(),
    })
}

/// Split a `data:<mime>;base64,<payload>` URL into an [`ImageRef`].
pub(crate) fn image_from_data_url(url: &str) -> Option<ImageRef> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    Some(ImageRef::new(mime, data))
}

/// Single-slot pairing of user turns with the model turn that answers them.
#[derive(Debug, Default)]
pub(crate) struct TurnPairer {
    pending_user: Option<(usize, String)>,
    records: Vec<ExchangeRecord>,
}

impl TurnPairer {
    /// A user turn replaces whatever is pending.
    pub(crate) fn user(&mut self, seq: usize, text: String) {
        self.pending_user = Some((seq, text));
    }

    /// A model turn consumes the pending user turn, or pairs with "".
    pub(crate) fn model(&mut self, seq: usize, text: String, images: Vec<ImageRef>) {
        let (user_seq, user_text) = match self.pending_user.take() {
            Some((s, t)) => (Some(s), t),
            None => (None, String::new()),
        };
        self.records.push(
            ExchangeRecord::new(user_text, text)
                .with_images(images)
                .with_sequence(SequenceNumbers {
                    user: user_seq,
                    model: seq,
                }),
        );
    }

    /// Finish the walk; an empty result is a format error.
    pub(crate) fn finish(self, source: &Path) -> Result<Vec<ExchangeRecord>, FormatError> {
        if let Some((seq, _)) = &self.pending_user {
            debug!(
                "Dropping trailing user turn #{} in {} (no model reply)",
                seq,
                source.display()
            );
        }
        if self.records.is_empty() {
            return Err(FormatError::Empty {
                path: PathBuf::from(source),
            });
        }
        Ok(self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_aliases_case_insensitively() {
        let registry = ParserRegistry::with_defaults();
        assert_eq!(registry.get("OpenAI").unwrap().platform(), "chatgpt");
        assert_eq!(registry.get("open-webui").unwrap().platform(), "openwebui");
        assert_eq!(registry.get(" AIStudio ").unwrap().platform(), "aistudio");
    }

    #[test]
    fn unknown_platform_falls_back_to_default() {
        let registry = ParserRegistry::with_defaults();
        assert!(registry.get("myspace").is_none());
        let parser = registry.resolve("myspace").expect("default parser");
        assert_eq!(parser.platform(), DEFAULT_PLATFORM);
    }

    #[test]
    fn platforms_lists_every_parser_with_aliases() {
        let registry = ParserRegistry::with_defaults();
        let platforms = registry.platforms();
        assert_eq!(platforms.len(), 3);
        let (_, _, aliases) = platforms
            .iter()
            .find(|(id, _, _)| *id == "aistudio")
            .unwrap();
        assert!(aliases.contains(&"gemini".to_string()));
    }

    #[test]
    fn empty_registry_cannot_resolve() {
        let registry = ParserRegistry::new("aistudio");
        assert!(registry.resolve("aistudio").is_none());
        let err = registry
            .parse("aistudio", Path::new("x.json"))
            .unwrap_err();
        assert!(matches!(err, FormatError::UnexpectedSchema { .. }));
    }

    #[test]
    fn locate_payload_skips_preamble() {
        let raw = "garbage\u{feff} header {\"a\":1}";
        assert_eq!(locate_payload(raw, '{', Path::new("f")).unwrap(), "{\"a\":1}");
        assert!(matches!(
            locate_payload("no json here", '[', Path::new("f")),
            Err(FormatError::NoPayload { .. })
        ));
    }

    #[test]
    fn data_url_split() {
        let img = image_from_data_url("data:image/webp;base64,UklGRg==").unwrap();
        assert_eq!(img.mime_type, "image/webp");
        assert_eq!(img.data, "UklGRg==");
        assert!(image_from_data_url("https://example.com/a.png").is_none());
        assert!(image_from_data_url("data:image/png,rawbytes").is_none());
    }

    #[test]
    fn pairer_consumes_pending_user_once() {
        let mut p = TurnPairer::default();
        p.user(0, "q".into());
        p.model(1, "a1".into(), vec![]);
        p.model(2, "a2".into(), vec![]);
        let records = p.finish(Path::new("t")).unwrap();
        assert_eq!(records[0].user_text, "q");
        assert_eq!(records[1].user_text, "");
        assert_eq!(
            records[1].sequence,
            Some(SequenceNumbers { user: None, model: 2 })
        );
    }

    #[test]
    fn later_user_turn_replaces_pending() {
        let mut p = TurnPairer::default();
        p.user(0, "first".into());
        p.user(1, "second".into());
        p.model(2, "answer".into(), vec![]);
        let records = p.finish(Path::new("t")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_text, "second");
    }

    #[test]
    fn only_user_turns_is_empty() {
        let mut p = TurnPairer::default();
        p.user(0, "hello?".into());
        assert!(matches!(
            p.finish(Path::new("t")),
            Err(FormatError::Empty { .. })
        ));
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let err = read_source(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, FormatError::FileNotFound { .. }));
    }
}
