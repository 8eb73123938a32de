//! Data types shared by every pipeline stage.
//!
//! Parsers produce [`ExchangeRecord`]s; curation produces filtered copies;
//! the worker consumes [`BuildTask`]s. None of these types are mutated after
//! they leave the stage that created them; every transformation returns a
//! new value.

use crate::config::HeadingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An image attached to a model turn, kept as base64 so it can be embedded
/// in the rendered page as a data URI without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Base64 payload (standard alphabet, padded).
    pub data: String,
    /// Optional caption shown under the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ImageRef {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// `data:` URI suitable for an `<img src>` attribute.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Position of the paired turns within the platform's ordered turn list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceNumbers {
    /// `None` when the model turn had no preceding user turn.
    pub user: Option<usize>,
    pub model: usize,
}

/// One user-turn / model-turn pairing extracted from an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub user_text: String,
    pub model_text: String,
    #[serde(default)]
    pub model_images: Vec<ImageRef>,
    pub include_user: bool,
    pub include_model: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceNumbers>,
}

impl ExchangeRecord {
    /// A fully included record with no images.
    pub fn new(user_text: impl Into<String>, model_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            model_text: model_text.into(),
            model_images: Vec::new(),
            include_user: true,
            include_model: true,
            sequence: None,
        }
    }

    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.model_images = images;
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceNumbers) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Whether the user block will appear on the rendered page.
    pub fn shows_user(&self) -> bool {
        self.include_user && !self.user_text.is_empty()
    }

    /// Whether the model block will appear on the rendered page.
    pub fn shows_model(&self) -> bool {
        self.include_model && (!self.model_text.is_empty() || !self.model_images.is_empty())
    }

    /// A page for this record would contain nothing; the worker skips it.
    pub fn renders_empty(&self) -> bool {
        !self.shows_user() && !self.shows_model()
    }
}

/// Per-record curation choice made by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionDecision {
    pub include_user: bool,
    pub include_model: bool,
}

impl Default for InclusionDecision {
    fn default() -> Self {
        Self {
            include_user: true,
            include_model: true,
        }
    }
}

impl InclusionDecision {
    pub const EXCLUDE: Self = Self {
        include_user: false,
        include_model: false,
    };
}

/// Apply curation decisions to parsed records.
///
/// `decisions[i]` applies to `records[i]`; records beyond the end of
/// `decisions` keep both sides. Records with neither side included are
/// dropped. The input slice is left untouched.
pub fn curate(records: &[ExchangeRecord], decisions: &[InclusionDecision]) -> Vec<ExchangeRecord> {
    records
        .iter()
        .enumerate()
        .filter_map(|(i, record)| {
            let decision = decisions.get(i).copied().unwrap_or_default();
            if !decision.include_user && !decision.include_model {
                return None;
            }
            let mut copy = record.clone();
            copy.include_user = decision.include_user;
            copy.include_model = decision.include_model;
            Some(copy)
        })
        .collect()
}

/// Provenance metadata rendered as a standalone page ahead of a file's
/// exchanges, so the original export can be located again later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryInfo {
    pub platform: String,
    pub link: String,
    pub account: String,
    pub export_file_name: String,
    pub export_file_location: String,
    pub md_file_name: String,
    pub md_file_location: String,
    pub notes: String,
}

impl RecoveryInfo {
    /// Pre-fill platform and export file name/location from a source path.
    pub fn for_export(platform: impl Into<String>, export_path: &Path) -> Self {
        let export_file_name = export_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let export_file_location = export_path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            platform: platform.into(),
            export_file_name,
            export_file_location,
            ..Self::default()
        }
    }

    /// Label/value rows in display order, empty fields omitted.
    pub fn rows(&self) -> Vec<(&'static str, &str)> {
        [
            ("Platform", self.platform.as_str()),
            ("Link", self.link.as_str()),
            ("Account", self.account.as_str()),
            ("Export file", self.export_file_name.as_str()),
            ("Export location", self.export_file_location.as_str()),
            ("Markdown file", self.md_file_name.as_str()),
            ("Markdown location", self.md_file_location.as_str()),
            ("Notes", self.notes.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .collect()
    }
}

/// One unit of queued work: render these exchanges (and an optional
/// recovery page) and append them to `destination`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub exchanges: Vec<ExchangeRecord>,
    pub destination: PathBuf,
    #[serde(default)]
    pub headings: HeadingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryInfo>,
}

impl BuildTask {
    pub fn new(exchanges: Vec<ExchangeRecord>, destination: impl Into<PathBuf>) -> Self {
        Self {
            exchanges,
            destination: destination.into(),
            headings: HeadingConfig::default(),
            recovery: None,
        }
    }

    pub fn with_headings(mut self, headings: HeadingConfig) -> Self {
        self.headings = headings;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryInfo) -> Self {
        self.recovery = Some(recovery);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_renders_empty() {
        assert!(ExchangeRecord::new("", "").renders_empty());
        assert!(!ExchangeRecord::new("hi", "").renders_empty());
        assert!(!ExchangeRecord::new("", "hello").renders_empty());
    }

    #[test]
    fn images_alone_make_a_page() {
        let r = ExchangeRecord::new("", "").with_images(vec![ImageRef::new("image/png", "AAAA")]);
        assert!(!r.renders_empty());
    }

    #[test]
    fn excluded_sides_do_not_count() {
        let mut r = ExchangeRecord::new("question", "");
        r.include_user = false;
        assert!(r.renders_empty());
    }

    #[test]
    fn curate_copies_and_drops() {
        let records = vec![
            ExchangeRecord::new("a", "1"),
            ExchangeRecord::new("b", "2"),
            ExchangeRecord::new("c", "3"),
        ];
        let decisions = [
            InclusionDecision {
                include_user: false,
                include_model: true,
            },
            InclusionDecision::EXCLUDE,
        ];
        let curated = curate(&records, &decisions);
        assert_eq!(curated.len(), 2);
        assert!(!curated[0].include_user);
        assert!(curated[0].include_model);
        assert_eq!(curated[1].user_text, "c");
        assert!(curated[1].include_user && curated[1].include_model);
        // source untouched
        assert!(records[0].include_user);
    }

    #[test]
    fn recovery_rows_skip_blank_fields() {
        let mut info = RecoveryInfo::for_export("aistudio", Path::new("/data/exports/chat.json"));
        info.notes = "  ".into();
        let rows = info.rows();
        assert_eq!(rows[0], ("Platform", "aistudio"));
        assert!(rows.iter().any(|(k, v)| *k == "Export file" && *v == "chat.json"));
        assert!(rows.iter().all(|(k, _)| *k != "Notes"));
    }

    #[test]
    fn data_uri_format() {
        let img = ImageRef::new("image/jpeg", "Zm9v");
        assert_eq!(img.data_uri(), "data:image/jpeg;base64,Zm9v");
    }
}
