//! Configuration types for the archive build worker.
//!
//! Worker behaviour is controlled through [`ArchiveConfig`], built via its
//! [`ArchiveConfigBuilder`]. Per-task choices that the operator makes for a
//! particular batch (headings, recovery page) travel on the
//! [`crate::model::BuildTask`] instead.

use crate::error::ArchiveError;
use crate::pipeline::merge::PageMerger;
use crate::progress::ProgressCallback;
use crate::service::RenderService;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default similarity above which a stored snippet claims an exchange.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;

/// Environment variable consulted when no render backend is configured.
pub const RENDER_URL_ENV: &str = "CONVO_RENDER_URL";

/// Section headings printed above the user and model blocks of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadingConfig {
    pub show_headings: bool,
    pub user_heading: String,
    pub model_heading: String,
}

impl Default for HeadingConfig {
    fn default() -> Self {
        Self {
            show_headings: true,
            user_heading: "User Message".to_string(),
            model_heading: "Model Response".to_string(),
        }
    }
}

impl HeadingConfig {
    /// Heading text for the user block, if one should be printed.
    pub fn user(&self) -> Option<&str> {
        self.visible(&self.user_heading)
    }

    /// Heading text for the model block, if one should be printed.
    pub fn model(&self) -> Option<&str> {
        self.visible(&self.model_heading)
    }

    fn visible<'a>(&self, heading: &'a str) -> Option<&'a str> {
        let heading = heading.trim();
        (self.show_headings && !heading.is_empty()).then_some(heading)
    }
}

/// How a block of text is turned into page markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BodyFormat {
    /// Escaped verbatim, newlines become line breaks.
    Plain,
    /// Markdown with tables, math, highlighted code and diagrams.
    #[default]
    Markdown,
}

/// Configuration for the build worker.
///
/// # Example
/// ```rust
/// use convo_archiver::ArchiveConfig;
///
/// let config = ArchiveConfig::builder()
///     .render_url("http://localhost:3000/render")
///     .mappings_dir("mappings")
///     .poll_interval_ms(100)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ArchiveConfig {
    /// Format of the user block. Default: [`BodyFormat::Plain`].
    pub user_format: BodyFormat,

    /// Format of the model block. Default: [`BodyFormat::Markdown`].
    pub model_format: BodyFormat,

    /// Directory holding `mapping_*.json` artefacts. `None` disables
    /// supplemental image association.
    pub mappings_dir: Option<PathBuf>,

    /// Snippet similarity required to attach its images. Default: 0.9.
    ///
    /// The comparison is strict (`score > threshold`) and every snippet
    /// that clears it contributes its images.
    pub similarity_threshold: f64,

    /// How long the worker waits for a task before re-checking the stop
    /// flag, in milliseconds. Default: 250.
    pub poll_interval_ms: u64,

    /// Upper bound on a single render call, in seconds. Default: 60.
    pub render_timeout_secs: u64,

    /// Re-read the destination after each merge and check its page count.
    /// Default: true.
    pub verify_merges: bool,

    /// Where temporary page artefacts are written. Default: system temp dir.
    pub work_dir: Option<PathBuf>,

    /// Replacement stylesheet. If None, uses [`crate::style::DEFAULT_STYLESHEET`].
    pub stylesheet: Option<String>,

    /// Markup inserted into every page's `<head>`, typically inline KaTeX and
    /// mermaid scripts. Without it, math and diagrams print as source.
    pub page_head: Option<String>,

    /// Pre-constructed render backend. Takes precedence over the URL/command.
    pub renderer: Option<Arc<dyn RenderService>>,

    /// HTTP endpoint accepting HTML and answering with a PDF.
    pub render_url: Option<String>,

    /// Local command (program + args) reading HTML on stdin, writing PDF on stdout.
    pub render_command: Option<Vec<String>>,

    /// Pre-constructed merger. If None, a [`crate::pipeline::merge::PdfMerger`]
    /// honouring `verify_merges` is used.
    pub merger: Option<Arc<dyn PageMerger>>,

    /// Observer for task and exchange events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            user_format: BodyFormat::Plain,
            model_format: BodyFormat::Markdown,
            mappings_dir: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            poll_interval_ms: 250,
            render_timeout_secs: 60,
            verify_merges: true,
            work_dir: None,
            stylesheet: None,
            page_head: None,
            renderer: None,
            render_url: None,
            render_command: None,
            merger: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ArchiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveConfig")
            .field("user_format", &self.user_format)
            .field("model_format", &self.model_format)
            .field("mappings_dir", &self.mappings_dir)
            .field("similarity_threshold", &self.similarity_threshold)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("render_timeout_secs", &self.render_timeout_secs)
            .field("verify_merges", &self.verify_merges)
            .field("work_dir", &self.work_dir)
            .field("stylesheet", &self.stylesheet.as_ref().map(|s| s.len()))
            .field("page_head", &self.page_head.as_ref().map(|s| s.len()))
            .field("renderer", &self.renderer.as_ref().map(|r| r.name().to_string()))
            .field("render_url", &self.render_url)
            .field("render_command", &self.render_command)
            .field("merger", &self.merger.as_ref().map(|_| "<dyn PageMerger>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BuildProgressCallback>"),
            )
            .finish()
    }
}

impl ArchiveConfig {
    /// Create a new builder for `ArchiveConfig`.
    pub fn builder() -> ArchiveConfigBuilder {
        ArchiveConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ArchiveConfig`].
pub struct ArchiveConfigBuilder {
    config: ArchiveConfig,
}

impl fmt::Debug for ArchiveConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ArchiveConfigBuilder {
    pub fn user_format(mut self, format: BodyFormat) -> Self {
        self.config.user_format = format;
        self
    }

    pub fn model_format(mut self, format: BodyFormat) -> Self {
        self.config.model_format = format;
        self
    }

    pub fn mappings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.mappings_dir = Some(dir.into());
        self
    }

    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.config.similarity_threshold = threshold;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs.max(1);
        self
    }

    pub fn verify_merges(mut self, v: bool) -> Self {
        self.config.verify_merges = v;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    pub fn stylesheet(mut self, css: impl Into<String>) -> Self {
        self.config.stylesheet = Some(css.into());
        self
    }

    pub fn page_head(mut self, html: impl Into<String>) -> Self {
        self.config.page_head = Some(html.into());
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn RenderService>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn render_url(mut self, url: impl Into<String>) -> Self {
        self.config.render_url = Some(url.into());
        self
    }

    pub fn render_command(mut self, command: Vec<String>) -> Self {
        self.config.render_command = Some(command);
        self
    }

    pub fn merger(mut self, merger: Arc<dyn PageMerger>) -> Self {
        self.config.merger = Some(merger);
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress_callback = Some(callback);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ArchiveConfig, ArchiveError> {
        let c = &self.config;
        if !(c.similarity_threshold > 0.0 && c.similarity_threshold <= 1.0) {
            return Err(ArchiveError::InvalidConfig(format!(
                "similarity threshold must be in (0, 1], got {}",
                c.similarity_threshold
            )));
        }
        if c.poll_interval_ms < 10 {
            return Err(ArchiveError::InvalidConfig(format!(
                "poll interval must be ≥ 10ms, got {}",
                c.poll_interval_ms
            )));
        }
        if let Some(cmd) = &c.render_command {
            if cmd.first().is_none_or(|p| p.trim().is_empty()) {
                return Err(ArchiveError::InvalidConfig(
                    "render command must name a program".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ArchiveConfig::default();
        assert_eq!(c.similarity_threshold, 0.9);
        assert_eq!(c.user_format, BodyFormat::Plain);
        assert_eq!(c.model_format, BodyFormat::Markdown);
        assert!(c.verify_merges);
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let err = ArchiveConfig::builder()
            .similarity_threshold(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidConfig(_)));
        assert!(ArchiveConfig::builder()
            .similarity_threshold(0.0)
            .build()
            .is_err());
    }

    #[test]
    fn tiny_poll_interval_is_rejected() {
        assert!(ArchiveConfig::builder().poll_interval_ms(1).build().is_err());
    }

    #[test]
    fn empty_render_command_is_rejected() {
        assert!(ArchiveConfig::builder()
            .render_command(vec![])
            .build()
            .is_err());
        assert!(ArchiveConfig::builder()
            .render_command(vec!["wkhtmltopdf".into(), "-".into(), "-".into()])
            .build()
            .is_ok());
    }

    #[test]
    fn headings_hidden_when_disabled_or_blank() {
        let mut h = HeadingConfig::default();
        assert_eq!(h.user(), Some("User Message"));
        h.model_heading = "   ".into();
        assert_eq!(h.model(), None);
        h.show_headings = false;
        assert_eq!(h.user(), None);
    }
}
