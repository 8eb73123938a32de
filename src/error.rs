//! Error types for the convo-archiver library.
//!
//! Failures are split by how far they reach:
//!
//! * [`FormatError`]: an export file could not be ingested. Aborts only that
//!   file; other files in the same session are unaffected.
//! * [`RenderError`] / [`MergeError`]: one page could not be produced or
//!   appended. The worker records the failure as an [`ExchangeError`] inside
//!   [`crate::queue::TaskReport`] and carries on with the next exchange.
//! * [`ConfigError`]: persisted settings or mapping artefacts are malformed.
//!   Callers that load settings recover locally by falling back to defaults.
//! * [`ArchiveError`] is **fatal**: the queue cannot be started or an entry
//!   point cannot proceed at all.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the convo-archiver library.
///
/// Per-exchange failures use [`ExchangeError`] and are stored in
/// [`crate::queue::TaskReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// No render backend could be resolved from the configuration.
    #[error(
        "No render service is configured.\n\
Set one of:\n\
  • ArchiveConfigBuilder::renderer(...) for a custom backend\n\
  • --render-url / CONVO_RENDER_URL for an HTTP render endpoint\n\
  • --render-cmd for a local HTML-to-PDF command"
    )]
    RendererNotConfigured,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// An export file could not be turned into exchange records.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Export file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No structural opening character was found in the file.
    #[error("No {expected} payload found in '{path}'")]
    NoPayload { path: PathBuf, expected: &'static str },

    /// The payload is not syntactically valid JSON.
    #[error("'{path}' is not valid JSON: {detail}")]
    InvalidJson { path: PathBuf, detail: String },

    /// Valid JSON, but not the shape this platform exports.
    #[error("'{path}' does not match the {platform} export schema: {detail}")]
    UnexpectedSchema {
        path: PathBuf,
        platform: &'static str,
        detail: String,
    },

    /// The whole file was walked without producing a single exchange.
    #[error("'{path}' contains no user/model exchanges")]
    Empty { path: PathBuf },
}

/// The external render service failed to produce a PDF page.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Render request to '{endpoint}' failed: {detail}")]
    Http { endpoint: String, detail: String },

    #[error("Render service '{endpoint}' returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Render command '{program}' failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Render call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The service answered, but not with a PDF.
    #[error("Render service returned {len} bytes that are not a PDF (first bytes: {magic:?})")]
    NotAPdf { len: usize, magic: Vec<u8> },

    #[error("Render I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rendered page could not be appended to the destination document.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Destination or page artefact could not be parsed as a PDF.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The rewritten destination does not hold the expected number of pages.
    #[error("Merged document '{path}' has {actual} pages, expected {expected}")]
    VerificationFailed {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Merge failed: {0}")]
    Internal(String),
}

/// Persisted settings or a mapping artefact could not be read or written.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed file '{path}': {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// The task queue no longer accepts work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task queue is stopped; the task was not enqueued")]
    Stopped,
}

/// A non-fatal error for a single exchange of a build task.
///
/// Stored in [`crate::queue::TaskReport::failures`]. The exchange's page is
/// absent from the destination, every other page is unaffected.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExchangeError {
    /// The render service failed for this exchange.
    #[error("Exchange {exchange}: render failed: {detail}")]
    Render { exchange: usize, detail: String },

    /// Appending the rendered page to the destination failed.
    #[error("Exchange {exchange}: merge failed: {detail}")]
    Merge { exchange: usize, detail: String },

    /// A supplemental image could not be loaded; the page was still built.
    #[error("Exchange {exchange}: supplemental image '{path}' skipped: {detail}")]
    Image {
        exchange: usize,
        path: String,
        detail: String,
    },

    /// Infrastructure failure; aborts the remainder of the task.
    #[error("Exchange {exchange}: {detail}")]
    Internal { exchange: usize, detail: String },
}

impl ExchangeError {
    /// Whether this failure ends the current task instead of only its page.
    pub fn aborts_task(&self) -> bool {
        matches!(self, ExchangeError::Internal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_error_mentions_path() {
        let e = FormatError::Empty {
            path: PathBuf::from("/tmp/chat.json"),
        };
        assert!(e.to_string().contains("/tmp/chat.json"), "got: {e}");
    }

    #[test]
    fn not_a_pdf_display() {
        let e = RenderError::NotAPdf {
            len: 12,
            magic: b"<htm".to_vec(),
        };
        assert!(e.to_string().contains("12 bytes"));
    }

    #[test]
    fn verification_failure_display() {
        let e = MergeError::VerificationFailed {
            path: PathBuf::from("archive.pdf"),
            expected: 4,
            actual: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("3 pages"), "got: {msg}");
        assert!(msg.contains("expected 4"), "got: {msg}");
    }

    #[test]
    fn only_internal_errors_abort_the_task() {
        let render = ExchangeError::Render {
            exchange: 2,
            detail: "503".into(),
        };
        let internal = ExchangeError::Internal {
            exchange: 2,
            detail: "temp dir vanished".into(),
        };
        assert!(!render.aborts_task());
        assert!(internal.aborts_task());
    }

    #[test]
    fn format_error_converts_into_archive_error() {
        let e: ArchiveError = FormatError::FileNotFound {
            path: PathBuf::from("missing.json"),
        }
        .into();
        assert!(matches!(e, ArchiveError::Format(_)));
    }
}
