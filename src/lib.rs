//! # convo-archiver
//!
//! Curate AI-chat conversation exports into a single, growing PDF archive.
//!
//! ## Why this crate?
//!
//! Chat platforms export conversations as JSON in their own shapes, with
//! model "thinking" turns interleaved, images inlined as base64, and code,
//! tables, and math in Markdown. This crate normalises those exports into
//! user/model exchanges, lets the operator choose what to keep, and appends
//! one rendered page per exchange to a PDF that only ever grows.
//!
//! ## Pipeline Overview
//!
//! ```text
//! export.json
//!  │
//!  ├─ 1. Parse    platform parser → ordered ExchangeRecords
//!  ├─ 2. Curate   keep / drop each side of each exchange
//!  ├─ 3. Match    attach supplemental images whose snippet matches the reply
//!  ├─ 4. Render   exchange → HTML page → PDF via the render service
//!  └─ 5. Merge    append the page to the destination archive (single writer)
//! ```
//!
//! Steps 3–5 run on one background worker fed by a [`TaskQueue`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use convo_archiver::{ArchiveConfig, BuildTask, ParserRegistry, TaskQueue};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ParserRegistry::with_defaults();
//!     let exchanges = registry.parse("aistudio", Path::new("chat.json"))?;
//!
//!     let config = ArchiveConfig::builder()
//!         .render_url("http://localhost:3000/render")
//!         .build()?;
//!     let queue = TaskQueue::start(config)?;
//!     queue.submit(BuildTask::new(exchanges, "archive.pdf"))?;
//!
//!     let summary = queue.close().await?;
//!     eprintln!("{} page(s) merged", summary.reports[0].pages_merged);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `convo-archiver` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! convo-archiver = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod model;
pub mod parsers;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod service;
pub mod settings;
pub mod stream;
pub mod style;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ArchiveConfig, ArchiveConfigBuilder, BodyFormat, HeadingConfig};
pub use error::{
    ArchiveError, ConfigError, ExchangeError, FormatError, MergeError, QueueError, RenderError,
};
pub use model::{
    curate, BuildTask, ExchangeRecord, ImageRef, InclusionDecision, RecoveryInfo, SequenceNumbers,
};
pub use parsers::{ConversationParser, ParserRegistry};
pub use pipeline::mapping::{MappingRow, MappingWriter, SupplementalMapping};
pub use pipeline::matcher::{attach_supplemental, score};
pub use pipeline::merge::{MergeOutcome, PageMerger, PdfMerger};
pub use pipeline::render::PageRenderer;
pub use progress::{BuildProgressCallback, NoopProgressCallback, ProgressCallback};
pub use queue::{TaskId, TaskQueue, TaskReport, TaskSender, WorkerSummary};
pub use service::{CommandRenderService, HttpRenderService, RenderService};
pub use settings::Settings;
pub use stream::{progress_channel, BuildEvent, EventStream};
