//! Pipeline stages between a curated exchange and a merged PDF page.
//!
//! Each submodule implements one transformation step and is tested on its
//! own. The worker in [`crate::queue`] strings them together.
//!
//! ## Data Flow
//!
//! ```text
//! mapping ──▶ matcher ──▶ render ──▶ (render service) ──▶ merge
//! (latest     (attach     (HTML      (HTML → PDF)         (append to
//!  snapshot)   images)     page)                           destination)
//! ```
//!
//! 1. [`mapping`] loads the newest snippet → image artefact, and writes new ones
//! 2. [`matcher`] scores the model reply against every snippet and attaches
//!    the images of those that match, via [`encode`]
//! 3. [`render`] builds the page HTML; [`markup`] turns Markdown or plain
//!    text into body markup with highlighted code
//! 4. [`merge`] appends the rendered page to the destination; it is blocking
//!    file I/O and runs in `spawn_blocking`

pub mod encode;
pub mod mapping;
pub mod markup;
pub mod matcher;
pub mod merge;
pub mod render;
