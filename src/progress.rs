//! Progress-callback trait for build-task events.
//!
//! Inject an [`Arc<dyn BuildProgressCallback>`] via
//! [`crate::config::ArchiveConfigBuilder::progress_callback`] to observe the
//! worker as it renders and merges each exchange.
//!
//! The worker is the only caller and it processes one exchange at a time, so
//! events for a given task arrive strictly in order. Implementations must
//! still be `Send + Sync`: the worker runs on a tokio task, not on the
//! producer's thread.
//!
//! # Example
//!
//! ```rust
//! use convo_archiver::{ArchiveConfig, BuildProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter {
//!     pages: AtomicUsize,
//! }
//!
//! impl BuildProgressCallback for PageCounter {
//!     fn on_exchange_complete(&self, _task: u64, _n: usize, _total: usize, pages: usize) {
//!         self.pages.fetch_add(pages, Ordering::SeqCst);
//!     }
//! }
//!
//! let counter = Arc::new(PageCounter { pages: AtomicUsize::new(0) });
//! let config = ArchiveConfig::builder()
//!     .progress_callback(counter as Arc<dyn BuildProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::queue::{TaskId, TaskReport};
use std::path::Path;
use std::sync::Arc;

/// Called by the worker as it processes each task.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Exchange numbers are 1-indexed.
pub trait BuildProgressCallback: Send + Sync {
    /// Called when the worker dequeues a task, before anything is rendered.
    fn on_task_start(&self, task_id: TaskId, destination: &Path, total_exchanges: usize) {
        let _ = (task_id, destination, total_exchanges);
    }

    /// Called just before an exchange is matched and rendered.
    fn on_exchange_start(&self, task_id: TaskId, exchange: usize, total: usize) {
        let _ = (task_id, exchange, total);
    }

    /// Called once an exchange's page is merged into the destination.
    ///
    /// `pages_added` is the number of pages the render service produced.
    fn on_exchange_complete(&self, task_id: TaskId, exchange: usize, total: usize, pages_added: usize) {
        let _ = (task_id, exchange, total, pages_added);
    }

    /// Called when an exchange would produce an empty page and is skipped.
    fn on_exchange_skipped(&self, task_id: TaskId, exchange: usize, total: usize) {
        let _ = (task_id, exchange, total);
    }

    /// Called when an exchange's render or merge fails.
    fn on_exchange_error(&self, task_id: TaskId, exchange: usize, total: usize, error: &str) {
        let _ = (task_id, exchange, total, error);
    }

    /// Called once every exchange of the task has been attempted.
    fn on_task_complete(&self, report: &TaskReport) {
        let _ = report;
    }

    /// Called when the task is aborted; `error` is the terminal message.
    fn on_task_failed(&self, task_id: TaskId, error: &str) {
        let _ = (task_id, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BuildProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ArchiveConfig`].
pub type ProgressCallback = Arc<dyn BuildProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        skips: AtomicUsize,
        errors: AtomicUsize,
        pages: AtomicUsize,
    }

    impl BuildProgressCallback for TrackingCallback {
        fn on_exchange_start(&self, _task_id: TaskId, _exchange: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exchange_complete(&self, _task_id: TaskId, _exchange: usize, _total: usize, pages_added: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            self.pages.fetch_add(pages_added, Ordering::SeqCst);
        }

        fn on_exchange_skipped(&self, _task_id: TaskId, _exchange: usize, _total: usize) {
            self.skips.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exchange_error(&self, _task_id: TaskId, _exchange: usize, _total: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_task_start(1, Path::new("out.pdf"), 3);
        cb.on_exchange_start(1, 1, 3);
        cb.on_exchange_complete(1, 1, 3, 1);
        cb.on_exchange_skipped(1, 2, 3);
        cb.on_exchange_error(1, 3, 3, "render failed");
        cb.on_task_failed(1, "aborted");
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_exchange_start(7, 1, 3);
        tracker.on_exchange_complete(7, 1, 3, 2);
        tracker.on_exchange_start(7, 2, 3);
        tracker.on_exchange_skipped(7, 2, 3);
        tracker.on_exchange_start(7, 3, 3);
        tracker.on_exchange_error(7, 3, 3, "HTTP 503");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.skips.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.pages.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        let report = TaskReport::new(1, PathBuf::from("a.pdf"), 0);
        cb.on_task_complete(&report);
    }
}
