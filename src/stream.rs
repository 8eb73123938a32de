//! Build events as an async `Stream`.
//!
//! [`progress_channel`] returns a [`ProgressCallback`] to install on the
//! [`crate::ArchiveConfig`] and a stream yielding one [`BuildEvent`] per
//! callback invocation, in the order the worker emitted them. Useful when the
//! observer lives in async code (a UI task, a websocket) instead of in a
//! synchronous callback.
//!
//! The stream ends once the worker and every clone of the callback are
//! dropped.

use crate::progress::{BuildProgressCallback, ProgressCallback};
use crate::queue::{TaskId, TaskReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

/// A boxed stream of build events.
pub type EventStream = Pin<Box<dyn Stream<Item = BuildEvent> + Send>>;

/// One worker event. Mirrors the methods of [`BuildProgressCallback`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    TaskStarted {
        task_id: TaskId,
        destination: PathBuf,
        total_exchanges: usize,
    },
    ExchangeStarted {
        task_id: TaskId,
        exchange: usize,
        total: usize,
    },
    ExchangeMerged {
        task_id: TaskId,
        exchange: usize,
        total: usize,
        pages_added: usize,
    },
    ExchangeSkipped {
        task_id: TaskId,
        exchange: usize,
        total: usize,
    },
    ExchangeFailed {
        task_id: TaskId,
        exchange: usize,
        total: usize,
        error: String,
    },
    TaskCompleted(Box<TaskReport>),
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
}

impl BuildEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            BuildEvent::TaskStarted { task_id, .. }
            | BuildEvent::ExchangeStarted { task_id, .. }
            | BuildEvent::ExchangeMerged { task_id, .. }
            | BuildEvent::ExchangeSkipped { task_id, .. }
            | BuildEvent::ExchangeFailed { task_id, .. }
            | BuildEvent::TaskFailed { task_id, .. } => *task_id,
            BuildEvent::TaskCompleted(report) => report.task_id,
        }
    }

    /// Whether this is the last event of its task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildEvent::TaskCompleted(_) | BuildEvent::TaskFailed { .. }
        )
    }
}

struct ChannelCallback {
    tx: mpsc::UnboundedSender<BuildEvent>,
}

impl ChannelCallback {
    fn emit(&self, event: BuildEvent) {
        // Receiver gone: nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl BuildProgressCallback for ChannelCallback {
    fn on_task_start(&self, task_id: TaskId, destination: &Path, total_exchanges: usize) {
        self.emit(BuildEvent::TaskStarted {
            task_id,
            destination: destination.to_path_buf(),
            total_exchanges,
        });
    }

    fn on_exchange_start(&self, task_id: TaskId, exchange: usize, total: usize) {
        self.emit(BuildEvent::ExchangeStarted {
            task_id,
            exchange,
            total,
        });
    }

    fn on_exchange_complete(&self, task_id: TaskId, exchange: usize, total: usize, pages_added: usize) {
        self.emit(BuildEvent::ExchangeMerged {
            task_id,
            exchange,
            total,
            pages_added,
        });
    }

    fn on_exchange_skipped(&self, task_id: TaskId, exchange: usize, total: usize) {
        self.emit(BuildEvent::ExchangeSkipped {
            task_id,
            exchange,
            total,
        });
    }

    fn on_exchange_error(&self, task_id: TaskId, exchange: usize, total: usize, error: &str) {
        self.emit(BuildEvent::ExchangeFailed {
            task_id,
            exchange,
            total,
            error: error.to_string(),
        });
    }

    fn on_task_complete(&self, report: &TaskReport) {
        self.emit(BuildEvent::TaskCompleted(Box::new(report.clone())));
    }

    fn on_task_failed(&self, task_id: TaskId, error: &str) {
        self.emit(BuildEvent::TaskFailed {
            task_id,
            error: error.to_string(),
        });
    }
}

/// A callback/stream pair connected by an unbounded channel.
///
/// # Example
/// ```rust,no_run
/// use convo_archiver::{progress_channel, ArchiveConfig, TaskQueue};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (callback, mut events) = progress_channel();
/// let config = ArchiveConfig::builder()
///     .render_url("http://localhost:3000/render")
///     .progress_callback(callback)
///     .build()?;
/// let queue = TaskQueue::start(config)?;
/// tokio::spawn(async move {
///     while let Some(event) = events.next().await {
///         println!("{event:?}");
///     }
/// });
/// queue.close().await?;
/// # Ok(())
/// # }
/// ```
pub fn progress_channel() -> (ProgressCallback, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ProgressCallback = Arc::new(ChannelCallback { tx });
    (callback, Box::pin(UnboundedReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn events_arrive_in_order_and_stream_ends() {
        let (callback, events) = progress_channel();
        callback.on_task_start(1, Path::new("out.pdf"), 2);
        callback.on_exchange_start(1, 1, 2);
        callback.on_exchange_complete(1, 1, 2, 1);
        callback.on_exchange_start(1, 2, 2);
        callback.on_exchange_skipped(1, 2, 2);
        callback.on_task_complete(&TaskReport::new(1, PathBuf::from("out.pdf"), 2));
        drop(callback);

        let collected: Vec<BuildEvent> = tokio_test::block_on(events.collect());
        assert_eq!(collected.len(), 6);
        assert!(matches!(collected[0], BuildEvent::TaskStarted { total_exchanges: 2, .. }));
        assert!(matches!(
            collected[2],
            BuildEvent::ExchangeMerged { pages_added: 1, .. }
        ));
        assert!(collected[5].is_terminal());
        assert!(collected.iter().all(|e| e.task_id() == 1));
    }

    #[test]
    fn dropped_stream_does_not_break_callback() {
        let (callback, events) = progress_channel();
        drop(events);
        callback.on_task_failed(4, "boom");
    }

    #[test]
    fn event_json_is_tagged() {
        let event = BuildEvent::ExchangeFailed {
            task_id: 2,
            exchange: 3,
            total: 5,
            error: "HTTP 503".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "exchange_failed");
        assert_eq!(json["exchange"], 3);
    }
}
