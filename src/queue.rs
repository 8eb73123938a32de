//! Single-writer build queue.
//!
//! Producers submit [`BuildTask`]s from anywhere; exactly one worker task
//! drains them in submission order. Because two tasks never run at the same
//! time, a destination PDF only ever has one writer and no file lock is
//! needed.
//!
//! ```text
//!   submit() ──┐
//!   submit() ──┼──▶ unbounded channel ──▶ worker loop ──▶ render ──▶ merge
//!   submit() ──┘        (FIFO)            (one task at a time)
//! ```
//!
//! The worker waits for work with a timeout of
//! [`ArchiveConfig::poll_interval_ms`] so a stop request is seen promptly
//! even when the queue is idle. Two ways to end it:
//!
//! * [`TaskQueue::shutdown`]: stop now. The in-flight task runs to the end;
//!   tasks still queued behind it are abandoned and reported.
//! * [`TaskQueue::close`]: stop accepting, finish everything already queued.

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, ExchangeError, QueueError, RenderError};
use crate::model::{BuildTask, ExchangeRecord};
use crate::pipeline::mapping::SupplementalMapping;
use crate::pipeline::matcher::{attach_supplemental, SkippedImage};
use crate::pipeline::merge::{MergeOutcome, PageMerger, PdfMerger};
use crate::pipeline::render::PageRenderer;
use crate::progress::ProgressCallback;
use crate::service::{resolve_renderer, RenderService};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sequential identifier handed out by [`TaskQueue::submit`], starting at 1.
pub type TaskId = u64;

/// Exchange number used in [`ExchangeError`]s raised by the recovery page.
pub const RECOVERY_PAGE: usize = 0;

enum QueueMessage {
    Task(TaskId, BuildTask),
    Shutdown,
}

// ── Reports ──────────────────────────────────────────────────────────────

/// Outcome of one build task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub destination: PathBuf,
    pub total_exchanges: usize,
    /// Pages appended to the destination, recovery page included.
    pub pages_merged: usize,
    pub exchanges_merged: usize,
    /// Exchanges that would have produced an empty page.
    pub skipped: usize,
    /// Pages that could not be rendered or merged.
    pub failures: Vec<ExchangeError>,
    /// Supplemental images that could not be loaded. The page was still built.
    pub image_warnings: Vec<ExchangeError>,
    pub recovery_page_merged: bool,
    /// Terminal error message when the task was cut short.
    pub aborted: Option<String>,
    pub duration_ms: u64,
}

impl TaskReport {
    pub fn new(task_id: TaskId, destination: PathBuf, total_exchanges: usize) -> Self {
        Self {
            task_id,
            destination,
            total_exchanges,
            pages_merged: 0,
            exchanges_merged: 0,
            skipped: 0,
            failures: Vec::new(),
            image_warnings: Vec::new(),
            recovery_page_merged: false,
            aborted: None,
            duration_ms: 0,
        }
    }

    /// Every exchange was merged or legitimately skipped.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_none() && self.failures.is_empty()
    }
}

/// What the worker did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerSummary {
    /// One report per task that was started, in processing order.
    pub reports: Vec<TaskReport>,
    /// Tasks that were queued but never started because of a shutdown.
    pub abandoned: Vec<TaskId>,
}

impl WorkerSummary {
    pub fn tasks_completed(&self) -> usize {
        self.reports.iter().filter(|r| r.aborted.is_none()).count()
    }

    pub fn tasks_aborted(&self) -> usize {
        self.reports.iter().filter(|r| r.aborted.is_some()).count()
    }
}

// ── Producer side ────────────────────────────────────────────────────────

struct SharedState {
    accepting: AtomicBool,
    stop: AtomicBool,
    next_id: AtomicU64,
}

/// Cloneable submit handle for additional producer contexts.
#[derive(Clone)]
pub struct TaskSender {
    tx: mpsc::UnboundedSender<QueueMessage>,
    state: Arc<SharedState>,
}

impl TaskSender {
    /// Enqueue a task without waiting for it to run.
    pub fn submit(&self, task: BuildTask) -> Result<TaskId, QueueError> {
        if !self.state.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Queued task {} ({} exchange(s) → {})",
            id,
            task.exchanges.len(),
            task.destination.display()
        );
        self.tx
            .send(QueueMessage::Task(id, task))
            .map_err(|_| QueueError::Stopped)?;
        Ok(id)
    }
}

/// Handle to the running worker.
pub struct TaskQueue {
    sender: TaskSender,
    handle: JoinHandle<WorkerSummary>,
}

impl TaskQueue {
    /// Resolve the render service and merger, then spawn the worker on the
    /// current tokio runtime.
    ///
    /// # Errors
    /// [`ArchiveError::RendererNotConfigured`] when no render backend can be
    /// found, [`ArchiveError::Internal`] outside a tokio runtime.
    pub fn start(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ArchiveError::Internal(format!("no tokio runtime: {e}")))?;

        let service = resolve_renderer(&config)?;
        let merger: Arc<dyn PageMerger> = match &config.merger {
            Some(m) => Arc::clone(m),
            None => Arc::new(PdfMerger::new(config.verify_merges)),
        };
        info!(
            "Starting build worker (render service: {}, threshold: {})",
            service.name(),
            config.similarity_threshold
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(SharedState {
            accepting: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });
        let worker = Worker {
            renderer: PageRenderer::from_config(&config),
            service,
            merger,
            mappings_dir: config.mappings_dir.clone(),
            threshold: config.similarity_threshold,
            render_timeout_secs: config.render_timeout_secs,
            work_dir: config.work_dir.clone(),
            progress: config.progress_callback.clone(),
        };
        let poll = Duration::from_millis(config.poll_interval_ms);
        let handle = runtime.spawn(worker.run(rx, Arc::clone(&state), poll));

        Ok(Self {
            sender: TaskSender { tx, state },
            handle,
        })
    }

    /// Enqueue a task. Never blocks.
    pub fn submit(&self, task: BuildTask) -> Result<TaskId, QueueError> {
        self.sender.submit(task)
    }

    /// A submit handle that can be moved to another producer.
    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    /// Stop after the in-flight task; anything queued behind it is abandoned.
    pub async fn shutdown(self) -> Result<WorkerSummary, ArchiveError> {
        info!("Shutdown requested");
        self.sender.state.accepting.store(false, Ordering::SeqCst);
        self.sender.state.stop.store(true, Ordering::SeqCst);
        let _ = self.sender.tx.send(QueueMessage::Shutdown);
        join(self.handle).await
    }

    /// Stop accepting tasks and wait until every queued task has run.
    pub async fn close(self) -> Result<WorkerSummary, ArchiveError> {
        info!("Closing queue; draining pending tasks");
        self.sender.state.accepting.store(false, Ordering::SeqCst);
        let _ = self.sender.tx.send(QueueMessage::Shutdown);
        join(self.handle).await
    }
}

async fn join(handle: JoinHandle<WorkerSummary>) -> Result<WorkerSummary, ArchiveError> {
    handle
        .await
        .map_err(|e| ArchiveError::Internal(format!("build worker failed: {e}")))
}

// ── Worker ───────────────────────────────────────────────────────────────

struct Worker {
    renderer: PageRenderer,
    service: Arc<dyn RenderService>,
    merger: Arc<dyn PageMerger>,
    mappings_dir: Option<PathBuf>,
    threshold: f64,
    render_timeout_secs: u64,
    work_dir: Option<PathBuf>,
    progress: Option<ProgressCallback>,
}

impl Worker {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<QueueMessage>,
        state: Arc<SharedState>,
        poll: Duration,
    ) -> WorkerSummary {
        let mut summary = WorkerSummary::default();

        loop {
            let (id, task) = match tokio::time::timeout(poll, rx.recv()).await {
                Err(_idle) => {
                    if state.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
                Ok(None) | Ok(Some(QueueMessage::Shutdown)) => break,
                Ok(Some(QueueMessage::Task(id, task))) => (id, task),
            };

            if state.stop.load(Ordering::SeqCst) {
                warn!("Task {} abandoned: worker is stopping", id);
                summary.abandoned.push(id);
                break;
            }

            summary.reports.push(self.process(id, task).await);
        }

        rx.close();
        while let Ok(message) = rx.try_recv() {
            if let QueueMessage::Task(id, _) = message {
                warn!("Task {} abandoned: worker is stopping", id);
                summary.abandoned.push(id);
            }
        }

        info!(
            "Build worker stopped: {} task(s) completed, {} aborted, {} abandoned",
            summary.tasks_completed(),
            summary.tasks_aborted(),
            summary.abandoned.len()
        );
        summary
    }

    async fn process(&self, id: TaskId, task: BuildTask) -> TaskReport {
        let start = Instant::now();
        let total = task.exchanges.len();
        info!(
            "Task {}: {} exchange(s) → {}",
            id,
            total,
            task.destination.display()
        );
        if let Some(ref cb) = self.progress {
            cb.on_task_start(id, &task.destination, total);
        }

        let mut report = TaskReport::new(id, task.destination.clone(), total);
        let mapping = Arc::new(self.load_mapping());
        let outcome = self.run_task(id, &task, &mapping, &mut report).await;
        report.duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                info!(
                    "Task {} complete: {} page(s) merged, {} skipped, {} failed, {}ms",
                    id,
                    report.pages_merged,
                    report.skipped,
                    report.failures.len(),
                    report.duration_ms
                );
                if let Some(ref cb) = self.progress {
                    cb.on_task_complete(&report);
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!("Task {} aborted: {}", id, message);
                report.aborted = Some(message.clone());
                if let Some(ref cb) = self.progress {
                    cb.on_task_failed(id, &message);
                }
            }
        }
        report
    }

    /// Renders and merges every page of a task. Only task-ending failures
    /// are returned; everything else lands in `report`.
    async fn run_task(
        &self,
        id: TaskId,
        task: &BuildTask,
        mapping: &Arc<SupplementalMapping>,
        report: &mut TaskReport,
    ) -> Result<(), ExchangeError> {
        let total = task.exchanges.len();

        if let Some(info) = &task.recovery {
            let html = self.renderer.render_recovery(info);
            match self.produce_page(RECOVERY_PAGE, &html, &task.destination).await {
                Ok(outcome) => {
                    debug!("Task {}: recovery page merged", id);
                    report.recovery_page_merged = true;
                    report.pages_merged += outcome.pages_added();
                }
                Err(e) if e.aborts_task() => return Err(e),
                Err(e) => {
                    warn!("Task {}: {}", id, e);
                    report.failures.push(e);
                }
            }
        }

        for (i, original) in task.exchanges.iter().enumerate() {
            let n = i + 1;
            if let Some(ref cb) = self.progress {
                cb.on_exchange_start(id, n, total);
            }

            let (record, skipped_images) = match self.attach_images(n, original, mapping).await {
                Ok(attached) => attached,
                Err(e) => {
                    error!("Task {}: {}", id, e);
                    if let Some(ref cb) = self.progress {
                        cb.on_exchange_error(id, n, total, &e.to_string());
                    }
                    report.failures.push(e.clone());
                    return Err(e);
                }
            };
            report
                .image_warnings
                .extend(skipped_images.into_iter().map(|s| ExchangeError::Image {
                    exchange: n,
                    path: s.path.display().to_string(),
                    detail: s.detail,
                }));

            if record.renders_empty() {
                debug!("Task {}: exchange {} is empty, skipped", id, n);
                report.skipped += 1;
                if let Some(ref cb) = self.progress {
                    cb.on_exchange_skipped(id, n, total);
                }
                continue;
            }

            let html = self.renderer.render_exchange(&record, &task.headings, None);
            match self.produce_page(n, &html, &task.destination).await {
                Ok(outcome) => {
                    debug!(
                        "Task {}: exchange {}/{} merged ({} page(s), {} total)",
                        id,
                        n,
                        total,
                        outcome.pages_added(),
                        outcome.total_pages()
                    );
                    report.exchanges_merged += 1;
                    report.pages_merged += outcome.pages_added();
                    if let Some(ref cb) = self.progress {
                        cb.on_exchange_complete(id, n, total, outcome.pages_added());
                    }
                }
                Err(e) => {
                    if let Some(ref cb) = self.progress {
                        cb.on_exchange_error(id, n, total, &e.to_string());
                    }
                    if e.aborts_task() {
                        report.failures.push(e.clone());
                        return Err(e);
                    }
                    warn!("Task {}: {}", id, e);
                    report.failures.push(e);
                }
            }
        }
        Ok(())
    }

    /// Score the response against the mapping and read matched images on
    /// the blocking pool.
    async fn attach_images(
        &self,
        exchange: usize,
        record: &ExchangeRecord,
        mapping: &Arc<SupplementalMapping>,
    ) -> Result<(ExchangeRecord, Vec<SkippedImage>), ExchangeError> {
        if mapping.is_empty() {
            return Ok((record.clone(), Vec::new()));
        }
        let record = record.clone();
        let mapping = Arc::clone(mapping);
        let threshold = self.threshold;
        tokio::task::spawn_blocking(move || attach_supplemental(&record, &mapping, threshold))
            .await
            .map_err(|e| ExchangeError::Internal {
                exchange,
                detail: format!("image matching failed: {e}"),
            })
    }

    /// Render `html`, stage the PDF in a temp file and merge it.
    async fn produce_page(
        &self,
        exchange: usize,
        html: &str,
        destination: &Path,
    ) -> Result<MergeOutcome, ExchangeError> {
        let timeout = Duration::from_secs(self.render_timeout_secs);
        let bytes = match tokio::time::timeout(timeout, self.service.render(html)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                return Err(ExchangeError::Render {
                    exchange,
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ExchangeError::Render {
                    exchange,
                    detail: RenderError::Timeout {
                        secs: self.render_timeout_secs,
                    }
                    .to_string(),
                })
            }
        };

        let page = self
            .write_page(&bytes)
            .map_err(|e| ExchangeError::Internal {
                exchange,
                detail: format!("could not stage rendered page: {e}"),
            })?;

        let merger = Arc::clone(&self.merger);
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || merger.merge(&destination, &page))
            .await
            .map_err(|e| ExchangeError::Internal {
                exchange,
                detail: format!("merge task failed: {e}"),
            })?
            .map_err(|e| ExchangeError::Merge {
                exchange,
                detail: e.to_string(),
            })
    }

    /// Persist PDF bytes to a temp file the merger takes ownership of.
    fn write_page(&self, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("page-").suffix(".pdf");
        let mut file = match &self.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)?
            }
            None => builder.tempfile()?,
        };
        file.write_all(bytes)?;
        file.flush()?;
        file.into_temp_path().keep().map_err(|e| e.error)
    }

    /// Latest mapping snapshot for this task; problems degrade to no mapping.
    fn load_mapping(&self) -> SupplementalMapping {
        let Some(dir) = &self.mappings_dir else {
            return SupplementalMapping::default();
        };
        match SupplementalMapping::load_latest(dir) {
            Ok(mapping) => {
                if let Some(source) = mapping.source() {
                    debug!(
                        "Using mapping {} ({} snippet(s))",
                        source.display(),
                        mapping.entries().len()
                    );
                }
                mapping
            }
            Err(e) => {
                warn!("Ignoring supplemental mappings: {}", e);
                SupplementalMapping::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MergeError;
    use crate::model::{ExchangeRecord, RecoveryInfo};
    use futures::future::BoxFuture;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Returns a fake PDF whose body is the HTML it was given.
    #[derive(Default)]
    struct EchoRenderer {
        fail_on: Option<&'static str>,
        delay_ms: u64,
        started: Arc<Notify>,
    }

    impl RenderService for EchoRenderer {
        fn name(&self) -> &str {
            "echo"
        }

        fn render<'a>(&'a self, html: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RenderError>> {
            Box::pin(async move {
                self.started.notify_one();
                if self.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
                }
                if let Some(marker) = self.fail_on {
                    if html.contains(marker) {
                        return Err(RenderError::Status {
                            endpoint: "mock".into(),
                            status: 503,
                            body: "busy".into(),
                        });
                    }
                }
                Ok(format!("%PDF {html}").into_bytes())
            })
        }
    }

    /// Records the staged page contents per destination.
    #[derive(Default)]
    struct RecordingMerger {
        pages: Mutex<Vec<(PathBuf, String)>>,
        panic_on: Option<&'static str>,
    }

    impl RecordingMerger {
        fn pages(&self) -> Vec<(PathBuf, String)> {
            self.pages.lock().unwrap().clone()
        }
    }

    impl PageMerger for RecordingMerger {
        fn merge(&self, destination: &Path, new_page: &Path) -> Result<MergeOutcome, MergeError> {
            let body = std::fs::read_to_string(new_page).unwrap();
            std::fs::remove_file(new_page).unwrap();
            if let Some(marker) = self.panic_on {
                if body.contains(marker) {
                    panic!("merger blew up");
                }
            }
            let mut pages = self.pages.lock().unwrap();
            pages.push((destination.to_path_buf(), body));
            let total = pages.iter().filter(|(d, _)| d == destination).count();
            Ok(if total == 1 {
                MergeOutcome::Created { pages: 1 }
            } else {
                MergeOutcome::Appended { added: 1, total }
            })
        }
    }

    fn start(renderer: EchoRenderer, merger: Arc<RecordingMerger>) -> TaskQueue {
        let config = ArchiveConfig::builder()
            .renderer(Arc::new(renderer))
            .merger(merger)
            .poll_interval_ms(20)
            .build()
            .unwrap();
        TaskQueue::start(config).unwrap()
    }

    #[tokio::test]
    async fn ids_are_sequential_and_submit_after_stop_fails() {
        let merger = Arc::new(RecordingMerger::default());
        let queue = start(EchoRenderer::default(), merger);
        let sender = queue.sender();
        assert_eq!(queue.submit(BuildTask::new(vec![], "a.pdf")).unwrap(), 1);
        assert_eq!(sender.submit(BuildTask::new(vec![], "b.pdf")).unwrap(), 2);
        let summary = queue.close().await.unwrap();
        assert_eq!(summary.reports.len(), 2);
        assert_eq!(
            sender.submit(BuildTask::new(vec![], "c.pdf")),
            Err(QueueError::Stopped)
        );
    }

    #[tokio::test]
    async fn empty_exchange_is_never_merged() {
        let merger = Arc::new(RecordingMerger::default());
        let queue = start(EchoRenderer::default(), Arc::clone(&merger));
        queue
            .submit(BuildTask::new(
                vec![ExchangeRecord::new("", ""), ExchangeRecord::new("q", "a")],
                "out.pdf",
            ))
            .unwrap();
        let summary = queue.close().await.unwrap();
        let report = &summary.reports[0];
        assert_eq!(report.skipped, 1);
        assert_eq!(report.exchanges_merged, 1);
        assert_eq!(merger.pages().len(), 1);
    }

    #[tokio::test]
    async fn recovery_page_is_merged_first() {
        let merger = Arc::new(RecordingMerger::default());
        let queue = start(EchoRenderer::default(), Arc::clone(&merger));
        let task = BuildTask::new(vec![ExchangeRecord::new("first question", "a")], "out.pdf")
            .with_recovery(RecoveryInfo {
                platform: "aistudio".into(),
                ..RecoveryInfo::default()
            });
        queue.submit(task).unwrap();
        let summary = queue.close().await.unwrap();

        let pages = merger.pages();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].1.contains("Recovery Information"));
        assert!(pages[1].1.contains("first question"));
        assert!(summary.reports[0].recovery_page_merged);
        assert_eq!(summary.reports[0].pages_merged, 2);
    }

    #[tokio::test]
    async fn render_failure_is_recorded_and_batch_continues() {
        let merger = Arc::new(RecordingMerger::default());
        let renderer = EchoRenderer {
            fail_on: Some("broken"),
            ..EchoRenderer::default()
        };
        let queue = start(renderer, Arc::clone(&merger));
        queue
            .submit(BuildTask::new(
                vec![
                    ExchangeRecord::new("one", "a"),
                    ExchangeRecord::new("broken", "b"),
                    ExchangeRecord::new("three", "c"),
                ],
                "out.pdf",
            ))
            .unwrap();
        let summary = queue.close().await.unwrap();
        let report = &summary.reports[0];
        assert!(report.aborted.is_none());
        assert_eq!(report.exchanges_merged, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            ExchangeError::Render { exchange: 2, .. }
        ));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn internal_failure_aborts_task_but_not_worker() {
        let merger = Arc::new(RecordingMerger {
            panic_on: Some("explode"),
            ..RecordingMerger::default()
        });
        let queue = start(EchoRenderer::default(), Arc::clone(&merger));
        queue
            .submit(BuildTask::new(
                vec![
                    ExchangeRecord::new("explode", "a"),
                    ExchangeRecord::new("never reached", "b"),
                ],
                "first.pdf",
            ))
            .unwrap();
        queue
            .submit(BuildTask::new(vec![ExchangeRecord::new("fine", "c")], "second.pdf"))
            .unwrap();
        let summary = queue.close().await.unwrap();

        assert_eq!(summary.reports.len(), 2);
        assert!(summary.reports[0].aborted.is_some());
        assert_eq!(summary.reports[0].exchanges_merged, 0);
        assert!(summary.reports[1].is_clean());
        assert_eq!(summary.tasks_aborted(), 1);
        let pages = merger.pages();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].1.contains("fine"));
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_task_and_abandons_the_rest() {
        let merger = Arc::new(RecordingMerger::default());
        let started = Arc::new(Notify::new());
        let renderer = EchoRenderer {
            delay_ms: 50,
            started: Arc::clone(&started),
            ..EchoRenderer::default()
        };
        let queue = start(renderer, Arc::clone(&merger));
        queue
            .submit(BuildTask::new(
                vec![ExchangeRecord::new("p1", "a"), ExchangeRecord::new("p2", "b")],
                "out.pdf",
            ))
            .unwrap();
        queue
            .submit(BuildTask::new(vec![ExchangeRecord::new("later", "c")], "later.pdf"))
            .unwrap();

        started.notified().await;
        let summary = queue.shutdown().await.unwrap();

        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].exchanges_merged, 2);
        assert_eq!(summary.abandoned, vec![2]);
        assert!(merger.pages().iter().all(|(d, _)| d == Path::new("out.pdf")));
    }

    async fn wait_for_end(events: &mut crate::stream::EventStream, id: TaskId) {
        use futures::StreamExt;
        while let Some(event) = events.next().await {
            if event.is_terminal() && event.task_id() == id {
                return;
            }
        }
        panic!("event stream ended before task {id} finished");
    }

    #[tokio::test]
    async fn mapping_is_reread_for_every_task() {
        use crate::pipeline::mapping::{MappingRow, MappingWriter};
        use image::{DynamicImage, Rgba, RgbaImage};

        let root = tempfile::tempdir().unwrap();
        let mappings = root.path().join("mappings");
        let shot = root.path().join("shot.png");
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([9, 9, 9, 255])))
            .save(&shot)
            .unwrap();

        let merger = Arc::new(RecordingMerger::default());
        let (callback, mut events) = crate::stream::progress_channel();
        let config = ArchiveConfig::builder()
            .renderer(Arc::new(EchoRenderer::default()))
            .merger(Arc::clone(&merger) as Arc<dyn PageMerger>)
            .mappings_dir(&mappings)
            .progress_callback(callback)
            .poll_interval_ms(20)
            .build()
            .unwrap();
        let queue = TaskQueue::start(config).unwrap();
        let reply = "Here is the revenue chart you asked for.";
        let task = || BuildTask::new(vec![ExchangeRecord::new("chart please", reply)], "out.pdf");

        // no artefact yet
        let first = queue.submit(task()).unwrap();
        wait_for_end(&mut events, first).await;

        MappingWriter::new(&mappings)
            .write(&[MappingRow {
                image: Some(shot.clone()),
                text: Some(reply.to_string()),
                description: None,
            }])
            .unwrap();
        let second = queue.submit(task()).unwrap();
        wait_for_end(&mut events, second).await;

        // a broken newest artefact degrades to no images
        std::fs::write(mappings.join("mapping_99999999_999999.json"), "{ not json").unwrap();
        queue.submit(task()).unwrap();

        let summary = queue.close().await.unwrap();
        let pages = merger.pages();
        assert_eq!(pages.len(), 3);
        assert!(!pages[0].1.contains("data:image/png;base64,"));
        assert!(pages[1].1.contains("data:image/png;base64,"));
        assert!(!pages[2].1.contains("data:image/png;base64,"));
        assert!(summary
            .reports
            .iter()
            .all(|r| r.aborted.is_none() && r.failures.is_empty()));
    }

    #[tokio::test]
    async fn idle_worker_observes_stop() {
        let queue = start(EchoRenderer::default(), Arc::new(RecordingMerger::default()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = queue.shutdown().await.unwrap();
        assert!(summary.reports.is_empty());
        assert!(summary.abandoned.is_empty());
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let config = ArchiveConfig::builder()
            .renderer(Arc::new(EchoRenderer::default()))
            .build()
            .unwrap();
        assert!(matches!(
            TaskQueue::start(config),
            Err(ArchiveError::Internal(_))
        ));
    }

    #[test]
    fn report_serialises() {
        let mut report = TaskReport::new(3, PathBuf::from("x.pdf"), 2);
        report.failures.push(ExchangeError::Merge {
            exchange: 1,
            detail: "disk full".into(),
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["task_id"], 3);
        assert_eq!(json["failures"][0]["Merge"]["detail"], "disk full");
    }
}
