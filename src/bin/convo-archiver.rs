//! CLI binary for convo-archiver.
//!
//! A thin shim over the library crate: parse exports, map CLI flags to
//! `ArchiveConfig` and `BuildTask`s, and print the worker's reports.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use convo_archiver::parsers::DEFAULT_PLATFORM;
use convo_archiver::pipeline::mapping::{
    store_supplemental_image, MAPPINGS_DIR, SUPPLEMENTAL_IMAGES_DIR,
};
use convo_archiver::{
    curate, ArchiveConfig, BuildProgressCallback, BuildTask, ExchangeRecord, HeadingConfig,
    InclusionDecision, MappingRow, MappingWriter, ParserRegistry, ProgressCallback, Settings,
    TaskId, TaskQueue, TaskReport, WorkerSummary,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: [&str; 11] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar, reset for every task, with a log
/// line per exchange printed above it.
struct CliProgressCallback {
    bar: ProgressBar,
    exchange_started: Mutex<Option<Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} exchanges  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&TICKS);
        bar.set_style(style);
        bar.set_prefix("Waiting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            exchange_started: Mutex::new(None),
        })
    }

    fn elapsed_secs(&self) -> f64 {
        self.exchange_started
            .lock()
            .ok()
            .and_then(|mut t| t.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BuildProgressCallback for CliProgressCallback {
    fn on_task_start(&self, task_id: TaskId, destination: &Path, total_exchanges: usize) {
        self.bar.set_length(total_exchanges as u64);
        self.bar.set_position(0);
        self.bar.reset_eta();
        self.bar.set_prefix(format!("Task {task_id}"));
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "Task {task_id}: {total_exchanges} exchange(s) → {}",
                destination.display()
            ))
        ));
    }

    fn on_exchange_start(&self, _task_id: TaskId, _exchange: usize, _total: usize) {
        if let Ok(mut t) = self.exchange_started.lock() {
            *t = Some(Instant::now());
        }
    }

    fn on_exchange_complete(&self, _task_id: TaskId, exchange: usize, total: usize, pages_added: usize) {
        self.bar.println(format!(
            "  {} Exchange {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            exchange,
            total,
            dim(&format!("{pages_added} page(s)")),
            dim(&format!("{:.1}s", self.elapsed_secs())),
        ));
        self.bar.inc(1);
    }

    fn on_exchange_skipped(&self, _task_id: TaskId, exchange: usize, total: usize) {
        self.bar.println(format!(
            "  {} Exchange {:>3}/{:<3}  {}",
            dim("–"),
            exchange,
            total,
            dim("empty, skipped"),
        ));
        self.bar.inc(1);
    }

    fn on_exchange_error(&self, _task_id: TaskId, exchange: usize, total: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('\u{2026}')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Exchange {:>3}/{:<3}  {}  {}",
            red("✗"),
            exchange,
            total,
            red(&msg),
            dim(&format!("{:.1}s", self.elapsed_secs())),
        ));
        self.bar.inc(1);
    }

    fn on_task_failed(&self, task_id: TaskId, error: &str) {
        self.bar
            .println(format!("  {} Task {task_id} aborted: {}", red("✘"), red(error)));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Which export formats are understood
  convo-archiver platforms

  # Look at what an export contains
  convo-archiver parse chat.json --platform chatgpt

  # Append every exchange to an archive, with a recovery page
  convo-archiver build chat.json --dest archive.pdf --recovery \
      --render-url http://localhost:3000/render

  # Drop exchange 2 entirely and the user side of exchange 5
  convo-archiver build chat.json --dest archive.pdf --exclude 2 --exclude-user 5

  # Render locally through a command reading HTML on stdin
  convo-archiver build a.json b.json --dest archive.pdf \
      --render-cmd "wkhtmltopdf --quiet - -"

  # Attach a screenshot to responses that contain this text
  convo-archiver map --text-file reply.txt --image shot.png --desc "Result"

ENVIRONMENT VARIABLES:
  CONVO_RENDER_URL      HTML → PDF render endpoint
  CONVO_RENDER_CMD      Local render command (HTML on stdin, PDF on stdout)
  CONVO_DEST            Default destination archive
  CONVO_PLATFORM        Default export platform
  CONVO_MAPPINGS_DIR    Directory holding mapping_*.json artefacts
  CONVO_PAGE_HEAD       File inserted into every page's <head> (math / diagram scripts)
  CONVO_SETTINGS        Settings file (default: <config dir>/convo-archiver/settings.json)
  RUST_LOG              Overrides the log filter
"#;

/// Curate AI-chat exports into a single, growing PDF archive.
#[derive(Parser, Debug)]
#[command(
    name = "convo-archiver",
    version,
    about = "Curate AI-chat exports into a single, growing PDF archive",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "CONVO_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "CONVO_QUIET")]
    quiet: bool,

    /// Settings file with remembered defaults.
    #[arg(long, global = true, env = "CONVO_SETTINGS")]
    settings: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List supported export platforms and their aliases.
    Platforms,
    /// Parse an export and print its exchanges.
    Parse(ParseArgs),
    /// Render exchanges and append them to a PDF archive.
    Build(BuildArgs),
    /// Record which images belong to a response snippet.
    Map(MapArgs),
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// Export file.
    file: PathBuf,

    /// Export platform (see `platforms`).
    #[arg(long, env = "CONVO_PLATFORM")]
    platform: Option<String>,

    /// Print the exchanges as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Export files; each becomes its own task.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Archive to append to (created on first use).
    #[arg(short, long, env = "CONVO_DEST")]
    dest: Option<PathBuf>,

    /// Export platform (see `platforms`).
    #[arg(long, env = "CONVO_PLATFORM")]
    platform: Option<String>,

    /// Exchanges to leave out entirely (1-indexed, comma-separated).
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<usize>,

    /// Exchanges whose user message is left out.
    #[arg(long, value_delimiter = ',')]
    exclude_user: Vec<usize>,

    /// Exchanges whose model response is left out.
    #[arg(long, value_delimiter = ',')]
    exclude_model: Vec<usize>,

    /// Omit the section headings.
    #[arg(long)]
    no_headings: bool,

    /// Heading above user messages.
    #[arg(long)]
    user_heading: Option<String>,

    /// Heading above model responses.
    #[arg(long)]
    model_heading: Option<String>,

    /// Directory holding mapping_*.json artefacts.
    #[arg(long, env = "CONVO_MAPPINGS_DIR")]
    mappings_dir: Option<PathBuf>,

    /// Similarity a snippet must exceed to attach its images.
    #[arg(long, default_value_t = convo_archiver::config::DEFAULT_SIMILARITY_THRESHOLD)]
    threshold: f64,

    /// HTTP render endpoint (HTML in, PDF out).
    #[arg(long, env = "CONVO_RENDER_URL", conflicts_with = "render_cmd")]
    render_url: Option<String>,

    /// Render command reading HTML on stdin and writing PDF on stdout.
    #[arg(long, env = "CONVO_RENDER_CMD")]
    render_cmd: Option<String>,

    /// Per-page render timeout in seconds.
    #[arg(long, default_value_t = 60)]
    render_timeout: u64,

    /// File whose contents go into every page's <head> (KaTeX / mermaid scripts).
    #[arg(long, env = "CONVO_PAGE_HEAD")]
    page_head: Option<PathBuf>,

    /// Put a recovery page ahead of each file's exchanges.
    #[arg(long)]
    recovery: bool,

    /// Link to the original conversation.
    #[arg(long, requires = "recovery")]
    recovery_link: Option<String>,

    /// Account the conversation belongs to.
    #[arg(long, requires = "recovery")]
    recovery_account: Option<String>,

    /// Free-form notes for the recovery page.
    #[arg(long, requires = "recovery")]
    recovery_notes: Option<String>,

    /// Markdown copy of the conversation, recorded on the recovery page.
    #[arg(long, requires = "recovery")]
    md_file: Option<PathBuf>,

    /// Skip re-reading the archive after each merge.
    #[arg(long)]
    no_verify: bool,

    /// Remember destination, platform and render settings for next time.
    #[arg(long)]
    remember: bool,

    /// Print the task reports as JSON.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "CONVO_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct MapArgs {
    /// File holding the response text the images belong to.
    #[arg(long, conflicts_with = "text", required_unless_present = "text")]
    text_file: Option<PathBuf>,

    /// Response text given inline.
    #[arg(long)]
    text: Option<String>,

    /// Image files, in display order.
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,

    /// Captions, matched to images by position.
    #[arg(long = "desc")]
    descriptions: Vec<String>,

    /// Directory to write the artefact to.
    #[arg(long, env = "CONVO_MAPPINGS_DIR")]
    mappings_dir: Option<PathBuf>,

    /// Copy the images next to the mappings instead of referencing them.
    #[arg(long)]
    copy_images: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = match &cli.command {
        Command::Build(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let filter = if cli.verbose { "debug" } else { filter };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let settings_path = cli.settings.clone().or_else(Settings::default_path);
    let settings = settings_path
        .as_deref()
        .map(Settings::load)
        .unwrap_or_default();
    let registry = ParserRegistry::with_defaults();

    match cli.command {
        Command::Platforms => {
            for (platform, name, aliases) in registry.platforms() {
                let marker = if platform == registry.default_platform() {
                    " (default)"
                } else {
                    ""
                };
                if aliases.is_empty() {
                    println!("{platform:<12} {name}{marker}");
                } else {
                    println!(
                        "{platform:<12} {name}{marker}  {}",
                        dim(&format!("aliases: {}", aliases.join(", ")))
                    );
                }
            }
            Ok(())
        }
        Command::Parse(args) => run_parse(&registry, &settings, args),
        Command::Build(args) => {
            run_build(
                &registry,
                settings,
                settings_path.as_deref(),
                args,
                cli.quiet,
                show_progress,
            )
            .await
        }
        Command::Map(args) => run_map(&settings, args),
    }
}

// ── parse ────────────────────────────────────────────────────────────────

fn run_parse(registry: &ParserRegistry, settings: &Settings, args: ParseArgs) -> Result<()> {
    let platform = pick_platform(args.platform.as_deref(), settings);
    let exchanges = registry
        .parse(&platform, &args.file)
        .with_context(|| format!("Failed to parse {}", args.file.display()))?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&exchanges).context("Failed to serialise exchanges")?
        );
        return Ok(());
    }

    println!(
        "{} {} exchange(s) in {}",
        cyan("◆"),
        bold(&exchanges.len().to_string()),
        args.file.display()
    );
    for (i, exchange) in exchanges.iter().enumerate() {
        print_exchange(i + 1, exchange);
    }
    Ok(())
}

fn print_exchange(n: usize, exchange: &ExchangeRecord) {
    let images = if exchange.model_images.is_empty() {
        String::new()
    } else {
        format!("  [{} image(s)]", exchange.model_images.len())
    };
    println!("{:>4}. {} {}", n, bold("user: "), preview(&exchange.user_text));
    println!(
        "      {} {}{}",
        bold("model:"),
        preview(&exchange.model_text),
        dim(&images)
    );
}

fn preview(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return dim("(empty)");
    }
    if flat.chars().count() > 72 {
        let head: String = flat.chars().take(71).collect();
        format!("{head}\u{2026}")
    } else {
        flat
    }
}

// ── build ────────────────────────────────────────────────────────────────

async fn run_build(
    registry: &ParserRegistry,
    mut settings: Settings,
    settings_path: Option<&Path>,
    args: BuildArgs,
    quiet: bool,
    show_progress: bool,
) -> Result<()> {
    let platform = pick_platform(args.platform.as_deref(), &settings);
    let destination = args
        .dest
        .clone()
        .or_else(|| settings.destination.clone())
        .context("No destination archive: pass --dest or set CONVO_DEST")?;

    let headings = build_headings(&args, &settings);
    let decisions = build_decisions(&args);

    // ── Parse and curate every file before anything is queued ───────────
    let mut tasks = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let exchanges = registry
            .parse(&platform, file)
            .with_context(|| format!("Failed to parse {}", file.display()))?;
        let curated = curate(&exchanges, &decisions(exchanges.len()));
        let mut task = BuildTask::new(curated, destination.clone()).with_headings(headings.clone());
        if args.recovery {
            let mut info = settings.recovery_for(&platform, file);
            if let Some(link) = &args.recovery_link {
                info.link = link.clone();
            }
            if let Some(account) = &args.recovery_account {
                info.account = account.clone();
            }
            if let Some(notes) = &args.recovery_notes {
                info.notes = notes.clone();
            }
            if let Some(md) = &args.md_file {
                info.md_file_name = md
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                info.md_file_location = md
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
            }
            task = task.with_recovery(info);
        }
        tasks.push(task);
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(&args, &settings, progress.clone())?;

    // ── Run the worker ───────────────────────────────────────────────────
    let queue = TaskQueue::start(config).context("Failed to start the build worker")?;
    for task in tasks {
        queue.submit(task).context("Failed to queue task")?;
    }
    let summary = queue.close().await.context("Build worker failed")?;
    if let Some(cb) = &progress {
        cb.finish();
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise reports")?
        );
    } else if !quiet {
        print_summary(&summary);
    }

    if args.remember {
        settings.destination = Some(destination);
        settings.platform = Some(platform);
        settings.headings = headings;
        if args.mappings_dir.is_some() {
            settings.mappings_dir = args.mappings_dir.clone();
        }
        if args.render_url.is_some() {
            settings.render_url = args.render_url.clone();
            settings.render_command = None;
        }
        if let Some(cmd) = &args.render_cmd {
            settings.render_command = Some(split_command(cmd));
            settings.render_url = None;
        }
        match settings_path {
            Some(path) => settings
                .save(path)
                .with_context(|| format!("Failed to save settings to {}", path.display()))?,
            None => eprintln!("{} no config directory; settings not saved", cyan("⚠")),
        }
    }

    if summary.reports.iter().any(|r| !r.is_clean()) {
        std::process::exit(2);
    }
    Ok(())
}

fn pick_platform(flag: Option<&str>, settings: &Settings) -> String {
    flag.map(str::to_string)
        .or_else(|| settings.platform.clone())
        .unwrap_or_else(|| DEFAULT_PLATFORM.to_string())
}

fn build_headings(args: &BuildArgs, settings: &Settings) -> HeadingConfig {
    let mut headings = settings.headings.clone();
    if args.no_headings {
        headings.show_headings = false;
    }
    if let Some(h) = &args.user_heading {
        headings.user_heading = h.clone();
    }
    if let Some(h) = &args.model_heading {
        headings.model_heading = h.clone();
    }
    headings
}

/// Returns a closure producing one decision per exchange of a file.
fn build_decisions(args: &BuildArgs) -> impl Fn(usize) -> Vec<InclusionDecision> + '_ {
    move |count| {
        (1..=count)
            .map(|n| {
                if args.exclude.contains(&n) {
                    return InclusionDecision::EXCLUDE;
                }
                InclusionDecision {
                    include_user: !args.exclude_user.contains(&n),
                    include_model: !args.exclude_model.contains(&n),
                }
            })
            .collect()
    }
}

fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_string).collect()
}

/// Map CLI args to `ArchiveConfig`.
fn build_config(
    args: &BuildArgs,
    settings: &Settings,
    progress: Option<Arc<CliProgressCallback>>,
) -> Result<ArchiveConfig> {
    let mut builder = ArchiveConfig::builder()
        .similarity_threshold(args.threshold)
        .render_timeout_secs(args.render_timeout)
        .verify_merges(!args.no_verify);

    if let Some(dir) = args.mappings_dir.clone().or_else(|| settings.mappings_dir.clone()) {
        builder = builder.mappings_dir(dir);
    }

    // Flags win over remembered settings; a remembered URL only applies
    // when no command was given on the command line, and vice versa.
    if let Some(url) = &args.render_url {
        builder = builder.render_url(url.clone());
    } else if let Some(cmd) = &args.render_cmd {
        let command = split_command(cmd);
        if command.is_empty() {
            bail!("--render-cmd is empty");
        }
        builder = builder.render_command(command);
    } else if let Some(url) = &settings.render_url {
        builder = builder.render_url(url.clone());
    } else if let Some(cmd) = &settings.render_command {
        builder = builder.render_command(cmd.clone());
    }

    if let Some(path) = &args.page_head {
        let head = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read page head {}", path.display()))?;
        builder = builder.page_head(head);
    }

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb as ProgressCallback);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(summary: &WorkerSummary) {
    for report in &summary.reports {
        print_report(report);
    }
    for id in &summary.abandoned {
        eprintln!("{} Task {id} was not started", cyan("⚠"));
    }
}

fn print_report(report: &TaskReport) {
    let mark = if report.aborted.is_some() {
        red("✘")
    } else if report.failures.is_empty() {
        green("✔")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{}  Task {}  {}/{} exchanges  {} page(s)  {}ms  →  {}",
        mark,
        report.task_id,
        report.exchanges_merged,
        report.total_exchanges,
        report.pages_merged,
        report.duration_ms,
        bold(&report.destination.display().to_string()),
    );
    if report.skipped > 0 {
        eprintln!("   {}", dim(&format!("{} empty exchange(s) skipped", report.skipped)));
    }
    for failure in &report.failures {
        eprintln!("   {} {}", red("✗"), failure);
    }
    for warning in &report.image_warnings {
        eprintln!("   {} {}", cyan("⚠"), warning);
    }
    if let Some(reason) = &report.aborted {
        eprintln!("   {} {}", red("aborted:"), reason);
    }
}

// ── map ──────────────────────────────────────────────────────────────────

fn run_map(settings: &Settings, args: MapArgs) -> Result<()> {
    let text = match (&args.text, &args.text_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => bail!("pass --text or --text-file"),
    };
    if text.trim().is_empty() {
        bail!("The response text is empty");
    }

    let dir = args
        .mappings_dir
        .clone()
        .or_else(|| settings.mappings_dir.clone())
        .unwrap_or_else(|| PathBuf::from(MAPPINGS_DIR));
    let images_dir = dir
        .parent()
        .unwrap_or(Path::new(""))
        .join(SUPPLEMENTAL_IMAGES_DIR);

    let mut rows = Vec::with_capacity(args.images.len());
    for (i, image) in args.images.iter().enumerate() {
        let stored = if args.copy_images {
            let bytes = std::fs::read(image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            store_supplemental_image(&images_dir, &bytes)
                .with_context(|| format!("Failed to copy {}", image.display()))?
        } else {
            image.clone()
        };
        let stored = std::fs::canonicalize(&stored)
            .with_context(|| format!("Image not found: {}", stored.display()))?;
        rows.push(MappingRow {
            image: Some(stored),
            text: (i == 0).then(|| text.clone()),
            description: args.descriptions.get(i).cloned(),
        });
    }

    let path = MappingWriter::new(&dir)
        .write(&rows)
        .context("Failed to write mapping")?;
    println!("{} {}", green("✔"), path.display());
    Ok(())
}
