//! `fetchmon get`: download one or more URLs.
//!
//! Every URL is enrolled with a coordinator built from the configuration file
//! and the command-line overrides, then requested in argument order. Requests
//! beyond `--max-active` wait in the queue. Ctrl-C stops every active download
//! and keeps the partial files, so running the same command again resumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use tracing::{info, warn};

use fetchmon::config::{ConfigFile, CoordinatorConfig};
use fetchmon::download::{
    DownloadCoordinator, DownloadEvent, DownloadId, DownloadObserver, DownloadSnapshot,
    DownloadTask, Status, TracingObserver,
};

use super::common::{format_size, ExistsArg};
use crate::error::CliError;

/// How often the command checks whether everything has settled.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long running transfers get to wind down on exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const BAR_TEMPLATE: &str =
    "{msg:32!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {eta}";
const SPINNER_TEMPLATE: &str = "{spinner} {msg:32!} {bytes} {bytes_per_sec}";

/// Arguments of `fetchmon get`.
#[derive(Debug, Args)]
pub struct GetArgs {
    /// URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Directory to save into (defaults to downloads.directory)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Maximum number of simultaneous downloads
    #[arg(short = 'j', long)]
    pub max_active: Option<usize>,

    /// Bytes fetched per chunk
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// What to do when a destination file already exists
    #[arg(long, value_enum)]
    pub exists_policy: Option<ExistsArg>,

    /// HTTP timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print final download states as JSON instead of a summary
    #[arg(long)]
    pub json: bool,

    /// Hide progress bars
    #[arg(short, long)]
    pub quiet: bool,
}

impl GetArgs {
    /// Layer the command-line overrides on top of the file settings.
    pub fn coordinator_config(&self, file: &ConfigFile) -> CoordinatorConfig {
        let mut config = file.to_coordinator_config();
        if let Some(dir) = &self.dir {
            config = config.with_download_dir(dir);
        }
        if let Some(max) = self.max_active {
            config = config.with_max_active(max);
        }
        if let Some(bytes) = self.chunk_size {
            config = config.with_chunk_size(bytes);
        }
        if let Some(policy) = self.exists_policy {
            config = config.with_exists_policy(policy.into());
        }
        if let Some(secs) = self.timeout {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Run `fetchmon get`.
pub fn run(args: GetArgs, config_path: &Path) -> Result<(), CliError> {
    let file = ConfigFile::load(config_path)?;
    let coordinator = DownloadCoordinator::new(args.coordinator_config(&file));
    info!(
        dir = %coordinator.config().download_dir.display(),
        max_active = coordinator.max_active(),
        "Starting downloads"
    );

    let hidden = args.json || args.quiet;
    let display = ProgressDisplay::new(hidden);
    coordinator.add_observer(display.clone());
    if hidden {
        coordinator.add_observer(Arc::new(TracingObserver));
    }

    let mut tasks = Vec::with_capacity(args.urls.len());
    let mut rejected = 0;
    for url in &args.urls {
        match coordinator.add_url(url) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                warn!(url = %url, error = %e, "Skipping download");
                display.println(format!("Skipping {}: {}", url, e));
                rejected += 1;
            }
        }
    }

    // Set up signal handler for graceful shutdown
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    for task in &tasks {
        task.download();
    }

    while !interrupted.load(Ordering::SeqCst) && !all_settled(&tasks) {
        std::thread::sleep(POLL_INTERVAL);
    }

    let was_interrupted = interrupted.load(Ordering::SeqCst);
    if was_interrupted {
        info!("Interrupted, stopping active downloads");
    }
    if !coordinator.shutdown(SHUTDOWN_TIMEOUT) {
        warn!("Some downloads did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }
    display.clear();

    if args.json {
        print_json(&coordinator.snapshots())?;
    } else {
        print_summary(&tasks);
    }

    if was_interrupted {
        return Err(CliError::Interrupted);
    }
    let failed = rejected
        + tasks
            .iter()
            .filter(|t| t.status() != Status::Completed)
            .count();
    if failed > 0 {
        return Err(CliError::Incomplete {
            failed,
            total: args.urls.len(),
        });
    }
    Ok(())
}

/// True once no download is running or waiting for a slot.
fn all_settled(tasks: &[Arc<DownloadTask>]) -> bool {
    tasks
        .iter()
        .all(|t| matches!(t.status(), Status::Completed | Status::Error(_)))
}

fn print_json(snapshots: &[DownloadSnapshot]) -> Result<(), CliError> {
    let json =
        serde_json::to_string_pretty(snapshots).map_err(|e| CliError::Output(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

fn print_summary(tasks: &[Arc<DownloadTask>]) {
    for task in tasks {
        let status = task.status();
        let label = match &status {
            Status::Completed => "done".to_string(),
            Status::Error(_) => "failed".to_string(),
            other => other.to_string(),
        };
        let size = match task.total() {
            Some(total) => format!(
                "{}/{}",
                format_size(task.downloaded()),
                format_size(total)
            ),
            None => format_size(task.downloaded()),
        };
        println!(
            "{:<9} {:>22}  {}",
            label,
            size,
            task.destination().display()
        );
        if let Some(message) = status.error_message() {
            println!("          {}", message);
        }
    }
}

// ============================================================================
// Progress display
// ============================================================================

/// One progress bar per download, driven by coordinator events.
struct ProgressDisplay {
    multi: MultiProgress,
    bars: Mutex<HashMap<DownloadId, ProgressBar>>,
}

impl ProgressDisplay {
    fn new(hidden: bool) -> Arc<Self> {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Arc::new(Self {
            multi,
            bars: Mutex::new(HashMap::new()),
        })
    }

    fn println(&self, line: String) {
        if self.multi.is_hidden() {
            eprintln!("{}", line);
        } else {
            let _ = self.multi.println(line);
        }
    }

    fn clear(&self) {
        let _ = self.multi.clear();
    }

    fn bar_style(known_total: bool) -> ProgressStyle {
        let template = if known_total {
            BAR_TEMPLATE
        } else {
            SPINNER_TEMPLATE
        };
        ProgressStyle::with_template(template)
            .map(|style| style.progress_chars("=> "))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

fn label(task: &DownloadTask) -> String {
    task.destination()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| task.id().to_string())
}

impl DownloadObserver for ProgressDisplay {
    fn on_event(&self, event: &DownloadEvent<'_>) {
        let task = event.task();
        let mut bars = self.bars.lock();
        let bar = bars.entry(task.id()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(0));
            bar.set_style(Self::bar_style(false));
            bar.set_message(label(task));
            bar
        });

        match event {
            DownloadEvent::Progress { .. } => {
                if let Some(total) = task.total() {
                    if bar.length() != Some(total) {
                        bar.set_style(Self::bar_style(true));
                        bar.set_length(total);
                    }
                }
                bar.set_position(task.downloaded());
            }
            DownloadEvent::StatusChanged { status, .. } => match status {
                Status::Completed => bar.finish_with_message(format!("{} done", label(task))),
                Status::Error(message) => {
                    bar.abandon_with_message(format!("{} failed: {}", label(task), message))
                }
                other => bar.set_message(format!("{} [{}]", label(task), other)),
            },
        }
    }
}
