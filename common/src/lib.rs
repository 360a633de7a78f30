//! Common library for `pcp`: the copy engine and the progress monitor
//!
//! # Architecture
//!
//! A transfer is two concurrent tasks joined by channels:
//!
//! - the **copy engine** ([`copy`]) runs on a spawned task, walks the source tree and moves
//!   bytes in fixed-size chunks, sending [`progress::Event`]s (and, for directories, the name
//!   of each file as a [`progress::NameEvent`])
//! - the **progress monitor** ([`progress::Monitor`]) runs in the foreground, turns the events
//!   into a single status line with percentage, rate and time remaining, and stops on
//!   `StreamComplete`
//!
//! Both channels have capacity 1, so a slow terminal slows the copy down instead of
//! buffering events. No state is shared between the tasks other than through the channels.
//!
//! # Error handling
//!
//! The engine fails with a [`copy::Error`] on the first problem, nothing is rolled back.
//! The error travels back through the task's join handle to [`copy_with_progress`] and from
//! there to [`run`], which logs it and returns `None` so the binary can exit non-zero.
//!
//! # Logging
//!
//! [`run`] installs a `tracing` subscriber writing to stderr; the status line goes to the
//! writer handed to [`copy_with_progress`] (stdout for the `pcp` binary).

use anyhow::{Context, anyhow};

pub mod config;
pub mod copy;
pub mod progress;
pub mod task;

mod testutils;

pub use config::{OutputConfig, RuntimeConfig, TransferConfig};
pub use task::{SourceKind, TransferTask};

/// Copy `task` on a background task while rendering progress to `out`.
#[tracing::instrument(skip(out))]
pub async fn copy_with_progress<W: std::io::Write>(
    task: TransferTask,
    config: &TransferConfig,
    out: W,
) -> anyhow::Result<copy::Summary> {
    let start = std::time::Instant::now();
    let kind = task.kind().await?;
    let (progress_tx, progress_rx) = tokio::sync::mpsc::channel(1);
    let (names_tx, names_rx) = match kind {
        SourceKind::Directory => {
            let (names_tx, names_rx) = tokio::sync::mpsc::channel(1);
            (Some(names_tx), Some(names_rx))
        }
        SourceKind::File { .. } => (None, None),
    };
    let src = task.src().to_owned();
    let dst = task.dst().to_owned();
    let monitor = progress::Monitor::new(&config.monitor_settings(), task.display_name(), out)
        .with_start(start);
    let engine = tokio::spawn(copy::run_transfer(
        task,
        kind,
        config.copy_settings(),
        copy::Reporter::new(progress_tx, names_tx),
    ));
    let outcome = monitor.run(progress_rx, names_rx).await;
    let engine_result = engine
        .await
        .context("copy task did not run to completion")?;
    // a failed monitor makes the engine fail with MonitorClosed, report the cause instead
    let outcome = outcome?;
    let summary =
        engine_result.with_context(|| format!("failed copying {:?} to {:?}", &src, &dst))?;
    match outcome {
        progress::Outcome::Finished(report) => {
            tracing::debug!(
                "monitor saw {} bytes in {} files",
                report.bytes_copied,
                report.files_copied
            );
            Ok(summary)
        }
        progress::Outcome::Interrupted(_) => Err(anyhow!(
            "progress stream for {:?} ended before completion",
            &src
        )),
    }
}

fn init_tracing(output: &OutputConfig) {
    let filter = if output.quiet {
        tracing_subscriber::EnvFilter::new("off")
    } else {
        let level = match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        // RUST_LOG wins over -v
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    // a subscriber may already be installed (e.g. by tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Set up logging and the tokio runtime, then drive `func` to completion.
///
/// Returns `None` if anything failed; the error has already been logged.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start the tokio runtime: {:#}", &error);
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            tracing::info!("summary:\n{}", &summary);
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            None
        }
    }
}
