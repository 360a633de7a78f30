use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tracing::instrument;

/// A single message on the progress channel.
///
/// For every file the engine sends one `SizeAnnouncement`, any number of positive
/// `ChunkCopied` counts and one `FileComplete`. `StreamComplete` is sent exactly once,
/// after the last file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    SizeAnnouncement(u64),
    ChunkCopied(u64),
    FileComplete,
    StreamComplete,
}

/// A single message on the name channel (directory copies only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameEvent {
    /// Path of the file whose `SizeAnnouncement` comes next
    File(std::path::PathBuf),
    /// No more files will follow
    End,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Number of progress events between rate/ETA re-estimation
    pub rate_freq: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { rate_freq: 50 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    AwaitingSize,
    Copying,
    Complete,
}

/// Per-file byte accounting and the smoothed rate/ETA estimate.
///
/// Time is passed in explicitly so the estimate can be driven by an artificial schedule.
#[derive(Debug)]
pub struct RateEstimator {
    rate_freq: u64,
    state: FileState,
    total: u64,
    copied: u64,
    window_bytes: u64,
    window_events: u64,
    window_start: Instant,
    rate: Option<f64>,
    time_remaining: Option<Duration>,
}

impl RateEstimator {
    pub fn new(rate_freq: u64, now: Instant) -> Self {
        Self {
            rate_freq: rate_freq.max(1),
            state: FileState::AwaitingSize,
            total: 0,
            copied: 0,
            window_bytes: 0,
            window_events: 0,
            window_start: now,
            rate: None,
            time_remaining: None,
        }
    }

    pub fn announce(&mut self, total: u64, now: Instant) {
        self.state = FileState::Copying;
        self.total = total;
        self.copied = 0;
        self.window_bytes = 0;
        self.window_events = 0;
        self.window_start = now;
        self.rate = None;
        self.time_remaining = None;
    }

    pub fn chunk(&mut self, bytes: u64, now: Instant) {
        self.copied += bytes;
        self.window_bytes += bytes;
        self.window_events += 1;
        if self.rate.is_none() || self.window_events >= self.rate_freq {
            self.recompute(now);
        }
    }

    fn recompute(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed.is_zero() {
            // nothing measurable yet, keep accumulating into the same window
            return;
        }
        let rate = self.window_bytes as f64 / elapsed.as_secs_f64();
        self.rate = Some(rate);
        self.time_remaining = if rate > 0.0 {
            Duration::try_from_secs_f64(self.remaining_bytes() as f64 / rate).ok()
        } else {
            None
        };
        self.window_bytes = 0;
        self.window_events = 0;
        self.window_start = now;
    }

    pub fn complete(&mut self) {
        self.state = FileState::Complete;
        self.time_remaining = Some(Duration::ZERO);
        self.window_bytes = 0;
        self.window_events = 0;
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn copied(&self) -> u64 {
        self.copied
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total.saturating_sub(self.copied)
    }

    /// Bytes per second, `None` until the first measurable window.
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.time_remaining
    }

    pub fn percent(&self) -> u64 {
        if self.state == FileState::Complete {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        // file may grow while being copied
        let percent = u128::from(self.copied) * 100 / u128::from(self.total);
        percent.min(100) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub bytes_copied: u64,
    pub files_copied: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `StreamComplete` was received
    Finished(Report),
    /// The producer hung up before `StreamComplete`
    Interrupted(Report),
}

enum Flow {
    Continue,
    FileDone,
    Finished,
}

/// Foreground consumer of the progress stream; renders a single status line to `out`.
pub struct Monitor<W: Write> {
    out: W,
    estimator: RateEstimator,
    name: String,
    bytes_copied: u64,
    files_copied: u64,
    start: Instant,
    last_width: usize,
}

impl<W: Write> Monitor<W> {
    pub fn new(settings: &MonitorSettings, name: impl Into<String>, out: W) -> Self {
        let now = Instant::now();
        Self {
            out,
            estimator: RateEstimator::new(settings.rate_freq, now),
            name: name.into(),
            bytes_copied: 0,
            files_copied: 0,
            start: now,
            last_width: 0,
        }
    }

    /// Measure the total duration from `start` instead of from monitor construction.
    pub fn with_start(mut self, start: Instant) -> Self {
        self.start = start;
        self
    }

    fn report(&self) -> Report {
        Report {
            bytes_copied: self.bytes_copied,
            files_copied: self.files_copied,
            duration: self.start.elapsed(),
        }
    }

    fn handle(&mut self, event: Event, now: Instant) -> anyhow::Result<Flow> {
        match event {
            Event::SizeAnnouncement(total) => {
                self.estimator.announce(total, now);
                self.render()?;
                Ok(Flow::Continue)
            }
            Event::ChunkCopied(0) => Err(anyhow!(
                "received a zero-byte progress event while copying {:?}",
                self.name
            )),
            Event::ChunkCopied(bytes) => {
                if self.estimator.state() != FileState::Copying {
                    return Err(anyhow!(
                        "received {} bytes of progress for {:?} without a size announcement",
                        bytes,
                        self.name
                    ));
                }
                self.bytes_copied += bytes;
                self.estimator.chunk(bytes, now);
                self.render()?;
                Ok(Flow::Continue)
            }
            Event::FileComplete => {
                self.estimator.complete();
                self.files_copied += 1;
                self.render()?;
                Ok(Flow::FileDone)
            }
            Event::StreamComplete => Ok(Flow::Finished),
        }
    }

    fn render(&mut self) -> anyhow::Result<()> {
        let rate = match self.estimator.rate() {
            Some(rate) => format!("{}/s", bytesize::ByteSize(rate as u64)),
            None => "-/s".to_string(),
        };
        let remaining = match self.estimator.time_remaining() {
            Some(remaining) => {
                humantime::format_duration(Duration::from_secs(remaining.as_secs())).to_string()
            }
            None => "-".to_string(),
        };
        let line = format!(
            "{}: {} copied: {}% - {} - {} remaining",
            self.name,
            bytesize::ByteSize(self.estimator.copied()),
            self.estimator.percent(),
            rate,
            remaining,
        );
        write!(self.out, "\r{:width$}\r{}", "", line, width = self.last_width)
            .context("failed writing progress line")?;
        self.out.flush().context("failed flushing progress line")?;
        self.last_width = line.chars().count();
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<Report> {
        let report = self.report();
        let duration = Duration::from_millis(report.duration.as_millis() as u64);
        writeln!(self.out).context("failed writing progress line")?;
        writeln!(
            self.out,
            "done: {} copied in {}",
            bytesize::ByteSize(report.bytes_copied),
            humantime::format_duration(duration),
        )
        .context("failed writing completion message")?;
        self.out.flush().context("failed flushing completion message")?;
        Ok(report)
    }

    async fn next_name(&mut self, names: &mut tokio::sync::mpsc::Receiver<NameEvent>) {
        match names.recv().await {
            Some(NameEvent::File(path)) => {
                tracing::debug!("now copying {:?}", &path);
                self.name = path.display().to_string();
            }
            Some(NameEvent::End) => tracing::debug!("no more files"),
            // the engine stopped; the progress channel reports it as well
            None => tracing::debug!("name channel closed"),
        }
    }

    /// Receive events until `StreamComplete` or until the producer hangs up.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut progress: tokio::sync::mpsc::Receiver<Event>,
        mut names: Option<tokio::sync::mpsc::Receiver<NameEvent>>,
    ) -> anyhow::Result<Outcome> {
        if let Some(names) = names.as_mut() {
            self.next_name(names).await;
        }
        loop {
            let Some(event) = progress.recv().await else {
                tracing::debug!("progress channel closed before stream completion");
                return Ok(Outcome::Interrupted(self.report()));
            };
            tracing::trace!("progress event: {:?}", event);
            match self.handle(event, Instant::now())? {
                Flow::Continue => {}
                Flow::FileDone => {
                    if let Some(names) = names.as_mut() {
                        self.next_name(names).await;
                    }
                }
                Flow::Finished => return Ok(Outcome::Finished(self.finish()?)),
            }
        }
    }
}
