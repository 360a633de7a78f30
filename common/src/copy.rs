use async_recursion::async_recursion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::progress::{Event, NameEvent};
use crate::task::{SourceKind, TransferTask};

/// Error type for copy operations. The first failure aborts the whole transfer.
///
/// # Logging Convention
/// Variants wrapping an I/O error expose it as `source()`, log with `{:#}` through
/// `anyhow` to see the full chain:
/// ```ignore
/// tracing::error!("copy failed: {:#}", anyhow::Error::from(error));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot read source {path:?}")]
    SourceUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot create destination {path:?}")]
    DestinationUnwritable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("destination {path:?} already exists")]
    DestinationExists { path: std::path::PathBuf },
    #[error("source {path:?} is not a directory")]
    NotADirectory { path: std::path::PathBuf },
    #[error("failed copying {src:?} to {dst:?}")]
    CopyIo {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source {path:?} has no file name")]
    InvalidSource { path: std::path::PathBuf },
    #[error("source {path:?} is neither a regular file nor a directory")]
    UnsupportedSource { path: std::path::PathBuf },
    #[error("cannot copy directory {src:?} into itself at {dst:?}")]
    DestinationInsideSource {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },
    #[error("source {src:?} and destination {dst:?} are the same file")]
    DestinationIsSource {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },
    #[error("chunk size of {chunk_size} bytes is outside 1..={max}", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize { chunk_size: u64 },
    #[error("progress monitor stopped receiving events")]
    MonitorClosed,
}

/// Upper bound on the copy buffer, allocated once per file.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    pub chunk_size: u64,
    pub progress_freq: u64,
    pub fsync: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            progress_freq: 1000,
            fsync: true,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub directories_created: usize,
    pub symlinks_skipped: usize,
    pub special_files_skipped: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            directories_created: self.directories_created + other.directories_created,
            symlinks_skipped: self.symlinks_skipped + other.symlinks_skipped,
            special_files_skipped: self.special_files_skipped + other.special_files_skipped,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            directories created: {}\n\
            symlinks skipped: {}\n\
            special files skipped: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.directories_created,
            self.symlinks_skipped,
            self.special_files_skipped,
        )
    }
}

/// Sending side of the progress and name channels.
#[derive(Debug, Clone)]
pub struct Reporter {
    progress: tokio::sync::mpsc::Sender<Event>,
    names: Option<tokio::sync::mpsc::Sender<NameEvent>>,
}

impl Reporter {
    pub fn new(
        progress: tokio::sync::mpsc::Sender<Event>,
        names: Option<tokio::sync::mpsc::Sender<NameEvent>>,
    ) -> Self {
        Self { progress, names }
    }

    async fn send(&self, event: Event) -> Result<(), Error> {
        self.progress
            .send(event)
            .await
            .map_err(|_| Error::MonitorClosed)
    }

    async fn send_name(&self, name: NameEvent) -> Result<(), Error> {
        if let Some(names) = &self.names {
            names.send(name).await.map_err(|_| Error::MonitorClosed)?;
        }
        Ok(())
    }
}

/// Read until `buf` is full or the reader is exhausted, then write what was read.
async fn copy_chunk(
    reader: &mut tokio::fs::File,
    writer: &mut tokio::fs::File,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    writer.write_all(&buf[..filled]).await?;
    Ok(filled)
}

/// Copy the contents of `src` into `dst` (created or truncated).
///
/// Emits `ChunkCopied` every `progress_freq` chunks, a final `ChunkCopied` for whatever
/// is left over, and `FileComplete`. Never emits a zero-byte `ChunkCopied`. The
/// `SizeAnnouncement` is the caller's responsibility.
#[instrument(skip(reporter))]
pub async fn copy_file(
    reporter: &Reporter,
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &Settings,
) -> Result<u64, Error> {
    let invalid_chunk_size = || Error::InvalidChunkSize {
        chunk_size: settings.chunk_size,
    };
    if !(1..=MAX_CHUNK_SIZE).contains(&settings.chunk_size) {
        return Err(invalid_chunk_size());
    }
    let buf_len = usize::try_from(settings.chunk_size).map_err(|_| invalid_chunk_size())?;
    tracing::debug!("opening 'src' for reading and 'dst' for writing");
    let mut reader =
        tokio::fs::File::open(src)
            .await
            .map_err(|source| Error::SourceUnreadable {
                path: src.to_owned(),
                source,
            })?;
    let mut writer =
        tokio::fs::File::create(dst)
            .await
            .map_err(|source| Error::DestinationUnwritable {
                path: dst.to_owned(),
                source,
            })?;
    let io_error = |source| Error::CopyIo {
        src: src.to_owned(),
        dst: dst.to_owned(),
        source,
    };
    let mut buf = vec![0u8; buf_len];
    let mut total = 0u64;
    let mut pending = 0u64;
    let mut chunks = 0u64;
    loop {
        let copied = copy_chunk(&mut reader, &mut writer, &mut buf)
            .await
            .map_err(io_error)? as u64;
        total += copied;
        pending += copied;
        if copied < buf.len() as u64 {
            break;
        }
        chunks += 1;
        if chunks >= settings.progress_freq {
            reporter.send(Event::ChunkCopied(pending)).await?;
            pending = 0;
            chunks = 0;
        }
    }
    if pending > 0 {
        reporter.send(Event::ChunkCopied(pending)).await?;
    }
    writer.flush().await.map_err(io_error)?;
    if settings.fsync {
        tracing::debug!("syncing 'dst'");
        writer.sync_all().await.map_err(io_error)?;
    }
    reporter.send(Event::FileComplete).await?;
    tracing::debug!("copied {} bytes", total);
    Ok(total)
}

/// Recursively copy the directory `src` to `dst`, which must not exist yet.
///
/// Regular files are announced on the name channel and copied with [`copy_file`],
/// subdirectories are recursed into, symlinks and special files are skipped. The
/// source directory's permissions are applied to `dst` once its contents are in place.
#[instrument(skip(reporter))]
#[async_recursion]
pub async fn copy_dir(
    reporter: &Reporter,
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &Settings,
) -> Result<Summary, Error> {
    let src_metadata =
        tokio::fs::metadata(src)
            .await
            .map_err(|source| Error::SourceUnreadable {
                path: src.to_owned(),
                source,
            })?;
    if !src_metadata.is_dir() {
        return Err(Error::NotADirectory {
            path: src.to_owned(),
        });
    }
    if tokio::fs::symlink_metadata(dst).await.is_ok() {
        return Err(Error::DestinationExists {
            path: dst.to_owned(),
        });
    }
    tracing::debug!("reading contents of 'src' directory");
    let src_unreadable = |source| Error::SourceUnreadable {
        path: src.to_owned(),
        source,
    };
    let mut entries = vec![];
    let mut read_dir = tokio::fs::read_dir(src).await.map_err(src_unreadable)?;
    while let Some(entry) = read_dir.next_entry().await.map_err(src_unreadable)? {
        entries.push(entry);
    }
    // listing order is not stable across filesystems, sort for a predictable display
    entries.sort_by_key(|entry| entry.file_name());
    tokio::fs::create_dir(dst).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            Error::DestinationExists {
                path: dst.to_owned(),
            }
        } else {
            Error::DestinationUnwritable {
                path: dst.to_owned(),
                source,
            }
        }
    })?;
    let mut summary = Summary {
        directories_created: 1,
        ..Default::default()
    };
    for entry in entries {
        let entry_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .await
            .map_err(|source| Error::SourceUnreadable {
                path: entry_path.clone(),
                source,
            })?;
        if file_type.is_symlink() {
            tracing::debug!("skipping symlink {:?}", &entry_path);
            summary.symlinks_skipped += 1;
        } else if file_type.is_dir() {
            summary = summary + copy_dir(reporter, &entry_path, &dst_path, settings).await?;
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .await
                .map_err(|source| Error::SourceUnreadable {
                    path: entry_path.clone(),
                    source,
                })?
                .len();
            reporter
                .send_name(NameEvent::File(entry_path.clone()))
                .await?;
            reporter.send(Event::SizeAnnouncement(size)).await?;
            summary.bytes_copied += copy_file(reporter, &entry_path, &dst_path, settings).await?;
            summary.files_copied += 1;
        } else {
            tracing::warn!("skipping unsupported file type at {:?}", &entry_path);
            summary.special_files_skipped += 1;
        }
    }
    tracing::debug!("setting permissions on 'dst'");
    tokio::fs::set_permissions(dst, src_metadata.permissions())
        .await
        .map_err(|source| Error::DestinationUnwritable {
            path: dst.to_owned(),
            source,
        })?;
    Ok(summary)
}

async fn ensure_not_nested(src: &std::path::Path, dst: &std::path::Path) -> Result<(), Error> {
    let src_canonical =
        tokio::fs::canonicalize(src)
            .await
            .map_err(|source| Error::SourceUnreadable {
                path: src.to_owned(),
                source,
            })?;
    let (Some(name), Some(parent)) = (dst.file_name(), dst.parent()) else {
        return Ok(());
    };
    let parent = if parent.as_os_str().is_empty() {
        std::path::Path::new(".")
    } else {
        parent
    };
    let nested = match tokio::fs::canonicalize(parent).await {
        Ok(parent_canonical) => parent_canonical.join(name).starts_with(&src_canonical),
        // a missing parent makes create_dir fail later with a better error
        Err(_) => false,
    };
    if nested {
        return Err(Error::DestinationInsideSource {
            src: src.to_owned(),
            dst: dst.to_owned(),
        });
    }
    Ok(())
}

/// Fail if `dst` already exists and is `src` itself (same path, a symlink or a hard link to it).
async fn ensure_distinct(src: &std::path::Path, dst: &std::path::Path) -> Result<(), Error> {
    use std::os::unix::fs::MetadataExt;
    let src_metadata =
        tokio::fs::metadata(src)
            .await
            .map_err(|source| Error::SourceUnreadable {
                path: src.to_owned(),
                source,
            })?;
    let Ok(dst_metadata) = tokio::fs::metadata(dst).await else {
        return Ok(());
    };
    if src_metadata.dev() == dst_metadata.dev() && src_metadata.ino() == dst_metadata.ino() {
        return Err(Error::DestinationIsSource {
            src: src.to_owned(),
            dst: dst.to_owned(),
        });
    }
    Ok(())
}

/// Drive a whole transfer: copy `task` and frame the stream with the name
/// sentinel and `StreamComplete`, which is sent exactly once and only on success.
#[instrument(skip(reporter))]
pub async fn run_transfer(
    task: TransferTask,
    kind: SourceKind,
    settings: Settings,
    reporter: Reporter,
) -> Result<Summary, Error> {
    let summary = match kind {
        SourceKind::File { size } => {
            // opening dst truncates it, which would destroy the source
            ensure_distinct(task.src(), task.dst()).await?;
            reporter.send(Event::SizeAnnouncement(size)).await?;
            let bytes_copied = copy_file(&reporter, task.src(), task.dst(), &settings).await?;
            Summary {
                bytes_copied,
                files_copied: 1,
                ..Default::default()
            }
        }
        SourceKind::Directory => {
            ensure_not_nested(task.src(), task.dst()).await?;
            copy_dir(&reporter, task.src(), task.dst(), &settings).await?
        }
    };
    reporter.send_name(NameEvent::End).await?;
    reporter.send(Event::StreamComplete).await?;
    tracing::info!("transfer complete\n{}", &summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use std::os::unix::fs::PermissionsExt;
    use tracing_test::traced_test;

    /// Runs the future built by `f` on its own task and records everything it sends.
    async fn collect_events<F, T>(
        with_names: bool,
        f: impl FnOnce(Reporter) -> F,
    ) -> (T, Vec<Event>, Vec<NameEvent>)
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let (names_tx, names_rx) = if with_names {
            let (names_tx, names_rx) = tokio::sync::mpsc::channel(1);
            (Some(names_tx), Some(names_rx))
        } else {
            (None, None)
        };
        let handle = tokio::spawn(f(Reporter::new(tx, names_tx)));
        let names_handle = tokio::spawn(async move {
            let mut names = vec![];
            if let Some(mut names_rx) = names_rx {
                while let Some(name) = names_rx.recv().await {
                    names.push(name);
                }
            }
            names
        });
        let mut events = vec![];
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let result = handle.await.unwrap();
        let names = names_handle.await.unwrap();
        (result, events, names)
    }

    fn chunk_sum(events: &[Event]) -> u64 {
        events
            .iter()
            .map(|event| match event {
                Event::ChunkCopied(bytes) => *bytes,
                _ => 0,
            })
            .sum()
    }

    async fn copy_sized_file(
        size: usize,
        chunk_size: u64,
        progress_freq: u64,
    ) -> Result<(u64, Vec<Event>), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        let dst = tmp_dir.join("dst.bin");
        testutils::write_file_of_size(&src, size).await?;
        let settings = Settings {
            chunk_size,
            progress_freq,
            fsync: false,
        };
        let (result, events, _) = {
            let (src, dst) = (src.clone(), dst.clone());
            collect_events(false, move |reporter| async move {
                copy_file(&reporter, &src, &dst, &settings).await
            })
            .await
        };
        let copied = result?;
        assert_eq!(tokio::fs::read(&src).await?, tokio::fs::read(&dst).await?);
        Ok((copied, events))
    }

    #[tokio::test]
    #[traced_test]
    async fn chunk_events_sum_to_file_size() -> Result<(), anyhow::Error> {
        let chunk_size = 16u64;
        // empty, shorter than a chunk, exact multiple, with remainder
        for size in [0usize, 5, 16 * 8, 16 * 8 + 3] {
            let (copied, events) = copy_sized_file(size, chunk_size, 2).await?;
            assert_eq!(copied, size as u64);
            assert_eq!(chunk_sum(&events), size as u64, "size {size}");
            assert_eq!(events.last(), Some(&Event::FileComplete));
            assert_eq!(
                events
                    .iter()
                    .filter(|event| **event == Event::FileComplete)
                    .count(),
                1
            );
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn engine_never_emits_zero_byte_chunks() -> Result<(), anyhow::Error> {
        for (size, progress_freq) in [(0usize, 1u64), (64, 1), (64, 4), (65, 4), (100, 3)] {
            let (_, events) = copy_sized_file(size, 16, progress_freq).await?;
            assert!(
                !events.contains(&Event::ChunkCopied(0)),
                "size {size} freq {progress_freq}: {events:?}"
            );
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn progress_is_reported_every_progress_freq_chunks() -> Result<(), anyhow::Error> {
        // 10 full chunks and a 3 byte tail
        let (_, events) = copy_sized_file(16 * 10 + 3, 16, 4).await?;
        assert_eq!(
            events,
            vec![
                Event::ChunkCopied(64),
                Event::ChunkCopied(64),
                Event::ChunkCopied(35),
                Event::FileComplete,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_file_emits_only_completion() -> Result<(), anyhow::Error> {
        let (copied, events) = copy_sized_file(0, 4096, 1000).await?;
        assert_eq!(copied, 0);
        assert_eq!(events, vec![Event::FileComplete]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn copy_file_truncates_existing_destination() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        let dst = tmp_dir.join("dst.bin");
        testutils::write_file_of_size(&src, 100).await?;
        testutils::write_file_of_size(&dst, 1000).await?;
        let (result, _, _) = {
            let (src, dst) = (src.clone(), dst.clone());
            collect_events(false, move |reporter| async move {
                copy_file(&reporter, &src, &dst, &Settings::default()).await
            })
            .await
        };
        assert_eq!(result?, 100);
        assert_eq!(tokio::fs::metadata(&dst).await?.len(), 100);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_source_is_unreadable() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let dst = tmp_dir.join("dst.bin");
        let (result, events, _) = {
            let (src, dst) = (tmp_dir.join("does_not_exist"), dst.clone());
            collect_events(false, move |reporter| async move {
                copy_file(&reporter, &src, &dst, &Settings::default()).await
            })
            .await
        };
        let error = result.unwrap_err();
        assert!(matches!(error, Error::SourceUnreadable { .. }), "{error:?}");
        let message = format!("{:#}", anyhow::Error::from(error));
        assert!(
            message.to_lowercase().contains("no such file"),
            "error must include the root cause: {message}"
        );
        assert!(events.is_empty());
        assert!(!dst.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unwritable_destination_is_reported() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        testutils::write_file_of_size(&src, 10).await?;
        let (result, _, _) = {
            let (src, dst) = (src.clone(), tmp_dir.join("missing").join("dst.bin"));
            collect_events(false, move |reporter| async move {
                copy_file(&reporter, &src, &dst, &Settings::default()).await
            })
            .await
        };
        assert!(matches!(
            result,
            Err(Error::DestinationUnwritable { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn closed_monitor_stops_the_copy() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        testutils::write_file_of_size(&src, 100).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let reporter = Reporter::new(tx, None);
        let result = copy_file(&reporter, &src, &tmp_dir.join("dst.bin"), &Settings::default()).await;
        assert!(matches!(result, Err(Error::MonitorClosed)));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_copy_skips_symlinks() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("foo");
        let dst = tmp_dir.join("bar");
        let (result, events, names) = {
            let (src, dst) = (src.clone(), dst.clone());
            collect_events(true, move |reporter| async move {
                let task = TransferTask::resolve(&src, &dst).await?;
                let kind = task.kind().await?;
                run_transfer(task, kind, Settings::default(), reporter).await
            })
            .await
        };
        let summary = result?;
        assert_eq!(summary.files_copied, 6);
        assert_eq!(summary.symlinks_skipped, 2);
        // foo, bar, baz, baz/qux and the empty directory
        assert_eq!(summary.directories_created, 5);
        testutils::check_dirs_identical(&src, &dst).await?;
        // one name per file plus the sentinel
        assert_eq!(names.len(), 7);
        assert_eq!(names.last(), Some(&NameEvent::End));
        assert_eq!(events.last(), Some(&Event::StreamComplete));
        assert_eq!(
            events
                .iter()
                .filter(|event| **event == Event::StreamComplete)
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, Event::SizeAnnouncement(_)))
                .count(),
            6
        );
        assert_eq!(chunk_sum(&events), summary.bytes_copied);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn every_size_announcement_is_followed_by_file_complete() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let (result, events, _) = {
            let (src, dst) = (tmp_dir.join("foo"), tmp_dir.join("bar"));
            collect_events(true, move |reporter| async move {
                let task = TransferTask::resolve(&src, &dst).await?;
                let kind = task.kind().await?;
                run_transfer(task, kind, Settings::default(), reporter).await
            })
            .await
        };
        result?;
        let mut open_file = false;
        for event in &events {
            match event {
                Event::SizeAnnouncement(_) => {
                    assert!(!open_file);
                    open_file = true;
                }
                Event::ChunkCopied(bytes) => {
                    assert!(open_file);
                    assert!(*bytes > 0);
                }
                Event::FileComplete => {
                    assert!(open_file);
                    open_file = false;
                }
                Event::StreamComplete => assert!(!open_file),
            }
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_copy_refuses_existing_destination() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("foo");
        let dst = tmp_dir.join("existing");
        tokio::fs::create_dir(&dst).await?;
        let (result, events, names) = {
            let (src, dst) = (src.clone(), dst.clone());
            collect_events(true, move |reporter| async move {
                copy_dir(&reporter, &src, &dst, &Settings::default()).await
            })
            .await
        };
        assert!(matches!(result, Err(Error::DestinationExists { .. })));
        assert!(events.is_empty());
        assert!(names.is_empty());
        // nothing was written into the existing directory
        let mut entries = tokio::fs::read_dir(&dst).await?;
        assert!(entries.next_entry().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_copy_requires_directory() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let (result, _, _) = {
            let (src, dst) = (tmp_dir.join("foo").join("0.txt"), tmp_dir.join("bar"));
            collect_events(true, move |reporter| async move {
                copy_dir(&reporter, &src, &dst, &Settings::default()).await
            })
            .await
        };
        assert!(matches!(result, Err(Error::NotADirectory { .. })));
        assert!(!tmp_dir.join("bar").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_copy_preserves_mode() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("foo");
        let read_only = src.join("baz");
        tokio::fs::set_permissions(&read_only, std::fs::Permissions::from_mode(0o555)).await?;
        let (result, _, _) = {
            let (src, dst) = (src.clone(), tmp_dir.join("bar"));
            collect_events(true, move |reporter| async move {
                copy_dir(&reporter, &src, &dst, &Settings::default()).await
            })
            .await
        };
        result?;
        let mode = tokio::fs::metadata(tmp_dir.join("bar").join("baz"))
            .await?
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o555);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_mid_tree_aborts_directory_copy() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dst = tmp_dir.join("copy");
        let task = TransferTask::resolve(&tmp_dir.join("foo"), &dst).await?;
        let kind = task.kind().await?;
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let (names_tx, mut names_rx) = tokio::sync::mpsc::channel(1);
        let handle = tokio::spawn(run_transfer(
            task,
            kind,
            Settings {
                fsync: false,
                ..Default::default()
            },
            Reporter::new(tx, Some(names_tx)),
        ));
        // the engine stays at most one event ahead, take the first file and hang up
        assert_eq!(
            names_rx.recv().await,
            Some(NameEvent::File(tmp_dir.join("foo").join("0.txt")))
        );
        let mut events = vec![];
        while let Some(event) = rx.recv().await {
            events.push(event);
            if event == Event::FileComplete {
                break;
            }
        }
        drop(rx);
        drop(names_rx);
        let error = handle.await?.unwrap_err();
        assert!(matches!(error, Error::MonitorClosed), "{error:?}");
        assert_eq!(
            events,
            vec![
                Event::SizeAnnouncement(1),
                Event::ChunkCopied(1),
                Event::FileComplete
            ]
        );
        // earlier files stay behind, no rollback, nothing past the failure is copied
        assert_eq!(tokio::fs::read_to_string(dst.join("0.txt")).await?, "0");
        assert!(!dst.join("bar").join("2.txt").exists());
        assert!(!dst.join("baz").exists());
        assert!(!dst.join("empty").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn file_cannot_be_copied_onto_itself() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("a.bin");
        testutils::write_file_of_size(&src, 5000).await?;
        let hard_link = tmp_dir.join("b.bin");
        tokio::fs::hard_link(&src, &hard_link).await?;
        let symlink = tmp_dir.join("c.bin");
        tokio::fs::symlink(&src, &symlink).await?;
        // the directory holding the source resolves to the source path itself
        for dst in [tmp_dir.clone(), src.clone(), hard_link, symlink] {
            let (result, events, _) = {
                let (src, dst) = (src.clone(), dst.clone());
                collect_events(false, move |reporter| async move {
                    let task = TransferTask::resolve(&src, &dst).await?;
                    let kind = task.kind().await?;
                    run_transfer(task, kind, Settings::default(), reporter).await
                })
                .await
            };
            assert!(
                matches!(result, Err(Error::DestinationIsSource { .. })),
                "{dst:?}: {result:?}"
            );
            assert!(events.is_empty());
            assert_eq!(tokio::fs::metadata(&src).await?.len(), 5000);
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn out_of_range_chunk_size_leaves_destination_alone() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        let dst = tmp_dir.join("dst.bin");
        testutils::write_file_of_size(&src, 10).await?;
        for chunk_size in [0, MAX_CHUNK_SIZE + 1, 1 << 40] {
            let settings = Settings {
                chunk_size,
                progress_freq: 1,
                fsync: false,
            };
            let (result, events, _) = {
                let (src, dst) = (src.clone(), dst.clone());
                collect_events(false, move |reporter| async move {
                    copy_file(&reporter, &src, &dst, &settings).await
                })
                .await
            };
            assert!(
                matches!(
                    result,
                    Err(Error::InvalidChunkSize { chunk_size: size }) if size == chunk_size
                ),
                "{result:?}"
            );
            assert!(events.is_empty());
            assert!(!dst.exists());
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_cannot_be_copied_into_itself() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("foo");
        let (result, _, _) = {
            let (src, dst) = (src.clone(), src.join("bar").join("copy"));
            collect_events(true, move |reporter| async move {
                run_transfer(
                    TransferTask::new(src, dst),
                    SourceKind::Directory,
                    Settings::default(),
                    reporter,
                )
                .await
            })
            .await
        };
        assert!(matches!(
            result,
            Err(Error::DestinationInsideSource { .. })
        ));
        assert!(!src.join("bar").join("copy").exists());
        Ok(())
    }
}
