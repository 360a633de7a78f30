use tracing::instrument;

use crate::copy::Error;

/// What the source of a transfer turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File { size: u64 },
    Directory,
}

/// A (source, destination) pair, resolved once before copying starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
}

impl TransferTask {
    /// Use `src` and `dst` verbatim.
    pub fn new(src: std::path::PathBuf, dst: std::path::PathBuf) -> Self {
        Self { src, dst }
    }

    /// Like `cp`: if `dst` is an existing directory, copy into it under the source's name.
    #[instrument]
    pub async fn resolve(src: &std::path::Path, dst: &std::path::Path) -> Result<Self, Error> {
        let dst_is_dir = tokio::fs::metadata(dst)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        if !dst_is_dir {
            return Ok(Self::new(src.to_owned(), dst.to_owned()));
        }
        let name = src.file_name().ok_or_else(|| Error::InvalidSource {
            path: src.to_owned(),
        })?;
        tracing::debug!("{:?} is a directory, copying into it as {:?}", dst, name);
        Ok(Self::new(src.to_owned(), dst.join(name)))
    }

    pub fn src(&self) -> &std::path::Path {
        &self.src
    }

    pub fn dst(&self) -> &std::path::Path {
        &self.dst
    }

    /// Name shown on the status line until the engine reports a file.
    pub fn display_name(&self) -> String {
        self.src
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.src.display().to_string())
    }

    /// Stat the source, following a top-level symlink.
    #[instrument]
    pub async fn kind(&self) -> Result<SourceKind, Error> {
        let metadata =
            tokio::fs::metadata(&self.src)
                .await
                .map_err(|source| Error::SourceUnreadable {
                    path: self.src.clone(),
                    source,
                })?;
        if metadata.is_file() {
            Ok(SourceKind::File {
                size: metadata.len(),
            })
        } else if metadata.is_dir() {
            Ok(SourceKind::Directory)
        } else {
            Err(Error::UnsupportedSource {
                path: self.src.clone(),
            })
        }
    }
}
