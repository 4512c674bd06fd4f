use super::error::StorageError;
use super::file::{map_range, FileEntry};
use crate::metainfo::Metainfo;
use bytes::Bytes;
use std::future::Future;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

/// Why a [`FileProvider`] could not hand out file handles.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("file is locked: {0}")]
    Lock(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// What the engine asks a [`FileProvider`] to open.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub metainfo: Arc<Metainfo>,
    pub destination: PathBuf,
}

/// Supplies already-open handles for every file of a torrent.
///
/// The engine never creates directories or picks paths; that policy lives
/// with whoever implements this trait. Handles are returned in the order of
/// `metainfo.info.files`.
pub trait FileProvider: Send + Sync {
    fn open(
        &self,
        request: &OpenRequest,
    ) -> impl Future<Output = Result<Vec<File>, ProviderError>> + Send;
}

/// Opens (creating if absent) each file under `destination`, which must
/// already contain every directory the torrent needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExistingDirProvider;

impl FileProvider for ExistingDirProvider {
    async fn open(&self, request: &OpenRequest) -> Result<Vec<File>, ProviderError> {
        let mut handles = Vec::with_capacity(request.metainfo.info.files.len());

        for file in &request.metainfo.info.files {
            validate_file_path(&file.path)?;
            let path = request.destination.join(&file.path);

            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| classify_open_error(&path, e))?;

            handles.push(handle);
        }

        Ok(handles)
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), ProviderError> {
    let escapes = file_path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(ProviderError::InvalidRequest(format!(
            "path escapes destination: {}",
            file_path.display()
        )));
    }
    Ok(())
}

fn classify_open_error(path: &Path, err: std::io::Error) -> ProviderError {
    let what = format!("{}: {}", path.display(), err);
    match err.kind() {
        ErrorKind::PermissionDenied => ProviderError::Permission(what),
        ErrorKind::WouldBlock => ProviderError::Lock(what),
        _ => ProviderError::InvalidRequest(what),
    }
}

/// The open backing files of one torrent.
#[derive(Debug)]
pub struct FileSet {
    entries: Vec<FileEntry>,
    handles: Vec<File>,
}

impl FileSet {
    /// Pairs file layout with handles returned by a [`FileProvider`].
    pub fn new(entries: Vec<FileEntry>, handles: Vec<File>) -> Result<Self, StorageError> {
        if entries.len() != handles.len() {
            return Err(StorageError::HandleCount {
                expected: entries.len(),
                got: handles.len(),
            });
        }
        Ok(Self { entries, handles })
    }

    /// Asks `provider` for the files of `metainfo` under `destination`.
    pub async fn open<P: FileProvider>(
        provider: &P,
        metainfo: Arc<Metainfo>,
        destination: PathBuf,
    ) -> Result<Self, StorageError> {
        let entries = FileEntry::from_metainfo(&metainfo);
        let request = OpenRequest {
            metainfo,
            destination,
        };
        let handles = provider.open(&request).await?;
        Self::new(entries, handles)
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn total_length(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }

    /// Reads `len` bytes at absolute content `offset`.
    ///
    /// A file shorter than its declared length yields an
    /// [`ErrorKind::UnexpectedEof`] I/O error.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes, StorageError> {
        let segments = map_range(&self.entries, offset, len as u64);
        let mut data = Vec::with_capacity(len);

        for segment in segments {
            let file = &mut self.handles[segment.file_index];
            file.seek(SeekFrom::Start(segment.file_offset)).await?;

            let start = data.len();
            data.resize(start + segment.length as usize, 0);
            file.read_exact(&mut data[start..]).await?;
        }

        if data.len() != len {
            return Err(StorageError::OutOfRange { offset, len });
        }
        Ok(Bytes::from(data))
    }

    /// Writes `data` at absolute content `offset`, spreading it across
    /// files as needed.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let segments = map_range(&self.entries, offset, data.len() as u64);
        let covered: u64 = segments.iter().map(|s| s.length).sum();
        if covered != data.len() as u64 {
            return Err(StorageError::OutOfRange {
                offset,
                len: data.len(),
            });
        }

        let mut written = 0usize;
        for segment in segments {
            let chunk = &data[written..written + segment.length as usize];
            let file = &mut self.handles[segment.file_index];
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.write_all(chunk).await?;
            written += chunk.len();
        }

        trace!(offset, len = data.len(), "wrote range");
        Ok(())
    }

    /// Flushes buffered writes of every handle to disk.
    pub async fn sync(&mut self) -> Result<(), StorageError> {
        for file in &mut self.handles {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}
