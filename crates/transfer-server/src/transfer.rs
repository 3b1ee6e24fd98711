//! Streaming engine: moves bytes between HTTP bodies and the shared folder.

use std::collections::HashSet;
use std::fmt::Display;
use std::io;
use std::sync::Arc;

use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use axum::body::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, DuplexStream};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::events::{ChangeNotifier, FolderChange};
use crate::storage::{FileEntry, FileHandle, ReadStream, SharedFolder, StorageError};

/// Default copy chunk between network and storage streams.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// ZIP bytes as they are produced. Ends with an error if the archive was cut short.
pub type ArchiveStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("failed to build archive: {0}")]
    Archive(String),
    #[error("shared folder is empty")]
    Empty,
}

/// Strip surrounding whitespace and refuse anything that is not a flat file name.
pub fn sanitize_file_name(raw: &str) -> Result<String, TransferError> {
    let name = raw.trim();
    if name.is_empty()
        || name.starts_with("..")
        || name.contains(['/', '\\', '\0'])
        || name == "."
    {
        return Err(TransferError::InvalidName(raw.to_owned()));
    }
    Ok(name.to_owned())
}

/// Split at the last dot. A name whose only dot is the leading one has no extension.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx + 1..]),
        _ => (name, ""),
    }
}

fn join_name(base: &str, ext: &str) -> String {
    if ext.is_empty() {
        base.to_owned()
    } else {
        format!("{base}.{ext}")
    }
}

/// Candidate names in the order they are tried: `base.ext`, `base_2.ext`, `base_3.ext`, ...
/// With `always_suffix` the bare name is skipped and numbering starts at 1.
pub fn candidates<'a>(
    base: &'a str,
    ext: &'a str,
    always_suffix: bool,
) -> impl Iterator<Item = String> + 'a {
    let plain = (!always_suffix).then(|| join_name(base, ext));
    let first = if always_suffix { 1u64 } else { 2 };
    plain
        .into_iter()
        .chain((first..).map(move |n| join_name(&format!("{base}_{n}"), ext)))
}

/// First candidate for which `exists` is false.
pub fn unique_name(
    base: &str,
    ext: &str,
    always_suffix: bool,
    exists: impl Fn(&str) -> bool,
) -> String {
    candidates(base, ext, always_suffix)
        .find(|candidate| !exists(candidate))
        .unwrap_or_else(|| join_name(base, ext))
}

/// Human-readable size, e.g. `1.5 MB`.
pub fn format_file_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size == 0 {
        return "0 B".to_owned();
    }
    let group = ((size as f64).log10() / 1024f64.log10()) as usize;
    let group = group.min(UNITS.len() - 1);
    let value = size as f64 / 1024f64.powi(group as i32);
    format!("{value:.1} {}", UNITS[group])
}

#[derive(Clone)]
pub struct FileTransfer {
    folder: Arc<dyn SharedFolder>,
    notifier: ChangeNotifier,
    chunk_size: usize,
}

impl FileTransfer {
    pub fn new(folder: Arc<dyn SharedFolder>, notifier: ChangeNotifier, chunk_size: usize) -> Self {
        Self {
            folder,
            notifier,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn folder(&self) -> &Arc<dyn SharedFolder> {
        &self.folder
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn list(&self) -> Result<Vec<FileEntry>, TransferError> {
        Ok(self.folder.list().await?)
    }

    /// Store `body` under a collision-free variant of `raw_name` and return the stored name.
    pub async fn upload<S, E>(&self, raw_name: &str, body: S) -> Result<String, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let name = sanitize_file_name(raw_name)?;
        let (base, ext) = split_name(&name);
        let handle = self.create_unique(base, ext, false).await?;
        self.fill(handle, body).await
    }

    /// Replace the file named exactly `raw_name`, or create it.
    pub async fn replace<S, E>(&self, raw_name: &str, body: S) -> Result<String, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let name = sanitize_file_name(raw_name)?;
        if self.folder.delete(&name).await? {
            debug!(name = %name, "removed existing file before replace");
            self.notifier.notify(FolderChange::Deleted { name: name.clone() });
        }
        let (base, ext) = split_name(&name);
        let handle = self.create_unique(base, ext, false).await?;
        self.fill(handle, body).await
    }

    /// Write `content` to a new `base_N.txt` file.
    pub async fn create_text_file(&self, base: &str, content: &str) -> Result<String, TransferError> {
        let base = sanitize_file_name(base)?;
        let handle = self.create_unique(&base, "txt", true).await?;
        let body = futures::stream::iter([Ok::<_, std::convert::Infallible>(Bytes::copy_from_slice(
            content.as_bytes(),
        ))]);
        self.fill(handle, body).await
    }

    pub async fn open_download(&self, name: &str) -> Result<(FileEntry, ReadStream), TransferError> {
        let entry = self
            .folder
            .find(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(name.to_owned()))?;
        let reader = match self.folder.open_read(&entry.handle()).await {
            Ok(reader) => reader,
            Err(e @ StorageError::Access(_)) => return Err(e.into()),
            Err(e) => {
                warn!(name = %name, error = %e, "listed file is not readable");
                return Err(StorageError::NotFound(name.to_owned()).into());
            }
        };
        Ok((entry, reader))
    }

    pub async fn delete(&self, name: &str) -> Result<(), TransferError> {
        if !self.folder.delete(name).await? {
            return Err(StorageError::NotFound(name.to_owned()).into());
        }
        info!(name = %name, "audit: file.delete");
        self.notifier.notify(FolderChange::Deleted {
            name: name.to_owned(),
        });
        Ok(())
    }

    /// Stream a ZIP of every listed file. The archive is produced by a background
    /// task as the returned stream is consumed.
    pub async fn archive(&self) -> Result<ArchiveStream, TransferError> {
        let entries = self.folder.list().await?;
        if entries.is_empty() {
            return Err(TransferError::Empty);
        }

        let (reader, writer) = tokio::io::duplex(self.chunk_size);
        let (done_tx, done_rx) = oneshot::channel();
        let folder = Arc::clone(&self.folder);
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            let count = entries.len();
            let outcome = write_archive(folder, entries, writer, chunk_size).await;
            match &outcome {
                Ok(written) => info!(files = written, listed = count, "audit: folder.zip"),
                Err(e) => warn!(error = %e, "zip stream aborted"),
            }
            let _ = done_tx.send(outcome.err());
        });

        // The writer is dropped before the outcome is sent, so the reader has
        // drained by the time the tail resolves.
        let tail = futures::stream::once(async move {
            match done_rx.await {
                Ok(None) => None,
                Ok(Some(e)) => Some(Err(io::Error::other(e))),
                Err(_) => Some(Err(io::Error::other("zip task ended without a result"))),
            }
        })
        .filter_map(futures::future::ready);

        Ok(ReaderStream::with_capacity(reader, self.chunk_size)
            .chain(tail)
            .boxed())
    }

    async fn create_unique(
        &self,
        base: &str,
        ext: &str,
        always_suffix: bool,
    ) -> Result<FileHandle, TransferError> {
        let mut taken: HashSet<String> = self
            .folder
            .list()
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect();
        loop {
            let name = unique_name(base, ext, always_suffix, |n| taken.contains(n));
            match self.folder.create(&name).await {
                Ok(handle) => return Ok(handle),
                // Lost a race with a concurrent writer; try the next candidate.
                Err(StorageError::AlreadyExists(_)) => {
                    taken.insert(name);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fill<S, E>(&self, handle: FileHandle, body: S) -> Result<String, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        match self.copy_into(&handle, body).await {
            Ok(bytes) => {
                info!(name = %handle.name(), bytes, "audit: file.upload");
                let name = handle.into_name();
                self.notifier.notify(FolderChange::Created { name: name.clone() });
                Ok(name)
            }
            Err(e) => {
                if let Err(cleanup) = self.folder.delete(handle.name()).await {
                    warn!(name = %handle.name(), error = %cleanup, "failed to remove partial upload");
                }
                Err(e)
            }
        }
    }

    async fn copy_into<S, E>(&self, handle: &FileHandle, body: S) -> Result<u64, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let raw = self.folder.open_write(handle).await?;
        let mut out = BufWriter::with_capacity(self.chunk_size, raw);
        let mut body = std::pin::pin!(body);
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| TransferError::Body(e.to_string()))?;
            out.write_all(&chunk).await.map_err(StorageError::from)?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(StorageError::from)?;
        out.shutdown().await.map_err(StorageError::from)?;
        Ok(written)
    }
}

async fn write_archive(
    folder: Arc<dyn SharedFolder>,
    entries: Vec<FileEntry>,
    sink: DuplexStream,
    chunk_size: usize,
) -> Result<usize, TransferError> {
    use futures::AsyncWriteExt as _;

    let archive_err = |e: async_zip::error::ZipError| TransferError::Archive(e.to_string());
    let mut zip = ZipFileWriter::with_tokio(sink);
    let mut buf = vec![0u8; chunk_size];
    let mut written = 0;

    for entry in entries {
        let mut reader = match folder.open_read(&entry.handle()).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(name = %entry.name, error = %e, "skipping unreadable file in zip");
                continue;
            }
        };
        let builder = ZipEntryBuilder::new(entry.name.clone().into(), Compression::Stored);
        let mut out = zip.write_entry_stream(builder).await.map_err(archive_err)?;
        loop {
            let n = reader.read(&mut buf).await.map_err(StorageError::from)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await.map_err(StorageError::from)?;
        }
        out.close().await.map_err(archive_err)?;
        written += 1;
    }

    zip.close().await.map_err(archive_err)?;
    Ok(written)
}
