//! Blocking archive writers fed from the blob store.
//!
//! Archives are written on the blocking pool. Blob readers are bridged to
//! `std::io::Read` with [`SyncIoBridge`], so no entry is ever buffered whole.

use std::io::{self, BufWriter, Read, Seek, Write};
use std::sync::Arc;

use axum::body::Bytes;
use common::media::is_precompressed;
use common::storage::{BlobStore, StorageError};
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use super::filter::ExportItem;
use crate::entity::export_job::ArchiveFormat;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("export was cancelled")]
    Cancelled,
    #[error("archive write failed: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Storage(#[from] StorageError),
}

/// Cumulative progress after an entry has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveProgress {
    pub files: u64,
    pub bytes: u64,
}

/// An archive being written, one entry at a time.
pub trait ArchiveSink: Send {
    fn append(&mut self, item: &ExportItem, body: &mut dyn Read) -> io::Result<()>;

    /// Write the trailer and flush everything to the underlying writer.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Writers that need a final step after the archive trailer.
pub trait FinishWrite: Write + Send {
    fn finish_write(self) -> io::Result<()>;
}

impl<W: Write + Send> FinishWrite for BufWriter<W> {
    fn finish_write(mut self) -> io::Result<()> {
        self.flush()
    }
}

impl<W: FinishWrite> FinishWrite for GzEncoder<W> {
    fn finish_write(self) -> io::Result<()> {
        self.finish()?.finish_write()
    }
}

struct ZipSink<W: Write + Seek + Send> {
    zip: ZipWriter<W>,
}

impl<W: Write + Seek + Send> ArchiveSink for ZipSink<W> {
    fn append(&mut self, item: &ExportItem, body: &mut dyn Read) -> io::Result<()> {
        let method = if is_precompressed(&item.mime_type, &item.path) {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .large_file(item.size >= u64::from(u32::MAX))
            .unix_permissions(0o644);

        self.zip
            .start_file(item.path.clone(), options)
            .map_err(io::Error::other)?;
        io::copy(body, &mut self.zip)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = self.zip.finish().map_err(io::Error::other)?;
        inner.flush()
    }
}

struct TarSink<W: FinishWrite> {
    tar: tar::Builder<W>,
}

impl<W: FinishWrite> TarSink<W> {
    fn new(writer: W) -> Self {
        let mut tar = tar::Builder::new(writer);
        tar.mode(tar::HeaderMode::Deterministic);
        Self { tar }
    }
}

impl<W: FinishWrite> ArchiveSink for TarSink<W> {
    fn append(&mut self, item: &ExportItem, body: &mut dyn Read) -> io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(item.size);
        header.set_mode(0o644);
        header.set_mtime(u64::try_from(item.created_at.timestamp()).unwrap_or_default());
        self.tar.append_data(&mut header, &item.path, body)
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        self.tar.into_inner()?.finish_write()
    }
}

/// Sink writing to a spool file.
pub fn file_sink(format: ArchiveFormat, file: std::fs::File) -> Box<dyn ArchiveSink> {
    let writer = BufWriter::new(file);
    match format {
        ArchiveFormat::Zip => Box::new(ZipSink {
            zip: ZipWriter::new(writer),
        }),
        ArchiveFormat::Tar => Box::new(TarSink::new(writer)),
        ArchiveFormat::TarGz => Box::new(TarSink::new(GzEncoder::new(writer, Compression::default()))),
    }
}

/// Sink writing to a non-seekable stream.
pub fn stream_sink<W: Write + Send + 'static>(format: ArchiveFormat, writer: W) -> Box<dyn ArchiveSink> {
    let writer = BufWriter::new(writer);
    match format {
        ArchiveFormat::Zip => Box::new(ZipSink {
            zip: ZipWriter::new_stream(writer),
        }),
        ArchiveFormat::Tar => Box::new(TarSink::new(writer)),
        ArchiveFormat::TarGz => Box::new(TarSink::new(GzEncoder::new(writer, Compression::default()))),
    }
}

/// Forwards written bytes to an async consumer, typically a response body.
///
/// Fails with `BrokenPipe` once the receiving side is gone.
pub struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self { tx }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Write `items` into `sink` on the blocking pool.
///
/// The token is checked between entries. Progress is reported after every entry.
pub fn spawn_archive(
    sink: Box<dyn ArchiveSink>,
    items: Vec<ExportItem>,
    store: Arc<dyn BlobStore>,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<ArchiveProgress>>,
) -> JoinHandle<Result<ArchiveProgress, ArchiveError>> {
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || {
        write_items(sink, &items, store.as_ref(), &handle, &cancel, progress.as_ref())
    })
}

fn write_items(
    mut sink: Box<dyn ArchiveSink>,
    items: &[ExportItem],
    store: &dyn BlobStore,
    handle: &Handle,
    cancel: &CancellationToken,
    progress: Option<&mpsc::UnboundedSender<ArchiveProgress>>,
) -> Result<ArchiveProgress, ArchiveError> {
    let mut done = ArchiveProgress { files: 0, bytes: 0 };

    for item in items {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let reader = handle.block_on(store.open(&item.hash))?;
        let mut body = SyncIoBridge::new_with_handle(reader, handle.clone());
        sink.append(item, &mut body)?;

        done.files += 1;
        done.bytes += item.size;
        if let Some(tx) = progress {
            let _ = tx.send(done);
        }
    }

    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    sink.finish()?;
    Ok(done)
}
