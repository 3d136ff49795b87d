//! The streaming archive encoder: a `tar::Builder` writing through a gzip encoder into
//! the in-memory duplex that feeds the upload sink.
//!
//! This is a tricky seam because we download from and upload to object storage with
//! parallelized async code, but the `tar` and `flate2` crates operate on synchronous
//! `Write` traits.  The bridge is [`tokio_util::io::SyncIoBridge`], and every operation
//! that touches the builder is performed on a blocking worker thread via
//! [`tokio::task::spawn_blocking`].  The `Write` impl the bridge produces will panic if
//! used from an async context, which conveniently also catches any accidental blocking
//! I/O on an async worker.
use crate::Result;
use bytes::{Buf, Bytes};
use flate2::write::GzEncoder;
use flate2::Compression;
use snafu::prelude::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, warn};

type ArchiveOutput = GzEncoder<SyncIoBridge<DuplexStream>>;

/// Wraps a [`tar::Builder`] and ensures it never attempts blocking write operations in an
/// async context.
///
/// `tar` has made the dubious decision that when the builder is dropped, it flushes the
/// archive footer to the writer, meaning blocking writes can happen wherever the drop
/// happens.  The `Drop` impl here moves that work onto a blocking thread, so an error
/// path that abandons the archive mid-stream can't panic the async worker it unwinds on.
///
/// The builder is stored as `Option` not because there might not be a builder, but
/// because both `finalize` and `drop` need to transfer ownership of it to a blocking
/// context.
pub(crate) struct ArchiveWriter {
    builder: Option<Arc<Mutex<tar::Builder<ArchiveOutput>>>>,
}

impl ArchiveWriter {
    /// Start a new gzip-compressed tar stream whose output is written to `writer`.
    pub fn new(writer: DuplexStream) -> Self {
        let encoder = GzEncoder::new(SyncIoBridge::new(writer), Compression::default());

        Self {
            builder: Some(Arc::new(Mutex::new(tar::Builder::new(encoder)))),
        }
    }

    /// Append one complete entry to the archive.
    ///
    /// The entry's bytes are fully reassembled by the fetch stage before this is called,
    /// so the append is a single pass over a contiguous buffer.  Appends must be awaited
    /// one at a time; the entry is flushed into the output stream incrementally, long
    /// before [`Self::finalize`].
    pub async fn append(
        &self,
        name: &str,
        mtime: Option<chrono::DateTime<chrono::Utc>>,
        data: Bytes,
    ) -> Result<()> {
        let builder = self
            .builder
            .clone()
            .expect("BUG: append after the builder was finalized");
        let name = name.to_string();

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        if let Some(mtime) = mtime {
            header.set_mtime(mtime.timestamp().max(0) as u64);
        }
        header.set_cksum();

        tokio::task::spawn_blocking(move || {
            let mut builder = builder.lock().unwrap();

            builder
                .append_data(&mut header, &name, data.reader())
                .with_context(|_| crate::error::ArchiveEntryWriteSnafu { name: name.clone() })?;

            debug!(name = %name, "appended entry to archive");

            Ok(())
        })
        .await
        .context(crate::error::SpawnBlockingSnafu)?
    }

    /// Signal that no more entries will be appended: write the tar footer, finish the
    /// gzip stream, and shut down the underlying writer so the consumer sees EOF.
    ///
    /// Must only be called once every append has completed.
    pub async fn finalize(mut self) -> Result<()> {
        let builder = self
            .builder
            .take()
            .expect("BUG: builder already finalized");
        let builder = Arc::try_unwrap(builder)
            .unwrap_or_else(|_| panic!("BUG: an append is still in flight during finalize"))
            .into_inner()
            .unwrap();

        tokio::task::spawn_blocking(move || close_builder(builder))
            .await
            .context(crate::error::SpawnBlockingSnafu)?
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if let Some(builder) = self.builder.take() {
            // Reachable only on error paths; `finalize` consumes the builder on success
            if let Ok(mutex) = Arc::try_unwrap(builder) {
                let builder = mutex.into_inner().unwrap();

                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    warn!("archive writer dropped without being finalized, probably due to an error; flushing on a blocking thread");

                    handle.spawn(async move {
                        let _ = tokio::task::spawn_blocking(move || drop(builder)).await;
                    });
                } else {
                    // Already on a non-async thread, so the builder's own flush-on-drop
                    // is safe here
                    drop(builder);
                }
            }
        }
    }
}

/// Destroy the `tar::Builder` in a guaranteed synchronous context so blocking calls to
/// the writer are fine.
fn close_builder(builder: tar::Builder<ArchiveOutput>) -> Result<()> {
    // `into_inner` writes the tar footer and flushes
    let encoder = builder
        .into_inner()
        .context(crate::error::ArchiveFinalizeSnafu)?;

    // ...then the gzip trailer...
    let mut writer = encoder
        .finish()
        .context(crate::error::ArchiveFinalizeSnafu)?;

    // ...and finally close the duplex so the chunker downstream sees EOF
    writer
        .flush()
        .context(crate::error::ArchiveFinalizeSnafu)?;
    if let Err(e) = writer.shutdown() {
        error!(?e, "error shutting down archive output stream");
        return Err(e).context(crate::error::ArchiveFinalizeSnafu);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tokio::io::AsyncReadExt;

    /// Entries appended to the writer must come back out of the gzip'd tar stream intact,
    /// with their mtimes preserved.
    #[tokio::test(flavor = "multi_thread")]
    async fn round_trips_entries() {
        let (write_half, mut read_half) = tokio::io::duplex(64 * 1024);

        let output = tokio::spawn(async move {
            let mut buffer = Vec::new();
            read_half.read_to_end(&mut buffer).await.unwrap();
            buffer
        });

        let mtime = chrono::DateTime::parse_from_rfc3339("2023-04-01T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        let writer = ArchiveWriter::new(write_half);
        writer
            .append("hello.txt", Some(mtime), Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        writer
            .append("data.bin", None, Bytes::from(vec![0xab; 4096]))
            .await
            .unwrap();
        writer.finalize().await.unwrap();

        let compressed = output.await.unwrap();

        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(&compressed[..]));
        let mut entries = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let entry_mtime = entry.header().mtime().unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.push((name, entry_mtime, data));
        }

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "hello.txt");
        assert_eq!(entries[0].1, mtime.timestamp() as u64);
        assert_eq!(entries[0].2, b"hello world");
        assert_eq!(entries[1].0, "data.bin");
        assert_eq!(entries[1].2, vec![0xab; 4096]);
    }
}
