//! The upload side of the pipeline: a chunker task that slices the archive's output byte
//! stream into fixed-size parts, and an uploader task that owns the multipart upload
//! session and pushes those parts to the destination with bounded concurrency.
//!
//! The archive encoder writes into a [`DuplexStream`]; the chunker reads the other end.
//! Parts flow through a bounded channel, so the total amount of archive output buffered
//! anywhere in the pipeline is a small multiple of the part size no matter how large the
//! archive grows.
//!
//! The session is opened before the first archive byte exists and must end in exactly one
//! of two terminal states: completed (all parts, ascending part-number order) or aborted.
//! Because a closed duplex looks the same whether the archive was finalized cleanly or
//! dropped on an error path, the coordinator holds an [`UploadHandle`] and explicitly
//! commits or aborts once it knows the outcome.
use crate::objstore::{Bucket, CompletedPartInfo};
use crate::{ArchiveError, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// One slice of the archive output stream, in stream order.
///
/// Part numbers count from 0 here; the store-facing 1-based number is assigned at upload
/// time.  Every part except the final one is exactly the configured part size.
pub(crate) struct ArchivePart {
    pub part_number: usize,
    pub data: Bytes,
}

/// How the destination object ended up being written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadMethod {
    /// Completed multipart upload session with one part per archive slice
    Multipart,

    /// The archive output never filled a single part, so the session was abandoned in
    /// favor of one direct put
    SinglePut,
}

/// What the upload sink reports after the destination object has been created.
#[derive(Clone, Debug)]
pub struct UploadSummary {
    /// Total bytes of archive output uploaded.  By construction this equals the total
    /// length of the archive byte stream.
    pub bytes_uploaded: u64,

    /// Number of parts uploaded (1 for [`UploadMethod::SinglePut`])
    pub parts: usize,

    pub method: UploadMethod,
}

/// The writer half handed to the archive encoder plus the control handle the coordinator
/// keeps.
pub(crate) struct UploadSink {
    pub writer: DuplexStream,
    pub handle: UploadHandle,
}

impl UploadSink {
    /// Open the upload session for `key` and spawn the chunker and uploader tasks.
    ///
    /// The multipart session is created before this returns, so a session always exists
    /// by the time any archive byte is produced and there is always something to abort.
    pub async fn start(
        bucket: Box<dyn Bucket>,
        key: String,
        part_size: usize,
        max_concurrent_uploads: usize,
    ) -> Result<UploadSink> {
        let upload_id = bucket.create_multipart_upload(&key).await?;

        debug!(
            bucket = bucket.name(),
            key = %key,
            upload_id = %upload_id,
            part_size,
            "opened multipart upload session"
        );

        let (writer, parts_receiver) = chunked_writer(part_size, max_concurrent_uploads);
        let (commit_sender, commit_receiver) = oneshot::channel();
        let (result_sender, result_receiver) = oneshot::channel();

        tokio::spawn(async move {
            let result = run_uploader(
                &*bucket,
                &key,
                &upload_id,
                part_size,
                max_concurrent_uploads,
                parts_receiver,
                commit_receiver,
            )
            .await;

            let _ = result_sender.send(result);
        });

        Ok(UploadSink {
            writer,
            handle: UploadHandle {
                commit: Some(commit_sender),
                result: result_receiver,
            },
        })
    }
}

/// Control handle over the uploader task.
///
/// The coordinator calls [`UploadHandle::finish`] after the archive stream was finalized
/// cleanly, or [`UploadHandle::abort`] on any failure.  Dropping the handle outright also
/// aborts the session, just without waiting for the abort to land.
pub(crate) struct UploadHandle {
    commit: Option<oneshot::Sender<()>>,
    result: oneshot::Receiver<Result<UploadSummary>>,
}

impl UploadHandle {
    /// Commit the upload: the archive stream ended cleanly, so once the remaining parts
    /// drain, the session is completed (or the single-put fallback performed) and the
    /// summary returned.
    pub async fn finish(mut self) -> Result<UploadSummary> {
        if let Some(commit) = self.commit.take() {
            let _ = commit.send(());
        }

        match self.result.await {
            Ok(result) => result,
            Err(_) => snafu::whatever!("upload worker task terminated unexpectedly"),
        }
    }

    /// Abort the upload session and wait for the abort to be issued.
    ///
    /// If the uploader had already failed on its own, that error is returned so the
    /// caller can surface the root cause instead of a downstream symptom.
    pub async fn abort(mut self) -> Option<ArchiveError> {
        // Dropping the commit sender is the abort signal
        drop(self.commit.take());

        match self.result.await {
            Ok(Err(e)) if !matches!(e, ArchiveError::UploadAbandoned { .. }) => Some(e),
            _ => None,
        }
    }
}

/// Construct a [`DuplexStream`] writer whose written bytes are accumulated into
/// [`ArchivePart`]s of exactly `part_size` bytes (except a smaller final part at EOF) and
/// sent to the returned channel, in stream order, by a dedicated task.
fn chunked_writer(
    part_size: usize,
    channel_depth: usize,
) -> (DuplexStream, mpsc::Receiver<ArchivePart>) {
    let (writer, mut reader) = tokio::io::duplex(part_size);
    let (parts_sender, parts_receiver) = mpsc::channel(channel_depth.max(1));

    tokio::spawn(async move {
        let mut accumulation = BytesMut::with_capacity(part_size * 2);
        let mut part_number = 0usize;

        loop {
            // Reads from the read half of a duplex are infallible; a zero-byte read means
            // the write half was dropped or shut down
            let bytes_read = reader
                .read_buf(&mut accumulation)
                .await
                .expect("BUG: reads from DuplexStream are infallible");
            let at_eof = bytes_read == 0;

            while accumulation.len() >= part_size {
                let part = ArchivePart {
                    part_number,
                    data: accumulation.split_to(part_size).freeze(),
                };
                part_number += 1;

                if parts_sender.send(part).await.is_err() {
                    // The uploader gave up (or errored); no point reading further
                    warn!("archive parts receiver was dropped; chunker task exiting");
                    return;
                }
            }

            if at_eof {
                if !accumulation.is_empty() {
                    let data = accumulation.split_to(accumulation.len()).freeze();
                    let part = ArchivePart { part_number, data };
                    part_number += 1;

                    if parts_sender.send(part).await.is_err() {
                        warn!("archive parts receiver was dropped; final part is lost");
                    }
                }

                debug!(
                    parts = part_number,
                    "reached end of archive stream; chunker task exiting"
                );
                return;
            }
        }
    });

    (writer, parts_receiver)
}

/// The uploader task: drives part uploads as the chunker produces them, then waits for
/// the coordinator's verdict before making the session terminal.
async fn run_uploader(
    bucket: &dyn Bucket,
    key: &str,
    upload_id: &str,
    part_size: usize,
    max_concurrent_uploads: usize,
    mut parts_receiver: mpsc::Receiver<ArchivePart>,
    commit_receiver: oneshot::Receiver<()>,
) -> Result<UploadSummary> {
    let first = parts_receiver.recv().await;

    // A part smaller than the full part size can only be the chunker's final flush at
    // EOF.  If that is also the *first* part, the stream never filled a single part and
    // the multipart session is pointless: fall back to one direct put.
    let small_output = match &first {
        None => Some(Bytes::new()),
        Some(part) if part.part_number == 0 && part.data.len() < part_size => {
            Some(part.data.clone())
        }
        _ => None,
    };

    if let Some(data) = small_output {
        return single_put_fallback(bucket, key, upload_id, data, commit_receiver).await;
    }

    let first = first.expect("BUG: empty stream already handled");

    let parts = futures::stream::iter([first])
        .chain(tokio_stream::wrappers::ReceiverStream::new(parts_receiver));

    let part_futs = parts.map(|part| {
        // Chunker part numbers count from 0, but the store expects them from 1
        let part_number = (part.part_number + 1) as i32;
        let bucket = dyn_clone::clone_box(bucket);
        let key = key.to_string();
        let upload_id = upload_id.to_string();

        async move {
            let size = part.data.len();
            debug!(part_number, size, "uploading archive part");

            let etag = bucket
                .upload_part(&key, &upload_id, part_number, part.data)
                .await?;

            debug!(part_number, %etag, "uploaded archive part");

            Ok::<_, ArchiveError>((CompletedPartInfo { part_number, etag }, size))
        }
    });

    // `buffer_unordered` polls the upload futures in the order the parts were cut, up to
    // the concurrency bound; parts are thus issued in stream order even though several
    // may be in flight at once
    let mut in_flight = part_futs.buffer_unordered(max_concurrent_uploads.max(1));

    let mut completed = Vec::new();
    let mut total_bytes = 0u64;

    while let Some(result) = in_flight.next().await {
        match result {
            Ok((part, size)) => {
                total_bytes += size as u64;
                completed.push(part);
            }
            Err(e) => {
                error!(error = %e, key, upload_id, "part upload failed; aborting upload session");
                abort_session(bucket, key, upload_id).await;
                return Err(e);
            }
        }
    }

    // Every part of the stream has been uploaded.  Whether the stream *ended* cleanly
    // only the coordinator knows, so wait for its verdict before going terminal.
    if commit_receiver.await.is_err() {
        abort_session(bucket, key, upload_id).await;
        return crate::error::UploadAbandonedSnafu {
            bucket: bucket.name().to_string(),
            key: key.to_string(),
        }
        .fail();
    }

    // The store requires the completion call to list parts in ascending part-number
    // order, with no gaps
    completed.sort_unstable_by_key(|part| part.part_number);

    debug!(
        parts = completed.len(),
        total_bytes, "all parts uploaded; completing multipart upload"
    );

    match bucket
        .complete_multipart_upload(key, upload_id, &completed)
        .await
    {
        Ok(()) => Ok(UploadSummary {
            bytes_uploaded: total_bytes,
            parts: completed.len(),
            method: UploadMethod::Multipart,
        }),
        Err(e) => {
            error!(error = %e, key, upload_id, "failed to complete multipart upload; aborting");
            abort_session(bucket, key, upload_id).await;
            Err(e)
        }
    }
}

/// The archive output never filled one part: discard the provisional multipart session
/// and (if the coordinator commits) write the whole output with a single put.
async fn single_put_fallback(
    bucket: &dyn Bucket,
    key: &str,
    upload_id: &str,
    data: Bytes,
    commit_receiver: oneshot::Receiver<()>,
) -> Result<UploadSummary> {
    if commit_receiver.await.is_err() {
        abort_session(bucket, key, upload_id).await;
        return crate::error::UploadAbandonedSnafu {
            bucket: bucket.name().to_string(),
            key: key.to_string(),
        }
        .fail();
    }

    // The session must never be left open, even though nothing was uploaded under it
    abort_session(bucket, key, upload_id).await;

    let total_bytes = data.len() as u64;
    debug!(
        total_bytes,
        key, "archive output is smaller than one part; uploading with a single put"
    );

    bucket.put_object(key, data).await?;

    Ok(UploadSummary {
        bytes_uploaded: total_bytes,
        parts: 1,
        method: UploadMethod::SinglePut,
    })
}

/// Best-effort abort of the multipart session.
///
/// An abort failure is logged but not propagated; the caller is already surfacing a more
/// interesting error or falling back to a direct put.
async fn abort_session(bucket: &dyn Bucket, key: &str, upload_id: &str) {
    if let Err(e) = bucket.abort_multipart_upload(key, upload_id).await {
        error!(
            error = %e,
            bucket = bucket.name(),
            key,
            upload_id,
            "error aborting multipart upload; the incomplete upload will linger until a lifecycle rule cleans it up"
        );
    }
}
