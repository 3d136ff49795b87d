//! The pipeline coordinator: wires listing → bounded fetching → archive encoding →
//! chunked re-upload for one source prefix and one destination object, and owns the
//! terminal outcome.
use crate::archive::ArchiveWriter;
use crate::fetch::{self, FetchedObject};
use crate::objstore::{self, Bucket, ObjectDescriptor, ObjectStorageFactory};
use crate::upload::{UploadSink, UploadSummary};
use crate::{Config, Result};
use futures::StreamExt;
use snafu::prelude::*;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Where the source objects come from: all objects under a prefix.
pub enum SourcePrefix {
    /// A `s3://bucket/prefix/` style URL.  The bucket is validated when the job is built.
    Url(Url),

    /// An already-constructed bucket and a prefix within it.  This is how tests inject an
    /// in-memory store
    Bucket {
        bucket: Box<dyn Bucket>,
        prefix: String,
    },
}

impl std::fmt::Debug for SourcePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Bucket { bucket, prefix } => f
                .debug_struct("Bucket")
                .field("bucket", &bucket.name())
                .field("prefix", prefix)
                .finish(),
        }
    }
}

/// Where the finished archive is written: a single destination object.
pub enum TargetObject {
    /// A `s3://bucket/key` style URL.  The URL must specify a bucket and a complete
    /// object key.
    Url(Url),

    /// An already-constructed bucket and the destination key within it
    Bucket {
        bucket: Box<dyn Bucket>,
        key: String,
    },
}

impl std::fmt::Debug for TargetObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Bucket { bucket, key } => f
                .debug_struct("Bucket")
                .field("bucket", &bucket.name())
                .field("key", key)
                .finish(),
        }
    }
}

/// Builds an [`ArchiveJob`]: validates both ends, enumerates the source objects, and
/// refuses to proceed when there is nothing to archive.
#[derive(Debug)]
pub struct ArchiveJobBuilder {
    config: Config,
    source: SourcePrefix,
    target: TargetObject,
}

impl ArchiveJobBuilder {
    pub fn new(config: Config, source: SourcePrefix, target: TargetObject) -> Self {
        Self {
            config,
            source,
            target,
        }
    }

    /// Resolve and validate both buckets, run the full listing, and construct the job.
    ///
    /// This can be a long-running operation when the source prefix holds many objects:
    /// the complete listing is accumulated here, page by page.  Zero-size objects are
    /// dropped from the result since they contribute nothing to the archive and would
    /// waste a fetch round-trip each.
    ///
    /// Fails with [`ArchiveError::NoObjectsFound`] if the filtered set is empty.  No
    /// upload session exists yet at that point, so an empty prefix leaves no residue at
    /// the destination.
    pub async fn build(self) -> Result<ArchiveJob> {
        let factory = ObjectStorageFactory::new(self.config.clone());

        let (source_bucket, prefix) = match self.source {
            SourcePrefix::Url(url) => {
                let objstore = factory.from_url(&url).await?;
                let bucket = objstore.extract_bucket_from_url(&url).await?;
                (bucket, url_path_to_key(url.path()).to_string())
            }
            SourcePrefix::Bucket { bucket, prefix } => (bucket, prefix),
        };

        let (target_bucket, target_key) = match self.target {
            TargetObject::Url(url) => {
                let objstore = factory.from_url(&url).await?;
                let bucket = objstore.extract_bucket_from_url(&url).await?;
                let key = url_path_to_key(url.path()).to_string();
                ensure!(
                    !key.is_empty(),
                    crate::error::MissingObjectKeySnafu { url: url.clone() }
                );
                (bucket, key)
            }
            TargetObject::Bucket { bucket, key } => (bucket, key),
        };

        debug!(
            bucket = source_bucket.name(),
            prefix = %prefix,
            "listing source objects"
        );

        let listed = objstore::list_all(&*source_bucket, &prefix).await?;
        let listed_count = listed.len();

        let objects: Vec<ObjectDescriptor> =
            listed.into_iter().filter(|object| object.size > 0).collect();

        debug!(
            listed = listed_count,
            non_empty = objects.len(),
            "listing complete"
        );

        ensure!(
            !objects.is_empty(),
            crate::error::NoObjectsFoundSnafu {
                bucket: source_bucket.name().to_string(),
                prefix: prefix.clone(),
            }
        );

        Ok(ArchiveJob {
            config: self.config,
            source_bucket,
            target_bucket,
            target_key,
            objects,
        })
    }
}

/// A fully prepared archive job: the object set is known, both buckets are validated, and
/// nothing has been written yet.
#[derive(Debug)]
pub struct ArchiveJob {
    config: Config,
    source_bucket: Box<dyn Bucket>,
    target_bucket: Box<dyn Bucket>,
    target_key: String,
    objects: Vec<ObjectDescriptor>,
}

/// What a finished run did.
#[derive(Clone, Debug)]
pub struct ArchiveSummary {
    /// Number of source objects written into the archive
    pub objects_archived: usize,

    /// Objects that were listed as non-empty but came back without a body and were
    /// skipped
    pub objects_skipped: usize,

    pub upload: UploadSummary,
}

impl ArchiveJob {
    /// The total number of objects that will be read into the archive
    pub fn total_objects(&self) -> usize {
        self.objects.len()
    }

    /// The total number of bytes to read from all objects
    pub fn total_bytes(&self) -> u64 {
        self.objects.iter().map(|object| object.size).sum()
    }

    /// Run the job, returning only when the destination object exists (or the run has
    /// failed and the upload session was aborted).
    #[instrument(
        skip(self),
        fields(
            source_bucket = %self.source_bucket.name(),
            target_bucket = %self.target_bucket.name(),
            target_key = %self.target_key,
            objects = self.objects.len(),
        )
    )]
    pub async fn run(self) -> Result<ArchiveSummary> {
        let part_size = self.config.part_size.get_bytes() as usize;

        // The upload session is created before a single archive byte exists
        let UploadSink { writer, handle } = UploadSink::start(
            self.target_bucket,
            self.target_key,
            part_size,
            self.config.max_concurrent_part_uploads,
        )
        .await?;

        let archive = ArchiveWriter::new(writer);

        let encode_result =
            encode_all(&self.config, self.source_bucket, self.objects, archive).await;

        match encode_result {
            Ok((objects_archived, objects_skipped)) => {
                let upload = handle.finish().await?;

                info!(
                    objects_archived,
                    objects_skipped,
                    bytes_uploaded = upload.bytes_uploaded,
                    parts = upload.parts,
                    method = ?upload.method,
                    "archive created and uploaded"
                );

                Ok(ArchiveSummary {
                    objects_archived,
                    objects_skipped,
                    upload,
                })
            }
            Err(e) => {
                warn!(error = %e, "archive pipeline failed; aborting upload session");

                // If the uploader failed first, the encode error is just a broken pipe
                // symptom; surface the uploader's own error instead
                match handle.abort().await {
                    Some(upload_error) => Err(upload_error),
                    None => Err(e),
                }
            }
        }
    }
}

/// Fetch every object with bounded concurrency, append each to the archive as its fetch
/// completes, and finalize the archive once every fetch has resolved.
///
/// Returns `(appended, skipped)` counts.
async fn encode_all(
    config: &Config,
    bucket: Box<dyn Bucket>,
    objects: Vec<ObjectDescriptor>,
    archive: ArchiveWriter,
) -> Result<(usize, usize)> {
    let window = config.download_window.get_bytes() as u64;
    let concurrency = config.max_concurrent_fetches.max(1);

    let fetch_futs = objects.into_iter().map(move |descriptor| {
        let bucket = bucket.clone();

        async move { fetch::fetch_object(&*bucket, &descriptor, window).await }
    });

    // The buffer combinator evaluates up to `concurrency` fetches at once, yielding each
    // as it completes — completion order, not listing order
    let mut fetches = futures::stream::iter(fetch_futs).buffer_unordered(concurrency);

    // The stream only makes progress while polled, but appending to the archive can stall
    // on upload backpressure.  Forward completions through a channel from a dedicated
    // task so the fetch pool stays saturated while an append is in progress (the channel
    // depth bounds how many fetched objects can pile up waiting)
    let (fetched_sender, mut fetched_receiver) =
        tokio::sync::mpsc::channel::<Result<Option<FetchedObject>>>(concurrency);
    tokio::spawn(async move {
        while let Some(result) = fetches.next().await {
            if fetched_sender.send(result).await.is_err() {
                debug!("fetched objects channel closed; stopping fetch feeder task");
                break;
            }
        }
    });

    let mut appended = 0usize;
    let mut skipped = 0usize;

    while let Some(result) = fetched_receiver.recv().await {
        match result? {
            None => skipped += 1,
            Some(FetchedObject { name, mtime, bytes }) => {
                debug!(
                    name = %name,
                    size = bytes.len(),
                    "appending fetched object to archive"
                );

                archive.append(&name, mtime, bytes).await?;
                appended += 1;
            }
        }
    }

    // Every fetch task has resolved (the channel is closed), so no append can race the
    // archive footer
    archive.finalize().await?;

    Ok((appended, skipped))
}

/// Paths from URLs like `s3://bucket/prefix/object` always start with `/`, but that's not
/// actually part of the object key; the `/` is the separator between bucket and key.
fn url_path_to_key(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}
