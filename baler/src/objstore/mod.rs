//! Abstraction over the object storage APIs the pipeline consumes.
//!
//! Not all object storage systems expose an S3-compatible API, so to ensure we can add
//! support for other systems in the future (and so tests can run against an in-memory
//! store), the pipeline only ever talks to the primitives on the [`Bucket`] trait:
//! page-at-a-time listing, ranged reads, single-shot puts, and the multipart upload
//! quartet.  Everything above those primitives (pagination, reassembly, chunking) lives
//! in this crate where it can be exercised against any implementation.
//!
//! Note that all implementations are trivially cloneable such that the cost of a clone is
//! the cost of increasing the ref count on an `Arc`
use crate::{Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use std::ops::Range;
use tracing::debug;
use url::Url;

mod s3;

/// Upper bound on the number of entries requested per listing page.
///
/// This is also the cap S3 itself enforces on `ListObjectsV2`.
pub const LIST_PAGE_SIZE: i32 = 1000;

/// A single object discovered under the source prefix.
#[derive(Clone, Debug)]
pub struct ObjectDescriptor {
    /// The key which identifies the object in its bucket
    pub key: String,

    /// Size of the object in bytes, as reported by the listing
    pub size: u64,

    /// When the object was last modified, if the store reports it.
    ///
    /// Used to stamp the mtime of the corresponding archive entry.
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// One page of a listing, plus the opaque cursor for the next page (if any).
#[derive(Clone, Debug)]
pub struct ListPage {
    pub objects: Vec<ObjectDescriptor>,

    /// Continuation token to pass to the next [`Bucket::list_page`] call.
    ///
    /// `None` means the store reported no further pages.
    pub continuation: Option<String>,
}

/// The result of one ranged read against an object.
#[derive(Clone, Debug)]
pub struct ObjectChunk {
    pub data: Bytes,

    /// The (inclusive) offset of the last byte in `data`, as reported by the store's
    /// content-range.  The next sequential read starts at `range_end + 1`.
    pub range_end: u64,

    /// The total size of the object as reported by the store.
    ///
    /// The ranged read loop terminates exactly when `range_end == total_size - 1`.
    pub total_size: u64,
}

/// A part that has been uploaded as part of a multipart upload session, retaining what the
/// final completion call needs: the part number and the store-assigned etag.
#[derive(Clone, Debug)]
pub struct CompletedPartInfo {
    pub part_number: i32,
    pub etag: String,
}

/// An object storage system like S3.
///
/// Use [`ObjectStorageFactory`] to create an instance of this trait.
#[async_trait::async_trait]
pub trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Given a URL that contains a bucket (and possibly a prefix or object key also),
    /// extract the bucket name, validate it against the underlying object storage system,
    /// and if it's valid then return the bucket to the caller
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// A bucket which is like a namespace in which object storage systems store named objects.
///
/// These are the raw wire primitives; no method here retries, paginates, or buffers beyond
/// a single call.
#[async_trait::async_trait]
pub trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// Request one page of the listing of objects under `prefix`, of at most
    /// [`LIST_PAGE_SIZE`] entries, resuming from `continuation` if given.
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage>;

    /// Read a byte range of an object with a single request.
    ///
    /// The store may return fewer bytes than requested; the reported
    /// [`ObjectChunk::range_end`] is authoritative.  Reading large objects means calling
    /// this repeatedly with sequential ranges (see [`crate::fetch`]).
    async fn read_object_part(&self, key: &str, range: Range<u64>) -> Result<ObjectChunk>;

    /// Upload a small object in one request, without any multipart session.
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()>;

    /// Open a multipart upload session for `key`, returning the opaque upload ID.
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// Upload one part under an open session, returning the store-assigned etag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String>;

    /// Complete the session.  `parts` must be sorted ascending by part number and
    /// gapless starting at 1; stores reject anything else.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> Result<()>;

    /// Abort the session, discarding any parts uploaded so far.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

dyn_clone::clone_trait_object!(Bucket);

/// List every object under `prefix`, chaining continuation tokens until the store reports
/// no further pages.
///
/// The full result set is materialized here; it's bounded by the real size of the prefix,
/// unlike the archive byte stream which is never held whole.
pub async fn list_all(bucket: &dyn Bucket, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
    let mut objects = Vec::new();
    let mut continuation = None;
    let mut pages = 0usize;

    loop {
        let page = bucket.list_page(prefix, continuation).await?;
        pages += 1;
        objects.extend(page.objects);

        match page.continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    debug!(
        bucket = bucket.name(),
        prefix,
        pages,
        count = objects.len(),
        "listed all objects under prefix"
    );

    Ok(objects)
}

/// Constructs [`ObjectStorage`] implementations on demand.
///
/// Constructed explicitly from a [`Config`] and passed by reference wherever it's needed;
/// there is deliberately no process-global instance.
#[derive(Clone, Debug)]
pub struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Given the URL to an object storage bucket, prefix, or object, determine which
    /// implementation handles that particular object storage technology and return an
    /// instance of it.
    ///
    /// If the URL isn't recognized as a supported scheme, an error is returned
    pub async fn from_url(&self, url: &Url) -> Result<Box<dyn ObjectStorage>> {
        if url.scheme() == "s3" {
            Ok(Box::new(s3::S3::new(self.config.clone()).await))
        } else {
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
        }
    }
}
