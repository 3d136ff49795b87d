use super::{
    Bucket, CompletedPartInfo, ListPage, ObjectChunk, ObjectDescriptor, ObjectStorage,
    LIST_PAGE_SIZE,
};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use snafu::prelude::*;
use std::{ops::Range, sync::Arc};
use tracing::{debug, instrument};
use url::Url;

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}

struct S3Inner {
    client: aws_sdk_s3::Client,
}

impl S3 {
    pub(super) async fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(S3Inner {
                client: make_s3_client(&config).await,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>> {
        // S3 URLs are of the form:
        // s3://bucket/path
        // In URL terms, the `bucket` part is considered the host name.
        let bucket = url
            .host_str()
            .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

        Ok(Box::new(S3Bucket::new(self, bucket).await?))
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3")
    }
}

#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}

struct S3BucketInner {
    name: String,

    /// The client to use to operate on this bucket.
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Construct a new instance and validate that the current client has access to the bucket.
    ///
    /// If there is no access to the bucket then fail with an error
    async fn new(objstore: &S3, name: &str) -> Result<Self> {
        debug!(bucket = name, "Validating access to bucket");

        let client = objstore.inner.client.clone();

        client
            .head_bucket()
            .bucket(name)
            .send()
            .await
            .with_context(|_| crate::error::BucketInvalidOrNotAccessibleSnafu {
                bucket: name.to_string(),
            })?;

        debug!(bucket = name, "Access to bucket is confirmed");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                client,
            }),
        })
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        let response = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&self.inner.name)
            .prefix(prefix)
            .max_keys(LIST_PAGE_SIZE)
            .set_continuation_token(continuation)
            .send()
            .await
            .with_context(|_| crate::error::ListObjectsSnafu {
                bucket: self.inner.name.clone(),
                prefix: prefix.to_string(),
            })?;

        // The store only promises a valid continuation token when it also reports the
        // listing as truncated
        let continuation = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(|t| t.to_string())
        } else {
            None
        };

        let objects = response
            .contents
            .unwrap_or_default()
            .into_iter()
            .map(|object| ObjectDescriptor {
                key: object
                    .key()
                    .expect("BUG: all objects have keys")
                    .to_string(),
                size: object.size().unwrap_or(0).max(0) as u64,
                last_modified: object
                    .last_modified()
                    .and_then(|timestamp| timestamp.to_chrono_utc().ok()),
            })
            .collect();

        Ok(ListPage {
            objects,
            continuation,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn read_object_part(&self, key: &str, range: Range<u64>) -> Result<ObjectChunk> {
        debug!("Reading partial object");

        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key)
            .range(format!("bytes={}-{}", range.start, range.end.max(1) - 1))
            .send()
            .await
            .with_context(|_| crate::error::GetObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        let content_range = response
            .content_range()
            .and_then(parse_content_range);

        let bytes = response
            .body
            .collect()
            .await
            .with_context(|_| crate::error::ReadByteStreamSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?
            .into_bytes();

        // If the store didn't report a content-range (eg it returned the whole object
        // outright), reconstruct the range from what actually came back
        let fallback_end = range.start + (bytes.len() as u64).max(1) - 1;
        let (range_end, total_size) = match content_range {
            Some((end, Some(total))) => (end, total),
            Some((end, None)) => (end, end + 1),
            None => (fallback_end, fallback_end + 1),
        };

        Ok(ObjectChunk {
            data: bytes,
            range_end,
            total_size,
        })
    }

    #[instrument(skip(self, data), fields(bucket = %self.inner.name, size = data.len()))]
    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner
            .client
            .put_object()
            .bucket(&self.inner.name)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(response
            .upload_id()
            .expect("BUG: multipart uploads always have upload ID")
            .to_string())
    }

    #[instrument(skip(self, data), fields(bucket = %self.inner.name, size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let response = self
            .inner
            .client
            .upload_part()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::UploadPartSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
                part_number,
            })?;

        Ok(response
            .e_tag()
            .expect("BUG: uploaded part missing etag")
            .to_string())
    }

    #[instrument(skip(self, parts), fields(bucket = %self.inner.name, parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> Result<()> {
        let completed_parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect::<Vec<_>>();

        self.inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.inner
            .client
            .abort_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .with_context(|_| crate::error::AbortMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("client", &"<...>")
            .finish()
    }
}

/// Parse a `Content-Range` response header of the form `bytes 0-999/1234`.
///
/// Returns the inclusive end offset and, when the store reports one (it may report `*`),
/// the total object size.
fn parse_content_range(header: &str) -> Option<(u64, Option<u64>)> {
    let rest = header.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (_start, end) = range.split_once('-')?;

    let end = end.parse::<u64>().ok()?;
    let total = match total {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };

    Some((end, total))
}

/// Create a new AWS SDK S3 client, using the region deduced from the environment and the
/// custom endpoint from the config if one is set
async fn make_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
    let aws_config = aws_config::from_env().region(region_provider).load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // Most S3-compatible services (minio et al) only support path-style addressing,
        // so a custom endpoint implies path style
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.to_string())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_with_total() {
        assert_eq!(
            parse_content_range("bytes 0-1048575/10485760"),
            Some((1048575, Some(10485760)))
        );
    }

    #[test]
    fn content_range_without_total() {
        assert_eq!(parse_content_range("bytes 100-199/*"), Some((199, None)));
    }

    #[test]
    fn content_range_garbage() {
        assert_eq!(parse_content_range("garbage"), None);
        assert_eq!(parse_content_range("bytes 0-/100"), None);
        assert_eq!(parse_content_range("bytes /"), None);
    }
}
