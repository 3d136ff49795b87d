use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::{
    abort_multipart_upload::AbortMultipartUploadError,
    complete_multipart_upload::CompleteMultipartUploadError,
    create_multipart_upload::CreateMultipartUploadError, get_object::GetObjectError,
    head_bucket::HeadBucketError, list_objects_v2::ListObjectsV2Error, put_object::PutObjectError,
    upload_part::UploadPartError,
};
use snafu::prelude::*;
use url::Url;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ArchiveError {
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The URL '{url}' is missing the object key"))]
    MissingObjectKey { url: Url },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: SdkError<HeadBucketError>,
    },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjects {
        bucket: String,
        prefix: String,
        source: SdkError<ListObjectsV2Error>,
    },

    #[snafu(display("No non-empty objects found in bucket '{bucket}' under prefix '{prefix}'"))]
    NoObjectsFound { bucket: String, prefix: String },

    #[snafu(display("Error reading object '{key}' in S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: SdkError<GetObjectError>,
    },

    #[snafu(display("Error reading response body of object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display(
        "Object '{key}' in bucket '{bucket}' ended at offset {offset} before its declared size of {size} bytes"
    ))]
    TruncatedObject {
        bucket: String,
        key: String,
        offset: u64,
        size: u64,
    },

    #[snafu(display("Error creating multipart upload for object '{key}' in S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CreateMultipartUploadError>,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' in S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: i32,
        source: SdkError<UploadPartError>,
    },

    #[snafu(display("Error completing multipart upload of object '{key}' in S3 bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CompleteMultipartUploadError>,
    },

    #[snafu(display("Error aborting multipart upload of object '{key}' in S3 bucket '{bucket}'"))]
    AbortMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<AbortMultipartUploadError>,
    },

    #[snafu(display("Error writing object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<PutObjectError>,
    },

    #[snafu(display(
        "Upload of object '{key}' to bucket '{bucket}' was abandoned before the archive stream completed"
    ))]
    UploadAbandoned { bucket: String, key: String },

    #[snafu(display("Error writing entry '{name}' to the archive"))]
    ArchiveEntryWrite {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("Error finalizing the archive stream"))]
    ArchiveFinalize { source: std::io::Error },

    #[snafu(display("Background task panicked or was cancelled"))]
    SpawnBlocking { source: tokio::task::JoinError },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}
