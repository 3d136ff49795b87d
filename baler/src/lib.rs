//! Stream every object under an object storage prefix into a single gzip-compressed tar
//! archive and re-upload the archive to object storage, without ever materializing the
//! whole archive (or the whole set of source objects) in memory or on local disk.
//!
//! The pipeline is: paginated listing of the source prefix → bounded-concurrency fetch of
//! each object (sequential ranged reads for large ones) → incremental tar.gz encoding →
//! a chunker that slices the archive byte stream into fixed-size parts → multipart upload
//! of those parts to the destination, falling back to a single put when the archive is
//! smaller than one part.
//!
//! The entry point is [`ArchiveJobBuilder`]:
//!
//! ```no_run
//! # async fn example() -> baler::Result<()> {
//! use baler::{ArchiveJobBuilder, Config, SourcePrefix, TargetObject};
//!
//! let job = ArchiveJobBuilder::new(
//!     Config::default(),
//!     SourcePrefix::Url("s3://my-bucket/photos/2023/".parse().unwrap()),
//!     TargetObject::Url("s3://archive-bucket/photos-2023.tar.gz".parse().unwrap()),
//! )
//! .build()
//! .await?;
//!
//! let summary = job.run().await?;
//! println!("archived {} objects", summary.objects_archived);
//! # Ok(())
//! # }
//! ```
mod archive;
mod config;
mod error;
mod fetch;
pub mod objstore;
mod pipeline;
mod upload;

pub use config::Config;
pub use error::{ArchiveError, Result};
pub use pipeline::{ArchiveJob, ArchiveJobBuilder, ArchiveSummary, SourcePrefix, TargetObject};
pub use upload::{UploadMethod, UploadSummary};
