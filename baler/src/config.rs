use url::Url;

/// The configuration settings that control the behavior of the archive pipeline.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  When this is set,
    /// path-style addressing is used since most S3-compatible services require it.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The size of the parts the archive output stream is cut into for multipart upload.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MiB".
    ///
    /// Every part except the last is exactly this size.  Note that S3 rejects multipart
    /// parts smaller than 5MiB (except the final part), so this should not be set lower
    /// than that when uploading to real S3.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5MiB", global = true))]
    pub part_size: byte_unit::Byte,

    /// The window size for ranged reads of individual source objects.
    ///
    /// Objects up to this size are fetched with a single request; larger objects are
    /// fetched with sequential byte-range requests of this size and reassembled before
    /// being appended to the archive.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MiB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "5MiB", global = true))]
    pub download_window: byte_unit::Byte,

    /// The maximum number of source objects fetched concurrently.
    ///
    /// A higher bound may be necessary to saturate very fast connections to the source
    /// bucket, but it also increases peak memory usage since every in-flight fetch holds
    /// its object's bytes.
    #[cfg_attr(feature = "clap", clap(long, default_value = "20", global = true))]
    pub max_concurrent_fetches: usize,

    /// The maximum number of archive parts uploaded to the destination concurrently.
    ///
    /// Also bounds how many completed parts may be buffered waiting for an upload slot,
    /// so peak memory for the upload side is roughly `part_size * 2 * this`.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8", global = true))]
    pub max_concurrent_part_uploads: usize,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: these values are duplicated in the `clap` attributes; unfortunately there's no
        // way to share them without taking an unconditional clap dependency in the lib crate
        Self {
            s3_endpoint: None,
            part_size: byte_unit::Byte::from_bytes(5 * 1024 * 1024),
            download_window: byte_unit::Byte::from_bytes(5 * 1024 * 1024),
            max_concurrent_fetches: 20,
            max_concurrent_part_uploads: 8,
        }
    }
}
