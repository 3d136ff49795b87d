//! Fetching source objects: a whole-object read for anything that fits in one request
//! window, and a sequential ranged-read loop with reassembly for anything larger.
//!
//! Fetches for *different* objects run concurrently under the pipeline's fetch bound, but
//! the ranged reads of a single large object are strictly sequential: each request's
//! start offset comes from the previous response's reported content-range end.
use crate::objstore::{Bucket, ObjectDescriptor};
use crate::Result;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// A source object whose bytes have been fully reassembled, ready to append to the
/// archive under its basename.
///
/// The buffer is owned exclusively by the append step and dropped as soon as the entry
/// has been written.
pub(crate) struct FetchedObject {
    pub name: String,
    pub mtime: Option<chrono::DateTime<chrono::Utc>>,
    pub bytes: Bytes,
}

/// The archive entry name for a key: everything after the last `/`.
///
/// Keys with a trailing separator (directory markers and the like) fall back to the whole
/// key rather than producing an empty name.
pub(crate) fn entry_name(key: &str) -> &str {
    match key.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => key,
    }
}

/// Download the complete contents of one object.
///
/// Returns `Ok(None)` when the store hands back no data at all for an object the listing
/// claimed was non-empty; such objects are skipped rather than failing the run.  A body
/// that ends partway through is a hard error, since appending a truncated entry would
/// corrupt the archive.
pub(crate) async fn fetch_object(
    bucket: &dyn Bucket,
    descriptor: &ObjectDescriptor,
    window: u64,
) -> Result<Option<FetchedObject>> {
    debug!(
        key = %descriptor.key,
        size = descriptor.size,
        "fetching object"
    );

    let window = window.max(1);
    let mut buffer = BytesMut::with_capacity(descriptor.size as usize);
    let mut offset = 0u64;

    loop {
        // Cap the window at the declared size, but always ask for at least one byte in
        // case the store reports more data than the listing declared
        let range_end = (offset + window).min(descriptor.size).max(offset + 1);
        let chunk = bucket
            .read_object_part(&descriptor.key, offset..range_end)
            .await?;

        if chunk.data.is_empty() {
            if offset == 0 {
                warn!(
                    key = %descriptor.key,
                    size = descriptor.size,
                    "object was listed with a non-zero size but returned no data; skipping"
                );
                return Ok(None);
            }

            return crate::error::TruncatedObjectSnafu {
                bucket: bucket.name().to_string(),
                key: descriptor.key.clone(),
                offset,
                size: descriptor.size,
            }
            .fail();
        }

        buffer.extend_from_slice(&chunk.data);

        // The reported content-range is what terminates the loop, not the size from the
        // listing; the two can disagree if the object changed after it was listed
        if chunk.range_end + 1 >= chunk.total_size {
            break;
        }

        offset = chunk.range_end + 1;
    }

    debug!(
        key = %descriptor.key,
        bytes = buffer.len(),
        "fetched and reassembled object"
    );

    Ok(Some(FetchedObject {
        name: entry_name(&descriptor.key).to_string(),
        mtime: descriptor.last_modified,
        bytes: buffer.freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_strips_prefixes() {
        assert_eq!(entry_name("a/b/c.txt"), "c.txt");
        assert_eq!(entry_name("report.pdf"), "report.pdf");
        assert_eq!(entry_name("deeply/nested/path/to/file"), "file");
    }

    #[test]
    fn entry_name_of_directory_marker_falls_back_to_key() {
        assert_eq!(entry_name("a/b/"), "a/b/");
    }
}
