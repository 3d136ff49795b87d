//! End-to-end tests of the archive pipeline against the in-memory object store: listing,
//! bounded fetching, archive encoding, chunked multipart upload, the single-put fallback,
//! and the failure/abort paths.
use crate::Result;
use assert_matches::assert_matches;
use baler::{
    ArchiveError, ArchiveJobBuilder, ArchiveSummary, Config, SourcePrefix, TargetObject,
    UploadMethod,
};
use baler_testing::tar::{assert_archive_contents, read_archive_entries};
use baler_testing::test_data::{populate_bucket, TestObject};
use baler_testing::MemoryBucket;

const DEST_KEY: &str = "archives/out.tar.gz";

/// A config with part size and download window small enough that modest test data
/// exercises the multipart and ranged-read paths
fn small_parts_config() -> Config {
    Config {
        part_size: byte_unit::Byte::from_bytes(256 * 1024),
        download_window: byte_unit::Byte::from_bytes(256 * 1024),
        ..Config::default()
    }
}

async fn run_job(
    config: Config,
    source: &MemoryBucket,
    prefix: &str,
    dest: &MemoryBucket,
) -> baler::Result<ArchiveSummary> {
    let job = ArchiveJobBuilder::new(
        config,
        SourcePrefix::Bucket {
            bucket: Box::new(source.clone()),
            prefix: prefix.to_string(),
        },
        TargetObject::Bucket {
            bucket: Box::new(dest.clone()),
            key: DEST_KEY.to_string(),
        },
    )
    .build()
    .await?;

    job.run().await
}

/// Source prefix with objects of sizes {0, 2 MiB, 1 KiB}: the zero-size object is
/// excluded, the other two end up in the archive byte-identical, and because the combined
/// output is smaller than one (default 5 MiB) part, the destination is written with the
/// single-put fallback and the provisional multipart session is aborted, never left open.
#[tokio::test(flavor = "multi_thread")]
async fn mixed_sizes_take_single_put_fallback() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let contents = populate_bucket(
        &source,
        [
            TestObject::new("docs/empty.bin", "0"),
            TestObject::new("docs/big.bin", "2MiB"),
            TestObject::new("docs/small.txt", "1KiB"),
        ],
    );

    let summary = run_job(Config::default(), &source, "docs/", &dest).await?;

    assert_eq!(summary.objects_archived, 2);
    assert_eq!(summary.objects_skipped, 0);
    assert_eq!(summary.upload.method, UploadMethod::SinglePut);

    // The session that was provisionally opened must have been aborted, not left open
    assert_eq!(dest.uploads_created(), 1);
    assert_eq!(dest.aborted_uploads(), 1);
    assert_eq!(dest.completed_uploads(), 0);
    assert_eq!(dest.open_uploads(), 0);

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    assert_eq!(summary.upload.bytes_uploaded, archive.len() as u64);
    assert_archive_contents(
        &archive,
        &[
            ("big.bin", &contents["docs/big.bin"]),
            ("small.txt", &contents["docs/small.txt"]),
        ],
    );

    Ok(())
}

/// An archive bigger than one part goes through the multipart path: every part except the
/// last is exactly the part size, the completion call succeeds (the store enforces
/// ascending gapless part numbers), and the concatenated parts are byte-identical to the
/// archive stream — which is proven by the re-assembled destination object decoding back
/// into exactly the source objects.
#[tokio::test(flavor = "multi_thread")]
async fn large_archive_uses_multipart_upload() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let objects = (0..8)
        .map(|i| TestObject::new(format!("data/blob-{i:02}.bin"), "200KiB"))
        .collect::<Vec<_>>();
    let contents = populate_bucket(&source, objects);

    let summary = run_job(small_parts_config(), &source, "data/", &dest).await?;

    assert_eq!(summary.objects_archived, 8);
    assert_eq!(summary.upload.method, UploadMethod::Multipart);
    assert!(summary.upload.parts > 1, "expected a multi-part archive");

    assert_eq!(dest.uploads_created(), 1);
    assert_eq!(dest.completed_uploads(), 1);
    assert_eq!(dest.aborted_uploads(), 0);

    // Every part except the final one is exactly the configured part size
    let part_sizes = dest
        .completed_part_sizes(DEST_KEY)
        .expect("no completed upload for the destination key");
    let (last, full) = part_sizes.split_last().unwrap();
    assert!(full.iter().all(|size| *size == 256 * 1024));
    assert!(*last <= 256 * 1024 && *last > 0);

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    assert_eq!(summary.upload.bytes_uploaded, archive.len() as u64);
    assert_eq!(
        part_sizes.iter().sum::<usize>(),
        archive.len(),
        "concatenated parts must equal the archive stream"
    );

    let expected = contents
        .iter()
        .map(|(key, data)| (key.rsplit('/').next().unwrap(), data.as_slice()))
        .collect::<Vec<_>>();
    assert_archive_contents(&archive, &expected);

    Ok(())
}

/// An empty filtered object set terminates in `NoObjectsFound` without ever creating a
/// multipart session.
#[tokio::test(flavor = "multi_thread")]
async fn empty_prefix_is_no_objects_found() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let error = run_job(Config::default(), &source, "nothing/", &dest)
        .await
        .unwrap_err();

    assert_matches!(error, ArchiveError::NoObjectsFound { .. });
    assert_eq!(dest.uploads_created(), 0);
    assert!(dest.object(DEST_KEY).is_none());

    Ok(())
}

/// Zero-size objects are filtered before fetch, so a prefix holding only those is just as
/// empty as one holding nothing.
#[tokio::test(flavor = "multi_thread")]
async fn all_zero_size_objects_is_no_objects_found() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    for i in 0..3 {
        source.insert_object(format!("markers/m{i}"), Vec::new());
    }

    let error = run_job(Config::default(), &source, "markers/", &dest)
        .await
        .unwrap_err();

    assert_matches!(error, ArchiveError::NoObjectsFound { .. });
    assert_eq!(dest.uploads_created(), 0);

    Ok(())
}

/// A failed listing page is a listing error that short-circuits the run; it must never
/// fall through to "no objects found".
#[tokio::test(flavor = "multi_thread")]
async fn listing_failure_is_not_no_objects_found() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    populate_bucket(&source, [TestObject::new("data/a.bin", "1KiB")]);
    source.fail_list_page(0);

    let error = run_job(Config::default(), &source, "data/", &dest)
        .await
        .unwrap_err();

    assert!(
        !matches!(error, ArchiveError::NoObjectsFound { .. }),
        "a listing failure must not be reported as an empty prefix, got: {error}"
    );
    assert_eq!(dest.uploads_created(), 0);

    Ok(())
}

/// With more objects than fit in one listing page, the lister chains continuation tokens
/// and returns the union of all pages with no duplicates and no omissions.
#[tokio::test(flavor = "multi_thread")]
async fn listing_paginates_with_continuation_tokens() -> Result<()> {
    let source = MemoryBucket::new("source").with_page_size(10);
    let dest = MemoryBucket::new("dest");

    let objects = (0..25)
        .map(|i| TestObject::new(format!("pages/obj-{i:02}.bin"), "1KiB"))
        .collect::<Vec<_>>();
    let contents = populate_bucket(&source, objects);

    let summary = run_job(Config::default(), &source, "pages/", &dest).await?;

    assert_eq!(source.list_pages_served(), 3);
    assert_eq!(summary.objects_archived, 25);

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    let expected = contents
        .iter()
        .map(|(key, data)| (key.rsplit('/').next().unwrap(), data.as_slice()))
        .collect::<Vec<_>>();
    assert_archive_contents(&archive, &expected);

    Ok(())
}

/// An object larger than the download window is fetched with sequential ranged reads and
/// reassembled byte-identically; the loop issues exactly ceil(size / window) requests,
/// stopping when the reported range end reaches the declared length minus one.  A small
/// object takes exactly one request.
#[tokio::test(flavor = "multi_thread")]
async fn large_objects_are_fetched_in_ranges_and_reassembled() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let contents = populate_bucket(
        &source,
        [
            TestObject::new("data/large.bin", "900KiB"),
            TestObject::new("data/small.bin", "10KiB"),
        ],
    );

    let summary = run_job(small_parts_config(), &source, "data/", &dest).await?;

    assert_eq!(summary.objects_archived, 2);
    // 900 KiB through a 256 KiB window is four sequential ranged reads
    assert_eq!(source.reads_of("data/large.bin"), 4);
    assert_eq!(source.reads_of("data/small.bin"), 1);

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    assert_archive_contents(
        &archive,
        &[
            ("large.bin", &contents["data/large.bin"]),
            ("small.bin", &contents["data/small.bin"]),
        ],
    );

    Ok(())
}

/// Fifty objects through a fetch pool bounded at 20: every object must be appended before
/// the archive footer is written, which decoding the archive proves (entries can't follow
/// the footer), regardless of the order fetches completed in.
#[tokio::test(flavor = "multi_thread")]
async fn all_fetches_complete_before_finalize() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let objects = (0..50)
        .map(|i| TestObject::new(format!("bulk/obj-{i:02}.bin"), "32KiB"))
        .collect::<Vec<_>>();
    let contents = populate_bucket(&source, objects);

    let summary = run_job(small_parts_config(), &source, "bulk/", &dest).await?;

    assert_eq!(summary.objects_archived, 50);

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    let entries = read_archive_entries(&archive)?;
    assert_eq!(entries.len(), 50);

    // Set-equality, not order: archive entry order is completion order by design
    let mut actual_names = entries.iter().map(|e| e.name.clone()).collect::<Vec<_>>();
    actual_names.sort();
    let mut expected_names = contents
        .keys()
        .map(|key| key.rsplit('/').next().unwrap().to_string())
        .collect::<Vec<_>>();
    expected_names.sort();
    assert_eq!(actual_names, expected_names);

    for entry in entries {
        let source_data = &contents[&format!("bulk/{}", entry.name)];
        assert_eq!(&entry.data, source_data, "entry '{}' corrupted", entry.name);
    }

    Ok(())
}

/// Objects in different "directories" that share a basename all land in the archive under
/// that basename; nothing is deduplicated or renamed.
#[tokio::test(flavor = "multi_thread")]
async fn colliding_basenames_are_both_archived() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let contents = populate_bucket(
        &source,
        [
            TestObject::new("tree/a/data.bin", "1KiB"),
            TestObject::new("tree/b/data.bin", "2KiB"),
        ],
    );

    let summary = run_job(Config::default(), &source, "tree/", &dest).await?;
    assert_eq!(summary.objects_archived, 2);

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    let entries = read_archive_entries(&archive)?;

    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry.name == "data.bin"));

    // Entry order isn't guaranteed, so match by size
    let mut actual_sizes = entries.iter().map(|e| e.data.len()).collect::<Vec<_>>();
    actual_sizes.sort();
    assert_eq!(actual_sizes, vec![1024, 2048]);
    for entry in &entries {
        let expected = contents
            .values()
            .find(|data| data.len() == entry.data.len())
            .unwrap();
        assert_eq!(&entry.data, expected);
    }

    Ok(())
}

/// An object the listing reported as non-empty but whose body comes back empty is skipped
/// with a warning; the rest of the archive is unaffected.
#[tokio::test(flavor = "multi_thread")]
async fn empty_body_objects_are_skipped() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let contents = populate_bucket(
        &source,
        [
            TestObject::new("data/ok-1.bin", "4KiB"),
            TestObject::new("data/gone.bin", "4KiB"),
            TestObject::new("data/ok-2.bin", "4KiB"),
        ],
    );
    source.serve_empty_body("data/gone.bin");

    let summary = run_job(Config::default(), &source, "data/", &dest).await?;

    assert_eq!(summary.objects_archived, 2);
    assert_eq!(summary.objects_skipped, 1);

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    assert_archive_contents(
        &archive,
        &[
            ("ok-1.bin", &contents["data/ok-1.bin"]),
            ("ok-2.bin", &contents["data/ok-2.bin"]),
        ],
    );

    Ok(())
}

/// A single failed fetch is fatal to the whole run: the upload session is aborted, never
/// completed, and no destination object appears.
#[tokio::test(flavor = "multi_thread")]
async fn fetch_failure_aborts_the_run() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    populate_bucket(
        &source,
        [
            TestObject::new("data/a.bin", "64KiB"),
            TestObject::new("data/b.bin", "64KiB"),
            TestObject::new("data/c.bin", "64KiB"),
        ],
    );
    source.fail_reads_of("data/b.bin");

    let error = run_job(small_parts_config(), &source, "data/", &dest)
        .await
        .unwrap_err();

    assert_matches!(error, ArchiveError::Whatever { .. });
    assert_eq!(dest.uploads_created(), 1);
    assert_eq!(dest.aborted_uploads(), 1);
    assert_eq!(dest.completed_uploads(), 0);
    assert_eq!(dest.open_uploads(), 0);
    assert!(dest.object(DEST_KEY).is_none());

    Ok(())
}

/// A failed part upload is fatal: the session is aborted (never left open) and the
/// uploader's error is the one surfaced, not the broken-pipe symptom the encoder sees.
#[tokio::test(flavor = "multi_thread")]
async fn part_upload_failure_aborts_the_run() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let objects = (0..6)
        .map(|i| TestObject::new(format!("data/blob-{i}.bin"), "200KiB"))
        .collect::<Vec<_>>();
    populate_bucket(&source, objects);

    dest.fail_part_upload(2);

    let error = run_job(small_parts_config(), &source, "data/", &dest)
        .await
        .unwrap_err();

    assert!(
        error.to_string().contains("part 2"),
        "expected the part upload failure to surface, got: {error}"
    );
    assert_eq!(dest.aborted_uploads(), 1);
    assert_eq!(dest.completed_uploads(), 0);
    assert_eq!(dest.open_uploads(), 0);
    assert!(dest.object(DEST_KEY).is_none());

    Ok(())
}

/// A failed completion call aborts the session too.
#[tokio::test(flavor = "multi_thread")]
async fn completion_failure_aborts_the_run() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    let objects = (0..6)
        .map(|i| TestObject::new(format!("data/blob-{i}.bin"), "200KiB"))
        .collect::<Vec<_>>();
    populate_bucket(&source, objects);

    dest.fail_complete();

    let error = run_job(small_parts_config(), &source, "data/", &dest)
        .await
        .unwrap_err();

    assert!(
        error.to_string().contains("completing"),
        "expected the completion failure to surface, got: {error}"
    );
    assert_eq!(dest.aborted_uploads(), 1);
    assert_eq!(dest.completed_uploads(), 0);
    assert!(dest.object(DEST_KEY).is_none());

    Ok(())
}

/// The archive stream is compressed: an archive of highly compressible objects comes out
/// smaller than the sum of its inputs.
#[tokio::test(flavor = "multi_thread")]
async fn archive_output_is_compressed() -> Result<()> {
    let source = MemoryBucket::new("source");
    let dest = MemoryBucket::new("dest");

    // Not random data: a constant payload compresses to almost nothing
    source.insert_object("data/zeros.bin", vec![0u8; 1024 * 1024]);

    let summary = run_job(Config::default(), &source, "data/", &dest).await?;

    let archive = dest.object(DEST_KEY).expect("destination object missing");
    assert!(
        archive.len() < 64 * 1024,
        "1MiB of zeros should compress far below 64KiB, got {} bytes",
        archive.len()
    );
    assert_eq!(summary.upload.bytes_uploaded, archive.len() as u64);

    let entries = read_archive_entries(&archive)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data, vec![0u8; 1024 * 1024]);

    Ok(())
}
