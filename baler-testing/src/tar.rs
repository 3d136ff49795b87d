//! Test helpers for decoding the tar.gz archives the pipeline produces, so their contents
//! can be validated against expected test data.
use crate::Result;
use flate2::read::GzDecoder;
use std::io::Read;

/// One entry decoded out of an archive.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub name: String,
    pub mtime: u64,
    pub data: Vec<u8>,
}

/// Decode a complete `.tar.gz` byte buffer into its entries, in archive order.
pub fn read_archive_entries(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));

    let mut entries = Vec::new();
    for result in archive.entries()? {
        let mut entry = result?;

        let name = entry.path()?.display().to_string();
        let mtime = entry.header().mtime()?;

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        entries.push(ArchiveEntry { name, mtime, data });
    }

    Ok(entries)
}

/// Decode an archive and assert that its entries are exactly `expected`, compared as
/// (entry name → contents) with no regard for entry order.
#[track_caller]
pub fn assert_archive_contents(bytes: &[u8], expected: &[(&str, &[u8])]) {
    let entries = read_archive_entries(bytes).expect("archive did not decode");

    let mut actual: Vec<(String, Vec<u8>)> = entries
        .into_iter()
        .map(|entry| (entry.name, entry.data))
        .collect();
    actual.sort_by(|a, b| a.0.cmp(&b.0));

    let mut expected: Vec<(String, Vec<u8>)> = expected
        .iter()
        .map(|(name, data)| (name.to_string(), data.to_vec()))
        .collect();
    expected.sort_by(|a, b| a.0.cmp(&b.0));

    let actual_names: Vec<_> = actual.iter().map(|(name, _)| name.clone()).collect();
    let expected_names: Vec<_> = expected.iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(
        actual_names, expected_names,
        "archive entry names don't match expected"
    );

    for ((name, actual_data), (_, expected_data)) in actual.iter().zip(expected.iter()) {
        assert_eq!(
            actual_data, expected_data,
            "contents of archive entry '{name}' don't match the source object"
        );
    }
}
