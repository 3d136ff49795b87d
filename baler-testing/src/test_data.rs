//! Create test data objects in an in-memory bucket
use crate::memory::MemoryBucket;
use rand::prelude::*;
use std::collections::HashMap;

/// Description of a single test object: a key and a size.
#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object spec with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let key = key.into();

        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key,
            size: size.get_bytes() as usize,
        }
    }
}

/// Generate random contents for each test object spec and insert them into the bucket.
///
/// The return value maps each object key to the random payload that was stored under it,
/// for later comparison against archive entries.
pub fn populate_bucket(
    bucket: &MemoryBucket,
    objects: impl IntoIterator<Item = TestObject>,
) -> HashMap<String, Vec<u8>> {
    let mut rand = rand::thread_rng();
    let mut contents = HashMap::new();

    for object in objects {
        let mut data = vec![0u8; object.size];
        rand.fill(&mut data[..]);

        bucket.insert_object(object.key.clone(), data.clone());
        assert!(
            contents.insert(object.key.clone(), data).is_none(),
            "BUG: test data contains the same key '{}' more than once",
            object.key
        );
    }

    contents
}
