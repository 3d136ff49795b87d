//! An in-memory implementation of [`baler::objstore::Bucket`] so pipeline tests can run
//! hermetically, with no object storage service anywhere.
//!
//! Beyond storing objects, the bucket keeps a ledger of every listing page served, every
//! ranged read issued, and every multipart session opened, and it enforces the store-side
//! rules a real service would: parts can only be uploaded to an open session, a session
//! reaches at most one terminal state, and a completion call must list part numbers
//! ascending and gapless from 1.  Fault injection hooks let tests fail any individual
//! remote operation.
use async_trait::async_trait;
use baler::objstore::{Bucket, CompletedPartInfo, ListPage, ObjectChunk, ObjectDescriptor};
use baler::Result;
use bytes::Bytes;
use snafu::whatever;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// The recorded state of one multipart upload session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadState {
    Open,
    Completed,
    Aborted,
}

#[derive(Debug)]
struct Upload {
    key: String,
    parts: Vec<(i32, String, Bytes)>,
    state: UploadState,
}

#[derive(Debug, Default)]
struct Faults {
    read_keys: HashSet<String>,
    empty_body_keys: HashSet<String>,
    part_numbers: HashSet<i32>,
    list_page: Option<usize>,
    complete: bool,
    put: bool,
}

#[derive(Debug)]
struct State {
    objects: BTreeMap<String, Bytes>,
    page_size: usize,
    uploads: BTreeMap<String, Upload>,
    next_upload_id: usize,
    list_pages_served: usize,
    reads_by_key: HashMap<String, usize>,
    faults: Faults,
}

/// An in-memory bucket.  Clones share the same underlying state.
#[derive(Clone)]
pub struct MemoryBucket {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                page_size: 1000,
                uploads: BTreeMap::new(),
                next_upload_id: 0,
                list_pages_served: 0,
                reads_by_key: HashMap::new(),
                faults: Faults::default(),
            })),
        }
    }

    /// Serve listing pages of at most `page_size` entries instead of the default 1000,
    /// so pagination can be exercised without thousands of objects
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().unwrap().page_size = page_size.max(1);
        self
    }

    pub fn insert_object(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.into(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Every ranged read issued against `key` so far
    pub fn reads_of(&self, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .reads_by_key
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn list_pages_served(&self) -> usize {
        self.state.lock().unwrap().list_pages_served
    }

    pub fn uploads_created(&self) -> usize {
        self.state.lock().unwrap().next_upload_id
    }

    fn uploads_in_state(&self, state: UploadState) -> usize {
        self.state
            .lock()
            .unwrap()
            .uploads
            .values()
            .filter(|upload| upload.state == state)
            .count()
    }

    pub fn completed_uploads(&self) -> usize {
        self.uploads_in_state(UploadState::Completed)
    }

    pub fn aborted_uploads(&self) -> usize {
        self.uploads_in_state(UploadState::Aborted)
    }

    pub fn open_uploads(&self) -> usize {
        self.uploads_in_state(UploadState::Open)
    }

    /// The part sizes of the completed upload for `key`, in part-number order
    pub fn completed_part_sizes(&self, key: &str) -> Option<Vec<usize>> {
        let state = self.state.lock().unwrap();
        state
            .uploads
            .values()
            .find(|upload| upload.key == key && upload.state == UploadState::Completed)
            .map(|upload| {
                let mut parts = upload.parts.clone();
                parts.sort_by_key(|(number, _, _)| *number);
                parts.into_iter().map(|(_, _, data)| data.len()).collect()
            })
    }

    /// Make every read of `key` fail
    pub fn fail_reads_of(&self, key: impl Into<String>) {
        self.state.lock().unwrap().faults.read_keys.insert(key.into());
    }

    /// Make every read of `key` succeed with an empty body, the way a store with a
    /// listing/data inconsistency would
    pub fn serve_empty_body(&self, key: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .faults
            .empty_body_keys
            .insert(key.into());
    }

    /// Make the upload of the given (1-based) part number fail
    pub fn fail_part_upload(&self, part_number: i32) {
        self.state
            .lock()
            .unwrap()
            .faults
            .part_numbers
            .insert(part_number);
    }

    /// Make the Nth listing page request fail (0-based)
    pub fn fail_list_page(&self, page_index: usize) {
        self.state.lock().unwrap().faults.list_page = Some(page_index);
    }

    /// Make the multipart completion call fail
    pub fn fail_complete(&self) {
        self.state.lock().unwrap().faults.complete = true;
    }

    /// Make single-shot puts fail
    pub fn fail_put(&self) {
        self.state.lock().unwrap().faults.put = true;
    }
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ListPage> {
        let mut state = self.state.lock().unwrap();

        let page_index = state.list_pages_served;
        state.list_pages_served += 1;

        if state.faults.list_page == Some(page_index) {
            whatever!("injected failure listing page {page_index}");
        }

        let offset: usize = match continuation {
            Some(token) => match token.parse() {
                Ok(offset) => offset,
                Err(_) => whatever!("continuation token '{token}' was not issued by this bucket"),
            },
            None => 0,
        };

        let matching: Vec<(String, usize)> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| (key.clone(), data.len()))
            .collect();

        let page_size = state.page_size;
        let page = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|(key, size)| ObjectDescriptor {
                key: key.clone(),
                size: *size as u64,
                last_modified: Some(chrono::Utc::now()),
            })
            .collect::<Vec<_>>();

        let next_offset = offset + page.len();
        let continuation = if next_offset < matching.len() {
            Some(next_offset.to_string())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            continuation,
        })
    }

    async fn read_object_part(&self, key: &str, range: Range<u64>) -> Result<ObjectChunk> {
        let mut state = self.state.lock().unwrap();

        *state.reads_by_key.entry(key.to_string()).or_default() += 1;

        if state.faults.read_keys.contains(key) {
            whatever!("injected failure reading object '{key}'");
        }

        if state.faults.empty_body_keys.contains(key) {
            return Ok(ObjectChunk {
                data: Bytes::new(),
                range_end: range.start,
                total_size: range.start,
            });
        }

        let Some(data) = state.objects.get(key) else {
            whatever!("object '{key}' does not exist in bucket '{}'", self.name);
        };

        let total_size = data.len() as u64;
        if range.start >= total_size {
            whatever!(
                "range start {} is beyond the end of object '{key}' ({total_size} bytes)",
                range.start
            );
        }

        let end = range.end.min(total_size);
        let chunk = data.slice(range.start as usize..end as usize);

        Ok(ObjectChunk {
            data: chunk,
            range_end: end - 1,
            total_size,
        })
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.faults.put {
            whatever!("injected failure putting object '{key}'");
        }

        state.objects.insert(key.to_string(), data);

        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();

        let upload_id = format!("upload-{}", state.next_upload_id);
        state.next_upload_id += 1;

        state.uploads.insert(
            upload_id.clone(),
            Upload {
                key: key.to_string(),
                parts: Vec::new(),
                state: UploadState::Open,
            },
        );

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();

        if state.faults.part_numbers.contains(&part_number) {
            whatever!("injected failure uploading part {part_number} of '{key}'");
        }

        let Some(upload) = state.uploads.get_mut(upload_id) else {
            whatever!("upload '{upload_id}' does not exist");
        };
        if upload.state != UploadState::Open {
            whatever!(
                "upload '{upload_id}' is {:?}; parts can only be uploaded to an open session",
                upload.state
            );
        }

        let etag = format!("etag-{part_number}-{}", data.len());
        upload.parts.push((part_number, etag.clone(), data));

        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.faults.complete {
            whatever!("injected failure completing upload of '{key}'");
        }

        let Some(upload) = state.uploads.get(upload_id) else {
            whatever!("upload '{upload_id}' does not exist");
        };
        if upload.state != UploadState::Open {
            whatever!(
                "upload '{upload_id}' is {:?}; only an open session can be completed",
                upload.state
            );
        }

        if parts.is_empty() {
            whatever!("completion of upload '{upload_id}' listed no parts");
        }

        // Real stores reject completion calls whose part list is out of order or gapped
        for (index, part) in parts.iter().enumerate() {
            let expected = index as i32 + 1;
            if part.part_number != expected {
                whatever!(
                    "completion of upload '{upload_id}' listed part {} at position {index}; parts must be ascending and gapless from 1",
                    part.part_number
                );
            }
        }

        let mut assembled = Vec::new();
        for part in parts {
            let Some((_, _, data)) = upload
                .parts
                .iter()
                .find(|(number, etag, _)| *number == part.part_number && *etag == part.etag)
            else {
                whatever!(
                    "completion of upload '{upload_id}' listed part {} with etag '{}', which was never uploaded",
                    part.part_number,
                    part.etag
                );
            };
            assembled.extend_from_slice(data);
        }

        state
            .uploads
            .get_mut(upload_id)
            .expect("upload existence just checked")
            .state = UploadState::Completed;
        state.objects.insert(key.to_string(), Bytes::from(assembled));

        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let Some(upload) = state.uploads.get_mut(upload_id) else {
            whatever!("upload '{upload_id}' does not exist");
        };
        if upload.state != UploadState::Open {
            whatever!(
                "upload '{upload_id}' is already {:?}; a session reaches exactly one terminal state",
                upload.state
            );
        }

        upload.state = UploadState::Aborted;
        upload.parts.clear();

        Ok(())
    }
}
