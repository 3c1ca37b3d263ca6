#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use s3_unzip::io::{CompletedPart, ObjectStream, ObjectSummary};
use s3_unzip::{CreateUploadRequest, MemoryStore, ObjectStore, StoreError};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

pub const BUCKET: &str = "test-bucket";
pub const MIB: usize = 1024 * 1024;

/// Wraps a [`MemoryStore`], counts calls and optionally fails the n-th
/// `upload_part` call.
pub struct CountingStore {
    pub inner: MemoryStore,
    fail_part_call: Option<usize>,
    pub gets: AtomicUsize,
    pub initiates: AtomicUsize,
    pub part_calls: AtomicUsize,
    pub completes: AtomicUsize,
    pub aborted: Mutex<Vec<String>>,
    pub completed_parts: Mutex<Vec<Vec<u32>>>,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Fail the `call`-th `upload_part` call (1-based).
    pub fn failing_part_call(call: usize) -> Arc<Self> {
        Self::build(Some(call))
    }

    fn build(fail_part_call: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            fail_part_call,
            gets: AtomicUsize::new(0),
            initiates: AtomicUsize::new(0),
            part_calls: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            aborted: Mutex::new(Vec::new()),
            completed_parts: Mutex::new(Vec::new()),
        })
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Bytes {
        self.inner
            .object(BUCKET, key)
            .unwrap_or_else(|| panic!("missing object {key}"))
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner.keys(BUCKET, prefix)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_object(bucket, key).await
    }

    async fn create_multipart_upload(
        &self,
        request: &CreateUploadRequest,
    ) -> Result<String, StoreError> {
        self.initiates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_multipart_upload(request).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        is_last: bool,
    ) -> Result<String, StoreError> {
        let call = self.part_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_part_call == Some(call) {
            return Err(StoreError::status(500, "InternalError", "injected fault"));
        }
        self.inner
            .upload_part(bucket, key, upload_id, part_number, body, is_last)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        self.completed_parts
            .lock()
            .unwrap()
            .push(parts.iter().map(|p| p.part_number).collect());
        self.inner
            .complete_multipart_upload(bucket, key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.aborted.lock().unwrap().push(upload_id.to_string());
        self.inner.abort_multipart_upload(bucket, key, upload_id).await
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectSummary>, StoreError> {
        self.inner.list_objects(bucket, prefix).await
    }
}

/// Build a ZIP archive in memory. Names ending in `/` become directories.
pub fn zip_archive(entries: &[(&str, &[u8])], method: CompressionMethod) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);

    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// `rows` lines of CSV under a `COL1, COL2, COL3, COL4` header.
pub fn csv(rows: usize) -> Vec<u8> {
    let mut out = b"COL1, COL2, COL3, COL4\n".to_vec();
    for i in 0..rows {
        writeln!(out, "{i}, value-{i}, {}, row-{}", i * 7, i % 13).unwrap();
    }
    out
}

/// Split after every `\n`, keeping the delimiter.
pub fn lines(data: &[u8]) -> Vec<&[u8]> {
    data.split_inclusive(|&b| b == b'\n').collect()
}

/// Deterministic, poorly compressible bytes.
pub fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}
