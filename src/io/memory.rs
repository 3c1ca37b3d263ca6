use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{CompletedPart, CreateUploadRequest, ObjectStore, ObjectStream, ObjectSummary};
use crate::error::StoreError;
use crate::upload::{MAX_UPLOAD_PARTS, MIN_UPLOAD_PART_BYTES};

/// Object store held entirely in process memory.
///
/// Follows the S3 multipart rules closely enough to catch pipeline bugs:
/// non-final parts under 5 MiB, unknown parts and out-of-order part lists are
/// all rejected at completion time, just as S3 would.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    etag: String,
}

struct PendingUpload {
    bucket: String,
    key: String,
    request: CreateUploadRequest,
    parts: BTreeMap<u32, (Bytes, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object directly, creating the bucket if needed.
    pub fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        content_type: Option<&str>,
    ) {
        let data = data.into();
        let etag = quoted_md5(&data);
        self.lock().buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.map(str::to_string),
                etag,
            },
        );
    }

    /// Contents of an object, if it exists.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .and_then(|object| object.content_type.clone())
    }

    pub fn etag(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.etag.clone())
    }

    /// Keys under `prefix`, sorted.
    pub fn keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .keys()
                    .filter(|key| key.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Multipart uploads that were initiated but neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn no_such_bucket(bucket: &str) -> StoreError {
    StoreError::status(404, "NoSuchBucket", format!("bucket {bucket} does not exist"))
}

fn no_such_upload(upload_id: &str) -> StoreError {
    StoreError::status(404, "NoSuchUpload", format!("upload {upload_id} does not exist"))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, StoreError> {
        let inner = self.lock();
        let objects = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        let object = objects.get(key).ok_or_else(|| {
            StoreError::status(404, "NoSuchKey", format!("key {key} does not exist"))
        })?;

        Ok(ObjectStream {
            content_type: object.content_type.clone(),
            content_length: Some(object.data.len() as u64),
            body: Box::pin(std::io::Cursor::new(object.data.clone())),
        })
    }

    async fn create_multipart_upload(
        &self,
        request: &CreateUploadRequest,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.next_upload_id += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: request.bucket.clone(),
                key: request.key.clone(),
                request: request.clone(),
                parts: BTreeMap::new(),
            },
        );
        debug!(bucket = %request.bucket, key = %request.key, upload_id = %upload_id, "created upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        _is_last: bool,
    ) -> Result<String, StoreError> {
        if !(1..=MAX_UPLOAD_PARTS).contains(&part_number) {
            return Err(StoreError::status(
                400,
                "InvalidArgument",
                format!("part number {part_number} out of range"),
            ));
        }

        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.bucket == bucket && upload.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;

        let etag = quoted_md5(&body);
        upload.parts.insert(part_number, (body, etag.clone()));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get(upload_id)
            .filter(|upload| upload.bucket == bucket && upload.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() {
            return Err(StoreError::status(
                400,
                "MalformedXML",
                "at least one part must be specified",
            ));
        }
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StoreError::status(
                400,
                "InvalidPartOrder",
                "parts must be listed in ascending order",
            ));
        }

        let mut data = BytesMut::new();
        let mut digests = Vec::with_capacity(parts.len() * 16);
        for (index, part) in parts.iter().enumerate() {
            let (body, etag) = upload
                .parts
                .get(&part.part_number)
                .filter(|(_, etag)| *etag == part.etag)
                .ok_or_else(|| {
                    StoreError::status(
                        400,
                        "InvalidPart",
                        format!("part {} not found or ETag mismatch", part.part_number),
                    )
                })?;

            if index + 1 < parts.len() && body.len() < MIN_UPLOAD_PART_BYTES {
                return Err(StoreError::status(
                    400,
                    "EntityTooSmall",
                    format!(
                        "part {} is {} bytes, below the minimum allowed size",
                        part.part_number,
                        body.len()
                    ),
                ));
            }

            data.extend_from_slice(body);
            let raw = hex::decode(etag.trim_matches('"')).unwrap_or_default();
            digests.extend_from_slice(&raw);
        }

        let etag = format!(
            "\"{}-{}\"",
            hex::encode(Md5::digest(&digests)),
            parts.len()
        );
        let content_type = upload.request.content_type.clone();
        inner.uploads.remove(upload_id);

        inner.buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.freeze(),
                content_type,
                etag,
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.lock().uploads.remove(upload_id);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectSummary>, StoreError> {
        let inner = self.lock();
        let objects = inner.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size: object.data.len() as u64,
                content_type: object.content_type.clone(),
            })
            .collect())
    }
}
