//! Object store capability layer.
//!
//! The pipeline only ever talks to the store through [`ObjectStore`]. Two
//! implementations ship with the crate: [`S3Client`] for any S3-compatible
//! endpoint, and [`MemoryStore`] for tests and embedding.

mod memory;
mod s3;
mod sigv4;
mod xml;

pub use memory::MemoryStore;
pub use s3::{Credentials, S3Client, S3Config};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::zip::ArchiveSource;

/// Capability surface the unzip pipeline needs from an S3-compatible store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start a streaming GET. The body is read once, front to back; dropping it closes the connection.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, StoreError>;

    /// `CreateMultipartUpload`; returns the upload id.
    async fn create_multipart_upload(
        &self,
        request: &CreateUploadRequest,
    ) -> Result<String, StoreError>;

    /// `UploadPart`; returns the part ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        is_last: bool,
    ) -> Result<String, StoreError>;

    /// `CompleteMultipartUpload` with parts in ascending part-number order.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError>;

    /// `AbortMultipartUpload`. Aborting an upload that no longer exists succeeds.
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;

    /// List every object under `prefix`, sorted by key.
    async fn list_objects(&self, bucket: &str, prefix: &str)
    -> Result<Vec<ObjectSummary>, StoreError>;
}

/// Streaming GET result.
pub struct ObjectStream {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ArchiveSource,
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    /// Listings from S3 never carry this; other stores may.
    pub content_type: Option<String>,
}

/// A part accepted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Canned ACLs accepted on `CreateMultipartUpload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannedAcl {
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    AwsExecRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
}

impl CannedAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            CannedAcl::Private => "private",
            CannedAcl::PublicRead => "public-read",
            CannedAcl::PublicReadWrite => "public-read-write",
            CannedAcl::AuthenticatedRead => "authenticated-read",
            CannedAcl::AwsExecRead => "aws-exec-read",
            CannedAcl::BucketOwnerRead => "bucket-owner-read",
            CannedAcl::BucketOwnerFullControl => "bucket-owner-full-control",
        }
    }
}

impl FromStr for CannedAcl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "private" => CannedAcl::Private,
            "public-read" => CannedAcl::PublicRead,
            "public-read-write" => CannedAcl::PublicReadWrite,
            "authenticated-read" => CannedAcl::AuthenticatedRead,
            "aws-exec-read" => CannedAcl::AwsExecRead,
            "bucket-owner-read" => CannedAcl::BucketOwnerRead,
            "bucket-owner-full-control" => CannedAcl::BucketOwnerFullControl,
            other => return Err(format!("unknown canned ACL: {other}")),
        })
    }
}

impl fmt::Display for CannedAcl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of `CreateMultipartUpload`.
///
/// The uploader fills in bucket, key, content type and ACL; callers can add
/// tags or extra headers (server-side encryption, metadata) through the
/// initiate hook of [`UploadConfig`](crate::upload::UploadConfig).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateUploadRequest {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub canned_acl: Option<CannedAcl>,
    pub tagging: Vec<(String, String)>,
    /// Additional request headers, e.g. `x-amz-server-side-encryption`.
    pub headers: BTreeMap<String, String>,
}

impl CreateUploadRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tagging.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}
