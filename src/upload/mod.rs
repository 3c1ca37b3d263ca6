//! Concurrent multipart uploads with bounded memory.
//!
//! A [`MultipartUpload`] accepts owned part payloads in call order, numbers
//! them, and hands them to a fixed pool of worker tasks through a bounded
//! queue. A full queue blocks the producer, which is what keeps the bytes in
//! flight per upload at roughly `(queue_size + thread_count + 1)` parts.

mod buffer;
mod config;
mod multipart;

pub use buffer::PartBuffer;
pub use config::{InitiateHook, UploadConfig};
pub use multipart::{MultipartUpload, UploadState};

pub const MIB: usize = 1024 * 1024;

/// Smallest part S3 accepts for anything but the last part.
pub const MIN_UPLOAD_PART_BYTES: usize = 5 * MIB;

/// Largest part S3 accepts.
pub const MAX_UPLOAD_PART_BYTES: usize = 5 * 1024 * MIB;

/// Highest part number of a multipart upload.
pub const MAX_UPLOAD_PARTS: u32 = 10_000;
