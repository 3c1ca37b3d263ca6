//! # s3-unzip
//!
//! Unzip archives stored in S3 without downloading them to disk or holding
//! them in memory.
//!
//! An archive object is read as a forward-only stream: local file headers are
//! parsed as they arrive and each entry's decompressed bytes are handed to an
//! [`UnzipStrategy`], which writes them back to the bucket through concurrent
//! multipart uploads. Memory per upload is bounded by the part size times the
//! number of parts allowed in flight.
//!
//! ## Features
//!
//! - Stored and deflate entries, data descriptors, ZIP64 sizes, CRC checks
//! - One output object per entry ([`NoSplitStrategy`]) or line-aligned text
//!   shards with an optional repeated header ([`SplitTextStrategy`])
//! - Multipart uploads with a bounded worker queue and abort on every failure path
//! - Any S3-compatible endpoint through [`S3Client`], or [`MemoryStore`] in tests
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use s3_unzip::{S3Client, S3Config, SplitTextStrategy, UnzipManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(S3Client::new(S3Config::from_env())?);
//!
//!     let strategy = SplitTextStrategy::new()
//!         .with_header(true)
//!         .with_file_bytes_limit(100 * 1024 * 1024);
//!     let report = UnzipManager::new(store, strategy)
//!         .unzip_objects("my-bucket", "input", "output")
//!         .await?;
//!
//!     for key in report.output_keys() {
//!         println!("{key}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod io;
pub mod unzip;
pub mod upload;
pub mod util;
pub mod zip;

pub use cli::Cli;
pub use error::{Error, Result, StoreError};
pub use io::{CannedAcl, CreateUploadRequest, MemoryStore, ObjectStore, S3Client, S3Config};
pub use unzip::{
    EntryReport, FailurePolicy, NoSplitStrategy, ObjectFailure, ObjectReport, SplitTextStrategy,
    UnzipContext, UnzipManager, UnzipReport, UnzipStrategy,
};
pub use upload::{MultipartUpload, UploadConfig};
pub use util::human_bytes;
pub use zip::{ArchiveEntry, ZipStreamReader};
