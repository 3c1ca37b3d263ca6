//! Per-entry unzip strategies and the object-level driver.

mod manager;
mod no_split;
mod split_text;

pub use manager::{FailurePolicy, ObjectFailure, ObjectReport, UnzipManager, UnzipReport};
pub use no_split::NoSplitStrategy;
pub use split_text::SplitTextStrategy;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::io::ObjectStore;
use crate::upload::{MultipartUpload, UploadConfig};
use crate::zip::ArchiveEntry;

/// Read size used when pulling decompressed bytes out of an entry.
pub(crate) const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Turns one archive entry into one or more output objects.
#[async_trait]
pub trait UnzipStrategy: Send + Sync {
    /// Check the strategy's own settings. Called once before any store access.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn unzip(&self, entry: &mut ArchiveEntry<'_>, ctx: &UnzipContext) -> Result<EntryReport>;
}

/// Where and how a strategy writes its output.
#[derive(Clone)]
pub struct UnzipContext {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    /// Always ends with `/`.
    pub output_prefix: String,
    pub upload: UploadConfig,
    pub cancel: CancellationToken,
}

impl UnzipContext {
    /// Key of the single output object of `name`.
    pub fn output_key(&self, name: &str) -> String {
        format!("{}{name}", self.output_prefix)
    }

    /// Key of the `index`-th shard of `name`, numbered from 1.
    pub fn shard_key(&self, index: u32, name: &str) -> String {
        format!("{}{index}-{name}", self.output_prefix)
    }

    /// Create and initiate an upload for `key`.
    pub async fn open_upload(&self, key: &str) -> Result<MultipartUpload> {
        let mut upload = MultipartUpload::new(
            self.store.clone(),
            &self.bucket,
            key,
            self.upload.clone(),
            self.cancel.clone(),
        )?;
        upload.initiate().await?;
        Ok(upload)
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// What a strategy produced for one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryReport {
    pub name: String,
    pub output_keys: Vec<String>,
    /// Decompressed bytes read from the entry.
    pub bytes: u64,
}

/// Append `prefix` with a trailing `/` unless it already has one.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

pub(crate) fn unzip_failed(name: &str, source: Error) -> Error {
    Error::UnzipFailed {
        name: name.to_string(),
        source: Box::new(source),
    }
}
