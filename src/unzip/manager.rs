use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EntryReport, UnzipContext, UnzipStrategy, normalize_prefix};
use crate::error::{Error, Result};
use crate::io::{ObjectStore, ObjectStream, ObjectSummary};
use crate::upload::UploadConfig;
use crate::util::human_bytes;
use crate::zip::ZipStreamReader;

/// What a batch does when one object fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the batch and return the error.
    #[default]
    FailFast,
    /// Record the failure and move on to the next object.
    Continue,
}

/// Result of unzipping one archive object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectReport {
    pub bucket: String,
    pub key: String,
    pub entries: Vec<EntryReport>,
}

impl ObjectReport {
    pub fn output_keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|entry| entry.output_keys.iter().map(String::as_str))
    }
}

#[derive(Debug)]
pub struct ObjectFailure {
    pub key: String,
    pub error: Error,
}

/// Result of a batch call.
#[derive(Debug, Default)]
pub struct UnzipReport {
    pub processed: Vec<ObjectReport>,
    /// Keys selected by the listing but rejected by the content-type filter.
    pub skipped: Vec<String>,
    /// Only filled under [`FailurePolicy::Continue`].
    pub failures: Vec<ObjectFailure>,
}

impl UnzipReport {
    pub fn entries_unzipped(&self) -> usize {
        self.processed.iter().map(|object| object.entries.len()).sum()
    }

    pub fn output_keys(&self) -> Vec<String> {
        self.processed
            .iter()
            .flat_map(|object| object.output_keys().map(str::to_string))
            .collect()
    }
}

/// Finds archive objects in a bucket and unzips them with a strategy.
///
/// Objects are processed one after another; entries of one archive are
/// processed in archive order. The GET body is dropped, and so closed, on
/// every exit path.
pub struct UnzipManager {
    store: Arc<dyn ObjectStore>,
    strategy: Arc<dyn UnzipStrategy>,
    content_types: Vec<String>,
    upload: UploadConfig,
    failure_policy: FailurePolicy,
    cancel: CancellationToken,
}

impl UnzipManager {
    pub fn new(store: Arc<dyn ObjectStore>, strategy: impl UnzipStrategy + 'static) -> Self {
        Self {
            store,
            strategy: Arc::new(strategy),
            content_types: vec!["application/zip".to_string()],
            upload: UploadConfig::default(),
            failure_policy: FailurePolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Allow-list of input Content-Types. An empty list accepts everything.
    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = content_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_upload_config(mut self, upload: UploadConfig) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn content_types(&self) -> &[String] {
        &self.content_types
    }

    /// Unzip one object. Fails with `InvalidContentType` if the object does
    /// not pass the content-type filter.
    pub async fn unzip_object(
        &self,
        bucket: &str,
        key: &str,
        output_prefix: &str,
    ) -> Result<ObjectReport> {
        self.validate()?;
        let object = self.store.get_object(bucket, key).await?;
        if !self.accepts(object.content_type.as_deref()) {
            return Err(Error::InvalidContentType {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: object.content_type,
            });
        }
        self.unzip_stream(bucket, key, object, output_prefix).await
    }

    /// Unzip every object under `input_prefix`.
    pub async fn unzip_objects(
        &self,
        bucket: &str,
        input_prefix: &str,
        output_prefix: &str,
    ) -> Result<UnzipReport> {
        self.unzip_selected(bucket, input_prefix, output_prefix, |_| true)
            .await
    }

    /// Unzip every object under `input_prefix` whose key contains `needle`.
    pub async fn unzip_objects_key_containing(
        &self,
        bucket: &str,
        input_prefix: &str,
        output_prefix: &str,
        needle: &str,
    ) -> Result<UnzipReport> {
        self.unzip_selected(bucket, input_prefix, output_prefix, |key| {
            key.contains(needle)
        })
        .await
    }

    /// Unzip every object under `input_prefix` whose whole key matches `pattern`.
    pub async fn unzip_objects_key_matching(
        &self,
        bucket: &str,
        input_prefix: &str,
        output_prefix: &str,
        pattern: &str,
    ) -> Result<UnzipReport> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        self.unzip_selected(bucket, input_prefix, output_prefix, |key| {
            regex.is_match(key)
        })
        .await
    }

    fn validate(&self) -> Result<()> {
        self.strategy.validate()?;
        self.upload.validate()
    }

    fn accepts(&self, content_type: Option<&str>) -> bool {
        if self.content_types.is_empty() {
            return true;
        }
        let Some(content_type) = content_type else {
            return false;
        };
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        self.content_types
            .iter()
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(media_type))
    }

    async fn unzip_selected(
        &self,
        bucket: &str,
        input_prefix: &str,
        output_prefix: &str,
        select: impl Fn(&str) -> bool + Send + Sync,
    ) -> Result<UnzipReport> {
        self.validate()?;

        let objects: Vec<ObjectSummary> = self
            .store
            .list_objects(bucket, input_prefix)
            .await?
            .into_iter()
            .filter(|object| select(&object.key))
            .collect();
        debug!(
            bucket,
            prefix = input_prefix,
            keys = ?objects.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            "found objects"
        );

        let mut report = UnzipReport::default();
        for summary in objects {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.unzip_listed(bucket, &summary, output_prefix).await {
                Ok(Some(object)) => report.processed.push(object),
                Ok(None) => report.skipped.push(summary.key),
                Err(e) if e.is_cancelled() || self.failure_policy == FailurePolicy::FailFast => {
                    return Err(e);
                }
                Err(e) => {
                    error!(bucket, key = %summary.key, error = %e, "failed to unzip object, continuing");
                    report.failures.push(ObjectFailure {
                        key: summary.key,
                        error: e,
                    });
                }
            }
        }

        info!(
            bucket,
            processed = report.processed.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            entries = report.entries_unzipped(),
            "batch finished"
        );
        Ok(report)
    }

    /// Unzip a listed object, or `None` if the content-type filter rejects it.
    async fn unzip_listed(
        &self,
        bucket: &str,
        summary: &ObjectSummary,
        output_prefix: &str,
    ) -> Result<Option<ObjectReport>> {
        if summary.content_type.is_some() && !self.accepts(summary.content_type.as_deref()) {
            debug!(key = %summary.key, content_type = ?summary.content_type, "skipping object, content type not allowed");
            return Ok(None);
        }

        let object = self.store.get_object(bucket, &summary.key).await?;
        if !self.accepts(object.content_type.as_deref()) {
            debug!(
                key = %summary.key,
                content_type = ?object.content_type,
                allowed = ?self.content_types,
                "skipping object, content type not allowed"
            );
            return Ok(None);
        }

        self.unzip_stream(bucket, &summary.key, object, output_prefix)
            .await
            .map(Some)
    }

    async fn unzip_stream(
        &self,
        bucket: &str,
        key: &str,
        object: ObjectStream,
        output_prefix: &str,
    ) -> Result<ObjectReport> {
        let ctx = UnzipContext {
            store: self.store.clone(),
            bucket: bucket.to_string(),
            output_prefix: normalize_prefix(output_prefix),
            upload: self.upload.clone(),
            cancel: self.cancel.clone(),
        };
        info!(
            bucket,
            key,
            size = %object.content_length.map(human_bytes).unwrap_or_else(|| "unknown".into()),
            output_prefix = %ctx.output_prefix,
            "unzipping object"
        );

        let mut reader = ZipStreamReader::new(object.body);
        let mut entries = Vec::new();
        while let Some(mut entry) = reader.next_entry().await? {
            ctx.check_cancelled()?;

            let start = Instant::now();
            let report = self.strategy.unzip(&mut entry, &ctx).await?;
            info!(
                entry = %report.name,
                size = %human_bytes(report.bytes),
                outputs = report.output_keys.len(),
                elapsed = ?start.elapsed(),
                "unzipped entry"
            );
            entries.push(report);
        }

        if entries.is_empty() {
            warn!(bucket, key, "archive has no file entries");
        }
        Ok(ObjectReport {
            bucket: bucket.to_string(),
            key: key.to_string(),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;
    use crate::unzip::NoSplitStrategy;

    fn manager() -> UnzipManager {
        UnzipManager::new(Arc::new(MemoryStore::new()), NoSplitStrategy)
    }

    #[test]
    fn content_type_matching() {
        let manager = manager();
        assert!(manager.accepts(Some("application/zip")));
        assert!(manager.accepts(Some("Application/ZIP; charset=binary")));
        assert!(!manager.accepts(Some("application/octet-stream")));
        assert!(!manager.accepts(None));

        let open = manager.with_content_types(Vec::<String>::new());
        assert!(open.accepts(None));
        assert!(open.accepts(Some("text/plain")));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_store_access() {
        let manager = manager()
            .with_upload_config(UploadConfig::default().with_upload_part_bytes_limit(1024));
        let err = manager
            .unzip_objects("missing-bucket", "input", "output")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn bad_pattern_is_reported() {
        let err = manager()
            .unzip_objects_key_matching("bucket", "input", "output", "(")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pattern(_)));
    }
}
