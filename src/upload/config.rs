use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{MAX_UPLOAD_PART_BYTES, MIB, MIN_UPLOAD_PART_BYTES};
use crate::error::{Error, Result};
use crate::io::{CannedAcl, CreateUploadRequest};

/// Callback run on every `CreateMultipartUpload` request before it is sent,
/// e.g. to add tags or server-side encryption headers.
pub type InitiateHook = Arc<dyn Fn(&mut CreateUploadRequest) + Send + Sync>;

/// Settings shared by every multipart upload a strategy opens.
#[derive(Clone)]
pub struct UploadConfig {
    /// How long `abort` waits for workers before stopping them.
    pub await_termination: Duration,
    /// Number of concurrent part uploads.
    pub thread_count: usize,
    /// Parts that may wait for a free worker before the producer blocks.
    pub queue_size: usize,
    /// Size at which a part is dispatched.
    pub upload_part_bytes_limit: usize,
    /// Content-Type of the output objects.
    pub content_type: Option<String>,
    pub canned_acl: Option<CannedAcl>,
    pub initiate_hook: Option<InitiateHook>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            await_termination: Duration::from_secs(2),
            thread_count: 4,
            queue_size: 4,
            upload_part_bytes_limit: 20 * MIB,
            content_type: None,
            canned_acl: None,
            initiate_hook: None,
        }
    }
}

impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("await_termination", &self.await_termination)
            .field("thread_count", &self.thread_count)
            .field("queue_size", &self.queue_size)
            .field("upload_part_bytes_limit", &self.upload_part_bytes_limit)
            .field("content_type", &self.content_type)
            .field("canned_acl", &self.canned_acl)
            .field("initiate_hook", &self.initiate_hook.is_some())
            .finish()
    }
}

impl UploadConfig {
    pub fn with_await_termination(mut self, await_termination: Duration) -> Self {
        self.await_termination = await_termination;
        self
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_upload_part_bytes_limit(mut self, limit: usize) -> Self {
        self.upload_part_bytes_limit = limit;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_canned_acl(mut self, acl: CannedAcl) -> Self {
        self.canned_acl = Some(acl);
        self
    }

    pub fn with_initiate_hook(
        mut self,
        hook: impl Fn(&mut CreateUploadRequest) + Send + Sync + 'static,
    ) -> Self {
        self.initiate_hook = Some(Arc::new(hook));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_part_bytes_limit < MIN_UPLOAD_PART_BYTES {
            return Err(Error::InvalidConfiguration(format!(
                "upload part bytes limit must be at least {MIN_UPLOAD_PART_BYTES}, got {}",
                self.upload_part_bytes_limit
            )));
        }
        if self.upload_part_bytes_limit > MAX_UPLOAD_PART_BYTES {
            return Err(Error::InvalidConfiguration(format!(
                "upload part bytes limit must be at most {MAX_UPLOAD_PART_BYTES}, got {}",
                self.upload_part_bytes_limit
            )));
        }
        if self.thread_count == 0 {
            return Err(Error::InvalidConfiguration(
                "thread count must be at least 1".into(),
            ));
        }
        if self.queue_size == 0 {
            return Err(Error::InvalidConfiguration(
                "queue size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Build the `CreateMultipartUpload` request for an output object.
    pub(crate) fn initiate_request(&self, bucket: &str, key: &str) -> CreateUploadRequest {
        let mut request = CreateUploadRequest::new(bucket, key);
        request.content_type = self.content_type.clone();
        request.canned_acl = self.canned_acl;
        if let Some(hook) = &self.initiate_hook {
            hook(&mut request);
        }
        request
    }
}
