use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{MAX_UPLOAD_PARTS, MIN_UPLOAD_PART_BYTES, UploadConfig};
use crate::error::{Error, Result};
use crate::io::{CompletedPart, ObjectStore};

/// Lifecycle of a [`MultipartUpload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    New,
    Open,
    Completed,
    Aborted,
}

/// A part waiting for a worker.
struct PartTask {
    part_number: u32,
    body: Bytes,
    is_last: bool,
}

/// State shared between the producer and the upload workers.
struct Session {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    upload_id: String,
    aborting: AtomicBool,
    abort_issued: AtomicBool,
    parts: Mutex<Vec<CompletedPart>>,
    failure: Mutex<Option<Error>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Keep the first failure and mark the session aborting.
    fn record_failure(&self, err: Error) {
        self.aborting.store(true, Ordering::Release);
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn take_failure(&self) -> Option<Error> {
        lock(&self.failure).take()
    }

    fn record_part(&self, part_number: u32, etag: String) {
        lock(&self.parts).push(CompletedPart { part_number, etag });
    }

    /// Abort the upload at the store, at most once per session.
    async fn abort_remote(&self) {
        self.aborting.store(true, Ordering::Release);
        if self.abort_issued.swap(true, Ordering::AcqRel) {
            return;
        }

        match self
            .store
            .abort_multipart_upload(&self.bucket, &self.key, &self.upload_id)
            .await
        {
            Ok(()) => info!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %self.upload_id,
                "aborted multipart upload"
            ),
            Err(e) => warn!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %self.upload_id,
                error = %e,
                "failed to abort multipart upload"
            ),
        }
    }
}

async fn run_worker(session: Arc<Session>, queue: Arc<tokio::sync::Mutex<mpsc::Receiver<PartTask>>>) {
    loop {
        let task = queue.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };

        if session.is_aborting() {
            debug!(part_number = task.part_number, "upload aborting, skipping part");
            continue;
        }

        let size = task.body.len();
        let result = session
            .store
            .upload_part(
                &session.bucket,
                &session.key,
                &session.upload_id,
                task.part_number,
                task.body,
                task.is_last,
            )
            .await;

        match result {
            Ok(etag) => {
                debug!(
                    key = %session.key,
                    part_number = task.part_number,
                    bytes = size,
                    etag = %etag,
                    "uploaded part"
                );
                session.record_part(task.part_number, etag);
            }
            Err(e) => {
                error!(
                    key = %session.key,
                    upload_id = %session.upload_id,
                    part_number = task.part_number,
                    error = %e,
                    "part upload failed"
                );
                session.record_failure(e.into());
                session.abort_remote().await;
            }
        }
    }
}

/// One multipart upload of one output object.
///
/// Parts are numbered in call order and uploaded by `thread_count` workers.
/// Every exit path other than a successful [`upload_final_part`] aborts the
/// upload at the store, including dropping an open upload.
///
/// [`upload_final_part`]: MultipartUpload::upload_final_part
pub struct MultipartUpload {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    config: UploadConfig,
    cancel: CancellationToken,
    state: UploadState,
    session: Option<Arc<Session>>,
    sender: Option<mpsc::Sender<PartTask>>,
    workers: JoinSet<()>,
    next_part_number: u32,
}

impl MultipartUpload {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        config: UploadConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
            config,
            cancel,
            state: UploadState::New,
            session: None,
            sender: None,
            workers: JoinSet::new(),
            next_part_number: 1,
        })
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.upload_id.as_str())
    }

    /// Number of parts handed to the workers so far.
    pub fn parts_submitted(&self) -> u32 {
        self.next_part_number - 1
    }

    /// Create the upload at the store and start the workers.
    pub async fn initiate(&mut self) -> Result<()> {
        if self.state != UploadState::New {
            return Err(Error::InvalidState(format!(
                "initiate called on {:?} upload",
                self.state
            )));
        }

        let request = self.config.initiate_request(&self.bucket, &self.key);
        let upload_id = match self.store.create_multipart_upload(&request).await {
            Ok(upload_id) => upload_id,
            Err(source) => {
                self.state = UploadState::Aborted;
                return Err(Error::InitiationFailed {
                    bucket: self.bucket.clone(),
                    key: self.key.clone(),
                    source,
                });
            }
        };

        let session = Arc::new(Session {
            store: self.store.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id,
            aborting: AtomicBool::new(false),
            abort_issued: AtomicBool::new(false),
            parts: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        });

        let (sender, receiver) = mpsc::channel(self.config.queue_size);
        let queue = Arc::new(tokio::sync::Mutex::new(receiver));
        for _ in 0..self.config.thread_count {
            self.workers.spawn(run_worker(session.clone(), queue.clone()));
        }

        info!(
            bucket = %self.bucket,
            key = %self.key,
            upload_id = %session.upload_id,
            "initiated multipart upload"
        );
        self.session = Some(session);
        self.sender = Some(sender);
        self.state = UploadState::Open;
        Ok(())
    }

    /// Queue a non-final part. Blocks while the queue is full.
    pub async fn upload_part(&mut self, body: Bytes) -> Result<()> {
        self.ensure_open("upload_part")?;
        match self.submit_part(body, false).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Queue the last part (possibly empty), wait for every part, then
    /// complete the upload.
    pub async fn upload_final_part(&mut self, body: Bytes) -> Result<()> {
        self.ensure_open("upload_final_part")?;
        match self.finish(body).await {
            Ok(()) => {
                self.state = UploadState::Completed;
                info!(
                    bucket = %self.bucket,
                    key = %self.key,
                    parts = self.parts_submitted(),
                    "completed multipart upload"
                );
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Abort the upload. Safe to call in any state and more than once; store
    /// errors are logged, not returned.
    pub async fn abort(&mut self) {
        match self.state {
            UploadState::Aborted | UploadState::Completed => return,
            UploadState::New | UploadState::Open => {}
        }
        self.state = UploadState::Aborted;

        if let Some(session) = &self.session {
            session.abort_remote().await;
        }

        self.sender = None;
        let wait = self.config.await_termination;
        let workers = &mut self.workers;
        let drained = tokio::time::timeout(wait, async move {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(key = %self.key, ?wait, "upload workers did not stop in time, cancelling them");
            self.workers.abort_all();
        }
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.state != UploadState::Open {
            return Err(Error::InvalidState(format!(
                "{operation} called on {:?} upload",
                self.state
            )));
        }
        Ok(())
    }

    fn check_failed(&self) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        if !session.is_aborting() {
            return Ok(());
        }
        Err(session
            .take_failure()
            .unwrap_or_else(|| Error::InvalidState("upload is aborting".into())))
    }

    async fn submit_part(&mut self, body: Bytes, is_last: bool) -> Result<()> {
        self.check_failed()?;

        let limit = self.config.upload_part_bytes_limit;
        if body.len() > limit {
            return Err(Error::PartTooLarge {
                size: body.len(),
                max: limit,
            });
        }
        if !is_last && body.len() < MIN_UPLOAD_PART_BYTES {
            return Err(Error::PartTooSmall {
                size: body.len(),
                min: MIN_UPLOAD_PART_BYTES,
            });
        }

        let part_number = self.next_part_number;
        if part_number > MAX_UPLOAD_PARTS {
            return Err(Error::PartLimitExceeded {
                max: MAX_UPLOAD_PARTS,
            });
        }

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::InvalidState("upload workers are not running".into()))?;
        let size = body.len();
        let task = PartTask {
            part_number,
            body,
            is_last,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            sent = sender.send(task) => {
                sent.map_err(|_| Error::InvalidState("upload workers have stopped".into()))?;
            }
        }

        self.next_part_number += 1;
        debug!(key = %self.key, part_number, bytes = size, is_last, "queued part");
        Ok(())
    }

    async fn finish(&mut self, body: Bytes) -> Result<()> {
        // A completed upload needs at least one part, even an empty one.
        if !body.is_empty() || self.next_part_number == 1 {
            self.submit_part(body, true).await?;
        }

        self.sender = None;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                joined = self.workers.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        return Err(Error::InvalidState(format!("upload worker failed: {e}")));
                    }
                },
            }
        }
        self.check_failed()?;

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::InvalidState("upload has no session".into()))?;
        let mut parts = lock(&session.parts).clone();
        parts.sort_by_key(|part| part.part_number);
        let expected = self.next_part_number - 1;
        if parts.len() != expected as usize
            || parts
                .iter()
                .zip(1..)
                .any(|(part, number)| part.part_number != number)
        {
            return Err(Error::InvalidState(format!(
                "{} of {expected} parts acknowledged",
                parts.len()
            )));
        }

        self.store
            .complete_multipart_upload(&self.bucket, &self.key, &session.upload_id, &parts)
            .await?;
        Ok(())
    }

    /// Abort and wrap `cause` with the upload coordinates.
    async fn fail(&mut self, cause: Error) -> Error {
        self.abort().await;
        if cause.is_cancelled() {
            return cause;
        }
        Error::UploadAborted {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id().map(str::to_string),
            source: Box::new(cause),
        }
    }
}

impl Drop for MultipartUpload {
    fn drop(&mut self) {
        if self.state != UploadState::Open {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        warn!(key = %self.key, upload_id = %session.upload_id, "open upload dropped, aborting");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.abort_remote().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::io::{CreateUploadRequest, MemoryStore, ObjectStream, ObjectSummary};
    use crate::upload::MIB;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Memory store whose part uploads wait for a permit, and which can be
    /// told to fail a given part number.
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
        fail_part: Option<u32>,
        aborts: AtomicUsize,
        completes: AtomicUsize,
    }

    impl GatedStore {
        fn new(permits: usize, fail_part: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                gate: Semaphore::new(permits),
                fail_part,
                aborts: AtomicUsize::new(0),
                completes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ObjectStore for GatedStore {
        async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, StoreError> {
            self.inner.get_object(bucket, key).await
        }

        async fn create_multipart_upload(
            &self,
            request: &CreateUploadRequest,
        ) -> Result<String, StoreError> {
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
            self.gate.acquire().await.unwrap().forget();
            if self.fail_part == Some(part_number) {
                return Err(StoreError::status(500, "InternalError", "injected"));
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
            self.aborts.fetch_add(1, Ordering::SeqCst);
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

    fn config() -> UploadConfig {
        UploadConfig::default()
            .with_upload_part_bytes_limit(5 * MIB)
            .with_thread_count(2)
            .with_queue_size(1)
            .with_await_termination(Duration::from_millis(200))
    }

    fn part(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 5 * MIB])
    }

    async fn open(store: Arc<GatedStore>, config: UploadConfig) -> MultipartUpload {
        let mut upload =
            MultipartUpload::new(store, "bucket", "out/a.bin", config, CancellationToken::new())
                .unwrap();
        upload.initiate().await.unwrap();
        upload
    }

    #[tokio::test]
    async fn uploads_parts_in_order() {
        let store = GatedStore::new(usize::MAX >> 4, None);
        let mut upload = open(store.clone(), config()).await;

        upload.upload_part(part(1)).await.unwrap();
        upload.upload_part(part(2)).await.unwrap();
        upload.upload_final_part(Bytes::from_static(b"tail")).await.unwrap();

        assert_eq!(upload.state(), UploadState::Completed);
        let object = store.inner.object("bucket", "out/a.bin").unwrap();
        assert_eq!(object.len(), 10 * MIB + 4);
        assert_eq!(object[0], 1);
        assert_eq!(object[5 * MIB], 2);
        assert_eq!(&object[10 * MIB..], b"tail");
        assert_eq!(store.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_upload_completes_with_one_part() {
        let store = GatedStore::new(usize::MAX >> 4, None);
        let mut upload = open(store.clone(), config()).await;

        upload.upload_final_part(Bytes::new()).await.unwrap();

        assert_eq!(upload.parts_submitted(), 1);
        assert_eq!(store.inner.object("bucket", "out/a.bin").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn producer_blocks_when_queue_is_full() {
        let store = GatedStore::new(0, None);
        let mut upload = open(store.clone(), config()).await;

        // Two workers hold a part each and one part waits in the queue.
        for byte in 1..=3 {
            tokio::time::timeout(Duration::from_secs(5), upload.upload_part(part(byte)))
                .await
                .expect("part should be accepted")
                .unwrap();
        }
        let blocked =
            tokio::time::timeout(Duration::from_millis(200), upload.upload_part(part(4))).await;
        assert!(blocked.is_err());
        assert_eq!(upload.parts_submitted(), 3);

        store.gate.add_permits(16);
        upload.upload_part(part(4)).await.unwrap();
        upload.upload_final_part(Bytes::new()).await.unwrap();
        assert_eq!(
            store.inner.object("bucket", "out/a.bin").unwrap().len(),
            20 * MIB
        );
    }

    #[tokio::test]
    async fn failed_part_aborts_once_and_never_completes() {
        let store = GatedStore::new(usize::MAX >> 4, Some(2));
        let mut upload = open(store.clone(), config()).await;

        let mut result = Ok(());
        for byte in 1..=4 {
            result = upload.upload_part(part(byte)).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = upload.upload_final_part(Bytes::new()).await;
        }

        let err = result.unwrap_err();
        assert!(matches!(err, Error::UploadAborted { .. }));
        assert!(matches!(err.root_cause(), Error::Store(_)));
        assert_eq!(upload.state(), UploadState::Aborted);
        assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(store.completes.load(Ordering::SeqCst), 0);
        assert_eq!(store.inner.pending_uploads(), 0);

        upload.abort().await;
        assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn small_part_aborts() {
        let store = GatedStore::new(usize::MAX >> 4, None);
        let mut upload = open(store.clone(), config()).await;

        let err = upload
            .upload_part(Bytes::from_static(b"small"))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), Error::PartTooSmall { .. }));
        assert_eq!(upload.state(), UploadState::Aborted);
        assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
        assert!(upload.upload_part(part(1)).await.is_err());
    }

    #[tokio::test]
    async fn part_limit_is_enforced() {
        let store = GatedStore::new(usize::MAX >> 4, None);
        let mut upload = open(store.clone(), config()).await;
        upload.next_part_number = MAX_UPLOAD_PARTS + 1;

        let err = upload.upload_part(part(1)).await.unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::PartLimitExceeded { max: MAX_UPLOAD_PARTS }
        ));
        assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_while_blocked_aborts() {
        let store = GatedStore::new(0, None);
        let cancel = CancellationToken::new();
        let mut upload = MultipartUpload::new(
            store.clone(),
            "bucket",
            "out/a.bin",
            config(),
            cancel.clone(),
        )
        .unwrap();
        upload.initiate().await.unwrap();
        for byte in 1..=3 {
            upload.upload_part(part(byte)).await.unwrap();
        }

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = upload.upload_part(part(4)).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(upload.state(), UploadState::Aborted);
        assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(store.completes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn initiate_failure_leaves_upload_aborted() {
        struct Refusing;

        #[async_trait]
        impl ObjectStore for Refusing {
            async fn get_object(&self, _: &str, _: &str) -> Result<ObjectStream, StoreError> {
                unreachable!()
            }
            async fn create_multipart_upload(
                &self,
                _: &CreateUploadRequest,
            ) -> Result<String, StoreError> {
                Err(StoreError::status(403, "AccessDenied", "denied"))
            }
            async fn upload_part(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: u32,
                _: Bytes,
                _: bool,
            ) -> Result<String, StoreError> {
                unreachable!()
            }
            async fn complete_multipart_upload(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: &[CompletedPart],
            ) -> Result<(), StoreError> {
                unreachable!()
            }
            async fn abort_multipart_upload(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<(), StoreError> {
                panic!("nothing to abort")
            }
            async fn list_objects(
                &self,
                _: &str,
                _: &str,
            ) -> Result<Vec<ObjectSummary>, StoreError> {
                unreachable!()
            }
        }

        let mut upload = MultipartUpload::new(
            Arc::new(Refusing),
            "bucket",
            "out/a.bin",
            config(),
            CancellationToken::new(),
        )
        .unwrap();
        let err = upload.initiate().await.unwrap_err();
        assert!(matches!(err, Error::InitiationFailed { .. }));
        assert_eq!(upload.state(), UploadState::Aborted);
        assert_eq!(upload.upload_id(), None);
        upload.abort().await;
    }

    #[test]
    fn rejects_invalid_config() {
        let store = GatedStore::new(0, None);
        let result = MultipartUpload::new(
            store,
            "bucket",
            "key",
            config().with_upload_part_bytes_limit(MIB),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }
}
