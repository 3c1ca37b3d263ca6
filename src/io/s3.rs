//! S3-compatible object store over plain HTTP, signed with SigV4.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Client, Method, Response, StatusCode, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::sigv4::{self, EMPTY_PAYLOAD_SHA256};
use super::{CompletedPart, CreateUploadRequest, ObjectStore, ObjectStream, ObjectSummary, xml};
use crate::error::StoreError;

/// Static access keys.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Connection settings for [`S3Client`].
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Base URL, e.g. `https://s3.eu-west-1.amazonaws.com` or `http://localhost:9000`.
    pub endpoint: String,
    pub region: String,
    /// Requests are sent unsigned when absent.
    pub credentials: Option<Credentials>,
    /// `endpoint/bucket/key` instead of `bucket.endpoint/key`.
    pub path_style: bool,
    /// Connect and idle-read timeout for every request, and the total
    /// timeout for every request except object downloads.
    pub timeout: Duration,
    /// Attempts on connect errors and timeouts before giving up. Timed-out
    /// POSTs are never resent.
    pub max_retry: u32,
}

impl S3Config {
    pub fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            endpoint: format!("https://s3.{region}.amazonaws.com"),
            region,
            credentials: None,
            path_style: true,
            timeout: Duration::from_secs(60),
            max_retry: 5,
        }
    }

    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN`,
    /// `AWS_REGION` (or `AWS_DEFAULT_REGION`) and `AWS_ENDPOINT_URL`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let region = var("AWS_REGION")
            .or_else(|| var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| "us-east-1".to_string());
        let mut config = Self::new(region);
        if let Some(endpoint) = var("AWS_ENDPOINT_URL") {
            config.endpoint = endpoint;
        }
        if let (Some(id), Some(secret)) = (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY")) {
            config.credentials = Some(Credentials {
                access_key_id: id,
                secret_access_key: secret,
                session_token: var("AWS_SESSION_TOKEN"),
            });
        }
        config
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_path_style(mut self, path_style: bool) -> Self {
        self.path_style = path_style;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// [`ObjectStore`] backed by an S3-compatible HTTP endpoint.
pub struct S3Client {
    client: Client,
    config: S3Config,
    endpoint: Url,
    uploaded_bytes: AtomicU64,
}

/// A request ready to be signed and sent.
struct S3Request<'a> {
    method: Method,
    bucket: &'a str,
    key: Option<&'a str>,
    query: Vec<(&'a str, String)>,
    headers: Vec<(String, String)>,
    body: Bytes,
    /// The response body is streamed for as long as the caller keeps reading.
    streaming: bool,
}

impl<'a> S3Request<'a> {
    fn new(method: Method, bucket: &'a str, key: Option<&'a str>) -> Self {
        Self {
            method,
            bucket,
            key,
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
            streaming: false,
        }
    }

    fn query(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Whether a failed attempt may be sent again. A POST that timed out may
    /// have been applied, and resending it would start a second upload or
    /// complete one twice.
    fn is_retryable(&self, error: &reqwest::Error) -> bool {
        error.is_connect() || (error.is_timeout() && self.method != Method::POST)
    }
}

impl S3Client {
    pub fn new(config: S3Config) -> Result<Self, StoreError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| StoreError::Other(format!("invalid endpoint {}: {e}", config.endpoint)))?;
        if endpoint.host_str().is_none() {
            return Err(StoreError::Other(format!(
                "endpoint {} has no host",
                config.endpoint
            )));
        }
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            endpoint,
            uploaded_bytes: AtomicU64::new(0),
        })
    }

    /// Total part bytes accepted by the store so far.
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    /// Host header and canonical URI for an object (or the bucket when `key` is `None`).
    fn locate(&self, bucket: &str, key: Option<&str>) -> (String, String) {
        let mut host = self.endpoint.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.endpoint.port() {
            host = format!("{host}:{port}");
        }
        let base = self.endpoint.path().trim_end_matches('/');
        let key = key.map(sigv4::encode_key).unwrap_or_default();

        if self.config.path_style {
            (host, format!("{base}/{}/{key}", sigv4::uri_encode(bucket)))
        } else {
            (format!("{bucket}.{host}"), format!("{base}/{key}"))
        }
    }

    async fn send(&self, request: S3Request<'_>) -> Result<Response, StoreError> {
        let (host, path) = self.locate(request.bucket, request.key);
        let query: Vec<(&str, &str)> = request
            .query
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        let canonical_query = sigv4::canonical_query(&query);

        let mut url = format!("{}://{host}{path}", self.endpoint.scheme());
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let payload_hash = if request.body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            sigv4::hash_payload(&request.body)
        };

        let mut retry_count = 0;
        loop {
            let now = Utc::now();
            let mut headers = request.headers.clone();
            headers.push(("host".into(), host.clone()));
            headers.push(("x-amz-date".into(), sigv4::amz_date(&now)));
            headers.push(("x-amz-content-sha256".into(), payload_hash.clone()));

            let mut builder = self.client.request(request.method.clone(), &url);
            if !request.streaming {
                builder = builder.timeout(self.config.timeout);
            }
            if let Some(credentials) = &self.config.credentials {
                if let Some(token) = &credentials.session_token {
                    headers.push(("x-amz-security-token".into(), token.clone()));
                }
                let authorization = sigv4::authorization(
                    request.method.as_str(),
                    &path,
                    &canonical_query,
                    &headers,
                    &payload_hash,
                    credentials,
                    &self.config.region,
                    &now,
                );
                builder = builder.header("authorization", authorization);
            }
            for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
                builder = builder.header(name.as_str(), value.as_str());
            }

            match builder.body(request.body.clone()).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => return Err(error_from_response(response).await),
                Err(e) if request.is_retryable(&e) && retry_count + 1 < self.config.max_retry => {
                    retry_count += 1;
                    warn!(
                        method = %request.method,
                        url = %url,
                        retry = retry_count,
                        max_retry = self.config.max_retry,
                        error = %e,
                        "connection error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

async fn error_from_response(response: Response) -> StoreError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    match xml::parse_error(&body) {
        Some(error) => StoreError::status(status.as_u16(), error.code, error.message),
        None => StoreError::status(
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            String::from_utf8_lossy(&body).into_owned(),
        ),
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectStream, StoreError> {
        let response = self
            .send(S3Request::new(Method::GET, bucket, Some(key)).streaming())
            .await?;

        let content_type = header_str(&response, CONTENT_TYPE);
        let content_length = header_str(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok());
        debug!(bucket, key, ?content_type, ?content_length, "opened object stream");

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(ObjectStream {
            content_type,
            content_length,
            body: Box::pin(StreamReader::new(stream)),
        })
    }

    async fn create_multipart_upload(
        &self,
        request: &CreateUploadRequest,
    ) -> Result<String, StoreError> {
        let mut s3_request = S3Request::new(Method::POST, &request.bucket, Some(&request.key))
            .query("uploads", "");
        if let Some(content_type) = &request.content_type {
            s3_request = s3_request.header("content-type", content_type.as_str());
        }
        if let Some(acl) = request.canned_acl {
            s3_request = s3_request.header("x-amz-acl", acl.as_str());
        }
        if !request.tagging.is_empty() {
            let tagging = request
                .tagging
                .iter()
                .map(|(k, v)| format!("{}={}", sigv4::uri_encode(k), sigv4::uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            s3_request = s3_request.header("x-amz-tagging", tagging);
        }
        for (name, value) in &request.headers {
            s3_request = s3_request.header(name, value.as_str());
        }

        let body = self.send(s3_request).await?.bytes().await?;
        xml::parse_upload_id(&body)
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
        let size = body.len() as u64;
        let response = self
            .send(
                S3Request::new(Method::PUT, bucket, Some(key))
                    .query("partNumber", part_number.to_string())
                    .query("uploadId", upload_id)
                    .body(body),
            )
            .await?;

        let etag = header_str(&response, ETAG)
            .ok_or_else(|| StoreError::Protocol("UploadPart response has no ETag".into()))?;
        self.uploaded_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), StoreError> {
        let payload = xml::complete_multipart_upload(parts)?;
        let response = self
            .send(
                S3Request::new(Method::POST, bucket, Some(key))
                    .query("uploadId", upload_id)
                    .header("content-type", "application/xml")
                    .body(Bytes::from(payload)),
            )
            .await?;

        // Completion can fail after the 200 status line has been sent.
        let status = response.status();
        let body = response.bytes().await?;
        match xml::parse_error(&body) {
            Some(error) => Err(StoreError::status(
                if status == StatusCode::OK { 500 } else { status.as_u16() },
                error.code,
                error.message,
            )),
            None => Ok(()),
        }
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let result = self
            .send(S3Request::new(Method::DELETE, bucket, Some(key)).query("uploadId", upload_id))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_no_such_upload() => {
                debug!(bucket, key, upload_id, "upload already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectSummary>, StoreError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = S3Request::new(Method::GET, bucket, None)
                .query("list-type", "2")
                .query("prefix", prefix);
            if let Some(token) = &token {
                request = request.query("continuation-token", token.as_str());
            }

            let body = self.send(request).await?.bytes().await?;
            let page = xml::parse_list_page(&body)?;
            objects.extend(page.objects);
            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
