//! Error types shared by the unzip pipeline.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure reported by an [`ObjectStore`](crate::io::ObjectStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport level failure (connect, timeout, body read).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with an error status.
    #[error("store returned {status} {code}: {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },

    /// The store answered with something we could not make sense of.
    #[error("malformed store response: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn status(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Status {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// The S3 error code, if the store returned one.
    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Status { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether this error means the multipart upload no longer exists.
    pub fn is_no_such_upload(&self) -> bool {
        matches!(self, StoreError::Status { status: 404, .. }) || self.code() == Some("NoSuchUpload")
    }
}

/// Errors raised by the unzip pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range. Raised before any store call.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The input object is not in the content-type allow-list.
    #[error("s3://{bucket}/{key} has invalid content type {content_type:?}")]
    InvalidContentType {
        bucket: String,
        key: String,
        content_type: Option<String>,
    },

    /// The ZIP stream could not be parsed, or an entry failed its CRC check.
    #[error("malformed archive: {0}")]
    ArchiveMalformed(String),

    /// `CreateMultipartUpload` failed; no upload id was assigned.
    #[error("failed to initiate multipart upload for s3://{bucket}/{key}")]
    InitiationFailed {
        bucket: String,
        key: String,
        #[source]
        source: StoreError,
    },

    /// A multipart upload hit a fault and was aborted. The upload id is kept so a
    /// failed store-side abort can be reconciled by hand.
    #[error("multipart upload {upload_id:?} for s3://{bucket}/{key} aborted")]
    UploadAborted {
        bucket: String,
        key: String,
        upload_id: Option<String>,
        #[source]
        source: Box<Error>,
    },

    /// A strategy failed to unzip an archive entry.
    #[error("failed to unzip {name}")]
    UnzipFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("part number cannot exceed {max}")]
    PartLimitExceeded { max: u32 },

    #[error("part of {size} bytes is smaller than the {min} byte minimum")]
    PartTooSmall { size: usize, min: usize },

    #[error("part of {size} bytes exceeds the {max} byte limit")]
    PartTooLarge { size: usize, max: usize },

    /// An uploader operation was called in the wrong state.
    #[error("invalid upload state: {0}")]
    InvalidState(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl Error {
    /// Walk the source chain down to the innermost crate error.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        loop {
            match current {
                Error::UploadAborted { source, .. } | Error::UnzipFailed { source, .. } => {
                    current = source
                }
                _ => return current,
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Error::Cancelled)
    }
}
