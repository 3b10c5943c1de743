use crate::archiver::ArchiveError;
use crate::extractor::ExtractorError;
use crate::store::StoreError;
use crate::types::EncodingError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("subject not found: {0}")]
    NotFound(String),
    #[error("no face detected in the submitted image")]
    NoFaceDetected,
    #[error("subject {0} has no usable face template")]
    NoTemplate(String),
    #[error("face does not match subject {0}")]
    NotMatched(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("extractor returned an unusable encoding: {0}")]
    BadEncoding(#[from] EncodingError),
    #[error("face extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),
    #[error("face extraction failed: {0}")]
    Extractor(ExtractorError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("image archive failure: {0}")]
    Archive(#[from] ArchiveError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ExtractorError> for AttendanceError {
    fn from(err: ExtractorError) -> Self {
        match err {
            ExtractorError::Timeout(after) => AttendanceError::ExtractionTimeout(after),
            other => AttendanceError::Extractor(other),
        }
    }
}

/// Coarse grouping used by transports to pick a response class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself cannot succeed as sent (4xx-like).
    Client,
    /// Worth resubmitting later.
    Transient,
    /// Server-side fault; logged and reported generically.
    Internal,
}

impl AttendanceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AttendanceError::NotFound(_)
            | AttendanceError::NoFaceDetected
            | AttendanceError::NoTemplate(_)
            | AttendanceError::NotMatched(_)
            | AttendanceError::Unauthorized
            | AttendanceError::InvalidImage(_)
            | AttendanceError::InvalidRequest(_)
            | AttendanceError::Archive(ArchiveError::InvalidSubjectId(_)) => ErrorClass::Client,
            AttendanceError::ExtractionTimeout(_) => ErrorClass::Transient,
            _ => ErrorClass::Internal,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AttendanceError::NotFound(_) => "not_found",
            AttendanceError::NoFaceDetected => "no_face_detected",
            AttendanceError::NoTemplate(_) => "no_template",
            AttendanceError::NotMatched(_) => "not_matched",
            AttendanceError::Unauthorized => "unauthorized",
            AttendanceError::InvalidImage(_) => "invalid_image",
            AttendanceError::InvalidRequest(_) => "invalid_request",
            AttendanceError::Archive(ArchiveError::InvalidSubjectId(_)) => "invalid_request",
            AttendanceError::ExtractionTimeout(_) => "extraction_timeout",
            AttendanceError::Storage(_) | AttendanceError::Archive(_) => "storage_failure",
            AttendanceError::BadEncoding(_)
            | AttendanceError::Extractor(_)
            | AttendanceError::Internal(_) => "internal",
        }
    }

    /// Message safe to show to a caller. Internal details stay in the logs.
    pub fn public_reason(&self) -> String {
        match self.class() {
            ErrorClass::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}
