//! Boundary to the external face-feature extractor.
//!
//! The extractor is a black box: given an image file it returns one encoding
//! per detected face. Everything after that (face selection, validation,
//! comparison) happens in this crate.

use crate::types::{EncodingError, FaceEncoding};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Raw extractor output: one vector per detected face, possibly empty.
pub type Faces = Vec<Vec<f64>>;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extractor failed: {0}")]
    Failed(String),
    #[error("extractor produced unreadable output: {0}")]
    InvalidOutput(String),
    #[error("extractor worker exited")]
    ChannelClosed,
}

#[async_trait]
pub trait FaceExtractor: Send + Sync {
    async fn extract(&self, image: &Path) -> Result<Faces, ExtractorError>;
}

#[async_trait]
impl<T: FaceExtractor + ?Sized> FaceExtractor for Arc<T> {
    async fn extract(&self, image: &Path) -> Result<Faces, ExtractorError> {
        (**self).extract(image).await
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FaceSelectError {
    #[error("no face detected")]
    NoFace,
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Pick the encoding to use from the extractor output.
///
/// The first face wins; extra faces are ignored.
pub fn select_face(faces: Faces) -> Result<FaceEncoding, FaceSelectError> {
    let first = faces.into_iter().next().ok_or(FaceSelectError::NoFace)?;
    Ok(FaceEncoding::from_values(first)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ENCODING_DIM;

    #[test]
    fn test_select_face_empty_is_no_face() {
        assert_eq!(select_face(vec![]).unwrap_err(), FaceSelectError::NoFace);
    }

    #[test]
    fn test_select_face_takes_first() {
        let faces = vec![vec![0.25; ENCODING_DIM], vec![0.75; ENCODING_DIM]];
        let face = select_face(faces).unwrap();
        assert_eq!(face.values()[0], 0.25);
    }

    #[test]
    fn test_select_face_wrong_length() {
        let err = select_face(vec![vec![0.1; 64]]).unwrap_err();
        assert_eq!(
            err,
            FaceSelectError::Encoding(EncodingError::WrongLength { expected: 128, actual: 64 })
        );
    }
}
