use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Number of values in a face encoding produced by the extractor.
pub const ENCODING_DIM: usize = 128;
/// Size of a stored encoding: 128 little-endian f64 values.
pub const ENCODING_BYTES: usize = ENCODING_DIM * std::mem::size_of::<f64>();

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("expected {expected}-dim encoding, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("encoding is all zeros")]
    AllZero,
    #[error("encoding contains a non-finite value")]
    NonFinite,
}

/// Organisational tags attached to a subject. All optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectTags {
    pub department: Option<String>,
    pub batch: Option<String>,
    pub class_group: Option<String>,
}

/// A person whose attendance is tracked, keyed by roll number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub roll_no: String,
    pub name: String,
    #[serde(flatten)]
    pub tags: SubjectTags,
    /// Registration image kept for template backfill.
    pub image_path: Option<PathBuf>,
}

impl Subject {
    pub fn new(roll_no: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            roll_no: roll_no.into(),
            name: name.into(),
            tags: SubjectTags::default(),
            image_path: None,
        }
    }
}

/// A validated 128-dim face encoding.
///
/// Construction rejects wrong lengths, non-finite values and the all-zero
/// vector, so "no template" is always `Option::None` and never a sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEncoding {
    values: Vec<f64>,
}

impl FaceEncoding {
    pub fn from_values(values: Vec<f64>) -> Result<Self, EncodingError> {
        if values.len() != ENCODING_DIM {
            return Err(EncodingError::WrongLength {
                expected: ENCODING_DIM,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EncodingError::NonFinite);
        }
        if values.iter().all(|&v| v == 0.0) {
            return Err(EncodingError::AllZero);
        }
        Ok(Self { values })
    }

    /// Decode stored template bytes. Any length other than [`ENCODING_BYTES`]
    /// and the all-zero sentinel both decode to `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ENCODING_BYTES {
            return None;
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect();
        Self::from_values(values).ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Euclidean distance between two encodings. Lower = more similar.
    pub fn euclidean_distance(&self, other: &FaceEncoding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Classification of a recorded arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    OnTime,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::OnTime => "on_time",
            AttendanceStatus::Late => "late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_time" => Some(AttendanceStatus::OnTime),
            "late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }
}

/// Status of a subject for one day. `Absent` is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Absent,
    OnTime,
    Late,
}

impl From<AttendanceStatus> for DayStatus {
    fn from(status: AttendanceStatus) -> Self {
        match status {
            AttendanceStatus::OnTime => DayStatus::OnTime,
            AttendanceStatus::Late => DayStatus::Late,
        }
    }
}

/// One arrival for one subject on one local date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub roll_no: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<f64> {
        (0..ENCODING_DIM).map(|i| i as f64 / 100.0).collect()
    }

    #[test]
    fn test_from_values_rejects_wrong_length() {
        let err = FaceEncoding::from_values(vec![0.5; 127]).unwrap_err();
        assert_eq!(err, EncodingError::WrongLength { expected: 128, actual: 127 });
    }

    #[test]
    fn test_from_values_rejects_zero_vector() {
        assert_eq!(
            FaceEncoding::from_values(vec![0.0; ENCODING_DIM]).unwrap_err(),
            EncodingError::AllZero
        );
    }

    #[test]
    fn test_from_values_rejects_nan() {
        let mut values = ramp();
        values[3] = f64::NAN;
        assert_eq!(FaceEncoding::from_values(values).unwrap_err(), EncodingError::NonFinite);
    }

    #[test]
    fn test_bytes_are_little_endian_f64() {
        let enc = FaceEncoding::from_values(ramp()).unwrap();
        let bytes = enc.to_bytes();
        assert_eq!(bytes.len(), ENCODING_BYTES);
        assert_eq!(&bytes[8..16], &0.01f64.to_le_bytes());
        assert_eq!(FaceEncoding::from_bytes(&bytes), Some(enc));
    }

    #[test]
    fn test_from_bytes_wrong_length_is_absent() {
        // Valid-looking content, but 127 values.
        let bytes: Vec<u8> = vec![1.0f64; 127].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert!(FaceEncoding::from_bytes(&bytes).is_none());
        assert!(FaceEncoding::from_bytes(&[]).is_none());
        assert!(FaceEncoding::from_bytes(&vec![7u8; ENCODING_BYTES + 8]).is_none());
    }

    #[test]
    fn test_from_bytes_zero_sentinel_is_absent() {
        assert!(FaceEncoding::from_bytes(&vec![0u8; ENCODING_BYTES]).is_none());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = FaceEncoding::from_values(vec![1.0; ENCODING_DIM]).unwrap();
        let b = FaceEncoding::from_values(vec![1.5; ENCODING_DIM]).unwrap();
        let expected = (ENCODING_DIM as f64 * 0.25).sqrt();
        assert!((a.euclidean_distance(&b) - expected).abs() < 1e-9);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_status_strings() {
        for s in [AttendanceStatus::OnTime, AttendanceStatus::Late] {
            assert_eq!(AttendanceStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(AttendanceStatus::parse("absent"), None);
        assert_eq!(serde_json::to_string(&DayStatus::OnTime).unwrap(), "\"on_time\"");
    }
}
