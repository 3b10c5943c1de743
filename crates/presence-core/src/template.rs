//! Template store rules: validity, sentinel handling and the overwrite policy.
//!
//! Stored templates are raw bytes owned by the storage layer. They are only
//! interpreted here, through [`FaceEncoding::from_bytes`], so an invalid or
//! all-zero blob is indistinguishable from "no template".

use crate::types::FaceEncoding;
use serde::Serialize;

/// A stored blob is usable only if it decodes to exactly 128 values that are
/// not all zero.
pub fn is_valid(bytes: &[u8]) -> bool {
    FaceEncoding::from_bytes(bytes).is_some()
}

/// Decode an optional stored blob into an optional template.
pub fn usable(stored: Option<&[u8]>) -> Option<FaceEncoding> {
    stored.and_then(FaceEncoding::from_bytes)
}

/// How an enrollment treats an already valid template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrollMode {
    /// Only write when the current template is absent, a sentinel or invalid.
    #[default]
    FillMissing,
    /// Explicit administrative re-enrollment.
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollDecision {
    Store(FaceEncoding),
    KeepExisting(FaceEncoding),
}

/// Outcome reported to callers of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateState {
    Stored,
    KeptExisting,
    Missing,
}

/// Apply the overwrite rule to a freshly extracted candidate.
pub fn decide(
    existing: Option<&[u8]>,
    candidate: FaceEncoding,
    mode: EnrollMode,
) -> EnrollDecision {
    match (mode, usable(existing)) {
        (EnrollMode::FillMissing, Some(current)) => EnrollDecision::KeepExisting(current),
        _ => EnrollDecision::Store(candidate),
    }
}
