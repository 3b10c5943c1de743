//! Caller-facing result shapes. Serialised as JSON by the transports.

use crate::clock::local_timestamp;
use crate::error::AttendanceError;
use crate::ledger::{ExportRow, EXPORT_HEADER};
use crate::template::TemplateState;
use crate::types::{AttendanceRecord, AttendanceStatus, DayStatus, Subject};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkStatus {
    Marked,
    AlreadyMarked,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkResponse {
    pub status: MarkStatus,
    pub roll_no: String,
    pub name: Option<String>,
    pub class: Option<String>,
    pub batch: Option<String>,
    pub department: Option<String>,
    /// RFC 3339 with the local +05:45 offset.
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrival: Option<AttendanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl MarkResponse {
    pub fn recorded(subject: &Subject, record: &AttendanceRecord, newly_recorded: bool) -> Self {
        Self {
            status: if newly_recorded {
                MarkStatus::Marked
            } else {
                MarkStatus::AlreadyMarked
            },
            roll_no: subject.roll_no.clone(),
            name: Some(subject.name.clone()),
            class: subject.tags.class_group.clone(),
            batch: subject.tags.batch.clone(),
            department: subject.tags.department.clone(),
            time: Some(local_timestamp(record.date, record.time).to_rfc3339()),
            arrival: Some(record.status),
            error: None,
        }
    }

    pub fn failed(roll_no: &str, err: &AttendanceError) -> Self {
        Self {
            status: MarkStatus::Error,
            roll_no: roll_no.to_string(),
            name: None,
            class: None,
            batch: None,
            department: None,
            time: None,
            arrival: None,
            error: Some(ErrorBody {
                code: err.code(),
                reason: err.public_reason(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
    pub already_marked: bool,
    pub roll_no: String,
    pub name: String,
    pub class: Option<String>,
    pub batch: Option<String>,
    pub department: Option<String>,
    pub time: Option<String>,
    /// Only filled in for the bulk view.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DayStatus>,
}

impl StatusResponse {
    pub fn new(
        subject: &Subject,
        record: Option<&AttendanceRecord>,
        status: Option<DayStatus>,
    ) -> Self {
        Self {
            already_marked: record.is_some(),
            roll_no: subject.roll_no.clone(),
            name: subject.name.clone(),
            class: subject.tags.class_group.clone(),
            batch: subject.tags.batch.clone(),
            department: subject.tags.department.clone(),
            time: record.map(|r| local_timestamp(r.date, r.time).to_rfc3339()),
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterResponse {
    pub roll_no: String,
    pub name: String,
    pub template: TemplateState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub fixed: usize,
    pub failed: Vec<String>,
}

/// Tabular export: a header row plus one row per subject per day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportTable {
    pub header: [&'static str; 5],
    pub rows: Vec<ExportRow>,
}

impl ExportTable {
    pub fn new(rows: Vec<ExportRow>) -> Self {
        Self { header: EXPORT_HEADER, rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    #[test]
    fn test_mark_response_json_shape() {
        let mut subject = Subject::new("S002", "Bina");
        subject.tags.class_group = Some("10A".into());
        let record = AttendanceRecord {
            roll_no: "S002".into(),
            date: NaiveDate::from_ymd_opt(2026, 3, 5).unwrap(),
            time: NaiveTime::from_hms_opt(8, 45, 0).unwrap(),
            status: AttendanceStatus::OnTime,
        };
        let json = serde_json::to_value(MarkResponse::recorded(&subject, &record, true)).unwrap();
        assert_eq!(json["status"], "marked");
        assert_eq!(json["time"], "2026-03-05T08:45:00+05:45");
        assert_eq!(json["class"], "10A");
        assert_eq!(json["arrival"], "on_time");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failed_response_carries_code() {
        let err = AttendanceError::NoTemplate("S001".into());
        let json = serde_json::to_value(MarkResponse::failed("S001", &err)).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "no_template");
        assert!(json["time"].is_null());
    }
}
