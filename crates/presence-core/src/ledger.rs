//! Attendance ledger: the per-subject, per-day state machine and its reports.
//!
//! For a (subject, date) the state is either implicit `Absent` or a single
//! recorded arrival, which is terminal. Arrivals are classified against the
//! on-time cutoff. All dates and times here are local wall-clock values.

use crate::store::{InsertOutcome, LedgerStore, StoreError};
use crate::types::{AttendanceRecord, AttendanceStatus, DayStatus, Subject};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("late cutoff {late} is before on-time cutoff {on_time}")]
pub struct CutoffError {
    pub on_time: NaiveTime,
    pub late: NaiveTime,
}

/// Time-of-day boundaries used to classify arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    /// Arrivals at or before this time are on time.
    pub on_time: NaiveTime,
    /// Reported alongside results. Does not produce a separate status.
    pub late: NaiveTime,
}

impl Default for Cutoffs {
    fn default() -> Self {
        Self {
            on_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            late: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl Cutoffs {
    pub fn new(on_time: NaiveTime, late: NaiveTime) -> Result<Self, CutoffError> {
        if late < on_time {
            return Err(CutoffError { on_time, late });
        }
        Ok(Self { on_time, late })
    }

    pub fn classify(&self, time: NaiveTime) -> AttendanceStatus {
        if time <= self.on_time {
            AttendanceStatus::OnTime
        } else {
            AttendanceStatus::Late
        }
    }
}

/// Outcome of recording an arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub record: AttendanceRecord,
    /// False when a record for the day already existed and was returned as-is.
    pub newly_recorded: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ledger {
    cutoffs: Cutoffs,
}

impl Ledger {
    pub fn new(cutoffs: Cutoffs) -> Self {
        Self { cutoffs }
    }

    pub fn cutoffs(&self) -> Cutoffs {
        self.cutoffs
    }

    /// Record an arrival at local time `at`, unless the subject already has a
    /// record for that date. Relies on the store's atomic insert-if-absent.
    pub async fn record_arrival<S: LedgerStore + ?Sized>(
        &self,
        store: &S,
        roll_no: &str,
        at: NaiveDateTime,
    ) -> Result<Arrival, StoreError> {
        let candidate = AttendanceRecord {
            roll_no: roll_no.to_string(),
            date: at.date(),
            time: at.time(),
            status: self.cutoffs.classify(at.time()),
        };

        match store.insert_if_absent(&candidate).await? {
            InsertOutcome::Inserted(record) => {
                tracing::info!(
                    roll_no,
                    date = %record.date,
                    time = %record.time,
                    status = record.status.as_str(),
                    "attendance recorded"
                );
                Ok(Arrival { record, newly_recorded: true })
            }
            InsertOutcome::Existing(record) => {
                tracing::debug!(roll_no, date = %record.date, "attendance already recorded");
                Ok(Arrival { record, newly_recorded: false })
            }
        }
    }

    /// Derive a day status from the subject's latest record for that day.
    pub fn day_status(&self, record: Option<&AttendanceRecord>) -> DayStatus {
        match record {
            Some(r) => self.cutoffs.classify(r.time).into(),
            None => DayStatus::Absent,
        }
    }
}

/// Inclusive rolling window of `days` days ending on `today`.
pub fn window(today: NaiveDate, days: u32) -> Option<(NaiveDate, NaiveDate)> {
    if days == 0 {
        return None;
    }
    let start = today.checked_sub_signed(Duration::days(i64::from(days) - 1))?;
    Some((start, today))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbsenceRow {
    pub roll_no: String,
    pub name: String,
    pub class: Option<String>,
    pub presents: u32,
    pub absences: u32,
}

/// Rank subjects by absences over a window of `window_days`.
///
/// `records` must already be limited to the window. Presents are counted per
/// distinct date. Ties are broken by roll number.
pub fn most_absent(
    subjects: &[Subject],
    records: &[AttendanceRecord],
    window_days: u32,
) -> Vec<AbsenceRow> {
    let mut days_present: HashMap<&str, HashSet<NaiveDate>> = HashMap::new();
    for r in records {
        days_present.entry(r.roll_no.as_str()).or_default().insert(r.date);
    }

    let mut rows: Vec<AbsenceRow> = subjects
        .iter()
        .map(|s| {
            let presents = days_present
                .get(s.roll_no.as_str())
                .map_or(0, |d| d.len() as u32)
                .min(window_days);
            AbsenceRow {
                roll_no: s.roll_no.clone(),
                name: s.name.clone(),
                class: s.tags.class_group.clone(),
                presents,
                absences: window_days - presents,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.absences.cmp(&a.absences).then_with(|| a.roll_no.cmp(&b.roll_no)));
    rows
}

pub const EXPORT_HEADER: [&str; 5] = ["date", "roll_no", "name", "class", "present"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub date: NaiveDate,
    pub roll_no: String,
    pub name: String,
    pub class: Option<String>,
    pub present: bool,
}

/// One row per subject per date in `from..=to`, dates ascending.
pub fn export_rows(
    subjects: &[Subject],
    records: &[AttendanceRecord],
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<ExportRow> {
    let present: HashSet<(&str, NaiveDate)> =
        records.iter().map(|r| (r.roll_no.as_str(), r.date)).collect();

    from.iter_days()
        .take_while(|d| *d <= to)
        .flat_map(|date| {
            let present = &present;
            subjects.iter().map(move |s| ExportRow {
                date,
                roll_no: s.roll_no.clone(),
                name: s.name.clone(),
                class: s.tags.class_group.clone(),
                present: present.contains(&(s.roll_no.as_str(), date)),
            })
        })
        .collect()
}
