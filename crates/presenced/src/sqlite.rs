//! SQLite-backed store for subjects, the attendance ledger and admin tokens.
//!
//! All access goes through a single `tokio_rusqlite` connection thread, so
//! statements never run concurrently. Uniqueness of a day's record is still
//! enforced by the `UNIQUE(roll_no, date)` constraint, not by that ordering.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use presence_core::store::{InsertOutcome, LedgerStore, StoreError, SubjectStore, TokenStore};
use presence_core::{AttendanceRecord, AttendanceStatus, Subject, SubjectTags};
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subjects (
    roll_no       TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    department    TEXT,
    batch         TEXT,
    class_group   TEXT,
    image_path    TEXT,
    face_encoding BLOB,
    created_at    TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS attendance (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    roll_no TEXT NOT NULL REFERENCES subjects(roll_no) ON DELETE CASCADE,
    date    TEXT NOT NULL,
    time    TEXT NOT NULL,
    status  TEXT NOT NULL,
    UNIQUE(roll_no, date)
);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_group);
CREATE TABLE IF NOT EXISTS admin_tokens (
    token_hash TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);
";

const DATE_FORMAT: &str = "%Y-%m-%d";
/// Fixed-width so that text ordering is chronological.
const TIME_FORMAT: &str = "%H:%M:%S%.6f";

const SUBJECT_COLUMNS: &str = "roll_no, name, department, batch, class_group, image_path";
const RECORD_COLUMNS: &str = "roll_no, date, time, status";

/// Attendance row as stored, before parsing.
type RawRecord = (String, String, String, String);

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Open(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).await.map_err(open_error)?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(open_error)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.busy_timeout(Duration::from_secs(5))?;
            c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            c.pragma_update(None, "foreign_keys", true)?;
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(open_error)?;
        Ok(Self { conn })
    }
}

fn open_error(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Open(e.to_string())
}

fn op_error(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Operation(e.to_string())
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        roll_no: row.get(0)?,
        name: row.get(1)?,
        tags: SubjectTags {
            department: row.get(2)?,
            batch: row.get(3)?,
            class_group: row.get(4)?,
        },
        image_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
    })
}

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parse_record((roll_no, date, time, status): RawRecord) -> Result<AttendanceRecord, StoreError> {
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("attendance date {date:?}: {e}")))?;
    let time = NaiveTime::parse_from_str(&time, "%H:%M:%S%.f")
        .map_err(|e| StoreError::Corrupt(format!("attendance time {time:?}: {e}")))?;
    let status = AttendanceStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("attendance status {status:?}")))?;
    Ok(AttendanceRecord {
        roll_no,
        date,
        time,
        status,
    })
}

#[async_trait]
impl SubjectStore for SqliteStore {
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        let subject = subject.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO subjects
                        (roll_no, name, department, batch, class_group, image_path)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(roll_no) DO UPDATE SET
                        name = excluded.name,
                        department = excluded.department,
                        batch = excluded.batch,
                        class_group = excluded.class_group,
                        image_path = excluded.image_path",
                    params![
                        subject.roll_no,
                        subject.name,
                        subject.tags.department,
                        subject.tags.batch,
                        subject.tags.class_group,
                        subject.image_path.as_deref().map(|p| p.to_string_lossy().into_owned()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(op_error)
    }

    async fn get_subject(&self, roll_no: &str) -> Result<Option<Subject>, StoreError> {
        let roll_no = roll_no.to_string();
        self.conn
            .call(move |c| {
                Ok(c.query_row(
                    &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE roll_no = ?1"),
                    params![roll_no],
                    subject_from_row,
                )
                .optional()?)
            })
            .await
            .map_err(op_error)
    }

    async fn list_subjects(&self, class_group: Option<&str>) -> Result<Vec<Subject>, StoreError> {
        let class_group = class_group.map(str::to_string);
        self.conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {SUBJECT_COLUMNS} FROM subjects
                     WHERE ?1 IS NULL OR class_group = ?1
                     ORDER BY roll_no"
                ))?;
                let subjects = stmt
                    .query_map(params![class_group], subject_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(subjects)
            })
            .await
            .map_err(op_error)
    }

    async fn load_template(&self, roll_no: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let roll_no = roll_no.to_string();
        self.conn
            .call(move |c| {
                let blob: Option<Option<Vec<u8>>> = c
                    .query_row(
                        "SELECT face_encoding FROM subjects WHERE roll_no = ?1",
                        params![roll_no],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(blob.flatten())
            })
            .await
            .map_err(op_error)
    }

    async fn save_template(&self, roll_no: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let roll = roll_no.to_string();
        let bytes = bytes.to_vec();
        let updated = self
            .conn
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE subjects SET face_encoding = ?2 WHERE roll_no = ?1",
                    params![roll, bytes],
                )?)
            })
            .await
            .map_err(op_error)?;
        if updated == 0 {
            return Err(StoreError::Operation(format!("no subject {roll_no}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn insert_if_absent(
        &self,
        record: &AttendanceRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let roll_no = record.roll_no.clone();
        let date = record.date.format(DATE_FORMAT).to_string();
        let time = record.time.format(TIME_FORMAT).to_string();
        let status = record.status.as_str();

        let (inserted, raw) = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO attendance (roll_no, date, time, status) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(roll_no, date) DO NOTHING",
                    params![roll_no, date, time, status],
                )?;
                let raw = tx.query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM attendance WHERE roll_no = ?1 AND date = ?2"
                    ),
                    params![roll_no, date],
                    raw_record,
                )?;
                tx.commit()?;
                Ok((inserted == 1, raw))
            })
            .await
            .map_err(op_error)?;

        let stored = parse_record(raw)?;
        Ok(if inserted {
            InsertOutcome::Inserted(stored)
        } else {
            InsertOutcome::Existing(stored)
        })
    }

    async fn record_on(
        &self,
        roll_no: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let roll_no = roll_no.to_string();
        let date = date.format(DATE_FORMAT).to_string();
        let raw = self
            .conn
            .call(move |c| {
                Ok(c.query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM attendance
                         WHERE roll_no = ?1 AND date = ?2
                         ORDER BY time DESC LIMIT 1"
                    ),
                    params![roll_no, date],
                    raw_record,
                )
                .optional()?)
            })
            .await
            .map_err(op_error)?;
        raw.map(parse_record).transpose()
    }

    async fn records_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let from = from.format(DATE_FORMAT).to_string();
        let to = to.format(DATE_FORMAT).to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance
                     WHERE date BETWEEN ?1 AND ?2
                     ORDER BY date ASC, time DESC"
                ))?;
                let rows = stmt
                    .query_map(params![from, to], raw_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(op_error)?;
        rows.into_iter().map(parse_record).collect()
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn insert_token(
        &self,
        token_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let token_hash = token_hash.to_string();
        let created_at = created_at.to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT OR REPLACE INTO admin_tokens (token_hash, created_at) VALUES (?1, ?2)",
                    params![token_hash, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(op_error)
    }

    async fn token_created_at(
        &self,
        token_hash: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let token_hash = token_hash.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |c| {
                Ok(c.query_row(
                    "SELECT created_at FROM admin_tokens WHERE token_hash = ?1",
                    params![token_hash],
                    |row| row.get(0),
                )
                .optional()?)
            })
            .await
            .map_err(op_error)?;

        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt(format!("token timestamp {s:?}: {e}")))
        })
        .transpose()
    }
}
