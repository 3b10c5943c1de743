//! Storage boundary. The daemon backs these traits with SQLite; the
//! in-memory implementation serves tests and tooling.

pub mod memory;

use crate::types::{AttendanceRecord, Subject};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open storage: {0}")]
    Open(String),
    #[error("storage operation failed: {0}")]
    Operation(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of an atomic insert-if-absent on (roll_no, date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(AttendanceRecord),
    /// A record for that day already existed; it is returned untouched.
    Existing(AttendanceRecord),
}

impl InsertOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::Existing(r) => r,
        }
    }
}

#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Insert or update a subject. Never touches its template.
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), StoreError>;

    async fn get_subject(&self, roll_no: &str) -> Result<Option<Subject>, StoreError>;

    /// All subjects ordered by roll number, optionally filtered by class group.
    async fn list_subjects(&self, class_group: Option<&str>) -> Result<Vec<Subject>, StoreError>;

    /// Raw template bytes exactly as stored, without validation.
    async fn load_template(&self, roll_no: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save_template(&self, roll_no: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the record unless one exists for (roll_no, date), atomically.
    async fn insert_if_absent(
        &self,
        record: &AttendanceRecord,
    ) -> Result<InsertOutcome, StoreError>;

    /// Latest record (by time) for a subject on a date.
    async fn record_on(
        &self,
        roll_no: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Records with `from <= date <= to`, ordered by date then time descending.
    async fn records_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(
        &self,
        token_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn token_created_at(&self, token_hash: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Everything the attendance service needs from storage.
pub trait Store: SubjectStore + LedgerStore + TokenStore {}

impl<T: SubjectStore + LedgerStore + TokenStore + ?Sized> Store for T {}

#[async_trait]
impl<T: SubjectStore + ?Sized> SubjectStore for Arc<T> {
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        (**self).upsert_subject(subject).await
    }

    async fn get_subject(&self, roll_no: &str) -> Result<Option<Subject>, StoreError> {
        (**self).get_subject(roll_no).await
    }

    async fn list_subjects(&self, class_group: Option<&str>) -> Result<Vec<Subject>, StoreError> {
        (**self).list_subjects(class_group).await
    }

    async fn load_template(&self, roll_no: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load_template(roll_no).await
    }

    async fn save_template(&self, roll_no: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).save_template(roll_no, bytes).await
    }
}

#[async_trait]
impl<T: LedgerStore + ?Sized> LedgerStore for Arc<T> {
    async fn insert_if_absent(
        &self,
        record: &AttendanceRecord,
    ) -> Result<InsertOutcome, StoreError> {
        (**self).insert_if_absent(record).await
    }

    async fn record_on(
        &self,
        roll_no: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).record_on(roll_no, date).await
    }

    async fn records_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        (**self).records_between(from, to).await
    }
}

#[async_trait]
impl<T: TokenStore + ?Sized> TokenStore for Arc<T> {
    async fn insert_token(
        &self,
        token_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).insert_token(token_hash, created_at).await
    }

    async fn token_created_at(
        &self,
        token_hash: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        (**self).token_created_at(token_hash).await
    }
}
