use super::{InsertOutcome, LedgerStore, StoreError, SubjectStore, TokenStore};
use crate::types::{AttendanceRecord, Subject};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Inner {
    subjects: BTreeMap<String, Subject>,
    templates: HashMap<String, Vec<u8>>,
    attendance: BTreeMap<(String, NaiveDate), AttendanceRecord>,
    tokens: HashMap<String, DateTime<Utc>>,
}

/// In-memory store. A single lock makes insert-if-absent atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attendance rows, across all subjects and dates.
    pub fn attendance_count(&self) -> usize {
        self.inner.read().map(|inner| inner.attendance.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Operation("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Operation("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn upsert_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        self.write()?
            .subjects
            .insert(subject.roll_no.clone(), subject.clone());
        Ok(())
    }

    async fn get_subject(&self, roll_no: &str) -> Result<Option<Subject>, StoreError> {
        Ok(self.read()?.subjects.get(roll_no).cloned())
    }

    async fn list_subjects(&self, class_group: Option<&str>) -> Result<Vec<Subject>, StoreError> {
        Ok(self
            .read()?
            .subjects
            .values()
            .filter(|s| class_group.map_or(true, |c| s.tags.class_group.as_deref() == Some(c)))
            .cloned()
            .collect())
    }

    async fn load_template(&self, roll_no: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?.templates.get(roll_no).cloned())
    }

    async fn save_template(&self, roll_no: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if !inner.subjects.contains_key(roll_no) {
            return Err(StoreError::Operation(format!("no subject {roll_no}")));
        }
        inner.templates.insert(roll_no.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        record: &AttendanceRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.write()?;
        let key = (record.roll_no.clone(), record.date);
        if let Some(existing) = inner.attendance.get(&key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        inner.attendance.insert(key, record.clone());
        Ok(InsertOutcome::Inserted(record.clone()))
    }

    async fn record_on(
        &self,
        roll_no: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self
            .read()?
            .attendance
            .get(&(roll_no.to_string(), date))
            .cloned())
    }

    async fn records_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut records: Vec<AttendanceRecord> = self
            .read()?
            .attendance
            .values()
            .filter(|r| r.date >= from && r.date <= to)
            .cloned()
            .collect();
        // Match SQLite: date ascending, then most recent first.
        records.sort_by(|a, b| a.date.cmp(&b.date).then(b.time.cmp(&a.time)));
        Ok(records)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(
        &self,
        token_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write()?.tokens.insert(token_hash.to_string(), created_at);
        Ok(())
    }

    async fn token_created_at(
        &self,
        token_hash: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.read()?.tokens.get(token_hash).copied())
    }
}
