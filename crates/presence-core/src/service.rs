//! Attendance service: the caller-facing operations, built on the template
//! rules, the matcher, the ledger, the archiver and the admin gate.
//!
//! Local time is resolved here, once per request, from the injected clock.

use crate::archiver::{ImageArchiver, Transfer};
use crate::clock::{Clock, SystemClock};
use crate::error::AttendanceError;
use crate::extractor::{select_face, FaceExtractor, FaceSelectError};
use crate::ledger::{self, AbsenceRow, Cutoffs, Ledger};
use crate::matcher::{EuclideanMatcher, MatchDecision, Matcher, DEFAULT_TOLERANCE};
use crate::response::{BackfillReport, ExportTable, MarkResponse, RegisterResponse, StatusResponse};
use crate::session::{
    verify_pin, AdminGate, AdminToken, Authorization, GateMode, DEFAULT_TOKEN_TTL_HOURS,
};
use crate::store::Store;
use crate::template::{self, EnrollDecision, EnrollMode, TemplateState};
use crate::types::{FaceEncoding, Subject};
use chrono::NaiveDate;
use image::DynamicImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Longest date range accepted by the export.
pub const MAX_EXPORT_DAYS: i64 = 366;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Root of the image tree (`temp/`, `uploads/`, `subjects/`).
    pub media_root: PathBuf,
    pub cutoffs: Cutoffs,
    pub tolerance: f64,
    pub extract_timeout: Duration,
    pub gate_mode: GateMode,
    pub token_ttl: chrono::Duration,
    /// Admin login is disabled when unset.
    pub admin_pin: Option<String>,
}

impl ServiceSettings {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            cutoffs: Cutoffs::default(),
            tolerance: DEFAULT_TOLERANCE,
            extract_timeout: Duration::from_secs(10),
            gate_mode: GateMode::Enforcing,
            token_ttl: chrono::Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
            admin_pin: None,
        }
    }
}

pub struct AttendanceService<S, E, C = SystemClock> {
    store: S,
    extractor: E,
    clock: C,
    matcher: EuclideanMatcher,
    ledger: Ledger,
    gate: AdminGate,
    archiver: Arc<ImageArchiver>,
    extract_timeout: Duration,
    admin_pin: Option<String>,
}

impl<S, E, C> AttendanceService<S, E, C>
where
    S: Store,
    E: FaceExtractor,
    C: Clock,
{
    pub fn new(store: S, extractor: E, clock: C, settings: ServiceSettings) -> Self {
        Self {
            store,
            extractor,
            clock,
            matcher: EuclideanMatcher { tolerance: settings.tolerance },
            ledger: Ledger::new(settings.cutoffs),
            gate: AdminGate::new(settings.gate_mode, settings.token_ttl),
            archiver: Arc::new(ImageArchiver::new(settings.media_root)),
            extract_timeout: settings.extract_timeout,
            admin_pin: settings.admin_pin,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn archiver(&self) -> &ImageArchiver {
        &self.archiver
    }

    pub fn cutoffs(&self) -> Cutoffs {
        self.ledger.cutoffs()
    }

    pub fn gate_mode(&self) -> GateMode {
        self.gate.mode()
    }

    /// Verify the claimed subject's face and record today's arrival.
    ///
    /// A subject already recorded today gets the existing record back before
    /// any image work is done.
    pub async fn mark_attendance(
        &self,
        roll_no: &str,
        image: Vec<u8>,
    ) -> Result<MarkResponse, AttendanceError> {
        let roll_no = roll_no.trim();
        let now = self.clock.local_now();
        let today = now.date_naive();

        let subject = self
            .store
            .get_subject(roll_no)
            .await?
            .ok_or_else(|| AttendanceError::NotFound(roll_no.to_string()))?;

        if let Some(existing) = self.store.record_on(roll_no, today).await? {
            tracing::info!(roll_no, date = %today, "attendance already marked today");
            return Ok(MarkResponse::recorded(&subject, &existing, false));
        }

        // Checked before extraction so a missing template never surfaces as a
        // face or extractor error.
        let template = template::usable(self.store.load_template(roll_no).await?.as_deref())
            .ok_or_else(|| AttendanceError::NoTemplate(roll_no.to_string()))?;

        let image = decode_image(image).await?;
        let staged = self.stage(roll_no, Arc::new(image)).await?;

        if let Err(err) = self.verify_probe(roll_no, &staged, &template).await {
            discard(&staged).await;
            return Err(err);
        }

        let archiver = Arc::clone(&self.archiver);
        let roll = roll_no.to_string();
        let source = staged.clone();
        let archived =
            blocking(move || archiver.archive(Some(&source), &roll, today, Transfer::Move)).await?;
        let canonical = match archived {
            Ok(path) => path,
            Err(err) => {
                if tokio::fs::try_exists(&staged).await.unwrap_or(false) {
                    discard(&staged).await;
                }
                return Err(err.into());
            }
        };
        tracing::debug!(roll_no, path = %canonical.display(), "snapshot archived");

        let arrival = self
            .ledger
            .record_arrival(&self.store, roll_no, now.naive_local())
            .await?;
        Ok(MarkResponse::recorded(&subject, &arrival.record, arrival.newly_recorded))
    }

    /// Today's record for one subject, if any.
    pub async fn attendance_status(
        &self,
        roll_no: &str,
    ) -> Result<StatusResponse, AttendanceError> {
        let roll_no = roll_no.trim();
        let today = self.clock.local_now().date_naive();
        let subject = self
            .store
            .get_subject(roll_no)
            .await?
            .ok_or_else(|| AttendanceError::NotFound(roll_no.to_string()))?;
        let record = self.store.record_on(roll_no, today).await?;
        Ok(StatusResponse::new(&subject, record.as_ref(), None))
    }

    /// Every subject with an `absent | on_time | late` status for today.
    pub async fn attendance_status_all(&self) -> Result<Vec<StatusResponse>, AttendanceError> {
        let today = self.clock.local_now().date_naive();
        let subjects = self.store.list_subjects(None).await?;

        // Ordered by time descending within the day: first seen is latest.
        let mut latest = HashMap::new();
        for record in self.store.records_between(today, today).await? {
            latest.entry(record.roll_no.clone()).or_insert(record);
        }

        Ok(subjects
            .iter()
            .map(|s| {
                let record = latest.get(&s.roll_no);
                StatusResponse::new(s, record, Some(self.ledger.day_status(record)))
            })
            .collect())
    }

    /// Subjects ranked by absences over the last `days` days, today included.
    pub async fn most_absent(
        &self,
        admin_token: Option<&str>,
        days: u32,
        class_group: Option<&str>,
    ) -> Result<Vec<AbsenceRow>, AttendanceError> {
        self.authorize(admin_token).await?;
        let today = self.clock.local_now().date_naive();
        let (from, to) = ledger::window(today, days)
            .ok_or_else(|| AttendanceError::InvalidRequest(format!("window of {days} days")))?;

        let subjects = self.store.list_subjects(class_group).await?;
        let records = self.store.records_between(from, to).await?;
        Ok(ledger::most_absent(&subjects, &records, days))
    }

    pub async fn export(
        &self,
        admin_token: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
        class_group: Option<&str>,
    ) -> Result<ExportTable, AttendanceError> {
        self.authorize(admin_token).await?;
        if from > to {
            return Err(AttendanceError::InvalidRequest(format!("{from} is after {to}")));
        }
        if (to - from).num_days() >= MAX_EXPORT_DAYS {
            return Err(AttendanceError::InvalidRequest(format!(
                "export range exceeds {MAX_EXPORT_DAYS} days"
            )));
        }

        let subjects = self.store.list_subjects(class_group).await?;
        let records = self.store.records_between(from, to).await?;
        Ok(ExportTable::new(ledger::export_rows(&subjects, &records, from, to)))
    }

    /// Exchange the admin PIN for a session token.
    pub async fn admin_login(&self, pin: &str) -> Result<AdminToken, AttendanceError> {
        match &self.admin_pin {
            Some(expected) if verify_pin(pin, expected) => {
                Ok(self.gate.issue(&self.store, self.clock.now()).await?)
            }
            Some(_) => {
                tracing::warn!("admin login rejected: wrong PIN");
                Err(AttendanceError::Unauthorized)
            }
            None => {
                tracing::warn!("admin login rejected: no PIN configured");
                Err(AttendanceError::Unauthorized)
            }
        }
    }

    pub async fn authorize(&self, admin_token: Option<&str>) -> Result<(), AttendanceError> {
        match self.gate.validate(&self.store, admin_token, self.clock.now()).await? {
            Authorization::Authorized => Ok(()),
            Authorization::Unauthorized => Err(AttendanceError::Unauthorized),
        }
    }

    /// Create or update a subject. With an image, the face is extracted
    /// first; an image without a usable face rejects the whole registration.
    pub async fn register_subject(
        &self,
        admin_token: Option<&str>,
        mut subject: Subject,
        image: Option<Vec<u8>>,
    ) -> Result<RegisterResponse, AttendanceError> {
        self.authorize(admin_token).await?;
        subject.roll_no = subject.roll_no.trim().to_string();
        subject.name = subject.name.trim().to_string();
        if subject.roll_no.is_empty() || subject.name.is_empty() {
            return Err(AttendanceError::InvalidRequest("roll number and name are required".into()));
        }
        let roll_no = subject.roll_no.clone();
        let existing = self.store.get_subject(&roll_no).await?;

        let candidate = match image {
            Some(bytes) => {
                let image = decode_image(bytes).await?;
                let (candidate, path) = self.extract_registration(&roll_no, image).await?;
                subject.image_path = Some(path);
                Some(candidate)
            }
            None => {
                subject.image_path = subject
                    .image_path
                    .take()
                    .or_else(|| existing.and_then(|e| e.image_path));
                None
            }
        };

        self.store.upsert_subject(&subject).await?;
        let state = match candidate {
            Some(candidate) => {
                self.apply_template(&roll_no, candidate, EnrollMode::FillMissing)
                    .await?
            }
            None => {
                let stored = self.store.load_template(&roll_no).await?;
                if template::usable(stored.as_deref()).is_some() {
                    TemplateState::KeptExisting
                } else {
                    TemplateState::Missing
                }
            }
        };

        tracing::info!(roll_no, template = ?state, "subject registered");
        Ok(RegisterResponse {
            roll_no,
            name: subject.name,
            template: state,
        })
    }

    /// Replace a subject's template from a new image. Explicitly overwrites.
    pub async fn reenroll(
        &self,
        admin_token: Option<&str>,
        roll_no: &str,
        image: Vec<u8>,
    ) -> Result<TemplateState, AttendanceError> {
        self.authorize(admin_token).await?;
        let roll_no = roll_no.trim();
        let mut subject = self
            .store
            .get_subject(roll_no)
            .await?
            .ok_or_else(|| AttendanceError::NotFound(roll_no.to_string()))?;

        let image = decode_image(image).await?;
        let (candidate, path) = self.extract_registration(roll_no, image).await?;
        subject.image_path = Some(path);
        self.store.upsert_subject(&subject).await?;
        self.apply_template(roll_no, candidate, EnrollMode::Replace).await
    }

    /// Fill in templates for subjects that have a registration image but no
    /// usable template. Failures are reported per subject, not fatal.
    pub async fn backfill_templates(
        &self,
        admin_token: Option<&str>,
    ) -> Result<BackfillReport, AttendanceError> {
        self.authorize(admin_token).await?;
        let mut report = BackfillReport::default();

        for subject in self.store.list_subjects(None).await? {
            let Some(path) = subject.image_path.as_deref() else {
                continue;
            };
            let stored = self.store.load_template(&subject.roll_no).await?;
            if template::usable(stored.as_deref()).is_some() {
                continue;
            }
            report.processed += 1;

            let outcome = match self.extract_face(path).await {
                Ok(candidate) => self
                    .apply_template(&subject.roll_no, candidate, EnrollMode::FillMissing)
                    .await
                    .map(|_| ()),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => report.fixed += 1,
                Err(err) => {
                    tracing::warn!(roll_no = %subject.roll_no, error = %err, "backfill failed");
                    report.failed.push(subject.roll_no.clone());
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            fixed = report.fixed,
            "template backfill finished"
        );
        Ok(report)
    }

    async fn apply_template(
        &self,
        roll_no: &str,
        candidate: FaceEncoding,
        mode: EnrollMode,
    ) -> Result<TemplateState, AttendanceError> {
        let existing = self.store.load_template(roll_no).await?;
        match template::decide(existing.as_deref(), candidate, mode) {
            EnrollDecision::Store(encoding) => {
                self.store.save_template(roll_no, &encoding.to_bytes()).await?;
                tracing::info!(roll_no, ?mode, "face template stored");
                Ok(TemplateState::Stored)
            }
            EnrollDecision::KeepExisting(_) => {
                tracing::info!(roll_no, "valid template kept; not overwritten");
                Ok(TemplateState::KeptExisting)
            }
        }
    }

    /// Extract from a staged copy, then keep the image as the registration image.
    async fn extract_registration(
        &self,
        roll_no: &str,
        image: DynamicImage,
    ) -> Result<(FaceEncoding, PathBuf), AttendanceError> {
        let image = Arc::new(image);
        let staged = self.stage(roll_no, Arc::clone(&image)).await?;
        let extracted = self.extract_face(&staged).await;
        discard(&staged).await;
        let candidate = extracted?;

        let archiver = Arc::clone(&self.archiver);
        let roll = roll_no.to_string();
        let path = blocking(move || archiver.save_registration(&roll, &image)).await??;
        Ok((candidate, path))
    }

    async fn verify_probe(
        &self,
        roll_no: &str,
        staged: &Path,
        template: &FaceEncoding,
    ) -> Result<(), AttendanceError> {
        let probe = self.extract_face(staged).await?;
        match self.matcher.verify(&probe, template) {
            MatchDecision::Matched { distance } => {
                tracing::debug!(roll_no, distance, "face verified");
                Ok(())
            }
            MatchDecision::NotMatched { distance } => {
                tracing::info!(
                    roll_no,
                    distance,
                    tolerance = self.matcher.tolerance,
                    "face not matched"
                );
                Err(AttendanceError::NotMatched(roll_no.to_string()))
            }
        }
    }

    /// Run the extractor under the configured timeout and pick the face.
    async fn extract_face(&self, image: &Path) -> Result<FaceEncoding, AttendanceError> {
        let faces = tokio::time::timeout(self.extract_timeout, self.extractor.extract(image))
            .await
            .map_err(|_| AttendanceError::ExtractionTimeout(self.extract_timeout))??;

        select_face(faces).map_err(|err| match err {
            FaceSelectError::NoFace => AttendanceError::NoFaceDetected,
            FaceSelectError::Encoding(e) => AttendanceError::BadEncoding(e),
        })
    }

    async fn stage(
        &self,
        roll_no: &str,
        image: Arc<DynamicImage>,
    ) -> Result<PathBuf, AttendanceError> {
        let archiver = Arc::clone(&self.archiver);
        let roll = roll_no.to_string();
        Ok(blocking(move || archiver.stage_upload(&roll, &image)).await??)
    }
}

async fn decode_image(bytes: Vec<u8>) -> Result<DynamicImage, AttendanceError> {
    blocking(move || image::load_from_memory(&bytes))
        .await?
        .map_err(|e| AttendanceError::InvalidImage(e.to_string()))
}

async fn blocking<F, R>(f: F) -> Result<R, AttendanceError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AttendanceError::Internal(format!("blocking task failed: {e}")))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove staged upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::extractor::{ExtractorError, Faces};
    use crate::response::MarkStatus;
    use crate::store::{LedgerStore, MemoryStore, SubjectStore};
    use crate::types::{AttendanceStatus, DayStatus, ENCODING_BYTES, ENCODING_DIM};
    use async_trait::async_trait;
    use chrono::NaiveTime;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Treats the red channel of the top-left pixel as the "identity".
    /// Near-black images contain no face.
    #[derive(Default)]
    struct ColorExtractor {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl FaceExtractor for ColorExtractor {
        async fn extract(&self, image: &Path) -> Result<Faces, ExtractorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let img = image::open(image).map_err(|e| ExtractorError::Failed(e.to_string()))?;
            let red = img.to_rgb8().get_pixel(0, 0)[0];
            if red < 16 {
                return Ok(vec![]);
            }
            Ok(vec![vec![f64::from(red) / 255.0; ENCODING_DIM]])
        }
    }

    fn face_png(red: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 16, Rgb([red, 90, 60]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn template_for(red: u8) -> Vec<u8> {
        FaceEncoding::from_values(vec![f64::from(red) / 255.0; ENCODING_DIM])
            .unwrap()
            .to_bytes()
    }

    fn thursday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 5).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    struct Harness {
        service: AttendanceService<MemoryStore, Arc<ColorExtractor>, Arc<ManualClock>>,
        store: MemoryStore,
        extractor: Arc<ColorExtractor>,
        clock: Arc<ManualClock>,
        _media: tempfile::TempDir,
    }

    fn harness_with(
        extractor: ColorExtractor,
        tweak: impl FnOnce(&mut ServiceSettings),
    ) -> Harness {
        let media = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let extractor = Arc::new(extractor);
        let clock = Arc::new(ManualClock::at_local(thursday(), at(8, 45)));
        let mut settings = ServiceSettings::new(media.path());
        settings.admin_pin = Some("2468".into());
        tweak(&mut settings);
        let service = AttendanceService::new(
            store.clone(),
            Arc::clone(&extractor),
            Arc::clone(&clock),
            settings,
        );
        Harness {
            service,
            store,
            extractor,
            clock,
            _media: media,
        }
    }

    fn harness() -> Harness {
        harness_with(ColorExtractor::default(), |_| {})
    }

    async fn enroll(store: &MemoryStore, roll: &str, red: u8) {
        let mut subject = Subject::new(roll, format!("Student {roll}"));
        subject.tags.class_group = Some("10A".into());
        subject.tags.batch = Some("2026".into());
        subject.tags.department = Some("Science".into());
        store.upsert_subject(&subject).await.unwrap();
        store.save_template(roll, &template_for(red)).await.unwrap();
    }

    #[tokio::test]
    async fn test_subject_without_template_is_rejected_before_extraction() {
        let h = harness();
        h.store.upsert_subject(&Subject::new("S001", "Asha")).await.unwrap();

        let err = h.service.mark_attendance("S001", face_png(200)).await.unwrap_err();
        assert!(matches!(err, AttendanceError::NoTemplate(ref r) if r == "S001"));
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.attendance_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_sentinel_template_counts_as_missing() {
        let h = harness();
        h.store.upsert_subject(&Subject::new("S001", "Asha")).await.unwrap();
        h.store.save_template("S001", &[0u8; ENCODING_BYTES]).await.unwrap();

        let err = h.service.mark_attendance("S001", face_png(200)).await.unwrap_err();
        assert!(matches!(err, AttendanceError::NoTemplate(_)));
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_match_then_resubmission_keeps_original_record() {
        let h = harness();
        enroll(&h.store, "S002", 200).await;

        let first = h.service.mark_attendance("S002", face_png(200)).await.unwrap();
        assert_eq!(first.status, MarkStatus::Marked);
        assert_eq!(first.arrival, Some(AttendanceStatus::OnTime));
        assert_eq!(first.time.as_deref(), Some("2026-03-05T08:45:00+05:45"));
        assert_eq!(first.class.as_deref(), Some("10A"));

        h.clock.set_local(thursday(), at(10, 0));
        let calls = h.extractor.calls.load(Ordering::SeqCst);
        let second = h.service.mark_attendance("S002", face_png(200)).await.unwrap();
        assert_eq!(second.status, MarkStatus::AlreadyMarked);
        assert_eq!(second.time, first.time);
        assert_eq!(second.arrival, Some(AttendanceStatus::OnTime));
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), calls);
        assert_eq!(h.store.attendance_count(), 1);
    }

    #[tokio::test]
    async fn test_after_cutoff_is_late() {
        let h = harness();
        enroll(&h.store, "S003", 120).await;
        h.clock.set_local(thursday(), at(9, 20));

        let resp = h.service.mark_attendance("S003", face_png(120)).await.unwrap();
        assert_eq!(resp.arrival, Some(AttendanceStatus::Late));
    }

    #[tokio::test]
    async fn test_unknown_subject() {
        let h = harness();
        let err = h.service.mark_attendance("S404", face_png(200)).await.unwrap_err();
        assert!(matches!(err, AttendanceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_face_is_distinct_and_cleans_up() {
        let h = harness();
        enroll(&h.store, "S004", 200).await;

        let err = h.service.mark_attendance("S004", face_png(0)).await.unwrap_err();
        assert!(matches!(err, AttendanceError::NoFaceDetected));
        assert_eq!(h.store.attendance_count(), 0);

        let uploads = h.service.archiver().root().join("uploads");
        assert_eq!(std::fs::read_dir(uploads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_archive_discards_staged_upload() {
        let h = harness();
        enroll(&h.store, "S014", 200).await;
        // A plain file where the temp tree should be makes the archive step fail.
        std::fs::write(h.service.archiver().temp_root(), b"not a directory").unwrap();

        let err = h.service.mark_attendance("S014", face_png(200)).await.unwrap_err();
        assert!(matches!(err, AttendanceError::Archive(_)));
        assert_eq!(h.store.attendance_count(), 0);

        let uploads = h.service.archiver().root().join("uploads");
        assert_eq!(std::fs::read_dir(uploads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_subject_ids_are_trimmed_everywhere() {
        let h = harness();
        let token = h.service.admin_login("2468").await.unwrap().token;

        let registered = h
            .service
            .register_subject(Some(&token), Subject::new(" S015 ", " Mina "), Some(face_png(150)))
            .await
            .unwrap();
        assert_eq!(registered.roll_no, "S015");
        assert_eq!(registered.name, "Mina");

        let marked = h.service.mark_attendance("S015 ", face_png(150)).await.unwrap();
        assert_eq!(marked.status, MarkStatus::Marked);
        let status = h.service.attendance_status("  S015").await.unwrap();
        assert!(status.already_marked);
        assert_eq!(status.roll_no, "S015");
        h.service.reenroll(Some(&token), "\tS015", face_png(160)).await.unwrap();
    }

    #[tokio::test]
    async fn test_verification_is_one_to_one() {
        let h = harness();
        enroll(&h.store, "S005", 60).await;
        enroll(&h.store, "S006", 220).await;

        // S006's face presented as S005: not matched, never identified as S006.
        let err = h.service.mark_attendance("S005", face_png(220)).await.unwrap_err();
        assert!(matches!(err, AttendanceError::NotMatched(ref r) if r == "S005"));
        assert_eq!(h.store.attendance_count(), 0);
        assert_eq!(h.store.record_on("S006", thursday()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_invalid_image() {
        let h = harness();
        enroll(&h.store, "S007", 200).await;
        let err = h.service.mark_attendance("S007", b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, AttendanceError::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_canonical_image_is_the_only_copy() {
        let h = harness();
        enroll(&h.store, "S008", 200).await;
        let stale = h.service.archiver().temp_root().join("2monday/S008.jpg");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old").unwrap();

        h.service.mark_attendance("S008", face_png(200)).await.unwrap();

        let canonical = h.service.archiver().canonical_path("S008", thursday());
        assert!(canonical.ends_with("temp/5thursday/S008.jpg"));
        assert!(canonical.is_file());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_record_once() {
        let h = harness();
        enroll(&h.store, "S009", 200).await;

        let (a, b, c) = tokio::join!(
            h.service.mark_attendance("S009", face_png(200)),
            h.service.mark_attendance("S009", face_png(201)),
            h.service.mark_attendance("S009", face_png(199)),
        );
        let statuses: Vec<MarkStatus> = [a, b, c].into_iter().map(|r| r.unwrap().status).collect();

        assert_eq!(h.store.attendance_count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == MarkStatus::Marked).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == MarkStatus::AlreadyMarked).count(), 2);
    }

    #[tokio::test]
    async fn test_extraction_timeout_is_transient() {
        let slow = ColorExtractor {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let h = harness_with(slow, |s| s.extract_timeout = Duration::from_millis(50));
        enroll(&h.store, "S010", 200).await;

        let err = h.service.mark_attendance("S010", face_png(200)).await.unwrap_err();
        assert!(matches!(err, AttendanceError::ExtractionTimeout(_)));
        assert_eq!(h.store.attendance_count(), 0);
    }

    #[tokio::test]
    async fn test_status_single_and_bulk() {
        let h = harness();
        enroll(&h.store, "S011", 200).await;
        enroll(&h.store, "S012", 100).await;
        enroll(&h.store, "S013", 150).await;

        h.service.mark_attendance("S011", face_png(200)).await.unwrap();
        h.clock.set_local(thursday(), at(9, 5));
        h.service.mark_attendance("S012", face_png(100)).await.unwrap();

        let single = h.service.attendance_status("S011").await.unwrap();
        assert!(single.already_marked);
        assert_eq!(single.time.as_deref(), Some("2026-03-05T08:45:00+05:45"));
        assert_eq!(single.status, None);

        let bulk = h.service.attendance_status_all().await.unwrap();
        let by_roll: Vec<(&str, Option<DayStatus>)> =
            bulk.iter().map(|s| (s.roll_no.as_str(), s.status)).collect();
        assert_eq!(
            by_roll,
            vec![
                ("S011", Some(DayStatus::OnTime)),
                ("S012", Some(DayStatus::Late)),
                ("S013", Some(DayStatus::Absent)),
            ]
        );
    }

    #[tokio::test]
    async fn test_admin_login_and_gate() {
        let h = harness();
        assert!(matches!(
            h.service.admin_login("0000").await.unwrap_err(),
            AttendanceError::Unauthorized
        ));
        assert!(matches!(
            h.service.most_absent(None, 7, None).await.unwrap_err(),
            AttendanceError::Unauthorized
        ));

        let token = h.service.admin_login("2468").await.unwrap();
        assert!(h.service.most_absent(Some(&token.token), 7, None).await.is_ok());

        h.clock.advance(chrono::Duration::hours(170));
        assert!(matches!(
            h.service.most_absent(Some(&token.token), 7, None).await.unwrap_err(),
            AttendanceError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn test_development_mode_allows_missing_token_only() {
        let h = harness_with(ColorExtractor::default(), |s| s.gate_mode = GateMode::Development);
        assert!(h.service.most_absent(None, 7, None).await.is_ok());
        assert!(matches!(
            h.service.most_absent(Some("bogus"), 7, None).await.unwrap_err(),
            AttendanceError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn test_most_absent_over_seven_days() {
        let h = harness();
        enroll(&h.store, "S014", 200).await;
        for day in [1, 3, 5] {
            let date = NaiveDate::from_ymd_opt(2026, 3, day).unwrap();
            h.clock.set_local(date, at(8, 30));
            h.service.mark_attendance("S014", face_png(200)).await.unwrap();
        }
        let token = h.service.admin_login("2468").await.unwrap();

        let rows = h.service.most_absent(Some(&token.token), 7, Some("10A")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].presents, rows[0].absences), (3, 4));

        let err = h.service.most_absent(Some(&token.token), 0, None).await.unwrap_err();
        assert!(matches!(err, AttendanceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_export_rows_and_range_checks() {
        let h = harness();
        enroll(&h.store, "S015", 200).await;
        h.service.mark_attendance("S015", face_png(200)).await.unwrap();
        let token = h.service.admin_login("2468").await.unwrap();
        let token = Some(token.token.as_str());

        let from = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        let table = h.service.export(token, from, thursday(), None).await.unwrap();
        assert_eq!(table.header[0], "date");
        assert_eq!(table.rows.len(), 2);
        assert!(!table.rows[0].present);
        assert!(table.rows[1].present);

        assert!(h.service.export(token, thursday(), from, None).await.is_err());
        let far = NaiveDate::from_ymd_opt(2028, 1, 1).unwrap();
        assert!(h.service.export(token, from, far, None).await.is_err());
    }

    #[tokio::test]
    async fn test_register_keeps_valid_template_and_reenroll_replaces() {
        let h = harness_with(ColorExtractor::default(), |s| s.gate_mode = GateMode::Development);

        let resp = h
            .service
            .register_subject(None, Subject::new("S016", "Dev"), Some(face_png(90)))
            .await
            .unwrap();
        assert_eq!(resp.template, TemplateState::Stored);
        let first = h.store.load_template("S016").await.unwrap();
        let stored = h.store.get_subject("S016").await.unwrap().unwrap();
        assert!(stored.image_path.as_deref().unwrap().is_file());

        let again = h
            .service
            .register_subject(None, Subject::new("S016", "Dev R."), Some(face_png(240)))
            .await
            .unwrap();
        assert_eq!(again.template, TemplateState::KeptExisting);
        assert_eq!(h.store.load_template("S016").await.unwrap(), first);

        let state = h.service.reenroll(None, "S016", face_png(240)).await.unwrap();
        assert_eq!(state, TemplateState::Stored);
        let now = h.store.load_template("S016").await.unwrap().unwrap();
        let enc = FaceEncoding::from_bytes(&now).unwrap();
        assert!((enc.values()[0] - 240.0 / 255.0).abs() < 0.05);
    }

    #[tokio::test]
    async fn test_register_without_face_creates_nothing() {
        let h = harness_with(ColorExtractor::default(), |s| s.gate_mode = GateMode::Development);
        let err = h
            .service
            .register_subject(None, Subject::new("S017", "Eve"), Some(face_png(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NoFaceDetected));
        assert!(h.store.get_subject("S017").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_requires_admin_in_enforcing_mode() {
        let h = harness();
        let err = h
            .service
            .register_subject(None, Subject::new("S018", "Fay"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AttendanceError::Unauthorized));
    }

    #[tokio::test]
    async fn test_backfill_fills_sentinel_templates() {
        let h = harness_with(ColorExtractor::default(), |s| s.gate_mode = GateMode::Development);
        h.service
            .register_subject(None, Subject::new("S019", "Gus"), Some(face_png(130)))
            .await
            .unwrap();
        // Simulate a legacy row whose template was zeroed.
        h.store.save_template("S019", &[0u8; ENCODING_BYTES]).await.unwrap();
        // And one with no image at all.
        h.store.upsert_subject(&Subject::new("S020", "Hal")).await.unwrap();

        let report = h.service.backfill_templates(None).await.unwrap();
        assert_eq!((report.processed, report.fixed), (1, 1));
        assert!(report.failed.is_empty());
        let bytes = h.store.load_template("S019").await.unwrap().unwrap();
        assert!(template::is_valid(&bytes));

        // Nothing left to do.
        let report = h.service.backfill_templates(None).await.unwrap();
        assert_eq!(report.processed, 0);
    }
}
