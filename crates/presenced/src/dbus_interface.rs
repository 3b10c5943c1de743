use crate::config::Config;
use crate::engine::EngineHandle;
use crate::sqlite::SqliteStore;
use chrono::NaiveDate;
use presence_core::response::MarkResponse;
use presence_core::{AttendanceError, AttendanceService, ErrorClass, Subject, SubjectTags};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Presence1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Presence1";

pub type Service = AttendanceService<SqliteStore, EngineHandle>;

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
///
/// Every method returns a JSON document. Admin tokens are passed as an
/// explicit argument; the empty string means "no token".
pub struct PresenceService {
    service: Arc<Service>,
    status: serde_json::Value,
}

impl PresenceService {
    pub fn new(service: Arc<Service>, config: &Config) -> Self {
        let cutoffs = service.cutoffs();
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "database": config.db_path.display().to_string(),
            "media_root": config.media_root.display().to_string(),
            "extractor": config.extractor_command,
            "tolerance": config.tolerance,
            "extract_timeout_secs": config.extract_timeout_secs,
            "on_time_cutoff": cutoffs.on_time.format("%H:%M").to_string(),
            "late_cutoff": cutoffs.late.format("%H:%M").to_string(),
            "dev_mode": config.dev_mode,
            "admin_login_enabled": config.admin_pin.is_some(),
        });
        Self { service, status }
    }
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Verify `image` against the claimed subject and record today's arrival.
    ///
    /// Errors are reported inside the JSON (`status = "error"`), not as D-Bus
    /// errors, so kiosks can show the reason directly.
    async fn mark_attendance(&self, roll_no: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(roll_no, bytes = image.len(), "mark_attendance requested");
        let response = match self.service.mark_attendance(roll_no, image).await {
            Ok(response) => {
                tracing::info!(
                    roll_no,
                    status = ?response.status,
                    arrival = ?response.arrival,
                    "attendance processed"
                );
                response
            }
            Err(err) => {
                log_failure("mark_attendance", &err);
                MarkResponse::failed(roll_no, &err)
            }
        };
        to_json(&response)
    }

    async fn attendance_status(&self, roll_no: &str) -> zbus::fdo::Result<String> {
        let status = self
            .service
            .attendance_status(roll_no)
            .await
            .map_err(|e| to_fdo("attendance_status", e))?;
        to_json(&status)
    }

    /// Today's status for every subject.
    async fn attendance_status_list(&self) -> zbus::fdo::Result<String> {
        let list = self
            .service
            .attendance_status_all()
            .await
            .map_err(|e| to_fdo("attendance_status_list", e))?;
        to_json(&list)
    }

    async fn most_absent(
        &self,
        token: &str,
        days: u32,
        class_group: &str,
    ) -> zbus::fdo::Result<String> {
        let rows = self
            .service
            .most_absent(non_empty(token), days, non_empty(class_group))
            .await
            .map_err(|e| to_fdo("most_absent", e))?;
        to_json(&rows)
    }

    /// `from` and `to` are inclusive `YYYY-MM-DD` dates.
    async fn export_attendance(
        &self,
        token: &str,
        from: &str,
        to: &str,
        class_group: &str,
    ) -> zbus::fdo::Result<String> {
        let from = parse_date(from)?;
        let to = parse_date(to)?;
        let table = self
            .service
            .export(non_empty(token), from, to, non_empty(class_group))
            .await
            .map_err(|e| to_fdo("export_attendance", e))?;
        to_json(&table)
    }

    async fn admin_login(&self, pin: &str) -> zbus::fdo::Result<String> {
        let token = self
            .service
            .admin_login(pin)
            .await
            .map_err(|e| to_fdo("admin_login", e))?;
        to_json(&token)
    }

    /// Create or update a subject. An empty `image` registers without a face.
    async fn register_subject(
        &self,
        token: &str,
        roll_no: &str,
        name: &str,
        department: &str,
        batch: &str,
        class_group: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(roll_no, with_image = !image.is_empty(), "register_subject requested");
        let subject = Subject {
            roll_no: roll_no.trim().to_string(),
            name: name.trim().to_string(),
            tags: SubjectTags {
                department: non_empty(department).map(str::to_string),
                batch: non_empty(batch).map(str::to_string),
                class_group: non_empty(class_group).map(str::to_string),
            },
            image_path: None,
        };
        let image = (!image.is_empty()).then_some(image);
        let response = self
            .service
            .register_subject(non_empty(token), subject, image)
            .await
            .map_err(|e| to_fdo("register_subject", e))?;
        to_json(&response)
    }

    /// Replace a subject's template from a new image.
    async fn reenroll(
        &self,
        token: &str,
        roll_no: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(roll_no, "reenroll requested");
        let state = self
            .service
            .reenroll(non_empty(token), roll_no, image)
            .await
            .map_err(|e| to_fdo("reenroll", e))?;
        Ok(serde_json::json!({ "roll_no": roll_no.trim(), "template": state }).to_string())
    }

    async fn backfill_templates(&self, token: &str) -> zbus::fdo::Result<String> {
        let report = self
            .service
            .backfill_templates(non_empty(token))
            .await
            .map_err(|e| to_fdo("backfill_templates", e))?;
        to_json(&report)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status.to_string())
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn parse_date(s: &str) -> zbus::fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("expected YYYY-MM-DD, got {s:?}")))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn log_failure(method: &str, err: &AttendanceError) {
    match err.class() {
        ErrorClass::Internal => tracing::error!(method, error = %err, "request failed"),
        ErrorClass::Transient => {
            tracing::warn!(method, error = %err, "request failed; may be retried")
        }
        ErrorClass::Client => tracing::info!(method, code = err.code(), "request rejected"),
    }
}

fn to_fdo(method: &str, err: AttendanceError) -> zbus::fdo::Error {
    log_failure(method, &err);
    let reason = err.public_reason();
    match (&err, err.class()) {
        (AttendanceError::Unauthorized, _) => zbus::fdo::Error::AccessDenied(reason),
        (_, ErrorClass::Client) => zbus::fdo::Error::InvalidArgs(reason),
        (_, ErrorClass::Transient) => zbus::fdo::Error::Timeout(reason),
        (_, ErrorClass::Internal) => zbus::fdo::Error::Failed(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty(" 10A "), Some("10A"));
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("2026-03-05").unwrap(), NaiveDate::from_ymd_opt(2026, 3, 5).unwrap());
        assert!(parse_date("05/03/2026").is_err());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_fdo("t", AttendanceError::Unauthorized),
            zbus::fdo::Error::AccessDenied(_)
        ));
        assert!(matches!(
            to_fdo("t", AttendanceError::NotFound("S1".into())),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo("t", AttendanceError::ExtractionTimeout(std::time::Duration::from_secs(10))),
            zbus::fdo::Error::Timeout(_)
        ));
        match to_fdo("t", AttendanceError::Internal("stack trace".into())) {
            zbus::fdo::Error::Failed(reason) => assert_eq!(reason, "internal error"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
