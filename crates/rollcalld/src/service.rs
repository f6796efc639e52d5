//! D-Bus control surface for the attendance daemon.
//!
//! Bus name: org.rollcall.Attendance1
//! Object path: /org/rollcall/Attendance1
//!
//! The excluded web layer is a thin client of this interface: it re-serves
//! `LatestFrame` as its multipart preview stream, polls
//! `EnrollmentProgress`, and forwards session/enrollment controls.

use crate::attendance::AttendanceEngine;
use crate::engine::{PipelineHandle, PipelineShared};
use crate::enroll::EnrollmentCapture;
use crate::session::{SessionController, SessionError};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use zbus::interface;

pub struct AttendanceService {
    pub storage: Arc<Storage>,
    pub sessions: Arc<SessionController>,
    pub attendance: Arc<AttendanceEngine>,
    pub enrollment: Arc<Mutex<EnrollmentCapture>>,
    pub shared: Arc<PipelineShared>,
    pub pipeline: PipelineHandle,
    /// Fallback when neither the request nor the settings table carries a
    /// late threshold.
    pub default_late_after: i64,
}

impl AttendanceService {
    fn late_after_minutes(&self, requested: i64) -> i64 {
        if requested > 0 {
            return requested;
        }
        self.storage
            .get_setting("late_after_minutes")
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.default_late_after)
    }

    fn lock_enrollment(&self) -> std::sync::MutexGuard<'_, EnrollmentCapture> {
        self.enrollment.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn fdo_err(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a session for a course. `scheduled_start` is RFC 3339 or empty;
    /// `late_after_minutes` of 0 defers to settings. Returns the session id.
    async fn start_session(
        &self,
        course_code: &str,
        scheduled_start: &str,
        late_after_minutes: i64,
        created_by: &str,
    ) -> zbus::fdo::Result<String> {
        let scheduled = if scheduled_start.is_empty() {
            None
        } else {
            Some(
                DateTime::parse_from_rfc3339(scheduled_start)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| {
                        zbus::fdo::Error::InvalidArgs(format!("scheduled_start: {e}"))
                    })?,
            )
        };

        let created_by = (!created_by.is_empty()).then_some(created_by);
        let late_after = self.late_after_minutes(late_after_minutes);

        match self.sessions.start(course_code, scheduled, late_after, created_by) {
            Ok(context) => Ok(context.session_id),
            Err(e @ SessionError::Conflict { .. }) => Err(zbus::fdo::Error::Failed(e.to_string())),
            Err(e) => Err(fdo_err(e)),
        }
    }

    /// End the active session by id.
    async fn end_session(&self, session_id: &str) -> zbus::fdo::Result<()> {
        self.sessions.end(session_id).map_err(fdo_err)
    }

    /// JSON snapshot of the active session, or "null".
    async fn active_session(&self) -> zbus::fdo::Result<String> {
        let value = match self.sessions.query() {
            Some(context) => serde_json::json!({
                "session_id": context.session_id,
                "course_code": context.course_code,
                "start_time": context.start_time.to_rfc3339(),
                "late_after_minutes": context.late_after.num_minutes(),
            }),
            None => serde_json::Value::Null,
        };
        Ok(value.to_string())
    }

    /// Delete an ended session, cascading its attendance records.
    async fn delete_session(&self, session_id: &str) -> zbus::fdo::Result<bool> {
        if self
            .sessions
            .query()
            .is_some_and(|active| active.session_id == session_id)
        {
            return Err(zbus::fdo::Error::Failed(
                "cannot delete the active session; end it first".to_string(),
            ));
        }
        self.storage.delete_session(session_id).map_err(fdo_err)
    }

    /// JSON array of attendance records for a session.
    async fn session_attendance(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let rows = self.storage.session_attendance(session_id).map_err(fdo_err)?;
        serde_json::to_string(&rows).map_err(fdo_err)
    }

    /// Register a student (no signatures yet). `courses` is a JSON array of
    /// course codes.
    async fn register_student(
        &self,
        student_id: &str,
        name: &str,
        level: &str,
        courses: &str,
    ) -> zbus::fdo::Result<()> {
        let courses: Vec<String> = serde_json::from_str(courses)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("courses: {e}")))?;
        self.storage
            .add_student(student_id, name, level, &courses)
            .map_err(fdo_err)
    }

    /// Rename a student id, cascading signatures and attendance history.
    async fn rename_student(&self, old_id: &str, new_id: &str) -> zbus::fdo::Result<bool> {
        let renamed = self.storage.rename_student(old_id, new_id).map_err(fdo_err)?;
        if renamed {
            self.pipeline.reload_gallery().await;
        }
        Ok(renamed)
    }

    /// JSON array of enrolled students.
    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let students = self.storage.list_students().map_err(fdo_err)?;
        serde_json::to_string(&students).map_err(fdo_err)
    }

    /// Arm a fresh guided capture; the pipeline starts routing frames to it.
    async fn begin_enrollment(&self) -> zbus::fdo::Result<()> {
        self.lock_enrollment().begin();
        Ok(())
    }

    /// Poll-friendly JSON progress snapshot.
    async fn enrollment_progress(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.lock_enrollment().progress();
        serde_json::to_string(&snapshot).map_err(fdo_err)
    }

    /// Discard progress, back to stage 0 (capture stays armed).
    async fn reset_enrollment(&self) -> zbus::fdo::Result<()> {
        self.lock_enrollment().reset();
        Ok(())
    }

    /// Disarm and discard the capture attempt.
    async fn cancel_enrollment(&self) -> zbus::fdo::Result<()> {
        self.lock_enrollment().abandon();
        Ok(())
    }

    /// Store a completed capture as `student_id`'s signature set and reload
    /// the matching gallery.
    async fn commit_enrollment(&self, student_id: &str) -> zbus::fdo::Result<()> {
        let signatures = self
            .lock_enrollment()
            .take_signatures()
            .ok_or_else(|| zbus::fdo::Error::Failed("capture is not complete".to_string()))?;

        self.storage
            .replace_signatures(student_id, &signatures)
            .map_err(fdo_err)?;
        tracing::info!(student = %student_id, signatures = signatures.len(), "enrollment committed");

        self.pipeline.reload_gallery().await;
        Ok(())
    }

    /// Latest annotated preview frame as JPEG bytes (empty when the camera
    /// has not produced a frame yet).
    async fn latest_frame(&self) -> zbus::fdo::Result<Vec<u8>> {
        Ok(self.shared.latest_preview().unwrap_or_default())
    }

    /// Daemon health JSON: session state, stream health, storage failures.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let session = self.sessions.query();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session_active": session.is_some(),
            "course_code": session.map(|s| s.course_code),
            "stream_healthy": self.shared.stream_healthy(),
            "attendance_write_failures": self.attendance.write_failures(),
            "enrollment_armed": self.lock_enrollment().is_armed(),
        })
        .to_string())
    }
}
