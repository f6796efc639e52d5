//! Attendance decision engine.
//!
//! Consumes identity matches from the pipeline while a session is capturing
//! and turns them into at-most-one attendance record per student per
//! session. Session state is re-read at decision time, so ending a session
//! stops new records even for frames already in flight. Hardware feedback is
//! queued, never awaited.

use crate::session::SessionController;
use crate::storage::{NewAttendance, Storage};
use chrono::{DateTime, Utc};
use rollcall_core::MatchOutcome;
use rollcall_hw::{BuzzerTone, Notification};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Attendance status at the moment of marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
        }
    }
}

/// What the engine did with one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// New record written.
    Marked {
        student_id: String,
        status: AttendanceStatus,
    },
    /// Student already has a record for this session; idempotent no-op.
    AlreadyMarked { student_id: String },
    /// Nobody matched; deny feedback dispatched, no record.
    UnknownFace,
    /// No active session, or the record could not be written.
    Discarded,
}

/// Per-session memory of who has already been marked. Keyed by session id
/// so a new session starts with a clean set without any external reset.
struct DedupMemory {
    session_id: String,
    marked: HashSet<String>,
}

pub struct AttendanceEngine {
    storage: Arc<Storage>,
    sessions: Arc<SessionController>,
    notifications: mpsc::Sender<Notification>,
    dedup: Mutex<DedupMemory>,
    write_failures: AtomicU64,
}

impl AttendanceEngine {
    pub fn new(
        storage: Arc<Storage>,
        sessions: Arc<SessionController>,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            storage,
            sessions,
            notifications,
            dedup: Mutex::new(DedupMemory {
                session_id: String::new(),
                marked: HashSet::new(),
            }),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Decide on one match outcome. `now` is passed in so the pipeline
    /// stamps all faces of a frame consistently (and tests can pin time).
    pub fn on_outcome(&self, outcome: &MatchOutcome, now: DateTime<Utc>) -> Decision {
        // Re-check session state at decision time, not at frame-pull time.
        let Some(session) = self.sessions.query() else {
            return Decision::Discarded;
        };

        let (student_id, name, level) = match outcome {
            MatchOutcome::Identified {
                student_id,
                name,
                level,
                distance,
                ambiguous,
            } => {
                tracing::debug!(
                    student = %student_id,
                    distance,
                    ambiguous,
                    "match accepted"
                );
                (student_id, name, level)
            }
            MatchOutcome::Unknown { best_distance } => {
                tracing::debug!(?best_distance, "unknown face during capture");
                self.dispatch(Notification {
                    line1: "Not Recognized".to_string(),
                    line2: "Try again".to_string(),
                    tone: BuzzerTone::Failure,
                });
                return Decision::UnknownFace;
            }
        };

        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            if dedup.session_id != session.session_id {
                dedup.session_id = session.session_id.clone();
                dedup.marked.clear();
            }
            if dedup.marked.contains(student_id.as_str()) {
                return Decision::AlreadyMarked {
                    student_id: student_id.clone(),
                };
            }
        }

        // Inclusive boundary: exactly on the threshold is still present.
        let elapsed = now - session.start_time;
        let status = if elapsed <= session.late_after {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Late
        };

        let record = NewAttendance {
            student_id,
            session_id: &session.session_id,
            timestamp: now,
            status: status.as_str(),
            course_code: &session.course_code,
            level,
        };

        let inserted = match self.storage.insert_attendance_if_absent(&record) {
            Ok(inserted) => inserted,
            Err(e) => {
                // Drop this frame's decision; the worker must survive.
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(student = %student_id, error = %e, "attendance write failed");
                return Decision::Discarded;
            }
        };

        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            dedup.marked.insert(student_id.clone());
        }

        if !inserted {
            // Storage already had the record (e.g. daemon restart mid-session).
            return Decision::AlreadyMarked {
                student_id: student_id.clone(),
            };
        }

        tracing::info!(
            student = %student_id,
            session = %session.session_id,
            status = status.as_str(),
            "attendance marked"
        );
        self.dispatch(Notification {
            line1: match status {
                AttendanceStatus::Present => "Attendance OK!".to_string(),
                AttendanceStatus::Late => "Late Arrival".to_string(),
            },
            line2: name.clone(),
            tone: BuzzerTone::Success,
        });

        Decision::Marked {
            student_id: student_id.clone(),
            status,
        }
    }

    /// Attendance writes that failed since startup; nonzero values surface
    /// as a degraded-health signal in the daemon status.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    fn dispatch(&self, notification: Notification) {
        // Non-blocking: a slow or dead notifier worker drops feedback, never
        // stalls the decision path.
        if let Err(e) = self.notifications.try_send(notification) {
            tracing::warn!(error = %e, "notification queue full or closed, feedback dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionContext;
    use chrono::Duration;

    fn identified(student_id: &str) -> MatchOutcome {
        MatchOutcome::Identified {
            student_id: student_id.to_string(),
            name: format!("Student {student_id}"),
            level: "400".to_string(),
            distance: 0.31,
            ambiguous: false,
        }
    }

    struct Rig {
        storage: Arc<Storage>,
        sessions: Arc<SessionController>,
        engine: AttendanceEngine,
        rx: mpsc::Receiver<Notification>,
    }

    fn rig() -> Rig {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let sessions = Arc::new(SessionController::new(Arc::clone(&storage)).unwrap());
        let (tx, rx) = mpsc::channel(8);
        let engine = AttendanceEngine::new(Arc::clone(&storage), Arc::clone(&sessions), tx);
        Rig {
            storage,
            sessions,
            engine,
            rx,
        }
    }

    fn start_session(rig: &Rig) -> SessionContext {
        rig.sessions.start("CSC401", None, 15, None).unwrap()
    }

    #[test]
    fn lateness_boundary_is_inclusive() {
        let mut rig = rig();
        rig.storage.add_student("MAT100", "Ada", "400", &[]).unwrap();
        rig.storage.add_student("MAT200", "Bisi", "400", &[]).unwrap();
        rig.storage.add_student("MAT300", "Chidi", "400", &[]).unwrap();
        let session = start_session(&rig);
        let t0 = session.start_time;

        // 10 minutes in: present.
        match rig.engine.on_outcome(&identified("MAT100"), t0 + Duration::minutes(10)) {
            Decision::Marked { status, .. } => assert_eq!(status, AttendanceStatus::Present),
            other => panic!("expected marked, got {other:?}"),
        }
        // Exactly at the threshold: still present.
        match rig.engine.on_outcome(&identified("MAT200"), t0 + Duration::minutes(15)) {
            Decision::Marked { status, .. } => assert_eq!(status, AttendanceStatus::Present),
            other => panic!("expected marked, got {other:?}"),
        }
        // 20 minutes in: late.
        match rig.engine.on_outcome(&identified("MAT300"), t0 + Duration::minutes(20)) {
            Decision::Marked { status, .. } => assert_eq!(status, AttendanceStatus::Late),
            other => panic!("expected marked, got {other:?}"),
        }

        // A later recognition of an already-marked student writes nothing
        // and leaves the original status alone.
        let again = rig
            .engine
            .on_outcome(&identified("MAT100"), t0 + Duration::minutes(25));
        assert_eq!(
            again,
            Decision::AlreadyMarked {
                student_id: "MAT100".to_string()
            }
        );

        let rows = rig.storage.session_attendance(&session.session_id).unwrap();
        assert_eq!(rows.len(), 3);
        let ada = rows.iter().find(|r| r.student_id == "MAT100").unwrap();
        assert_eq!(ada.status, "present");

        // One success notification per new record, none for the duplicate.
        let mut tones = Vec::new();
        while let Ok(n) = rig.rx.try_recv() {
            tones.push(n.tone);
        }
        assert_eq!(tones, vec![BuzzerTone::Success; 3]);
    }

    #[test]
    fn repeated_matches_yield_one_record() {
        let mut rig = rig();
        rig.storage.add_student("MAT100", "Ada", "400", &[]).unwrap();
        let session = start_session(&rig);
        let now = session.start_time + Duration::minutes(1);

        assert!(matches!(
            rig.engine.on_outcome(&identified("MAT100"), now),
            Decision::Marked { .. }
        ));
        for _ in 0..5 {
            assert!(matches!(
                rig.engine.on_outcome(&identified("MAT100"), now),
                Decision::AlreadyMarked { .. }
            ));
        }

        assert_eq!(
            rig.storage.session_attendance(&session.session_id).unwrap().len(),
            1
        );
        // Exactly one hardware notification.
        assert!(rig.rx.try_recv().is_ok());
        assert!(rig.rx.try_recv().is_err());
    }

    #[test]
    fn matches_while_idle_are_discarded_silently() {
        let mut rig = rig();
        let decision = rig.engine.on_outcome(&identified("MAT100"), Utc::now());
        assert_eq!(decision, Decision::Discarded);
        assert!(rig.rx.try_recv().is_err());

        let unknown = rig.engine.on_outcome(
            &MatchOutcome::Unknown { best_distance: None },
            Utc::now(),
        );
        assert_eq!(unknown, Decision::Discarded);
        assert!(rig.rx.try_recv().is_err());
    }

    #[test]
    fn unknown_face_during_capture_gets_deny_feedback() {
        let mut rig = rig();
        let session = start_session(&rig);

        let decision = rig.engine.on_outcome(
            &MatchOutcome::Unknown {
                best_distance: Some(0.9),
            },
            session.start_time + Duration::minutes(1),
        );
        assert_eq!(decision, Decision::UnknownFace);

        let n = rig.rx.try_recv().unwrap();
        assert_eq!(n.tone, BuzzerTone::Failure);
        assert_eq!(n.line1, "Not Recognized");
        assert!(rig
            .storage
            .session_attendance(&session.session_id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn dedup_memory_resets_for_a_new_session() {
        let rig = rig();
        rig.storage.add_student("MAT100", "Ada", "400", &[]).unwrap();

        let first = start_session(&rig);
        rig.engine
            .on_outcome(&identified("MAT100"), first.start_time + Duration::minutes(1));
        rig.sessions.end(&first.session_id).unwrap();

        let second = rig.sessions.start("CSC402", None, 15, None).unwrap();
        let decision = rig.engine.on_outcome(
            &identified("MAT100"),
            second.start_time + Duration::minutes(1),
        );
        assert!(matches!(decision, Decision::Marked { .. }));
        assert_eq!(
            rig.storage.session_attendance(&second.session_id).unwrap().len(),
            1
        );
    }

    #[test]
    fn storage_failure_drops_decision_and_counts() {
        let rig = rig();
        start_session(&rig);
        rig.storage.execute_raw("DROP TABLE attendance").unwrap();

        let decision = rig.engine.on_outcome(&identified("MAT100"), Utc::now());
        assert_eq!(decision, Decision::Discarded);
        assert_eq!(rig.engine.write_failures(), 1);
    }
}
