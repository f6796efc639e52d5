//! Session state machine.
//!
//! Single source of truth for "is a session running, for which course, since
//! when". Transitions execute under one mutex so two concurrent start
//! requests can never both succeed, and every reader (pipeline, D-Bus
//! handlers) gets a consistent snapshot rather than raw flags.
//!
//! Only one session may be active system-wide: a single physical camera
//! means a second concurrent session could never see its own students.

use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session for {course_code} is already active")]
    Conflict { course_code: String },
    #[error("no active session with id {0}")]
    NotActive(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Immutable snapshot of the active session, handed to the decision engine.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub course_code: String,
    pub start_time: DateTime<Utc>,
    pub late_after: Duration,
}

pub struct SessionController {
    storage: Arc<Storage>,
    state: Mutex<Option<SessionContext>>,
}

impl SessionController {
    /// Build the controller, re-adopting a session left active by a daemon
    /// restart so attendance capture resumes where it stopped.
    pub fn new(storage: Arc<Storage>) -> Result<Self, SessionError> {
        let recovered = storage.active_session()?.map(|row| {
            tracing::info!(session = %row.id, course = %row.course_code, "resuming active session");
            SessionContext {
                session_id: row.id,
                course_code: row.course_code,
                start_time: row.start_time,
                late_after: Duration::minutes(row.late_after_minutes),
            }
        });
        Ok(Self {
            storage,
            state: Mutex::new(recovered),
        })
    }

    /// Start a session for a course. Fails with [`SessionError::Conflict`]
    /// while any session is active.
    pub fn start(
        &self,
        course_code: &str,
        scheduled_start: Option<DateTime<Utc>>,
        late_after_minutes: i64,
        created_by: Option<&str>,
    ) -> Result<SessionContext, SessionError> {
        let mut state = self.lock_state();
        if let Some(active) = state.as_ref() {
            return Err(SessionError::Conflict {
                course_code: active.course_code.clone(),
            });
        }

        let row = self.storage.create_session(
            course_code,
            scheduled_start,
            late_after_minutes,
            created_by,
        )?;
        let context = SessionContext {
            session_id: row.id,
            course_code: row.course_code,
            start_time: row.start_time,
            late_after: Duration::minutes(row.late_after_minutes),
        };
        *state = Some(context.clone());

        tracing::info!(
            session = %context.session_id,
            course = %context.course_code,
            late_after_minutes,
            "session started"
        );
        Ok(context)
    }

    /// End the active session. The id must match; the pipeline observes the
    /// idle state on its very next decision.
    pub fn end(&self, session_id: &str) -> Result<(), SessionError> {
        let mut state = self.lock_state();
        match state.as_ref() {
            Some(active) if active.session_id == session_id => {
                self.storage.end_session(session_id)?;
                tracing::info!(session = %session_id, "session ended");
                *state = None;
                Ok(())
            }
            _ => Err(SessionError::NotActive(session_id.to_string())),
        }
    }

    /// Consistent snapshot of the current state.
    pub fn query(&self) -> Option<SessionContext> {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<SessionContext>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SessionController {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        SessionController::new(storage).unwrap()
    }

    #[test]
    fn start_conflicts_while_active_then_succeeds_after_end() {
        let sessions = controller();
        let first = sessions.start("CSC401", None, 15, None).unwrap();

        let err = sessions.start("CSC401", None, 15, None).unwrap_err();
        assert!(matches!(err, SessionError::Conflict { .. }));
        // Even a different course conflicts: one camera, one session.
        let err = sessions.start("MTH301", None, 15, None).unwrap_err();
        assert!(matches!(err, SessionError::Conflict { .. }));

        sessions.end(&first.session_id).unwrap();
        let second = sessions.start("MTH301", None, 15, None).unwrap();
        assert_ne!(first.session_id, second.session_id);
    }

    #[test]
    fn end_requires_matching_id() {
        let sessions = controller();
        sessions.start("CSC401", None, 15, None).unwrap();
        assert!(matches!(
            sessions.end("not-a-session"),
            Err(SessionError::NotActive(_))
        ));
        assert!(sessions.query().is_some());
    }

    #[test]
    fn end_without_active_session_fails() {
        let sessions = controller();
        assert!(matches!(
            sessions.end("anything"),
            Err(SessionError::NotActive(_))
        ));
    }

    #[test]
    fn query_reflects_transitions() {
        let sessions = controller();
        assert!(sessions.query().is_none());

        let context = sessions.start("CSC401", None, 20, Some("lecturer1")).unwrap();
        let snapshot = sessions.query().unwrap();
        assert_eq!(snapshot.session_id, context.session_id);
        assert_eq!(snapshot.late_after, Duration::minutes(20));

        sessions.end(&context.session_id).unwrap();
        assert!(sessions.query().is_none());
    }

    #[test]
    fn controller_recovers_active_session_from_storage() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let row = storage.create_session("CSC401", None, 15, None).unwrap();

        let sessions = SessionController::new(Arc::clone(&storage)).unwrap();
        let snapshot = sessions.query().unwrap();
        assert_eq!(snapshot.session_id, row.id);
    }
}
