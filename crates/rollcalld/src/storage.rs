//! SQLite persistence for the attendance engine.
//!
//! The engine owns its tables outright: enrolled students and their face
//! signatures, class sessions, attendance records and system settings. One
//! connection sits behind a mutex and serves both the synchronous pipeline
//! thread and the short-lived D-Bus handlers; every write that must be
//! atomic (rename cascade, session delete, insert-if-absent) happens in a
//! single statement or transaction.

use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, FaceSignature, GalleryEntry};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("signature serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid timestamp in database: {0}")]
    BadTimestamp(String),
}

/// An enrolled student as stored.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StudentRow {
    pub student_id: String,
    pub name: String,
    pub level: String,
    pub courses: Vec<String>,
    pub signature_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A class session row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionRow {
    pub id: String,
    pub course_code: String,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub late_after_minutes: i64,
    pub created_by: Option<String>,
}

/// One attendance record joined with the student's current name.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttendanceRow {
    pub student_id: String,
    pub student_name: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub course_code: String,
    pub level: String,
}

/// A new attendance record produced by the decision engine.
#[derive(Debug, Clone)]
pub struct NewAttendance<'a> {
    pub student_id: &'a str,
    pub session_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub status: &'a str,
    pub course_code: &'a str,
    pub level: &'a str,
}

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            // Best-effort; open() reports the real failure if this didn't work.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let storage = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // Recover from a poisoned mutex: SQLite state is still consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                student_id TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                level      TEXT NOT NULL DEFAULT '',
                courses    TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signatures (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                pose       TEXT NOT NULL,
                vector     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signatures_student ON signatures(student_id);
            CREATE TABLE IF NOT EXISTS sessions (
                id                 TEXT PRIMARY KEY,
                course_code        TEXT NOT NULL,
                scheduled_start    TEXT,
                start_time         TEXT NOT NULL,
                end_time           TEXT,
                is_active          INTEGER NOT NULL DEFAULT 1,
                late_after_minutes INTEGER NOT NULL,
                created_by         TEXT
            );
            CREATE TABLE IF NOT EXISTS attendance (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id  TEXT NOT NULL,
                session_id  TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                status      TEXT NOT NULL,
                course_code TEXT NOT NULL,
                level       TEXT NOT NULL,
                UNIQUE (student_id, session_id)
            );
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // --- students ---

    pub fn add_student(
        &self,
        student_id: &str,
        name: &str,
        level: &str,
        courses: &[String],
    ) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO students (student_id, name, level, courses, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                student_id,
                name,
                level,
                serde_json::to_string(courses)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Rename a student id, cascading to signatures and attendance history
    /// in one transaction. Returns false when the old id does not exist.
    pub fn rename_student(&self, old_id: &str, new_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE students SET student_id = ?1 WHERE student_id = ?2",
            params![new_id, old_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE signatures SET student_id = ?1 WHERE student_id = ?2",
            params![new_id, old_id],
        )?;
        tx.execute(
            "UPDATE attendance SET student_id = ?1 WHERE student_id = ?2",
            params![new_id, old_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn list_students(&self) -> Result<Vec<StudentRow>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT s.student_id, s.name, s.level, s.courses, s.created_at,
                    (SELECT COUNT(*) FROM signatures g WHERE g.student_id = s.student_id)
             FROM students s ORDER BY s.name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut students = Vec::new();
        for row in rows {
            let (student_id, name, level, courses, created_at, sig_count) = row?;
            students.push(StudentRow {
                student_id,
                name,
                level,
                courses: serde_json::from_str(&courses)?,
                signature_count: sig_count as usize,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(students)
    }

    /// Replace a student's entire signature set (enrollment commit or
    /// re-enrollment).
    pub fn replace_signatures(
        &self,
        student_id: &str,
        signatures: &[FaceSignature],
    ) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM signatures WHERE student_id = ?1",
            params![student_id],
        )?;
        for sig in signatures {
            tx.execute(
                "INSERT INTO signatures (student_id, pose, vector) VALUES (?1, ?2, ?3)",
                params![
                    student_id,
                    sig.pose,
                    serde_json::to_string(&sig.embedding.values)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Load every enrolled student with their signature set, ordered by
    /// student id so matcher tie-breaks stay deterministic.
    pub fn load_gallery(&self) -> Result<Vec<GalleryEntry>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT s.student_id, s.name, s.level, g.pose, g.vector
             FROM students s JOIN signatures g ON g.student_id = s.student_id
             ORDER BY s.student_id, g.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut gallery: Vec<GalleryEntry> = Vec::new();
        for row in rows {
            let (student_id, name, level, pose, vector) = row?;
            let values: Vec<f32> = serde_json::from_str(&vector)?;
            let signature = FaceSignature {
                pose,
                embedding: Embedding::new(values),
            };
            match gallery.last_mut() {
                Some(entry) if entry.student_id == student_id => entry.signatures.push(signature),
                _ => gallery.push(GalleryEntry {
                    student_id,
                    name,
                    level,
                    signatures: vec![signature],
                }),
            }
        }
        Ok(gallery)
    }

    // --- sessions ---

    pub fn create_session(
        &self,
        course_code: &str,
        scheduled_start: Option<DateTime<Utc>>,
        late_after_minutes: i64,
        created_by: Option<&str>,
    ) -> Result<SessionRow, StorageError> {
        let row = SessionRow {
            id: uuid::Uuid::new_v4().to_string(),
            course_code: course_code.to_string(),
            scheduled_start,
            start_time: Utc::now(),
            end_time: None,
            is_active: true,
            late_after_minutes,
            created_by: created_by.map(str::to_string),
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (id, course_code, scheduled_start, start_time, end_time,
                                   is_active, late_after_minutes, created_by)
             VALUES (?1, ?2, ?3, ?4, NULL, 1, ?5, ?6)",
            params![
                row.id,
                row.course_code,
                row.scheduled_start.map(|t| t.to_rfc3339()),
                row.start_time.to_rfc3339(),
                row.late_after_minutes,
                row.created_by,
            ],
        )?;
        Ok(row)
    }

    /// Mark a session ended. Returns false if it was not active.
    pub fn end_session(&self, session_id: &str) -> Result<bool, StorageError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET end_time = ?1, is_active = 0
             WHERE id = ?2 AND is_active = 1",
            params![Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(changed > 0)
    }

    pub fn active_session(&self) -> Result<Option<SessionRow>, StorageError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, course_code, scheduled_start, start_time, end_time,
                    is_active, late_after_minutes, created_by
             FROM sessions WHERE is_active = 1 ORDER BY start_time DESC LIMIT 1",
            [],
            session_from_row,
        )
        .optional()?
        .transpose()
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, StorageError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, course_code, scheduled_start, start_time, end_time,
                    is_active, late_after_minutes, created_by
             FROM sessions WHERE id = ?1",
            params![session_id],
            session_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Delete a session and cascade its attendance records. Other sessions'
    /// records are untouched. Returns false for an unknown id.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM attendance WHERE session_id = ?1",
            params![session_id],
        )?;
        let changed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    // --- attendance ---

    /// Insert-if-absent under the (student_id, session_id) uniqueness
    /// constraint. Returns true when a new record was created, false when
    /// the student was already marked for this session.
    pub fn insert_attendance_if_absent(
        &self,
        record: &NewAttendance<'_>,
    ) -> Result<bool, StorageError> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO attendance
                 (student_id, session_id, timestamp, status, course_code, level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.student_id,
                record.session_id,
                record.timestamp.to_rfc3339(),
                record.status,
                record.course_code,
                record.level,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn session_attendance(&self, session_id: &str) -> Result<Vec<AttendanceRow>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT a.student_id, COALESCE(s.name, ''), a.session_id, a.timestamp,
                    a.status, a.course_code, a.level
             FROM attendance a LEFT JOIN students s ON s.student_id = a.student_id
             WHERE a.session_id = ?1 ORDER BY a.timestamp",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (student_id, student_name, session_id, timestamp, status, course_code, level) =
                row?;
            records.push(AttendanceRow {
                student_id,
                student_name,
                session_id,
                timestamp: parse_ts(&timestamp)?,
                status,
                course_code,
                level,
            });
        }
        Ok(records)
    }

    // --- settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Run arbitrary SQL; test-only hook for failure injection.
    #[cfg(test)]
    pub fn execute_raw(&self, sql: &str) -> Result<(), StorageError> {
        self.lock().execute_batch(sql)?;
        Ok(())
    }
}

type SessionTuple = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    i64,
    i64,
    Option<String>,
);

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<SessionRow, StorageError>> {
    let tuple: SessionTuple = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    );
    Ok(build_session(tuple))
}

fn build_session(tuple: SessionTuple) -> Result<SessionRow, StorageError> {
    let (id, course_code, scheduled_start, start_time, end_time, is_active, late_after, created_by) =
        tuple;
    Ok(SessionRow {
        id,
        course_code,
        scheduled_start: scheduled_start.as_deref().map(parse_ts).transpose()?,
        start_time: parse_ts(&start_time)?,
        end_time: end_time.as_deref().map(parse_ts).transpose()?,
        is_active: is_active != 0,
        late_after_minutes: late_after,
        created_by,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StorageError::BadTimestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn sig(pose: &str, values: Vec<f32>) -> FaceSignature {
        FaceSignature {
            pose: pose.to_string(),
            embedding: Embedding::new(values),
        }
    }

    fn record<'a>(student: &'a str, session: &'a str) -> NewAttendance<'a> {
        NewAttendance {
            student_id: student,
            session_id: session,
            timestamp: Utc::now(),
            status: "present",
            course_code: "CSC401",
            level: "400",
        }
    }

    #[test]
    fn attendance_insert_is_idempotent() {
        let db = storage();
        db.add_student("MAT100", "Ada Obi", "400", &[]).unwrap();
        let session = db.create_session("CSC401", None, 15, None).unwrap();

        assert!(db
            .insert_attendance_if_absent(&record("MAT100", &session.id))
            .unwrap());
        assert!(!db
            .insert_attendance_if_absent(&record("MAT100", &session.id))
            .unwrap());

        let rows = db.session_attendance(&session.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "present");
        assert_eq!(rows[0].student_name, "Ada Obi");
    }

    #[test]
    fn delete_session_cascades_only_its_records() {
        let db = storage();
        db.add_student("MAT100", "Ada Obi", "400", &[]).unwrap();
        let a = db.create_session("CSC401", None, 15, None).unwrap();
        db.end_session(&a.id).unwrap();
        let b = db.create_session("CSC402", None, 15, None).unwrap();

        db.insert_attendance_if_absent(&record("MAT100", &a.id))
            .unwrap();
        db.insert_attendance_if_absent(&record("MAT100", &b.id))
            .unwrap();

        assert!(db.delete_session(&a.id).unwrap());
        assert!(db.session_attendance(&a.id).unwrap().is_empty());
        assert_eq!(db.session_attendance(&b.id).unwrap().len(), 1);
        assert!(db.get_session(&a.id).unwrap().is_none());
        assert!(!db.delete_session(&a.id).unwrap());
    }

    #[test]
    fn rename_student_cascades() {
        let db = storage();
        db.add_student("MAT100", "Ada Obi", "400", &["CSC401".to_string()])
            .unwrap();
        db.replace_signatures("MAT100", &[sig("center", vec![0.1, 0.2])])
            .unwrap();
        let session = db.create_session("CSC401", None, 15, None).unwrap();
        db.insert_attendance_if_absent(&record("MAT100", &session.id))
            .unwrap();

        assert!(db.rename_student("MAT100", "MAT999").unwrap());
        assert!(!db.rename_student("MAT100", "MAT888").unwrap());

        let gallery = db.load_gallery().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].student_id, "MAT999");

        let rows = db.session_attendance(&session.id).unwrap();
        assert_eq!(rows[0].student_id, "MAT999");
    }

    #[test]
    fn gallery_groups_signatures_per_student() {
        let db = storage();
        db.add_student("MAT200", "Bisi Ade", "300", &[]).unwrap();
        db.add_student("MAT100", "Ada Obi", "400", &[]).unwrap();
        db.replace_signatures(
            "MAT100",
            &[sig("center", vec![0.1]), sig("left", vec![0.2])],
        )
        .unwrap();
        db.replace_signatures("MAT200", &[sig("center", vec![0.3])])
            .unwrap();

        let gallery = db.load_gallery().unwrap();
        // Ordered by student id for deterministic matching.
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].student_id, "MAT100");
        assert_eq!(gallery[0].signatures.len(), 2);
        assert_eq!(gallery[1].student_id, "MAT200");
        assert_eq!(gallery[1].level, "300");
    }

    #[test]
    fn replace_signatures_discards_previous_set() {
        let db = storage();
        db.add_student("MAT100", "Ada Obi", "400", &[]).unwrap();
        db.replace_signatures("MAT100", &[sig("center", vec![0.1])])
            .unwrap();
        db.replace_signatures("MAT100", &[sig("up", vec![0.9]), sig("down", vec![0.8])])
            .unwrap();

        let gallery = db.load_gallery().unwrap();
        assert_eq!(gallery[0].signatures.len(), 2);
        assert_eq!(gallery[0].signatures[0].pose, "up");
    }

    #[test]
    fn session_lifecycle() {
        let db = storage();
        let session = db.create_session("CSC401", None, 20, Some("lecturer1")).unwrap();

        let active = db.active_session().unwrap().unwrap();
        assert_eq!(active.id, session.id);
        assert!(active.is_active);
        assert!(active.end_time.is_none());
        assert_eq!(active.late_after_minutes, 20);

        assert!(db.end_session(&session.id).unwrap());
        assert!(!db.end_session(&session.id).unwrap());
        assert!(db.active_session().unwrap().is_none());

        let ended = db.get_session(&session.id).unwrap().unwrap();
        assert!(!ended.is_active);
        assert!(ended.end_time.is_some());
    }

    #[test]
    fn settings_roundtrip_and_overwrite() {
        let db = storage();
        assert!(db.get_setting("late_after_minutes").unwrap().is_none());
        db.set_setting("late_after_minutes", "15").unwrap();
        db.set_setting("late_after_minutes", "20").unwrap();
        assert_eq!(
            db.get_setting("late_after_minutes").unwrap().as_deref(),
            Some("20")
        );
    }

    #[test]
    fn student_listing_includes_signature_count() {
        let db = storage();
        db.add_student("MAT100", "Ada Obi", "400", &["CSC401".to_string()])
            .unwrap();
        db.replace_signatures("MAT100", &[sig("center", vec![0.1])])
            .unwrap();

        let students = db.list_students().unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].signature_count, 1);
        assert_eq!(students[0].courses, vec!["CSC401".to_string()]);
    }
}
