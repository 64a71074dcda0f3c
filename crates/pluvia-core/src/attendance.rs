//! Attendance recording.
//!
//! [`AttendanceRecorder`] persists the outcome of an attendance-taking pass
//! for a meeting, one row per (meeting, user), maintained by upsert. Every
//! mark cascades into the punishment engine and the material access guard
//! inside the same SQLite transaction, so the enrollment counter and the
//! restriction rows can never drift from the attendance row that caused
//! them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access;
use crate::error::{ForbiddenError, NotFoundError, Result, ValidationError};
use crate::identity::Caller;
use crate::meeting;
use crate::punishment::{self, PunishmentSnapshot};
use crate::storage::database::{parse_ts, parse_uuid};
use crate::storage::AcademyDb;

/// Status recorded for one user at one meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Permitted,
    Sick,
}

impl AttendanceStatus {
    /// Present, permitted, and sick all excuse the user; only absent feeds
    /// the punishment counter.
    pub fn is_excusing(self) -> bool {
        !matches!(self, AttendanceStatus::Absent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Permitted => "permitted",
            AttendanceStatus::Sick => "sick",
        }
    }

    /// Parse a wire string, rejecting anything outside the four statuses.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            "permitted" => Ok(AttendanceStatus::Permitted),
            "sick" => Ok(AttendanceStatus::Sick),
            other => Err(ValidationError::InvalidStatus(other.to_string())),
        }
    }

    pub(crate) fn parse_db(value: &str) -> Result<Self, crate::error::DatabaseError> {
        Self::parse(value).map_err(|_| crate::error::DatabaseError::CorruptValue {
            table: "attendance",
            column: "status",
            message: format!("unknown status '{value}'"),
        })
    }
}

/// One persisted attendance row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub meeting_id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub status: AttendanceStatus,
    pub marked_by: Option<Uuid>,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a single mark: the row that was written plus the punishment
/// state it produced. `punishment` is `None` when the marked user holds no
/// enrollment in the meeting's course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkOutcome {
    pub attendance: AttendanceRecord,
    pub punishment: Option<PunishmentSnapshot>,
}

/// One entry of a bulk attendance pass.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkEntry {
    pub user_id: Uuid,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
}

/// Records attendance against the shared database.
pub struct AttendanceRecorder<'a> {
    db: &'a AcademyDb,
}

impl<'a> AttendanceRecorder<'a> {
    pub fn new(db: &'a AcademyDb) -> Self {
        Self { db }
    }

    /// Mark one user's attendance at a meeting.
    ///
    /// Upserts the (meeting, user) row, then runs the punishment engine's
    /// incremental step and the access guard's restriction maintenance, all
    /// in one transaction. Staff only.
    pub fn mark(
        &self,
        meeting_id: Uuid,
        user_id: Uuid,
        status: AttendanceStatus,
        caller: Caller,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("mark attendance").into());
        }

        let tx = self.db.conn().unchecked_transaction()?;
        let course_id = meeting::course_of_meeting(&tx, meeting_id)?
            .ok_or(NotFoundError::Meeting(meeting_id))?;

        let record = upsert_attendance(
            &tx,
            meeting_id,
            user_id,
            course_id,
            status,
            Some(caller.user_id),
            None,
            now,
        )?;
        let punishment =
            punishment::apply_mark(&tx, user_id, course_id, status, Some(caller.user_id), now)?;
        access::maintain_restrictions(&tx, user_id, course_id, meeting_id, status, now)?;
        tx.commit()?;

        tracing::debug!(
            %meeting_id, %user_id, status = status.as_str(),
            "attendance marked"
        );
        Ok(MarkOutcome {
            attendance: record,
            punishment,
        })
    }

    /// Mark many users at once and close the meeting.
    ///
    /// Runs the full per-user cascade for every entry; skipping it would
    /// leave `consecutive_absence` stale until the next recompute. The
    /// meeting flips to `completed` in the same transaction. Staff only.
    pub fn bulk_mark(
        &self,
        meeting_id: Uuid,
        entries: &[BulkEntry],
        caller: Caller,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("bulk-mark attendance").into());
        }
        if entries.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "attendance_list",
                message: "must not be empty".to_string(),
            }
            .into());
        }

        let tx = self.db.conn().unchecked_transaction()?;
        let course_id = meeting::course_of_meeting(&tx, meeting_id)?
            .ok_or(NotFoundError::Meeting(meeting_id))?;

        for entry in entries {
            upsert_attendance(
                &tx,
                meeting_id,
                entry.user_id,
                course_id,
                entry.status,
                Some(caller.user_id),
                entry.notes.as_deref(),
                now,
            )?;
            punishment::apply_mark(
                &tx,
                entry.user_id,
                course_id,
                entry.status,
                Some(caller.user_id),
                now,
            )?;
            access::maintain_restrictions(&tx, entry.user_id, course_id, meeting_id, entry.status, now)?;
        }
        meeting::set_meeting_status(&tx, meeting_id, meeting::MeetingStatus::Completed)?;
        tx.commit()?;

        tracing::info!(%meeting_id, count = entries.len(), "bulk attendance recorded");
        Ok(entries.len())
    }

    /// The attendance sheet for one meeting.
    pub fn attendance_by_meeting(&self, meeting_id: Uuid) -> Result<Vec<AttendanceRecord>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, meeting_id, user_id, course_id, status, marked_by, notes, updated_at
             FROM attendance WHERE meeting_id = ?1 ORDER BY status ASC, user_id ASC",
        )?;
        let mut rows = stmt.query(params![meeting_id.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}

/// Upsert one attendance row keyed on (meeting, user). Re-marking keeps the
/// row id and overwrites status, marker, and notes; last write wins.
#[allow(clippy::too_many_arguments)]
pub(crate) fn upsert_attendance(
    conn: &Connection,
    meeting_id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    status: AttendanceStatus,
    marked_by: Option<Uuid>,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AttendanceRecord> {
    conn.execute(
        "INSERT INTO attendance (meeting_id, user_id, course_id, status, marked_by, notes, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (meeting_id, user_id) DO UPDATE SET
             status = excluded.status,
             marked_by = excluded.marked_by,
             notes = excluded.notes,
             updated_at = excluded.updated_at",
        params![
            meeting_id.to_string(),
            user_id.to_string(),
            course_id.to_string(),
            status.as_str(),
            marked_by.map(|id| id.to_string()),
            notes,
            now.to_rfc3339()
        ],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM attendance WHERE meeting_id = ?1 AND user_id = ?2",
        params![meeting_id.to_string(), user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(AttendanceRecord {
        id,
        meeting_id,
        user_id,
        course_id,
        status,
        marked_by,
        notes: notes.map(str::to_string),
        updated_at: now,
    })
}

/// The stored status for one (meeting, user), if any.
pub(crate) fn attendance_status(
    conn: &Connection,
    meeting_id: Uuid,
    user_id: Uuid,
) -> Result<Option<AttendanceStatus>> {
    let mut stmt = conn.prepare(
        "SELECT status FROM attendance WHERE meeting_id = ?1 AND user_id = ?2",
    )?;
    let mut rows = stmt.query(params![meeting_id.to_string(), user_id.to_string()])?;
    match rows.next()? {
        Some(row) => {
            let status: String = row.get(0)?;
            Ok(Some(AttendanceStatus::parse_db(&status)?))
        }
        None => Ok(None),
    }
}

fn row_to_record(row: &rusqlite::Row) -> Result<AttendanceRecord> {
    let meeting_id: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let course_id: String = row.get(3)?;
    let status: String = row.get(4)?;
    let marked_by: Option<String> = row.get(5)?;
    let updated_at: String = row.get(7)?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        meeting_id: parse_uuid("attendance", "meeting_id", &meeting_id)?,
        user_id: parse_uuid("attendance", "user_id", &user_id)?,
        course_id: parse_uuid("attendance", "course_id", &course_id)?,
        status: AttendanceStatus::parse_db(&status)?,
        marked_by: match marked_by {
            Some(id) => Some(parse_uuid("attendance", "marked_by", &id)?),
            None => None,
        },
        notes: row.get(6)?,
        updated_at: parse_ts("attendance", "updated_at", &updated_at)?,
    })
}
