//! Punishment engine.
//!
//! Keeps `consecutive_absence` / `punishment_status` on an enrollment
//! synchronized with attendance history and logs every tier transition.
//!
//! Two update modes that must converge on the same history:
//!
//! - **Incremental** ([`apply_mark`]): runs inside the marking transaction.
//!   An absent mark bumps the counter by one; an excusing mark zeroes it.
//! - **Recompute** ([`PunishmentEngine::recompute`]): rebuilds the counter
//!   from the full meeting history, newest first, and corrects the stored
//!   value when it disagrees. Safe to repeat; this is the repair path for
//!   any drift the incremental mode missed.
//!
//! Tier state machine: `none -(absent)-> warning_1 -(absent)-> warning_2
//! -(absent)-> suspended`; any excusing mark returns to `none` from any
//! tier. `suspended` is only left via an excusing mark or a manual reset.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attendance::AttendanceStatus;
use crate::error::{DatabaseError, ForbiddenError, NotFoundError, Result};
use crate::identity::Caller;
use crate::storage::database::{parse_ts, parse_uuid};
use crate::storage::AcademyDb;

/// Note attached to log entries written by the incremental path.
const AUTO_TRIGGER_NOTE: &str = "Auto-triggered by attendance system";
/// Note attached to log entries written by the recompute path.
const RECOMPUTE_NOTE: &str = "Recalculated from attendance history";

/// Escalation tier, ordered: none < warning_1 < warning_2 < suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentTier {
    None,
    Warning1,
    Warning2,
    Suspended,
}

impl PunishmentTier {
    /// The tier is a pure function of the consecutive-absence counter.
    pub fn for_consecutive(consecutive_absence: u32) -> Self {
        match consecutive_absence {
            0 => PunishmentTier::None,
            1 => PunishmentTier::Warning1,
            2 => PunishmentTier::Warning2,
            _ => PunishmentTier::Suspended,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PunishmentTier::None => "none",
            PunishmentTier::Warning1 => "warning_1",
            PunishmentTier::Warning2 => "warning_2",
            PunishmentTier::Suspended => "suspended",
        }
    }

    pub(crate) fn parse_db(value: &str) -> Result<Self, DatabaseError> {
        match value {
            "none" => Ok(PunishmentTier::None),
            "warning_1" => Ok(PunishmentTier::Warning1),
            "warning_2" => Ok(PunishmentTier::Warning2),
            "suspended" => Ok(PunishmentTier::Suspended),
            other => Err(DatabaseError::CorruptValue {
                table: "enrollments",
                column: "punishment_status",
                message: format!("unknown tier '{other}'"),
            }),
        }
    }
}

/// A (user, course) enrollment carrying the punishment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: i64,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub active: bool,
    pub consecutive_absence: u32,
    pub punishment_status: PunishmentTier,
    pub punishment_updated_at: Option<DateTime<Utc>>,
}

/// The punishment state of one enrollment at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentSnapshot {
    pub consecutive_absence: u32,
    pub punishment_status: PunishmentTier,
}

/// One append-only audit entry, written on every tier transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunishmentLogEntry {
    pub id: i64,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub enrollment_id: i64,
    pub action: PunishmentTier,
    pub consecutive_absence: u32,
    pub triggered_by: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot plus recent audit entries, as served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PunishmentReport {
    pub consecutive_absence: u32,
    pub punishment_status: PunishmentTier,
    pub logs: Vec<PunishmentLogEntry>,
}

/// One row of the per-course punishment overview (lecturer dashboard).
#[derive(Debug, Clone, Serialize)]
pub struct OverviewRow {
    pub user_id: Uuid,
    pub active: bool,
    pub consecutive_absence: u32,
    pub punishment_status: PunishmentTier,
    pub punishment_updated_at: Option<DateTime<Utc>>,
}

/// Derives and maintains punishment state against the shared database.
pub struct PunishmentEngine<'a> {
    db: &'a AcademyDb,
}

impl<'a> PunishmentEngine<'a> {
    pub fn new(db: &'a AcademyDb) -> Self {
        Self { db }
    }

    /// Recompute the punishment state from the full attendance history and
    /// correct the stored enrollment if it drifted.
    ///
    /// Meetings are walked newest first (schedule time, then creation time,
    /// then id, all descending, so ties are deterministic). A meeting with
    /// no attendance row counts as absent: meeting creation seeds an absent
    /// row for every active member, so a missing row means the seed itself
    /// was lost, not that the user was excused.
    ///
    /// # Errors
    /// `NotFound` if the user has no enrollment in the course.
    pub fn recompute(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        triggered_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<PunishmentSnapshot> {
        let tx = self.db.conn().unchecked_transaction()?;
        let enrollment = fetch_enrollment(&tx, user_id, course_id)?
            .ok_or(NotFoundError::Enrollment { user_id, course_id })?;

        let history = attendance_history(&tx, user_id, course_id)?;
        let consecutive = trailing_absences(&history);
        let tier = PunishmentTier::for_consecutive(consecutive);

        let snapshot = PunishmentSnapshot {
            consecutive_absence: consecutive,
            punishment_status: tier,
        };
        if consecutive != enrollment.consecutive_absence
            || tier != enrollment.punishment_status
        {
            tracing::info!(
                %user_id, %course_id,
                stored = enrollment.consecutive_absence,
                recomputed = consecutive,
                "correcting drifted punishment state"
            );
            write_enrollment_state(&tx, enrollment.id, snapshot, now)?;
            if tier != enrollment.punishment_status {
                append_log(
                    &tx,
                    &enrollment,
                    snapshot,
                    triggered_by,
                    RECOMPUTE_NOTE,
                    now,
                )?;
            }
        }
        tx.commit()?;
        Ok(snapshot)
    }

    /// Current punishment state (always freshly recomputed) plus the ten
    /// most recent audit entries.
    pub fn status(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PunishmentReport> {
        let snapshot = self.recompute(user_id, course_id, None, now)?;
        let logs = self.logs(course_id, Some(user_id), 10)?;
        Ok(PunishmentReport {
            consecutive_absence: snapshot.consecutive_absence,
            punishment_status: snapshot.punishment_status,
            logs,
        })
    }

    /// Manually reset the punishment state to zero. Staff only.
    ///
    /// Always writes an audit entry, even when the state was already clean,
    /// so the reset itself is on record.
    pub fn reset(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        notes: Option<&str>,
        caller: Caller,
        now: DateTime<Utc>,
    ) -> Result<PunishmentSnapshot> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("reset punishment").into());
        }
        let tx = self.db.conn().unchecked_transaction()?;
        let enrollment = fetch_enrollment(&tx, user_id, course_id)?
            .ok_or(NotFoundError::Enrollment { user_id, course_id })?;

        let snapshot = PunishmentSnapshot {
            consecutive_absence: 0,
            punishment_status: PunishmentTier::None,
        };
        write_enrollment_state(&tx, enrollment.id, snapshot, now)?;
        append_log(
            &tx,
            &enrollment,
            snapshot,
            Some(caller.user_id),
            notes.unwrap_or("Manual reset by lecturer/admin"),
            now,
        )?;
        tx.commit()?;
        Ok(snapshot)
    }

    /// Audit entries for a course, newest first, optionally scoped to one
    /// user.
    pub fn logs(
        &self,
        course_id: Uuid,
        user_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<PunishmentLogEntry>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, user_id, course_id, enrollment_id, action, consecutive_absence,
                    triggered_by, notes, created_at
             FROM punishment_logs
             WHERE course_id = ?1 AND (?2 IS NULL OR user_id = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![
            course_id.to_string(),
            user_id.map(|id| id.to_string()),
            limit
        ])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_log(row)?);
        }
        Ok(entries)
    }

    /// Per-student punishment overview for a course, worst offenders first.
    pub fn overview(&self, course_id: Uuid) -> Result<Vec<OverviewRow>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT user_id, status, consecutive_absence, punishment_status, punishment_updated_at
             FROM enrollments WHERE course_id = ?1
             ORDER BY consecutive_absence DESC, user_id ASC",
        )?;
        let mut rows = stmt.query(params![course_id.to_string()])?;
        let mut overview = Vec::new();
        while let Some(row) = rows.next()? {
            let user_id: String = row.get(0)?;
            let status: String = row.get(1)?;
            let consecutive: i64 = row.get(2)?;
            let tier: String = row.get(3)?;
            let updated_at: Option<String> = row.get(4)?;
            overview.push(OverviewRow {
                user_id: parse_uuid("enrollments", "user_id", &user_id)?,
                active: status == "active",
                consecutive_absence: consecutive.max(0) as u32,
                punishment_status: PunishmentTier::parse_db(&tier)?,
                punishment_updated_at: match updated_at {
                    Some(ts) => Some(parse_ts("enrollments", "punishment_updated_at", &ts)?),
                    None => None,
                },
            });
        }
        Ok(overview)
    }
}

/// Incremental update, run inside the marking transaction.
///
/// Absent bumps the counter; an excusing status zeroes it. A log entry is
/// appended only when the resulting tier differs from the stored one, so a
/// fourth consecutive absence (still `suspended`) stays quiet. Returns
/// `None` when the user holds no enrollment in the course: staff may mark
/// walk-ins, which simply have no punishment state to maintain.
pub(crate) fn apply_mark(
    conn: &Connection,
    user_id: Uuid,
    course_id: Uuid,
    status: AttendanceStatus,
    triggered_by: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Option<PunishmentSnapshot>> {
    let Some(enrollment) = fetch_enrollment(conn, user_id, course_id)? else {
        return Ok(None);
    };

    let consecutive = if status == AttendanceStatus::Absent {
        enrollment.consecutive_absence + 1
    } else {
        0
    };
    let snapshot = PunishmentSnapshot {
        consecutive_absence: consecutive,
        punishment_status: PunishmentTier::for_consecutive(consecutive),
    };

    write_enrollment_state(conn, enrollment.id, snapshot, now)?;
    if snapshot.punishment_status != enrollment.punishment_status {
        append_log(conn, &enrollment, snapshot, triggered_by, AUTO_TRIGGER_NOTE, now)?;
    }
    Ok(Some(snapshot))
}

/// Fetch the enrollment row for (user, course), if any.
pub(crate) fn fetch_enrollment(
    conn: &Connection,
    user_id: Uuid,
    course_id: Uuid,
) -> Result<Option<Enrollment>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, course_id, status, consecutive_absence, punishment_status,
                punishment_updated_at
         FROM enrollments WHERE user_id = ?1 AND course_id = ?2",
    )?;
    let mut rows = stmt.query(params![user_id.to_string(), course_id.to_string()])?;
    match rows.next()? {
        Some(row) => {
            let user: String = row.get(1)?;
            let course: String = row.get(2)?;
            let status: String = row.get(3)?;
            let consecutive: i64 = row.get(4)?;
            let tier: String = row.get(5)?;
            let updated_at: Option<String> = row.get(6)?;
            Ok(Some(Enrollment {
                id: row.get(0)?,
                user_id: parse_uuid("enrollments", "user_id", &user)?,
                course_id: parse_uuid("enrollments", "course_id", &course)?,
                active: status == "active",
                consecutive_absence: consecutive.max(0) as u32,
                punishment_status: PunishmentTier::parse_db(&tier)?,
                punishment_updated_at: match updated_at {
                    Some(ts) => Some(parse_ts("enrollments", "punishment_updated_at", &ts)?),
                    None => None,
                },
            }))
        }
        None => Ok(None),
    }
}

fn write_enrollment_state(
    conn: &Connection,
    enrollment_id: i64,
    snapshot: PunishmentSnapshot,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE enrollments
         SET consecutive_absence = ?1, punishment_status = ?2, punishment_updated_at = ?3
         WHERE id = ?4",
        params![
            snapshot.consecutive_absence,
            snapshot.punishment_status.as_str(),
            now.to_rfc3339(),
            enrollment_id
        ],
    )?;
    Ok(())
}

pub(crate) fn append_log(
    conn: &Connection,
    enrollment: &Enrollment,
    snapshot: PunishmentSnapshot,
    triggered_by: Option<Uuid>,
    notes: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO punishment_logs
             (user_id, course_id, enrollment_id, action, consecutive_absence,
              triggered_by, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            enrollment.user_id.to_string(),
            enrollment.course_id.to_string(),
            enrollment.id,
            snapshot.punishment_status.as_str(),
            snapshot.consecutive_absence,
            triggered_by.map(|id| id.to_string()),
            notes,
            now.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn row_to_log(row: &rusqlite::Row) -> Result<PunishmentLogEntry> {
    let user_id: String = row.get(1)?;
    let course_id: String = row.get(2)?;
    let action: String = row.get(4)?;
    let consecutive: i64 = row.get(5)?;
    let triggered_by: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    Ok(PunishmentLogEntry {
        id: row.get(0)?,
        user_id: parse_uuid("punishment_logs", "user_id", &user_id)?,
        course_id: parse_uuid("punishment_logs", "course_id", &course_id)?,
        enrollment_id: row.get(3)?,
        action: PunishmentTier::parse_db(&action)?,
        consecutive_absence: consecutive.max(0) as u32,
        triggered_by: match triggered_by {
            Some(id) => Some(parse_uuid("punishment_logs", "triggered_by", &id)?),
            None => None,
        },
        notes: row.get(7)?,
        created_at: parse_ts("punishment_logs", "created_at", &created_at)?,
    })
}

/// The user's attendance over the course's meetings, newest meeting first.
/// `None` means the meeting has no attendance row for the user.
fn attendance_history(
    conn: &Connection,
    user_id: Uuid,
    course_id: Uuid,
) -> Result<Vec<Option<AttendanceStatus>>> {
    let mut stmt = conn.prepare(
        "SELECT a.status
         FROM meetings m
         LEFT JOIN attendance a ON a.meeting_id = m.id AND a.user_id = ?2
         WHERE m.course_id = ?1
         ORDER BY m.scheduled_at DESC, m.created_at DESC, m.id DESC",
    )?;
    let mut rows = stmt.query(params![course_id.to_string(), user_id.to_string()])?;
    let mut history = Vec::new();
    while let Some(row) = rows.next()? {
        let status: Option<String> = row.get(0)?;
        history.push(match status {
            Some(s) => Some(AttendanceStatus::parse_db(&s)?),
            None => None,
        });
    }
    Ok(history)
}

/// Count trailing absences in a newest-first history, stopping at the first
/// excusing status. A missing row counts as absent.
fn trailing_absences(history: &[Option<AttendanceStatus>]) -> u32 {
    let mut count = 0;
    for status in history {
        match status {
            Some(s) if s.is_excusing() => break,
            _ => count += 1,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use AttendanceStatus::{Absent, Permitted, Present, Sick};

    #[test]
    fn test_tier_function() {
        assert_eq!(PunishmentTier::for_consecutive(0), PunishmentTier::None);
        assert_eq!(PunishmentTier::for_consecutive(1), PunishmentTier::Warning1);
        assert_eq!(PunishmentTier::for_consecutive(2), PunishmentTier::Warning2);
        assert_eq!(PunishmentTier::for_consecutive(3), PunishmentTier::Suspended);
        assert_eq!(PunishmentTier::for_consecutive(17), PunishmentTier::Suspended);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(PunishmentTier::None < PunishmentTier::Warning1);
        assert!(PunishmentTier::Warning1 < PunishmentTier::Warning2);
        assert!(PunishmentTier::Warning2 < PunishmentTier::Suspended);
    }

    #[test]
    fn test_trailing_absences_stops_at_excusing() {
        let history = vec![Some(Absent), Some(Absent), Some(Present), Some(Absent)];
        assert_eq!(trailing_absences(&history), 2);

        let history = vec![Some(Present), Some(Absent)];
        assert_eq!(trailing_absences(&history), 0);

        let history = vec![Some(Absent), Some(Sick), Some(Absent)];
        assert_eq!(trailing_absences(&history), 1);

        let history = vec![Some(Absent), Some(Permitted)];
        assert_eq!(trailing_absences(&history), 1);
    }

    #[test]
    fn test_trailing_absences_missing_row_counts_as_absent() {
        let history = vec![None, Some(Absent), Some(Present)];
        assert_eq!(trailing_absences(&history), 2);

        let history = vec![None, None, None];
        assert_eq!(trailing_absences(&history), 3);
    }

    #[test]
    fn test_trailing_absences_empty_history() {
        assert_eq!(trailing_absences(&[]), 0);
    }
}
