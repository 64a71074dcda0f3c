//! Auto-attendance when a member joins a live session.
//!
//! Opportunistically marks the joining user present, within a bounded grace
//! window measured from meeting creation. Expiry of the window is a normal
//! outcome, not an error: the caller renders it, nothing in the database
//! moves.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::access;
use crate::attendance::{self, AttendanceStatus};
use crate::error::{ForbiddenError, NotFoundError, Result};
use crate::meeting::{self, Meeting};
use crate::punishment::{self, PunishmentSnapshot};
use crate::storage::AcademyDb;

/// Grace window after meeting creation during which joining still counts.
const JOIN_WINDOW_HOURS: i64 = 2;

/// Outcome of an auto-join attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AutoJoinOutcome {
    /// Attendance was flipped to present and the punishment counter reset
    MarkedPresent {
        punishment: Option<PunishmentSnapshot>,
    },
    /// The user was already recorded present; nothing changed
    AlreadyMarked,
    /// A non-absent excused status (permitted/sick) was already set; left
    /// untouched
    AlreadySet { current_status: AttendanceStatus },
    /// The 2-hour window has passed; nothing changed
    TimeExpired,
}

/// Mark the joining user present at the most relevant meeting of the
/// course.
///
/// Prefers a scheduled/ongoing meeting (most recently scheduled first) and
/// falls back to the latest completed one.
///
/// # Errors
/// `Forbidden` without an active enrollment; `NotFound` when the course has
/// no meetings at all.
pub fn auto_join(
    db: &AcademyDb,
    user_id: Uuid,
    course_id: Uuid,
    now: DateTime<Utc>,
) -> Result<AutoJoinOutcome> {
    let tx = db.conn().unchecked_transaction()?;

    let enrollment = punishment::fetch_enrollment(&tx, user_id, course_id)?;
    if !enrollment.map(|e| e.active).unwrap_or(false) {
        return Err(ForbiddenError::NotEnrolled { user_id, course_id }.into());
    }

    let meeting =
        relevant_meeting(&tx, course_id)?.ok_or(NotFoundError::NoMeetings(course_id))?;

    if now > meeting.created_at + Duration::hours(JOIN_WINDOW_HOURS) {
        return Ok(AutoJoinOutcome::TimeExpired);
    }

    match attendance::attendance_status(&tx, meeting.id, user_id)? {
        Some(AttendanceStatus::Present) => return Ok(AutoJoinOutcome::AlreadyMarked),
        Some(status) if status.is_excusing() => {
            return Ok(AutoJoinOutcome::AlreadySet {
                current_status: status,
            })
        }
        _ => {}
    }

    attendance::upsert_attendance(
        &tx,
        meeting.id,
        user_id,
        course_id,
        AttendanceStatus::Present,
        Some(user_id),
        None,
        now,
    )?;
    // Reset path: zero the counter directly, no recompute needed.
    let punishment = punishment::apply_mark(
        &tx,
        user_id,
        course_id,
        AttendanceStatus::Present,
        Some(user_id),
        now,
    )?;
    access::maintain_restrictions(
        &tx,
        user_id,
        course_id,
        meeting.id,
        AttendanceStatus::Present,
        now,
    )?;
    tx.commit()?;

    tracing::info!(%user_id, %course_id, meeting_id = %meeting.id, "auto-marked present on join");
    Ok(AutoJoinOutcome::MarkedPresent { punishment })
}

/// The meeting a joining user is most plausibly attending.
fn relevant_meeting(conn: &Connection, course_id: Uuid) -> Result<Option<Meeting>> {
    let select = |statuses: &str| -> String {
        format!(
            "SELECT id, course_id, title, description, meet_link, scheduled_at,
                    duration_minutes, status, created_by, created_at
             FROM meetings
             WHERE course_id = ?1 AND status IN ({statuses})
             ORDER BY scheduled_at DESC, created_at DESC, id DESC
             LIMIT 1"
        )
    };
    for statuses in ["'scheduled', 'ongoing'", "'completed'"] {
        let mut stmt = conn.prepare(&select(statuses))?;
        let mut rows = stmt.query(rusqlite::params![course_id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(meeting::row_to_meeting(row)?));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Caller, Role};
    use crate::meeting::{MeetingService, NewMeeting};

    fn staff() -> Caller {
        Caller::new(Uuid::new_v4(), Role::Lecturer)
    }

    fn setup(now: DateTime<Utc>) -> (AcademyDb, Uuid, Uuid, Meeting) {
        let db = AcademyDb::open_memory().expect("open");
        let course = db.create_course("Rust 101", now).expect("course");
        let user = Uuid::new_v4();
        db.enroll(user, course.id, now).expect("enroll");
        let meeting = MeetingService::new(&db)
            .create(
                NewMeeting {
                    course_id: course.id,
                    title: "Week 1".to_string(),
                    description: None,
                    meet_link: None,
                    scheduled_at: now,
                    duration_minutes: None,
                },
                staff(),
                now,
            )
            .expect("meeting");
        (db, course.id, user, meeting)
    }

    #[test]
    fn test_join_within_window_marks_present() {
        let now = Utc::now();
        let (db, course_id, user, meeting) = setup(now);

        let outcome = auto_join(&db, user, course_id, now + Duration::minutes(30))
            .expect("auto join");
        assert!(matches!(outcome, AutoJoinOutcome::MarkedPresent { .. }));

        let status = attendance::attendance_status(db.conn(), meeting.id, user)
            .expect("status")
            .expect("row");
        assert_eq!(status, AttendanceStatus::Present);
    }

    #[test]
    fn test_join_after_window_expires_without_mutation() {
        let now = Utc::now();
        let (db, course_id, user, meeting) = setup(now);

        let outcome =
            auto_join(&db, user, course_id, now + Duration::hours(3)).expect("auto join");
        assert!(matches!(outcome, AutoJoinOutcome::TimeExpired));

        // The seeded absent row is untouched.
        let status = attendance::attendance_status(db.conn(), meeting.id, user)
            .expect("status")
            .expect("row");
        assert_eq!(status, AttendanceStatus::Absent);
    }

    #[test]
    fn test_join_is_idempotent() {
        let now = Utc::now();
        let (db, course_id, user, _) = setup(now);

        auto_join(&db, user, course_id, now).expect("first join");
        let second = auto_join(&db, user, course_id, now).expect("second join");
        assert!(matches!(second, AutoJoinOutcome::AlreadyMarked));
    }

    #[test]
    fn test_excused_status_left_untouched() {
        let now = Utc::now();
        let (db, course_id, user, meeting) = setup(now);
        attendance::upsert_attendance(
            db.conn(),
            meeting.id,
            user,
            course_id,
            AttendanceStatus::Sick,
            None,
            None,
            now,
        )
        .expect("pre-mark sick");

        let outcome = auto_join(&db, user, course_id, now).expect("join");
        assert!(matches!(
            outcome,
            AutoJoinOutcome::AlreadySet {
                current_status: AttendanceStatus::Sick
            }
        ));
    }

    #[test]
    fn test_join_requires_active_enrollment() {
        let now = Utc::now();
        let (db, course_id, user, _) = setup(now);
        db.set_enrollment_status(user, course_id, false)
            .expect("deactivate");

        let result = auto_join(&db, user, course_id, now);
        assert!(matches!(
            result,
            Err(crate::error::CoreError::Forbidden(_))
        ));
    }
}
