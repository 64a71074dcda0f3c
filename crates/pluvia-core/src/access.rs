//! Material access guard.
//!
//! Decides whether a user may open a course material and maintains the
//! restriction rows behind that decision.
//!
//! The attendance-history rule is authoritative: any present/permitted/sick
//! record anywhere in the material's course unlocks access. It is
//! idempotent and self-heals without a background sweep, so the restriction
//! table only backs the denial message shown to the user, never the grant.
//! Manual unlocks sit above both layers.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attendance::AttendanceStatus;
use crate::error::{ForbiddenError, Result};
use crate::identity::Caller;
use crate::storage::database::{parse_ts, parse_uuid};
use crate::storage::AcademyDb;

/// Reason code stored on restriction rows created by an absence.
const ABSENT_REASON: &str = "absent_from_meeting";

/// Why an access decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    /// An administrative unlock exists for this (user, material)
    ManualAccessGranted,
    /// At least one excusing attendance record exists in the course
    ValidAttendance,
    /// The material does not exist; denied, fail-closed
    MaterialNotFound,
    /// Attendance is exclusively absent
    AbsentNoAccess,
}

/// A lock on one material for one user, originating from a missed meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Restriction {
    pub id: i64,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub material_id: Uuid,
    pub meeting_id: Uuid,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub lifted_at: Option<DateTime<Utc>>,
}

/// Outcome of an access check.
#[derive(Debug, Clone, Serialize)]
pub struct AccessDecision {
    pub can_access: bool,
    pub reason: AccessReason,
    /// The most relevant active restriction, for UI messaging on denial.
    pub restriction: Option<Restriction>,
}

impl AccessDecision {
    fn allow(reason: AccessReason) -> Self {
        Self {
            can_access: true,
            reason,
            restriction: None,
        }
    }

    fn deny(reason: AccessReason, restriction: Option<Restriction>) -> Self {
        Self {
            can_access: false,
            reason,
            restriction,
        }
    }
}

/// Answers access checks and administers the manual-unlock override layer.
pub struct MaterialAccessGuard<'a> {
    db: &'a AcademyDb,
}

impl<'a> MaterialAccessGuard<'a> {
    pub fn new(db: &'a AcademyDb) -> Self {
        Self { db }
    }

    /// Can this user open this material right now?
    pub fn check_access(&self, user_id: Uuid, material_id: Uuid) -> Result<AccessDecision> {
        let conn = self.db.conn();

        if has_manual_unlock(conn, user_id, material_id)? {
            return Ok(AccessDecision::allow(AccessReason::ManualAccessGranted));
        }

        let course_id = match self.db.material_course(material_id) {
            Ok(course_id) => course_id,
            Err(crate::error::CoreError::NotFound(_)) => {
                return Ok(AccessDecision::deny(AccessReason::MaterialNotFound, None));
            }
            Err(e) => return Err(e),
        };

        if has_excusing_attendance(conn, user_id, course_id)? {
            return Ok(AccessDecision::allow(AccessReason::ValidAttendance));
        }

        let restriction = active_restriction(conn, user_id, material_id)?;
        Ok(AccessDecision::deny(
            AccessReason::AbsentNoAccess,
            restriction,
        ))
    }

    /// Grant a manual unlock, overriding attendance. Staff only;
    /// idempotent.
    pub fn grant_unlock(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        caller: Caller,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("grant unlock").into());
        }
        // Material must exist; unlocks against unknown ids would dangle.
        self.db.material_course(material_id)?;
        self.db.conn().execute(
            "INSERT OR IGNORE INTO material_unlocks (user_id, material_id, granted_by, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id.to_string(),
                material_id.to_string(),
                caller.user_id.to_string(),
                now.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Revoke a manual unlock. Staff only; a no-op if none exists.
    pub fn revoke_unlock(&self, user_id: Uuid, material_id: Uuid, caller: Caller) -> Result<()> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("revoke unlock").into());
        }
        self.db.conn().execute(
            "DELETE FROM material_unlocks WHERE user_id = ?1 AND material_id = ?2",
            params![user_id.to_string(), material_id.to_string()],
        )?;
        Ok(())
    }
}

/// Restriction maintenance, run inside the marking transaction.
///
/// On absence: one restriction per course material, unless an active one
/// already exists for that (user, material). First restriction wins; the
/// partial unique index turns duplicates into no-ops. On an excusing mark:
/// lift the active restrictions tied to this specific meeting.
pub(crate) fn maintain_restrictions(
    conn: &Connection,
    user_id: Uuid,
    course_id: Uuid,
    meeting_id: Uuid,
    status: AttendanceStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    if status == AttendanceStatus::Absent {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO material_access_restrictions
                 (user_id, course_id, material_id, meeting_id, reason, created_at)
             SELECT ?1, ?2, id, ?3, ?4, ?5 FROM materials WHERE course_id = ?2",
            params![
                user_id.to_string(),
                course_id.to_string(),
                meeting_id.to_string(),
                ABSENT_REASON,
                now.to_rfc3339()
            ],
        )?;
        tracing::debug!(%user_id, %meeting_id, inserted, "restrictions created for absence");
    } else {
        conn.execute(
            "UPDATE material_access_restrictions
             SET lifted_at = ?1
             WHERE user_id = ?2 AND meeting_id = ?3 AND lifted_at IS NULL",
            params![now.to_rfc3339(), user_id.to_string(), meeting_id.to_string()],
        )?;
    }
    Ok(())
}

fn has_manual_unlock(conn: &Connection, user_id: Uuid, material_id: Uuid) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM material_unlocks WHERE user_id = ?1 AND material_id = ?2",
        params![user_id.to_string(), material_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn has_excusing_attendance(conn: &Connection, user_id: Uuid, course_id: Uuid) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM attendance
         WHERE user_id = ?1 AND course_id = ?2
           AND status IN ('present', 'permitted', 'sick')",
        params![user_id.to_string(), course_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// The newest active restriction for (user, material), if any.
fn active_restriction(
    conn: &Connection,
    user_id: Uuid,
    material_id: Uuid,
) -> Result<Option<Restriction>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, course_id, material_id, meeting_id, reason, created_at, lifted_at
         FROM material_access_restrictions
         WHERE user_id = ?1 AND material_id = ?2 AND lifted_at IS NULL
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
    )?;
    let mut rows = stmt.query(params![user_id.to_string(), material_id.to_string()])?;
    match rows.next()? {
        Some(row) => {
            let user: String = row.get(1)?;
            let course: String = row.get(2)?;
            let material: String = row.get(3)?;
            let meeting: String = row.get(4)?;
            let created_at: String = row.get(6)?;
            let lifted_at: Option<String> = row.get(7)?;
            Ok(Some(Restriction {
                id: row.get(0)?,
                user_id: parse_uuid("material_access_restrictions", "user_id", &user)?,
                course_id: parse_uuid("material_access_restrictions", "course_id", &course)?,
                material_id: parse_uuid("material_access_restrictions", "material_id", &material)?,
                meeting_id: parse_uuid("material_access_restrictions", "meeting_id", &meeting)?,
                reason: row.get(5)?,
                created_at: parse_ts("material_access_restrictions", "created_at", &created_at)?,
                lifted_at: match lifted_at {
                    Some(ts) => Some(parse_ts("material_access_restrictions", "lifted_at", &ts)?),
                    None => None,
                },
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn setup() -> (AcademyDb, Uuid, Uuid, Uuid) {
        let db = AcademyDb::open_memory().expect("open");
        let now = Utc::now();
        let course = db.create_course("Rust 101", now).expect("course");
        let material = db.add_material(course.id, "Ownership", 1).expect("material");
        let user = Uuid::new_v4();
        db.enroll(user, course.id, now).expect("enroll");
        (db, course.id, material.id, user)
    }

    #[test]
    fn test_restriction_first_wins_and_lift_is_per_meeting() {
        let (db, course_id, material_id, user) = setup();
        let now = Utc::now();
        let meeting_a = Uuid::new_v4();
        let meeting_b = Uuid::new_v4();
        let conn = db.conn();

        maintain_restrictions(conn, user, course_id, meeting_a, AttendanceStatus::Absent, now)
            .expect("restrict a");
        // Second absence at a different meeting: the active restriction
        // stays pinned to meeting A.
        maintain_restrictions(conn, user, course_id, meeting_b, AttendanceStatus::Absent, now)
            .expect("restrict b");

        let active = active_restriction(conn, user, material_id)
            .expect("query")
            .expect("active row");
        assert_eq!(active.meeting_id, meeting_a);

        // Excusing mark at meeting B lifts nothing (the active row belongs
        // to meeting A)...
        maintain_restrictions(conn, user, course_id, meeting_b, AttendanceStatus::Present, now)
            .expect("lift b");
        assert!(active_restriction(conn, user, material_id)
            .expect("query")
            .is_some());

        // ...and the one at meeting A lifts it.
        maintain_restrictions(conn, user, course_id, meeting_a, AttendanceStatus::Sick, now)
            .expect("lift a");
        assert!(active_restriction(conn, user, material_id)
            .expect("query")
            .is_none());
    }

    #[test]
    fn test_manual_unlock_overrides_everything() {
        let (db, course_id, material_id, user) = setup();
        let now = Utc::now();
        let meeting = Uuid::new_v4();
        maintain_restrictions(db.conn(), user, course_id, meeting, AttendanceStatus::Absent, now)
            .expect("restrict");

        let guard = MaterialAccessGuard::new(&db);
        let denied = guard.check_access(user, material_id).expect("check");
        assert!(!denied.can_access);

        let staff = Caller::new(Uuid::new_v4(), Role::Admin);
        guard
            .grant_unlock(user, material_id, staff, now)
            .expect("grant");
        let allowed = guard.check_access(user, material_id).expect("check");
        assert!(allowed.can_access);
        assert_eq!(allowed.reason, AccessReason::ManualAccessGranted);

        guard.revoke_unlock(user, material_id, staff).expect("revoke");
        assert!(!guard.check_access(user, material_id).expect("check").can_access);
    }

    #[test]
    fn test_unknown_material_denied_fail_closed() {
        let (db, _, _, user) = setup();
        let guard = MaterialAccessGuard::new(&db);
        let decision = guard.check_access(user, Uuid::new_v4()).expect("check");
        assert!(!decision.can_access);
        assert_eq!(decision.reason, AccessReason::MaterialNotFound);
    }

    #[test]
    fn test_unlock_requires_staff() {
        let (db, _, material_id, user) = setup();
        let guard = MaterialAccessGuard::new(&db);
        let member = Caller::new(Uuid::new_v4(), Role::Member);
        assert!(guard
            .grant_unlock(user, material_id, member, Utc::now())
            .is_err());
    }
}
