//! Meetings: scheduled live sessions belonging to a course.
//!
//! Creating a meeting seeds a default `absent` attendance row for every
//! actively enrolled member. That pessimistic baseline is what the recorder
//! overwrites and what lets a missing row be read as absent during
//! recomputation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attendance::AttendanceStatus;
use crate::error::{DatabaseError, ForbiddenError, NotFoundError, Result, ValidationError};
use crate::identity::{Caller, Role};
use crate::storage::database::{ignore_no_rows, parse_ts, parse_uuid};
use crate::storage::{AcademyDb, Material};

/// Meeting lifecycle: scheduled -> ongoing -> completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Scheduled,
    Ongoing,
    Completed,
}

impl MeetingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::Ongoing => "ongoing",
            MeetingStatus::Completed => "completed",
        }
    }

    pub(crate) fn parse_db(value: &str) -> Result<Self, DatabaseError> {
        match value {
            "scheduled" => Ok(MeetingStatus::Scheduled),
            "ongoing" => Ok(MeetingStatus::Ongoing),
            "completed" => Ok(MeetingStatus::Completed),
            other => Err(DatabaseError::CorruptValue {
                table: "meetings",
                column: "status",
                message: format!("unknown status '{other}'"),
            }),
        }
    }
}

/// A scheduled live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub meet_link: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: MeetingStatus,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a meeting.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMeeting {
    pub course_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub meet_link: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: Option<i64>,
}

/// Meeting management over the shared database.
pub struct MeetingService<'a> {
    db: &'a AcademyDb,
}

impl<'a> MeetingService<'a> {
    pub fn new(db: &'a AcademyDb) -> Self {
        Self { db }
    }

    /// Create a meeting and seed an `absent` attendance row for every
    /// active enrollment. Staff only.
    pub fn create(&self, new: NewMeeting, caller: Caller, now: DateTime<Utc>) -> Result<Meeting> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("create meeting").into());
        }
        if new.title.trim().is_empty() {
            return Err(ValidationError::MissingField("title").into());
        }

        let meeting = Meeting {
            id: Uuid::new_v4(),
            course_id: new.course_id,
            title: new.title,
            description: new.description,
            meet_link: new.meet_link,
            scheduled_at: new.scheduled_at,
            duration_minutes: new.duration_minutes.unwrap_or(60),
            status: MeetingStatus::Scheduled,
            created_by: Some(caller.user_id),
            created_at: now,
        };

        let tx = self.db.conn().unchecked_transaction()?;
        let course_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM courses WHERE id = ?1",
                params![meeting.course_id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)?;
        if course_exists.is_none() {
            return Err(NotFoundError::Course(meeting.course_id).into());
        }

        tx.execute(
            "INSERT INTO meetings
                 (id, course_id, title, description, meet_link, scheduled_at,
                  duration_minutes, status, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                meeting.id.to_string(),
                meeting.course_id.to_string(),
                meeting.title,
                meeting.description,
                meeting.meet_link,
                meeting.scheduled_at.to_rfc3339(),
                meeting.duration_minutes,
                meeting.status.as_str(),
                caller.user_id.to_string(),
                meeting.created_at.to_rfc3339()
            ],
        )?;

        // Pessimistic baseline: everyone starts absent until marked.
        tx.execute(
            "INSERT INTO attendance (meeting_id, user_id, course_id, status, updated_at)
             SELECT ?1, user_id, course_id, ?2, ?3
             FROM enrollments WHERE course_id = ?4 AND status = 'active'",
            params![
                meeting.id.to_string(),
                AttendanceStatus::Absent.as_str(),
                now.to_rfc3339(),
                meeting.course_id.to_string()
            ],
        )?;
        tx.commit()?;

        tracing::info!(meeting_id = %meeting.id, course_id = %meeting.course_id, "meeting created");
        Ok(meeting)
    }

    /// Delete a meeting. Only its creator or an admin; attendance rows go
    /// with it via cascade.
    pub fn delete(&self, meeting_id: Uuid, caller: Caller) -> Result<()> {
        let meeting = self
            .get(meeting_id)?
            .ok_or(NotFoundError::Meeting(meeting_id))?;
        let is_creator = meeting.created_by == Some(caller.user_id);
        if !is_creator && caller.role != Role::Admin {
            return Err(ForbiddenError::NotMeetingOwner(meeting_id).into());
        }
        self.db.conn().execute(
            "DELETE FROM meetings WHERE id = ?1",
            params![meeting_id.to_string()],
        )?;
        Ok(())
    }

    /// A single meeting, if it exists.
    pub fn get(&self, meeting_id: Uuid) -> Result<Option<Meeting>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "{MEETING_COLUMNS} FROM meetings WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![meeting_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_meeting(row)?)),
            None => Ok(None),
        }
    }

    /// All meetings of a course, oldest first.
    pub fn by_course(&self, course_id: Uuid) -> Result<Vec<Meeting>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "{MEETING_COLUMNS} FROM meetings WHERE course_id = ?1
             ORDER BY scheduled_at ASC, created_at ASC, id ASC"
        ))?;
        let mut rows = stmt.query(params![course_id.to_string()])?;
        let mut meetings = Vec::new();
        while let Some(row) = rows.next()? {
            meetings.push(row_to_meeting(row)?);
        }
        Ok(meetings)
    }

    /// Replace the set of materials linked to a meeting. Staff only.
    pub fn link_materials(
        &self,
        meeting_id: Uuid,
        material_ids: &[Uuid],
        caller: Caller,
    ) -> Result<()> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("link materials").into());
        }
        let tx = self.db.conn().unchecked_transaction()?;
        if course_of_meeting(&tx, meeting_id)?.is_none() {
            return Err(NotFoundError::Meeting(meeting_id).into());
        }
        tx.execute(
            "DELETE FROM meeting_materials WHERE meeting_id = ?1",
            params![meeting_id.to_string()],
        )?;
        for (index, material_id) in material_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO meeting_materials (meeting_id, material_id, unlock_order)
                 VALUES (?1, ?2, ?3)",
                params![
                    meeting_id.to_string(),
                    material_id.to_string(),
                    (index + 1) as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Unlink one material from a meeting. Staff only.
    pub fn unlink_material(
        &self,
        meeting_id: Uuid,
        material_id: Uuid,
        caller: Caller,
    ) -> Result<()> {
        if !caller.role.is_staff() {
            return Err(ForbiddenError::StaffOnly("unlink material").into());
        }
        self.db.conn().execute(
            "DELETE FROM meeting_materials WHERE meeting_id = ?1 AND material_id = ?2",
            params![meeting_id.to_string(), material_id.to_string()],
        )?;
        Ok(())
    }

    /// Materials linked to a meeting, in unlock order.
    pub fn materials(&self, meeting_id: Uuid) -> Result<Vec<Material>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT m.id, m.course_id, m.title, m.ordinal
             FROM meeting_materials mm
             JOIN materials m ON m.id = mm.material_id
             WHERE mm.meeting_id = ?1
             ORDER BY mm.unlock_order ASC",
        )?;
        let mut rows = stmt.query(params![meeting_id.to_string()])?;
        let mut materials = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let course_id: String = row.get(1)?;
            materials.push(Material {
                id: parse_uuid("materials", "id", &id)?,
                course_id: parse_uuid("materials", "course_id", &course_id)?,
                title: row.get(2)?,
                ordinal: row.get(3)?,
            });
        }
        Ok(materials)
    }
}

const MEETING_COLUMNS: &str = "SELECT id, course_id, title, description, meet_link, \
    scheduled_at, duration_minutes, status, created_by, created_at";

/// The course a meeting belongs to, or `None` if the meeting is unknown.
pub(crate) fn course_of_meeting(conn: &Connection, meeting_id: Uuid) -> Result<Option<Uuid>> {
    let course_id: Option<String> = conn
        .query_row(
            "SELECT course_id FROM meetings WHERE id = ?1",
            params![meeting_id.to_string()],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(ignore_no_rows)?;
    match course_id {
        Some(id) => Ok(Some(parse_uuid("meetings", "course_id", &id)?)),
        None => Ok(None),
    }
}

pub(crate) fn set_meeting_status(
    conn: &Connection,
    meeting_id: Uuid,
    status: MeetingStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE meetings SET status = ?1 WHERE id = ?2",
        params![status.as_str(), meeting_id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn row_to_meeting(row: &rusqlite::Row) -> Result<Meeting> {
    let id: String = row.get(0)?;
    let course_id: String = row.get(1)?;
    let scheduled_at: String = row.get(5)?;
    let status: String = row.get(7)?;
    let created_by: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(Meeting {
        id: parse_uuid("meetings", "id", &id)?,
        course_id: parse_uuid("meetings", "course_id", &course_id)?,
        title: row.get(2)?,
        description: row.get(3)?,
        meet_link: row.get(4)?,
        scheduled_at: parse_ts("meetings", "scheduled_at", &scheduled_at)?,
        duration_minutes: row.get(6)?,
        status: MeetingStatus::parse_db(&status)?,
        created_by: match created_by {
            Some(id) => Some(parse_uuid("meetings", "created_by", &id)?),
            None => None,
        },
        created_at: parse_ts("meetings", "created_at", &created_at)?,
    })
}
