//! SQLite-backed datastore gateway.
//!
//! [`AcademyDb`] wraps a single connection and owns the catalog-side setup
//! queries (courses, materials, enrollments). The attendance, punishment,
//! and access modules run their own statements against the connection so
//! that a whole mark-cascade fits in one transaction.
//!
//! All timestamps are stored as RFC3339 TEXT in UTC; enum-like columns are
//! lowercase TEXT with parse/format helper pairs in the owning module.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DatabaseError, NotFoundError, Result};

use super::{data_dir, migrations};

/// A course, reduced to what the engine needs to resolve relationships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A course material. Restrictions and unlocks are keyed against these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub ordinal: i64,
}

/// SQLite database for the attendance/punishment engine.
pub struct AcademyDb {
    conn: Connection,
}

impl AcademyDb {
    /// Get a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Open the database at `~/.config/pluvia/pluvia.db`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_default() -> Result<Self> {
        let dir = data_dir().map_err(|e| DatabaseError::DataDir(e.to_string()))?;
        Self::open(dir.join("pluvia.db"))
    }

    /// Open (or create) the database at an explicit path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn =
            Connection::open(path.as_ref()).map_err(|source| DatabaseError::OpenFailed {
                path: path.as_ref().to_path_buf(),
                source,
            })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::from)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrations::migrate(&conn)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self { conn })
    }

    // === Courses & materials ===

    /// Create a course stub.
    pub fn create_course(&self, title: &str, now: DateTime<Utc>) -> Result<Course> {
        let course = Course {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: now,
        };
        self.conn.execute(
            "INSERT INTO courses (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![
                course.id.to_string(),
                course.title,
                course.created_at.to_rfc3339()
            ],
        )?;
        Ok(course)
    }

    /// Add a material to a course.
    pub fn add_material(&self, course_id: Uuid, title: &str, ordinal: i64) -> Result<Material> {
        let material = Material {
            id: Uuid::new_v4(),
            course_id,
            title: title.to_string(),
            ordinal,
        };
        self.conn.execute(
            "INSERT INTO materials (id, course_id, title, ordinal) VALUES (?1, ?2, ?3, ?4)",
            params![
                material.id.to_string(),
                material.course_id.to_string(),
                material.title,
                material.ordinal
            ],
        )?;
        Ok(material)
    }

    /// Resolve the course a material belongs to.
    ///
    /// # Errors
    /// `NotFound` if the material does not exist.
    pub fn material_course(&self, material_id: Uuid) -> Result<Uuid> {
        let course_id: Option<String> = self
            .conn
            .query_row(
                "SELECT course_id FROM materials WHERE id = ?1",
                params![material_id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)?;
        match course_id {
            Some(id) => parse_uuid("materials", "course_id", &id),
            None => Err(NotFoundError::Material(material_id).into()),
        }
    }

    /// All materials of a course, in ordinal order.
    pub fn course_materials(&self, course_id: Uuid) -> Result<Vec<Material>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, course_id, title, ordinal FROM materials
             WHERE course_id = ?1 ORDER BY ordinal ASC",
        )?;
        let mut rows = stmt.query(params![course_id.to_string()])?;
        let mut materials = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let course: String = row.get(1)?;
            materials.push(Material {
                id: parse_uuid("materials", "id", &id)?,
                course_id: parse_uuid("materials", "course_id", &course)?,
                title: row.get(2)?,
                ordinal: row.get(3)?,
            });
        }
        Ok(materials)
    }

    // === Enrollments (setup side; punishment state lives in punishment.rs) ===

    /// Enroll a user into a course with a zeroed punishment state.
    ///
    /// Returns the enrollment row id.
    pub fn enroll(&self, user_id: Uuid, course_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO enrollments (user_id, course_id, status, created_at)
             VALUES (?1, ?2, 'active', ?3)",
            params![
                user_id.to_string(),
                course_id.to_string(),
                now.to_rfc3339()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Soft-end (or reactivate) an enrollment.
    pub fn set_enrollment_status(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        active: bool,
    ) -> Result<()> {
        let status = if active { "active" } else { "inactive" };
        let updated = self.conn.execute(
            "UPDATE enrollments SET status = ?1 WHERE user_id = ?2 AND course_id = ?3",
            params![status, user_id.to_string(), course_id.to_string()],
        )?;
        if updated == 0 {
            return Err(NotFoundError::Enrollment { user_id, course_id }.into());
        }
        Ok(())
    }

    /// Users holding an active enrollment in the course (the attendance
    /// sheet population).
    pub fn students_by_course(&self, course_id: Uuid) -> Result<Vec<Uuid>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM enrollments
             WHERE course_id = ?1 AND status = 'active'
             ORDER BY created_at ASC",
        )?;
        let mut rows = stmt.query(params![course_id.to_string()])?;
        let mut users = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            users.push(parse_uuid("enrollments", "user_id", &id)?);
        }
        Ok(users)
    }
}

/// Configure SQLite pragmas.
///
/// `busy_timeout` keeps a contended file database from hanging; foreign
/// keys back the ON DELETE CASCADE paths.
fn configure(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Parse a stored UUID column, surfacing corruption as a database error
/// instead of a panic.
pub(crate) fn parse_uuid(
    table: &'static str,
    column: &'static str,
    value: &str,
) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        DatabaseError::CorruptValue {
            table,
            column,
            message: e.to_string(),
        }
        .into()
    })
}

/// Parse a stored RFC3339 timestamp column.
pub(crate) fn parse_ts(
    table: &'static str,
    column: &'static str,
    value: &str,
) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            DatabaseError::CorruptValue {
                table,
                column,
                message: e.to_string(),
            }
            .into()
        })
}

/// Map `QueryReturnedNoRows` to `Ok(None)`, pass other errors through.
pub(crate) fn ignore_no_rows<T>(err: rusqlite::Error) -> Result<Option<T>, rusqlite::Error> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}
