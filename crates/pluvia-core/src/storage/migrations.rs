//! Database schema migrations for pluvia-core.
//!
//! Migrations are versioned and applied automatically when opening the
//! database. The `schema_version` table tracks the current migration
//! version.

use rusqlite::{Connection, Result as SqliteResult};

/// Apply all pending migrations to bring the database to the current schema
/// version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Create the schema_version table if it doesn't exist.
fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            tracing::warn!("failed to read schema_version: {e}");
        }
        0
    })
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration v1: initial schema.
///
/// Courses and materials are deliberately minimal: the catalog proper is
/// managed elsewhere, the engine only needs the relationships.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS courses (
            id         TEXT PRIMARY KEY,
            title      TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS materials (
            id        TEXT PRIMARY KEY,
            course_id TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
            title     TEXT NOT NULL,
            ordinal   INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS meetings (
            id               TEXT PRIMARY KEY,
            course_id        TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
            title            TEXT NOT NULL,
            description      TEXT,
            meet_link        TEXT,
            scheduled_at     TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL DEFAULT 60,
            status           TEXT NOT NULL DEFAULT 'scheduled',
            created_by       TEXT,
            created_at       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS enrollments (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id               TEXT NOT NULL,
            course_id             TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
            status                TEXT NOT NULL DEFAULT 'active',
            consecutive_absence   INTEGER NOT NULL DEFAULT 0,
            punishment_status     TEXT NOT NULL DEFAULT 'none',
            punishment_updated_at TEXT,
            created_at            TEXT NOT NULL,
            UNIQUE (user_id, course_id)
        );

        CREATE TABLE IF NOT EXISTS attendance (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_id TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            user_id    TEXT NOT NULL,
            course_id  TEXT NOT NULL,
            status     TEXT NOT NULL DEFAULT 'absent',
            marked_by  TEXT,
            notes      TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE (meeting_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS punishment_logs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             TEXT NOT NULL,
            course_id           TEXT NOT NULL,
            enrollment_id       INTEGER NOT NULL,
            action              TEXT NOT NULL,
            consecutive_absence INTEGER NOT NULL,
            triggered_by        TEXT,
            notes               TEXT,
            created_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS material_access_restrictions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            course_id   TEXT NOT NULL,
            material_id TEXT NOT NULL REFERENCES materials(id) ON DELETE CASCADE,
            meeting_id  TEXT NOT NULL,
            reason      TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            lifted_at   TEXT
        );

        CREATE TABLE IF NOT EXISTS material_unlocks (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            material_id TEXT NOT NULL REFERENCES materials(id) ON DELETE CASCADE,
            granted_by  TEXT,
            created_at  TEXT NOT NULL,
            UNIQUE (user_id, material_id)
        );

        -- One *active* restriction per (user, material); lifted rows may
        -- accumulate freely. INSERT OR IGNORE against this index gives the
        -- first-restriction-wins semantics.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_restrictions_active
            ON material_access_restrictions(user_id, material_id)
            WHERE lifted_at IS NULL;

        CREATE INDEX IF NOT EXISTS idx_meetings_course_schedule
            ON meetings(course_id, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_attendance_user_course
            ON attendance(user_id, course_id);
        CREATE INDEX IF NOT EXISTS idx_punishment_logs_user_course
            ON punishment_logs(user_id, course_id, created_at);",
    )?;
    set_schema_version(&tx, 1)?;
    tx.commit()
}

/// Migration v2: meeting-material links.
///
/// Lets restrictions and UI unlock hints target the materials covered by a
/// specific meeting, in `unlock_order`.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS meeting_materials (
            meeting_id   TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            material_id  TEXT NOT NULL REFERENCES materials(id) ON DELETE CASCADE,
            unlock_order INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (meeting_id, material_id)
        );",
    )?;
    set_schema_version(&tx, 2)?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_database() {
        let conn = Connection::open_in_memory().expect("open");
        migrate(&conn).expect("migrate");
        assert_eq!(get_schema_version(&conn), 2);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        migrate(&conn).expect("first");
        migrate(&conn).expect("second");
        assert_eq!(get_schema_version(&conn), 2);
    }
}
