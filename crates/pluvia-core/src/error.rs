//! Core error types for pluvia-core.
//!
//! One top-level [`CoreError`] with per-concern sub-enums. The HTTP layer
//! maps variants onto status codes; the core itself never panics on a
//! failed datastore call.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Core error type for pluvia-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Missing or invalid request fields, rejected before any datastore call
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Caller lacks the role or enrollment the operation requires
    #[error("Forbidden: {0}")]
    Forbidden(#[from] ForbiddenError),

    /// No matching meeting/enrollment/material/course
    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    /// Stale-state collision during a concurrent update; retryable
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Datastore call failed
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Required field missing from the request
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Attendance status outside present/absent/permitted/sick
    #[error("Invalid attendance status '{0}' (expected present, absent, permitted, or sick)")]
    InvalidStatus(String),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Authorization errors.
#[derive(Error, Debug)]
pub enum ForbiddenError {
    /// Caller holds no active enrollment in the course
    #[error("User {user_id} is not actively enrolled in course {course_id}")]
    NotEnrolled { user_id: Uuid, course_id: Uuid },

    /// Operation restricted to lecturer/admin callers
    #[error("Operation '{0}' requires a staff role")]
    StaffOnly(&'static str),

    /// Meeting mutation restricted to its creator or an admin
    #[error("Only the meeting creator or an admin may modify meeting {0}")]
    NotMeetingOwner(Uuid),
}

/// Lookup errors.
#[derive(Error, Debug)]
pub enum NotFoundError {
    #[error("Meeting {0} not found")]
    Meeting(Uuid),

    #[error("Material {0} not found")]
    Material(Uuid),

    #[error("Course {0} not found")]
    Course(Uuid),

    #[error("No enrollment for user {user_id} in course {course_id}")]
    Enrollment { user_id: Uuid, course_id: Uuid },

    #[error("Course {0} has no meetings")]
    NoMeetings(Uuid),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Could not resolve the default data directory
    #[error("Failed to resolve data directory: {0}")]
    DataDir(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// Stored value could not be decoded into its domain type
    #[error("Corrupt stored value in {table}.{column}: {message}")]
    CorruptValue {
        table: &'static str,
        column: &'static str,
        message: String,
    },
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
