//! # Pluvia Academy Core Library
//!
//! Core business logic for the Pluvia Academy attendance and punishment
//! system. The HTTP server ([`pluvia-server`]) is a thin JSON layer over
//! this library; everything with real invariants lives here.
//!
//! ## Architecture
//!
//! - **Attendance Recorder**: single and bulk attendance upserts keyed on
//!   (meeting, user), cascading into the engine and the guard inside one
//!   SQLite transaction
//! - **Punishment Engine**: consecutive-absence counter and tier state
//!   machine, with an incremental path on each mark and a recompute path
//!   that repairs drift from raw history
//! - **Material Access Guard**: access decisions combining manual unlocks
//!   with attendance-derived restrictions
//! - **Auto-Join**: marks a member present when joining a live session,
//!   within a 2-hour grace window
//! - **Storage**: SQLite-backed datastore gateway with versioned
//!   migrations
//!
//! ## Key Components
//!
//! - [`AttendanceRecorder`]: attendance persistence
//! - [`PunishmentEngine`]: tier derivation, recompute, reset, audit log
//! - [`MaterialAccessGuard`]: access checks and unlock administration
//! - [`AcademyDb`]: datastore gateway

pub mod access;
pub mod attendance;
pub mod auto_join;
pub mod error;
pub mod identity;
pub mod meeting;
pub mod punishment;
pub mod storage;

pub use access::{AccessDecision, AccessReason, MaterialAccessGuard, Restriction};
pub use attendance::{AttendanceRecorder, AttendanceRecord, AttendanceStatus, BulkEntry, MarkOutcome};
pub use auto_join::{auto_join, AutoJoinOutcome};
pub use error::{CoreError, DatabaseError, ForbiddenError, NotFoundError, ValidationError};
pub use identity::{Caller, Role};
pub use meeting::{Meeting, MeetingService, MeetingStatus, NewMeeting};
pub use punishment::{
    Enrollment, OverviewRow, PunishmentEngine, PunishmentLogEntry, PunishmentReport,
    PunishmentSnapshot, PunishmentTier,
};
pub use storage::{AcademyDb, Course, Material};
