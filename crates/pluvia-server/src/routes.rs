//! HTTP routes: thin JSON glue over pluvia-core.
//!
//! Caller identity arrives pre-resolved in `x-user-id` / `x-user-role`
//! headers (session auth terminates upstream). Handlers validate the typed
//! request bodies, take the state lock, and hand off to the core.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pluvia_core::{
    auto_join, AcademyDb, AccessDecision, AttendanceRecord, AttendanceRecorder, AttendanceStatus,
    AutoJoinOutcome, BulkEntry, Caller, CoreError, ForbiddenError, MaterialAccessGuard, Meeting,
    MeetingService, NewMeeting, OverviewRow, PunishmentEngine, PunishmentLogEntry,
    PunishmentReport, PunishmentSnapshot, Role, ValidationError,
};

use crate::error::{ApiError, ApiResult};

pub type SharedDb = Arc<Mutex<AcademyDb>>;

pub fn router(state: SharedDb) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/meetings", post(create_meeting))
        .route("/meetings/course/:course_id", get(meetings_by_course))
        .route("/meetings/:meeting_id", delete(delete_meeting))
        .route(
            "/meetings/:meeting_id/materials",
            get(meeting_materials).post(link_materials),
        )
        .route(
            "/meetings/:meeting_id/materials/:material_id",
            delete(unlink_material),
        )
        .route("/attendance/meeting/:meeting_id", get(attendance_by_meeting))
        .route("/attendance/mark", post(mark_attendance))
        .route("/attendance/bulk-mark", post(bulk_mark_attendance))
        .route("/attendance/auto-join/:course_id", post(auto_join_course))
        .route("/students/course/:course_id", get(students_by_course))
        .route("/punishment/reset", post(reset_punishment))
        .route("/punishment/logs/:course_id", get(punishment_logs))
        .route("/punishment/course/:course_id", get(punishment_overview))
        .route("/punishment/:user_id/:course_id", get(punishment_status))
        .route(
            "/material-access/:user_id/:material_id",
            get(material_access),
        )
        .route("/material-unlocks", post(grant_unlock))
        .route(
            "/material-unlocks/:user_id/:material_id",
            delete(revoke_unlock),
        )
        .with_state(state)
}

fn lock(state: &SharedDb) -> ApiResult<MutexGuard<'_, AcademyDb>> {
    state.lock().map_err(|_| ApiError::locked())
}

/// Resolve the acting caller from the identity headers.
fn caller(headers: &HeaderMap) -> ApiResult<Caller> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(ApiError::unauthorized)?;
    let role = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .map(Role::parse)
        .unwrap_or(Role::Member);
    Ok(Caller::new(user_id, role))
}

fn require<T>(value: Option<T>, field: &'static str) -> ApiResult<T> {
    value.ok_or_else(|| CoreError::from(ValidationError::MissingField(field)).into())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// === Meetings ===

#[derive(Deserialize)]
struct CreateMeetingRequest {
    course_id: Option<Uuid>,
    title: Option<String>,
    description: Option<String>,
    meet_link: Option<String>,
    scheduled_at: Option<chrono::DateTime<Utc>>,
    duration_minutes: Option<i64>,
}

#[derive(Serialize)]
struct MeetingResponse {
    success: bool,
    meeting: Meeting,
}

async fn create_meeting(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Json(req): Json<CreateMeetingRequest>,
) -> ApiResult<Json<MeetingResponse>> {
    let caller = caller(&headers)?;
    let new = NewMeeting {
        course_id: require(req.course_id, "course_id")?,
        title: require(req.title, "title")?,
        description: req.description,
        meet_link: req.meet_link,
        scheduled_at: require(req.scheduled_at, "scheduled_at")?,
        duration_minutes: req.duration_minutes,
    };
    let db = lock(&state)?;
    let meeting = MeetingService::new(&db).create(new, caller, Utc::now())?;
    Ok(Json(MeetingResponse {
        success: true,
        meeting,
    }))
}

async fn delete_meeting(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(meeting_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = caller(&headers)?;
    let db = lock(&state)?;
    MeetingService::new(&db).delete(meeting_id, caller)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Serialize)]
struct MeetingsResponse {
    success: bool,
    meetings: Vec<Meeting>,
}

async fn meetings_by_course(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> ApiResult<Json<MeetingsResponse>> {
    caller(&headers)?;
    let db = lock(&state)?;
    let meetings = MeetingService::new(&db).by_course(course_id)?;
    Ok(Json(MeetingsResponse {
        success: true,
        meetings,
    }))
}

#[derive(Deserialize)]
struct LinkMaterialsRequest {
    material_ids: Option<Vec<Uuid>>,
}

async fn link_materials(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(meeting_id): Path<Uuid>,
    Json(req): Json<LinkMaterialsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = caller(&headers)?;
    let material_ids = require(req.material_ids, "material_ids")?;
    let db = lock(&state)?;
    MeetingService::new(&db).link_materials(meeting_id, &material_ids, caller)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "linked": material_ids.len(),
    })))
}

async fn unlink_material(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path((meeting_id, material_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = caller(&headers)?;
    let db = lock(&state)?;
    MeetingService::new(&db).unlink_material(meeting_id, material_id, caller)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn meeting_materials(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(meeting_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    caller(&headers)?;
    let db = lock(&state)?;
    let materials = MeetingService::new(&db).materials(meeting_id)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "materials": materials,
    })))
}

// === Attendance ===

#[derive(Deserialize)]
struct MarkAttendanceRequest {
    meeting_id: Option<Uuid>,
    user_id: Option<Uuid>,
    status: Option<String>,
}

#[derive(Serialize)]
struct MarkAttendanceResponse {
    success: bool,
    attendance: AttendanceRecord,
    punishment: Option<PunishmentSnapshot>,
}

async fn mark_attendance(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Json(req): Json<MarkAttendanceRequest>,
) -> ApiResult<Json<MarkAttendanceResponse>> {
    let caller = caller(&headers)?;
    let meeting_id = require(req.meeting_id, "meeting_id")?;
    let user_id = require(req.user_id, "user_id")?;
    let status = require(req.status, "status")?;
    let status = AttendanceStatus::parse(&status).map_err(CoreError::from)?;

    let db = lock(&state)?;
    let outcome =
        AttendanceRecorder::new(&db).mark(meeting_id, user_id, status, caller, Utc::now())?;
    Ok(Json(MarkAttendanceResponse {
        success: true,
        attendance: outcome.attendance,
        punishment: outcome.punishment,
    }))
}

#[derive(Deserialize)]
struct BulkEntryRequest {
    user_id: Uuid,
    status: String,
    notes: Option<String>,
}

#[derive(Deserialize)]
struct BulkMarkRequest {
    meeting_id: Option<Uuid>,
    attendance_list: Option<Vec<BulkEntryRequest>>,
}

async fn bulk_mark_attendance(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Json(req): Json<BulkMarkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = caller(&headers)?;
    let meeting_id = require(req.meeting_id, "meeting_id")?;
    let list = require(req.attendance_list, "attendance_list")?;
    let entries = list
        .into_iter()
        .map(|e| {
            Ok(BulkEntry {
                user_id: e.user_id,
                status: AttendanceStatus::parse(&e.status).map_err(CoreError::from)?,
                notes: e.notes,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let db = lock(&state)?;
    let updated = AttendanceRecorder::new(&db).bulk_mark(meeting_id, &entries, caller, Utc::now())?;
    Ok(Json(serde_json::json!({
        "success": true,
        "updated_count": updated,
    })))
}

async fn attendance_by_meeting(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(meeting_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    caller(&headers)?;
    let db = lock(&state)?;
    let attendance = AttendanceRecorder::new(&db).attendance_by_meeting(meeting_id)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "attendance": attendance,
    })))
}

#[derive(Serialize)]
struct AutoJoinResponse {
    success: bool,
    #[serde(flatten)]
    outcome: AutoJoinOutcome,
}

async fn auto_join_course(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> ApiResult<Json<AutoJoinResponse>> {
    let caller = caller(&headers)?;
    let db = lock(&state)?;
    let outcome = auto_join(&db, caller.user_id, course_id, Utc::now())?;
    Ok(Json(AutoJoinResponse {
        success: !matches!(outcome, AutoJoinOutcome::TimeExpired),
        outcome,
    }))
}

async fn students_by_course(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    caller(&headers)?;
    let db = lock(&state)?;
    let students = db.students_by_course(course_id)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "students": students,
    })))
}

// === Punishment ===

async fn punishment_status(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path((user_id, course_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<PunishmentReport>> {
    caller(&headers)?;
    let db = lock(&state)?;
    let report = PunishmentEngine::new(&db).status(user_id, course_id, Utc::now())?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ResetRequest {
    user_id: Option<Uuid>,
    course_id: Option<Uuid>,
    notes: Option<String>,
}

async fn reset_punishment(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Json(req): Json<ResetRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = caller(&headers)?;
    let user_id = require(req.user_id, "user_id")?;
    let course_id = require(req.course_id, "course_id")?;
    let db = lock(&state)?;
    PunishmentEngine::new(&db).reset(user_id, course_id, req.notes.as_deref(), caller, Utc::now())?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Punishment reset",
    })))
}

#[derive(Deserialize)]
struct LogsQuery {
    user_id: Option<Uuid>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct LogsResponse {
    success: bool,
    logs: Vec<PunishmentLogEntry>,
}

async fn punishment_logs(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let caller = caller(&headers)?;
    if !caller.role.is_staff() {
        return Err(CoreError::from(ForbiddenError::StaffOnly("view punishment logs")).into());
    }
    let db = lock(&state)?;
    let logs =
        PunishmentEngine::new(&db).logs(course_id, query.user_id, query.limit.unwrap_or(50))?;
    Ok(Json(LogsResponse {
        success: true,
        logs,
    }))
}

#[derive(Serialize)]
struct OverviewResponse {
    success: bool,
    students: Vec<OverviewRow>,
}

async fn punishment_overview(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path(course_id): Path<Uuid>,
) -> ApiResult<Json<OverviewResponse>> {
    let caller = caller(&headers)?;
    if !caller.role.is_staff() {
        return Err(CoreError::from(ForbiddenError::StaffOnly("view punishment overview")).into());
    }
    let db = lock(&state)?;
    let students = PunishmentEngine::new(&db).overview(course_id)?;
    Ok(Json(OverviewResponse {
        success: true,
        students,
    }))
}

// === Material access ===

#[derive(Serialize)]
struct AccessResponse {
    success: bool,
    #[serde(flatten)]
    decision: AccessDecision,
}

async fn material_access(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path((user_id, material_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<AccessResponse>> {
    caller(&headers)?;
    let db = lock(&state)?;
    let decision = MaterialAccessGuard::new(&db).check_access(user_id, material_id)?;
    Ok(Json(AccessResponse {
        success: true,
        decision,
    }))
}

#[derive(Deserialize)]
struct UnlockRequest {
    user_id: Option<Uuid>,
    material_id: Option<Uuid>,
}

async fn grant_unlock(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Json(req): Json<UnlockRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = caller(&headers)?;
    let user_id = require(req.user_id, "user_id")?;
    let material_id = require(req.material_id, "material_id")?;
    let db = lock(&state)?;
    MaterialAccessGuard::new(&db).grant_unlock(user_id, material_id, caller, Utc::now())?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn revoke_unlock(
    State(state): State<SharedDb>,
    headers: HeaderMap,
    Path((user_id, material_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<serde_json::Value>> {
    let caller = caller(&headers)?;
    let db = lock(&state)?;
    MaterialAccessGuard::new(&db).revoke_unlock(user_id, material_id, caller)?;
    Ok(Json(serde_json::json!({ "success": true })))
}
