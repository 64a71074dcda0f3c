//! End-to-end flows over an in-memory database: escalation, overrides,
//! auto-join, and bulk marking.

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use pluvia_core::{
    auto_join, AcademyDb, AccessReason, AttendanceRecorder, AttendanceStatus, AutoJoinOutcome,
    BulkEntry, Caller, MaterialAccessGuard, Meeting, MeetingService, NewMeeting, PunishmentEngine,
    PunishmentTier, Role,
};

fn staff() -> Caller {
    Caller::new(Uuid::new_v4(), Role::Lecturer)
}

fn base_time() -> DateTime<Utc> {
    "2026-03-02T09:00:00Z".parse().expect("timestamp")
}

struct Fixture {
    db: AcademyDb,
    course_id: Uuid,
    staff: Caller,
}

impl Fixture {
    fn new() -> Self {
        let db = AcademyDb::open_memory().expect("open db");
        let course = db.create_course("Rust 101", base_time()).expect("course");
        Self {
            db,
            course_id: course.id,
            staff: staff(),
        }
    }

    fn enroll(&self) -> Uuid {
        let user = Uuid::new_v4();
        self.db
            .enroll(user, self.course_id, base_time())
            .expect("enroll");
        user
    }

    /// Create the n-th meeting of the course, one hour apart.
    fn meeting(&self, n: i64) -> Meeting {
        let at = base_time() + Duration::hours(n);
        MeetingService::new(&self.db)
            .create(
                NewMeeting {
                    course_id: self.course_id,
                    title: format!("Session {n}"),
                    description: None,
                    meet_link: None,
                    scheduled_at: at,
                    duration_minutes: Some(90),
                },
                self.staff,
                at,
            )
            .expect("create meeting")
    }

    fn mark(&self, meeting: &Meeting, user: Uuid, status: AttendanceStatus) -> (u32, PunishmentTier) {
        let outcome = AttendanceRecorder::new(&self.db)
            .mark(meeting.id, user, status, self.staff, meeting.scheduled_at)
            .expect("mark");
        let snapshot = outcome.punishment.expect("enrolled user has punishment state");
        (snapshot.consecutive_absence, snapshot.punishment_status)
    }
}

#[test]
fn escalation_walks_tiers_one_absence_at_a_time() {
    let fx = Fixture::new();
    let user = fx.enroll();

    // Meetings are created one session at a time, marked as they happen.
    let m1 = fx.meeting(1);
    assert_eq!(
        fx.mark(&m1, user, AttendanceStatus::Absent),
        (1, PunishmentTier::Warning1)
    );
    let m2 = fx.meeting(2);
    assert_eq!(
        fx.mark(&m2, user, AttendanceStatus::Absent),
        (2, PunishmentTier::Warning2)
    );
    let m3 = fx.meeting(3);
    assert_eq!(
        fx.mark(&m3, user, AttendanceStatus::Absent),
        (3, PunishmentTier::Suspended)
    );
    let m4 = fx.meeting(4);
    assert_eq!(
        fx.mark(&m4, user, AttendanceStatus::Present),
        (0, PunishmentTier::None)
    );

    // Every transition is on the audit log, including the return to none.
    let engine = PunishmentEngine::new(&fx.db);
    let logs = engine.logs(fx.course_id, Some(user), 10).expect("logs");
    let actions: Vec<PunishmentTier> = logs.iter().map(|l| l.action).collect();
    assert!(actions.contains(&PunishmentTier::None));
    assert_eq!(
        logs.len(),
        4,
        "one log entry per tier transition, none for repeats"
    );
}

#[test]
fn suspended_is_not_terminal_but_quiet() {
    let fx = Fixture::new();
    let user = fx.enroll();

    for n in 1..=5 {
        let meeting = fx.meeting(n);
        fx.mark(&meeting, user, AttendanceStatus::Absent);
    }
    let engine = PunishmentEngine::new(&fx.db);
    let report = engine
        .status(user, fx.course_id, base_time() + Duration::hours(6))
        .expect("status");
    assert_eq!(report.consecutive_absence, 5);
    assert_eq!(report.punishment_status, PunishmentTier::Suspended);
    // Absences 4 and 5 stay inside suspended: three transitions logged.
    assert_eq!(report.logs.len(), 3);

    // A permitted mark exits suspension.
    let m6 = fx.meeting(6);
    assert_eq!(
        fx.mark(&m6, user, AttendanceStatus::Permitted),
        (0, PunishmentTier::None)
    );
}

#[test]
fn recompute_is_idempotent_and_corrects_drift() {
    let fx = Fixture::new();
    let user = fx.enroll();
    let m1 = fx.meeting(1);
    let m2 = fx.meeting(2);
    fx.mark(&m1, user, AttendanceStatus::Present);
    fx.mark(&m2, user, AttendanceStatus::Absent);

    // Sabotage the stored counter to simulate a lost increment.
    fx.db
        .conn()
        .execute(
            "UPDATE enrollments SET consecutive_absence = 0, punishment_status = 'none'
             WHERE user_id = ?1",
            [user.to_string()],
        )
        .expect("sabotage");

    let engine = PunishmentEngine::new(&fx.db);
    let now = base_time() + Duration::hours(3);
    let first = engine.recompute(user, fx.course_id, None, now).expect("recompute");
    assert_eq!(first.consecutive_absence, 1);
    assert_eq!(first.punishment_status, PunishmentTier::Warning1);

    let second = engine.recompute(user, fx.course_id, None, now).expect("again");
    assert_eq!(first, second);
}

#[test]
fn recompute_is_stable_when_meetings_share_timestamps() {
    let fx = Fixture::new();
    let user = fx.enroll();
    let at = base_time() + Duration::hours(1);
    let service = MeetingService::new(&fx.db);
    let make = |title: &str| {
        service
            .create(
                NewMeeting {
                    course_id: fx.course_id,
                    title: title.to_string(),
                    description: None,
                    meet_link: None,
                    scheduled_at: at,
                    duration_minutes: Some(90),
                },
                fx.staff,
                at,
            )
            .expect("create meeting")
    };
    let m_a = make("Session A");
    let m_b = make("Session B");

    fx.mark(&m_a, user, AttendanceStatus::Absent);
    fx.mark(&m_b, user, AttendanceStatus::Present);

    // With scheduled_at and created_at tied, the newest-first walk falls
    // back to the id tie-break: it sees either the present mark first
    // (stop at zero) or one absence before it.
    let newest_is_present = m_b.id.to_string() > m_a.id.to_string();
    let expected = if newest_is_present {
        (0, PunishmentTier::None)
    } else {
        (1, PunishmentTier::Warning1)
    };

    let engine = PunishmentEngine::new(&fx.db);
    let now = at + Duration::hours(1);
    let first = engine
        .recompute(user, fx.course_id, None, now)
        .expect("recompute");
    assert_eq!(
        (first.consecutive_absence, first.punishment_status),
        expected
    );
    for _ in 0..5 {
        let again = engine
            .recompute(user, fx.course_id, None, now)
            .expect("recompute");
        assert_eq!(first, again);
    }
}

#[test]
fn manual_reset_zeroes_and_logs() {
    let fx = Fixture::new();
    let user = fx.enroll();
    for n in 1..=3 {
        let meeting = fx.meeting(n);
        fx.mark(&meeting, user, AttendanceStatus::Absent);
    }

    let engine = PunishmentEngine::new(&fx.db);
    let snapshot = engine
        .reset(
            user,
            fx.course_id,
            Some("appealed in person"),
            fx.staff,
            base_time() + Duration::hours(4),
        )
        .expect("reset");
    assert_eq!(snapshot.punishment_status, PunishmentTier::None);

    let logs = engine.logs(fx.course_id, Some(user), 10).expect("logs");
    assert_eq!(logs[0].notes.as_deref(), Some("appealed in person"));
    assert_eq!(logs[0].triggered_by, Some(fx.staff.user_id));

    let member = Caller::new(user, Role::Member);
    assert!(engine
        .reset(user, fx.course_id, None, member, base_time())
        .is_err());
}

#[test]
fn manual_unlock_wins_over_all_absences() {
    let fx = Fixture::new();
    let user = fx.enroll();
    let material = fx
        .db
        .add_material(fx.course_id, "Ownership", 1)
        .expect("material");
    let m1 = fx.meeting(1);
    fx.mark(&m1, user, AttendanceStatus::Absent);

    let guard = MaterialAccessGuard::new(&fx.db);
    assert!(!guard.check_access(user, material.id).expect("check").can_access);

    guard
        .grant_unlock(user, material.id, fx.staff, base_time())
        .expect("grant");
    let decision = guard.check_access(user, material.id).expect("check");
    assert!(decision.can_access);
    assert_eq!(decision.reason, AccessReason::ManualAccessGranted);
}

#[test]
fn present_mark_unlocks_course_materials() {
    let fx = Fixture::new();
    let user = fx.enroll();
    let m_a = fx.db.add_material(fx.course_id, "Intro", 1).expect("material");
    let m_b = fx.db.add_material(fx.course_id, "Traits", 2).expect("material");

    let m1 = fx.meeting(1);
    fx.mark(&m1, user, AttendanceStatus::Absent);
    let guard = MaterialAccessGuard::new(&fx.db);
    let denied = guard.check_access(user, m_a.id).expect("check");
    assert!(!denied.can_access);
    assert_eq!(denied.reason, AccessReason::AbsentNoAccess);
    let restriction = denied.restriction.expect("restriction carried for messaging");
    assert_eq!(restriction.meeting_id, m1.id);

    // One excusing record anywhere in the course unlocks everything.
    let m2 = fx.meeting(2);
    fx.mark(&m2, user, AttendanceStatus::Present);
    for material in [&m_a, &m_b] {
        let decision = guard.check_access(user, material.id).expect("check");
        assert!(decision.can_access);
        assert_eq!(decision.reason, AccessReason::ValidAttendance);
    }
}

#[test]
fn auto_join_expires_after_two_hours() {
    let fx = Fixture::new();
    let user = fx.enroll();
    let meeting = fx.meeting(1);

    let late = meeting.created_at + Duration::hours(3);
    let outcome = auto_join(&fx.db, user, fx.course_id, late).expect("auto join");
    assert!(matches!(outcome, AutoJoinOutcome::TimeExpired));

    // Within the window it flips the seeded absent row and resets the
    // counter.
    let in_time = meeting.created_at + Duration::minutes(90);
    let outcome = auto_join(&fx.db, user, fx.course_id, in_time).expect("auto join");
    assert!(matches!(outcome, AutoJoinOutcome::MarkedPresent { .. }));
    let engine = PunishmentEngine::new(&fx.db);
    let report = engine.status(user, fx.course_id, in_time).expect("status");
    assert_eq!(report.punishment_status, PunishmentTier::None);
}

#[test]
fn bulk_mark_keeps_every_tier_fresh() {
    let fx = Fixture::new();
    let users: Vec<Uuid> = (0..10).map(|_| fx.enroll()).collect();
    let meeting = fx.meeting(1);

    let entries: Vec<BulkEntry> = users
        .iter()
        .enumerate()
        .map(|(i, &user_id)| BulkEntry {
            user_id,
            status: if i < 7 {
                AttendanceStatus::Absent
            } else {
                AttendanceStatus::Present
            },
            notes: None,
        })
        .collect();

    let updated = AttendanceRecorder::new(&fx.db)
        .bulk_mark(meeting.id, &entries, fx.staff, meeting.scheduled_at)
        .expect("bulk mark");
    assert_eq!(updated, 10);

    // The meeting is closed by the bulk pass.
    let stored = MeetingService::new(&fx.db)
        .get(meeting.id)
        .expect("get")
        .expect("meeting");
    assert_eq!(stored.status, pluvia_core::MeetingStatus::Completed);

    // Full recompute per user agrees with the incremental result.
    let engine = PunishmentEngine::new(&fx.db);
    let now = meeting.scheduled_at + Duration::hours(1);
    for (i, &user_id) in users.iter().enumerate() {
        let snapshot = engine
            .recompute(user_id, fx.course_id, None, now)
            .expect("recompute");
        let expected = if i < 7 {
            (1, PunishmentTier::Warning1)
        } else {
            (0, PunishmentTier::None)
        };
        assert_eq!(
            (snapshot.consecutive_absence, snapshot.punishment_status),
            expected
        );
    }
}

#[test]
fn marking_requires_staff_role() {
    let fx = Fixture::new();
    let user = fx.enroll();
    let meeting = fx.meeting(1);
    let member = Caller::new(user, Role::Member);

    let result = AttendanceRecorder::new(&fx.db).mark(
        meeting.id,
        user,
        AttendanceStatus::Present,
        member,
        base_time(),
    );
    assert!(result.is_err());
}

fn status_strategy() -> impl Strategy<Value = AttendanceStatus> {
    prop_oneof![
        3 => Just(AttendanceStatus::Absent),
        2 => Just(AttendanceStatus::Present),
        1 => Just(AttendanceStatus::Permitted),
        1 => Just(AttendanceStatus::Sick),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Incremental marking and full recomputation must converge for any
    /// sequence of marks, and the stored tier is always the tier function
    /// of the stored counter.
    #[test]
    fn incremental_and_recompute_converge(statuses in prop::collection::vec(status_strategy(), 1..12)) {
        let fx = Fixture::new();
        let user = fx.enroll();

        let mut expected_trailing = 0u32;
        for (n, &status) in statuses.iter().enumerate() {
            let meeting = fx.meeting(n as i64 + 1);
            let (counter, tier) = fx.mark(&meeting, user, status);
            expected_trailing = if status == AttendanceStatus::Absent {
                expected_trailing + 1
            } else {
                0
            };
            prop_assert_eq!(counter, expected_trailing);
            prop_assert_eq!(tier, PunishmentTier::for_consecutive(counter));
        }

        let engine = PunishmentEngine::new(&fx.db);
        let now = base_time() + Duration::hours(statuses.len() as i64 + 1);
        let snapshot = engine.recompute(user, fx.course_id, None, now).expect("recompute");
        prop_assert_eq!(snapshot.consecutive_absence, expected_trailing);
        prop_assert_eq!(
            snapshot.punishment_status,
            PunishmentTier::for_consecutive(expected_trailing)
        );
    }
}
