use super::*;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

use crate::store::{MemoryStore, StorageError, Transaction};

/// 2026-01-01T00:00:00Z
const DAY0: Ms = 1_767_225_600_000;
const HAIRCUT: Ulid = Ulid(1);
const COLOUR: Ulid = Ulid(2);

fn at(hh: i64, mm: i64) -> Ms {
    DAY0 + (hh * 60 + mm) * MINUTE_MS
}

fn day0() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chairline_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(4),
        Duration::from_secs(2),
    )
}

fn engine_on(repo: Arc<dyn Repository>) -> Engine {
    Engine::new(repo, Arc::new(NotifyHub::new())).with_retry_policy(fast_retry())
}

fn engine(name: &str) -> Engine {
    let store = MemoryStore::open(test_wal_path(name)).unwrap();
    engine_on(Arc::new(store))
}

fn staff() -> Actor {
    Actor {
        id: Ulid::new(),
        role: ActorRole::Staff,
    }
}

fn manager() -> Actor {
    Actor {
        id: Ulid::new(),
        role: ActorRole::Manager,
    }
}

async fn worker(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .register_worker(id, Some("Sari".into()), vec![], staff())
        .await
        .unwrap();
    id
}

fn draft(start: Ms, minutes: u32, kind: CustomerType) -> BookingDraft {
    BookingDraft {
        start,
        duration_minutes: minutes,
        services: vec![HAIRCUT],
        customer: match kind {
            CustomerType::PreBooked => Some(Customer::Registered(Ulid::new())),
            CustomerType::WalkIn => None,
        },
        customer_type: kind,
        total_amount: 150_000,
        payment_method: None,
    }
}

async fn walk_in(engine: &Engine, start: Ms, minutes: u32) -> Booking {
    engine
        .create_booking(draft(start, minutes, CustomerType::WalkIn), staff())
        .await
        .unwrap()
}

async fn pre_booked(engine: &Engine, start: Ms, minutes: u32) -> Booking {
    engine
        .create_booking(draft(start, minutes, CustomerType::PreBooked), staff())
        .await
        .unwrap()
}

fn report(
    booking_id: Ulid,
    channel: PaymentChannel,
    reference: &str,
    outcome: PaymentOutcome,
) -> PaymentEvent {
    PaymentEvent {
        channel,
        external_reference: reference.into(),
        booking_id,
        outcome,
        amount: Some(150_000),
        method: Some(PaymentMethod::Online),
        raw_payload: "{}".into(),
        received_at: at(8, 0),
    }
}

fn webhook(booking_id: Ulid, reference: &str, outcome: PaymentOutcome) -> PaymentEvent {
    report(booking_id, PaymentChannel::GatewayWebhook, reference, outcome)
}

fn drain(rx: &mut broadcast::Receiver<BookingFact>) -> Vec<BookingFact> {
    let mut out = Vec::new();
    while let Ok(f) = rx.try_recv() {
        out.push(f);
    }
    out
}

// ── Fault-injecting repositories ─────────────────────────

/// Fails the first `failures` calls to `begin`.
struct FlakyRepo {
    inner: MemoryStore,
    failures: AtomicU32,
    error: StorageError,
    begins: AtomicU32,
}

impl FlakyRepo {
    fn new(name: &str, failures: u32, error: StorageError) -> Self {
        Self {
            inner: MemoryStore::open(test_wal_path(name)).unwrap(),
            failures: AtomicU32::new(failures),
            error,
            begins: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Repository for FlakyRepo {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(self.error.clone());
        }
        self.inner.begin().await
    }
}

/// Hands out `stale` transactions whose assignment scans see nothing, as a
/// weaker isolation level would. Only the store's constraint stands between
/// them and a double booking.
struct StaleSnapshotRepo {
    inner: MemoryStore,
    stale: AtomicU32,
}

#[async_trait]
impl Repository for StaleSnapshotRepo {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let tx = self.inner.begin().await?;
        if self
            .stale
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(Box::new(FaultyTx {
                inner: tx,
                blind_scans: true,
                commit_delay: Duration::ZERO,
            }));
        }
        Ok(tx)
    }
}

/// Every commit becomes durable, then takes `delay` longer to return.
struct SlowCommitRepo {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl Repository for SlowCommitRepo {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(FaultyTx {
            inner: self.inner.begin().await?,
            blind_scans: false,
            commit_delay: self.delay,
        }))
    }
}

struct FaultyTx {
    inner: Box<dyn Transaction>,
    blind_scans: bool,
    commit_delay: Duration,
}

#[async_trait]
impl Transaction for FaultyTx {
    async fn get_booking(&mut self, id: Ulid) -> Result<Option<Booking>, StorageError> {
        self.inner.get_booking(id).await
    }
    async fn list_bookings(&mut self, window: Span) -> Result<Vec<Booking>, StorageError> {
        self.inner.list_bookings(window).await
    }
    async fn get_worker(&mut self, id: Ulid) -> Result<Option<Worker>, StorageError> {
        self.inner.get_worker(id).await
    }
    async fn list_assignments(
        &mut self,
        worker_ids: &[Ulid],
        window: Span,
    ) -> Result<Vec<ScheduledAssignment>, StorageError> {
        if self.blind_scans {
            return Ok(Vec::new());
        }
        self.inner.list_assignments(worker_ids, window).await
    }
    async fn assignments_for_booking(
        &mut self,
        booking_id: Ulid,
    ) -> Result<Vec<WorkerAssignment>, StorageError> {
        self.inner.assignments_for_booking(booking_id).await
    }
    async fn find_payment_event(
        &mut self,
        reference: &str,
    ) -> Result<Option<PaymentEvent>, StorageError> {
        self.inner.find_payment_event(reference).await
    }
    async fn payment_events_for_booking(
        &mut self,
        booking_id: Ulid,
    ) -> Result<Vec<PaymentEvent>, StorageError> {
        self.inner.payment_events_for_booking(booking_id).await
    }
    async fn list_anomalies(
        &mut self,
        open_only: bool,
    ) -> Result<Vec<PaymentAnomaly>, StorageError> {
        self.inner.list_anomalies(open_only).await
    }
    async fn insert_worker(&mut self, worker: Worker) -> Result<(), StorageError> {
        self.inner.insert_worker(worker).await
    }
    async fn update_worker_state(
        &mut self,
        id: Ulid,
        state: WorkerState,
    ) -> Result<(), StorageError> {
        self.inner.update_worker_state(id, state).await
    }
    async fn insert_booking(&mut self, booking: Booking) -> Result<(), StorageError> {
        self.inner.insert_booking(booking).await
    }
    async fn update_booking_schedule(
        &mut self,
        id: Ulid,
        start: Ms,
        duration_minutes: u32,
    ) -> Result<(), StorageError> {
        self.inner
            .update_booking_schedule(id, start, duration_minutes)
            .await
    }
    async fn update_booking_status(
        &mut self,
        id: Ulid,
        status: BookingStatus,
        actor: Ulid,
    ) -> Result<(), StorageError> {
        self.inner.update_booking_status(id, status, actor).await
    }
    async fn insert_assignment(
        &mut self,
        assignment: WorkerAssignment,
    ) -> Result<(), StorageError> {
        self.inner.insert_assignment(assignment).await
    }
    async fn update_booking_payment_status(
        &mut self,
        id: Ulid,
        status: PaymentStatus,
        method: Option<PaymentMethod>,
        reference: Option<String>,
    ) -> Result<(), StorageError> {
        self.inner
            .update_booking_payment_status(id, status, method, reference)
            .await
    }
    async fn record_payment_event(&mut self, event: PaymentEvent) -> Result<(), StorageError> {
        self.inner.record_payment_event(event).await
    }
    async fn record_anomaly(&mut self, anomaly: PaymentAnomaly) -> Result<(), StorageError> {
        self.inner.record_anomaly(anomaly).await
    }
    async fn override_payment_status(
        &mut self,
        id: Ulid,
        status: PaymentStatus,
        actor: Ulid,
        reason: String,
    ) -> Result<(), StorageError> {
        self.inner
            .override_payment_status(id, status, actor, reason)
            .await
    }
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.commit().await?;
        tokio::time::sleep(self.commit_delay).await;
        Ok(())
    }
}

struct StubGateway {
    answer: Result<GatewayVerdict, GatewayError>,
    calls: AtomicU32,
}

impl StubGateway {
    fn new(answer: Result<GatewayVerdict, GatewayError>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn verify(&self, _reference: &str) -> Result<GatewayVerdict, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

// ── Intake & lifecycle ───────────────────────────────────

#[tokio::test]
async fn create_booking_initial_states() {
    let engine = engine("create_initial.wal");
    let w = walk_in(&engine, at(9, 0), 30).await;
    assert_eq!(w.status, BookingStatus::Scheduled);
    assert_eq!(w.payment_status, PaymentStatus::Pending);
    assert!(!w.worker_assigned);
    assert!(w.reference.starts_with("BK-"));

    let p = pre_booked(&engine, at(10, 0), 30).await;
    assert_eq!(p.status, BookingStatus::PendingConfirmation);
    assert_eq!(engine.get_booking(p.id).await.unwrap(), p);
}

#[tokio::test]
async fn create_booking_validation() {
    let engine = engine("create_validation.wal");
    let zero = engine
        .create_booking(draft(at(9, 0), 0, CustomerType::WalkIn), staff())
        .await;
    assert!(matches!(zero, Err(EngineError::Validation(_))));

    let mut no_services = draft(at(9, 0), 30, CustomerType::WalkIn);
    no_services.services.clear();
    assert!(matches!(
        engine.create_booking(no_services, staff()).await,
        Err(EngineError::Validation(_))
    ));

    let mut negative = draft(at(9, 0), 30, CustomerType::WalkIn);
    negative.total_amount = -1;
    assert!(matches!(
        engine.create_booking(negative, staff()).await,
        Err(EngineError::Validation(_))
    ));

    let ancient = draft(0, 30, CustomerType::WalkIn);
    assert!(matches!(
        engine.create_booking(ancient, staff()).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let far_future = draft(Ms::MAX - 1000, 30, CustomerType::WalkIn);
    assert!(matches!(
        engine.create_booking(far_future, staff()).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let b = walk_in(&engine, at(9, 0), 30).await;
    assert!(matches!(
        engine.reschedule_booking(b.id, Ms::MAX - 1000, 30, staff()).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(engine.get_booking(b.id).await.unwrap().start, at(9, 0));
}

#[tokio::test]
async fn booking_status_lifecycle() {
    let engine = engine("status_lifecycle.wal");
    let mut facts = engine.notify.subscribe_all();
    let b = pre_booked(&engine, at(9, 0), 30).await;

    let b = engine
        .set_booking_status(b.id, BookingStatus::Scheduled, staff())
        .await
        .unwrap();
    assert_eq!(b.status, BookingStatus::Scheduled);
    // Repeating is a no-op.
    engine
        .set_booking_status(b.id, BookingStatus::Scheduled, staff())
        .await
        .unwrap();

    let err = engine
        .set_booking_status(b.id, BookingStatus::Completed, staff())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Scheduled,
            to: BookingStatus::Completed
        }
    ));

    engine
        .set_booking_status(b.id, BookingStatus::InProgress, staff())
        .await
        .unwrap();
    engine
        .set_booking_status(b.id, BookingStatus::Completed, staff())
        .await
        .unwrap();
    assert!(
        engine
            .set_booking_status(b.id, BookingStatus::Cancelled, staff())
            .await
            .is_err()
    );

    let kinds: Vec<FactKind> = drain(&mut facts).iter().map(|f| f.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FactKind::Created,
            FactKind::StatusChanged,
            FactKind::StatusChanged,
            FactKind::StatusChanged
        ]
    );
}

#[tokio::test]
async fn worker_registration_and_state() {
    let engine = engine("worker_state.wal");
    let id = worker(&engine).await;
    let w = engine
        .set_worker_state(id, WorkerState::Suspended, manager())
        .await
        .unwrap();
    assert_eq!(w.state, WorkerState::Suspended);
    assert_eq!(engine.get_worker(id).await.unwrap().state, WorkerState::Suspended);

    let again = engine
        .register_worker(id, Some("Other".into()), vec![], staff())
        .await;
    assert!(matches!(again, Err(EngineError::Validation(_))));
    assert!(matches!(
        engine
            .set_worker_state(Ulid::new(), WorkerState::Active, staff())
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (b, w) = {
        let engine = engine_on(Arc::new(MemoryStore::open(path.clone()).unwrap()));
        let w = worker(&engine).await;
        let b = walk_in(&engine, at(9, 0), 45).await;
        engine.assign_workers(b.id, &[w], staff()).await.unwrap();
        engine
            .apply_payment_event(b.id, webhook(b.id, "PSK-R", PaymentOutcome::Completed))
            .await
            .unwrap();
        (b, w)
    };

    let engine = engine_on(Arc::new(MemoryStore::open(path).unwrap()));
    let b2 = engine.get_booking(b.id).await.unwrap();
    assert!(b2.worker_assigned);
    assert_eq!(b2.payment_status, PaymentStatus::Completed);
    assert_eq!(b2.status, BookingStatus::InProgress);

    let other = walk_in(&engine, at(9, 30), 30).await;
    assert!(matches!(
        engine.assign_workers(other.id, &[w], staff()).await,
        Err(EngineError::Conflict(_))
    ));
    // Replaying the same reference is still a no-op after restart.
    let again = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-R", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(again.applied, Applied::Duplicate);
}

// ── Conflict checker & assignment ────────────────────────

#[tokio::test]
async fn assignment_scenario_overlap_then_adjacent() {
    let engine = engine("scenario_overlap.wal");
    let w = worker(&engine).await;
    let b1 = walk_in(&engine, at(9, 0), 45).await;
    engine.assign_workers(b1.id, &[w], staff()).await.unwrap();

    let b2 = walk_in(&engine, at(9, 30), 30).await;
    let err = engine.assign_workers(b2.id, &[w], staff()).await.unwrap_err();
    let EngineError::Conflict(conflicts) = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].worker_id, w);
    assert_eq!(conflicts[0].conflicting_booking_id, b1.id);
    assert_eq!(conflicts[0].conflicting_booking_reference, b1.reference);
    assert_eq!(conflicts[0].conflicting_interval, Span::new(at(9, 0), at(9, 45)));
    assert!(!engine.get_booking(b2.id).await.unwrap().worker_assigned);

    let b3 = walk_in(&engine, at(9, 45), 30).await;
    let ok = engine.assign_workers(b3.id, &[w], staff()).await.unwrap();
    assert_eq!(ok.assigned, vec![w]);
    assert!(ok.booking.worker_assigned);
}

#[tokio::test]
async fn half_open_precision() {
    let engine = engine("half_open.wal");
    let w = worker(&engine).await;
    let a = walk_in(&engine, at(10, 0), 30).await;
    let b = walk_in(&engine, at(10, 30), 30).await;
    engine.assign_workers(a.id, &[w], staff()).await.unwrap();
    assert_ok!(engine.assign_workers(b.id, &[w], staff()).await);

    let w2 = worker(&engine).await;
    let c = walk_in(&engine, at(10, 0), 31).await;
    let d = walk_in(&engine, at(10, 30), 30).await;
    engine.assign_workers(c.id, &[w2], staff()).await.unwrap();
    assert!(matches!(
        engine.assign_workers(d.id, &[w2], staff()).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn assignment_leaves_status_and_payment_alone() {
    let engine = engine("assign_side_effects.wal");
    let w = worker(&engine).await;
    let b = pre_booked(&engine, at(9, 0), 30).await;
    let r = engine.assign_workers(b.id, &[w], staff()).await.unwrap();
    assert!(r.booking.worker_assigned);
    assert_eq!(r.booking.status, BookingStatus::PendingConfirmation);
    assert_eq!(r.booking.payment_status, PaymentStatus::Pending);

    let rows = engine.booking_assignments(b.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].worker_id, w);
}

#[tokio::test]
async fn repeated_assignment_is_idempotent() {
    let engine = engine("assign_idempotent.wal");
    let mut facts = engine.notify.subscribe_all();
    let (w1, w2) = (worker(&engine).await, worker(&engine).await);
    let b = walk_in(&engine, at(9, 0), 60).await;

    engine.assign_workers(b.id, &[w1], staff()).await.unwrap();
    let again = engine.assign_workers(b.id, &[w1], staff()).await.unwrap();
    assert!(again.assigned.is_empty());
    assert_eq!(again.already_assigned, vec![w1]);

    let more = engine.assign_workers(b.id, &[w1, w2], staff()).await.unwrap();
    assert_eq!(more.assigned, vec![w2]);
    assert_eq!(engine.booking_assignments(b.id).await.unwrap().len(), 2);

    let assigned_facts = drain(&mut facts)
        .into_iter()
        .filter(|f| f.kind == FactKind::WorkersAssigned)
        .count();
    assert_eq!(assigned_facts, 2);
}

#[tokio::test]
async fn assignment_input_validation() {
    let engine = engine("assign_input.wal");
    let w = worker(&engine).await;
    let b = walk_in(&engine, at(9, 0), 30).await;
    assert!(matches!(
        engine.assign_workers(b.id, &[], staff()).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.assign_workers(b.id, &[w, w], staff()).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.assign_workers(Ulid::new(), &[w], staff()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn unavailable_workers_named() {
    let engine = engine("assign_unavailable.wal");
    let inactive = worker(&engine).await;
    let suspended = worker(&engine).await;
    let fine = worker(&engine).await;
    let colourist = Ulid::new();
    engine
        .register_worker(colourist, None, vec![COLOUR], staff())
        .await
        .unwrap();
    let ghost = Ulid::new();
    engine
        .set_worker_state(inactive, WorkerState::Inactive, manager())
        .await
        .unwrap();
    engine
        .set_worker_state(suspended, WorkerState::Suspended, manager())
        .await
        .unwrap();

    let b = walk_in(&engine, at(9, 0), 30).await;
    let err = engine
        .assign_workers(b.id, &[fine, inactive, suspended, colourist, ghost], staff())
        .await
        .unwrap_err();
    let EngineError::Unavailable(list) = err else {
        panic!("expected availability error, got {err:?}");
    };
    assert_eq!(
        list,
        vec![
            (inactive, Unavailability::Inactive),
            (suspended, Unavailability::Suspended),
            (colourist, Unavailability::Unqualified),
            (ghost, Unavailability::Unknown),
        ]
    );
    // Nothing was assigned, not even the available worker.
    assert!(engine.booking_assignments(b.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn final_bookings_not_assignable() {
    let engine = engine("assign_final.wal");
    let w = worker(&engine).await;
    let b = walk_in(&engine, at(9, 0), 30).await;
    engine
        .set_booking_status(b.id, BookingStatus::Cancelled, staff())
        .await
        .unwrap();
    let err = engine.assign_workers(b.id, &[w], staff()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::BookingNotAssignable {
            status: BookingStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn cancelled_booking_releases_worker() {
    let engine = engine("cancel_releases.wal");
    let w = worker(&engine).await;
    let b1 = walk_in(&engine, at(9, 0), 60).await;
    let b2 = walk_in(&engine, at(9, 0), 60).await;
    engine.assign_workers(b1.id, &[w], staff()).await.unwrap();
    assert!(engine.assign_workers(b2.id, &[w], staff()).await.is_err());

    engine
        .set_booking_status(b1.id, BookingStatus::Cancelled, staff())
        .await
        .unwrap();
    assert_ok!(engine.assign_workers(b2.id, &[w], staff()).await);
}

#[tokio::test]
async fn conflict_preview_matches_assignment() {
    let engine = engine("preview.wal");
    let (w1, w2) = (worker(&engine).await, worker(&engine).await);
    let b1 = walk_in(&engine, at(9, 0), 60).await;
    engine.assign_workers(b1.id, &[w1], staff()).await.unwrap();

    let span = Span::new(at(9, 30), at(10, 30));
    let found = engine
        .check_conflicts(&[w1, w2, w1], span, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].conflicting_booking_id, b1.id);

    // Editing b1 itself does not conflict with b1.
    assert!(
        engine
            .check_conflicts(&[w1], span, Some(b1.id))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(matches!(
        engine.check_conflicts(&[], span, None).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine
            .check_conflicts(&[w1], Span { start: at(10, 0), end: at(10, 0) }, None)
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn reschedule_rechecks_assigned_workers() {
    let engine = engine("reschedule.wal");
    let w = worker(&engine).await;
    let b1 = walk_in(&engine, at(9, 0), 60).await;
    let b2 = walk_in(&engine, at(11, 0), 60).await;
    engine.assign_workers(b1.id, &[w], staff()).await.unwrap();
    engine.assign_workers(b2.id, &[w], staff()).await.unwrap();

    // Into b1's slot: rejected, naming b1.
    let err = engine
        .reschedule_booking(b2.id, at(9, 30), 60, staff())
        .await
        .unwrap_err();
    let EngineError::Conflict(c) = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(c[0].conflicting_booking_id, b1.id);
    assert_eq!(engine.get_booking(b2.id).await.unwrap().start, at(11, 0));

    // Overlapping only its own old slot is fine.
    let moved = engine
        .reschedule_booking(b2.id, at(11, 30), 45, staff())
        .await
        .unwrap();
    assert_eq!(moved.start, at(11, 30));
    assert_eq!(moved.duration_minutes, 45);

    // The old slot is free for someone else now.
    let b3 = walk_in(&engine, at(11, 0), 30).await;
    assert_ok!(engine.assign_workers(b3.id, &[w], staff()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignments_single_winner() {
    let engine = Arc::new(engine("concurrent_single.wal"));
    let w = worker(&engine).await;
    let mut bookings = Vec::new();
    for i in 0..16 {
        bookings.push(walk_in(&engine, at(9, i), 60).await);
    }

    let handles: Vec<_> = bookings
        .iter()
        .map(|b| {
            let engine = engine.clone();
            let id = b.id;
            tokio::spawn(async move { engine.assign_workers(id, &[w], staff()).await })
        })
        .collect();

    let (mut wins, mut conflicts) = (0, 0);
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict(c)) => {
                assert_eq!(c.len(), 1);
                assert_eq!(c[0].worker_id, w);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_overlap_invariant_under_contention() {
    let engine = Arc::new(engine("invariant.wal"));
    let mut workers = Vec::new();
    for _ in 0..3 {
        workers.push(worker(&engine).await);
    }
    let mut bookings = Vec::new();
    for i in 0..24 {
        bookings.push(walk_in(&engine, at(9, i * 10), 25 + (i as u32 % 4) * 10).await);
    }

    let mut handles = Vec::new();
    for (i, b) in bookings.iter().enumerate() {
        let id = b.id;
        let pick: Vec<Ulid> = match i % 3 {
            0 => vec![workers[0]],
            1 => vec![workers[1], workers[2]],
            _ => vec![workers[2], workers[0]],
        };
        let e = engine.clone();
        handles.push(tokio::spawn(async move {
            let _ = e.assign_workers(id, &pick, staff()).await;
        }));
        if i % 5 == 0 {
            let e = engine.clone();
            handles.push(tokio::spawn(async move {
                let _ = e
                    .set_booking_status(id, BookingStatus::Cancelled, staff())
                    .await;
            }));
        }
    }
    for h in handles {
        h.await.unwrap();
    }

    let mut by_worker: std::collections::HashMap<Ulid, Vec<Span>> = Default::default();
    for b in &bookings {
        let current = engine.get_booking(b.id).await.unwrap();
        if current.status == BookingStatus::Cancelled {
            continue;
        }
        for a in engine.booking_assignments(b.id).await.unwrap() {
            by_worker.entry(a.worker_id).or_default().push(current.span());
        }
    }
    for (w, spans) in by_worker {
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                assert!(!a.overlaps(b), "worker {w} double-booked: {a:?} vs {b:?}");
            }
        }
    }
}

// ── Retry policy ─────────────────────────────────────────

#[tokio::test]
async fn transient_begin_failures_are_retried() {
    let repo = Arc::new(FlakyRepo::new(
        "flaky_retry.wal",
        0,
        StorageError::SerializationFailure,
    ));
    let engine = engine_on(repo.clone());
    let w = worker(&engine).await;
    let b = walk_in(&engine, at(9, 0), 30).await;

    repo.failures.store(2, Ordering::SeqCst);
    let before = repo.begins.load(Ordering::SeqCst);
    let r = engine.assign_workers(b.id, &[w], staff()).await.unwrap();
    assert_eq!(r.assigned, vec![w]);
    assert_eq!(repo.begins.load(Ordering::SeqCst) - before, 3);
}

#[tokio::test]
async fn exhausted_retries_surface_system_error() {
    let repo = Arc::new(FlakyRepo::new(
        "flaky_exhaust.wal",
        0,
        StorageError::ConnectionLost("reset by peer".into()),
    ));
    let engine = engine_on(repo.clone());
    let w = worker(&engine).await;
    let b = walk_in(&engine, at(9, 0), 30).await;

    repo.failures.store(10, Ordering::SeqCst);
    let err = assert_err!(engine.assign_workers(b.id, &[w], staff()).await);
    match err {
        EngineError::System {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("reset by peer"));
        }
        other => panic!("expected System, got {other:?}"),
    }
    repo.failures.store(0, Ordering::SeqCst);
    assert!(!engine.get_booking(b.id).await.unwrap().worker_assigned);
}

#[tokio::test]
async fn conflicts_are_never_retried() {
    let repo = Arc::new(FlakyRepo::new("flaky_conflict.wal", 0, StorageError::Deadlock));
    let engine = engine_on(repo.clone());
    let w = worker(&engine).await;
    let b1 = walk_in(&engine, at(9, 0), 30).await;
    let b2 = walk_in(&engine, at(9, 0), 30).await;
    engine.assign_workers(b1.id, &[w], staff()).await.unwrap();

    let before = repo.begins.load(Ordering::SeqCst);
    assert!(matches!(
        engine.assign_workers(b2.id, &[w], staff()).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(repo.begins.load(Ordering::SeqCst) - before, 1);
}

#[tokio::test]
async fn storage_constraint_backs_up_stale_check() {
    let repo = Arc::new(StaleSnapshotRepo {
        inner: MemoryStore::open(test_wal_path("stale_snapshot.wal")).unwrap(),
        stale: AtomicU32::new(0),
    });
    let engine = engine_on(repo.clone());
    let w = worker(&engine).await;
    let b1 = walk_in(&engine, at(9, 0), 45).await;
    let b2 = walk_in(&engine, at(9, 30), 30).await;
    engine.assign_workers(b1.id, &[w], staff()).await.unwrap();

    // First attempt misses b1 in its scan and trips the store's constraint;
    // the retry sees b1 and reports it properly.
    repo.stale.store(1, Ordering::SeqCst);
    let err = engine.assign_workers(b2.id, &[w], staff()).await.unwrap_err();
    let EngineError::Conflict(c) = err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(c[0].conflicting_booking_id, b1.id);
    assert_eq!(repo.stale.load(Ordering::SeqCst), 0);
    assert!(engine.booking_assignments(b2.id).await.unwrap().is_empty());
}

/// Commits that outlast the attempt timeout.
fn slow_commit_engine(name: &str) -> Engine {
    let repo = Arc::new(SlowCommitRepo {
        inner: MemoryStore::open(test_wal_path(name)).unwrap(),
        delay: Duration::from_millis(300),
    });
    engine_on(repo).with_retry_policy(RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(4),
        Duration::from_millis(100),
    ))
}

#[tokio::test]
async fn slow_commit_still_reports_payment_transition() {
    let engine = slow_commit_engine("slow_commit_payment.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut facts = engine.notify.subscribe(b.id);

    let out = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(
        out.applied,
        Applied::Transitioned {
            from: PaymentStatus::Pending
        }
    );
    assert_eq!(out.booking.payment_status, PaymentStatus::Completed);
    let payment_facts = drain(&mut facts)
        .into_iter()
        .filter(|f| f.kind == FactKind::PaymentChanged)
        .count();
    assert_eq!(payment_facts, 1);
    assert_eq!(engine.payment_events(b.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn slow_commit_still_reports_assignment() {
    let engine = slow_commit_engine("slow_commit_assign.wal");
    let w = worker(&engine).await;
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut facts = engine.notify.subscribe(b.id);

    let r = engine.assign_workers(b.id, &[w], staff()).await.unwrap();
    assert_eq!(r.assigned, vec![w]);
    assert!(r.already_assigned.is_empty());
    let kinds: Vec<FactKind> = drain(&mut facts).into_iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FactKind::WorkersAssigned]);
}

// ── Payment reconciliation ───────────────────────────────

#[tokio::test]
async fn webhook_completes_and_advances_walk_in() {
    let engine = engine("pay_walk_in.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let out = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(
        out.applied,
        Applied::Transitioned {
            from: PaymentStatus::Pending
        }
    );
    assert_eq!(out.booking.payment_status, PaymentStatus::Completed);
    assert_eq!(out.booking.status, BookingStatus::InProgress);
    assert_eq!(out.booking.payment_reference.as_deref(), Some("PSK-1"));
    assert_eq!(out.booking.payment_method, Some(PaymentMethod::Online));
}

#[tokio::test]
async fn pre_booked_waits_for_staff_after_payment() {
    let engine = engine("pay_pre_booked.wal");
    let b = pre_booked(&engine, at(9, 0), 30).await;
    engine
        .set_booking_status(b.id, BookingStatus::Scheduled, staff())
        .await
        .unwrap();
    let out = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-2", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(out.booking.payment_status, PaymentStatus::Completed);
    assert_eq!(out.booking.status, BookingStatus::Scheduled);
}

#[tokio::test]
async fn walk_in_not_yet_scheduled_is_not_advanced() {
    let engine = engine("pay_walk_in_started.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    engine
        .set_booking_status(b.id, BookingStatus::InProgress, staff())
        .await
        .unwrap();
    let out = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-2b", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(out.booking.status, BookingStatus::InProgress);
}

#[tokio::test]
async fn duplicate_webhook_is_silent_noop() {
    let engine = engine("pay_duplicate.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut facts = engine.notify.subscribe(b.id);

    let first = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    let second = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(second.applied, Applied::Duplicate);
    assert_eq!(first.booking, second.booking);
    assert_eq!(engine.get_booking(b.id).await.unwrap(), first.booking);

    let payment_facts = drain(&mut facts)
        .into_iter()
        .filter(|f| f.kind == FactKind::PaymentChanged)
        .count();
    assert_eq!(payment_facts, 1);
    assert_eq!(engine.payment_events(b.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_of_one_reference_apply_once() {
    let engine = Arc::new(engine("pay_concurrent.wal"));
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut facts = engine.notify.subscribe(b.id);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            let channel = if i % 2 == 0 {
                PaymentChannel::GatewayWebhook
            } else {
                PaymentChannel::PosTerminal
            };
            let event = report(b.id, channel, "PSK-RACE", PaymentOutcome::Completed);
            tokio::spawn(async move { engine.apply_payment_event(event.booking_id, event).await })
        })
        .collect();

    let (mut transitioned, mut duplicates) = (0, 0);
    for h in handles {
        match h.await.unwrap().unwrap().applied {
            Applied::Transitioned { .. } => transitioned += 1,
            Applied::Duplicate => duplicates += 1,
            Applied::Unchanged => panic!("second record of one reference"),
        }
    }
    assert_eq!(transitioned, 1);
    assert_eq!(duplicates, 15);
    let payment_facts = drain(&mut facts)
        .into_iter()
        .filter(|f| f.kind == FactKind::PaymentChanged)
        .count();
    assert_eq!(payment_facts, 1);
    assert_eq!(engine.payment_events(b.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reference_whitespace_does_not_split_dedup() {
    let engine = engine("pay_trimmed_ref.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    engine
        .apply_payment_event(b.id, webhook(b.id, " PSK-T ", PaymentOutcome::Completed))
        .await
        .unwrap();
    let again = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-T", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(again.applied, Applied::Duplicate);

    let recorded = engine.payment_events(b.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].external_reference, "PSK-T");
    assert_eq!(again.booking.payment_reference.as_deref(), Some("PSK-T"));
    assert!(engine.verify_payment(b.id, "PSK-T").await.unwrap().success);
}

#[tokio::test]
async fn duplicate_with_different_outcome_still_ignored() {
    let engine = engine("pay_duplicate_diff.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    let again = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Failed))
        .await
        .unwrap();
    assert_eq!(again.applied, Applied::Duplicate);
    assert_eq!(again.booking.payment_status, PaymentStatus::Completed);
    assert!(engine.list_anomalies(true).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_after_completed_is_anomaly() {
    let engine = engine("pay_no_downgrade.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut facts = engine.notify.subscribe(b.id);
    engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();

    let late = report(b.id, PaymentChannel::PosTerminal, "POS-9", PaymentOutcome::Failed);
    let err = engine.apply_payment_event(b.id, late).await.unwrap_err();
    let EngineError::Anomaly(anomaly) = err else {
        panic!("expected anomaly, got {err:?}");
    };
    assert_eq!(anomaly.kind, AnomalyKind::ConflictingTerminalState);
    assert_eq!(anomaly.current, PaymentStatus::Completed);
    assert_eq!(anomaly.reported, PaymentOutcome::Failed);
    assert_eq!(anomaly.channel, PaymentChannel::PosTerminal);

    let now = engine.get_booking(b.id).await.unwrap();
    assert_eq!(now.payment_status, PaymentStatus::Completed);
    assert_eq!(now.payment_reference.as_deref(), Some("PSK-1"));

    let open = engine.list_anomalies(true).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, anomaly.id);
    // The conflicting report is still on record.
    assert_eq!(engine.payment_events(b.id).await.unwrap().len(), 2);
    assert_eq!(drain(&mut facts).iter().filter(|f| f.kind == FactKind::PaymentChanged).count(), 1);

    // Redelivery of the anomalous report is a duplicate, not a second anomaly.
    let late = report(b.id, PaymentChannel::PosTerminal, "POS-9", PaymentOutcome::Failed);
    assert_eq!(
        engine.apply_payment_event(b.id, late).await.unwrap().applied,
        Applied::Duplicate
    );
    assert_eq!(engine.list_anomalies(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_then_completed_needs_override() {
    let engine = engine("pay_failed_completed.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-F", PaymentOutcome::Failed))
        .await
        .unwrap();
    let err = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-G", PaymentOutcome::Completed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Anomaly(_)));
    assert_eq!(
        engine.get_booking(b.id).await.unwrap().payment_status,
        PaymentStatus::Failed
    );

    let forbidden = engine
        .manual_override(b.id, PaymentStatus::Completed, staff(), "customer paid twice")
        .await;
    assert!(matches!(forbidden, Err(EngineError::Forbidden(_))));

    let fixed = engine
        .manual_override(b.id, PaymentStatus::Completed, manager(), "gateway confirmed by phone")
        .await
        .unwrap();
    assert_eq!(fixed.payment_status, PaymentStatus::Completed);
    assert!(engine.list_anomalies(true).await.unwrap().is_empty());
    assert_eq!(engine.list_anomalies(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn override_requires_reason() {
    let engine = engine("override_reason.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    assert!(matches!(
        engine
            .manual_override(b.id, PaymentStatus::Completed, manager(), "  ")
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn refund_paths() {
    let engine = engine("pay_refund.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let early = engine
        .apply_payment_event(b.id, webhook(b.id, "RF-0", PaymentOutcome::Refunded))
        .await
        .unwrap_err();
    let EngineError::Anomaly(a) = early else {
        panic!("expected anomaly, got {early:?}");
    };
    assert_eq!(a.kind, AnomalyKind::RefundBeforePayment);

    engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    let refunded = engine
        .apply_payment_event(b.id, webhook(b.id, "RF-1", PaymentOutcome::Refunded))
        .await
        .unwrap();
    assert_eq!(refunded.booking.payment_status, PaymentStatus::Refunded);

    let after = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-2", PaymentOutcome::Completed))
        .await;
    assert!(matches!(after, Err(EngineError::Anomaly(_))));
}

#[tokio::test]
async fn short_payment_held_for_review() {
    let engine = engine("pay_short.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut short = webhook(b.id, "PSK-S", PaymentOutcome::Completed);
    short.amount = Some(100_000);
    let err = engine.apply_payment_event(b.id, short).await.unwrap_err();
    let EngineError::Anomaly(a) = err else {
        panic!("expected anomaly, got {err:?}");
    };
    assert_eq!(a.kind, AnomalyKind::AmountMismatch);
    assert_eq!(
        engine.get_booking(b.id).await.unwrap().payment_status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn same_state_from_second_channel_is_recorded_noop() {
    let engine = engine("pay_second_channel.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut facts = engine.notify.subscribe(b.id);
    engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    let manual = report(
        b.id,
        PaymentChannel::ManualFallback,
        "MAN-1",
        PaymentOutcome::Completed,
    );
    let out = engine.apply_payment_event(b.id, manual).await.unwrap();
    assert_eq!(out.applied, Applied::Unchanged);
    // First recorded channel wins.
    assert_eq!(out.booking.payment_reference.as_deref(), Some("PSK-1"));
    assert_eq!(engine.payment_events(b.id).await.unwrap().len(), 2);
    assert_eq!(drain(&mut facts).len(), 1);
}

#[tokio::test]
async fn reference_bound_to_other_booking_rejected() {
    let engine = engine("pay_foreign_ref.wal");
    let b1 = walk_in(&engine, at(9, 0), 30).await;
    let b2 = walk_in(&engine, at(10, 0), 30).await;
    engine
        .apply_payment_event(b1.id, webhook(b1.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    let err = engine
        .apply_payment_event(b2.id, webhook(b2.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(
        engine.get_booking(b2.id).await.unwrap().payment_status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn payment_event_validation() {
    let engine = engine("pay_validation.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mismatched = webhook(Ulid::new(), "PSK-1", PaymentOutcome::Completed);
    assert!(matches!(
        engine.apply_payment_event(b.id, mismatched).await,
        Err(EngineError::Validation(_))
    ));
    let blank = webhook(b.id, "   ", PaymentOutcome::Completed);
    assert!(matches!(
        engine.apply_payment_event(b.id, blank).await,
        Err(EngineError::Validation(_))
    ));
    let unknown = Ulid::new();
    assert!(matches!(
        engine
            .apply_payment_event(unknown, webhook(unknown, "PSK-2", PaymentOutcome::Completed))
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn webhook_ingress() {
    let engine = engine("webhook_ingress.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;

    let ignored = engine
        .ingest_webhook(r#"{"event":"customer.created","reference":"X","data":{}}"#)
        .await
        .unwrap();
    assert!(matches!(ignored, WebhookOutcome::Ignored { .. }));

    let body = serde_json::json!({
        "event": "charge.success",
        "reference": "PSK-W",
        "data": {"booking_id": b.id.to_string(), "amount": 150000}
    })
    .to_string();
    let WebhookOutcome::Processed(out) = engine.ingest_webhook(&body).await.unwrap() else {
        panic!("expected processed");
    };
    assert_eq!(out.booking.payment_status, PaymentStatus::Completed);
    let recorded = engine.payment_events(b.id).await.unwrap();
    assert_eq!(recorded[0].raw_payload, body);
    assert_eq!(recorded[0].channel, PaymentChannel::GatewayWebhook);

    let conflicting = serde_json::json!({
        "event": "charge.failed",
        "reference": "PSK-X",
        "data": {"booking_id": b.id.to_string()}
    })
    .to_string();
    assert!(matches!(
        engine.ingest_webhook(&conflicting).await.unwrap(),
        WebhookOutcome::HeldForReview(_)
    ));

    let missing = r#"{"event":"charge.success","reference":"PSK-M","data":{}}"#;
    assert!(matches!(
        engine.ingest_webhook(missing).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.ingest_webhook("not json").await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn applying_twice_equals_applying_once() {
    for outcome in [
        PaymentOutcome::Completed,
        PaymentOutcome::Failed,
        PaymentOutcome::Refunded,
    ] {
        let name = format!("pay_idempotent_{}.wal", outcome.as_status().as_str());
        let engine = engine(&name);
        let b = walk_in(&engine, at(9, 0), 30).await;
        let mut facts = engine.notify.subscribe_all();
        let once = engine.apply_payment_event(b.id, webhook(b.id, "REF", outcome)).await;
        let state_once = engine.get_booking(b.id).await.unwrap();
        let twice = engine.apply_payment_event(b.id, webhook(b.id, "REF", outcome)).await;
        let state_twice = engine.get_booking(b.id).await.unwrap();

        assert_eq!(state_once, state_twice);
        assert!(twice.is_ok());
        let emitted = drain(&mut facts).len();
        assert_eq!(emitted, usize::from(once.is_ok()));
        assert_eq!(engine.list_anomalies(false).await.unwrap().len(), usize::from(once.is_err()));
    }
}

// ── Verification ─────────────────────────────────────────

#[tokio::test]
async fn gateway_verification_applies_as_fallback_event() {
    let gateway = StubGateway::new(Ok(GatewayVerdict {
        outcome: Some(PaymentOutcome::Completed),
        amount: Some(150_000),
        method: Some(PaymentMethod::Card),
    }));
    let engine = engine("verify_gateway.wal").with_gateway(gateway.clone());
    let b = walk_in(&engine, at(9, 0), 30).await;

    let r = engine.verify_payment(b.id, "PSK-V").await.unwrap();
    assert_eq!(
        r,
        VerifyResult {
            success: true,
            method: Some(PaymentMethod::Card),
            booking_id: b.id
        }
    );
    let events = engine.payment_events(b.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].channel, PaymentChannel::ManualFallback);

    // The late webhook for the same reference changes nothing.
    let late = engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-V", PaymentOutcome::Completed))
        .await
        .unwrap();
    assert_eq!(late.applied, Applied::Duplicate);
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gateway_pending_is_not_success() {
    let gateway = StubGateway::new(Ok(GatewayVerdict {
        outcome: None,
        amount: None,
        method: None,
    }));
    let engine = engine("verify_pending.wal").with_gateway(gateway);
    let b = walk_in(&engine, at(9, 0), 30).await;
    let r = engine.verify_payment(b.id, "PSK-P").await.unwrap();
    assert!(!r.success);
    assert!(engine.payment_events(b.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_gateway_falls_back_to_recorded_webhook() {
    let gateway = StubGateway::new(Err(GatewayError::Unreachable("502".into())));
    let engine = engine("verify_fallback_event.wal").with_gateway(gateway.clone());
    let b = walk_in(&engine, at(9, 0), 30).await;

    assert!(!engine.verify_payment(b.id, "PSK-1").await.unwrap().success);
    engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    let r = engine.verify_payment(b.id, "PSK-1").await.unwrap();
    assert!(r.success);
    assert_eq!(r.method, Some(PaymentMethod::Online));
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn no_gateway_falls_back_to_booking_fields() {
    let engine = engine("verify_fallback_fields.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    let mut pos = report(b.id, PaymentChannel::PosTerminal, "POS-77", PaymentOutcome::Completed);
    pos.method = Some(PaymentMethod::Cash);
    engine.apply_payment_event(b.id, pos).await.unwrap();

    let r = engine.verify_payment(b.id, "POS-77").await.unwrap();
    assert!(r.success);
    assert_eq!(r.method, Some(PaymentMethod::Cash));
    assert!(!engine.verify_payment(b.id, "POS-78").await.unwrap().success);
}

#[tokio::test]
async fn fallback_defers_to_refunded_state() {
    let engine = engine("verify_refunded.wal");
    let b = walk_in(&engine, at(9, 0), 30).await;
    engine
        .apply_payment_event(b.id, webhook(b.id, "PSK-1", PaymentOutcome::Completed))
        .await
        .unwrap();
    engine
        .apply_payment_event(b.id, webhook(b.id, "RF-1", PaymentOutcome::Refunded))
        .await
        .unwrap();
    assert!(!engine.verify_payment(b.id, "PSK-1").await.unwrap().success);
}

// ── Queue ────────────────────────────────────────────────

#[tokio::test]
async fn queue_scenario_walk_ins_first() {
    let engine = engine("queue_scenario.wal");
    let mut pre = Vec::new();
    for hh in [8, 9] {
        let b = pre_booked(&engine, at(hh, 0), 30).await;
        engine
            .apply_payment_event(
                b.id,
                webhook(b.id, &format!("PSK-{hh}"), PaymentOutcome::Completed),
            )
            .await
            .unwrap();
        pre.push(b.id);
    }
    let w3 = walk_in(&engine, at(12, 0), 30).await;
    let w1 = walk_in(&engine, at(10, 0), 30).await;
    let w2 = walk_in(&engine, at(11, 0), 30).await;
    // Another day and a cancelled booking stay out.
    walk_in(&engine, at(24 + 10, 0), 30).await;
    let gone = walk_in(&engine, at(9, 30), 30).await;
    engine
        .set_booking_status(gone.id, BookingStatus::Cancelled, staff())
        .await
        .unwrap();

    let q = engine.queue_for(day0(), QueueView::Collection).await.unwrap();
    let order: Vec<Ulid> = q.iter().map(|e| e.booking_id).collect();
    assert_eq!(order, vec![w1.id, w2.id, w3.id, pre[0], pre[1]]);
    assert_eq!(q[0].rank, 1);

    let f = engine.queue_for(day0(), QueueView::Fulfillment).await.unwrap();
    let order: Vec<Ulid> = f.iter().map(|e| e.booking_id).collect();
    assert_eq!(order, vec![pre[0], pre[1], w1.id, w2.id, w3.id]);
}

#[tokio::test]
async fn queue_reflects_latest_changes() {
    let engine = engine("queue_fresh.wal");
    let a = walk_in(&engine, at(9, 0), 30).await;
    let b = walk_in(&engine, at(10, 0), 30).await;
    let q1 = engine.queue_for(day0(), QueueView::Collection).await.unwrap();
    assert_eq!(q1[0].booking_id, a.id);

    engine
        .apply_payment_event(a.id, webhook(a.id, "PSK-A", PaymentOutcome::Completed))
        .await
        .unwrap();
    let q2 = engine.queue_for(day0(), QueueView::Collection).await.unwrap();
    assert_eq!(q2[0].booking_id, b.id);
    assert_eq!(q2[1].booking_id, a.id);
}

#[tokio::test]
async fn queue_uses_salon_offset() {
    let plus7 = chrono::FixedOffset::east_opt(7 * 3600).unwrap();
    let engine = engine("queue_offset.wal").with_utc_offset(plus7);
    // 2026-01-01 23:30 UTC is already 2 January in UTC+7.
    let late = walk_in(&engine, at(23, 30), 30).await;
    let early = walk_in(&engine, at(1, 0), 30).await;

    let jan1 = engine.queue_for(day0(), QueueView::Collection).await.unwrap();
    assert_eq!(jan1.len(), 1);
    assert_eq!(jan1[0].booking_id, early.id);
    let jan2 = engine
        .queue_for(day0().succ_opt().unwrap(), QueueView::Collection)
        .await
        .unwrap();
    assert_eq!(jan2.len(), 1);
    assert_eq!(jan2[0].booking_id, late.id);
}
