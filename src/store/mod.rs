//! Storage contract the engine runs against.
//!
//! Every read and write goes through a [`Transaction`]. Implementations must
//! give each transaction a serializable view: the conflict check and the
//! assignment insert of one `assign_workers` call can not interleave with
//! another writer.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The transaction could not be serialized against a concurrent one.
    SerializationFailure,
    Deadlock,
    /// The backing store (or its writer task) went away.
    ConnectionLost(String),
    /// The attempt's deadline elapsed.
    Timeout(std::time::Duration),
    Io(String),
    /// Overlap constraint on a worker's assignments.
    UniqueViolation { worker_id: Ulid, booking_id: Ulid },
    /// A payment event with this external reference is already recorded.
    DuplicateReference(String),
    AlreadyExists(Ulid),
    NotFound(Ulid),
}

impl StorageError {
    /// Failures that may succeed if the whole transaction is re-run.
    ///
    /// A unique violation counts: it only fires when another writer committed
    /// an overlapping assignment after our snapshot, and the re-run surfaces it
    /// as a proper conflict.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::SerializationFailure
                | StorageError::Deadlock
                | StorageError::ConnectionLost(_)
                | StorageError::Timeout(_)
                | StorageError::Io(_)
                | StorageError::UniqueViolation { .. }
        )
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::SerializationFailure => write!(f, "could not serialize access"),
            StorageError::Deadlock => write!(f, "deadlock detected"),
            StorageError::ConnectionLost(e) => write!(f, "connection lost: {e}"),
            StorageError::Timeout(d) => write!(f, "deadline of {}ms elapsed", d.as_millis()),
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
            StorageError::UniqueViolation {
                worker_id,
                booking_id,
            } => write!(
                f,
                "assignment overlap constraint violated for worker {worker_id} (booking {booking_id})"
            ),
            StorageError::DuplicateReference(r) => {
                write!(f, "payment reference already recorded: {r}")
            }
            StorageError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StorageError::NotFound(id) => write!(f, "not found: {id}"),
        }
    }
}

impl std::error::Error for StorageError {}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;
}

/// One serializable unit of work. Dropping without `commit` rolls back.
#[async_trait]
pub trait Transaction: Send {
    // ── reads ────────────────────────────────────────────────

    async fn get_booking(&mut self, id: Ulid) -> Result<Option<Booking>, StorageError>;

    /// Bookings whose span overlaps `window`.
    async fn list_bookings(&mut self, window: Span) -> Result<Vec<Booking>, StorageError>;

    async fn get_worker(&mut self, id: Ulid) -> Result<Option<Worker>, StorageError>;

    /// Assignments of the given workers whose booking overlaps `window`,
    /// joined with the booking's current span and status. Cancelled bookings
    /// are included; callers filter.
    async fn list_assignments(
        &mut self,
        worker_ids: &[Ulid],
        window: Span,
    ) -> Result<Vec<ScheduledAssignment>, StorageError>;

    async fn assignments_for_booking(
        &mut self,
        booking_id: Ulid,
    ) -> Result<Vec<WorkerAssignment>, StorageError>;

    async fn find_payment_event(
        &mut self,
        reference: &str,
    ) -> Result<Option<PaymentEvent>, StorageError>;

    async fn payment_events_for_booking(
        &mut self,
        booking_id: Ulid,
    ) -> Result<Vec<PaymentEvent>, StorageError>;

    async fn list_anomalies(&mut self, open_only: bool)
    -> Result<Vec<PaymentAnomaly>, StorageError>;

    // ── writes (staged until commit) ─────────────────────────

    async fn insert_worker(&mut self, worker: Worker) -> Result<(), StorageError>;

    async fn update_worker_state(&mut self, id: Ulid, state: WorkerState)
    -> Result<(), StorageError>;

    async fn insert_booking(&mut self, booking: Booking) -> Result<(), StorageError>;

    async fn update_booking_schedule(
        &mut self,
        id: Ulid,
        start: Ms,
        duration_minutes: u32,
    ) -> Result<(), StorageError>;

    async fn update_booking_status(
        &mut self,
        id: Ulid,
        status: BookingStatus,
        actor: Ulid,
    ) -> Result<(), StorageError>;

    /// Enforces the per-worker no-overlap constraint.
    async fn insert_assignment(&mut self, assignment: WorkerAssignment)
    -> Result<(), StorageError>;

    async fn update_booking_payment_status(
        &mut self,
        id: Ulid,
        status: PaymentStatus,
        method: Option<PaymentMethod>,
        reference: Option<String>,
    ) -> Result<(), StorageError>;

    /// Unique on `external_reference`.
    async fn record_payment_event(&mut self, event: PaymentEvent) -> Result<(), StorageError>;

    async fn record_anomaly(&mut self, anomaly: PaymentAnomaly) -> Result<(), StorageError>;

    /// Set the payment status unconditionally and resolve the booking's anomalies.
    async fn override_payment_status(
        &mut self,
        id: Ulid,
        status: PaymentStatus,
        actor: Ulid,
        reason: String,
    ) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}
