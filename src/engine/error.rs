use ulid::Ulid;

use crate::model::{BookingStatus, Conflict, PaymentAnomaly, WorkerState};
use crate::store::StorageError;

/// Why a worker can not take a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailability {
    Inactive,
    Suspended,
    Unqualified,
    Unknown,
}

impl Unavailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unavailability::Inactive => "inactive",
            Unavailability::Suspended => "suspended",
            Unavailability::Unqualified => "unqualified",
            Unavailability::Unknown => "unknown_worker",
        }
    }

    pub(crate) fn from_state(state: WorkerState) -> Option<Self> {
        match state {
            WorkerState::Active => None,
            WorkerState::Inactive => Some(Unavailability::Inactive),
            WorkerState::Suspended => Some(Unavailability::Suspended),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input. Never retried.
    Validation(String),
    NotFound(Ulid),
    /// Overlapping assignments, with every conflicting booking.
    Conflict(Vec<Conflict>),
    /// Workers that are inactive, suspended, unqualified or unknown.
    Unavailable(Vec<(Ulid, Unavailability)>),
    BookingNotAssignable { id: Ulid, status: BookingStatus },
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    /// A storage failure that may succeed on a re-run. Escalates to `System`
    /// once the retry policy gives up.
    Transient(StorageError),
    System { attempts: u32, last_error: String },
    /// A payment report was recorded for review and not applied.
    Anomaly(PaymentAnomaly),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unavailable(_) => "availability_error",
            EngineError::BookingNotAssignable { .. } => "booking_not_assignable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Transient(_) => "transient_storage_error",
            EngineError::System { .. } => "system_error",
            EngineError::Anomaly(_) => "payment_anomaly",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => EngineError::NotFound(id),
            StorageError::AlreadyExists(id) => {
                EngineError::Validation(format!("already exists: {id}"))
            }
            StorageError::DuplicateReference(r) => {
                EngineError::Validation(format!("payment reference already recorded: {r}"))
            }
            other => EngineError::Transient(other),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(conflicts) => {
                write!(f, "assignment conflicts with ")?;
                for (i, c) in conflicts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(
                        f,
                        "{} for worker {} at [{}, {})",
                        c.conflicting_booking_reference,
                        c.worker_id,
                        c.conflicting_interval.start,
                        c.conflicting_interval.end
                    )?;
                }
                Ok(())
            }
            EngineError::Unavailable(workers) => {
                write!(f, "workers unavailable: ")?;
                for (i, (id, why)) in workers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{id} ({})", why.as_str())?;
                }
                Ok(())
            }
            EngineError::BookingNotAssignable { id, status } => {
                write!(f, "booking {id} is {} and can not take workers", status.as_str())
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "booking can not move from {} to {}", from.as_str(), to.as_str())
            }
            EngineError::Transient(e) => write!(f, "transient storage error: {e}"),
            EngineError::System {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            EngineError::Anomaly(a) => write!(
                f,
                "payment report {} for booking {} conflicts with current state {}; held for review",
                a.reference,
                a.booking_id,
                a.current.as_str()
            ),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
