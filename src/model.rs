use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn from_minutes(start: Ms, duration_minutes: u32) -> Self {
        Self::new(start, start + duration_minutes as Ms * MINUTE_MS)
    }

    /// `None` when the end does not fit in an `Ms`.
    pub fn checked_from_minutes(start: Ms, duration_minutes: u32) -> Option<Self> {
        let end = (duration_minutes as Ms)
            .checked_mul(MINUTE_MS)
            .and_then(|d| start.checked_add(d))?;
        Self::try_new(start, end)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingConfirmation,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingConfirmation => "pending_confirmation",
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// `completed` and `cancelled` admit no further transitions.
    pub fn is_final(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (PendingConfirmation, Scheduled)
                | (PendingConfirmation, Cancelled)
                | (Scheduled, InProgress)
                | (Scheduled, Cancelled)
                | (InProgress, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, PaymentStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerType {
    WalkIn,
    PreBooked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Online,
    BankTransfer,
}

/// Inline customer details for guests without an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Customer {
    Registered(Ulid),
    Guest(CustomerSnapshot),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Short human-facing code, e.g. `BK-7Q2M9D`.
    pub reference: String,
    pub start: Ms,
    pub duration_minutes: u32,
    pub services: Vec<Ulid>,
    pub customer: Option<Customer>,
    pub customer_type: CustomerType,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub payment_reference: Option<String>,
    /// Minor currency units.
    pub total_amount: i64,
    pub worker_assigned: bool,
    pub created_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.duration_minutes)
    }

    /// Walk-in by type, or any booking without a registered customer behind it.
    pub fn is_walk_in(&self) -> bool {
        self.customer_type == CustomerType::WalkIn
            || !matches!(self.customer, Some(Customer::Registered(_)))
    }
}

/// Derive the human reference from the booking id.
pub fn booking_reference(id: &Ulid) -> String {
    let s = id.to_string();
    format!("BK-{}", &s[s.len() - 6..])
}

// ── Workers & actors ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Active,
    Inactive,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Ulid,
    pub name: Option<String>,
    pub state: WorkerState,
    /// Services this worker may perform. Empty means unrestricted.
    pub skills: Vec<Ulid>,
}

impl Worker {
    pub fn qualified_for(&self, services: &[Ulid]) -> bool {
        self.skills.is_empty() || services.iter().all(|s| self.skills.contains(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub booking_id: Ulid,
    pub worker_id: Ulid,
    pub assigned_at: Ms,
    pub assigned_by: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Staff,
    Manager,
    Admin,
}

/// Whoever is performing a mutation. Always passed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: ActorRole,
}

impl Actor {
    pub fn is_elevated(&self) -> bool {
        matches!(self.role, ActorRole::Manager | ActorRole::Admin)
    }
}

/// One booked slot on a worker's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub booking_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct WorkerSchedule {
    pub worker: Worker,
    /// Assigned slots, sorted by `span.start`. Cancelled bookings stay here;
    /// status filtering happens at conflict-check time.
    pub slots: Vec<Slot>,
}

impl WorkerSchedule {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker,
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_booking(&mut self, booking_id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.booking_id == booking_id)?;
        Some(self.slots.remove(pos))
    }

    pub fn has_booking(&self, booking_id: Ulid) -> bool {
        self.slots.iter().any(|s| s.booking_id == booking_id)
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentChannel {
    GatewayWebhook,
    ManualFallback,
    PosTerminal,
    BankTransfer,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentChannel::GatewayWebhook => "gateway_webhook",
            PaymentChannel::ManualFallback => "manual_fallback",
            PaymentChannel::PosTerminal => "pos_terminal",
            PaymentChannel::BankTransfer => "bank_transfer",
        }
    }
}

/// What a channel claims happened to the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Completed,
    Failed,
    Refunded,
}

impl PaymentOutcome {
    pub fn as_status(&self) -> PaymentStatus {
        match self {
            PaymentOutcome::Completed => PaymentStatus::Completed,
            PaymentOutcome::Failed => PaymentStatus::Failed,
            PaymentOutcome::Refunded => PaymentStatus::Refunded,
        }
    }
}

/// Immutable record of a payment report. `external_reference` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub channel: PaymentChannel,
    pub external_reference: String,
    pub booking_id: Ulid,
    pub outcome: PaymentOutcome,
    pub amount: Option<i64>,
    pub method: Option<PaymentMethod>,
    /// Opaque JSON text as received.
    pub raw_payload: String,
    pub received_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ConflictingTerminalState,
    RefundBeforePayment,
    AmountMismatch,
}

/// A payment report that was recorded but deliberately not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAnomaly {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub reference: String,
    pub channel: PaymentChannel,
    pub current: PaymentStatus,
    pub reported: PaymentOutcome,
    pub kind: AnomalyKind,
    pub recorded_at: Ms,
    pub resolved: bool,
}

// ── WAL record format ────────────────────────────────────────────

/// WAL event types. Flat, no nesting beyond the entity snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WorkerRegistered {
        worker: Worker,
    },
    WorkerStateChanged {
        id: Ulid,
        state: WorkerState,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        start: Ms,
        duration_minutes: u32,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        actor: Ulid,
    },
    WorkerAssigned {
        assignment: WorkerAssignment,
    },
    PaymentRecorded {
        event: PaymentEvent,
    },
    PaymentStatusChanged {
        id: Ulid,
        status: PaymentStatus,
        method: Option<PaymentMethod>,
        reference: Option<String>,
    },
    AnomalyRecorded {
        anomaly: PaymentAnomaly,
    },
    /// Elevated correction of a payment status. Resolves the booking's anomalies.
    PaymentOverridden {
        id: Ulid,
        status: PaymentStatus,
        actor: Ulid,
        reason: String,
    },
}

// ── Query result types ───────────────────────────────────────────

/// An existing assignment that overlaps a requested interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub worker_id: Ulid,
    pub conflicting_booking_id: Ulid,
    pub conflicting_booking_reference: String,
    pub conflicting_interval: Span,
}

/// A worker's assignment joined with the state of its booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAssignment {
    pub worker_id: Ulid,
    pub booking_id: Ulid,
    pub booking_reference: String,
    pub span: Span,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub booking_id: Ulid,
    pub reference: String,
    /// 1-based.
    pub rank: u32,
    pub start: Ms,
    pub walk_in: bool,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Created,
    WorkersAssigned,
    StatusChanged,
    PaymentChanged,
    Rescheduled,
}

/// Outbound "booking state changed" notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFact {
    pub booking_id: Ulid,
    pub kind: FactKind,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub at: Ms,
}

impl BookingFact {
    pub fn of(booking: &Booking, kind: FactKind, at: Ms) -> Self {
        Self {
            booking_id: booking.id,
            kind,
            status: booking.status,
            payment_status: booking.payment_status,
            at,
        }
    }
}
