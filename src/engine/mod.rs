mod assign;
mod conflict;
mod error;
mod mutations;
mod payment;
mod queries;
mod queue;
mod retry;
#[cfg(test)]
mod tests;

pub use assign::AssignmentResult;
pub use conflict::find_conflicts;
pub use error::{EngineError, Unavailability};
pub use mutations::BookingDraft;
pub use payment::{
    Applied, ApplyOutcome, GatewayError, GatewayVerdict, PaymentGateway, VerifyResult,
    WebhookOutcome, WebhookPayload, reconcile, Reconciliation,
};
pub use queue::{QueueView, compute_queue};
pub use retry::{RetryPolicy, Staged};

use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::Repository;

/// Actor id recorded for transitions the engine makes on its own.
pub const SYSTEM_ACTOR: Ulid = Ulid::nil();

/// Scheduling and reconciliation core.
///
/// Holds no booking state of its own: every operation runs as one or more
/// repository transactions under the retry policy, and publishes a
/// [`BookingFact`] only after its transaction has committed.
pub struct Engine {
    repo: Arc<dyn Repository>,
    pub notify: Arc<NotifyHub>,
    retry: RetryPolicy,
    tz: FixedOffset,
    gateway: Option<Arc<dyn PaymentGateway>>,
}

impl Engine {
    pub fn new(repo: Arc<dyn Repository>, notify: Arc<NotifyHub>) -> Self {
        Self {
            repo,
            notify,
            retry: RetryPolicy::default(),
            tz: Utc.fix(),
            gateway: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The salon's wall clock, used to decide which bookings fall on a date.
    pub fn with_utc_offset(mut self, tz: FixedOffset) -> Self {
        self.tz = tz;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.tz
    }

    fn publish(&self, booking: &Booking, kind: FactKind) {
        self.notify
            .send(&BookingFact::of(booking, kind, conflict::now_ms()));
    }
}
