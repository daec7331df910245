//! Payment reconciliation.
//!
//! Every channel (gateway webhook, manual fallback, POS, bank transfer) feeds
//! the same [`Engine::apply_payment_event`]. The external reference is the
//! deduplication key: the first report for a reference is recorded and
//! reconciled, every later one is a silent no-op. Reports that would move a
//! settled payment somewhere it can not go are kept as anomalies for review
//! instead of being applied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    PAYMENT_ANOMALIES_TOTAL, PAYMENT_DUPLICATES_TOTAL, PAYMENT_TRANSITIONS_TOTAL,
};

use super::conflict::now_ms;
use super::{Engine, EngineError, SYSTEM_ACTOR, Staged};

/// What a payment report does to a booking in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Transition(PaymentStatus),
    /// The booking is already where the report says it is.
    Unchanged,
    Anomaly(AnomalyKind),
}

/// Transition table.
///
/// `pending → completed | failed`, `completed → refunded`. Anything else that
/// is not a repeat of the current state is an anomaly, including a completed
/// report whose amount falls short of the booking total.
pub fn reconcile(
    current: PaymentStatus,
    outcome: PaymentOutcome,
    amount: Option<i64>,
    total_amount: i64,
) -> Reconciliation {
    use PaymentOutcome as O;
    use PaymentStatus as S;
    match (current, outcome) {
        (S::Pending, O::Completed) if amount.is_some_and(|a| a < total_amount) => {
            Reconciliation::Anomaly(AnomalyKind::AmountMismatch)
        }
        (S::Pending, O::Completed) => Reconciliation::Transition(S::Completed),
        (S::Pending, O::Failed) => Reconciliation::Transition(S::Failed),
        (S::Pending, O::Refunded) => Reconciliation::Anomaly(AnomalyKind::RefundBeforePayment),
        (S::Completed, O::Refunded) => Reconciliation::Transition(S::Refunded),
        (cur, out) if cur == out.as_status() => Reconciliation::Unchanged,
        _ => Reconciliation::Anomaly(AnomalyKind::ConflictingTerminalState),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    Transitioned { from: PaymentStatus },
    /// Recorded, but the booking already had the reported status.
    Unchanged,
    /// The reference was seen before. Nothing recorded.
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub booking: Booking,
    pub applied: Applied,
}

enum Step {
    Done(ApplyOutcome),
    Anomaly(PaymentAnomaly),
}

fn validate_event(booking_id: Ulid, event: &PaymentEvent) -> Result<(), EngineError> {
    if event.booking_id != booking_id {
        return Err(EngineError::Validation(format!(
            "event is for booking {}, not {booking_id}",
            event.booking_id
        )));
    }
    let reference = &event.external_reference;
    if reference.is_empty() {
        return Err(EngineError::Validation("payment reference is required".into()));
    }
    if reference.len() > MAX_REFERENCE_LEN {
        return Err(EngineError::LimitExceeded("payment reference too long"));
    }
    if event.raw_payload.len() > MAX_PAYLOAD_LEN {
        return Err(EngineError::LimitExceeded("payment payload too large"));
    }
    if event.amount.is_some_and(|a| a < 0) {
        return Err(EngineError::Validation("amount can not be negative".into()));
    }
    Ok(())
}

// ── Gateway collaborator ─────────────────────────────────

/// What the primary gateway says about a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayVerdict {
    /// `None` while the gateway still considers the charge open.
    pub outcome: Option<PaymentOutcome>,
    pub amount: Option<i64>,
    pub method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Unreachable(String),
    UnknownReference,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Unreachable(e) => write!(f, "gateway unreachable: {e}"),
            GatewayError::UnknownReference => write!(f, "gateway does not know this reference"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// The online payment provider, asked directly during verification.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn verify(&self, reference: &str) -> Result<GatewayVerdict, GatewayError>;
}

/// Uniform answer of every verification path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    pub success: bool,
    pub method: Option<PaymentMethod>,
    pub booking_id: Ulid,
}

// ── Webhook ingress ──────────────────────────────────────

/// Gateway webhook body: `{event, reference, data}`. `data` is opaque apart
/// from `booking_id`, `amount` and `method`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub reference: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WebhookPayload {
    fn outcome(&self) -> Option<PaymentOutcome> {
        match self.event.as_str() {
            "charge.success" => Some(PaymentOutcome::Completed),
            "charge.failed" => Some(PaymentOutcome::Failed),
            "refund.processed" => Some(PaymentOutcome::Refunded),
            _ => None,
        }
    }

    fn booking_id(&self) -> Result<Ulid, EngineError> {
        let raw = self
            .data
            .get("booking_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Validation("webhook data.booking_id is required".into()))?;
        Ulid::from_string(raw)
            .map_err(|e| EngineError::Validation(format!("bad data.booking_id: {e}")))
    }

    fn amount(&self) -> Option<i64> {
        self.data.get("amount").and_then(|v| v.as_i64())
    }

    fn method(&self) -> PaymentMethod {
        self.data
            .get("method")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(PaymentMethod::Online)
    }
}

/// Result of a webhook delivery. All variants are acknowledged to the sender.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Ignored { event: String },
    Processed(ApplyOutcome),
    HeldForReview(PaymentAnomaly),
}

impl Engine {
    /// Record one payment report and reconcile the booking against it.
    ///
    /// A repeated reference for the same booking returns the booking as it
    /// is. A report that conflicts with the current state is recorded as an
    /// anomaly and returned as [`EngineError::Anomaly`]; the booking is left
    /// unchanged.
    pub async fn apply_payment_event(
        &self,
        booking_id: Ulid,
        mut event: PaymentEvent,
    ) -> Result<ApplyOutcome, EngineError> {
        // Dedup and verification both key on the trimmed reference.
        event.external_reference = event.external_reference.trim().to_string();
        validate_event(booking_id, &event)?;
        let event = &event;
        let step = self
            .retry
            .run_tx("apply_payment_event", move |_| self.apply_once(event))
            .await?;

        let channel = event.channel.as_str();
        match step {
            Step::Done(outcome) => {
                match outcome.applied {
                    Applied::Transitioned { from } => {
                        metrics::counter!(
                            PAYMENT_TRANSITIONS_TOTAL,
                            "channel" => channel,
                            "status" => outcome.booking.payment_status.as_str()
                        )
                        .increment(1);
                        info!(
                            booking = %booking_id,
                            reference = %event.external_reference,
                            channel,
                            from = from.as_str(),
                            to = outcome.booking.payment_status.as_str(),
                            "payment status changed"
                        );
                        self.publish(&outcome.booking, FactKind::PaymentChanged);
                    }
                    Applied::Unchanged => {
                        debug!(
                            booking = %booking_id,
                            reference = %event.external_reference,
                            channel,
                            "payment report agrees with current state"
                        );
                    }
                    Applied::Duplicate => {
                        metrics::counter!(PAYMENT_DUPLICATES_TOTAL, "channel" => channel)
                            .increment(1);
                        debug!(
                            booking = %booking_id,
                            reference = %event.external_reference,
                            channel,
                            "duplicate payment event ignored"
                        );
                    }
                }
                Ok(outcome)
            }
            Step::Anomaly(anomaly) => {
                let kind = match anomaly.kind {
                    AnomalyKind::ConflictingTerminalState => "conflicting_terminal_state",
                    AnomalyKind::RefundBeforePayment => "refund_before_payment",
                    AnomalyKind::AmountMismatch => "amount_mismatch",
                };
                metrics::counter!(PAYMENT_ANOMALIES_TOTAL, "kind" => kind).increment(1);
                warn!(
                    booking = %booking_id,
                    reference = %anomaly.reference,
                    channel,
                    current = anomaly.current.as_str(),
                    reported = anomaly.reported.as_status().as_str(),
                    kind,
                    "payment anomaly held for review"
                );
                Err(EngineError::Anomaly(anomaly))
            }
        }
    }

    async fn apply_once(&self, event: &PaymentEvent) -> Result<Staged<Step>, EngineError> {
        let booking_id = event.booking_id;
        let mut tx = self.repo.begin().await?;
        let booking = tx
            .get_booking(booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))?;

        if let Some(seen) = tx.find_payment_event(&event.external_reference).await? {
            if seen.booking_id != booking_id {
                return Err(EngineError::Validation(format!(
                    "payment reference {} already belongs to booking {}",
                    event.external_reference, seen.booking_id
                )));
            }
            let step = Step::Done(ApplyOutcome {
                booking,
                applied: Applied::Duplicate,
            });
            return Ok((tx, step));
        }

        let from = booking.payment_status;
        let decision = reconcile(from, event.outcome, event.amount, booking.total_amount);
        tx.record_payment_event(event.clone()).await?;

        match decision {
            Reconciliation::Anomaly(kind) => {
                let anomaly = PaymentAnomaly {
                    id: Ulid::new(),
                    booking_id,
                    reference: event.external_reference.clone(),
                    channel: event.channel,
                    current: from,
                    reported: event.outcome,
                    kind,
                    recorded_at: event.received_at,
                    resolved: false,
                };
                tx.record_anomaly(anomaly.clone()).await?;
                Ok((tx, Step::Anomaly(anomaly)))
            }
            Reconciliation::Unchanged => {
                let step = Step::Done(ApplyOutcome {
                    booking,
                    applied: Applied::Unchanged,
                });
                Ok((tx, step))
            }
            Reconciliation::Transition(to) => {
                tx.update_booking_payment_status(
                    booking_id,
                    to,
                    event.method,
                    Some(event.external_reference.clone()),
                )
                .await?;
                // Walk-ins go straight to the chair once paid; pre-booked
                // customers wait for staff.
                if to == PaymentStatus::Completed
                    && booking.is_walk_in()
                    && booking.status == BookingStatus::Scheduled
                {
                    tx.update_booking_status(booking_id, BookingStatus::InProgress, SYSTEM_ACTOR)
                        .await?;
                }
                let updated = tx
                    .get_booking(booking_id)
                    .await?
                    .ok_or(EngineError::NotFound(booking_id))?;
                let step = Step::Done(ApplyOutcome {
                    booking: updated,
                    applied: Applied::Transitioned { from },
                });
                Ok((tx, step))
            }
        }
    }

    /// Gateway webhook ingress. `raw` is the request body as received.
    pub async fn ingest_webhook(&self, raw: &str) -> Result<WebhookOutcome, EngineError> {
        if raw.len() > MAX_PAYLOAD_LEN {
            return Err(EngineError::LimitExceeded("webhook payload too large"));
        }
        let payload: WebhookPayload = serde_json::from_str(raw)
            .map_err(|e| EngineError::Validation(format!("malformed webhook: {e}")))?;
        let Some(outcome) = payload.outcome() else {
            debug!(event = %payload.event, reference = %payload.reference, "webhook event ignored");
            return Ok(WebhookOutcome::Ignored {
                event: payload.event.clone(),
            });
        };
        let booking_id = payload.booking_id()?;
        let event = PaymentEvent {
            channel: PaymentChannel::GatewayWebhook,
            external_reference: payload.reference.clone(),
            booking_id,
            outcome,
            amount: payload.amount(),
            method: Some(payload.method()),
            raw_payload: raw.to_string(),
            received_at: now_ms(),
        };
        match self.apply_payment_event(booking_id, event).await {
            Ok(applied) => Ok(WebhookOutcome::Processed(applied)),
            Err(EngineError::Anomaly(anomaly)) => Ok(WebhookOutcome::HeldForReview(anomaly)),
            Err(e) => Err(e),
        }
    }

    /// Elevated correction of a booking's payment status. Bypasses the
    /// transition table and resolves the booking's open anomalies.
    pub async fn manual_override(
        &self,
        booking_id: Ulid,
        status: PaymentStatus,
        actor: Actor,
        reason: &str,
    ) -> Result<Booking, EngineError> {
        if !actor.is_elevated() {
            return Err(EngineError::Forbidden(
                "payment override requires a manager or admin",
            ));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation("override reason is required".into()));
        }
        if reason.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("override reason too long"));
        }
        let (booking, from) = self
            .retry
            .run_tx("manual_override", move |_| async move {
                let mut tx = self.repo.begin().await?;
                let booking = tx
                    .get_booking(booking_id)
                    .await?
                    .ok_or(EngineError::NotFound(booking_id))?;
                let from = booking.payment_status;
                tx.override_payment_status(booking_id, status, actor.id, reason.to_string())
                    .await?;
                let updated = tx
                    .get_booking(booking_id)
                    .await?
                    .ok_or(EngineError::NotFound(booking_id))?;
                Ok((tx, (updated, from)))
            })
            .await?;
        warn!(
            booking = %booking_id,
            actor = %actor.id,
            from = from.as_str(),
            to = status.as_str(),
            reason,
            "payment status overridden"
        );
        if from != status {
            self.publish(&booking, FactKind::PaymentChanged);
        }
        Ok(booking)
    }

    /// Confirm a payment by reference.
    ///
    /// The gateway is asked first and a definite answer is applied through
    /// the normal reconciliation path as a `manual_fallback` report. If the
    /// gateway is missing or unreachable, the local records are consulted:
    /// a recorded completed event for the reference, then the booking's own
    /// payment fields. Neither fallback changes any state.
    pub async fn verify_payment(
        &self,
        booking_id: Ulid,
        reference: &str,
    ) -> Result<VerifyResult, EngineError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(EngineError::Validation("payment reference is required".into()));
        }
        if reference.len() > MAX_REFERENCE_LEN {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }

        if let Some(gateway) = &self.gateway {
            let asked =
                tokio::time::timeout(self.retry.attempt_timeout, gateway.verify(reference)).await;
            match asked {
                Ok(Ok(verdict)) => {
                    return self.apply_gateway_verdict(booking_id, reference, verdict).await;
                }
                Ok(Err(e)) => warn!(booking = %booking_id, reference, "{e}; using local records"),
                Err(_) => warn!(booking = %booking_id, reference, "gateway timed out; using local records"),
            }
        }

        let (booking, recorded) = self
            .retry
            .run("verify_payment", move |_| async move {
                let mut tx = self.repo.begin().await?;
                let booking = tx
                    .get_booking(booking_id)
                    .await?
                    .ok_or(EngineError::NotFound(booking_id))?;
                let recorded = tx.find_payment_event(reference).await?;
                Ok((booking, recorded))
            })
            .await?;
        Ok(verify_locally(&booking, reference, recorded.as_ref()))
    }

    async fn apply_gateway_verdict(
        &self,
        booking_id: Ulid,
        reference: &str,
        verdict: GatewayVerdict,
    ) -> Result<VerifyResult, EngineError> {
        let Some(outcome) = verdict.outcome else {
            return Ok(VerifyResult {
                success: false,
                method: verdict.method,
                booking_id,
            });
        };
        let event = PaymentEvent {
            channel: PaymentChannel::ManualFallback,
            external_reference: reference.to_string(),
            booking_id,
            outcome,
            amount: verdict.amount,
            method: verdict.method,
            raw_payload: serde_json::json!({
                "source": "gateway_verify",
                "outcome": outcome,
                "amount": verdict.amount,
            })
            .to_string(),
            received_at: now_ms(),
        };
        let applied = self.apply_payment_event(booking_id, event).await?;
        Ok(VerifyResult {
            success: applied.booking.payment_status.is_paid(),
            method: applied.booking.payment_method.or(verdict.method),
            booking_id,
        })
    }

    pub async fn list_anomalies(&self, open_only: bool) -> Result<Vec<PaymentAnomaly>, EngineError> {
        self.retry
            .run("list_anomalies", move |_| async move {
                let mut tx = self.repo.begin().await?;
                let mut out = tx.list_anomalies(open_only).await?;
                out.sort_by_key(|a| (a.recorded_at, a.id));
                Ok(out)
            })
            .await
    }

    pub async fn payment_events(&self, booking_id: Ulid) -> Result<Vec<PaymentEvent>, EngineError> {
        self.retry
            .run("payment_events", move |_| async move {
                let mut tx = self.repo.begin().await?;
                Ok(tx.payment_events_for_booking(booking_id).await?)
            })
            .await
    }
}

/// Fallback verification against local records only. Success always
/// requires the booking itself to be paid, so a fallback can never
/// contradict the recorded state.
fn verify_locally(
    booking: &Booking,
    reference: &str,
    recorded: Option<&PaymentEvent>,
) -> VerifyResult {
    let paid = booking.payment_status.is_paid();
    if let Some(ev) = recorded
        && ev.booking_id == booking.id
        && ev.outcome == PaymentOutcome::Completed
    {
        return VerifyResult {
            success: paid,
            method: ev.method.or(booking.payment_method),
            booking_id: booking.id,
        };
    }
    VerifyResult {
        success: paid && booking.payment_reference.as_deref() == Some(reference),
        method: booking.payment_method,
        booking_id: booking.id,
    }
}
