//! Line protocol: one JSON request object per line, tagged by `op`, and one
//! JSON response object per line.
//!
//! ```text
//! → {"op":"assign_workers","booking_id":"01J…","worker_ids":["01J…"],"actor":{"id":"01J…","role":"staff"}}
//! ← {"ok":true,"data":{…}}
//! ← {"ok":false,"error":{"code":"conflict","message":"…","detail":[…]}}
//! ← {"notify":{"booking_id":"01J…","kind":"payment_changed",…}}
//! ```

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ulid::Ulid;

use crate::engine::{BookingDraft, Engine, EngineError, QueueView};
use crate::model::*;

/// An instant on the wire: Unix milliseconds or an ISO-8601 string with offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Instant {
    Millis(Ms),
    Iso(DateTime<FixedOffset>),
}

impl Instant {
    pub fn as_ms(&self) -> Ms {
        match self {
            Instant::Millis(ms) => *ms,
            Instant::Iso(t) => t.timestamp_millis(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterWorker {
        #[serde(default)]
        id: Option<Ulid>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        skills: Vec<Ulid>,
        actor: Actor,
    },
    SetWorkerState {
        id: Ulid,
        state: WorkerState,
        actor: Actor,
    },
    GetWorker {
        id: Ulid,
    },
    CreateBooking {
        booking: BookingDraft,
        actor: Actor,
    },
    RescheduleBooking {
        id: Ulid,
        start: Instant,
        duration_minutes: u32,
        actor: Actor,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
        actor: Actor,
    },
    GetBooking {
        id: Ulid,
    },
    BookingAssignments {
        booking_id: Ulid,
    },
    FindConflicts {
        worker_ids: Vec<Ulid>,
        start: Instant,
        end: Instant,
        #[serde(default)]
        exclude_booking_id: Option<Ulid>,
    },
    AssignWorkers {
        booking_id: Ulid,
        worker_ids: Vec<Ulid>,
        actor: Actor,
    },
    /// Gateway webhook body, passed through untouched.
    PaymentWebhook {
        payload: Value,
    },
    /// A report from any non-webhook channel.
    RecordPayment {
        booking_id: Ulid,
        channel: PaymentChannel,
        reference: String,
        outcome: PaymentOutcome,
        #[serde(default)]
        amount: Option<i64>,
        #[serde(default)]
        method: Option<PaymentMethod>,
        #[serde(default)]
        payload: Value,
    },
    VerifyPayment {
        booking_id: Ulid,
        reference: String,
    },
    ManualOverride {
        booking_id: Ulid,
        status: PaymentStatus,
        reason: String,
        actor: Actor,
    },
    ListAnomalies {
        #[serde(default = "default_true")]
        open_only: bool,
    },
    PaymentEvents {
        booking_id: Ulid,
    },
    Queue {
        date: NaiveDate,
        #[serde(default)]
        view: QueueView,
    },
    /// Push facts for one booking, or for every booking when `booking_id` is absent.
    Listen {
        #[serde(default)]
        booking_id: Option<Ulid>,
    },
    Unlisten {
        #[serde(default)]
        booking_id: Option<Ulid>,
    },
}

impl Request {
    /// Metric label.
    pub fn op(&self) -> &'static str {
        match self {
            Request::RegisterWorker { .. } => "register_worker",
            Request::SetWorkerState { .. } => "set_worker_state",
            Request::GetWorker { .. } => "get_worker",
            Request::CreateBooking { .. } => "create_booking",
            Request::RescheduleBooking { .. } => "reschedule_booking",
            Request::SetBookingStatus { .. } => "set_booking_status",
            Request::GetBooking { .. } => "get_booking",
            Request::BookingAssignments { .. } => "booking_assignments",
            Request::FindConflicts { .. } => "find_conflicts",
            Request::AssignWorkers { .. } => "assign_workers",
            Request::PaymentWebhook { .. } => "payment_webhook",
            Request::RecordPayment { .. } => "record_payment",
            Request::VerifyPayment { .. } => "verify_payment",
            Request::ManualOverride { .. } => "manual_override",
            Request::ListAnomalies { .. } => "list_anomalies",
            Request::PaymentEvents { .. } => "payment_events",
            Request::Queue { .. } => "queue",
            Request::Listen { .. } => "listen",
            Request::Unlisten { .. } => "unlisten",
        }
    }
}

fn to_value<T: Serialize>(v: T) -> Result<Value, EngineError> {
    serde_json::to_value(v)
        .map_err(|e| EngineError::Validation(format!("unserializable response: {e}")))
}

/// Run one engine request. `listen`/`unlisten` belong to the connection and
/// are rejected here.
pub async fn dispatch(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    match req {
        Request::RegisterWorker {
            id,
            name,
            skills,
            actor,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            to_value(engine.register_worker(id, name, skills, actor).await?)
        }
        Request::SetWorkerState { id, state, actor } => {
            to_value(engine.set_worker_state(id, state, actor).await?)
        }
        Request::GetWorker { id } => to_value(engine.get_worker(id).await?),
        Request::CreateBooking { booking, actor } => {
            to_value(engine.create_booking(booking, actor).await?)
        }
        Request::RescheduleBooking {
            id,
            start,
            duration_minutes,
            actor,
        } => to_value(
            engine
                .reschedule_booking(id, start.as_ms(), duration_minutes, actor)
                .await?,
        ),
        Request::SetBookingStatus { id, status, actor } => {
            to_value(engine.set_booking_status(id, status, actor).await?)
        }
        Request::GetBooking { id } => to_value(engine.get_booking(id).await?),
        Request::BookingAssignments { booking_id } => {
            to_value(engine.booking_assignments(booking_id).await?)
        }
        Request::FindConflicts {
            worker_ids,
            start,
            end,
            exclude_booking_id,
        } => {
            let span = Span::try_new(start.as_ms(), end.as_ms())
                .ok_or_else(|| EngineError::Validation("start must be before end".into()))?;
            to_value(
                engine
                    .check_conflicts(&worker_ids, span, exclude_booking_id)
                    .await?,
            )
        }
        Request::AssignWorkers {
            booking_id,
            worker_ids,
            actor,
        } => to_value(engine.assign_workers(booking_id, &worker_ids, actor).await?),
        Request::PaymentWebhook { payload } => {
            to_value(engine.ingest_webhook(&payload.to_string()).await?)
        }
        Request::RecordPayment {
            booking_id,
            channel,
            reference,
            outcome,
            amount,
            method,
            payload,
        } => {
            let event = PaymentEvent {
                channel,
                external_reference: reference,
                booking_id,
                outcome,
                amount,
                method,
                raw_payload: payload.to_string(),
                received_at: chrono::Utc::now().timestamp_millis(),
            };
            to_value(engine.apply_payment_event(booking_id, event).await?)
        }
        Request::VerifyPayment {
            booking_id,
            reference,
        } => to_value(engine.verify_payment(booking_id, &reference).await?),
        Request::ManualOverride {
            booking_id,
            status,
            reason,
            actor,
        } => to_value(
            engine
                .manual_override(booking_id, status, actor, &reason)
                .await?,
        ),
        Request::ListAnomalies { open_only } => to_value(engine.list_anomalies(open_only).await?),
        Request::PaymentEvents { booking_id } => {
            to_value(engine.payment_events(booking_id).await?)
        }
        Request::Queue { date, view } => to_value(engine.queue_for(date, view).await?),
        Request::Listen { .. } | Request::Unlisten { .. } => Err(EngineError::Validation(
            "listen/unlisten are only valid on a connection".into(),
        )),
    }
}

/// Structured detail for errors that carry more than a message.
fn error_detail(e: &EngineError) -> Value {
    match e {
        EngineError::Conflict(conflicts) => json!(conflicts),
        EngineError::Unavailable(workers) => Value::Array(
            workers
                .iter()
                .map(|(id, why)| json!({"worker_id": id, "reason": why.as_str()}))
                .collect(),
        ),
        EngineError::BookingNotAssignable { id, status } => {
            json!({"booking_id": id, "status": status})
        }
        EngineError::InvalidTransition { from, to } => json!({"from": from, "to": to}),
        EngineError::Anomaly(anomaly) => json!(anomaly),
        EngineError::NotFound(id) => json!({"id": id}),
        EngineError::System { attempts, .. } => json!({"attempts": attempts}),
        _ => Value::Null,
    }
}

pub fn ok_line(data: Value) -> String {
    json!({"ok": true, "data": data}).to_string()
}

pub fn error_line(e: &EngineError) -> String {
    json!({
        "ok": false,
        "error": {
            "code": e.code(),
            "message": e.to_string(),
            "detail": error_detail(e),
        }
    })
    .to_string()
}

pub fn notify_line(fact: &BookingFact) -> String {
    json!({"notify": fact}).to_string()
}
