use std::collections::HashSet;

use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflicts, now_ms, validate_schedule};
use super::{Engine, EngineError};

/// Intake request for a new booking.
#[derive(Debug, Clone, Deserialize)]
pub struct BookingDraft {
    pub start: Ms,
    pub duration_minutes: u32,
    pub services: Vec<Ulid>,
    #[serde(default)]
    pub customer: Option<Customer>,
    pub customer_type: CustomerType,
    #[serde(default)]
    pub total_amount: i64,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
}

impl BookingDraft {
    fn validate(&self) -> Result<(), EngineError> {
        validate_schedule(self.start, self.duration_minutes)?;
        if self.services.is_empty() {
            return Err(EngineError::Validation(
                "booking needs at least one service".into(),
            ));
        }
        if self.services.len() > MAX_SERVICES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.total_amount < 0 {
            return Err(EngineError::Validation(
                "total amount can not be negative".into(),
            ));
        }
        if let Some(Customer::Guest(snapshot)) = &self.customer {
            if snapshot.name.trim().is_empty() {
                return Err(EngineError::Validation("guest name is required".into()));
            }
            if snapshot.name.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("guest name too long"));
            }
        }
        Ok(())
    }

    fn into_booking(self, id: Ulid, created_at: Ms) -> Booking {
        let status = match self.customer_type {
            CustomerType::WalkIn => BookingStatus::Scheduled,
            CustomerType::PreBooked => BookingStatus::PendingConfirmation,
        };
        Booking {
            id,
            reference: booking_reference(&id),
            start: self.start,
            duration_minutes: self.duration_minutes,
            services: self.services,
            customer: self.customer,
            customer_type: self.customer_type,
            status,
            payment_status: PaymentStatus::Pending,
            payment_method: self.payment_method,
            payment_reference: None,
            total_amount: self.total_amount,
            worker_assigned: false,
            created_at,
        }
    }
}

impl Engine {
    pub async fn register_worker(
        &self,
        id: Ulid,
        name: Option<String>,
        skills: Vec<Ulid>,
        actor: Actor,
    ) -> Result<Worker, EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("worker name too long"));
        }
        let skills: Vec<Ulid> = {
            let mut seen = HashSet::new();
            skills.into_iter().filter(|s| seen.insert(*s)).collect()
        };
        let worker = Worker {
            id,
            name,
            state: WorkerState::Active,
            skills,
        };
        let worker = &worker;
        self.retry
            .run_tx("register_worker", move |_| async move {
                let mut tx = self.repo.begin().await?;
                match tx.get_worker(worker.id).await? {
                    // An earlier attempt of this same call committed.
                    Some(existing) if existing == *worker => return Ok((tx, ())),
                    Some(_) => {
                        return Err(EngineError::Validation(format!(
                            "worker already exists: {}",
                            worker.id
                        )));
                    }
                    None => {}
                }
                tx.insert_worker(worker.clone()).await?;
                Ok((tx, ()))
            })
            .await?;
        info!(worker = %id, actor = %actor.id, "worker registered");
        Ok(worker.clone())
    }

    pub async fn set_worker_state(
        &self,
        id: Ulid,
        state: WorkerState,
        actor: Actor,
    ) -> Result<Worker, EngineError> {
        let worker = self
            .retry
            .run_tx("set_worker_state", move |_| async move {
                let mut tx = self.repo.begin().await?;
                let mut worker = tx.get_worker(id).await?.ok_or(EngineError::NotFound(id))?;
                if worker.state != state {
                    tx.update_worker_state(id, state).await?;
                    worker.state = state;
                }
                Ok((tx, worker))
            })
            .await?;
        info!(worker = %id, actor = %actor.id, state = ?state, "worker state set");
        Ok(worker)
    }

    pub async fn create_booking(
        &self,
        draft: BookingDraft,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        draft.validate()?;
        let booking = draft.into_booking(Ulid::new(), now_ms());
        let booking = &booking;
        let created = self
            .retry
            .run_tx("create_booking", move |_| async move {
                let mut tx = self.repo.begin().await?;
                // The id is fresh, so finding it means an earlier attempt committed.
                if let Some(existing) = tx.get_booking(booking.id).await? {
                    return Ok((tx, existing));
                }
                tx.insert_booking(booking.clone()).await?;
                Ok((tx, booking.clone()))
            })
            .await?;
        info!(booking = %created.id, reference = %created.reference, actor = %actor.id, "booking created");
        self.publish(&created, FactKind::Created);
        Ok(created)
    }

    /// Move a booking. Every worker already on it is re-checked against the
    /// new interval, excluding the booking itself, in the same transaction.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        start: Ms,
        duration_minutes: u32,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        let span = validate_schedule(start, duration_minutes)?;

        let (booking, changed) = self
            .retry
            .run_tx("reschedule_booking", move |_| async move {
                let mut tx = self.repo.begin().await?;
                let booking = tx.get_booking(id).await?.ok_or(EngineError::NotFound(id))?;
                if booking.status.is_final() {
                    return Err(EngineError::Validation(format!(
                        "{} booking can not be rescheduled",
                        booking.status.as_str()
                    )));
                }
                if booking.start == start && booking.duration_minutes == duration_minutes {
                    return Ok((tx, (booking, false)));
                }
                let workers: Vec<Ulid> = tx
                    .assignments_for_booking(id)
                    .await?
                    .into_iter()
                    .map(|a| a.worker_id)
                    .collect();
                if !workers.is_empty() {
                    let rows = tx.list_assignments(&workers, span).await?;
                    let conflicts = find_conflicts(&rows, &workers, span, Some(id));
                    if !conflicts.is_empty() {
                        return Err(EngineError::Conflict(conflicts));
                    }
                }
                tx.update_booking_schedule(id, start, duration_minutes).await?;
                let updated = tx.get_booking(id).await?.ok_or(EngineError::NotFound(id))?;
                Ok((tx, (updated, true)))
            })
            .await
            .inspect_err(|e| {
                if let EngineError::Conflict(c) = e {
                    metrics::counter!(crate::observability::ASSIGNMENT_CONFLICTS_TOTAL)
                        .increment(c.len() as u64);
                }
            })?;
        if changed {
            info!(booking = %id, start, duration_minutes, actor = %actor.id, "booking rescheduled");
            self.publish(&booking, FactKind::Rescheduled);
        }
        Ok(booking)
    }

    /// Lifecycle transition. Setting the current status again is a no-op.
    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        let (booking, changed) = self
            .retry
            .run_tx("set_booking_status", move |_| async move {
                let mut tx = self.repo.begin().await?;
                let booking = tx.get_booking(id).await?.ok_or(EngineError::NotFound(id))?;
                if booking.status == status {
                    return Ok((tx, (booking, false)));
                }
                if !booking.status.can_transition_to(status) {
                    return Err(EngineError::InvalidTransition {
                        from: booking.status,
                        to: status,
                    });
                }
                tx.update_booking_status(id, status, actor.id).await?;
                let updated = tx.get_booking(id).await?.ok_or(EngineError::NotFound(id))?;
                Ok((tx, (updated, true)))
            })
            .await?;
        if changed {
            info!(booking = %id, status = status.as_str(), actor = %actor.id, "booking status changed");
            self.publish(&booking, FactKind::StatusChanged);
            if booking.status.is_final() {
                self.notify.remove(&id);
            }
        }
        Ok(booking)
    }
}
