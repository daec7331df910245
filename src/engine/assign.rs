use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_WORKERS_PER_ASSIGNMENT;
use crate::model::*;
use crate::observability::ASSIGNMENT_CONFLICTS_TOTAL;

use super::conflict::{find_conflicts, now_ms};
use super::{Engine, EngineError, Staged, Unavailability};

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentResult {
    pub booking: Booking,
    /// Workers added by this call.
    pub assigned: Vec<Ulid>,
    /// Workers that were already on the booking.
    pub already_assigned: Vec<Ulid>,
}

fn validate_worker_ids(worker_ids: &[Ulid]) -> Result<(), EngineError> {
    if worker_ids.is_empty() {
        return Err(EngineError::Validation("no workers given".into()));
    }
    if worker_ids.len() > MAX_WORKERS_PER_ASSIGNMENT {
        return Err(EngineError::LimitExceeded("too many workers in one assignment"));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = worker_ids.iter().find(|w| !seen.insert(**w)) {
        return Err(EngineError::Validation(format!("worker listed twice: {dup}")));
    }
    Ok(())
}

impl Engine {
    /// Put workers on a booking.
    ///
    /// The conflict check and the inserts share one serializable transaction,
    /// so two concurrent calls can not both claim the same worker for
    /// overlapping time. Workers already on this booking are skipped, which
    /// makes a retried call after an ambiguous commit a no-op.
    pub async fn assign_workers(
        &self,
        booking_id: Ulid,
        worker_ids: &[Ulid],
        actor: Actor,
    ) -> Result<AssignmentResult, EngineError> {
        validate_worker_ids(worker_ids)?;
        let result = self
            .retry
            .run_tx("assign_workers", move |_| self.assign_once(booking_id, worker_ids, actor))
            .await;

        let result = match result {
            Ok(r) => r,
            Err(EngineError::Conflict(conflicts)) => {
                metrics::counter!(ASSIGNMENT_CONFLICTS_TOTAL).increment(conflicts.len() as u64);
                info!(
                    booking = %booking_id,
                    conflicts = conflicts.len(),
                    "assignment rejected: overlapping bookings"
                );
                return Err(EngineError::Conflict(conflicts));
            }
            Err(e) => return Err(e),
        };

        if result.assigned.is_empty() {
            debug!(booking = %booking_id, "workers already assigned, nothing to do");
        } else {
            info!(
                booking = %booking_id,
                workers = ?result.assigned,
                actor = %actor.id,
                "workers assigned"
            );
            self.publish(&result.booking, FactKind::WorkersAssigned);
        }
        Ok(result)
    }

    async fn assign_once(
        &self,
        booking_id: Ulid,
        worker_ids: &[Ulid],
        actor: Actor,
    ) -> Result<Staged<AssignmentResult>, EngineError> {
        let mut tx = self.repo.begin().await?;
        let booking = tx
            .get_booking(booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.status.is_final() {
            return Err(EngineError::BookingNotAssignable {
                id: booking_id,
                status: booking.status,
            });
        }

        let on_booking: HashSet<Ulid> = tx
            .assignments_for_booking(booking_id)
            .await?
            .into_iter()
            .map(|a| a.worker_id)
            .collect();
        let (already_assigned, fresh): (Vec<Ulid>, Vec<Ulid>) =
            worker_ids.iter().copied().partition(|w| on_booking.contains(w));

        let mut unavailable = Vec::new();
        for &worker_id in &fresh {
            match tx.get_worker(worker_id).await? {
                None => unavailable.push((worker_id, Unavailability::Unknown)),
                Some(w) => {
                    if let Some(why) = Unavailability::from_state(w.state) {
                        unavailable.push((worker_id, why));
                    } else if !w.qualified_for(&booking.services) {
                        unavailable.push((worker_id, Unavailability::Unqualified));
                    }
                }
            }
        }
        if !unavailable.is_empty() {
            return Err(EngineError::Unavailable(unavailable));
        }

        if fresh.is_empty() {
            let result = AssignmentResult {
                booking,
                assigned: fresh,
                already_assigned,
            };
            return Ok((tx, result));
        }

        let span = booking.span();
        let rows = tx.list_assignments(&fresh, span).await?;
        let conflicts = find_conflicts(&rows, &fresh, span, Some(booking_id));
        if !conflicts.is_empty() {
            return Err(EngineError::Conflict(conflicts));
        }

        let assigned_at = now_ms();
        for &worker_id in &fresh {
            tx.insert_assignment(WorkerAssignment {
                booking_id,
                worker_id,
                assigned_at,
                assigned_by: actor.id,
            })
            .await?;
        }
        let booking = tx
            .get_booking(booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))?;
        let result = AssignmentResult {
            booking,
            assigned: fresh,
            already_assigned,
        };
        Ok((tx, result))
    }
}
