use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflicts, validate_span};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.retry
            .run("get_booking", move |_| async move {
                let mut tx = self.repo.begin().await?;
                tx.get_booking(id).await?.ok_or(EngineError::NotFound(id))
            })
            .await
    }

    pub async fn get_worker(&self, id: Ulid) -> Result<Worker, EngineError> {
        self.retry
            .run("get_worker", move |_| async move {
                let mut tx = self.repo.begin().await?;
                tx.get_worker(id).await?.ok_or(EngineError::NotFound(id))
            })
            .await
    }

    pub async fn booking_assignments(
        &self,
        booking_id: Ulid,
    ) -> Result<Vec<WorkerAssignment>, EngineError> {
        self.retry
            .run("booking_assignments", move |_| async move {
                let mut tx = self.repo.begin().await?;
                if tx.get_booking(booking_id).await?.is_none() {
                    return Err(EngineError::NotFound(booking_id));
                }
                Ok(tx.assignments_for_booking(booking_id).await?)
            })
            .await
    }

    /// Conflict preview for staff screens. Same definition of a conflict as
    /// the assignment transaction, but read-only.
    pub async fn check_conflicts(
        &self,
        worker_ids: &[Ulid],
        span: Span,
        exclude_booking: Option<Ulid>,
    ) -> Result<Vec<Conflict>, EngineError> {
        if worker_ids.is_empty() {
            return Err(EngineError::Validation("no workers given".into()));
        }
        if worker_ids.len() > MAX_WORKERS_PER_ASSIGNMENT {
            return Err(EngineError::LimitExceeded("too many workers in one query"));
        }
        validate_span(&span)?;
        if span.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        self.retry
            .run("find_conflicts", move |_| async move {
                let mut tx = self.repo.begin().await?;
                let rows = tx.list_assignments(worker_ids, span).await?;
                Ok(find_conflicts(&rows, worker_ids, span, exclude_booking))
            })
            .await
    }
}
