use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError};

/// Named orderings over the same day's bookings. They differ only in where
/// paid bookings go; the walk-in, start time and id keys are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueView {
    /// Processing priority: unpaid bookings first, to collect payment.
    #[default]
    Collection,
    /// Paid bookings first.
    Fulfillment,
}

impl QueueView {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueView::Collection => "collection",
            QueueView::Fulfillment => "fulfillment",
        }
    }

    fn payment_weight(&self, status: PaymentStatus) -> u8 {
        match (self, status.is_paid()) {
            (QueueView::Collection, false) | (QueueView::Fulfillment, true) => 0,
            (QueueView::Collection, true) | (QueueView::Fulfillment, false) => 1,
        }
    }
}

fn local_date(at: Ms, tz: FixedOffset) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(at).map(|t| t.with_timezone(&tz).date_naive())
}

/// `[00:00, 24:00)` of `date` on the salon's wall clock.
pub(crate) fn day_window(date: NaiveDate, tz: FixedOffset) -> Option<Span> {
    let midnight = date.and_hms_opt(0, 0, 0)?.and_local_timezone(tz).single()?;
    let start = midnight.timestamp_millis();
    Span::try_new(start, start + 24 * 60 * MINUTE_MS)
}

/// Rank the bookings that are still active on `as_of`.
///
/// Pure and total: the output depends only on the set of bookings, never on
/// the order they are passed in.
pub fn compute_queue(
    bookings: &[Booking],
    as_of: NaiveDate,
    tz: FixedOffset,
    view: QueueView,
) -> Vec<QueueEntry> {
    let mut active: Vec<&Booking> = bookings
        .iter()
        .filter(|b| !b.status.is_final())
        .filter(|b| local_date(b.start, tz) == Some(as_of))
        .collect();
    active.sort_by_key(|b| {
        (
            view.payment_weight(b.payment_status),
            !b.is_walk_in(),
            b.start,
            b.id,
        )
    });
    active.dedup_by_key(|b| b.id);
    active
        .into_iter()
        .enumerate()
        .map(|(i, b)| QueueEntry {
            booking_id: b.id,
            reference: b.reference.clone(),
            rank: i as u32 + 1,
            start: b.start,
            walk_in: b.is_walk_in(),
            payment_status: b.payment_status,
        })
        .collect()
}

impl Engine {
    /// Fresh queue for `date`. Never cached.
    pub async fn queue_for(
        &self,
        date: NaiveDate,
        view: QueueView,
    ) -> Result<Vec<QueueEntry>, EngineError> {
        let window = day_window(date, self.tz)
            .ok_or_else(|| EngineError::Validation(format!("unusable date: {date}")))?;
        validate_span(&window)?;
        let bookings = self
            .retry
            .run("queue", move |_| async move {
                let mut tx = self.repo.begin().await?;
                Ok(tx.list_bookings(window).await?)
            })
            .await?;
        Ok(compute_queue(&bookings, date, self.tz, view))
    }
}
