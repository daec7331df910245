use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("start must be before end".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_duration(duration_minutes: u32) -> Result<(), EngineError> {
    if duration_minutes == 0 {
        return Err(EngineError::Validation("duration must be positive".into()));
    }
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(())
}

/// Booking interval from untrusted input. The start is range-checked before
/// any arithmetic on it.
pub(crate) fn validate_schedule(start: Ms, duration_minutes: u32) -> Result<Span, EngineError> {
    validate_duration(duration_minutes)?;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::checked_from_minutes(start, duration_minutes)
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    validate_span(&span)?;
    Ok(span)
}

/// Every worker's assignments that overlap `span`.
///
/// `assignments` may contain rows for other workers, cancelled bookings or
/// the excluded booking; they are filtered here so every caller shares one
/// definition of a conflict. Workers listed twice are checked once. The
/// result is ordered by input worker order, then interval start, then
/// booking id.
pub fn find_conflicts(
    assignments: &[ScheduledAssignment],
    worker_ids: &[Ulid],
    span: Span,
    exclude_booking: Option<Ulid>,
) -> Vec<Conflict> {
    let mut seen_workers = HashSet::new();
    let mut out = Vec::new();
    for &worker_id in worker_ids {
        if !seen_workers.insert(worker_id) {
            continue;
        }
        let mut hits: Vec<&ScheduledAssignment> = assignments
            .iter()
            .filter(|a| a.worker_id == worker_id)
            .filter(|a| a.status != BookingStatus::Cancelled)
            .filter(|a| Some(a.booking_id) != exclude_booking)
            .filter(|a| a.span.overlaps(&span))
            .collect();
        hits.sort_by_key(|a| (a.span.start, a.booking_id));
        hits.dedup_by_key(|a| a.booking_id);
        out.extend(hits.into_iter().map(|a| Conflict {
            worker_id,
            conflicting_booking_id: a.booking_id,
            conflicting_booking_reference: a.booking_reference.clone(),
            conflicting_interval: a.span,
        }));
    }
    out
}
