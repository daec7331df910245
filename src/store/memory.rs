use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::{Repository, StorageError, Transaction};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches commits.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { events, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(events, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside batch loop")));
        }
    }
}

// ── Committed state ──────────────────────────────────────

#[derive(Default)]
struct StoreState {
    workers: HashMap<Ulid, WorkerSchedule>,
    bookings: HashMap<Ulid, Booking>,
    /// booking id → its assignments, in insertion order
    assignments: HashMap<Ulid, Vec<WorkerAssignment>>,
    /// external reference → event
    payments: HashMap<String, PaymentEvent>,
    anomalies: Vec<PaymentAnomaly>,
}

/// Booking-level effect of an event. Shared by commit and in-transaction reads.
fn apply_to_booking(booking: &mut Booking, ev: &Event) {
    match ev {
        Event::BookingRescheduled {
            id,
            start,
            duration_minutes,
        } if *id == booking.id => {
            booking.start = *start;
            booking.duration_minutes = *duration_minutes;
        }
        Event::BookingStatusChanged { id, status, .. } if *id == booking.id => {
            booking.status = *status;
        }
        Event::WorkerAssigned { assignment } if assignment.booking_id == booking.id => {
            booking.worker_assigned = true;
        }
        Event::PaymentOverridden { id, status, .. } if *id == booking.id => {
            booking.payment_status = *status;
        }
        Event::PaymentStatusChanged {
            id,
            status,
            method,
            reference,
        } if *id == booking.id => {
            booking.payment_status = *status;
            if method.is_some() {
                booking.payment_method = *method;
            }
            if reference.is_some() {
                booking.payment_reference = reference.clone();
            }
        }
        _ => {}
    }
}

fn apply_to_worker(worker: &mut Worker, ev: &Event) {
    if let Event::WorkerStateChanged { id, state } = ev
        && *id == worker.id
    {
        worker.state = *state;
    }
}

impl StoreState {
    fn apply(&mut self, ev: &Event) {
        match ev {
            Event::WorkerRegistered { worker } => {
                self.workers
                    .insert(worker.id, WorkerSchedule::new(worker.clone()));
            }
            Event::WorkerStateChanged { id, .. } => {
                if let Some(ws) = self.workers.get_mut(id) {
                    apply_to_worker(&mut ws.worker, ev);
                }
            }
            Event::BookingCreated { booking } => {
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingRescheduled { id, .. } => {
                let Some(booking) = self.bookings.get_mut(id) else {
                    return;
                };
                apply_to_booking(booking, ev);
                let span = booking.span();
                for a in self.assignments.get(id).into_iter().flatten() {
                    if let Some(ws) = self.workers.get_mut(&a.worker_id) {
                        ws.remove_booking(*id);
                        ws.insert_slot(Slot {
                            booking_id: *id,
                            span,
                        });
                    }
                }
            }
            Event::BookingStatusChanged { id, .. } | Event::PaymentStatusChanged { id, .. } => {
                if let Some(booking) = self.bookings.get_mut(id) {
                    apply_to_booking(booking, ev);
                }
            }
            Event::WorkerAssigned { assignment } => {
                let Some(booking) = self.bookings.get_mut(&assignment.booking_id) else {
                    return;
                };
                apply_to_booking(booking, ev);
                let span = booking.span();
                if let Some(ws) = self.workers.get_mut(&assignment.worker_id) {
                    ws.insert_slot(Slot {
                        booking_id: assignment.booking_id,
                        span,
                    });
                }
                self.assignments
                    .entry(assignment.booking_id)
                    .or_default()
                    .push(assignment.clone());
            }
            Event::PaymentRecorded { event } => {
                self.payments
                    .insert(event.external_reference.clone(), event.clone());
            }
            Event::AnomalyRecorded { anomaly } => self.anomalies.push(anomaly.clone()),
            Event::PaymentOverridden { id, .. } => {
                if let Some(booking) = self.bookings.get_mut(id) {
                    apply_to_booking(booking, ev);
                }
                for a in self.anomalies.iter_mut().filter(|a| a.booking_id == *id) {
                    a.resolved = true;
                }
            }
        }
    }

    /// Minimal event set that recreates the current state.
    fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        events.extend(self.workers.values().map(|ws| Event::WorkerRegistered {
            worker: ws.worker.clone(),
        }));
        events.extend(self.bookings.values().map(|b| Event::BookingCreated {
            booking: b.clone(),
        }));
        for list in self.assignments.values() {
            events.extend(list.iter().map(|a| Event::WorkerAssigned {
                assignment: a.clone(),
            }));
        }
        events.extend(self.payments.values().map(|p| Event::PaymentRecorded {
            event: p.clone(),
        }));
        events.extend(self.anomalies.iter().map(|a| Event::AnomalyRecorded {
            anomaly: a.clone(),
        }));
        events
    }
}

// ── Store ────────────────────────────────────────────────

/// In-memory repository made durable by the write-ahead log.
///
/// Transactions hold the state mutex from `begin` until commit or drop, which
/// makes every transaction serializable.
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl MemoryStore {
    /// Replay the log at `wal_path` and start its writer task.
    /// Must be called inside a Tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.torn_tail {
            warn!(
                "discarded torn tail of {} after {} events",
                wal_path.display(),
                replay.events.len()
            );
        }
        let mut state = StoreState::default();
        for ev in &replay.events {
            state.apply(ev);
        }
        info!(
            workers = state.workers.len(),
            bookings = state.bookings.len(),
            "replayed {}",
            wal_path.display()
        );

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            wal_tx,
        })
    }

    /// Rewrite the log with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        {
            // Holding the lock orders the Compact command after every committed append.
            let guard = self.state.lock().await;
            let events = guard.snapshot_events();
            self.wal_tx
                .send(WalCommand::Compact {
                    events,
                    response: tx,
                })
                .await
                .map_err(|_| StorageError::ConnectionLost("WAL writer shut down".into()))?;
        }
        rx.await
            .map_err(|_| StorageError::ConnectionLost("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let state = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTx {
            state,
            staged: Vec::new(),
            wal_tx: self.wal_tx.clone(),
        }))
    }
}

// ── Transaction ──────────────────────────────────────────

struct MemoryTx {
    state: OwnedMutexGuard<StoreState>,
    staged: Vec<Event>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl MemoryTx {
    fn booking_view(&self, id: Ulid) -> Option<Booking> {
        let mut view = self.state.bookings.get(&id).cloned();
        for ev in &self.staged {
            match ev {
                Event::BookingCreated { booking } if booking.id == id => {
                    view = Some(booking.clone())
                }
                _ => {
                    if let Some(b) = view.as_mut() {
                        apply_to_booking(b, ev);
                    }
                }
            }
        }
        view
    }

    fn worker_view(&self, id: Ulid) -> Option<Worker> {
        let mut view = self.state.workers.get(&id).map(|ws| ws.worker.clone());
        for ev in &self.staged {
            match ev {
                Event::WorkerRegistered { worker } if worker.id == id => {
                    view = Some(worker.clone())
                }
                _ => {
                    if let Some(w) = view.as_mut() {
                        apply_to_worker(w, ev);
                    }
                }
            }
        }
        view
    }

    fn assignment_views(&self, booking_id: Ulid) -> Vec<WorkerAssignment> {
        let mut out = self
            .state
            .assignments
            .get(&booking_id)
            .cloned()
            .unwrap_or_default();
        for ev in &self.staged {
            if let Event::WorkerAssigned { assignment } = ev
                && assignment.booking_id == booking_id
            {
                out.push(assignment.clone());
            }
        }
        out
    }

    fn scan_assignments(&self, worker_ids: &[Ulid], window: Span) -> Vec<ScheduledAssignment> {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for &worker_id in worker_ids {
            if !seen.insert(worker_id) {
                continue;
            }
            let mut booking_ids: Vec<Ulid> = self
                .state
                .workers
                .get(&worker_id)
                .map(|ws| ws.overlapping(&window).map(|s| s.booking_id).collect())
                .unwrap_or_default();
            for ev in &self.staged {
                if let Event::WorkerAssigned { assignment } = ev
                    && assignment.worker_id == worker_id
                {
                    booking_ids.push(assignment.booking_id);
                }
            }
            for booking_id in booking_ids {
                let Some(booking) = self.booking_view(booking_id) else {
                    continue;
                };
                let span = booking.span();
                if !span.overlaps(&window) {
                    continue;
                }
                rows.push(ScheduledAssignment {
                    worker_id,
                    booking_id,
                    booking_reference: booking.reference,
                    span,
                    status: booking.status,
                });
            }
        }
        rows
    }

    fn payment_view(&self, reference: &str) -> Option<PaymentEvent> {
        self.staged
            .iter()
            .find_map(|ev| match ev {
                Event::PaymentRecorded { event } if event.external_reference == reference => {
                    Some(event.clone())
                }
                _ => None,
            })
            .or_else(|| self.state.payments.get(reference).cloned())
    }

    fn require_booking(&self, id: Ulid) -> Result<Booking, StorageError> {
        self.booking_view(id).ok_or(StorageError::NotFound(id))
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn get_booking(&mut self, id: Ulid) -> Result<Option<Booking>, StorageError> {
        Ok(self.booking_view(id))
    }

    async fn list_bookings(&mut self, window: Span) -> Result<Vec<Booking>, StorageError> {
        let mut ids: Vec<Ulid> = self.state.bookings.keys().copied().collect();
        for ev in &self.staged {
            if let Event::BookingCreated { booking } = ev {
                ids.push(booking.id);
            }
        }
        Ok(ids
            .into_iter()
            .filter_map(|id| self.booking_view(id))
            .filter(|b| b.span().overlaps(&window))
            .collect())
    }

    async fn get_worker(&mut self, id: Ulid) -> Result<Option<Worker>, StorageError> {
        Ok(self.worker_view(id))
    }

    async fn list_assignments(
        &mut self,
        worker_ids: &[Ulid],
        window: Span,
    ) -> Result<Vec<ScheduledAssignment>, StorageError> {
        Ok(self.scan_assignments(worker_ids, window))
    }

    async fn assignments_for_booking(
        &mut self,
        booking_id: Ulid,
    ) -> Result<Vec<WorkerAssignment>, StorageError> {
        Ok(self.assignment_views(booking_id))
    }

    async fn find_payment_event(
        &mut self,
        reference: &str,
    ) -> Result<Option<PaymentEvent>, StorageError> {
        Ok(self.payment_view(reference))
    }

    async fn payment_events_for_booking(
        &mut self,
        booking_id: Ulid,
    ) -> Result<Vec<PaymentEvent>, StorageError> {
        let mut out: Vec<PaymentEvent> = self
            .state
            .payments
            .values()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect();
        for ev in &self.staged {
            if let Event::PaymentRecorded { event } = ev
                && event.booking_id == booking_id
            {
                out.push(event.clone());
            }
        }
        out.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.external_reference.cmp(&b.external_reference))
        });
        Ok(out)
    }

    async fn list_anomalies(
        &mut self,
        open_only: bool,
    ) -> Result<Vec<PaymentAnomaly>, StorageError> {
        let mut out = self.state.anomalies.clone();
        for ev in &self.staged {
            match ev {
                Event::AnomalyRecorded { anomaly } => out.push(anomaly.clone()),
                Event::PaymentOverridden { id, .. } => {
                    for a in out.iter_mut().filter(|a| a.booking_id == *id) {
                        a.resolved = true;
                    }
                }
                _ => {}
            }
        }
        if open_only {
            out.retain(|a| !a.resolved);
        }
        Ok(out)
    }

    async fn insert_worker(&mut self, worker: Worker) -> Result<(), StorageError> {
        if self.worker_view(worker.id).is_some() {
            return Err(StorageError::AlreadyExists(worker.id));
        }
        self.staged.push(Event::WorkerRegistered { worker });
        Ok(())
    }

    async fn update_worker_state(
        &mut self,
        id: Ulid,
        state: WorkerState,
    ) -> Result<(), StorageError> {
        if self.worker_view(id).is_none() {
            return Err(StorageError::NotFound(id));
        }
        self.staged.push(Event::WorkerStateChanged { id, state });
        Ok(())
    }

    async fn insert_booking(&mut self, booking: Booking) -> Result<(), StorageError> {
        if self.booking_view(booking.id).is_some() {
            return Err(StorageError::AlreadyExists(booking.id));
        }
        self.staged.push(Event::BookingCreated { booking });
        Ok(())
    }

    async fn update_booking_schedule(
        &mut self,
        id: Ulid,
        start: Ms,
        duration_minutes: u32,
    ) -> Result<(), StorageError> {
        self.require_booking(id)?;
        let span = Span::from_minutes(start, duration_minutes);
        for a in self.assignment_views(id) {
            let clash = self
                .scan_assignments(&[a.worker_id], span)
                .into_iter()
                .any(|r| r.booking_id != id && r.status != BookingStatus::Cancelled);
            if clash {
                return Err(StorageError::UniqueViolation {
                    worker_id: a.worker_id,
                    booking_id: id,
                });
            }
        }
        self.staged.push(Event::BookingRescheduled {
            id,
            start,
            duration_minutes,
        });
        Ok(())
    }

    async fn update_booking_status(
        &mut self,
        id: Ulid,
        status: BookingStatus,
        actor: Ulid,
    ) -> Result<(), StorageError> {
        self.require_booking(id)?;
        self.staged
            .push(Event::BookingStatusChanged { id, status, actor });
        Ok(())
    }

    async fn insert_assignment(
        &mut self,
        assignment: WorkerAssignment,
    ) -> Result<(), StorageError> {
        let booking = self.require_booking(assignment.booking_id)?;
        if self.worker_view(assignment.worker_id).is_none() {
            return Err(StorageError::NotFound(assignment.worker_id));
        }
        if self
            .assignment_views(assignment.booking_id)
            .iter()
            .any(|a| a.worker_id == assignment.worker_id)
        {
            return Err(StorageError::AlreadyExists(assignment.worker_id));
        }
        let clash = self
            .scan_assignments(&[assignment.worker_id], booking.span())
            .into_iter()
            .any(|r| r.booking_id != booking.id && r.status != BookingStatus::Cancelled);
        if clash {
            return Err(StorageError::UniqueViolation {
                worker_id: assignment.worker_id,
                booking_id: booking.id,
            });
        }
        self.staged.push(Event::WorkerAssigned { assignment });
        Ok(())
    }

    async fn update_booking_payment_status(
        &mut self,
        id: Ulid,
        status: PaymentStatus,
        method: Option<PaymentMethod>,
        reference: Option<String>,
    ) -> Result<(), StorageError> {
        self.require_booking(id)?;
        self.staged.push(Event::PaymentStatusChanged {
            id,
            status,
            method,
            reference,
        });
        Ok(())
    }

    async fn record_payment_event(&mut self, event: PaymentEvent) -> Result<(), StorageError> {
        if self.payment_view(&event.external_reference).is_some() {
            return Err(StorageError::DuplicateReference(event.external_reference));
        }
        self.staged.push(Event::PaymentRecorded { event });
        Ok(())
    }

    async fn record_anomaly(&mut self, anomaly: PaymentAnomaly) -> Result<(), StorageError> {
        self.staged.push(Event::AnomalyRecorded { anomaly });
        Ok(())
    }

    async fn override_payment_status(
        &mut self,
        id: Ulid,
        status: PaymentStatus,
        actor: Ulid,
        reason: String,
    ) -> Result<(), StorageError> {
        self.require_booking(id)?;
        self.staged.push(Event::PaymentOverridden {
            id,
            status,
            actor,
            reason,
        });
        Ok(())
    }

    /// Log first, then apply. Runs on its own task so a caller that gives up
    /// mid-commit can not leave the log and the in-memory state disagreeing.
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTx {
            mut state,
            staged,
            wal_tx,
        } = *self;
        if staged.is_empty() {
            return Ok(());
        }
        let task = tokio::spawn(async move {
            let (tx, rx) = oneshot::channel();
            wal_tx
                .send(WalCommand::Append {
                    events: staged.clone(),
                    response: tx,
                })
                .await
                .map_err(|_| StorageError::ConnectionLost("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| StorageError::ConnectionLost("WAL writer dropped response".into()))?
                .map_err(|e| StorageError::Io(e.to_string()))?;
            for ev in &staged {
                state.apply(ev);
            }
            Ok(())
        });
        task.await
            .map_err(|e| StorageError::ConnectionLost(format!("commit task failed: {e}")))?
    }
}
