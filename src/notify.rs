use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::BookingFact;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking state-change facts.
///
/// Sending never blocks and never fails from the caller's point of view:
/// a transition is already committed by the time its fact is emitted.
pub struct NotifyHub {
    all: broadcast::Sender<BookingFact>,
    per_booking: DashMap<Ulid, broadcast::Sender<BookingFact>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            per_booking: DashMap::new(),
        }
    }

    /// Subscribe to every fact.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingFact> {
        self.all.subscribe()
    }

    /// Subscribe to facts for one booking. Creates the channel if needed.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<BookingFact> {
        self.per_booking
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a fact. No-op if nobody is listening.
    pub fn send(&self, fact: &BookingFact) {
        let _ = self.all.send(fact.clone());
        if let Some(sender) = self.per_booking.get(&fact.booking_id) {
            let _ = sender.send(fact.clone());
        }
    }

    /// Drop a booking's channel once it is no longer interesting.
    pub fn remove(&self, booking_id: &Ulid) {
        self.per_booking.remove(booking_id);
    }
}

/// Outbound delivery collaborator (email, WhatsApp, ...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, fact: &BookingFact) -> Result<(), String>;
}

/// Writes every fact to the log. Stands in for real channels until one is configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, fact: &BookingFact) -> Result<(), String> {
        info!(
            booking = %fact.booking_id,
            kind = ?fact.kind,
            status = fact.status.as_str(),
            payment = fact.payment_status.as_str(),
            "booking fact"
        );
        Ok(())
    }
}

/// Forward every fact to each sink. Failures are logged and dropped.
pub async fn run_dispatcher(
    mut rx: broadcast::Receiver<BookingFact>,
    sinks: Vec<std::sync::Arc<dyn NotificationSink>>,
) {
    loop {
        let fact = match rx.recv().await {
            Ok(fact) => fact,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("notification dispatcher lagged, {n} facts skipped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        for sink in &sinks {
            match sink.deliver(&fact).await {
                Ok(()) => debug!(sink = sink.name(), booking = %fact.booking_id, "fact delivered"),
                Err(e) => {
                    metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "sink" => sink.name().to_string())
                        .increment(1);
                    warn!(sink = sink.name(), booking = %fact.booking_id, "delivery failed: {e}");
                }
            }
        }
    }
}
