use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::BookingFact;
use crate::observability::{REQUEST_DURATION_SECONDS, REQUESTS_TOTAL};
use crate::protocol::{self, Request};

/// Facts buffered per connection before the forwarders start waiting.
const PUSH_BUFFER: usize = 256;

/// Active `listen`s on one connection, keyed by booking (`None` = all).
struct Listeners {
    tx: mpsc::Sender<BookingFact>,
    tasks: HashMap<Option<Ulid>, JoinHandle<()>>,
}

impl Listeners {
    fn listen(&mut self, engine: &Engine, booking_id: Option<Ulid>) {
        if self.tasks.contains_key(&booking_id) {
            return;
        }
        let rx = match booking_id {
            Some(id) => engine.notify.subscribe(id),
            None => engine.notify.subscribe_all(),
        };
        let task = tokio::spawn(forward(rx, self.tx.clone()));
        self.tasks.insert(booking_id, task);
    }

    fn unlisten(&mut self, booking_id: Option<Ulid>) -> bool {
        match self.tasks.remove(&booking_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

async fn forward(mut rx: broadcast::Receiver<BookingFact>, tx: mpsc::Sender<BookingFact>) {
    loop {
        match rx.recv().await {
            Ok(fact) => {
                if tx.send(fact).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("listener lagged, {n} facts skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (push_tx, mut push_rx) = mpsc::channel(PUSH_BUFFER);
    let mut listeners = Listeners {
        tx: push_tx,
        tasks: HashMap::new(),
    };

    loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // The codec skips to the next newline; the connection stays usable.
                        let e = EngineError::LimitExceeded("request line too long");
                        framed.send(protocol::error_line(&e)).await.map_err(codec_err)?;
                        continue;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(&engine, &mut listeners, &line).await;
                framed.send(reply).await.map_err(codec_err)?;
            }
            Some(fact) = push_rx.recv() => {
                framed.send(protocol::notify_line(&fact)).await.map_err(codec_err)?;
            }
        }
    }
    Ok(())
}

async fn handle_line(engine: &Engine, listeners: &mut Listeners, line: &str) -> String {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => "unparsed", "status" => "error").increment(1);
            return protocol::error_line(&EngineError::Validation(format!("bad request: {e}")));
        }
    };
    let op = req.op();
    let started = Instant::now();

    let result = match req {
        Request::Listen { booking_id } => {
            listeners.listen(engine, booking_id);
            Ok(serde_json::json!({ "listening": booking_id }))
        }
        Request::Unlisten { booking_id } => {
            let removed = listeners.unlisten(booking_id);
            Ok(serde_json::json!({ "unlistened": removed }))
        }
        other => protocol::dispatch(engine, other).await,
    };

    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    match result {
        Ok(data) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
            protocol::ok_line(data)
        }
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => e.code()).increment(1);
            match &e {
                EngineError::System { .. } => error!(op, "{e}"),
                _ => debug!(op, code = e.code(), "{e}"),
            }
            protocol::error_line(&e)
        }
    }
}
