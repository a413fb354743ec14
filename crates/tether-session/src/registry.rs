//! Pending request bookkeeping.
//!
//! Every outstanding request owns exactly one entry, keyed by correlation id.
//! An entry is removed by whichever of resolve, reject, timeout or close
//! gets to it first, so a caller is completed at most once.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tether_protocol::{CorrelationId, Envelope, Kind, Payload};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};

/// How many expired ids are remembered for late-response diagnostics.
const EXPIRED_HISTORY: usize = 1024;

/// Outcome of offering an inbound envelope to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The envelope completed its exchange successfully.
    Resolved,
    /// The envelope was an `error` and rejected its exchange.
    Rejected,
    /// The exchange exists but this kind does not complete it.
    StillPending,
    /// The exchange already timed out; the envelope was dropped.
    Late,
    /// No exchange with this id.
    Unmatched,
}

struct PendingExchange {
    expected: Kind,
    created_at: Instant,
    tx: oneshot::Sender<SessionResult<Payload>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingExchange {
    fn complete(self, result: SessionResult<Payload>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have dropped its handle; nothing left to notify.
        let _ = self.tx.send(result);
    }
}

#[derive(Default)]
struct RegistryState {
    pending: HashMap<CorrelationId, PendingExchange>,
    expired: VecDeque<CorrelationId>,
    closed: Option<SessionError>,
}

/// Maps correlation ids to the callers awaiting them.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    state: Arc<Mutex<RegistryState>>,
}

/// Handle returned by [`CorrelationRegistry::register`]; resolves with the
/// reply payload or the error that ended the exchange.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<SessionResult<Payload>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = SessionResult<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without completing: the registry went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(SessionError::TransportClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a pending exchange for `id`, completed by a reply of kind
    /// `expected`, an `error` envelope, the optional `timeout`, or close.
    ///
    /// Must be called from within a tokio runtime when `timeout` is set.
    pub fn register(
        &self,
        id: CorrelationId,
        expected: Kind,
        timeout: Option<Duration>,
    ) -> SessionResult<PendingReply> {
        let mut state = self.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        if state.pending.contains_key(&id) {
            return Err(SessionError::DuplicateCorrelation(id));
        }

        let (tx, rx) = oneshot::channel();
        let timer = timeout.map(|after| {
            let registry = self.clone();
            let timer_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                registry.expire(&timer_id, after);
            })
        });

        debug!(correlation_id = %id, expected = %expected, "registered exchange");
        state.pending.insert(
            id.clone(),
            PendingExchange {
                expected,
                created_at: Instant::now(),
                tx,
                timer,
            },
        );
        Ok(PendingReply { id, rx })
    }

    fn expire(&self, id: &str, after: Duration) {
        let mut state = self.lock();
        let Some(exchange) = state.pending.remove(id) else {
            return;
        };
        if state.expired.len() >= EXPIRED_HISTORY {
            state.expired.pop_front();
        }
        state.expired.push_back(id.to_string());
        drop(state);

        warn!(
            correlation_id = %id,
            expected = %exchange.expected,
            elapsed_ms = exchange.created_at.elapsed().as_millis() as u64,
            "exchange timed out"
        );
        let err = SessionError::Timeout {
            correlation_id: id.to_string(),
            expected: exchange.expected.to_string(),
            timeout_ms: after.as_millis() as u64,
        };
        // The timer already fired; don't abort ourselves.
        let _ = exchange.tx.send(Err(err));
    }

    /// Route an inbound envelope to its exchange, if any.
    pub fn offer(&self, envelope: &Envelope) -> Offer {
        let kind = envelope.kind();
        let mut state = self.lock();

        let Some(exchange) = state.pending.get(&envelope.id) else {
            let late = state.expired.contains(&envelope.id);
            drop(state);
            if late {
                warn!(correlation_id = %envelope.id, kind = %kind, "dropping late response for expired exchange");
                return Offer::Late;
            }
            debug!(correlation_id = %envelope.id, kind = %kind, "no pending exchange");
            return Offer::Unmatched;
        };

        if exchange.expected == kind {
            if let Some(exchange) = state.pending.remove(&envelope.id) {
                drop(state);
                exchange.complete(Ok(envelope.payload.clone()));
            }
            return Offer::Resolved;
        }

        if let Payload::Error(err) = &envelope.payload {
            if let Some(exchange) = state.pending.remove(&envelope.id) {
                drop(state);
                exchange.complete(Err(SessionError::Backend {
                    message: err.message.clone(),
                    code: err.code.clone(),
                }));
            }
            return Offer::Rejected;
        }

        Offer::StillPending
    }

    /// Complete `id` successfully. Returns false (and logs) if nothing was pending.
    pub fn resolve(&self, id: &str, payload: Payload) -> bool {
        let exchange = self.lock().pending.remove(id);
        match exchange {
            Some(exchange) => {
                exchange.complete(Ok(payload));
                true
            }
            None => {
                debug!(correlation_id = %id, "resolve for unknown exchange ignored");
                false
            }
        }
    }

    /// Complete `id` with `error`. Returns false (and logs) if nothing was pending.
    pub fn reject(&self, id: &str, error: SessionError) -> bool {
        let exchange = self.lock().pending.remove(id);
        match exchange {
            Some(exchange) => {
                exchange.complete(Err(error));
                true
            }
            None => {
                debug!(correlation_id = %id, "reject for unknown exchange ignored");
                false
            }
        }
    }

    /// Drop `id` without completing it; the caller reports its own error.
    pub(crate) fn forget(&self, id: &str) {
        if let Some(exchange) = self.lock().pending.remove(id)
            && let Some(timer) = exchange.timer
        {
            timer.abort();
        }
    }

    /// Reject every pending exchange with `error` and refuse new ones.
    pub fn close(&self, error: SessionError) -> usize {
        let drained: Vec<PendingExchange> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(error.clone());
            }
            state.pending.drain().map(|(_, exchange)| exchange).collect()
        };
        let count = drained.len();
        for exchange in drained {
            exchange.complete(Err(error.clone()));
        }
        count
    }

    /// Expected reply kind of a pending exchange.
    pub fn pending_kind(&self, id: &str) -> Option<Kind> {
        self.lock().pending.get(id).map(|ex| ex.expected.clone())
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
