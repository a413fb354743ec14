//! Inbound envelope dispatch.
//!
//! The receive loop hands every decoded envelope to [`DispatchRouter::route`]
//! in arrival order. Routing itself is synchronous and short: task
//! bookkeeping, registry resolution, then a non-blocking push onto each
//! subscriber's queue. Subscriber code runs on its own tokio task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_protocol::{CorrelationId, Envelope, Kind, Payload, TaskId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{CorrelationRegistry, Offer};
use crate::task::{TaskAnomaly, TaskStatus, TaskTracker};

/// Token returned by [`DispatchRouter::on`]; pass it to
/// [`DispatchRouter::off`] to stop delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: Option<Kind>,
}

impl Subscription {
    /// The subscribed kind, or `None` for the fallback handler.
    pub fn kind(&self) -> Option<&Kind> {
        self.kind.as_ref()
    }
}

struct HandlerSlot {
    id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// A facade request that steers a task and waits for the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Cancel,
    Approval,
}

impl Control {
    /// Whether a task now in `status` has answered this request.
    fn settled_by(self, status: TaskStatus) -> bool {
        match self {
            Control::Cancel => status.is_terminal(),
            Control::Approval => status.is_terminal() || status == TaskStatus::Running,
        }
    }
}

#[derive(Default)]
struct RouterState {
    handlers: HashMap<Kind, Vec<HandlerSlot>>,
    fallback: Option<HandlerSlot>,
    controls: HashMap<TaskId, Vec<(CorrelationId, Control)>>,
}

/// What happened to one routed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    /// Registry outcome; `None` for unknown kinds, which never touch it.
    pub offer: Option<Offer>,
    /// Number of durable (or fallback) handlers the envelope was queued to.
    pub handlers: usize,
    /// Set when the task tracker discarded the envelope.
    pub anomaly: Option<TaskAnomaly>,
}

#[derive(Clone)]
pub struct DispatchRouter {
    registry: CorrelationRegistry,
    tracker: TaskTracker,
    state: Arc<Mutex<RouterState>>,
    next_id: Arc<AtomicU64>,
}

impl DispatchRouter {
    pub fn new(registry: CorrelationRegistry, tracker: TaskTracker) -> Self {
        Self {
            registry,
            tracker,
            state: Arc::new(Mutex::new(RouterState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_handler<F>(&self, mut handler: F) -> HandlerSlot
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                handler(envelope);
            }
        });
        HandlerSlot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Register a durable handler for `kind`. It runs for every matching
    /// envelope, in arrival order, on a task of its own.
    pub fn on<F>(&self, kind: Kind, handler: F) -> Subscription
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let slot = self.spawn_handler(handler);
        let id = slot.id;
        self.lock().handlers.entry(kind.clone()).or_default().push(slot);
        debug!(kind = %kind, subscription = id, "handler registered");
        Subscription {
            id,
            kind: Some(kind),
        }
    }

    /// Set the handler for kinds this build does not recognize, replacing
    /// any previous one.
    pub fn on_unknown<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let slot = self.spawn_handler(handler);
        let id = slot.id;
        self.lock().fallback = Some(slot);
        Subscription { id, kind: None }
    }

    /// Remove a handler. Envelopes already queued to it are still delivered.
    pub fn off(&self, subscription: &Subscription) -> bool {
        let mut state = self.lock();
        match &subscription.kind {
            Some(kind) => {
                let Some(slots) = state.handlers.get_mut(kind) else {
                    return false;
                };
                let before = slots.len();
                slots.retain(|slot| slot.id != subscription.id);
                let removed = slots.len() != before;
                if slots.is_empty() {
                    state.handlers.remove(kind);
                }
                removed
            }
            None => match &state.fallback {
                Some(slot) if slot.id == subscription.id => {
                    state.fallback = None;
                    true
                }
                _ => false,
            },
        }
    }

    /// Settle the pending `correlation_id` when `task_id` reaches the state
    /// `control` asks for, even if the backend reports it under another id.
    pub(crate) fn watch_control(&self, task_id: &str, correlation_id: &str, control: Control) {
        let mut state = self.lock();
        let watched = state.controls.entry(task_id.to_string()).or_default();
        watched.retain(|(id, _)| self.registry.is_pending(id));
        watched.push((correlation_id.to_string(), control));
    }

    fn settle_controls(&self, task_id: &str, status: TaskStatus, envelope: &Envelope) {
        let settled: Vec<CorrelationId> = {
            let mut state = self.lock();
            let Some(watched) = state.controls.get_mut(task_id) else {
                return;
            };
            let mut settled = Vec::new();
            watched.retain(|(id, control)| {
                if control.settled_by(status) {
                    settled.push(id.clone());
                    false
                } else {
                    true
                }
            });
            if watched.is_empty() {
                state.controls.remove(task_id);
            }
            settled
        };
        // The envelope's own id is left to the registry offer.
        for id in settled.iter().filter(|id| **id != envelope.id) {
            if self.registry.resolve(id, envelope.payload.clone()) {
                debug!(correlation_id = %id, task_id = %task_id, %status, "control request settled by task state");
            }
        }
    }

    pub fn handler_count(&self, kind: &Kind) -> usize {
        self.lock().handlers.get(kind).map_or(0, Vec::len)
    }

    /// Dispatch one inbound envelope.
    pub fn route(&self, envelope: Envelope) -> Routed {
        let kind = envelope.kind();

        if kind.is_unknown() {
            let delivered = self.deliver_fallback(envelope);
            return Routed {
                offer: None,
                handlers: usize::from(delivered),
                anomaly: None,
            };
        }

        // Tasks first, so a caller woken below already sees its task.
        let anomaly = self.update_tasks(&envelope);
        let offer = self.registry.offer(&envelope);
        let handlers = if anomaly.is_some() {
            0
        } else {
            self.deliver(&kind, &envelope)
        };

        Routed {
            offer: Some(offer),
            handlers,
            anomaly,
        }
    }

    fn update_tasks(&self, envelope: &Envelope) -> Option<TaskAnomaly> {
        match &envelope.payload {
            Payload::TaskStatus(update) => {
                let may_create = matches!(
                    self.registry.pending_kind(&envelope.id),
                    Some(Kind::ChatResponse | Kind::CommandOutput)
                );
                match self.tracker.apply_status(&envelope.id, update, may_create) {
                    Ok(Some(status)) => {
                        self.settle_controls(&update.task_id, status, envelope);
                        None
                    }
                    Ok(None) => None,
                    Err(anomaly) => {
                        warn!(
                            correlation_id = %envelope.id,
                            task_id = %update.task_id,
                            %anomaly,
                            "protocol anomaly, status discarded"
                        );
                        Some(anomaly)
                    }
                }
            }
            Payload::ChatResponse(resp) => {
                if let Some(task_id) = &resp.task_id
                    && self.registry.pending_kind(&envelope.id) == Some(Kind::ChatResponse)
                {
                    self.tracker.accept(task_id, &envelope.id);
                }
                None
            }
            Payload::FileEdited(ack) => {
                let task_id = ack.task_id.as_ref()?;
                match self.tracker.record_file(task_id, &ack.path) {
                    Ok(_) => None,
                    Err(anomaly) => {
                        warn!(
                            correlation_id = %envelope.id,
                            task_id = %task_id,
                            %anomaly,
                            "protocol anomaly, file event discarded"
                        );
                        Some(anomaly)
                    }
                }
            }
            _ => None,
        }
    }

    fn deliver(&self, kind: &Kind, envelope: &Envelope) -> usize {
        let mut state = self.lock();
        let Some(slots) = state.handlers.get_mut(kind) else {
            return 0;
        };
        // A closed queue means the handler task ended; prune it.
        slots.retain(|slot| slot.tx.send(envelope.clone()).is_ok());
        let delivered = slots.len();
        if slots.is_empty() {
            state.handlers.remove(kind);
        }
        delivered
    }

    fn deliver_fallback(&self, envelope: Envelope) -> bool {
        let state = self.lock();
        match &state.fallback {
            Some(slot) => {
                let kind = envelope.kind();
                if slot.tx.send(envelope).is_err() {
                    warn!(kind = %kind, "fallback handler is gone");
                    return false;
                }
                true
            }
            None => {
                debug!(
                    correlation_id = %envelope.id,
                    kind = %envelope.kind(),
                    "unknown kind with no fallback handler, dropped"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use std::time::Duration;
    use tether_protocol::{ChatResponse, FileEdited, StatusUpdate};

    fn router() -> (DispatchRouter, CorrelationRegistry, TaskTracker) {
        let registry = CorrelationRegistry::new();
        let tracker = TaskTracker::new();
        (
            DispatchRouter::new(registry.clone(), tracker.clone()),
            registry,
            tracker,
        )
    }

    fn status(id: &str, task_id: &str, state: &str) -> Envelope {
        Envelope::new(
            id,
            Payload::TaskStatus(StatusUpdate {
                task_id: task_id.to_string(),
                state: state.to_string(),
                detail: None,
            }),
        )
    }

    #[tokio::test]
    async fn status_reaches_handlers_and_tracker() {
        let (router, registry, tracker) = router();
        let _reply = registry
            .register("1".to_string(), Kind::ChatResponse, None)
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.on(Kind::TaskStatus, move |env| {
            let _ = tx.send(env);
        });

        let routed = router.route(status("1", "t1", "running"));
        assert_eq!(routed.offer, Some(Offer::StillPending));
        assert_eq!(routed.handlers, 1);
        assert_eq!(tracker.status("t1"), Some(TaskStatus::Running));

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.id, "1");
    }

    #[tokio::test]
    async fn unknown_kind_goes_to_fallback_only() {
        let (router, registry, _tracker) = router();
        let _reply = registry
            .register("x".to_string(), Kind::ChatResponse, None)
            .unwrap();

        let dropped = router.route(Envelope::new(
            "x",
            Payload::Unknown {
                wire_type: "unknown-future-kind".to_string(),
                body: serde_json::Value::Null,
            },
        ));
        assert_eq!(dropped.handlers, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.on_unknown(move |env| {
            let _ = tx.send(env.kind());
        });
        let routed = router.route(Envelope::new(
            "x",
            Payload::Unknown {
                wire_type: "unknown-future-kind".to_string(),
                body: serde_json::json!({}),
            },
        ));
        assert_eq!(routed.offer, None);
        assert_eq!(routed.handlers, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            Kind::Unknown("unknown-future-kind".to_string())
        );
        assert!(registry.is_pending("x"));
    }

    #[tokio::test]
    async fn anomalies_skip_handlers() {
        let (router, _registry, tracker) = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.on(Kind::TaskStatus, move |env| {
            let _ = tx.send(env);
        });

        let routed = router.route(status("broadcast", "ghost", "running"));
        assert!(matches!(routed.anomaly, Some(TaskAnomaly::UnknownTask { .. })));
        assert_eq!(routed.handlers, 0);
        assert!(tracker.is_empty());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn chat_response_with_task_id_creates_task() {
        let (router, registry, tracker) = router();
        let reply = registry
            .register("1".to_string(), Kind::ChatResponse, None)
            .unwrap();

        let routed = router.route(Envelope::new(
            "1",
            Payload::ChatResponse(ChatResponse {
                content: "on it".to_string(),
                task_id: Some("t9".to_string()),
            }),
        ));
        assert_eq!(routed.offer, Some(Offer::Resolved));
        assert!(reply.await.is_ok());
        let task = tracker.get("t9").unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.origin, "1");
    }

    #[tokio::test]
    async fn file_ack_records_associated_path() {
        let (router, _registry, tracker) = router();
        tracker.accept("t1", "1");
        router.route(Envelope::new(
            "e-1",
            Payload::FileEdited(FileEdited {
                path: "src/lib.rs".to_string(),
                content: "fn main() {}".to_string(),
                task_id: Some("t1".to_string()),
            }),
        ));
        assert!(tracker.get("t1").unwrap().associated_files.contains("src/lib.rs"));
    }

    #[tokio::test]
    async fn file_ack_for_finished_task_is_discarded() {
        let (router, registry, tracker) = router();
        tracker.accept("t1", "1");
        router.route(status("1", "t1", "running"));
        router.route(status("1", "t1", "done"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.on(Kind::FileEdited, move |env| {
            let _ = tx.send(env);
        });
        let reply = registry
            .register("e-2".to_string(), Kind::FileEdited, None)
            .unwrap();
        let routed = router.route(Envelope::new(
            "e-2",
            Payload::FileEdited(FileEdited {
                path: "late.rs".to_string(),
                content: String::new(),
                task_id: Some("t1".to_string()),
            }),
        ));

        assert!(matches!(routed.anomaly, Some(TaskAnomaly::LateEvent { .. })));
        assert_eq!(routed.handlers, 0);
        // The caller waiting on the edit still gets its answer.
        assert_eq!(routed.offer, Some(Offer::Resolved));
        assert!(reply.await.is_ok());
        assert!(tracker.get("t1").unwrap().associated_files.is_empty());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cancel_settles_when_task_ends_under_another_id() {
        let (router, registry, tracker) = router();
        tracker.accept("t1", "origin");
        router.route(status("origin", "t1", "running"));

        let reply = registry
            .register("c-1".to_string(), Kind::TaskStatus, None)
            .unwrap();
        router.watch_control("t1", "c-1", Control::Cancel);

        // A running status does not answer a cancel.
        router.route(status("origin", "t1", "running"));
        assert!(registry.is_pending("c-1"));

        router.route(status("origin", "t1", "cancelled"));
        assert!(!registry.is_pending("c-1"));
        assert!(matches!(reply.await, Ok(Payload::TaskStatus(_))));
        assert_eq!(tracker.status("t1"), Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn approval_settles_when_task_resumes() {
        let (router, registry, tracker) = router();
        tracker.accept("t1", "origin");
        router.route(status("origin", "t1", "running"));
        router.route(status("origin", "t1", "needs-approval"));

        tracker.mark_approval_sent("t1").unwrap();
        let reply = registry
            .register("a-1".to_string(), Kind::TaskStatus, None)
            .unwrap();
        router.watch_control("t1", "a-1", Control::Approval);

        router.route(status("broadcast", "t1", "running"));
        assert!(reply.await.is_ok());
        assert_eq!(tracker.status("t1"), Some(TaskStatus::Running));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_handler_does_not_block_others() {
        let (router, registry, tracker) = router();
        let _reply = registry
            .register("1".to_string(), Kind::ChatResponse, None)
            .unwrap();

        router.on(Kind::TaskStatus, |_env| {
            std::thread::sleep(Duration::from_millis(300));
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.on(Kind::TaskStatus, move |env| {
            let _ = tx.send(env);
        });

        router.route(status("1", "t1", "running"));
        router.route(status("1", "t1", "needs-approval"));
        assert_eq!(tracker.status("t1"), Some(TaskStatus::AwaitingApproval));

        let first = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("fast handler starved")
            .unwrap();
        assert_eq!(first.payload.task_id().map(String::as_str), Some("t1"));
    }

    #[tokio::test]
    async fn off_stops_delivery() {
        let (router, registry, _tracker) = router();
        let _reply = registry
            .register("1".to_string(), Kind::ChatResponse, None)
            .unwrap();
        let sub = router.on(Kind::TaskStatus, |_env| {});
        assert_eq!(router.handler_count(&Kind::TaskStatus), 1);
        assert!(router.off(&sub));
        assert!(!router.off(&sub));
        assert_eq!(router.handler_count(&Kind::TaskStatus), 0);
        assert_eq!(router.route(status("1", "t1", "running")).handlers, 0);
    }
}
