//! The consumer-facing facade.
//!
//! Every request method registers its exchange and queues its frame before
//! returning, so call order is send order. The returned [`Reply`] is
//! `'static` and can be awaited anywhere, in any order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tether_protocol::{
    ApprovalResponse, CancelRequest, ChatRequest, ChatResponse, Codec, CommandOutput, CommandRun,
    EditOperation, Envelope, FileEdit, FileEdited, Kind, Payload, TaskId,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::registry::{CorrelationRegistry, PendingReply};
use crate::router::{Control, DispatchRouter, Subscription};
use crate::task::{Task, TaskTracker};
use crate::transport::{self, Endpoint, ReadSide};

/// Origin recorded for tasks started elsewhere.
pub const ADOPTED: &str = "adopted";

/// Files and images sent along with a chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachments {
    pub files: Vec<String>,
    pub images: Vec<String>,
}

fn non_empty(items: Vec<String>) -> Option<Vec<String>> {
    (!items.is_empty()).then_some(items)
}

enum ReplyState {
    Waiting(PendingReply),
    Failed(Option<SessionError>),
}

/// Future for one request's reply.
pub struct Reply<T> {
    state: ReplyState,
    extract: fn(Payload) -> Option<T>,
}

impl<T> Reply<T> {
    fn waiting(pending: PendingReply, extract: fn(Payload) -> Option<T>) -> Self {
        Self {
            state: ReplyState::Waiting(pending),
            extract,
        }
    }

    fn failed(err: SessionError) -> Self {
        Self {
            state: ReplyState::Failed(Some(err)),
            extract: |_| None,
        }
    }

    /// Correlation id of the request, unless it was never sent.
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.state {
            ReplyState::Waiting(pending) => Some(pending.correlation_id()),
            ReplyState::Failed(_) => None,
        }
    }
}

impl<T> Future for Reply<T> {
    type Output = SessionResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ReplyState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(SessionError::TransportClosed)))
            }
            ReplyState::Waiting(pending) => match Pin::new(&mut *pending).poll(cx) {
                Poll::Ready(Ok(payload)) => {
                    let kind = payload.kind();
                    Poll::Ready((this.extract)(payload).ok_or_else(|| {
                        SessionError::UnexpectedPayload {
                            correlation_id: pending.correlation_id().to_string(),
                            kind: kind.to_string(),
                        }
                    }))
                }
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

struct Inner {
    config: SessionConfig,
    codec: Codec,
    registry: CorrelationRegistry,
    tracker: TaskTracker,
    router: DispatchRouter,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

/// One live connection to a backend. Cheap to clone; all clones share the
/// connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Connect to a backend endpoint.
    pub async fn connect(endpoint: &Endpoint, config: SessionConfig) -> SessionResult<Self> {
        let session = match endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|err| {
                    SessionError::Io(format!("failed to connect to {endpoint}: {err}"))
                })?;
                Self::from_io(stream, config)
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|err| {
                    SessionError::Io(format!("failed to connect to {endpoint}: {err}"))
                })?;
                stream.set_nodelay(true).ok();
                Self::from_io(stream, config)
            }
        };
        info!(endpoint = %endpoint, "connected to backend");
        Ok(session)
    }

    /// Run a session over an already-connected stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_io<T>(io: T, config: SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let registry = CorrelationRegistry::new();
        let tracker = TaskTracker::new();
        let router = DispatchRouter::new(registry.clone(), tracker.clone());
        let codec = Codec::client();
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        transport::spawn(
            io,
            config.max_line_bytes,
            outbound_rx,
            ReadSide {
                codec: codec.clone(),
                router: router.clone(),
                registry: registry.clone(),
                tracker: tracker.clone(),
                shutdown: shutdown.clone(),
                finished: finished.clone(),
            },
        );

        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                registry,
                tracker,
                router,
                outbound,
                shutdown,
                finished,
            }),
        }
    }

    fn request<T>(
        &self,
        payload: Payload,
        expected: Kind,
        extract: fn(Payload) -> Option<T>,
    ) -> Reply<T> {
        self.send_request(payload, expected, extract, None)
    }

    /// Send a request. A `control` request is also settled by the task
    /// reaching the state it asked for, whatever envelope id reports it.
    fn send_request<T>(
        &self,
        payload: Payload,
        expected: Kind,
        extract: fn(Payload) -> Option<T>,
        control: Option<(&str, Control)>,
    ) -> Reply<T> {
        if self.is_closed() {
            return Reply::failed(SessionError::TransportClosed);
        }

        let id = Uuid::new_v4().to_string();
        let envelope = Envelope::new(id.clone(), payload);
        let frame = match self.inner.codec.encode(&envelope) {
            Ok(frame) => frame,
            Err(err) => return Reply::failed(err.into()),
        };

        let timeout = self.inner.config.timeout_for(&expected);
        let pending = match self.inner.registry.register(id.clone(), expected, timeout) {
            Ok(pending) => pending,
            Err(err) => return Reply::failed(err),
        };
        if let Some((task_id, control)) = control {
            self.inner.router.watch_control(task_id, &id, control);
        }

        if self.inner.outbound.send(frame).is_err() {
            self.inner.registry.forget(&id);
            return Reply::failed(SessionError::TransportClosed);
        }
        debug!(correlation_id = %id, kind = %envelope.kind(), "request sent");
        Reply::waiting(pending, extract)
    }

    /// Send a chat message. Resolves with the assistant's response.
    pub fn chat(&self, message: impl Into<String>, attachments: Attachments) -> Reply<ChatResponse> {
        let payload = Payload::ChatRequest(ChatRequest {
            message: message.into(),
            files: non_empty(attachments.files),
            images: non_empty(attachments.images),
        });
        self.request(payload, Kind::ChatResponse, |p| match p {
            Payload::ChatResponse(resp) => Some(resp),
            _ => None,
        })
    }

    /// Ask the backend to create, modify or delete a file.
    pub fn edit_file(
        &self,
        path: impl Into<String>,
        content: impl Into<String>,
        operation: EditOperation,
    ) -> Reply<FileEdited> {
        let payload = Payload::FileEdit(FileEdit {
            path: path.into(),
            content: content.into(),
            operation,
        });
        self.request(payload, Kind::FileEdited, |p| match p {
            Payload::FileEdited(ack) => Some(ack),
            _ => None,
        })
    }

    /// Run a shell command. Resolves with the first output frame; later
    /// frames for the same command reach `command.output` subscribers.
    pub fn run_command(&self, command: impl Into<String>, cwd: Option<String>) -> Reply<CommandOutput> {
        let payload = Payload::CommandRun(CommandRun {
            command: command.into(),
            cwd,
        });
        self.request(payload, Kind::CommandOutput, |p| match p {
            Payload::CommandOutput(out) => Some(out),
            _ => None,
        })
    }

    /// Request cancellation of a live task. Resolves once the backend
    /// acknowledges: a status update carrying this request's id, or the task
    /// reaching a terminal state. The task's state comes from that update.
    pub fn cancel_task(&self, task_id: &str) -> Reply<()> {
        if let Err(err) = self.inner.tracker.mark_cancel_requested(task_id) {
            return Reply::failed(err);
        }
        let payload = Payload::TaskCancel(CancelRequest {
            task_id: task_id.to_string(),
        });
        self.send_request(payload, Kind::TaskStatus, ack, Some((task_id, Control::Cancel)))
    }

    /// Answer a task that is waiting for approval. Resolves like
    /// [`Session::cancel_task`], or when the task resumes running.
    pub fn respond_approval(
        &self,
        task_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Reply<()> {
        if let Err(err) = self.inner.tracker.mark_approval_sent(task_id) {
            return Reply::failed(err);
        }
        let payload = Payload::TaskApproval(ApprovalResponse {
            task_id: task_id.to_string(),
            approved,
            feedback,
        });
        self.send_request(payload, Kind::TaskStatus, ack, Some((task_id, Control::Approval)))
    }

    /// Run `handler` for every inbound envelope of `kind`.
    pub fn subscribe<F>(&self, kind: Kind, handler: F) -> Subscription
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        self.inner.router.on(kind, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.router.off(subscription)
    }

    /// Handle envelopes whose type this build does not know.
    pub fn on_unknown<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        self.inner.router.on_unknown(handler)
    }

    /// Start tracking a task created on another connection so it can be
    /// cancelled or approved from this one. Returns false if already known.
    pub fn adopt_task(&self, task_id: &str) -> bool {
        self.inner.tracker.accept(task_id, ADOPTED)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.inner.tracker.get(task_id)
    }

    pub(crate) fn tracker(&self) -> TaskTracker {
        self.inner.tracker.clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.tracker.tasks()
    }

    /// Forget finished tasks. Returns their ids.
    pub fn prune_terminal(&self) -> Vec<TaskId> {
        self.inner.tracker.prune_terminal()
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close the connection and wait until every pending request has been
    /// rejected and every live task failed.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.finished.cancelled().await;
    }

    /// Wait until the connection ends, for whatever reason.
    pub async fn closed(&self) {
        self.inner.finished.cancelled().await;
    }
}

fn ack(payload: Payload) -> Option<()> {
    matches!(payload, Payload::TaskStatus(_)).then_some(())
}
