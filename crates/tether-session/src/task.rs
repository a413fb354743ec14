//! Task lifecycle tracking.
//!
//! A task is one logical unit of assistant work. Its state is driven only by
//! inbound envelopes; facade calls may flag intent (cancel requested,
//! approval sent) but never move a task by themselves. Terminal tasks stay
//! in the map so late events can be recognized as anomalies, until
//! [`TaskTracker::prune_terminal`] archives them away.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tether_protocol::envelope::now_ms;
use tether_protocol::{CorrelationId, Kind, StatusUpdate, TaskId, TaskState};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};

/// Reason recorded on tasks failed by a dropped connection.
pub const CONNECTION_LOST: &str = "connection-lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One entry in a task's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Correlation id of the request that caused the task to be created.
    pub origin: CorrelationId,
    pub history: Vec<Transition>,
    pub associated_files: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub cancel_requested: bool,
    pub approval_sent: bool,
}

impl Task {
    fn new(id: TaskId, origin: CorrelationId) -> Self {
        Self {
            id,
            status: TaskStatus::Created,
            origin,
            history: vec![Transition {
                from: None,
                to: TaskStatus::Created,
                at_ms: now_ms(),
                detail: None,
            }],
            associated_files: BTreeSet::new(),
            failure_reason: None,
            cancel_requested: false,
            approval_sent: false,
        }
    }

    fn transition(&mut self, to: TaskStatus, detail: Option<String>) {
        if to == TaskStatus::Failed {
            self.failure_reason = detail.clone();
        }
        // Each approval answers exactly one prompt.
        if matches!(to, TaskStatus::Running | TaskStatus::AwaitingApproval) {
            self.approval_sent = false;
        }
        self.history.push(Transition {
            from: Some(self.status),
            to,
            at_ms: now_ms(),
            detail,
        });
        self.status = to;
    }
}

/// A status event the tracker refused to apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskAnomaly {
    #[error("status {state:?} for unknown task {task_id}")]
    UnknownTask { task_id: TaskId, state: String },

    #[error("status {state:?} for task {task_id} which is already {status}")]
    Terminal {
        task_id: TaskId,
        status: TaskStatus,
        state: String,
    },

    #[error("status {state:?} is not valid for task {task_id} in state {status}")]
    IllegalTransition {
        task_id: TaskId,
        status: TaskStatus,
        state: String,
    },

    #[error("unrecognized state {state:?} for task {task_id}")]
    UnknownState { task_id: TaskId, state: String },

    #[error("{kind} for task {task_id} which is already {status}")]
    LateEvent {
        task_id: TaskId,
        status: TaskStatus,
        kind: String,
    },
}

/// Table of legal moves. `None` means the event is not valid from `current`.
fn next_status(current: TaskStatus, event: TaskState, approval_sent: bool) -> Option<TaskStatus> {
    use TaskStatus::*;
    match (current, event) {
        (Created | Running, TaskState::Running) => Some(Running),
        (AwaitingApproval, TaskState::Running) if approval_sent => Some(Running),
        (Running, TaskState::NeedsApproval) => Some(AwaitingApproval),
        (Running, TaskState::Done) => Some(Completed),
        (Created | Running | AwaitingApproval, TaskState::Error) => Some(Failed),
        (Created | Running | AwaitingApproval, TaskState::Cancelled) => Some(Cancelled),
        _ => None,
    }
}

/// Tracks every task seen on one connection.
#[derive(Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<Mutex<BTreeMap<TaskId, Task>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TaskId, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that the backend accepted work as `task_id`. Returns true if
    /// the task was new.
    pub fn accept(&self, task_id: &str, origin: &str) -> bool {
        let mut tasks = self.lock();
        if tasks.contains_key(task_id) {
            return false;
        }
        debug!(task_id = %task_id, correlation_id = %origin, "task created");
        tasks.insert(
            task_id.to_string(),
            Task::new(task_id.to_string(), origin.to_string()),
        );
        true
    }

    /// Apply a `status` event. `may_create` allows an unknown task to be
    /// created first (its envelope answers a pending chat or command).
    ///
    /// Returns the new status when the task moved, `None` for a repeated
    /// state, or the anomaly that caused the event to be discarded.
    pub fn apply_status(
        &self,
        correlation_id: &str,
        update: &StatusUpdate,
        may_create: bool,
    ) -> Result<Option<TaskStatus>, TaskAnomaly> {
        let mut tasks = self.lock();

        if !tasks.contains_key(&update.task_id) {
            if !may_create {
                return Err(TaskAnomaly::UnknownTask {
                    task_id: update.task_id.clone(),
                    state: update.state.clone(),
                });
            }
            // Only an event the new task could legally take creates it.
            let Some(event) = update.task_state() else {
                return Err(TaskAnomaly::UnknownState {
                    task_id: update.task_id.clone(),
                    state: update.state.clone(),
                });
            };
            if next_status(TaskStatus::Created, event, false).is_none() {
                return Err(TaskAnomaly::IllegalTransition {
                    task_id: update.task_id.clone(),
                    status: TaskStatus::Created,
                    state: update.state.clone(),
                });
            }
            debug!(task_id = %update.task_id, correlation_id = %correlation_id, "task created");
            tasks.insert(
                update.task_id.clone(),
                Task::new(update.task_id.clone(), correlation_id.to_string()),
            );
        }

        let Some(task) = tasks.get_mut(&update.task_id) else {
            return Err(TaskAnomaly::UnknownTask {
                task_id: update.task_id.clone(),
                state: update.state.clone(),
            });
        };

        if task.status.is_terminal() {
            return Err(TaskAnomaly::Terminal {
                task_id: task.id.clone(),
                status: task.status,
                state: update.state.clone(),
            });
        }

        let Some(event) = update.task_state() else {
            return Err(TaskAnomaly::UnknownState {
                task_id: task.id.clone(),
                state: update.state.clone(),
            });
        };

        let Some(next) = next_status(task.status, event, task.approval_sent) else {
            return Err(TaskAnomaly::IllegalTransition {
                task_id: task.id.clone(),
                status: task.status,
                state: update.state.clone(),
            });
        };

        if next == task.status {
            return Ok(None);
        }

        debug!(task_id = %task.id, from = %task.status, to = %next, "task transition");
        task.transition(next, update.detail.clone());
        Ok(Some(next))
    }

    /// Add `path` to the files touched by `task_id`. Returns whether the
    /// path was new; a finished task refuses the event.
    pub fn record_file(&self, task_id: &str, path: &str) -> Result<bool, TaskAnomaly> {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(task_id) else {
            debug!(task_id = %task_id, path = %path, "file event for unknown task");
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Err(TaskAnomaly::LateEvent {
                task_id: task.id.clone(),
                status: task.status,
                kind: Kind::FileEdited.to_string(),
            });
        }
        Ok(task.associated_files.insert(path.to_string()))
    }

    fn mark(&self, task_id: &str, apply: impl FnOnce(&mut Task)) -> SessionResult<()> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| SessionError::UnknownTask(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(SessionError::TaskInactive(task_id.to_string()));
        }
        apply(task);
        Ok(())
    }

    /// Flag a cancel request without changing state; the backend's
    /// acknowledgement performs the transition.
    pub fn mark_cancel_requested(&self, task_id: &str) -> SessionResult<()> {
        self.mark(task_id, |task| task.cancel_requested = true)
    }

    /// Flag that an approval response was sent, enabling
    /// AwaitingApproval → Running on the next `running` status. Only a task
    /// waiting on a prompt can be answered.
    pub fn mark_approval_sent(&self, task_id: &str) -> SessionResult<()> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| SessionError::UnknownTask(task_id.to_string()))?;
        match task.status {
            TaskStatus::AwaitingApproval => {
                task.approval_sent = true;
                Ok(())
            }
            status if status.is_terminal() => Err(SessionError::TaskInactive(task_id.to_string())),
            status => Err(SessionError::NotAwaitingApproval {
                task_id: task_id.to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// Fail every non-terminal task with `reason`. Returns how many moved.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut tasks = self.lock();
        let mut failed = 0;
        for task in tasks.values_mut().filter(|t| !t.status.is_terminal()) {
            task.transition(TaskStatus::Failed, Some(reason.to_string()));
            failed += 1;
        }
        if failed > 0 {
            info!(failed, reason = %reason, "failed outstanding tasks");
        }
        failed
    }

    /// Drop archived terminal tasks, returning their ids.
    pub fn prune_terminal(&self) -> Vec<TaskId> {
        let mut tasks = self.lock();
        let done: Vec<TaskId> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in &done {
            tasks.remove(id);
        }
        done
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.lock().get(task_id).cloned()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.lock().get(task_id).map(|t| t.status)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
