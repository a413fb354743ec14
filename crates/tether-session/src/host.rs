//! Host-context seam: the capabilities an embedding editor offers the
//! session layer, plus a bridge that forwards task activity into them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tether_protocol::{Kind, Payload, TaskId};
use tracing::warn;

use crate::router::Subscription;
use crate::session::Session;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn delete(&self, key: &str) -> bool;
}

pub trait SecretStore: Send + Sync {
    fn secret(&self, name: &str) -> Option<String>;
    fn store_secret(&self, name: &str, value: String);
}

pub trait MessageEmitter: Send + Sync {
    fn emit(&self, event: HostEvent);
}

/// Everything an editor host provides.
pub trait HostContext: KeyValueStore + SecretStore + MessageEmitter {}

impl<T: KeyValueStore + SecretStore + MessageEmitter> HostContext for T {}

/// Event forwarded to the host's emitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HostEvent {
    #[serde(rename_all = "camelCase")]
    TaskStatus {
        task_id: TaskId,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileEdited {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },
    #[serde(rename_all = "camelCase")]
    CommandOutput {
        command: String,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },
}

impl HostEvent {
    fn from_payload(payload: Payload) -> Option<Self> {
        match payload {
            Payload::TaskStatus(update) => Some(HostEvent::TaskStatus {
                task_id: update.task_id,
                state: update.state,
                detail: update.detail,
            }),
            Payload::FileEdited(ack) => Some(HostEvent::FileEdited {
                path: ack.path,
                task_id: ack.task_id,
            }),
            Payload::CommandOutput(out) => Some(HostEvent::CommandOutput {
                command: out.command,
                output: out.output,
                exit_code: out.exit_code,
                task_id: out.task_id,
            }),
            _ => None,
        }
    }
}

/// Key under which the latest snapshot of a task is stored.
pub fn task_key(task_id: &str) -> String {
    format!("task/{task_id}")
}

/// In-memory host, for tests and headless use.
#[derive(Default)]
pub struct MemoryHost {
    values: Mutex<BTreeMap<String, String>>,
    secrets: Mutex<BTreeMap<String, String>>,
    events: Mutex<Vec<HostEvent>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events emitted so far, oldest first.
    pub fn events(&self) -> Vec<HostEvent> {
        lock(&self.events).clone()
    }
}

impl KeyValueStore for MemoryHost {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        lock(&self.values).insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        lock(&self.values).remove(key).is_some()
    }
}

impl SecretStore for MemoryHost {
    fn secret(&self, name: &str) -> Option<String> {
        lock(&self.secrets).get(name).cloned()
    }

    fn store_secret(&self, name: &str, value: String) {
        lock(&self.secrets).insert(name.to_string(), value);
    }
}

impl MessageEmitter for MemoryHost {
    fn emit(&self, event: HostEvent) {
        lock(&self.events).push(event);
    }
}

/// Forwards task status, file acknowledgements and command output from a
/// session to a host, keeping `task/<id>` snapshots current.
pub struct HostBridge {
    session: Session,
    subscriptions: Vec<Subscription>,
}

impl HostBridge {
    pub fn attach<H>(session: &Session, host: Arc<H>) -> Self
    where
        H: HostContext + 'static,
    {
        let subscriptions = [Kind::TaskStatus, Kind::FileEdited, Kind::CommandOutput]
            .into_iter()
            .map(|kind| {
                let host = host.clone();
                let tasks = session.tracker();
                session.subscribe(kind, move |envelope| {
                    let task_id = envelope.payload.task_id().cloned();
                    let Some(event) = HostEvent::from_payload(envelope.payload) else {
                        return;
                    };
                    if let Some(task) = task_id.and_then(|id| tasks.get(&id)) {
                        match serde_json::to_string(&task) {
                            Ok(snapshot) => host.set(&task_key(&task.id), snapshot),
                            Err(err) => warn!(task_id = %task.id, error = %err, "failed to serialize task snapshot"),
                        }
                    }
                    host.emit(event);
                })
            })
            .collect();

        Self {
            session: session.clone(),
            subscriptions,
        }
    }

    /// Stop forwarding.
    pub fn detach(self) {
        for subscription in &self.subscriptions {
            self.session.unsubscribe(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_host_stores_values_and_secrets() {
        let host = MemoryHost::new();
        host.set("a", "1".to_string());
        assert_eq!(host.get("a").as_deref(), Some("1"));
        assert!(host.delete("a"));
        assert!(!host.delete("a"));

        assert_eq!(host.secret("token"), None);
        host.store_secret("token", "s3cret".to_string());
        assert_eq!(host.secret("token").as_deref(), Some("s3cret"));
    }

    #[test]
    fn events_serialize_camel_case() {
        let event = HostEvent::CommandOutput {
            command: "ls".to_string(),
            output: "a\n".to_string(),
            exit_code: Some(0),
            task_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"event": "commandOutput", "command": "ls", "output": "a\n", "exitCode": 0})
        );
    }
}
