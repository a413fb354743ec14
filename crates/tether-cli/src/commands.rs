use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Serialize;
use serde_json::json;
use tether_protocol::{Codec, EditOperation, Envelope, Kind, Payload, TaskState};
use tether_session::{Attachments, Endpoint, Session, SessionConfig};
use tokio::sync::mpsc;

/// Kinds `watch` streams when none are given.
const INBOUND_KINDS: [Kind; 5] = [
    Kind::ChatResponse,
    Kind::FileEdited,
    Kind::CommandOutput,
    Kind::TaskStatus,
    Kind::Error,
];

const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Where and how to connect, shared by every subcommand.
pub struct Target {
    pub endpoint: Endpoint,
    pub session: SessionConfig,
}

impl Target {
    async fn connect(&self) -> anyhow::Result<Session> {
        Session::connect(&self.endpoint, self.session.clone())
            .await
            .with_context(|| format!("is a backend listening on {}?", self.endpoint))
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_frame(envelope: &Envelope) -> anyhow::Result<()> {
    println!("{}", Codec::client().encode(envelope)?);
    Ok(())
}

/// Send a chat message and print the response. With `follow`, keep printing
/// status frames for the resulting task until it finishes.
pub async fn chat(
    target: &Target,
    message: String,
    files: Vec<String>,
    images: Vec<String>,
    follow: bool,
) -> anyhow::Result<()> {
    let session = target.connect().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if follow {
        session.subscribe(Kind::TaskStatus, move |env| {
            let _ = tx.send(env);
        });
    }

    let reply = session.chat(message, Attachments { files, images });
    let origin = reply.correlation_id().map(str::to_string);
    let resp = reply.await?;
    print_json(&resp)?;

    if follow {
        let task_id = resp.task_id.clone().or_else(|| {
            let origin = origin?;
            session
                .tasks()
                .into_iter()
                .find(|t| t.origin == origin)
                .map(|t| t.id)
        });
        if let Some(task_id) = task_id {
            follow_task(&session, &task_id, &mut rx).await?;
        }
    }

    session.close().await;
    Ok(())
}

async fn follow_task(
    session: &Session,
    task_id: &str,
    rx: &mut mpsc::UnboundedReceiver<Envelope>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            biased;
            env = rx.recv() => {
                let Some(env) = env else { return Ok(()) };
                if env.payload.task_id().map(String::as_str) != Some(task_id) {
                    continue;
                }
                print_frame(&env)?;
                if let Payload::TaskStatus(update) = &env.payload
                    && matches!(
                        update.task_state(),
                        Some(TaskState::Done | TaskState::Error | TaskState::Cancelled)
                    )
                {
                    return Ok(());
                }
            }
            _ = session.closed() => bail!("connection lost while following task {task_id}"),
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

pub async fn edit(
    target: &Target,
    path: String,
    content: Option<String>,
    from: Option<PathBuf>,
    create: bool,
    delete: bool,
) -> anyhow::Result<()> {
    let operation = if delete {
        EditOperation::Delete
    } else if create {
        EditOperation::Create
    } else {
        EditOperation::Modify
    };

    let content = match (content, from) {
        (Some(text), None) => text,
        (None, Some(file)) => std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?,
        (None, None) if delete => String::new(),
        (None, None) => bail!("edit needs --content TEXT or --from FILE"),
        (Some(_), Some(_)) => bail!("--content and --from are mutually exclusive"),
    };

    let session = target.connect().await?;
    let ack = session.edit_file(path, content, operation).await?;
    print_json(&ack)?;
    session.close().await;
    Ok(())
}

/// Run a command on the backend. Exits with the command's exit code when
/// it reports a non-zero one.
pub async fn run(target: &Target, command: String, cwd: Option<String>) -> anyhow::Result<()> {
    let session = target.connect().await?;
    let output = session.run_command(command, cwd).await?;
    print_json(&output)?;
    session.close().await;

    match output.exit_code {
        Some(code) if code != 0 => std::process::exit(code),
        _ => Ok(()),
    }
}

pub async fn cancel(target: &Target, task_id: String) -> anyhow::Result<()> {
    let session = target.connect().await?;
    session.adopt_task(&task_id);
    session.cancel_task(&task_id).await?;

    let status = session.task(&task_id).map(|t| t.status);
    print_json(&json!({ "taskId": task_id, "status": status }))?;
    session.close().await;
    Ok(())
}

/// Print inbound frames as JSON lines until interrupted or disconnected.
pub async fn watch(target: &Target, kinds: Vec<String>) -> anyhow::Result<()> {
    let kinds = if kinds.is_empty() {
        INBOUND_KINDS.to_vec()
    } else {
        kinds
            .iter()
            .map(|name| {
                let kind = Kind::parse(name);
                if !INBOUND_KINDS.contains(&kind) {
                    bail!("cannot watch {name:?}; expected one of chat.response, file.edited, command.output, task.status, error");
                }
                Ok(kind)
            })
            .collect::<anyhow::Result<Vec<_>>>()?
    };
    let everything = kinds.len() == INBOUND_KINDS.len();

    let session = target.connect().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    for kind in kinds {
        let tx = tx.clone();
        session.subscribe(kind, move |env| {
            let _ = tx.send(env);
        });
    }
    if everything {
        session.on_unknown(move |env| {
            let _ = tx.send(env);
        });
    }

    let mut disconnected = false;
    loop {
        tokio::select! {
            biased;
            env = rx.recv() => match env {
                Some(env) => print_frame(&env)?,
                None => break,
            },
            _ = session.closed() => {
                disconnected = true;
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if disconnected {
        // Handlers may still be forwarding frames routed before the drop.
        while let Ok(Some(env)) = tokio::time::timeout(DRAIN_GRACE, rx.recv()).await {
            print_frame(&env)?;
        }
        eprintln!("backend closed the connection");
    }
    session.close().await;
    Ok(())
}
