use anyhow::{Context, Result, bail};
use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tether_protocol::{
    ChatResponse, Codec, CommandOutput, EditOperation, Envelope, ErrorPayload, FileEdited,
    Payload, StatusUpdate,
};

type Reader = BufReader<UnixStream>;
type Writer = BufWriter<UnixStream>;

fn read_envelope(reader: &mut Reader) -> Result<Envelope> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        bail!("client disconnected before request");
    }
    Ok(Codec::backend().decode(line.trim_end())?)
}

fn send_envelope(writer: &mut Writer, id: &str, payload: Payload) -> Result<()> {
    let frame = Codec::backend().encode(&Envelope::new(id, payload))?;
    writeln!(writer, "{frame}")?;
    writer.flush()?;
    Ok(())
}

fn wait_for_disconnect(reader: &mut Reader) -> Result<()> {
    let mut line = String::new();
    while reader.read_line(&mut line)? > 0 {
        line.clear();
    }
    Ok(())
}

/// Bind `socket_path` now and serve exactly one client on a thread.
fn spawn_backend<F>(socket_path: &Path, handler: F) -> Result<thread::JoinHandle<Result<()>>>
where
    F: FnOnce(&mut Reader, &mut Writer) -> Result<()> + Send + 'static,
{
    let listener = UnixListener::bind(socket_path).context("failed to bind mock socket")?;
    Ok(thread::spawn(move || {
        let (stream, _) = listener.accept().context("failed to accept client")?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("failed to set read timeout")?;

        let read_half = stream.try_clone().context("failed to clone stream")?;
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(stream);
        handler(&mut reader, &mut writer)
    }))
}

/// A `tether` command isolated from the user's config and environment.
fn cli_bin(home: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("tether");
    cmd.env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_RUNTIME_DIR", home.join("run"))
        .env_remove("TETHER_ENDPOINT")
        .timeout(Duration::from_secs(10));
    cmd
}

fn socket_for(temp: &Path) -> PathBuf {
    temp.join("tether.sock")
}

fn endpoint_arg(socket: &Path) -> String {
    format!("unix:{}", socket.display())
}

fn stdout_json(output: &std::process::Output) -> Result<serde_json::Value> {
    assert!(
        output.status.success(),
        "cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).with_context(|| format!("not json: {stdout}"))
}

#[test]
fn chat_prints_response() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let server = spawn_backend(&socket, |reader, writer| {
        let req = read_envelope(reader)?;
        match &req.payload {
            Payload::ChatRequest(chat) => {
                if chat.message != "explain this" {
                    bail!("unexpected message: {}", chat.message);
                }
                if chat.files.as_deref() != Some(&["src/main.rs".to_string()][..]) {
                    bail!("unexpected files: {:?}", chat.files);
                }
            }
            other => bail!("expected chat request, got {other:?}"),
        }
        send_envelope(
            writer,
            &req.id,
            Payload::ChatResponse(ChatResponse {
                content: "it prints hello".to_string(),
                task_id: Some("t1".to_string()),
            }),
        )
    })?;

    let output = cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket))
        .args(["chat", "explain this", "--file", "src/main.rs"])
        .output()
        .context("failed to run tether chat")?;

    let value = stdout_json(&output)?;
    assert_eq!(value["content"], "it prints hello");
    assert_eq!(value["taskId"], "t1");

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn chat_follow_prints_status_until_done() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let server = spawn_backend(&socket, |reader, writer| {
        let req = read_envelope(reader)?;
        send_envelope(
            writer,
            &req.id,
            Payload::TaskStatus(StatusUpdate {
                task_id: "t1".to_string(),
                state: "running".to_string(),
                detail: None,
            }),
        )?;
        send_envelope(
            writer,
            &req.id,
            Payload::ChatResponse(ChatResponse {
                content: "working on it".to_string(),
                task_id: Some("t1".to_string()),
            }),
        )?;
        send_envelope(
            writer,
            &req.id,
            Payload::TaskStatus(StatusUpdate {
                task_id: "t1".to_string(),
                state: "done".to_string(),
                detail: Some("all tests pass".to_string()),
            }),
        )?;
        wait_for_disconnect(reader)
    })?;

    let output = cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket))
        .args(["chat", "fix the tests", "--follow"])
        .output()
        .context("failed to run tether chat --follow")?;

    assert!(
        output.status.success(),
        "cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 3, "{stdout}");
    assert_eq!(lines[0]["content"], "working on it");
    assert_eq!(lines[1]["type"], "status");
    assert_eq!(lines[1]["payload"]["state"], "running");
    assert_eq!(lines[2]["payload"]["state"], "done");

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn endpoint_from_environment() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let server = spawn_backend(&socket, |reader, writer| {
        let req = read_envelope(reader)?;
        let Payload::CommandRun(run) = &req.payload else {
            bail!("expected command, got {:?}", req.payload);
        };
        if run.command != "cargo test" || run.cwd.as_deref() != Some("/work") {
            bail!("unexpected command: {run:?}");
        }
        send_envelope(
            writer,
            &req.id,
            Payload::CommandOutput(CommandOutput {
                command: run.command.clone(),
                output: "ok\n".to_string(),
                exit_code: Some(0),
                task_id: None,
            }),
        )
    })?;

    let output = cli_bin(temp.path())
        .env("TETHER_ENDPOINT", endpoint_arg(&socket))
        .args(["run", "cargo test", "--cwd", "/work"])
        .output()
        .context("failed to run tether run")?;

    let value = stdout_json(&output)?;
    assert_eq!(value["output"], "ok\n");
    assert_eq!(value["exitCode"], 0);

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn run_exits_with_remote_exit_code() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let server = spawn_backend(&socket, |reader, writer| {
        let req = read_envelope(reader)?;
        send_envelope(
            writer,
            &req.id,
            Payload::CommandOutput(CommandOutput {
                command: "false".to_string(),
                output: String::new(),
                exit_code: Some(3),
                task_id: None,
            }),
        )
    })?;

    cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket))
        .args(["run", "false"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("\"exitCode\":3"));

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn endpoint_from_config_file() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let config_dir = temp.path().join("config").join("tether");
    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(
        config_dir.join("config.toml"),
        format!(
            "endpoint = \"{}\"\n\n[session]\nedit_timeout_ms = 2000\n",
            endpoint_arg(&socket)
        ),
    )?;

    let server = spawn_backend(&socket, |reader, writer| {
        let req = read_envelope(reader)?;
        let Payload::FileEdit(edit) = &req.payload else {
            bail!("expected file edit, got {:?}", req.payload);
        };
        if edit.operation != EditOperation::Create || edit.content != "fn main() {}\n" {
            bail!("unexpected edit: {edit:?}");
        }
        send_envelope(
            writer,
            &req.id,
            Payload::FileEdited(FileEdited {
                path: edit.path.clone(),
                content: edit.content.clone(),
                task_id: None,
            }),
        )
    })?;

    let output = cli_bin(temp.path())
        .args(["edit", "src/main.rs", "--create", "--content", "fn main() {}\n"])
        .output()
        .context("failed to run tether edit")?;

    let value = stdout_json(&output)?;
    assert_eq!(value["path"], "src/main.rs");

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn cancel_reports_acknowledged_status() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let server = spawn_backend(&socket, |reader, writer| {
        let req = read_envelope(reader)?;
        let Payload::TaskCancel(cancel) = &req.payload else {
            bail!("expected cancel, got {:?}", req.payload);
        };
        send_envelope(
            writer,
            &req.id,
            Payload::TaskStatus(StatusUpdate {
                task_id: cancel.task_id.clone(),
                state: "cancelled".to_string(),
                detail: None,
            }),
        )
    })?;

    let output = cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket))
        .args(["cancel", "t9"])
        .output()
        .context("failed to run tether cancel")?;

    let value = stdout_json(&output)?;
    assert_eq!(value["taskId"], "t9");
    assert_eq!(value["status"], "cancelled");

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn backend_error_fails_the_command() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let server = spawn_backend(&socket, |reader, writer| {
        let req = read_envelope(reader)?;
        send_envelope(
            writer,
            &req.id,
            Payload::Error(ErrorPayload {
                message: "model overloaded".to_string(),
                code: None,
            }),
        )
    })?;

    cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket))
        .args(["chat", "hi"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("model overloaded"));

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn watch_streams_frames_until_disconnect() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    let socket = socket_for(temp.path());

    let server = spawn_backend(&socket, |_reader, writer| {
        // Give the client time to subscribe.
        thread::sleep(Duration::from_millis(300));
        send_envelope(
            writer,
            "b-1",
            Payload::CommandOutput(CommandOutput {
                command: "build".to_string(),
                output: "compiling\n".to_string(),
                exit_code: None,
                task_id: None,
            }),
        )?;
        writeln!(
            writer,
            r#"{{"id":"b-2","type":"telemetry","payload":{{"cpu":3}},"timestamp":1}}"#
        )?;
        send_envelope(
            writer,
            "b-3",
            Payload::Error(ErrorPayload {
                message: "disk almost full".to_string(),
                code: None,
            }),
        )?;
        writer.flush()?;
        Ok(())
    })?;

    let output = cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket))
        .arg("watch")
        .output()
        .context("failed to run tether watch")?;

    assert!(
        output.status.success(),
        "cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Each kind has its own handler, so cross-kind order is not fixed.
    let mut ids: Vec<String> = stdout
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line)?;
            Ok(value["id"].as_str().unwrap_or_default().to_string())
        })
        .collect::<Result<_>>()?;
    ids.sort();
    assert_eq!(ids, vec!["b-1", "b-2", "b-3"]);

    server.join().expect("mock backend thread panicked")?;
    Ok(())
}

#[test]
fn watch_rejects_outbound_kinds() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket_for(temp.path())))
        .args(["watch", "--kind", "chat.request"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot watch"));
    Ok(())
}

#[test]
fn unreachable_backend_is_reported() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    cli_bin(temp.path())
        .arg("--endpoint")
        .arg(endpoint_arg(&socket_for(temp.path())))
        .args(["chat", "hello?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is a backend listening"));
    Ok(())
}

#[test]
fn edit_requires_content() -> Result<()> {
    let temp = tempfile::tempdir().context("failed to create tempdir")?;
    cli_bin(temp.path())
        .args(["edit", "src/lib.rs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--content TEXT or --from FILE"));
    Ok(())
}
