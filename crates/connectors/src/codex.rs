//! Codex WebSocket-JSONL adapter
//!
//! Spawns the `codex` CLI in app-server mode and bridges it over a local
//! WebSocket. The connect phase retries with backoff until a bounded
//! deadline; outbound commands queue in the channel until the socket opens
//! and flush afterwards. Any post-open socket error is fatal.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use companion_protocol::{
    BackendKind, EventPayload, NormalizedToolInput, PermissionBehavior, PermissionRequestData,
};

use crate::{resolve_binary, Adapter, AdapterError, BackendCommand, LaunchSpec};

const CONNECT_DEADLINE: Duration = Duration::from_secs(20);
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(4);

/// Fixed port the app-server listens on inside a container. The container
/// publishes it to an auto-assigned host port, which is what
/// `LaunchSpec::app_server_port` carries for the dial side.
pub const CONTAINER_APP_SERVER_PORT: u16 = 4500;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Where the child should bind.
///
/// Direct sessions share one port for listen and connect, on loopback.
/// Containerized sessions listen on the fixed in-container port: the
/// published mapping routes host:`app_server_port` → container:4500, and
/// it enters through the container's external interface, so the bind must
/// be `0.0.0.0` — a loopback bind is unreachable from the mapping. Host
/// exposure stays `127.0.0.1` via the publish spec.
fn listen_endpoint(wrapped: bool, connect_port: u16) -> String {
    if wrapped {
        format!("0.0.0.0:{CONTAINER_APP_SERVER_PORT}")
    } else {
        format!("127.0.0.1:{connect_port}")
    }
}

pub async fn spawn(spec: LaunchSpec) -> Result<Adapter, AdapterError> {
    // Host-side port the adapter dials; inside a container the child
    // listens on CONTAINER_APP_SERVER_PORT instead.
    let connect_port = spec
        .app_server_port
        .ok_or_else(|| AdapterError::Spawn("codex requires an app-server port".into()))?;
    let codex_bin = resolve_binary("COMPANION_CODEX_BIN", "codex")?;

    let args: Vec<String> = vec![
        "app-server".into(),
        "--listen".into(),
        listen_endpoint(!spec.wrapper.is_empty(), connect_port),
    ];
    let (program, full_args) = if spec.wrapper.is_empty() {
        (codex_bin, args)
    } else {
        let mut wrapped = spec.wrapper[1..].to_vec();
        wrapped.push(codex_bin);
        wrapped.extend(args);
        (spec.wrapper[0].clone(), wrapped)
    };

    info!(
        component = "codex_adapter",
        event = "codex.spawn",
        cwd = %spec.cwd,
        connect_port = connect_port,
        wrapped = !spec.wrapper.is_empty(),
        "Spawning Codex app-server"
    );

    let mut command = tokio::process::Command::new(&program);
    command
        .args(&full_args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| AdapterError::Spawn(format!("codex CLI: {e}")))?;

    // App-server logs go to our log, not the protocol stream.
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(component = "codex_adapter", event = "codex.stdout", line = %line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(component = "codex_adapter", event = "codex.stderr", line = %line);
            }
        });
    }

    let (event_tx, event_rx) = mpsc::channel::<EventPayload>(256);
    // Commands queue here while the socket is still connecting.
    let (command_tx, command_rx) = mpsc::channel::<BackendCommand>(256);
    let child = Arc::new(Mutex::new(child));

    let run_child = child.clone();
    tokio::spawn(async move {
        run(connect_port, spec.model, event_tx, command_rx, run_child).await;
    });

    Ok(Adapter::new(BackendKind::Codex, event_rx, command_tx, child))
}

async fn run(
    connect_port: u16,
    model: Option<String>,
    event_tx: mpsc::Sender<EventPayload>,
    mut command_rx: mpsc::Receiver<BackendCommand>,
    child: Arc<Mutex<tokio::process::Child>>,
) {
    let mut ws = match connect_with_backoff(connect_port).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(
                component = "codex_adapter",
                event = "codex.connect.failed",
                error = %e,
                "Could not reach Codex app-server"
            );
            let _ = event_tx
                .send(EventPayload::Error {
                    message: format!("codex app-server unreachable: {e}"),
                })
                .await;
            let _ = event_tx
                .send(EventPayload::CliDisconnected {
                    reason: "connect_failed".into(),
                })
                .await;
            let mut child = child.lock().await;
            let _ = child.kill().await;
            return;
        }
    };

    info!(
        component = "codex_adapter",
        event = "codex.connect.open",
        connect_port = connect_port,
        "Codex app-server socket open"
    );
    let _ = event_tx.send(EventPayload::CliConnected {}).await;

    loop {
        tokio::select! {
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        for ev in normalize_line(text.as_str()) {
                            if event_tx.send(ev).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = event_tx
                            .send(EventPayload::CliDisconnected { reason: "socket_closed".into() })
                            .await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // Post-open errors are fatal for this adapter.
                        error!(
                            component = "codex_adapter",
                            event = "codex.socket.error",
                            error = %e,
                            "Codex socket error"
                        );
                        let _ = event_tx
                            .send(EventPayload::Error { message: format!("codex socket: {e}") })
                            .await;
                        let _ = event_tx
                            .send(EventPayload::CliDisconnected { reason: "socket_error".into() })
                            .await;
                        return;
                    }
                }
            }
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { return };
                if matches!(cmd, BackendCommand::Shutdown) {
                    let _ = ws.send(Message::Close(None)).await;
                    let mut child = child.lock().await;
                    let _ = child.kill().await;
                    return;
                }
                if let Some(line) = serialize_command(&cmd, model.as_deref()) {
                    if let Err(e) = ws.send(Message::Text(line.into())).await {
                        error!(
                            component = "codex_adapter",
                            event = "codex.send.error",
                            error = %e,
                            "Failed to send command"
                        );
                        let _ = event_tx
                            .send(EventPayload::CliDisconnected { reason: "send_failed".into() })
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

async fn connect_with_backoff(port: u16) -> Result<WsStream, AdapterError> {
    let url = format!("ws://127.0.0.1:{port}");
    let deadline = Instant::now() + CONNECT_DEADLINE;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => return Ok(ws),
            Err(e) => {
                if Instant::now() + backoff >= deadline {
                    return Err(AdapterError::ConnectTimeout(
                        CONNECT_DEADLINE.as_millis() as u64
                    ));
                }
                debug!(
                    component = "codex_adapter",
                    event = "codex.connect.retry",
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "App-server not ready, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dialect translation
// ---------------------------------------------------------------------------

/// Serialize a bridge command into one submission line, or None when the
/// backend has no equivalent operation.
fn serialize_command(cmd: &BackendCommand, default_model: Option<&str>) -> Option<String> {
    let op = match cmd {
        BackendCommand::UserMessage { content } => json!({
            "type": "user_input",
            "items": [{ "type": "text", "text": content }],
        }),
        BackendCommand::PermissionDecision {
            request_id,
            behavior,
            ..
        } => json!({
            "type": "exec_approval",
            "id": request_id,
            "decision": match behavior {
                PermissionBehavior::Allow => "approved",
                PermissionBehavior::Deny => "denied",
            },
        }),
        BackendCommand::Interrupt => json!({ "type": "interrupt" }),
        BackendCommand::SetModel { model } => json!({
            "type": "override_turn_context",
            "model": model,
        }),
        BackendCommand::SetPermissionMode { mode } => json!({
            "type": "override_turn_context",
            "approval_policy": mode,
        }),
        BackendCommand::McpGetStatus
        | BackendCommand::McpToggle { .. }
        | BackendCommand::McpReconnect { .. }
        | BackendCommand::McpSetServers { .. } => {
            debug!(
                component = "codex_adapter",
                event = "codex.command.unsupported",
                "MCP management is not available for this backend"
            );
            return None;
        }
        BackendCommand::Shutdown => return None,
    };
    let submission = json!({
        "id": companion_protocol::new_id(),
        "op": op,
        "model": default_model,
    });
    serde_json::to_string(&submission).ok()
}

/// Translate one app-server event line into normalized events.
fn normalize_line(line: &str) -> Vec<EventPayload> {
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                component = "codex_adapter",
                event = "codex.parse_error",
                error = %e,
                line_preview = %&line[..line.len().min(200)],
                "Failed to parse app-server line"
            );
            return vec![];
        }
    };
    let msg = raw.get("msg").unwrap_or(&raw);
    let msg_type = msg.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match msg_type {
        "session_configured" => vec![EventPayload::SessionInit {
            backend_session_id: str_field(msg, "session_id"),
            model: str_field(msg, "model"),
            cwd: str_field(msg, "cwd"),
            permission_mode: str_field(msg, "approval_policy"),
            tools: Vec::new(),
            extra: Map::new(),
        }],
        "agent_message" => vec![EventPayload::Assistant {
            message: json!({
                "role": "assistant",
                "content": [{ "type": "text", "text": msg.get("message").cloned().unwrap_or(Value::Null) }],
            }),
            parent_tool_use_id: None,
        }],
        "agent_message_delta" | "agent_reasoning_delta" => vec![EventPayload::StreamEvent {
            event: msg.clone(),
            parent_tool_use_id: None,
        }],
        "exec_approval_request" => {
            let call_id = str_field(msg, "call_id").unwrap_or_else(companion_protocol::new_id);
            let command = msg
                .get("command")
                .and_then(|v| v.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                });
            vec![EventPayload::PermissionRequest {
                request: PermissionRequestData {
                    request_id: call_id,
                    tool_name: "Exec".into(),
                    tool_use_id: None,
                    input: msg.clone(),
                    normalized_input: NormalizedToolInput {
                        command,
                        file_path: None,
                    },
                    permission_mode: None,
                    request_hash: None,
                },
            }]
        }
        "apply_patch_approval_request" => {
            let call_id = str_field(msg, "call_id").unwrap_or_else(companion_protocol::new_id);
            let file_path = msg
                .get("changes")
                .and_then(|c| c.as_object())
                .and_then(|o| o.keys().next().cloned());
            vec![EventPayload::PermissionRequest {
                request: PermissionRequestData {
                    request_id: call_id,
                    tool_name: "ApplyPatch".into(),
                    tool_use_id: None,
                    input: msg.clone(),
                    normalized_input: NormalizedToolInput {
                        command: None,
                        file_path,
                    },
                    permission_mode: None,
                    request_hash: None,
                },
            }]
        }
        "task_started" => vec![EventPayload::StatusChange {
            status: "working".into(),
        }],
        "task_complete" => vec![EventPayload::Result {
            subtype: Some("success".into()),
            is_error: false,
            num_turns: None,
            total_cost_usd: None,
            duration_ms: None,
            usage: None,
            extra: Map::new(),
        }],
        "turn_aborted" => vec![EventPayload::Result {
            subtype: Some("aborted".into()),
            is_error: false,
            num_turns: None,
            total_cost_usd: None,
            duration_ms: None,
            usage: None,
            extra: Map::new(),
        }],
        "token_count" => {
            let mut extra = Map::new();
            if let Some(info) = msg.get("info") {
                extra.insert("token_info".into(), info.clone());
            }
            vec![EventPayload::SessionUpdate {
                model: None,
                permission_mode: None,
                cwd: None,
                git_branch: None,
                ahead: None,
                behind: None,
                lines_added: None,
                lines_removed: None,
                num_turns: None,
                total_cost_usd: None,
                context_used_percent: msg
                    .get("info")
                    .and_then(|i| i.get("context_used_percent"))
                    .and_then(|v| v.as_f64()),
                containerized: None,
                extra,
            }]
        }
        "error" | "stream_error" => vec![EventPayload::Error {
            message: str_field(msg, "message").unwrap_or_else(|| "unknown backend error".into()),
        }],
        other => vec![EventPayload::SystemEvent {
            subtype: other.to_string(),
            data: msg.clone(),
        }],
    }
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_configured_maps_to_init() {
        let events = normalize_line(
            r#"{"id":"1","msg":{"type":"session_configured","session_id":"th_1","model":"gpt-5-codex"}}"#,
        );
        assert!(matches!(
            &events[0],
            EventPayload::SessionInit { backend_session_id: Some(id), .. } if id == "th_1"
        ));
    }

    #[test]
    fn exec_approval_flattens_command() {
        let events = normalize_line(
            r#"{"id":"2","msg":{"type":"exec_approval_request","call_id":"c9","command":["rm","-rf","build"]}}"#,
        );
        match &events[0] {
            EventPayload::PermissionRequest { request } => {
                assert_eq!(request.request_id, "c9");
                assert_eq!(
                    request.normalized_input.command.as_deref(),
                    Some("rm -rf build")
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn task_complete_is_result() {
        let events = normalize_line(r#"{"id":"3","msg":{"type":"task_complete"}}"#);
        assert!(matches!(&events[0], EventPayload::Result { .. }));
    }

    #[test]
    fn unknown_type_passes_through_as_system_event() {
        let events = normalize_line(r#"{"id":"4","msg":{"type":"mcp_list_tools_response"}}"#);
        assert!(matches!(
            &events[0],
            EventPayload::SystemEvent { subtype, .. } if subtype == "mcp_list_tools_response"
        ));
    }

    #[test]
    fn approval_decision_serializes() {
        let line = serialize_command(
            &BackendCommand::PermissionDecision {
                request_id: "c9".into(),
                behavior: PermissionBehavior::Allow,
                message: None,
            },
            None,
        )
        .unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["op"]["type"], "exec_approval");
        assert_eq!(v["op"]["decision"], "approved");
    }

    #[test]
    fn mcp_commands_have_no_codex_equivalent() {
        assert!(serialize_command(&BackendCommand::McpGetStatus, None).is_none());
    }

    #[test]
    fn direct_session_listens_where_it_connects() {
        assert_eq!(listen_endpoint(false, 49153), "127.0.0.1:49153");
    }

    #[test]
    fn containerized_session_listens_on_fixed_container_port() {
        // The host-published port is only for dialing; inside the container
        // the child binds the fixed port on all interfaces so the published
        // mapping can reach it.
        assert_eq!(listen_endpoint(true, 49153), "0.0.0.0:4500");
    }
}
