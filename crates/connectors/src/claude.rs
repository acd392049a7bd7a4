//! Claude stdio-JSONL adapter
//!
//! Spawns the `claude` CLI as a subprocess and speaks the NDJSON
//! stream-json protocol over stdin/stdout. Inbound lines are normalized
//! into the common [`EventPayload`] set; outbound [`BackendCommand`]s are
//! serialized one complete line at a time by a dedicated writer task.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use companion_protocol::{
    BackendKind, EventPayload, NormalizedToolInput, PermissionBehavior, PermissionRequestData,
};

use crate::{resolve_binary, Adapter, AdapterError, BackendCommand, LaunchSpec};

// ---------------------------------------------------------------------------
// Stdin messages (daemon → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        session_id: String,
        message: UserMessagePayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Initialize {},
    Interrupt,
    SetModel { model: Option<String> },
    SetPermissionMode { mode: String },
    McpStatus,
    McpToggle { server_name: String, enabled: bool },
    McpReconnect { server_name: String },
    McpSetServers { servers: Value },
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
}

/// Tool input echoed back in the approval response (required by the CLI).
struct PendingApproval {
    input: Value,
    tool_use_id: Option<String>,
    permission_suggestions: Option<Value>,
}

type ApprovalMap = Arc<Mutex<HashMap<String, PendingApproval>>>;

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

pub async fn spawn(spec: LaunchSpec) -> Result<Adapter, AdapterError> {
    let claude_bin = resolve_binary("COMPANION_CLAUDE_BIN", "claude")?;

    let mut args: Vec<String> = vec![
        "--output-format".into(),
        "stream-json".into(),
        "--input-format".into(),
        "stream-json".into(),
        "--verbose".into(),
        "--permission-prompt-tool".into(),
        "stdio".into(),
        "--include-partial-messages".into(),
    ];
    if let Some(ref m) = spec.model {
        args.push("--model".into());
        args.push(m.clone());
    }
    if let Some(ref mode) = spec.permission_mode {
        args.push("--permission-mode".into());
        args.push(mode.clone());
    }
    if let Some(ref sid) = spec.resume {
        args.push("--resume".into());
        args.push(sid.clone());
        if spec.fork_session {
            args.push("--fork-session".into());
        }
    }
    if !spec.allowed_tools.is_empty() {
        args.push("--allowedTools".into());
        args.push(spec.allowed_tools.join(","));
    }

    let (program, full_args) = if spec.wrapper.is_empty() {
        (claude_bin.clone(), args)
    } else {
        let mut wrapped = spec.wrapper[1..].to_vec();
        wrapped.push(claude_bin.clone());
        wrapped.extend(args);
        (spec.wrapper[0].clone(), wrapped)
    };

    info!(
        component = "claude_adapter",
        event = "claude.spawn",
        cwd = %spec.cwd,
        bin = %program,
        wrapped = !spec.wrapper.is_empty(),
        resume = ?spec.resume,
        "Spawning Claude CLI"
    );

    let mut command = tokio::process::Command::new(&program);
    command
        .args(&full_args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("CLAUDE_CODE_ENTRYPOINT", "companion");
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| AdapterError::Spawn(format!("claude CLI: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AdapterError::Spawn("no stdin on child".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AdapterError::Spawn("no stdout on child".into()))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(
                    component = "claude_adapter",
                    event = "claude.stderr",
                    line = %line,
                    "Claude CLI stderr"
                );
            }
        });
    }

    let (event_tx, event_rx) = mpsc::channel::<EventPayload>(256);
    let (line_tx, line_rx) = mpsc::channel::<String>(256);
    let (command_tx, command_rx) = mpsc::channel::<BackendCommand>(256);
    let pending_approvals: ApprovalMap = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(stdin_writer(stdin, line_rx));
    tokio::spawn(read_loop(stdout, event_tx, pending_approvals.clone()));

    let child = Arc::new(Mutex::new(child));
    tokio::spawn(command_loop(
        command_rx,
        line_tx.clone(),
        pending_approvals,
        child.clone(),
    ));

    // Kick off the control handshake; the init event arrives on stdout.
    send_line(
        &line_tx,
        &StdinMessage::ControlRequest {
            request_id: companion_protocol::new_id(),
            request: ControlRequestBody::Initialize {},
        },
    )
    .await?;

    Ok(Adapter::new(BackendKind::Claude, event_rx, command_tx, child))
}

async fn send_line(tx: &mpsc::Sender<String>, msg: &StdinMessage) -> Result<(), AdapterError> {
    let json = serde_json::to_string(msg)?;
    tx.send(json).await.map_err(|_| AdapterError::ChannelClosed)
}

/// Dedicated stdin writer — the only task that touches the child's stdin,
/// so one message is always one complete line.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "claude_adapter",
                event = "claude.stdin.write_error",
                error = %e,
                "Failed to write to CLI stdin"
            );
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    debug!(
        component = "claude_adapter",
        event = "claude.stdin.closed",
        "Stdin writer task ended"
    );
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

async fn command_loop(
    mut rx: mpsc::Receiver<BackendCommand>,
    line_tx: mpsc::Sender<String>,
    pending_approvals: ApprovalMap,
    child: Arc<Mutex<tokio::process::Child>>,
) {
    while let Some(cmd) = rx.recv().await {
        let msg = match cmd {
            BackendCommand::UserMessage { content } => StdinMessage::User {
                session_id: String::new(),
                message: UserMessagePayload {
                    role: "user",
                    content: vec![UserContentBlock::Text { text: content }],
                },
                parent_tool_use_id: None,
            },
            BackendCommand::PermissionDecision {
                request_id,
                behavior,
                message,
            } => {
                let pending = pending_approvals.lock().await.remove(&request_id);
                let response = decision_payload(behavior, message, pending);
                StdinMessage::ControlResponse {
                    response: ControlResponsePayload::Success {
                        request_id,
                        response,
                    },
                }
            }
            BackendCommand::Interrupt => control(ControlRequestBody::Interrupt),
            BackendCommand::SetModel { model } => {
                control(ControlRequestBody::SetModel { model: Some(model) })
            }
            BackendCommand::SetPermissionMode { mode } => {
                control(ControlRequestBody::SetPermissionMode { mode })
            }
            BackendCommand::McpGetStatus => control(ControlRequestBody::McpStatus),
            BackendCommand::McpToggle {
                server_name,
                enabled,
            } => control(ControlRequestBody::McpToggle {
                server_name,
                enabled,
            }),
            BackendCommand::McpReconnect { server_name } => {
                control(ControlRequestBody::McpReconnect { server_name })
            }
            BackendCommand::McpSetServers { servers } => {
                control(ControlRequestBody::McpSetServers { servers })
            }
            BackendCommand::Shutdown => {
                let mut child = child.lock().await;
                let _ = child.kill().await;
                break;
            }
        };
        if send_line(&line_tx, &msg).await.is_err() {
            break;
        }
    }
}

fn control(body: ControlRequestBody) -> StdinMessage {
    StdinMessage::ControlRequest {
        request_id: companion_protocol::new_id(),
        request: body,
    }
}

/// Build the `can_use_tool` control response, echoing the original input
/// and tool-use id as the CLI requires.
fn decision_payload(
    behavior: PermissionBehavior,
    message: Option<String>,
    pending: Option<PendingApproval>,
) -> Value {
    match behavior {
        PermissionBehavior::Deny => {
            let mut deny = json!({
                "behavior": "deny",
                "message": message.unwrap_or_else(|| "User denied this operation".into()),
                "interrupt": false,
            });
            if let Some(ref p) = pending {
                if let Some(ref id) = p.tool_use_id {
                    deny["toolUseID"] = json!(id);
                }
            }
            deny
        }
        PermissionBehavior::Allow => {
            let mut allow = json!({ "behavior": "allow" });
            if let Some(ref p) = pending {
                allow["updatedInput"] = p.input.clone();
                if let Some(ref id) = p.tool_use_id {
                    allow["toolUseID"] = json!(id);
                }
                if let Some(ref suggestions) = p.permission_suggestions {
                    allow["updatedPermissions"] = suggestions.clone();
                }
            }
            allow
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

async fn read_loop(
    stdout: tokio::process::ChildStdout,
    event_tx: mpsc::Sender<EventPayload>,
    pending_approvals: ApprovalMap,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let raw: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            component = "claude_adapter",
                            event = "claude.stdout.parse_error",
                            error = %e,
                            line_preview = %&line[..line.len().min(200)],
                            "Failed to parse stdout JSON"
                        );
                        continue;
                    }
                };
                for ev in normalize_line(&raw, &pending_approvals).await {
                    if event_tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => {
                info!(
                    component = "claude_adapter",
                    event = "claude.stdout.eof",
                    "Claude CLI stdout EOF"
                );
                let _ = event_tx
                    .send(EventPayload::CliDisconnected {
                        reason: "cli_exited".into(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                error!(
                    component = "claude_adapter",
                    event = "claude.stdout.read_error",
                    error = %e,
                    "Error reading CLI stdout"
                );
                let _ = event_tx
                    .send(EventPayload::CliDisconnected {
                        reason: format!("read_error: {e}"),
                    })
                    .await;
                return;
            }
        }
    }
}

/// Translate one stdout JSON line into zero or more normalized events.
async fn normalize_line(raw: &Value, pending_approvals: &ApprovalMap) -> Vec<EventPayload> {
    let msg_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match msg_type {
        "system" => normalize_system(raw),
        "assistant" => vec![EventPayload::Assistant {
            message: raw.get("message").cloned().unwrap_or(Value::Null),
            parent_tool_use_id: str_field(raw, "parent_tool_use_id"),
        }],
        "user" => normalize_user_echo(raw),
        "stream_event" => vec![EventPayload::StreamEvent {
            event: raw.get("event").cloned().unwrap_or(Value::Null),
            parent_tool_use_id: str_field(raw, "parent_tool_use_id"),
        }],
        "result" => vec![EventPayload::Result {
            subtype: str_field(raw, "subtype"),
            is_error: raw.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false),
            num_turns: raw.get("num_turns").and_then(|v| v.as_u64()),
            total_cost_usd: raw.get("total_cost_usd").and_then(|v| v.as_f64()),
            duration_ms: raw.get("duration_ms").and_then(|v| v.as_u64()),
            usage: raw.get("usage").cloned(),
            extra: Map::new(),
        }],
        "control_request" => normalize_control_request(raw, pending_approvals).await,
        "control_cancel_request" => match str_field(raw, "request_id") {
            Some(request_id) => {
                pending_approvals.lock().await.remove(&request_id);
                vec![EventPayload::PermissionCancelled { request_id }]
            }
            None => vec![],
        },
        "control_response" => vec![], // replies to our own control requests
        "tool_progress" => vec![EventPayload::ToolProgress {
            tool_use_id: str_field(raw, "tool_use_id").unwrap_or_default(),
            tool_name: str_field(raw, "tool_name"),
            elapsed_ms: raw.get("elapsed_time_seconds").and_then(|v| v.as_f64()).map(|s| (s * 1000.0) as u64),
            progress: raw.get("progress").cloned(),
        }],
        "tool_use_summary" => vec![EventPayload::ToolUseSummary {
            tool_use_id: str_field(raw, "tool_use_id").unwrap_or_default(),
            summary: str_field(raw, "summary").unwrap_or_default(),
        }],
        "auth_status" => vec![EventPayload::AuthStatus {
            authenticated: raw
                .get("authenticated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            method: str_field(raw, "method"),
            error: str_field(raw, "error"),
        }],
        "keep_alive" => vec![],
        other => {
            debug!(
                component = "claude_adapter",
                event = "claude.stdout.unknown_type",
                msg_type = %other,
                "Unknown stdout message type"
            );
            vec![]
        }
    }
}

fn normalize_system(raw: &Value) -> Vec<EventPayload> {
    let subtype = raw.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    match subtype {
        "init" => {
            let tools = raw
                .get("tools")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            vec![EventPayload::SessionInit {
                backend_session_id: str_field(raw, "session_id"),
                model: str_field(raw, "model"),
                cwd: str_field(raw, "cwd"),
                permission_mode: str_field(raw, "permissionMode"),
                tools,
                extra: Map::new(),
            }]
        }
        "status" => vec![EventPayload::StatusChange {
            status: str_field(raw, "status").unwrap_or_default(),
        }],
        other => vec![EventPayload::SystemEvent {
            subtype: other.to_string(),
            data: raw.clone(),
        }],
    }
}

/// Echoed user messages carry tool results; surface them so the bridge
/// can clear per-tool timers and retain transcript entries.
fn normalize_user_echo(raw: &Value) -> Vec<EventPayload> {
    if raw.get("isReplay").and_then(|v| v.as_bool()).unwrap_or(false) {
        return vec![];
    }
    let blocks = raw
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array());
    let Some(blocks) = blocks else {
        return vec![];
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
        .map(|b| EventPayload::SystemEvent {
            subtype: "tool_result".into(),
            data: b.clone(),
        })
        .collect()
}

async fn normalize_control_request(raw: &Value, pending_approvals: &ApprovalMap) -> Vec<EventPayload> {
    let request_id = match str_field(raw, "request_id") {
        Some(id) => id,
        None => return vec![],
    };
    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
    if subtype != "can_use_tool" {
        return vec![EventPayload::SystemEvent {
            subtype: format!("control_request.{subtype}"),
            data: raw.clone(),
        }];
    }

    let tool_name = request
        .get("tool_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let input = request.get("input").cloned().unwrap_or(Value::Null);
    let tool_use_id = request
        .get("tool_use_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    pending_approvals.lock().await.insert(
        request_id.clone(),
        PendingApproval {
            input: input.clone(),
            tool_use_id: tool_use_id.clone(),
            permission_suggestions: request.get("permission_suggestions").cloned(),
        },
    );

    vec![EventPayload::PermissionRequest {
        request: PermissionRequestData {
            request_id,
            tool_name,
            tool_use_id,
            normalized_input: normalize_tool_input(&input),
            input,
            permission_mode: request
                .get("permission_mode")
                .and_then(|v| v.as_str())
                .map(String::from),
            request_hash: request
                .get("request_hash")
                .and_then(|v| v.as_str())
                .map(String::from),
        },
    }]
}

/// Best-effort flat view of a tool input for display and rule matching.
pub(crate) fn normalize_tool_input(input: &Value) -> NormalizedToolInput {
    NormalizedToolInput {
        command: input
            .get("command")
            .and_then(|v| v.as_str())
            .map(String::from),
        file_path: input
            .get("file_path")
            .or_else(|| input.get("filePath"))
            .or_else(|| input.get("path"))
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| v.as_str()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_line_becomes_session_init() {
        let raw: Value = serde_json::from_str(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-opus","cwd":"/w","permissionMode":"default","tools":["Bash","Read"]}"#,
        )
        .unwrap();
        let pending: ApprovalMap = Arc::new(Mutex::new(HashMap::new()));
        let events = normalize_line(&raw, &pending).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            EventPayload::SessionInit {
                backend_session_id,
                model,
                tools,
                ..
            } => {
                assert_eq!(backend_session_id.as_deref(), Some("abc"));
                assert_eq!(model.as_deref(), Some("claude-opus"));
                assert_eq!(tools.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn can_use_tool_stores_pending_and_normalizes_input() {
        let raw: Value = serde_json::from_str(
            r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","tool_use_id":"t1","input":{"command":"ls -la"}}}"#,
        )
        .unwrap();
        let pending: ApprovalMap = Arc::new(Mutex::new(HashMap::new()));
        let events = normalize_line(&raw, &pending).await;
        match &events[0] {
            EventPayload::PermissionRequest { request } => {
                assert_eq!(request.request_id, "r1");
                assert_eq!(request.tool_name, "Bash");
                assert_eq!(request.normalized_input.command.as_deref(), Some("ls -la"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(pending.lock().await.contains_key("r1"));
    }

    #[tokio::test]
    async fn cancel_clears_pending() {
        let pending: ApprovalMap = Arc::new(Mutex::new(HashMap::new()));
        pending.lock().await.insert(
            "r1".into(),
            PendingApproval {
                input: Value::Null,
                tool_use_id: None,
                permission_suggestions: None,
            },
        );
        let raw: Value =
            serde_json::from_str(r#"{"type":"control_cancel_request","request_id":"r1"}"#).unwrap();
        let events = normalize_line(&raw, &pending).await;
        assert!(matches!(
            &events[0],
            EventPayload::PermissionCancelled { request_id } if request_id == "r1"
        ));
        assert!(pending.lock().await.is_empty());
    }

    #[test]
    fn allow_echoes_original_input() {
        let payload = decision_payload(
            PermissionBehavior::Allow,
            None,
            Some(PendingApproval {
                input: json!({"command":"ls"}),
                tool_use_id: Some("t1".into()),
                permission_suggestions: None,
            }),
        );
        assert_eq!(payload["behavior"], "allow");
        assert_eq!(payload["updatedInput"]["command"], "ls");
        assert_eq!(payload["toolUseID"], "t1");
    }

    #[test]
    fn deny_carries_message() {
        let payload = decision_payload(PermissionBehavior::Deny, Some("nope".into()), None);
        assert_eq!(payload["behavior"], "deny");
        assert_eq!(payload["message"], "nope");
    }

    #[test]
    fn tool_result_echo_is_surfaced() {
        let raw: Value = serde_json::from_str(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#,
        )
        .unwrap();
        let events = normalize_user_echo(&raw);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            EventPayload::SystemEvent { subtype, .. } if subtype == "tool_result"
        ));
    }
}
