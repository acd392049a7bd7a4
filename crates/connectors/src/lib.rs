//! Companion backend adapters
//!
//! One adapter per backend CLI. Each adapter owns the child process and a
//! single stdin-writer task, parses the backend's JSONL dialect into the
//! common [`EventPayload`] set, and accepts [`BackendCommand`]s from the
//! bridge. Sequencing is the bridge's job — adapters emit events in read
//! order and never stamp `seq`.

pub mod claude;
pub mod codex;

use std::sync::Arc;

use companion_protocol::{BackendKind, EventPayload, PermissionBehavior};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Errors that can occur in adapters
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to spawn backend process: {0}")]
    Spawn(String),

    #[error("process communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend connect deadline exceeded after {0} ms")]
    ConnectTimeout(u64),

    #[error("adapter channel closed")]
    ChannelClosed,

    #[error("backend error: {0}")]
    Backend(String),
}

/// Commands the bridge sends down to a backend child.
#[derive(Debug, Clone)]
pub enum BackendCommand {
    UserMessage {
        content: String,
    },
    PermissionDecision {
        request_id: String,
        behavior: PermissionBehavior,
        message: Option<String>,
    },
    Interrupt,
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: String,
    },
    McpGetStatus,
    McpToggle {
        server_name: String,
        enabled: bool,
    },
    McpReconnect {
        server_name: String,
    },
    McpSetServers {
        servers: Value,
    },
    Shutdown,
}

/// How to launch a backend CLI for one session.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Working directory for the child (host path, or the container mount
    /// point when `wrapper` execs inside a container).
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Backend-native session id to resume.
    pub resume: Option<String>,
    /// Resume as a fork instead of continuing in place.
    pub fork_session: bool,
    /// Optional argv prefix that wraps the backend binary, e.g.
    /// `["docker", "exec", "-i", "-w", "/workspace", "<container>"]`.
    pub wrapper: Vec<String>,
    /// Host-side port the adapter dials to reach the Codex app-server
    /// (codex only). Direct sessions also listen here; containerized
    /// sessions listen on the fixed in-container port behind this mapping.
    pub app_server_port: Option<u16>,
}

/// A live backend child plus its two channels.
pub struct Adapter {
    backend: BackendKind,
    events: Option<mpsc::Receiver<EventPayload>>,
    commands: mpsc::Sender<BackendCommand>,
    child: Arc<Mutex<Child>>,
}

impl Adapter {
    pub(crate) fn new(
        backend: BackendKind,
        events: mpsc::Receiver<EventPayload>,
        commands: mpsc::Sender<BackendCommand>,
        child: Arc<Mutex<Child>>,
    ) -> Self {
        Self {
            backend,
            events: Some(events),
            commands,
            child,
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Take the inbound event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<EventPayload>> {
        self.events.take()
    }

    /// Sender for outbound commands (cheap Clone).
    pub fn commands(&self) -> mpsc::Sender<BackendCommand> {
        self.commands.clone()
    }

    /// Ask the child to exit; falls back to a hard kill.
    pub async fn kill(&self) {
        if self.commands.send(BackendCommand::Shutdown).await.is_err() {
            warn!(
                component = "adapter",
                event = "adapter.shutdown.channel_closed",
                "Command channel already closed"
            );
        }
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

/// Spawn the right adapter for a backend kind.
pub async fn spawn_adapter(backend: BackendKind, spec: LaunchSpec) -> Result<Adapter, AdapterError> {
    match backend {
        BackendKind::Claude => claude::spawn(spec).await,
        BackendKind::Codex => codex::spawn(spec).await,
    }
}

/// Resolve a backend binary: env override, `~/.claude/local` install, then PATH.
pub(crate) fn resolve_binary(env_var: &str, name: &str) -> Result<String, AdapterError> {
    if let Ok(path) = std::env::var(env_var) {
        if std::path::Path::new(&path).exists() {
            return Ok(path);
        }
    }
    if name == "claude" {
        if let Ok(home) = std::env::var("HOME") {
            let local = format!("{home}/.claude/local/claude");
            if std::path::Path::new(&local).exists() {
                return Ok(local);
            }
        }
    }
    // Fall back to PATH resolution by the OS
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_binary_prefers_env_override() {
        std::env::set_var("COMPANION_TEST_BIN", "/bin/sh");
        let resolved = resolve_binary("COMPANION_TEST_BIN", "definitely-not-on-path").unwrap();
        assert_eq!(resolved, "/bin/sh");
        std::env::remove_var("COMPANION_TEST_BIN");
    }

    #[test]
    fn resolve_binary_falls_back_to_name() {
        let resolved = resolve_binary("COMPANION_TEST_MISSING", "codex").unwrap();
        assert_eq!(resolved, "codex");
    }
}
