//! Container runtime: create/exec/remove per-session containers.
//!
//! Shells out to the container CLI (`docker` by default) in argv form —
//! argv is the only interface, no shell string is ever built from request
//! input. Tracked handles survive restarts via `containers.json`; restore
//! drops containers the runtime no longer knows about.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::paths;
use crate::persist;

pub const CONTAINER_CWD: &str = "/workspace";
const HOST_AUTH_MOUNT: &str = "/mnt/host-claude";
const RUNTIME_AUTH_DIR: &str = "/home/agent/.claude";

pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
pub const QUICK_EXEC_TIMEOUT: Duration = Duration::from_secs(8);
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container port {0} outside 1..=65535")]
    InvalidPort(u32),

    #[error("container create failed: {0}")]
    CreateFailed(String),

    #[error("exec exited with code {code}: {output}")]
    ExecFailed { code: i32, output: String },

    #[error("exec timed out after {0:?}")]
    ExecTimeout(Duration),

    #[error("container not tracked for session {0}")]
    NotTracked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Running,
    Stopped,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Stopped,
    Missing,
}

/// One tracked container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    /// container port → host port
    pub ports: HashMap<u16, u16>,
    pub host_cwd: String,
    pub container_cwd: String,
    pub state: ContainerState,
}

/// Creation parameters beyond the runtime-pinned mounts.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub image: String,
    pub ports: Vec<u32>,
    /// host path → container path extra mounts
    pub volumes: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
}

/// Result of a streaming exec.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub combined_output: String,
}

pub struct ContainerRuntime {
    bin: String,
    tracked: DashMap<String, ContainerHandle>,
}

impl ContainerRuntime {
    pub fn new() -> Self {
        Self {
            bin: std::env::var("COMPANION_CONTAINER_BIN").unwrap_or_else(|_| "docker".into()),
            tracked: DashMap::new(),
        }
    }

    pub async fn check_available(&self) -> bool {
        self.version().await.is_some()
    }

    pub async fn version(&self) -> Option<String> {
        let out = self
            .run(
                &["version", "--format", "{{.Server.Version}}"],
                QUICK_EXEC_TIMEOUT,
            )
            .await
            .ok()?;
        if out.exit_code == 0 && !out.combined_output.trim().is_empty() {
            Some(out.combined_output.trim().to_string())
        } else {
            None
        }
    }

    pub async fn list_images(&self) -> Vec<String> {
        match self
            .run(
                &["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"],
                QUICK_EXEC_TIMEOUT,
            )
            .await
        {
            Ok(out) if out.exit_code == 0 => out
                .combined_output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.ends_with(":<none>"))
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Create and start a container for a session.
    ///
    /// Any sub-step failure after `run -d` tears the container down before
    /// the error is returned.
    pub async fn create(
        &self,
        session_id: &str,
        host_cwd: &str,
        config: &ContainerConfig,
    ) -> Result<ContainerHandle, ContainerError> {
        let mut requested_ports = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            if *port == 0 || *port > 65535 {
                return Err(ContainerError::InvalidPort(*port));
            }
            requested_ports.push(*port as u16);
        }

        let short = &session_id[..8.min(session_id.len())];
        let name = format!("companion-{short}");
        let home = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "/root".into());

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "-v".into(),
            format!("{home}/.claude:{HOST_AUTH_MOUNT}:ro"),
            "--tmpfs".into(),
            RUNTIME_AUTH_DIR.into(),
            "-v".into(),
            format!("{host_cwd}:{CONTAINER_CWD}"),
            "-w".into(),
            CONTAINER_CWD.into(),
            "--add-host".into(),
            "host.docker.internal:host-gateway".into(),
        ];
        for port in &requested_ports {
            args.push("-p".into());
            args.push(format!("127.0.0.1:0:{port}"));
        }
        for (host_path, container_path) in &config.volumes {
            args.push("-v".into());
            args.push(format!("{host_path}:{container_path}"));
        }
        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(config.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run(&arg_refs, BOOT_TIMEOUT).await?;
        if out.exit_code != 0 {
            return Err(ContainerError::CreateFailed(out.combined_output));
        }
        let container_id = out.combined_output.trim().to_string();

        let mut handle = ContainerHandle {
            id: container_id.clone(),
            name: name.clone(),
            image: config.image.clone(),
            ports: HashMap::new(),
            host_cwd: host_cwd.to_string(),
            container_cwd: CONTAINER_CWD.to_string(),
            state: ContainerState::Creating,
        };

        // Seed only auth/settings/skills from the read-only host mount into
        // the writable runtime dir — never the full user home.
        if let Err(e) = self.seed_auth_files(&container_id).await {
            let _ = self.force_remove_container(&container_id).await;
            return Err(e);
        }

        for port in &requested_ports {
            match self.resolve_port(&container_id, *port).await {
                Ok(host_port) => {
                    handle.ports.insert(*port, host_port);
                }
                Err(e) => {
                    let _ = self.force_remove_container(&container_id).await;
                    return Err(e);
                }
            }
        }

        handle.state = ContainerState::Running;
        self.tracked.insert(session_id.to_string(), handle.clone());
        self.flush();

        info!(
            component = "container",
            event = "container.created",
            session_id = %session_id,
            container_id = %container_id,
            name = %name,
            image = %config.image,
            ports = ?handle.ports,
            "Container running"
        );
        Ok(handle)
    }

    async fn seed_auth_files(&self, container_id: &str) -> Result<(), ContainerError> {
        for file in [".credentials.json", "settings.json"] {
            let src = format!("{HOST_AUTH_MOUNT}/{file}");
            let dst = format!("{RUNTIME_AUTH_DIR}/{file}");
            // Missing optional files are fine; cp failures for other reasons
            // surface through the follow-up existence check below.
            let _ = self
                .exec(container_id, &["cp", "-a", &src, &dst], QUICK_EXEC_TIMEOUT)
                .await;
        }
        let _ = self
            .exec(
                container_id,
                &[
                    "cp",
                    "-a",
                    &format!("{HOST_AUTH_MOUNT}/skills"),
                    &format!("{RUNTIME_AUTH_DIR}/skills"),
                ],
                QUICK_EXEC_TIMEOUT,
            )
            .await;
        Ok(())
    }

    async fn resolve_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<u16, ContainerError> {
        let spec = format!("{container_port}/tcp");
        let out = self
            .run(&["port", container_id, &spec], QUICK_EXEC_TIMEOUT)
            .await?;
        if out.exit_code != 0 {
            return Err(ContainerError::CreateFailed(format!(
                "port {container_port} not published: {}",
                out.combined_output
            )));
        }
        out.combined_output
            .lines()
            .filter_map(|l| l.rsplit(':').next())
            .filter_map(|p| p.trim().parse::<u16>().ok())
            .next()
            .ok_or_else(|| {
                ContainerError::CreateFailed(format!(
                    "could not parse host port from: {}",
                    out.combined_output
                ))
            })
    }

    /// One-shot exec. Timeout is distinguishable from non-zero exit.
    pub async fn exec(
        &self,
        container_id: &str,
        argv: &[&str],
        timeout: Duration,
    ) -> Result<String, ContainerError> {
        let mut args = vec!["exec", container_id];
        args.extend_from_slice(argv);
        let out = self.run(&args, timeout).await?;
        if out.exit_code != 0 {
            return Err(ContainerError::ExecFailed {
                code: out.exit_code,
                output: out.combined_output,
            });
        }
        Ok(out.combined_output)
    }

    /// Streaming exec: stdout + stderr merged, line-buffered, each line
    /// pushed into `line_tx` as it arrives.
    pub async fn exec_streaming(
        &self,
        container_id: &str,
        argv: &[&str],
        timeout: Duration,
        line_tx: mpsc::Sender<String>,
    ) -> Result<ExecOutcome, ContainerError> {
        let mut args: Vec<String> = vec!["exec".into(), container_id.into()];
        args.extend(argv.iter().map(|s| s.to_string()));

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (merge_tx, mut merge_rx) = mpsc::channel::<String>(256);

        if let Some(stdout) = stdout {
            let tx = merge_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = stderr {
            let tx = merge_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(merge_tx);

        let mut combined = String::new();
        let collect = async {
            while let Some(line) = merge_rx.recv().await {
                combined.push_str(&line);
                combined.push('\n');
                let _ = line_tx.send(line).await;
            }
            child.wait().await
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(Ok(status)) => Ok(ExecOutcome {
                exit_code: status.code().unwrap_or(-1),
                combined_output: combined,
            }),
            Ok(Err(e)) => Err(ContainerError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(ContainerError::ExecTimeout(timeout))
            }
        }
    }

    /// Copy one host path into the container.
    pub async fn copy_in(
        &self,
        container_id: &str,
        host_path: &str,
        container_path: &str,
    ) -> Result<(), ContainerError> {
        let dest = format!("{container_id}:{container_path}");
        let out = self.run(&["cp", host_path, &dest], EXEC_TIMEOUT).await?;
        if out.exit_code != 0 {
            return Err(ContainerError::ExecFailed {
                code: out.exit_code,
                output: out.combined_output,
            });
        }
        Ok(())
    }

    pub async fn alive(&self, container_id: &str) -> Liveness {
        match self
            .run(
                &["inspect", "-f", "{{.State.Running}}", container_id],
                QUICK_EXEC_TIMEOUT,
            )
            .await
        {
            Ok(out) if out.exit_code == 0 => {
                if out.combined_output.trim() == "true" {
                    Liveness::Running
                } else {
                    Liveness::Stopped
                }
            }
            _ => Liveness::Missing,
        }
    }

    /// Re-key a tracked handle — the real session id is only known after
    /// the creation pipeline has launched the CLI.
    pub fn retrack(&self, old_key: &str, new_session_id: &str) {
        if let Some((_, handle)) = self.tracked.remove(old_key) {
            self.tracked.insert(new_session_id.to_string(), handle);
            self.flush();
        }
    }

    pub fn handle_for_session(&self, session_id: &str) -> Option<ContainerHandle> {
        self.tracked.get(session_id).map(|h| h.clone())
    }

    /// Force-remove the session's container. Idempotent; removal failures
    /// log and continue.
    pub async fn remove(&self, session_id: &str) {
        let Some((_, handle)) = self.tracked.remove(session_id) else {
            return;
        };
        self.flush();
        if let Err(e) = self.force_remove_container(&handle.id).await {
            warn!(
                component = "container",
                event = "container.remove_failed",
                session_id = %session_id,
                container_id = %handle.id,
                error = %e,
                "Remove failed, continuing"
            );
        } else {
            info!(
                component = "container",
                event = "container.removed",
                session_id = %session_id,
                container_id = %handle.id,
                "Container removed"
            );
        }
    }

    async fn force_remove_container(&self, container_id: &str) -> Result<(), ContainerError> {
        let out = self.run(&["rm", "-f", container_id], EXEC_TIMEOUT).await?;
        if out.exit_code != 0 && !out.combined_output.contains("No such container") {
            return Err(ContainerError::CreateFailed(out.combined_output));
        }
        Ok(())
    }

    /// Remove every tracked container (daemon shutdown).
    pub async fn cleanup_all(&self) {
        let sessions: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        for session_id in sessions {
            self.remove(&session_id).await;
        }
    }

    /// Write non-removed handles to `containers.json`.
    pub fn flush(&self) {
        let handles: HashMap<String, ContainerHandle> = self
            .tracked
            .iter()
            .filter(|e| e.value().state != ContainerState::Removed)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if let Err(e) = persist::write_json(&paths::containers_path(), &handles) {
            warn!(
                component = "container",
                event = "container.persist_error",
                error = %e,
                "Failed to persist container handles"
            );
        }
    }

    /// Restore tracked handles, dropping any the runtime no longer knows.
    pub async fn restore(&self) {
        let handles: HashMap<String, ContainerHandle> =
            persist::read_json_or_default(&paths::containers_path());
        let mut kept = 0usize;
        let mut dropped = 0usize;
        for (session_id, handle) in handles {
            match self.alive(&handle.id).await {
                Liveness::Missing => {
                    dropped += 1;
                }
                liveness => {
                    let mut handle = handle;
                    handle.state = if liveness == Liveness::Running {
                        ContainerState::Running
                    } else {
                        ContainerState::Stopped
                    };
                    self.tracked.insert(session_id, handle);
                    kept += 1;
                }
            }
        }
        self.flush();
        info!(
            component = "container",
            event = "container.restored",
            kept = kept,
            dropped = dropped,
            "Restored container tracking"
        );
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<ExecOutcome, ContainerError> {
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| ContainerError::ExecTimeout(timeout))?
            .map_err(|e| ContainerError::Unavailable(e.to_string()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            combined_output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> ContainerHandle {
        ContainerHandle {
            id: id.into(),
            name: format!("companion-{id}"),
            image: "companion-dev:latest".into(),
            ports: HashMap::from([(3000u16, 49153u16)]),
            host_cwd: "/home/u/p".into(),
            container_cwd: CONTAINER_CWD.into(),
            state: ContainerState::Running,
        }
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_port() {
        let _guard = crate::test_data_dir();
        let runtime = ContainerRuntime::new();
        let config = ContainerConfig {
            image: "img".into(),
            ports: vec![70000],
            ..Default::default()
        };
        let err = runtime.create("s1", "/tmp", &config).await.unwrap_err();
        assert!(matches!(err, ContainerError::InvalidPort(70000)));
    }

    #[test]
    fn retrack_rekeys_handle() {
        let _guard = crate::test_data_dir();
        let runtime = ContainerRuntime::new();
        runtime.tracked.insert("pending".into(), handle("c1"));
        runtime.retrack("pending", "real-session");
        assert!(runtime.handle_for_session("pending").is_none());
        assert_eq!(runtime.handle_for_session("real-session").unwrap().id, "c1");
    }

    #[test]
    fn persist_skips_removed_handles() {
        let _guard = crate::test_data_dir();
        let runtime = ContainerRuntime::new();
        runtime.tracked.insert("a".into(), handle("c1"));
        let mut gone = handle("c2");
        gone.state = ContainerState::Removed;
        runtime.tracked.insert("b".into(), gone);
        runtime.flush();

        let persisted: HashMap<String, ContainerHandle> =
            persist::read_json_or_default(&paths::containers_path());
        assert!(persisted.contains_key("a"));
        assert!(!persisted.contains_key("b"));
    }

    #[test]
    fn handle_serialization_round_trip() {
        let h = handle("c1");
        let json = serde_json::to_string(&h).unwrap();
        let back: ContainerHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, h.id);
        assert_eq!(back.ports.get(&3000), Some(&49153));
        assert_eq!(back.state, ContainerState::Running);
    }
}
