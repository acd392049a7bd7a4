//! Session creation pipeline.
//!
//! Ordered, resumable-by-relaunch sequence: env → git → image → container →
//! workspace → init script → CLI launch. Each step reports progress through
//! one `ProgressReporter`; the first `error` terminates the pipeline and
//! rolls back side effects created after the failing step (the container is
//! removed, the worktree is left in place). There are no retries — callers
//! relaunch the whole pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use companion_protocol::{BackendKind, PipelineStep, SessionDescriptor, StepStatus};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use companion_connectors::codex::CONTAINER_APP_SERVER_PORT;
use companion_connectors::{spawn_adapter, LaunchSpec};

use crate::container::{ContainerConfig, CONTAINER_CWD};
use crate::git::EnsureWorktreeOptions;
use crate::images::PULL_DEADLINE;
use crate::state::Daemon;
use crate::store::SessionRecord;

/// Port the in-container editor listens on; always published.
const EDITOR_PORT: u32 = 3456;

const INIT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Transport-agnostic progress sink. Implementations map this onto a single
/// buffered JSON response (first error wins) or a stream of SSE events.
pub trait ProgressReporter: Send + Sync {
    fn progress(&self, step: PipelineStep, label: &str, status: StepStatus, detail: Option<String>);
    fn error(&self, message: &str, http_status: u16, step: Option<PipelineStep>);
}

/// Terminal pipeline failure.
#[derive(Debug)]
pub struct StepError {
    pub step: Option<PipelineStep>,
    pub message: String,
    pub http_status: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionRequest {
    pub backend: String,
    pub cwd: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub branch: Option<String>,
    pub use_worktree: bool,
    pub create_branch: bool,
    pub base_branch: Option<String>,
    /// Named environment profile from settings.
    pub environment: Option<String>,
    // Per-request profile overrides
    pub image: Option<String>,
    pub ports: Vec<u32>,
    pub volumes: HashMap<String, String>,
    pub init_script: Option<String>,
    pub env: HashMap<String, String>,
    pub resume: Option<String>,
    pub fork_session: bool,
}

/// Effective environment after merging the named profile with overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EnvProfile {
    image: Option<String>,
    ports: Vec<u32>,
    volumes: HashMap<String, String>,
    init_script: Option<String>,
    env: HashMap<String, String>,
}

struct Fail {
    step: PipelineStep,
    message: String,
    http_status: u16,
}

impl Fail {
    fn new(step: PipelineStep, message: impl Into<String>, http_status: u16) -> Self {
        Self {
            step,
            message: message.into(),
            http_status,
        }
    }
}

/// Run the whole pipeline. On success the session is registered and live.
pub async fn run(
    daemon: &Daemon,
    request: CreateSessionRequest,
    reporter: &dyn ProgressReporter,
) -> Result<SessionDescriptor, StepError> {
    match run_inner(daemon, request, reporter).await {
        Ok(descriptor) => Ok(descriptor),
        Err(fail) => {
            reporter.error(&fail.message, fail.http_status, Some(fail.step));
            Err(StepError {
                step: Some(fail.step),
                message: fail.message,
                http_status: fail.http_status,
            })
        }
    }
}

async fn run_inner(
    daemon: &Daemon,
    request: CreateSessionRequest,
    reporter: &dyn ProgressReporter,
) -> Result<SessionDescriptor, Fail> {
    let session_id = companion_protocol::new_id();
    let provisional = format!("pending-{session_id}");

    // 1. resolving_env
    step_start(reporter, PipelineStep::ResolvingEnv);
    let backend = Daemon::parse_backend(&request.backend).ok_or_else(|| {
        Fail::new(
            PipelineStep::ResolvingEnv,
            format!("unknown backend: {}", request.backend),
            400,
        )
    })?;
    if !Path::new(&request.cwd).is_dir() {
        return Err(Fail::new(
            PipelineStep::ResolvingEnv,
            format!("working directory does not exist: {}", request.cwd),
            400,
        ));
    }
    let profile = resolve_profile(daemon, &request);
    let containerized = profile.image.is_some();
    step_done(reporter, PipelineStep::ResolvingEnv);

    // 2. git — exactly one path; errors are logged and non-fatal.
    let mut launch_cwd = request.cwd.clone();
    let mut worktree_path: Option<String> = None;
    let mut branch_for_record: Option<String> = None;

    if request.use_worktree && request.branch.is_some() {
        let branch = request.branch.clone().unwrap_or_default();
        step_start(reporter, PipelineStep::CreatingWorktree);
        match daemon.git.repo_info(&request.cwd).await {
            Some(info) => {
                let opts = EnsureWorktreeOptions {
                    base_branch: request
                        .base_branch
                        .clone()
                        .or(Some(info.default_branch.clone())),
                    create_branch: request.create_branch,
                    force_new: false,
                };
                match daemon.git.ensure_worktree(&info.repo_root, &branch, &opts).await {
                    Ok((path, actual_branch)) => {
                        daemon.git.record_mapping(
                            &session_id,
                            crate::git::WorktreeMapping {
                                repo_root: info.repo_root,
                                branch: branch.clone(),
                                actual_branch: actual_branch.clone(),
                                worktree_path: path.clone(),
                                created_at: companion_protocol::now_iso(),
                            },
                        );
                        launch_cwd = path.clone();
                        worktree_path = Some(path);
                        branch_for_record = Some(actual_branch);
                        step_done(reporter, PipelineStep::CreatingWorktree);
                    }
                    Err(e) => {
                        warn!(
                            component = "pipeline",
                            event = "pipeline.worktree.failed",
                            error = %e,
                            "Worktree creation failed, continuing in place"
                        );
                        step_error(reporter, PipelineStep::CreatingWorktree, e.to_string());
                    }
                }
            }
            None => {
                step_error(
                    reporter,
                    PipelineStep::CreatingWorktree,
                    "not a git repository".to_string(),
                );
            }
        }
    } else if let Some(ref branch) = request.branch {
        step_start(reporter, PipelineStep::FetchingGit);
        if let Some(info) = daemon.git.repo_info(&request.cwd).await {
            let fetch = daemon.git.fetch(&info.repo_root).await;
            if fetch.success {
                step_done(reporter, PipelineStep::FetchingGit);
            } else {
                step_error(reporter, PipelineStep::FetchingGit, fetch.output);
            }

            step_start(reporter, PipelineStep::CheckoutBranch);
            match daemon
                .git
                .checkout_or_create_branch(
                    &info.repo_root,
                    branch,
                    request.create_branch,
                    &info.default_branch,
                )
                .await
            {
                Ok(()) => {
                    branch_for_record = Some(branch.clone());
                    step_done(reporter, PipelineStep::CheckoutBranch);
                }
                Err(e) => step_error(reporter, PipelineStep::CheckoutBranch, e.to_string()),
            }

            step_start(reporter, PipelineStep::PullingGit);
            let pull = daemon.git.pull(&info.repo_root).await;
            if pull.success {
                step_done(reporter, PipelineStep::PullingGit);
            } else {
                step_error(reporter, PipelineStep::PullingGit, pull.output);
            }
        } else {
            step_error(
                reporter,
                PipelineStep::FetchingGit,
                "not a git repository".to_string(),
            );
        }
    }

    // 3. pulling_image — only when a container image is required.
    if let Some(ref image) = profile.image {
        step_start(reporter, PipelineStep::PullingImage);
        if !daemon.images.is_ready(image) {
            daemon.images.ensure_image(image);
            let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
            daemon.images.on_progress(image, line_tx);
            let ready = tokio::select! {
                ready = daemon.images.wait_for_ready(image, PULL_DEADLINE) => ready,
                _ = async {
                    while let Some(line) = line_rx.recv().await {
                        reporter.progress(
                            PipelineStep::PullingImage,
                            PipelineStep::PullingImage.label(),
                            StepStatus::InProgress,
                            Some(line),
                        );
                    }
                    // Line stream closed; keep waiting on readiness.
                    std::future::pending::<()>().await;
                } => unreachable!(),
            };
            if !ready {
                return Err(Fail::new(
                    PipelineStep::PullingImage,
                    format!("image never became ready: {image}"),
                    503,
                ));
            }
        }
        step_done(reporter, PipelineStep::PullingImage);
    }

    // 4. creating_container
    let mut container = None;
    if containerized {
        step_start(reporter, PipelineStep::CreatingContainer);
        check_backend_auth(backend, &profile, &request).map_err(|msg| {
            Fail::new(PipelineStep::CreatingContainer, msg, 400)
        })?;

        let mut ports = profile.ports.clone();
        ports.push(EDITOR_PORT);
        if backend == BackendKind::Codex {
            ports.push(CONTAINER_APP_SERVER_PORT as u32);
        }
        ports.sort_unstable();
        ports.dedup();

        let config = ContainerConfig {
            image: profile.image.clone().unwrap_or_default(),
            ports,
            volumes: profile.volumes.iter().map(|(h, c)| (h.clone(), c.clone())).collect(),
            env: merged_env(&profile, &request),
        };
        let handle = daemon
            .containers
            .create(&provisional, &launch_cwd, &config)
            .await
            .map_err(|e| Fail::new(PipelineStep::CreatingContainer, e.to_string(), 500))?;
        step_done(reporter, PipelineStep::CreatingContainer);
        container = Some(handle);
    }

    // 5. copying_workspace — verify the mount and reseed git auth.
    if let Some(ref handle) = container {
        step_start(reporter, PipelineStep::CopyingWorkspace);
        let visible = daemon
            .containers
            .exec(
                &handle.id,
                &["ls", CONTAINER_CWD],
                crate::container::QUICK_EXEC_TIMEOUT,
            )
            .await;
        if let Err(e) = visible {
            daemon.containers.remove(&provisional).await;
            return Err(Fail::new(
                PipelineStep::CopyingWorkspace,
                format!("workspace not visible in container: {e}"),
                500,
            ));
        }
        if let Some(home) = dirs::home_dir() {
            let gitconfig = home.join(".gitconfig");
            if gitconfig.exists() {
                let _ = daemon
                    .containers
                    .copy_in(&handle.id, &gitconfig.to_string_lossy(), "/root/.gitconfig")
                    .await;
            }
        }
        step_done(reporter, PipelineStep::CopyingWorkspace);
    }

    // 6. running_init_script
    if let (Some(handle), Some(script)) = (container.as_ref(), profile.init_script.as_ref()) {
        step_start(reporter, PipelineStep::RunningInitScript);
        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        let init_cmd = ["/bin/sh", "-lc", script.as_str()];
        let exec = daemon.containers.exec_streaming(
            &handle.id,
            &init_cmd,
            INIT_SCRIPT_TIMEOUT,
            line_tx,
        );
        let forward = async {
            while let Some(line) = line_rx.recv().await {
                reporter.progress(
                    PipelineStep::RunningInitScript,
                    PipelineStep::RunningInitScript.label(),
                    StepStatus::InProgress,
                    Some(line),
                );
            }
        };
        let (outcome, ()) = tokio::join!(exec, forward);
        match outcome {
            Ok(result) if result.exit_code == 0 => {
                step_done(reporter, PipelineStep::RunningInitScript);
            }
            Ok(result) => {
                daemon.containers.remove(&provisional).await;
                return Err(Fail::new(
                    PipelineStep::RunningInitScript,
                    format!(
                        "init script exited with code {}: {}",
                        result.exit_code,
                        truncate_output(&result.combined_output)
                    ),
                    500,
                ));
            }
            Err(e) => {
                daemon.containers.remove(&provisional).await;
                return Err(Fail::new(
                    PipelineStep::RunningInitScript,
                    format!("init script failed: {e}"),
                    500,
                ));
            }
        }
    }

    // 7. launching_cli
    step_start(reporter, PipelineStep::LaunchingCli);
    let mut spec = LaunchSpec {
        cwd: launch_cwd.clone(),
        model: request.model.clone(),
        permission_mode: request.permission_mode.clone(),
        allowed_tools: request.allowed_tools.clone(),
        env: merged_env(&profile, &request),
        resume: request.resume.clone(),
        fork_session: request.fork_session,
        wrapper: Vec::new(),
        app_server_port: None,
    };
    if let Some(ref handle) = container {
        let bin = std::env::var("COMPANION_CONTAINER_BIN").unwrap_or_else(|_| "docker".into());
        spec.wrapper = vec![
            bin,
            "exec".into(),
            "-i".into(),
            "-w".into(),
            CONTAINER_CWD.into(),
            handle.id.clone(),
        ];
        if backend == BackendKind::Codex {
            // Host side of the published container:4500 mapping; the
            // adapter dials this while the child listens on 4500 inside.
            spec.app_server_port = handle.ports.get(&CONTAINER_APP_SERVER_PORT).copied();
        }
    } else if backend == BackendKind::Codex {
        spec.app_server_port = Some(free_local_port().map_err(|e| {
            Fail::new(PipelineStep::LaunchingCli, e.to_string(), 500)
        })?);
    }

    let adapter = match spawn_adapter(backend, spec).await {
        Ok(adapter) => adapter,
        Err(e) => {
            if container.is_some() {
                daemon.containers.remove(&provisional).await;
            }
            return Err(Fail::new(PipelineStep::LaunchingCli, e.to_string(), 503));
        }
    };

    // 8. Post-launch bookkeeping under the real session id.
    if container.is_some() {
        daemon.containers.retrack(&provisional, &session_id);
    }
    let mut record = SessionRecord::new(session_id.clone(), backend, request.cwd.clone());
    record.model = request.model.clone();
    record.permission_mode = request.permission_mode.clone();
    record.git_branch = branch_for_record;
    record.worktree_path = worktree_path;
    if let Some(ref handle) = container {
        record.container_id = Some(handle.id.clone());
        record.container_name = Some(handle.name.clone());
        record.container_image = Some(handle.image.clone());
    }
    let descriptor = record.descriptor(true);
    daemon.register_live_session(record, adapter, containerized);
    step_done(reporter, PipelineStep::LaunchingCli);

    info!(
        component = "pipeline",
        event = "pipeline.session.created",
        session_id = %session_id,
        backend = %backend.as_str(),
        containerized = containerized,
        "Session created"
    );
    Ok(descriptor)
}

fn resolve_profile(daemon: &Daemon, request: &CreateSessionRequest) -> EnvProfile {
    let mut profile = request
        .environment
        .as_ref()
        .and_then(|name| {
            daemon
                .settings
                .get("environments")
                .and_then(|envs| envs.get(name).cloned())
        })
        .and_then(|value| serde_json::from_value::<EnvProfile>(value).ok())
        .unwrap_or_default();

    // Per-request overrides win over the named profile.
    if request.image.is_some() {
        profile.image = request.image.clone();
    }
    if !request.ports.is_empty() {
        profile.ports = request.ports.clone();
    }
    for (host, container) in &request.volumes {
        profile.volumes.insert(host.clone(), container.clone());
    }
    if request.init_script.is_some() {
        profile.init_script = request.init_script.clone();
    }
    for (key, value) in &request.env {
        profile.env.insert(key.clone(), value.clone());
    }
    profile
}

fn merged_env(profile: &EnvProfile, request: &CreateSessionRequest) -> Vec<(String, String)> {
    let mut env: HashMap<String, String> = profile.env.clone();
    for (key, value) in &request.env {
        env.insert(key.clone(), value.clone());
    }
    let mut pairs: Vec<(String, String)> = env.into_iter().collect();
    pairs.sort();
    pairs
}

/// Backend auth materials must be reachable from the container.
fn check_backend_auth(
    backend: BackendKind,
    profile: &EnvProfile,
    request: &CreateSessionRequest,
) -> Result<(), String> {
    let has_env = |key: &str| {
        profile.env.contains_key(key)
            || request.env.contains_key(key)
            || std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false)
    };
    let home = dirs::home_dir().unwrap_or_default();
    match backend {
        BackendKind::Claude => {
            if has_env("ANTHROPIC_API_KEY") || home.join(".claude/.credentials.json").exists() {
                Ok(())
            } else {
                Err("no Claude auth available to the container: set ANTHROPIC_API_KEY \
                     or sign in so ~/.claude/.credentials.json exists"
                    .into())
            }
        }
        BackendKind::Codex => {
            if has_env("OPENAI_API_KEY") || home.join(".codex/auth.json").exists() {
                Ok(())
            } else {
                Err("no Codex auth available to the container: set OPENAI_API_KEY \
                     or sign in so ~/.codex/auth.json exists"
                    .into())
            }
        }
    }
}

fn free_local_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Long outputs keep the head and tail; the middle is elided.
pub fn truncate_output(output: &str) -> String {
    const LIMIT: usize = 2000;
    const HEAD: usize = 500;
    const TAIL: usize = 1500;
    if output.len() <= LIMIT {
        return output.to_string();
    }
    let head_end = output
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= HEAD)
        .last()
        .unwrap_or(0);
    let tail_start = output.len().saturating_sub(TAIL);
    let tail_start = output
        .char_indices()
        .map(|(i, _)| i)
        .find(|i| *i >= tail_start)
        .unwrap_or(output.len());
    format!("{}\n…\n{}", &output[..head_end], &output[tail_start..])
}

fn step_start(reporter: &dyn ProgressReporter, step: PipelineStep) {
    reporter.progress(step, step.label(), StepStatus::InProgress, None);
}

fn step_done(reporter: &dyn ProgressReporter, step: PipelineStep) {
    reporter.progress(step, step.label(), StepStatus::Done, None);
}

fn step_error(reporter: &dyn ProgressReporter, step: PipelineStep, detail: String) {
    reporter.progress(step, step.label(), StepStatus::Error, Some(detail));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_head_and_tail() {
        let long: String = (0..4000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let truncated = truncate_output(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains('…'));
        assert!(truncated.starts_with(&long[..100]));
        assert!(truncated.ends_with(&long[long.len() - 100..]));
    }

    #[test]
    fn short_output_untouched() {
        assert_eq!(truncate_output("fine"), "fine");
    }

    #[test]
    fn profile_overrides_apply() {
        let request = CreateSessionRequest {
            image: Some("custom:latest".into()),
            ports: vec![8080],
            ..Default::default()
        };
        let mut profile = EnvProfile {
            image: Some("base:latest".into()),
            ports: vec![3000],
            ..Default::default()
        };
        // Inline merge mirror of resolve_profile's override block
        if request.image.is_some() {
            profile.image = request.image.clone();
        }
        if !request.ports.is_empty() {
            profile.ports = request.ports.clone();
        }
        assert_eq!(profile.image.as_deref(), Some("custom:latest"));
        assert_eq!(profile.ports, vec![8080]);
    }

    #[test]
    fn free_port_is_nonzero() {
        assert!(free_local_port().unwrap() > 0);
    }
}
