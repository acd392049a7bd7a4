//! Application state.
//!
//! Everything the daemon owns lives in one `Daemon` value constructed at
//! startup and passed down by reference — no module-level singletons. Live
//! sessions are bridge handles in a lock-free map; dormant sessions exist
//! only in the persisted store until relaunched.

use std::sync::Arc;

use companion_protocol::{BackendKind, EventPayload, SessionDescriptor};
use dashmap::DashMap;
use tracing::{info, warn};

use companion_connectors::Adapter;

use crate::auth::AuthGate;
use crate::bridge::{BridgeHandle, BridgeMsg};
use crate::container::ContainerRuntime;
use crate::git::GitRuntime;
use crate::images::ImagePullCoordinator;
use crate::linear::LinearProjects;
use crate::plugins::PluginBus;
use crate::processes::ProcessRegistry;
use crate::settings::Settings;
use crate::store::{SessionRecord, SessionStore};

pub struct Daemon {
    pub auth: Arc<AuthGate>,
    pub store: Arc<SessionStore>,
    pub settings: Arc<Settings>,
    pub linear: Arc<LinearProjects>,
    pub containers: Arc<ContainerRuntime>,
    pub git: Arc<GitRuntime>,
    pub images: Arc<ImagePullCoordinator>,
    pub plugins: Arc<PluginBus>,
    pub processes: Arc<ProcessRegistry>,
    /// URL browsers reach us on, for the pairing QR.
    pub external_url: String,

    bridges: DashMap<String, BridgeHandle>,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: AuthGate,
        store: SessionStore,
        settings: Settings,
        linear: LinearProjects,
        containers: ContainerRuntime,
        git: GitRuntime,
        images: ImagePullCoordinator,
        plugins: PluginBus,
        external_url: String,
    ) -> Self {
        Self {
            auth: Arc::new(auth),
            store: Arc::new(store),
            settings: Arc::new(settings),
            linear: Arc::new(linear),
            containers: Arc::new(containers),
            git: Arc::new(git),
            images: Arc::new(images),
            plugins: Arc::new(plugins),
            processes: Arc::new(ProcessRegistry::new()),
            external_url,
            bridges: DashMap::new(),
        }
    }

    pub fn bridge(&self, session_id: &str) -> Option<BridgeHandle> {
        self.bridges.get(session_id).map(|b| b.clone())
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.bridges
            .get(session_id)
            .map(|b| b.live_state().live)
            .unwrap_or(false)
    }

    pub fn descriptor(&self, record: &SessionRecord) -> SessionDescriptor {
        record.descriptor(self.is_live(&record.id))
    }

    /// Register a freshly created session: persist the record, spawn its
    /// bridge, and pump adapter events into the bridge inbox.
    pub fn register_live_session(
        &self,
        record: SessionRecord,
        adapter: Adapter,
        containerized: bool,
    ) -> BridgeHandle {
        let session_id = record.id.clone();
        let backend = record.backend;
        let host_cwd = record.cwd.clone();
        self.store.insert(record);

        let handle = BridgeHandle::spawn(
            session_id.clone(),
            backend,
            self.store.clone(),
            self.plugins.clone(),
            adapter.commands(),
            host_cwd,
            containerized,
        );
        self.pump_adapter(adapter, handle.clone());
        self.bridges.insert(session_id.clone(), handle.clone());
        info!(
            component = "daemon",
            event = "daemon.session.live",
            session_id = %session_id,
            backend = %backend.as_str(),
            "Session live"
        );
        handle
    }

    /// Attach a new adapter to an existing dormant or crashed session.
    pub async fn relaunch_session(
        &self,
        record: &SessionRecord,
        adapter: Adapter,
        containerized: bool,
    ) -> BridgeHandle {
        if let Some(handle) = self.bridge(&record.id) {
            // Bridge survived a backend crash — swap the command channel in.
            handle
                .send(BridgeMsg::AdapterAttached {
                    commands: adapter.commands(),
                })
                .await;
            self.pump_adapter(adapter, handle.clone());
            return handle;
        }

        let handle = BridgeHandle::spawn(
            record.id.clone(),
            record.backend,
            self.store.clone(),
            self.plugins.clone(),
            adapter.commands(),
            record.cwd.clone(),
            containerized,
        );
        self.pump_adapter(adapter, handle.clone());
        self.bridges.insert(record.id.clone(), handle.clone());
        handle
    }

    fn pump_adapter(&self, mut adapter: Adapter, handle: BridgeHandle) {
        let Some(mut events) = adapter.take_events() else {
            warn!(
                component = "daemon",
                event = "daemon.adapter.events_taken",
                session_id = %handle.session_id,
                "Adapter events already consumed"
            );
            return;
        };
        let processes = self.processes.clone();
        tokio::spawn(async move {
            while let Some(payload) = events.recv().await {
                // Backends announce long-running tasks out of band.
                if let EventPayload::SystemEvent {
                    ref subtype,
                    ref data,
                } = payload
                {
                    match subtype.as_str() {
                        "task_started" => {
                            if let (Some(task_id), Some(pid)) = (
                                data.get("task_id").and_then(|v| v.as_str()),
                                data.get("pid").and_then(|v| v.as_i64()),
                            ) {
                                processes.track(
                                    &handle.session_id,
                                    task_id,
                                    pid as i32,
                                    data.get("command")
                                        .and_then(|v| v.as_str())
                                        .map(String::from),
                                );
                            }
                        }
                        "task_ended" => {
                            if let Some(task_id) = data.get("task_id").and_then(|v| v.as_str()) {
                                processes.untrack(&handle.session_id, task_id);
                            }
                        }
                        _ => {}
                    }
                }
                handle.backend_event(payload).await;
            }
        });
    }

    /// Kill the session's backend and bridge. The record stays; the session
    /// becomes dormant and can be relaunched.
    pub async fn kill_session(&self, session_id: &str) -> bool {
        let Some((_, handle)) = self.bridges.remove(session_id) else {
            return false;
        };
        handle.kill().await;
        self.processes.kill_all(session_id).await;
        true
    }

    /// Broadcast a server-originated envelope to a session's subscribers.
    pub async fn broadcast(&self, session_id: &str, payload: EventPayload) {
        if let Some(handle) = self.bridge(session_id) {
            handle
                .send(BridgeMsg::Broadcast {
                    source: companion_protocol::EventSource::Routes,
                    payload,
                })
                .await;
        }
    }

    /// Archive: kill the backend, remove the container, clean the worktree
    /// when clean, mark archived.
    pub async fn archive_session(&self, session_id: &str) -> bool {
        let Some(record) = self.store.get(session_id) else {
            return false;
        };
        self.kill_session(session_id).await;
        self.containers.remove(session_id).await;

        if let Some(ref path) = record.worktree_path {
            if !self.store.worktree_in_use(path, session_id) {
                match self.git.remove_by_session(session_id, false).await {
                    Ok(removed) if !removed => {
                        info!(
                            component = "daemon",
                            event = "daemon.archive.worktree_dirty",
                            session_id = %session_id,
                            "Worktree dirty, left in place"
                        );
                    }
                    Err(e) => {
                        warn!(
                            component = "daemon",
                            event = "daemon.archive.worktree_error",
                            session_id = %session_id,
                            error = %e,
                            "Worktree cleanup failed"
                        );
                    }
                    _ => {}
                }
            }
        }

        self.store.update(session_id, |r| {
            r.archived = true;
            r.container_id = None;
            r.container_name = None;
            r.container_image = None;
        })
    }

    /// Delete: everything archive does, plus the record itself.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        if self.store.get(session_id).is_none() {
            return false;
        }
        self.archive_session(session_id).await;
        self.store.remove(session_id).is_some()
    }

    /// Daemon shutdown: cancel every session, then remove all containers.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.bridges.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.kill_session(&id).await;
        }
        self.containers.cleanup_all().await;
        info!(
            component = "daemon",
            event = "daemon.shutdown.complete",
            "All sessions cancelled and containers removed"
        );
    }

    /// Backend kind parsed from a request string.
    pub fn parse_backend(kind: &str) -> Option<BackendKind> {
        match kind {
            "claude" => Some(BackendKind::Claude),
            "codex" => Some(BackendKind::Codex),
            _ => None,
        }
    }
}
