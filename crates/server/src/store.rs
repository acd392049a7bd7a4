//! Persisted session index.
//!
//! The store keeps session *metadata* only — message bodies never survive a
//! daemon restart. Every mutation rewrites `sessions.json` atomically.

use std::collections::HashMap;
use std::sync::Mutex;

use companion_protocol::{BackendKind, ContainerInfo, SessionDescriptor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::paths;
use crate::persist;

/// One persisted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub backend: BackendKind,
    pub cwd: String,
    #[serde(default)]
    pub archived: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub ahead: u32,
    #[serde(default)]
    pub behind: u32,
    #[serde(default)]
    pub lines_added: u64,
    #[serde(default)]
    pub lines_removed: u64,
    #[serde(default)]
    pub num_turns: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub context_used_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    /// Backend-native session id, used for `--resume` on relaunch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
}

impl SessionRecord {
    pub fn new(id: String, backend: BackendKind, cwd: String) -> Self {
        Self {
            id,
            backend,
            cwd,
            archived: false,
            created_at: companion_protocol::now_iso(),
            name: None,
            model: None,
            permission_mode: None,
            git_branch: None,
            ahead: 0,
            behind: 0,
            lines_added: 0,
            lines_removed: 0,
            num_turns: 0,
            total_cost_usd: 0.0,
            context_used_percent: 0.0,
            container_id: None,
            container_name: None,
            container_image: None,
            worktree_path: None,
            backend_session_id: None,
        }
    }

    pub fn descriptor(&self, live: bool) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            backend: self.backend,
            cwd: self.cwd.clone(),
            archived: self.archived,
            created_at: self.created_at.clone(),
            name: self.name.clone(),
            model: self.model.clone(),
            permission_mode: self.permission_mode.clone(),
            git_branch: self.git_branch.clone(),
            ahead: self.ahead,
            behind: self.behind,
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
            num_turns: self.num_turns,
            total_cost_usd: self.total_cost_usd,
            context_used_percent: self.context_used_percent,
            container: self.container_id.as_ref().map(|id| ContainerInfo {
                id: id.clone(),
                name: self.container_name.clone().unwrap_or_default(),
                image: self.container_image.clone().unwrap_or_default(),
            }),
            worktree_path: self.worktree_path.clone(),
            live,
        }
    }
}

/// Mutex-guarded in-memory index, persisted atomically on every mutation.
pub struct SessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    /// Restore the index from `sessions.json`; corrupt files read as empty.
    pub fn load() -> Self {
        let records: Vec<SessionRecord> = persist::read_json_or_default(&paths::sessions_path());
        let count = records.len();
        let store = Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        };
        info!(
            component = "session_store",
            event = "session_store.loaded",
            session_count = count,
            "Restored session index"
        );
        store
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, record: SessionRecord) {
        let mut records = self.records.lock().expect("session store poisoned");
        records.insert(record.id.clone(), record);
        self.flush(&records);
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.records
            .lock()
            .expect("session store poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let records = self.records.lock().expect("session store poisoned");
        let mut list: Vec<SessionRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Apply `mutate` to a record and persist. Returns false when unknown.
    pub fn update<F: FnOnce(&mut SessionRecord)>(&self, id: &str, mutate: F) -> bool {
        let mut records = self.records.lock().expect("session store poisoned");
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        mutate(record);
        self.flush(&records);
        true
    }

    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        let mut records = self.records.lock().expect("session store poisoned");
        let removed = records.remove(id);
        if removed.is_some() {
            self.flush(&records);
        }
        removed
    }

    /// Non-archived sessions referencing `worktree_path`.
    pub fn worktree_in_use(&self, worktree_path: &str, excluding: &str) -> bool {
        let records = self.records.lock().expect("session store poisoned");
        records.values().any(|r| {
            r.id != excluding && !r.archived && r.worktree_path.as_deref() == Some(worktree_path)
        })
    }

    fn flush(&self, records: &HashMap<String, SessionRecord>) {
        let mut list: Vec<&SessionRecord> = records.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Err(e) = persist::write_json(&paths::sessions_path(), &list) {
            tracing::warn!(
                component = "session_store",
                event = "session_store.flush_error",
                error = %e,
                "Failed to persist session index"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(id.into(), BackendKind::Claude, "/tmp/p".into())
    }

    #[test]
    fn insert_get_update_remove() {
        let _guard = crate::test_data_dir();
        let store = SessionStore::empty();
        store.insert(record("s1"));
        assert!(store.get("s1").is_some());

        assert!(store.update("s1", |r| r.num_turns = 3));
        assert_eq!(store.get("s1").unwrap().num_turns, 3);

        assert!(!store.update("nope", |_| {}));
        assert!(store.remove("s1").is_some());
        assert!(store.get("s1").is_none());
    }

    #[test]
    fn worktree_in_use_ignores_archived_and_self() {
        let _guard = crate::test_data_dir();
        let store = SessionStore::empty();
        let mut a = record("a");
        a.worktree_path = Some("/wt/x".into());
        store.insert(a);

        assert!(store.worktree_in_use("/wt/x", "b"));
        assert!(!store.worktree_in_use("/wt/x", "a"));

        store.update("a", |r| r.archived = true);
        assert!(!store.worktree_in_use("/wt/x", "b"));
    }

    #[test]
    fn persists_and_reloads() {
        let _guard = crate::test_data_dir();
        {
            let store = SessionStore::empty();
            store.insert(record("s1"));
            store.insert(record("s2"));
        }
        let reloaded = SessionStore::load();
        assert_eq!(reloaded.list().len(), 2);
    }
}
