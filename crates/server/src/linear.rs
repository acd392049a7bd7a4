//! Repo-root → Linear team mapping store.
//!
//! The Linear integration itself lives outside the core; this is only the
//! persisted mapping it reads. Repo roots are normalized (no trailing
//! slash) and `createdAt` survives updates.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::persist;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMapping {
    pub repo_root: String,
    pub team_id: String,
    pub team_key: String,
    pub team_name: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct LinearProjects {
    mappings: Mutex<Vec<ProjectMapping>>,
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl LinearProjects {
    /// Load the mapping file; invalid JSON reads as an empty list.
    pub fn load() -> Self {
        Self {
            mappings: Mutex::new(persist::read_json_or_default(
                &paths::linear_projects_path(),
            )),
        }
    }

    pub fn get(&self, repo_root: &str) -> Option<ProjectMapping> {
        let root = normalize_root(repo_root);
        self.mappings
            .lock()
            .expect("linear store poisoned")
            .iter()
            .find(|m| m.repo_root == root)
            .cloned()
    }

    pub fn list(&self) -> Vec<ProjectMapping> {
        self.mappings.lock().expect("linear store poisoned").clone()
    }

    /// Insert or update a mapping; `createdAt` is preserved on update.
    pub fn upsert(&self, repo_root: &str, team_id: &str, team_key: &str, team_name: &str) {
        let root = normalize_root(repo_root);
        let now = companion_protocol::now_iso();
        let mut mappings = self.mappings.lock().expect("linear store poisoned");

        if let Some(existing) = mappings.iter_mut().find(|m| m.repo_root == root) {
            existing.team_id = team_id.to_string();
            existing.team_key = team_key.to_string();
            existing.team_name = team_name.to_string();
            existing.updated_at = now;
        } else {
            mappings.push(ProjectMapping {
                repo_root: root,
                team_id: team_id.to_string(),
                team_key: team_key.to_string(),
                team_name: team_name.to_string(),
                created_at: now.clone(),
                updated_at: now,
            });
        }
        self.flush(&mappings);
    }

    pub fn remove(&self, repo_root: &str) -> bool {
        let root = normalize_root(repo_root);
        let mut mappings = self.mappings.lock().expect("linear store poisoned");
        let before = mappings.len();
        mappings.retain(|m| m.repo_root != root);
        let removed = mappings.len() != before;
        if removed {
            self.flush(&mappings);
        }
        removed
    }

    fn flush(&self, mappings: &[ProjectMapping]) {
        if let Err(e) = persist::write_json(&paths::linear_projects_path(), &mappings) {
            tracing::warn!(
                component = "linear_projects",
                event = "linear_projects.flush_error",
                error = %e,
                "Failed to persist project mappings"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_normalizes_trailing_slash() {
        let _guard = crate::test_data_dir();
        let store = LinearProjects::load();
        store.upsert("/home/u/proj/", "t1", "ENG", "Engineering");
        let mapping = store.get("/home/u/proj").unwrap();
        assert_eq!(mapping.repo_root, "/home/u/proj");
        assert_eq!(mapping.team_key, "ENG");
        // Lookup with the slash also resolves
        assert!(store.get("/home/u/proj/").is_some());
    }

    #[test]
    fn update_preserves_created_at() {
        let _guard = crate::test_data_dir();
        let store = LinearProjects::load();
        store.upsert("/home/u/proj", "t1", "ENG", "Engineering");
        let created = store.get("/home/u/proj").unwrap().created_at;

        store.upsert("/home/u/proj", "t2", "OPS", "Operations");
        let mapping = store.get("/home/u/proj").unwrap();
        assert_eq!(mapping.created_at, created);
        assert_eq!(mapping.team_id, "t2");
    }

    #[test]
    fn invalid_file_reads_as_empty() {
        let _guard = crate::test_data_dir();
        std::fs::write(paths::linear_projects_path(), "not json at all").unwrap();
        let store = LinearProjects::load();
        assert!(store.list().is_empty());
    }

    #[test]
    fn remove_round_trip() {
        let _guard = crate::test_data_dir();
        let store = LinearProjects::load();
        store.upsert("/a", "t1", "A", "Alpha");
        assert!(store.remove("/a/"));
        assert!(!store.remove("/a"));
        assert!(store.get("/a").is_none());
    }
}
