//! Persisted plugin state: enabled flags, configs, capability grants.
//!
//! Loaded once at boot; every mutation rewrites `plugins.json` atomically.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::paths;
use crate::persist;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStateFile {
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub grants: HashMap<String, HashMap<String, bool>>,
}

pub struct PluginState {
    file: Mutex<PluginStateFile>,
}

impl PluginState {
    pub fn load() -> Self {
        Self {
            file: Mutex::new(persist::read_json_or_default(&paths::plugins_path())),
        }
    }

    pub fn enabled(&self, id: &str) -> Option<bool> {
        self.file
            .lock()
            .expect("plugin state poisoned")
            .enabled
            .get(id)
            .copied()
    }

    pub fn config(&self, id: &str) -> Option<Value> {
        self.file
            .lock()
            .expect("plugin state poisoned")
            .config
            .get(id)
            .cloned()
    }

    pub fn grant(&self, id: &str, capability: &str) -> Option<bool> {
        self.file
            .lock()
            .expect("plugin state poisoned")
            .grants
            .get(id)
            .and_then(|caps| caps.get(capability))
            .copied()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) {
        let mut file = self.file.lock().expect("plugin state poisoned");
        file.enabled.insert(id.to_string(), enabled);
        Self::flush(&mut file);
    }

    pub fn set_config(&self, id: &str, config: Value) {
        let mut file = self.file.lock().expect("plugin state poisoned");
        file.config.insert(id.to_string(), config);
        Self::flush(&mut file);
    }

    pub fn set_grant(&self, id: &str, capability: &str, granted: bool) {
        let mut file = self.file.lock().expect("plugin state poisoned");
        file.grants
            .entry(id.to_string())
            .or_default()
            .insert(capability.to_string(), granted);
        Self::flush(&mut file);
    }

    fn flush(file: &mut PluginStateFile) {
        file.updated_at = companion_protocol::now_iso();
        if let Err(e) = persist::write_json(&paths::plugins_path(), &*file) {
            tracing::warn!(
                component = "plugin_state",
                event = "plugin_state.flush_error",
                error = %e,
                "Failed to persist plugin state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn persists_and_reloads() {
        let _guard = crate::test_data_dir();
        {
            let state = PluginState::load();
            state.set_enabled("p1", false);
            state.set_config("p1", json!({"k": 1}));
            state.set_grant("p1", "permission:auto-decide", false);
        }
        let state = PluginState::load();
        assert_eq!(state.enabled("p1"), Some(false));
        assert_eq!(state.config("p1"), Some(json!({"k": 1})));
        assert_eq!(state.grant("p1", "permission:auto-decide"), Some(false));
        assert_eq!(state.grant("p1", "insight:toast"), None);
    }

    #[test]
    fn corrupt_file_is_empty_state() {
        let _guard = crate::test_data_dir();
        std::fs::write(paths::plugins_path(), "][").unwrap();
        let state = PluginState::load();
        assert_eq!(state.enabled("anything"), None);
    }
}
