//! User settings — a small flat record of external API keys and preferences.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::paths;
use crate::persist;

pub struct Settings {
    values: Mutex<BTreeMap<String, Value>>,
}

impl Settings {
    pub fn load() -> Self {
        Self {
            values: Mutex::new(persist::read_json_or_default(&paths::settings_path())),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .expect("settings poisoned")
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut values = self.values.lock().expect("settings poisoned");
        if value.is_null() {
            values.remove(key);
        } else {
            values.insert(key.to_string(), value);
        }
        if let Err(e) = persist::write_json(&paths::settings_path(), &*values) {
            tracing::warn!(
                component = "settings",
                event = "settings.flush_error",
                error = %e,
                "Failed to persist settings"
            );
        }
    }

    pub fn all(&self) -> BTreeMap<String, Value> {
        self.values.lock().expect("settings poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_and_null_removes() {
        let _guard = crate::test_data_dir();
        let settings = Settings::load();
        settings.set("linearApiKey", json!("lin_123"));
        assert_eq!(settings.get("linearApiKey"), Some(json!("lin_123")));

        settings.set("linearApiKey", Value::Null);
        assert_eq!(settings.get("linearApiKey"), None);
    }
}
