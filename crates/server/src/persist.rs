//! Atomic JSON state-file I/O.
//!
//! Every state file is written to a temp sibling, fsynced, and renamed into
//! place. Corrupt or missing files read as the caller's default — a corrupt
//! index is an inconvenience, never a boot failure.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Write `value` to `path` atomically (tmp sibling + fsync + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_bytes(path, &json)
}

/// Atomic byte write with an optional file mode.
pub fn write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    write_bytes_with_mode(path, bytes, None)
}

pub fn write_bytes_with_mode(path: &Path, bytes: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(mode))?;
        }
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Read a JSON state file; missing or corrupt files return the default.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return T::default(),
    };
    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                component = "persist",
                event = "persist.corrupt_state_file",
                path = %path.display(),
                error = %e,
                "Treating corrupt state file as empty"
            );
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trips_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1u32);
        write_json(&path, &map).unwrap();
        let back: HashMap<String, u32> = read_json_or_default(&path);
        assert_eq!(back, map);
        // No tmp sibling left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        let back: HashMap<String, u32> = read_json_or_default(&path);
        assert!(back.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn mode_is_applied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write_bytes_with_mode(&path, b"{}", Some(0o600)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
