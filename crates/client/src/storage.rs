//! Session persistence.
//!
//! Values are stored as JSON files in a directory, by default the platform
//! config directory:
//!   - Linux: `~/.config/inbox-client/`
//!   - macOS: `~/Library/Application Support/inbox-client/`
//!   - Windows: `%APPDATA%\inbox-client\`

use std::path::{Path, PathBuf};

use inbox_shared::Identity;
use serde::{de::DeserializeOwned, Serialize};

const APP_DIR: &str = "inbox-client";
const IDENTITY_KEY: &str = "session_identity";

#[derive(Debug, Clone)]
pub struct SessionStorage {
    dir: PathBuf,
}

impl SessionStorage {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage under the platform config directory, if there is one.
    pub fn default_location() -> Option<Self> {
        Some(Self::in_dir(dirs::config_dir()?.join(APP_DIR)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a value to persistent storage.
    ///
    /// Returns `true` if the operation succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.save_raw(key, &json),
            Err(e) => {
                crate::log_warn!("Failed to serialize {}: {}", key, e);
                false
            }
        }
    }

    /// Load a value from persistent storage.
    ///
    /// Returns `None` if the key doesn't exist or deserialization fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = self.load_raw(key)?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                crate::log_warn!("Ignoring unreadable {}: {}", key, e);
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Some(path) = self.file_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).is_some_and(|path| path.exists())
    }

    pub fn save_identity(&self, identity: &Identity) -> bool {
        self.save(IDENTITY_KEY, identity)
    }

    pub fn load_identity(&self) -> Option<Identity> {
        self.load(IDENTITY_KEY)
    }

    pub fn clear_identity(&self) {
        self.remove(IDENTITY_KEY);
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        if key.is_empty() {
            return None;
        }
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        Some(self.dir.join(format!("{}.json", safe_key)))
    }

    fn save_raw(&self, key: &str, value: &str) -> bool {
        let Some(path) = self.file_path(key) else {
            return false;
        };
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            crate::log_warn!("Cannot create {}: {}", self.dir.display(), e);
            return false;
        }
        std::fs::write(path, value).is_ok()
    }

    fn load_raw(&self, key: &str) -> Option<String> {
        let path = self.file_path(key)?;
        std::fs::read_to_string(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::in_dir(dir.path().join("nested"));
        let identity = Identity::new("u1", "token-1").with_tenant("acme");

        assert!(storage.load_identity().is_none());
        assert!(storage.save_identity(&identity));
        assert_eq!(storage.load_identity(), Some(identity));

        storage.clear_identity();
        assert!(!storage.exists(IDENTITY_KEY));
    }

    #[test]
    fn keys_are_sanitized_and_garbage_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::in_dir(dir.path());

        assert!(storage.save("a/b:c", &1u32));
        assert!(dir.path().join("a_b_c.json").exists());

        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        assert_eq!(storage.load::<u32>("broken"), None);
    }
}
