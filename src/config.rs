use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Top-level fstore.toml configuration
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    store: StoreConfig,
}

/// How the process opens its sled database. The store itself never opens or
/// closes the handle; whoever owns this config does, once per process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default = "default_flush_on_write")]
    pub flush_on_write: bool,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,
    /// Background flush interval; `None` leaves sled's default in place.
    #[serde(default)]
    pub flush_every_ms: Option<u64>,
}

// ── Default value functions ──────────────────────────

fn default_path() -> PathBuf {
    PathBuf::from("./data/features.db")
}

fn default_flush_on_write() -> bool {
    true
}

fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            flush_on_write: default_flush_on_write(),
            cache_capacity_bytes: default_cache_capacity(),
            flush_every_ms: None,
        }
    }
}

impl StoreConfig {
    /// Load the `[store]` section of a TOML file. A missing file yields the
    /// defaults; a file that does not parse is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Self::from_toml(&content)
            .map_err(|e| StoreError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str::<ConfigFile>(content).map(|file| file.store)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // FSTORE_PATH
        if let Ok(val) = env::var("FSTORE_PATH") {
            if !val.trim().is_empty() {
                self.path = PathBuf::from(val.trim());
            }
        }

        // FSTORE_FLUSH_ON_WRITE
        if let Ok(val) = env::var("FSTORE_FLUSH_ON_WRITE") {
            self.flush_on_write = match val.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(StoreError::Config(format!(
                        "invalid FSTORE_FLUSH_ON_WRITE value: {}",
                        other
                    )))
                }
            };
        }

        Ok(())
    }

    /// Open the sled database described by this config, creating the parent
    /// directory if needed.
    pub fn open_db(&self) -> Result<sled::Db> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut config = sled::Config::new()
            .path(&self.path)
            .cache_capacity(self.cache_capacity_bytes);
        if let Some(ms) = self.flush_every_ms {
            config = config.flush_every_ms(Some(ms));
        }

        tracing::info!(path = %self.path.display(), "opening feature store database");
        Ok(config.open()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    // the process environment is shared by every test thread
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var("FSTORE_PATH");
        env::remove_var("FSTORE_FLUSH_ON_WRITE");
    }

    #[test]
    fn test_env_overrides_apply() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        clear_env();
        env::set_var("FSTORE_PATH", " /tmp/flags/store.db ");
        env::set_var("FSTORE_FLUSH_ON_WRITE", "No");

        let mut config = StoreConfig::default();
        let result = config.apply_env_overrides();
        clear_env();

        result.unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/flags/store.db"));
        assert!(!config.flush_on_write);
    }

    #[test]
    fn test_env_overrides_absent_leave_config_alone() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        clear_env();
        env::set_var("FSTORE_PATH", "   ");

        let mut config = StoreConfig {
            flush_on_write: false,
            ..StoreConfig::default()
        };
        let result = config.apply_env_overrides();
        clear_env();

        result.unwrap();
        assert_eq!(config.path, default_path());
        assert!(!config.flush_on_write);
    }

    #[test]
    fn test_env_override_rejects_invalid_bool() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        clear_env();
        env::set_var("FSTORE_FLUSH_ON_WRITE", "maybe");

        let mut config = StoreConfig::default();
        let result = config.apply_env_overrides();
        clear_env();

        assert!(matches!(result, Err(StoreError::Config(ref msg)) if msg.contains("maybe")));
        assert!(config.flush_on_write);
    }

    #[test]
    fn test_defaults_when_section_missing() {
        let config = StoreConfig::from_toml("").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(config.flush_on_write);
        assert_eq!(config.flush_every_ms, None);
    }

    #[test]
    fn test_parse_store_section() {
        let config = StoreConfig::from_toml(
            r#"
[store]
path = "/var/lib/flags/store.db"
flush_on_write = false
flush_every_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.path, PathBuf::from("/var/lib/flags/store.db"));
        assert!(!config.flush_on_write);
        assert_eq!(config.flush_every_ms, Some(250));
        assert_eq!(config.cache_capacity_bytes, default_cache_capacity());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstore.toml");
        std::fs::write(&path, "[store\npath = ").unwrap();
        let err = StoreConfig::load(&path).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_open_db_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("nested").join("features.db"),
            ..StoreConfig::default()
        };
        let db = config.open_db().unwrap();
        assert!(dir.path().join("nested").is_dir());
        drop(db);
    }
}
