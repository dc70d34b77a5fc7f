//! Configuration service for dependency injection and test isolation.
//!
//! Components never read `config/config.json` themselves; they hold an
//! `Arc<dyn ConfigService>` and ask for a snapshot at the point of use.
//! The production service caches one [`Config`] and replaces it wholesale
//! on `reload`, so concurrent readers always observe a consistent view.

use crate::config::{AppPaths, Config};
use crate::{Result, error::RetubeError};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Configuration service trait for dependency injection.
pub trait ConfigService: Send + Sync {
    /// Get the current configuration snapshot.
    fn get_config(&self) -> Result<Config>;

    /// Force a reload from the backing store, discarding the cache.
    fn reload(&self) -> Result<()>;

    /// Get a raw value by its flat store key.
    fn get_value(&self, key: &str) -> Option<Value>;

    /// Set a raw value by its flat store key and persist the store.
    ///
    /// The typed snapshot is rebuilt immediately, so the next
    /// `get_config` observes the change (e.g. a new task-permit cap is
    /// honored by the next scheduling decision).
    fn set_value(&self, key: &str, value: Value) -> Result<()>;
}

/// Production configuration service backed by the key/value JSON file.
///
/// Unknown keys in the file are preserved verbatim on save; the typed
/// snapshot only covers the keys the engine understands.
pub struct ProductionConfigService {
    config_path: PathBuf,
    state: RwLock<StoreState>,
}

struct StoreState {
    raw: Map<String, Value>,
    snapshot: Config,
}

impl ProductionConfigService {
    /// Create a service reading `config/config.json` under the app root.
    ///
    /// A missing file is not an error; it reads as an empty store and is
    /// created on first save.
    pub fn new(paths: &AppPaths) -> Result<Self> {
        Self::with_path(paths.config_file())
    }

    /// Create a service over an explicit file path.
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let raw = Self::read_store(&config_path)?;
        let snapshot = Config::from_kv(&raw);
        debug!(
            "Loaded config store from {:?} ({} keys)",
            config_path,
            raw.len()
        );
        Ok(Self {
            config_path,
            state: RwLock::new(StoreState { raw, snapshot }),
        })
    }

    fn read_store(path: &PathBuf) -> Result<Map<String, Value>> {
        if !path.exists() {
            info!("Config file {:?} not found, using defaults", path);
            return Ok(Map::new());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => {
                warn!("Config file {:?} is not a JSON object, ignoring", path);
                Ok(Map::new())
            }
            Err(e) => Err(RetubeError::config(format!(
                "Failed to parse config file {:?}: {}",
                path, e
            ))),
        }
    }

    fn write_store(&self, raw: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&Value::Object(raw.clone()))?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }
}

impl ConfigService for ProductionConfigService {
    fn get_config(&self) -> Result<Config> {
        let state = self
            .state
            .read()
            .map_err(|_| RetubeError::config("config lock poisoned"))?;
        Ok(state.snapshot.clone())
    }

    fn reload(&self) -> Result<()> {
        let raw = Self::read_store(&self.config_path)?;
        let snapshot = Config::from_kv(&raw);
        let mut state = self
            .state
            .write()
            .map_err(|_| RetubeError::config("config lock poisoned"))?;
        state.raw = raw;
        state.snapshot = snapshot;
        info!("Configuration reloaded from {:?}", self.config_path);
        Ok(())
    }

    fn get_value(&self, key: &str) -> Option<Value> {
        self.state.read().ok()?.raw.get(key).cloned()
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| RetubeError::config("config lock poisoned"))?;
        state.raw.insert(key.to_string(), value);
        state.snapshot = Config::from_kv(&state.raw);
        self.write_store(&state.raw)?;
        debug!("Config key {} updated", key);
        Ok(())
    }
}

/// Test configuration service holding a fixed snapshot in memory.
pub struct TestConfigService {
    state: RwLock<StoreState>,
}

impl TestConfigService {
    /// Create a test service around an explicit configuration.
    pub fn new(config: Config) -> Self {
        Self {
            state: RwLock::new(StoreState {
                raw: Map::new(),
                snapshot: config,
            }),
        }
    }

    /// Create a test service with all defaults.
    pub fn with_defaults() -> Self {
        Self::new(Config::default())
    }

    /// Convenience constructor returning an `Arc<dyn ConfigService>`.
    pub fn arc(config: Config) -> Arc<dyn ConfigService> {
        Arc::new(Self::new(config))
    }
}

impl ConfigService for TestConfigService {
    fn get_config(&self) -> Result<Config> {
        Ok(self
            .state
            .read()
            .map_err(|_| RetubeError::config("config lock poisoned"))?
            .snapshot
            .clone())
    }

    fn reload(&self) -> Result<()> {
        Ok(())
    }

    fn get_value(&self, key: &str) -> Option<Value> {
        self.state.read().ok()?.raw.get(key).cloned()
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| RetubeError::config("config lock poisoned"))?;
        state.raw.insert(key.to_string(), value);
        state.snapshot = Config::from_kv(&state.raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let service =
            ProductionConfigService::with_path(dir.path().join("config.json")).unwrap();
        let config = service.get_config().unwrap();
        assert_eq!(config.concurrency.max_concurrent_tasks, 3);
    }

    #[test]
    fn test_set_value_persists_and_rebuilds_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let service = ProductionConfigService::with_path(path.clone()).unwrap();
        service
            .set_value("MAX_CONCURRENT_TASKS", json!("7"))
            .unwrap();
        assert_eq!(
            service.get_config().unwrap().concurrency.max_concurrent_tasks,
            7
        );

        // A second service over the same file observes the persisted value.
        let reloaded = ProductionConfigService::with_path(path).unwrap();
        assert_eq!(
            reloaded.get_config().unwrap().concurrency.max_concurrent_tasks,
            7
        );
    }

    #[test]
    fn test_unknown_keys_preserved_on_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"CUSTOM_UI_THEME": "dark"}"#).unwrap();
        let service = ProductionConfigService::with_path(path.clone()).unwrap();
        service.set_value("TRANSLATE_TITLE", json!("off")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("CUSTOM_UI_THEME"));
        assert!(!service.get_config().unwrap().features.translate_title);
    }

    #[test]
    fn test_reload_discards_in_memory_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"MAX_CONCURRENT_TASKS": 2}"#).unwrap();
        let service = ProductionConfigService::with_path(path.clone()).unwrap();
        assert_eq!(
            service.get_config().unwrap().concurrency.max_concurrent_tasks,
            2
        );
        std::fs::write(&path, r#"{"MAX_CONCURRENT_TASKS": 9}"#).unwrap();
        service.reload().unwrap();
        assert_eq!(
            service.get_config().unwrap().concurrency.max_concurrent_tasks,
            9
        );
    }
}
