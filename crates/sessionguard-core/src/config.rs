//! Application configuration management.
//!
//! Configuration is stored at `~/.config/sessionguard/config.json`. A missing
//! file yields the defaults; unknown fields are ignored.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::push::ActionLabels;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "sessionguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Vault file name inside the data directory
const STORE_FILE: &str = "session-store.json";

const DEFAULT_VERIFICATION_INTERVAL_MINUTES: u64 = 10;
const DEFAULT_STEP_UP_TTL_SECONDS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base_url: Option<String>,
    /// 0 disables periodic verification
    pub verification_interval_minutes: u64,
    pub step_up_ttl_seconds: u64,
    pub keyring_service: String,
    /// Enables the software-derived key when no OS keychain is usable
    pub device_secret: Option<String>,
    pub approve_labels: Vec<String>,
    pub deny_labels: Vec<String>,
    pub storage_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            verification_interval_minutes: DEFAULT_VERIFICATION_INTERVAL_MINUTES,
            step_up_ttl_seconds: DEFAULT_STEP_UP_TTL_SECONDS,
            keyring_service: APP_NAME.to_string(),
            device_secret: None,
            approve_labels: vec!["Approve".to_string()],
            deny_labels: vec!["Deny".to_string()],
            storage_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path()?)
    }

    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Where the vault and verifier state live
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STORE_FILE))
    }

    pub fn verification_interval(&self) -> Duration {
        Duration::from_secs(self.verification_interval_minutes.saturating_mul(60))
    }

    pub fn step_up_ttl(&self) -> Duration {
        Duration::from_secs(self.step_up_ttl_seconds)
    }

    pub fn action_labels(&self) -> ActionLabels {
        ActionLabels::new(self.approve_labels.clone(), self.deny_labels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushAction;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load_from(dir.path().join("nope.json")).unwrap();
        assert_eq!(config.verification_interval(), Duration::from_secs(600));
        assert_eq!(config.step_up_ttl(), Duration::from_secs(120));
        assert_eq!(config.keyring_service, APP_NAME);
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = SessionConfig {
            verification_interval_minutes: 0,
            deny_labels: vec!["Ablehnen".to_string()],
            storage_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        config.save_to(path.clone()).unwrap();

        let loaded = SessionConfig::load_from(path).unwrap();
        assert!(loaded.verification_interval().is_zero());
        assert_eq!(loaded.action_labels().resolve("Ablehnen"), Some(PushAction::Deny));
        assert_eq!(loaded.store_path().unwrap(), dir.path().join(STORE_FILE));

        std::fs::write(dir.path().join("partial.json"), r#"{"step_up_ttl_seconds": 30}"#).unwrap();
        let partial = SessionConfig::load_from(dir.path().join("partial.json")).unwrap();
        assert_eq!(partial.step_up_ttl(), Duration::from_secs(30));
        assert_eq!(partial.approve_labels, vec!["Approve".to_string()]);
    }
}
