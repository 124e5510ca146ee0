use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::DuplicatePolicy;

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub extensions: ExtensionsConfig,

    /// Log filter directive, e.g. `info` or `kiln=debug,info`
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    /// Directory scanned for extension libraries
    #[serde(default = "default_extension_dir")]
    pub dir: PathBuf,

    /// Handling of a route name registered twice
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Warn when an extension's initialization runs longer than this (0 disables)
    #[serde(default = "default_init_warn_after_secs")]
    pub init_warn_after_secs: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_extension_dir() -> PathBuf {
    PathBuf::from("./plugin")
}

fn default_init_warn_after_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extensions: ExtensionsConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            dir: default_extension_dir(),
            duplicate_policy: DuplicatePolicy::default(),
            init_warn_after_secs: default_init_warn_after_secs(),
        }
    }
}

impl ExtensionsConfig {
    #[must_use]
    pub fn init_warn_after(&self) -> Duration {
        Duration::from_secs(self.init_warn_after_secs)
    }
}

impl Config {
    /// Load configuration from default location
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid YAML
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    /// Returns an error if serialization fails or the file cannot be written
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".kiln").join("config.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.extensions.dir, PathBuf::from("./plugin"));
        assert_eq!(config.extensions.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.extensions.init_warn_after(), Duration::from_secs(5));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
extensions:
  dir: /opt/media/plugins
  duplicate_policy: overwrite
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.extensions.dir, PathBuf::from("/opt/media/plugins"));
        assert_eq!(config.extensions.duplicate_policy, DuplicatePolicy::Overwrite);
        assert_eq!(config.extensions.init_warn_after_secs, 5);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.extensions.dir, PathBuf::from("./plugin"));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let yaml = "extensions:\n  duplicate_policy: merge\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = Config::default();
        config.extensions.init_warn_after_secs = 0;
        config.log_level = "debug".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.extensions.init_warn_after(), Duration::ZERO);
        assert_eq!(loaded.log_level, "debug");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(Config::load_from_file(dir.path().join("absent.yaml")).is_err());
    }
}
