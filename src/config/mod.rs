use crate::models::UserConfig;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Default configuration directory, relative to the working directory.
pub const DEFAULT_CONFIG_DIR: &str = "DeltaForge Data";

/// File name of the user configuration inside the configuration directory.
pub const USER_CONFIG_FILE: &str = "DeltaForge Config.yaml";

/// Configuration manager for loading and saving the YAML user configuration.
///
/// The configuration directory also holds the logs and, unless configured
/// otherwise, the mod database (`pkg.db`).
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    user_config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing configuration files (e.g., "DeltaForge Data")
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            user_config_path: config_dir.join(USER_CONFIG_FILE),
            config_dir,
        })
    }

    /// Load the user configuration file.
    ///
    /// # Returns
    /// The loaded UserConfig, or default if file doesn't exist
    pub fn load_user_config(&self) -> Result<UserConfig> {
        if !self.user_config_path.exists() {
            tracing::warn!(
                "User config file not found at {}, using defaults",
                self.user_config_path
            );
            return Ok(UserConfig::default());
        }

        let file_contents = fs::read_to_string(&self.user_config_path)
            .with_context(|| format!("Failed to read user config: {}", self.user_config_path))?;

        // An empty file deserializes to null; treat it like a missing one.
        if file_contents.trim().is_empty() {
            return Ok(UserConfig::default());
        }

        let config: UserConfig = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse user config: {}", self.user_config_path))?;

        tracing::info!("Loaded user config from {}", self.user_config_path);
        Ok(config)
    }

    /// Save the user configuration file.
    ///
    /// # Arguments
    /// * `config` - The UserConfig to save
    pub fn save_user_config(&self, config: &UserConfig) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize user config to YAML")?;

        fs::write(&self.user_config_path, yaml_string)
            .with_context(|| format!("Failed to write user config: {}", self.user_config_path))?;

        tracing::info!("Saved user config to {}", self.user_config_path);
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn user_config_path(&self) -> &Utf8Path {
        &self.user_config_path
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> Utf8PathBuf {
        self.config_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(&config_path).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_create_config_manager_creates_dir() {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(root.join("nested/DeltaForge Data")).unwrap();

        assert!(manager.config_dir().is_dir());
        assert!(manager.user_config_path().ends_with(USER_CONFIG_FILE));
    }

    #[test]
    fn test_load_missing_user_config_gives_defaults() {
        let (manager, _temp_dir) = create_test_config_manager();
        let loaded = manager.load_user_config().unwrap();
        assert!(loaded.settings.enabled_mods.is_empty());
        assert_eq!(loaded.settings.tool_timeout, 900);
    }

    #[test]
    fn test_load_save_user_config() {
        let (manager, _temp_dir) = create_test_config_manager();

        let mut config = UserConfig::default();
        config.settings.game_path = "/games/DELTARUNE".to_string();
        config.settings.enable_mod("deltamod_b");
        config.settings.enable_mod("deltamod_a");
        manager.save_user_config(&config).unwrap();

        let loaded = manager.load_user_config().unwrap();
        assert_eq!(loaded.settings.game_path, "/games/DELTARUNE");
        let order: Vec<&str> = loaded
            .settings
            .enabled_mods
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(order, vec!["deltamod_b", "deltamod_a"]);
    }

    #[test]
    fn test_load_invalid_user_config_errors() {
        let (manager, _temp_dir) = create_test_config_manager();
        fs::write(manager.user_config_path(), "DeltaForge_Settings: [unclosed").unwrap();
        assert!(manager.load_user_config().is_err());
    }
}
