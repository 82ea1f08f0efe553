//! Configuration management for cvdr

mod cvdr;
pub mod serde_utils;

pub use cvdr::{CvdrConfig, DEFAULT_BASE_CONTROL_PORT};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cvdr")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_config_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => Ok(T::default()),
        other => other,
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let config: CvdrConfig = load_config_or_default(&dir.path().join("none.toml")).unwrap();
        assert_eq!(config.base_control_port, DEFAULT_BASE_CONTROL_PORT);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "service_url = \"https://cloud.example.com\"\nproxy = \"socks5://localhost:1080\"\n",
        )
        .unwrap();

        let loaded: CvdrConfig = load_config(&path).unwrap();
        assert_eq!(loaded.service_url, "https://cloud.example.com");
        assert_eq!(loaded.proxy.as_deref(), Some("socks5://localhost:1080"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "base_control_port = \"lots\"").unwrap();
        assert!(matches!(
            load_config::<CvdrConfig>(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_expand_home() {
        let plain = Path::new("/var/lib/cvdr");
        assert_eq!(expand_home(plain), PathBuf::from("/var/lib/cvdr"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home(Path::new("~/.cvdr/connections")),
                home.join(".cvdr/connections")
            );
        }
    }
}
