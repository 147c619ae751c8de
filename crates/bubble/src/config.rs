use crate::engine::default_socket_path;
use crate::sync::DEFAULT_POLL_INTERVAL;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Client settings from `config.toml`, every field optional.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Directory the engine keeps its state in; passed to `init`.
    pub data_dir: PathBuf,
    /// Socket of the engine host.
    pub socket_path: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            socket_path: default_socket_path(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl BridgeConfig {
    /// Load the config file if there is one, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `$BUBBLE_SOCKET` and `$BUBBLE_DATA_DIR` win over the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(socket) = std::env::var("BUBBLE_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }
        if let Ok(data_dir) = std::env::var("BUBBLE_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
        self
    }

    pub fn config_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("bubble")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("bubble")
    } else {
        PathBuf::from("/tmp/bubble")
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_home).join("bubble")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("bubble")
    } else {
        PathBuf::from("/tmp/bubble/data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = 500\n").unwrap();

        let config = BridgeConfig::load_from(&path).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.data_dir, BridgeConfig::default().data_dir);
    }

    #[test]
    fn full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/bubble"
socket_path = "/run/bubble/engine.sock"
poll_interval_ms = 2000
"#,
        )
        .unwrap();

        let config = BridgeConfig::load_from(&path).unwrap();
        assert_eq!(
            config,
            BridgeConfig {
                data_dir: PathBuf::from("/var/lib/bubble"),
                socket_path: PathBuf::from("/run/bubble/engine.sock"),
                poll_interval_ms: 2000,
            }
        );
    }

    #[test]
    fn bad_toml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();

        let err = BridgeConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn default_interval_matches_sync_loop() {
        assert_eq!(BridgeConfig::default().poll_interval(), DEFAULT_POLL_INTERVAL);
    }
}
