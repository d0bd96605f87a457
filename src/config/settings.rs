//! Application settings

use crate::core::engine::EngineConfig;
use crate::core::transport::{
    SerialConfig, TcpConfig, TransportConfig, DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for [`AppConfig`]
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be rendered
    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is out of range
    #[error("invalid setting: {0}")]
    Invalid(String),

    /// No home / config directory on this platform
    #[error("could not determine config directory")]
    NoConfigDir,
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Wait for a status broadcast before sending commands
    pub wait_for_device: bool,
    /// Switch the output off when the program exits
    pub off_on_close: bool,
    /// End `listen` once the output reads off
    pub stop_on_off: bool,
    /// Where the load is attached
    pub connection: ConnectionSettings,
    /// Retry and timing knobs
    pub engine: EngineConfig,
    /// TCP link tuning
    pub tcp: TcpSettings,
}

/// Device address. A serial path takes precedence over a TCP host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial device path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Serial baud rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baudrate: Option<u32>,
    /// TCP bridge host name or address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// TCP bridge port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// TCP link tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Seconds of silence before the link is rebuilt
    pub inactivity_timeout_secs: f64,
    /// Per-attempt connect timeout in seconds
    pub connect_timeout_secs: f64,
    /// Rebuild the link after socket errors or a peer close
    pub reconnect: bool,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 5.0,
            connect_timeout_secs: 3.0,
            reconnect: true,
        }
    }
}

fn check_secs(name: &str, secs: f64) -> Result<(), ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("{name} = {secs}: {e}")))
}

impl AppConfig {
    /// Load config from the default location; a missing file means defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::default_config_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from `path`; a missing file means defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("no config file at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        debug!("config loaded from {}", path.display());
        Ok(config)
    }

    /// Reject values that parse but cannot be used
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("tcp.inactivity_timeout_secs", self.tcp.inactivity_timeout_secs)?;
        check_secs("tcp.connect_timeout_secs", self.tcp.connect_timeout_secs)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Transport described by the file, if it names one
    pub fn transport(&self) -> Option<TransportConfig> {
        let conn = &self.connection;
        if let Some(path) = &conn.serial {
            let baud = conn.baudrate.unwrap_or(DEFAULT_BAUD_RATE);
            return Some(TransportConfig::Serial(SerialConfig::new(path, baud)));
        }
        conn.host.as_ref().map(|host| {
            let tcp = TcpConfig::new(host, conn.port.unwrap_or(DEFAULT_TCP_PORT));
            TransportConfig::Tcp(self.tune_tcp(tcp))
        })
    }

    /// Apply the `[tcp]` section to a TCP config
    pub fn tune_tcp(&self, mut tcp: TcpConfig) -> TcpConfig {
        tcp.inactivity_timeout_secs = self.tcp.inactivity_timeout_secs;
        tcp.connect_timeout_secs = self.tcp.connect_timeout_secs;
        tcp.reconnect = self.tcp.reconnect;
        tcp
    }

    /// Commented template for a new config file
    pub fn template(path: Option<&Path>) -> String {
        let location = path.map_or_else(
            || "the user configuration directory".to_string(),
            |p| p.display().to_string(),
        );
        format!(
            r#"# config file goes to {location}

# wait for communication from the device before sending commands
# wait_for_device = true
# switch the output off on exit
# off_on_close = true
# stop listening once the output is switched off
# stop_on_off = true

[connection]
# physical serial TTY
# serial = "/dev/ttyUSB0"
# baudrate = {DEFAULT_BAUD_RATE}

# plain TCP socket
# host = "dl24p.local"
# port = {DEFAULT_TCP_PORT}

# physical port takes precedence if both are defined

[engine]
# retries = 3
# wait_retries = 50
# retry_delay_ms = 50
# command_retries = 3
# verify = true

[tcp]
# inactivity_timeout_secs = 5.0
# connect_timeout_secs = 3.0
# rebuild the link after socket errors
# reconnect = true
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.transport().is_none());
    }

    #[test]
    fn test_serial_wins_over_tcp() {
        let config: AppConfig = toml::from_str(
            r#"
            [connection]
            serial = "/dev/ttyUSB0"
            baudrate = 115200
            host = "dl24.local"
            "#,
        )
        .unwrap();
        match config.transport() {
            Some(TransportConfig::Serial(serial)) => {
                assert_eq!(serial.port, "/dev/ttyUSB0");
                assert_eq!(serial.baud_rate, 115200);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tcp_section_applies() {
        let config: AppConfig = toml::from_str(
            r#"
            off_on_close = true

            [connection]
            host = "dl24.local"

            [tcp]
            inactivity_timeout_secs = 10.0

            [engine]
            retries = 5
            "#,
        )
        .unwrap();
        assert!(config.off_on_close);
        assert_eq!(config.engine.retries, 5);
        assert_eq!(config.engine.wait_retries, 50);
        match config.transport() {
            Some(TransportConfig::Tcp(tcp)) => {
                assert_eq!(tcp.port, DEFAULT_TCP_PORT);
                assert_eq!(tcp.inactivity_timeout_secs, 10.0);
                assert_eq!(tcp.connect_timeout_secs, 3.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reconnect_and_stop_keys() {
        let config: AppConfig = toml::from_str(
            r#"
            stop_on_off = true

            [connection]
            host = "dl24.local"

            [tcp]
            reconnect = false
            "#,
        )
        .unwrap();
        assert!(config.stop_on_off);
        match config.transport() {
            Some(TransportConfig::Tcp(tcp)) => assert!(!tcp.reconnect),
            other => panic!("unexpected {other:?}"),
        }
        assert!(AppConfig::default().tcp.reconnect);
    }

    #[test]
    fn test_huge_timeout_is_rejected_without_panicking() {
        let source = r#"
            [connection]
            host = "dl24.local"

            [tcp]
            inactivity_timeout_secs = 1e20
            "#;

        let config: AppConfig = toml::from_str(source).unwrap();
        assert!(matches!(
            config.transport(),
            Some(TransportConfig::Tcp(_))
        ));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, source).unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = AppConfig::default();
        config.tcp.connect_timeout_secs = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.connection.host = Some("10.0.0.7".to_string());
        config.wait_for_device = true;

        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "connection = 5").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_template_is_valid_toml() {
        let template = AppConfig::template(None);
        let parsed: AppConfig = toml::from_str(&template).unwrap();
        assert_eq!(parsed, AppConfig::default());
    }
}
