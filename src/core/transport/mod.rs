//! Transport layer for talking to the load
//!
//! Supports:
//! - Serial ports (USB-serial adapters, `/dev/rfcomm*` Bluetooth SPP links)
//! - Raw TCP connections (serial-to-WiFi bridges)
//!
//! Both variants retry the initial connect a fixed number of times. The TCP
//! variant additionally reconnects on its own when the link goes silent or a
//! socket call fails; those transitions are published as [`TransportEvent`]s.

mod serial;
mod tcp;

pub use serial::{list_ports, SerialConfig, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Default serial device, a Bluetooth SPP binding
pub const DEFAULT_SERIAL_PORT: &str = "/dev/rfcomm0";
/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// Default TCP port of WiFi bridges
pub const DEFAULT_TCP_PORT: u16 = 8888;
/// Connect attempts before giving up
pub const CONNECT_ATTEMPTS: u32 = 5;

/// Transport configuration. Serial and TCP are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Serial port connection
    Serial(SerialConfig),
    /// Raw TCP connection
    Tcp(TcpConfig),
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Serial port
    Serial,
    /// Raw TCP
    Tcp,
    /// In-memory simulator
    Simulated,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Tcp => write!(f, "TCP"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Link established
    Connected,
    /// Link torn down, connect in progress
    Reconnecting,
}

/// Observable connection lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Initial connection established
    Connected,
    /// A connect attempt failed and will be retried
    ConnectFailed {
        /// Zero-based attempt number
        attempt: u32,
        /// Error text of the failed attempt
        error: String,
    },
    /// The link is being torn down and rebuilt
    Reconnecting {
        /// What triggered the reconnect
        reason: String,
    },
    /// The link was rebuilt
    Reconnected,
    /// The transport was closed by the owner
    Closed,
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection could not be established within the retry budget
    #[error("Connection failed: {target} ({attempts} attempts): {reason}")]
    ConnectionFailed {
        /// Port path or host:port
        target: String,
        /// Attempts made
        attempts: u32,
        /// Error of the last attempt
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serial driver error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Send calls
    pub packets_sent: u64,
    /// Non-empty reads
    pub packets_received: u64,
    /// Socket or port errors
    pub errors: u64,
    /// Transparent reconnects
    pub reconnects: u64,
}

/// Delay between connect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `min(base + attempt * step, max)`
    Linear {
        /// Delay after the first failure
        base: Duration,
        /// Added per further attempt
        step: Duration,
        /// Upper bound
        max: Duration,
    },
}

/// Convert a seconds setting into a duration.
///
/// Negative, NaN, infinite and overflowing values are configuration errors.
pub fn secs_setting(name: &str, secs: f64) -> Result<Duration, TransportError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| TransportError::InvalidConfiguration(format!("{name} = {secs}: {e}")))
}

impl Backoff {
    /// Delay to wait after the given zero-based attempt failed
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Linear { base, step, max } => (base + step * attempt).min(max),
        }
    }
}

/// Byte channel used by the command engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceTransport: Send {
    /// Open the link, retrying per the variant's backoff
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the link
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Write a complete frame
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Number of bytes that `receive` can return without blocking
    async fn available(&mut self) -> Result<usize, TransportError>;

    /// Read up to `max` bytes
    async fn receive(&mut self, max: usize) -> Result<Bytes, TransportError>;

    /// Discard pending input, returning how many bytes were dropped
    async fn flush_input(&mut self) -> Result<usize, TransportError>;

    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;

    /// Subscribe to connection lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Create a transport instance from configuration
pub fn create_transport(config: TransportConfig) -> Box<dyn DeviceTransport> {
    match config {
        TransportConfig::Serial(cfg) => Box::new(SerialTransport::new(cfg)),
        TransportConfig::Tcp(cfg) => Box::new(TcpTransport::new(cfg)),
    }
}

#[async_trait]
impl<T: DeviceTransport + ?Sized> DeviceTransport for Box<T> {
    async fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).send(data).await
    }

    async fn available(&mut self) -> Result<usize, TransportError> {
        (**self).available().await
    }

    async fn receive(&mut self, max: usize) -> Result<Bytes, TransportError> {
        (**self).receive(max).await
    }

    async fn flush_input(&mut self) -> Result<usize, TransportError> {
        (**self).flush_input().await
    }

    fn transport_type(&self) -> TransportType {
        (**self).transport_type()
    }

    fn connection_info(&self) -> String {
        (**self).connection_info()
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        (**self).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_backoff_is_fixed() {
        let backoff = SerialConfig::default().backoff();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
    }

    #[test]
    fn test_tcp_backoff_grows_and_caps() {
        let backoff = TcpConfig::default().backoff();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(1500));
        assert_eq!(backoff.delay(4), Duration::from_millis(4500));
        assert_eq!(backoff.delay(5), Duration::from_secs(5));
        assert_eq!(backoff.delay(20), Duration::from_secs(5));
    }

    #[test]
    fn test_secs_setting_rejects_unrepresentable() {
        assert_eq!(
            secs_setting("timeout", 2.5).unwrap(),
            Duration::from_millis(2500)
        );
        for bad in [f64::INFINITY, f64::NAN, -1.0, 1e20] {
            assert!(matches!(
                secs_setting("timeout", bad),
                Err(TransportError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_transport_config_toml() {
        let config: TransportConfig = toml::from_str(
            r#"
            type = "tcp"
            host = "dl24.local"
            port = 8888
            "#,
        )
        .unwrap();
        match config {
            TransportConfig::Tcp(tcp) => {
                assert_eq!(tcp.host, "dl24.local");
                assert_eq!(tcp.inactivity_timeout_secs, 5.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
