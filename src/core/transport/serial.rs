//! Serial port transport implementation
//!
//! Reads block for at most the configured port timeout. Read and write
//! errors are returned to the caller; there is no implicit reconnect on a
//! serial link.

use super::{
    secs_setting, Backoff, ConnectionState, DeviceTransport, TransportError, TransportEvent, TransportStats,
    TransportType, CONNECT_ATTEMPTS, DEFAULT_BAUD_RATE, DEFAULT_SERIAL_PORT,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., /dev/ttyUSB0, /dev/rfcomm0, COM3)
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub timeout_secs: f64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> f64 {
    3.0
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            timeout_secs: default_read_timeout(),
        }
    }

    /// Read timeout as a duration
    pub fn timeout(&self) -> Result<Duration, TransportError> {
        secs_setting("timeout_secs", self.timeout_secs)
    }

    /// Connect retry schedule: one second between attempts
    pub fn backoff(&self) -> Backoff {
        Backoff::Fixed(Duration::from_secs(1))
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERIAL_PORT, DEFAULT_BAUD_RATE)
    }
}

/// Parses `PATH[@BAUD]`; an empty path selects the default port.
impl FromStr for SerialConfig {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, baud) = match s.split_once('@') {
            Some((path, baud)) => {
                let baud = baud.trim().parse::<u32>().map_err(|_| {
                    TransportError::InvalidConfiguration(format!("invalid baud rate in {s:?}"))
                })?;
                (path, baud)
            }
            None => (s, DEFAULT_BAUD_RATE),
        };
        let path = path.trim();
        let path = if path.is_empty() {
            DEFAULT_SERIAL_PORT
        } else {
            path
        };
        Ok(Self::new(path, baud))
    }
}

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    state: ConnectionState,
    stats: TransportStats,
    events: broadcast::Sender<TransportEvent>,
}

impl SerialTransport {
    /// Create a new, unconnected serial transport
    pub fn new(config: SerialConfig) -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            config,
            port: None,
            state: ConnectionState::Disconnected,
            stats: TransportStats::default(),
            events,
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl DeviceTransport for SerialTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        info!("connecting to {} @ {}", self.config.port, self.config.baud_rate);
        let timeout = self.config.timeout()?;
        let backoff = self.config.backoff();
        let mut last_error = String::new();

        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                info!("retrying serial connect ({attempt})");
            }
            match serialport::new(&self.config.port, self.config.baud_rate)
                .timeout(timeout)
                .open()
            {
                Ok(port) => {
                    self.port = Some(port);
                    self.state = ConnectionState::Connected;
                    let _ = self.events.send(TransportEvent::Connected);
                    info!("serial port {} connected", self.config.port);
                    return Ok(());
                }
                Err(e) => {
                    warn!("serial connect to {} failed: {}", self.config.port, e);
                    self.stats.errors += 1;
                    last_error = e.to_string();
                    let _ = self.events.send(TransportEvent::ConnectFailed {
                        attempt,
                        error: last_error.clone(),
                    });
                    if attempt + 1 < CONNECT_ATTEMPTS {
                        tokio::time::sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }

        Err(TransportError::ConnectionFailed {
            target: self.config.port.clone(),
            attempts: CONNECT_ATTEMPTS,
            reason: last_error,
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!("serial port {} closed", self.config.port);
            let _ = self.events.send(TransportEvent::Closed);
        } else {
            debug!("serial port {} was never opened", self.config.port);
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;

        self.stats.bytes_sent += data.len() as u64;
        self.stats.packets_sent += 1;
        debug!("SEND: {}", hex::encode(data));
        Ok(data.len())
    }

    async fn available(&mut self) -> Result<usize, TransportError> {
        let queued = self.port_mut()?.bytes_to_read()?;
        Ok(queued as usize)
    }

    async fn receive(&mut self, max: usize) -> Result<Bytes, TransportError> {
        let port = self.port_mut()?;
        let mut buffer = vec![0u8; max];

        match port.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                if n > 0 {
                    self.stats.bytes_received += n as u64;
                    self.stats.packets_received += 1;
                    debug!("RECV: {}", hex::encode(&buffer));
                }
                Ok(Bytes::from(buffer))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Err(e) => {
                self.stats.errors += 1;
                Err(TransportError::IoError(e))
            }
        }
    }

    async fn flush_input(&mut self) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        let pending = port.bytes_to_read()? as usize;
        port.clear(ClearBuffer::Input)?;
        Ok(pending)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Serial
    }

    fn connection_info(&self) -> String {
        format!("{} @ {} baud", self.config.port, self.config.baud_rate)
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    Ok(serialport::available_ports()?)
}
