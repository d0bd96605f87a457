//! # DL24 Core Library
//!
//! Driver for Atorch DL24 / PX100-compatible electronic loads:
//! - Serial ports (USB-serial adapters, Bluetooth SPP `/dev/rfcomm*`)
//! - Raw TCP connections to serial-to-WiFi bridges
//!
//! ## Features
//!
//! - Both command dialects (PX100 6-byte frames, Atorch 10-byte frames)
//! - Streaming frame decoder with resynchronisation and checksum checks
//! - Retrying request/response engine with a single request in flight
//! - Device state folded from the 1 Hz status broadcasts
//! - Verified settings (current, cutoff, output, timer)
//! - CLI exit codes and JSON output
//!
//! ## Example
//!
//! ```rust,no_run
//! use dl24_core::core::engine::EngineConfig;
//! use dl24_core::core::instrument::{Instrument, Measurement, Scale};
//! use dl24_core::core::transport::{SerialConfig, SerialTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 9600));
//!     let mut load = Instrument::new(transport, EngineConfig::default());
//!     load.connect().await?;
//!
//!     load.set_current(1.5, false).await?;
//!     load.set_output(true).await?;
//!     let volts = load.get_measurement(Measurement::Voltage, Scale::Scaled).await?;
//!     println!("{volts} V");
//!
//!     load.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::engine::{CommandEngine, CommandError, EngineConfig};
pub use crate::core::instrument::{
    Button, CounterKind, Instrument, InstrumentError, ListenEnd, ListenOptions, Measurement,
    ReadOptions, Scale, StateReport,
};
pub use crate::core::state::{DeviceState, DeviceVariant, Measurements};
pub use crate::core::transport::{
    create_transport, DeviceTransport, SerialConfig, TcpConfig, TransportConfig, TransportError,
    TransportType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
