//! Core module containing the load driver
//!
//! This module provides:
//! - Transport layer (Serial, TCP) with connect retries and TCP reconnects
//! - Wire protocol: packets, checksum, streaming frame decoder
//! - Command engine with retries and reply classification
//! - Device state built from status broadcasts
//! - Instrument facade with verified settings
//! - In-memory simulated load for tests

pub mod engine;
pub mod instrument;
pub mod protocol;
pub mod simulator;
pub mod state;
pub mod transport;
