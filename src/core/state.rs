//! Device state built from status broadcasts
//!
//! The load pushes a 36-byte status frame about once a second. Each verified
//! frame is folded into [`DeviceState`]; the broadcast counter lets a poller
//! see every frame exactly once regardless of how often it reads.
//!
//! Frame layout (offsets into the full frame, big-endian):
//!
//! | offset | width | variant 1 (AC) | variant 2 (DC) | variant 3 (DC/USB) |
//! |--------|-------|----------------|----------------|--------------------|
//! | 3      | 1     | sub-type       | sub-type       | sub-type           |
//! | 4      | 3     | 0.1 V          | 0.1 V          | 0.1 V              |
//! | 7      | 3     | mA             | mA             | mA                 |
//! | 10     | 3     | power          | 0.01 Ah        | 0.01 Ah            |
//! | 13     | 4     | energy         | 10 mWh         | energy             |
//! | 17     | 3     | price          | price          | USB D+ / D-        |
//! | 24     | 2     | °C             | °C             | °C                 |
//! | 26..30 |       |                | run time, backlight | run time       |

use crate::core::protocol::packet::{be16, be24, be32, BroadcastFrame, DEFAULT_ADU};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Device sub-type reported in byte 3 of every broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceVariant {
    /// AC power meter
    Ac,
    /// DC load / meter
    Dc,
    /// DC meter with USB data lines
    DcUsb,
    /// Anything else
    Unknown(u8),
}

impl DeviceVariant {
    /// Sub-type byte, also used as the ADU of Family B requests
    pub fn code(self) -> u8 {
        match self {
            Self::Ac => 1,
            Self::Dc => 2,
            Self::DcUsb => 3,
            Self::Unknown(code) => code,
        }
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Self::Ac => "AC sensor",
            Self::Dc => "DC sensor",
            Self::DcUsb => "DC/USB sensor",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for DeviceVariant {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Ac,
            2 => Self::Dc,
            3 => Self::DcUsb,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.code(), self.name())
    }
}

/// Measurements decoded from the most recent broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurements {
    /// Volts
    #[serde(rename = "V", skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    /// Amps
    #[serde(rename = "A", skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    /// Degrees Celsius
    #[serde(rename = "temp", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<u16>,
    /// Accumulated capacity, amp-hours
    #[serde(rename = "Ah", skip_serializing_if = "Option::is_none")]
    pub amp_hours: Option<f64>,
    /// Accumulated energy, watt-hours
    #[serde(rename = "Wh", skip_serializing_if = "Option::is_none")]
    pub watt_hours: Option<f64>,
    /// Configured energy price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Time the load has been running
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_secs")]
    pub run_time: Option<Duration>,
    /// Backlight setting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backlight: Option<u8>,
}

fn serialize_secs<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_u64(duration.as_secs()),
        None => serializer.serialize_none(),
    }
}

/// Snapshot of everything learned from broadcasts
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    variant: Option<DeviceVariant>,
    measurements: Measurements,
    broadcast_count: u64,
    seen_count: u64,
}

impl DeviceState {
    /// Empty state, no broadcast seen yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a verified broadcast into the snapshot
    pub fn apply_broadcast(&mut self, frame: &BroadcastFrame) {
        let reported = DeviceVariant::from(frame.variant_code());
        let variant = match self.variant {
            None => {
                debug!("device type {}", reported);
                self.variant = Some(reported);
                reported
            }
            Some(known) => {
                if known != reported {
                    warn!("broadcast from device type {} ignored, session is {}", reported, known);
                }
                known
            }
        };

        let raw = frame.raw();
        let m = &mut self.measurements;
        m.voltage = Some(f64::from(be24(raw, 4)) / 10.0);
        m.current = Some(f64::from(be24(raw, 7)) / 1000.0);
        m.temperature = Some(be16(raw, 24));

        if variant == DeviceVariant::Dc && reported == DeviceVariant::Dc {
            m.amp_hours = Some(f64::from(be24(raw, 10)) / 100.0);
            m.watt_hours = Some(f64::from(be32(raw, 13)) / 100.0);
            m.price = Some(f64::from(be24(raw, 17)) / 100.0);
            let hours = u64::from(be16(raw, 26));
            let minutes = u64::from(raw[28]);
            let seconds = u64::from(raw[29]);
            m.run_time = Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds));
            m.backlight = Some(raw[30]);
        }

        self.broadcast_count += 1;
    }

    /// True once per broadcast applied since the previous call
    pub fn has_new_update(&mut self) -> bool {
        if self.broadcast_count == self.seen_count {
            return false;
        }
        self.seen_count = self.broadcast_count;
        true
    }

    /// Device sub-type, once a broadcast has revealed it
    pub fn variant(&self) -> Option<DeviceVariant> {
        self.variant
    }

    /// ADU byte for Family B requests
    pub fn adu(&self) -> u8 {
        self.variant.map_or(DEFAULT_ADU, DeviceVariant::code)
    }

    /// Latest decoded measurements
    pub fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    /// Broadcasts applied so far
    pub fn broadcast_count(&self) -> u64 {
        self.broadcast_count
    }
}
