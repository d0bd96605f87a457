//! Wire-level packet definitions for both DL24 command families
//!
//! Family A (PX100 style) requests are fixed 6-byte frames
//! `B1 B2 CMD D0 D1 B6`. Set commands are answered with a single `0x6F`
//! byte, queries with the 7-byte `CA CB D0 D1 D2 CE CF` reply.
//!
//! Family B (Atorch style) requests are 10-byte frames
//! `FF 55 11 ADU CMD D0 D1 D2 D3 CHK`. The device also pushes 36-byte
//! `FF 55 01` status broadcasts and answers commands with 8-byte `FF 55 02`
//! frames.

use super::checksum::atorch_checksum;
use std::fmt;

/// Single-byte confirmation of a Family A set command
pub const SHORT_ACK: u8 = 0x6F;

/// Family A request header and trailer
pub const PX100_HEADER: [u8; 2] = [0xB1, 0xB2];
/// Family A request trailer
pub const PX100_TRAILER: u8 = 0xB6;
/// Family A request length
pub const PX100_REQUEST_LEN: usize = 6;

/// First byte of a Family A query reply
pub const QUERY_SYNC: u8 = 0xCA;
/// Second byte of a Family A query reply
pub const QUERY_SYNC2: u8 = 0xCB;
/// Family A query reply trailer
pub const QUERY_TRAILER: [u8; 2] = [0xCE, 0xCF];
/// Family A query reply length
pub const QUERY_REPLY_LEN: usize = 7;

/// Family B sync pair
pub const ATORCH_SYNC: [u8; 2] = [0xFF, 0x55];
/// Family B message type of a status broadcast
pub const ATORCH_BROADCAST: u8 = 0x01;
/// Family B message type of a command reply
pub const ATORCH_REPLY: u8 = 0x02;
/// Family B message type of a host command
pub const ATORCH_COMMAND: u8 = 0x11;
/// Status broadcast length
pub const BROADCAST_LEN: usize = 36;
/// Command reply length
pub const COMMAND_REPLY_LEN: usize = 8;
/// Family B request length
pub const ATORCH_REQUEST_LEN: usize = 10;

/// Device sub-type used in Family B requests until a broadcast reveals it
pub const DEFAULT_ADU: u8 = 2;

/// Family A (PX100) command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Px100Command {
    /// Enable/disable the load
    SetOnOff = 0x01,
    /// Set the sink current (integer amps, centiamps)
    SetCurrent = 0x02,
    /// Set the cutoff voltage (integer volts, centivolts)
    SetCutoff = 0x03,
    /// Set the discharge timer in seconds
    SetTimer = 0x04,
    /// Reset the energy counters
    ResetCounters = 0x05,
    /// Query the load state
    GetOnOff = 0x10,
    /// Query measured voltage in mV
    GetVoltage = 0x11,
    /// Query measured current in mA
    GetCurrent = 0x12,
    /// Query the elapsed timer (hh mm ss)
    GetTimer = 0x13,
    /// Query the capacity counter in mAh
    GetAmpHours = 0x14,
    /// Query the energy counter in mWh
    GetWattHours = 0x15,
    /// Query the MOSFET temperature
    GetTemperature = 0x16,
    /// Query the configured current in 10 mA steps
    GetSetCurrent = 0x17,
    /// Query the configured cutoff in 10 mV steps
    GetSetCutoff = 0x18,
    /// Query the configured timer (hh mm ss)
    GetSetTimer = 0x19,
}

impl Px100Command {
    /// Commands below `0x10` are set operations answered by a short ack
    pub fn is_set(code: u8) -> bool {
        code < 0x10
    }

    /// Raw command byte
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Human readable name used in logs and errors
    pub fn name(self) -> &'static str {
        match self {
            Self::SetOnOff => "set on/off",
            Self::SetCurrent => "set current",
            Self::SetCutoff => "set cutoff",
            Self::SetTimer => "set timer",
            Self::ResetCounters => "reset counters",
            Self::GetOnOff => "get on/off",
            Self::GetVoltage => "get voltage",
            Self::GetCurrent => "get current",
            Self::GetTimer => "get timer",
            Self::GetAmpHours => "get Ah",
            Self::GetWattHours => "get Wh",
            Self::GetTemperature => "get temperature",
            Self::GetSetCurrent => "get set current",
            Self::GetSetCutoff => "get set cutoff",
            Self::GetSetTimer => "get set timer",
        }
    }
}

/// Family B (Atorch) command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AtorchCommand {
    /// Clear every counter
    ClearAll = 0x01,
    /// Clear the capacity counter
    ClearCapacity = 0x02,
    /// Clear the run time counter
    ClearTime = 0x03,
    /// Set backlight level
    SetBacklight = 0x21,
    /// Set energy price
    SetCost = 0x22,
    /// "Setup" front-panel button
    ButtonSetup = 0x31,
    /// "OK" (on/off) front-panel button
    ButtonOk = 0x32,
    /// "Right" (plus) front-panel button
    ButtonRight = 0x33,
    /// "Left" (minus) front-panel button
    ButtonLeft = 0x34,
}

impl AtorchCommand {
    /// Raw command byte
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Encode a Family A request
pub fn encode_px100(cmd: u8, data: [u8; 2]) -> [u8; PX100_REQUEST_LEN] {
    [
        PX100_HEADER[0],
        PX100_HEADER[1],
        cmd,
        data[0],
        data[1],
        PX100_TRAILER,
    ]
}

/// Encode a Family B request addressed to device sub-type `adu`
pub fn encode_atorch(adu: u8, cmd: u8, data: [u8; 4]) -> [u8; ATORCH_REQUEST_LEN] {
    let mut frame = [
        ATORCH_SYNC[0],
        ATORCH_SYNC[1],
        ATORCH_COMMAND,
        adu,
        cmd,
        data[0],
        data[1],
        data[2],
        data[3],
        0,
    ];
    frame[ATORCH_REQUEST_LEN - 1] = atorch_checksum(&frame[2..ATORCH_REQUEST_LEN - 1]);
    frame
}

/// Split a decimal setting into the `[integer, hundredths]` byte pair the
/// PX100 set commands expect.
///
/// The value must already be clamped to the device range.
pub fn split_decimal(value: f64) -> [u8; 2] {
    let centi = (value * 100.0).round().max(0.0) as u32;
    [(centi / 100).min(255) as u8, (centi % 100) as u8]
}

/// Big-endian 16-bit read
pub fn be16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

/// Big-endian 24-bit read
pub fn be24(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([0, bytes[offset], bytes[offset + 1], bytes[offset + 2]])
}

/// Big-endian 32-bit read
pub fn be32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Outcome byte of a `FF 55 02` command reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Command accepted
    Ok,
    /// Command not supported by this device
    Unsupported,
    /// Any other outcome code
    Unknown(u8),
}

impl From<u8> for ReplyOutcome {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Ok,
            3 => Self::Unsupported,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ReplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "reply"),
            Self::Unsupported => write!(f, "reply:UNSUPPORTED"),
            Self::Unknown(code) => write!(f, "reply:UNKNOWN:{code:02x}"),
        }
    }
}

/// A verified 36-byte status broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastFrame {
    raw: [u8; BROADCAST_LEN],
}

impl BroadcastFrame {
    /// Wrap raw frame bytes. Checksum verification is the decoder's job.
    pub fn from_raw(raw: [u8; BROADCAST_LEN]) -> Self {
        Self { raw }
    }

    /// Device sub-type byte at offset 3
    pub fn variant_code(&self) -> u8 {
        self.raw[3]
    }

    /// Full frame including sync and checksum
    pub fn raw(&self) -> &[u8; BROADCAST_LEN] {
        &self.raw
    }
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `0x6F` acknowledgement of a Family A set command
    ShortAck,
    /// `CA CB .. .. .. CE CF` query reply carrying a 24-bit value
    QueryReply {
        /// Big-endian value at offset 2
        value: u32,
    },
    /// `FF 55 02` command reply
    CommandReply {
        /// Outcome byte at offset 3
        outcome: ReplyOutcome,
        /// Bytes 4..7
        payload: [u8; 3],
    },
    /// `FF 55 01` status broadcast
    Broadcast(BroadcastFrame),
}

impl Packet {
    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ShortAck => "short ack",
            Self::QueryReply { .. } => "query reply",
            Self::CommandReply { .. } => "command reply",
            Self::Broadcast(_) => "broadcast",
        }
    }
}

/// Command family tag for raw pass-through requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// PX100-style 6-byte frames
    Px100,
    /// Atorch-style 10-byte frames
    Atorch,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Px100 => write!(f, "PX100"),
            Self::Atorch => write!(f, "Atorch"),
        }
    }
}
