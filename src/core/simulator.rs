//! In-memory DL24 for tests and benchmarks
//!
//! [`SimulatedLoad`] implements [`DeviceTransport`] by answering requests the
//! way the firmware does: short acks for PX100 set commands, `CA CB` replies
//! for queries, `FF 55 02` replies for Atorch commands, and 36-byte status
//! broadcasts on demand. A cloneable [`SimHandle`] lets a test inspect and
//! steer the device while the engine owns the transport.

use crate::core::protocol::checksum::{atorch_checksum, verify_frame};
use crate::core::protocol::packet::{
    AtorchCommand, Px100Command, ATORCH_COMMAND, ATORCH_REPLY, ATORCH_REQUEST_LEN, ATORCH_SYNC,
    ATORCH_BROADCAST, BROADCAST_LEN, COMMAND_REPLY_LEN, PX100_HEADER, PX100_REQUEST_LEN,
    PX100_TRAILER, QUERY_SYNC, QUERY_SYNC2, QUERY_TRAILER, SHORT_ACK,
};
use crate::core::transport::{
    ConnectionState, DeviceTransport, TransportError, TransportEvent, TransportStats,
    TransportType, CONNECT_ATTEMPTS,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Registers and fault switches of the simulated load
#[derive(Debug, Clone)]
pub struct SimDevice {
    /// Load enabled
    pub output_on: bool,
    /// Measured voltage, mV
    pub millivolts: u32,
    /// Measured current, mA
    pub milliamps: u32,
    /// Capacity counter, mAh
    pub milliamp_hours: u32,
    /// Energy counter, mWh
    pub milliwatt_hours: u32,
    /// MOSFET temperature, °C
    pub temperature: u32,
    /// Configured current, 10 mA steps
    pub set_current: u32,
    /// Configured cutoff voltage, 10 mV steps
    pub set_cutoff: u32,
    /// Elapsed discharge time, seconds
    pub timer_secs: u32,
    /// Configured discharge timer, seconds
    pub set_timer_secs: u32,
    /// Backlight level
    pub backlight: u8,
    /// Energy price, hundredths
    pub price: u32,
    /// Sub-type byte sent in broadcasts
    pub variant: u8,

    /// Never answer
    pub silent: bool,
    /// Ignore this many requests before answering again
    pub drop_requests: u32,
    /// Acknowledge set commands without applying them
    pub refuse_sets: bool,
    /// Refuse the connection
    pub fail_connect: bool,

    requests: Vec<Vec<u8>>,
    outbox: VecDeque<u8>,
    before_reply: Vec<u8>,
    broadcast_before_reply: bool,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self {
            output_on: false,
            millivolts: 0,
            milliamps: 0,
            milliamp_hours: 0,
            milliwatt_hours: 0,
            temperature: 25,
            set_current: 0,
            set_cutoff: 0,
            timer_secs: 0,
            set_timer_secs: 0,
            backlight: 60,
            price: 0,
            variant: 2,
            silent: false,
            drop_requests: 0,
            refuse_sets: false,
            fail_connect: false,
            requests: Vec::new(),
            outbox: VecDeque::new(),
            before_reply: Vec::new(),
            broadcast_before_reply: false,
        }
    }
}

fn query_reply(value: u32) -> Vec<u8> {
    let [_, d0, d1, d2] = value.to_be_bytes();
    vec![
        QUERY_SYNC,
        QUERY_SYNC2,
        d0,
        d1,
        d2,
        QUERY_TRAILER[0],
        QUERY_TRAILER[1],
    ]
}

fn hms(secs: u32) -> u32 {
    let hours = (secs / 3600).min(255);
    let minutes = secs / 60 % 60;
    let seconds = secs % 60;
    (hours << 16) | (minutes << 8) | seconds
}

impl SimDevice {
    /// Current status broadcast, checksum included
    pub fn broadcast(&self) -> [u8; BROADCAST_LEN] {
        let mut raw = [0u8; BROADCAST_LEN];
        raw[..2].copy_from_slice(&ATORCH_SYNC);
        raw[2] = ATORCH_BROADCAST;
        raw[3] = self.variant;
        raw[4..7].copy_from_slice(&(self.millivolts / 100).to_be_bytes()[1..]);
        raw[7..10].copy_from_slice(&self.milliamps.to_be_bytes()[1..]);
        raw[10..13].copy_from_slice(&(self.milliamp_hours / 10).to_be_bytes()[1..]);
        raw[13..17].copy_from_slice(&(self.milliwatt_hours / 10).to_be_bytes());
        raw[17..20].copy_from_slice(&self.price.to_be_bytes()[1..]);
        raw[24..26].copy_from_slice(&(self.temperature.min(0xFFFF) as u16).to_be_bytes());
        let hours = (self.timer_secs / 3600).min(0xFFFF) as u16;
        raw[26..28].copy_from_slice(&hours.to_be_bytes());
        raw[28] = (self.timer_secs / 60 % 60) as u8;
        raw[29] = (self.timer_secs % 60) as u8;
        raw[30] = self.backlight;
        raw[BROADCAST_LEN - 1] = atorch_checksum(&raw[2..BROADCAST_LEN - 1]);
        raw
    }

    fn handle_request(&mut self, frame: &[u8]) {
        self.requests.push(frame.to_vec());
        if self.silent {
            return;
        }
        if self.drop_requests > 0 {
            self.drop_requests -= 1;
            debug!("simulator dropped {}", hex::encode(frame));
            return;
        }

        let reply = if frame.len() == PX100_REQUEST_LEN
            && frame[..2] == PX100_HEADER
            && frame[5] == PX100_TRAILER
        {
            self.px100(frame[2], [frame[3], frame[4]])
        } else if frame.len() == ATORCH_REQUEST_LEN
            && frame[..2] == ATORCH_SYNC
            && frame[2] == ATORCH_COMMAND
            && verify_frame(frame)
        {
            Some(self.atorch(frame[4], [frame[5], frame[6], frame[7], frame[8]]))
        } else {
            None
        };

        let Some(reply) = reply else {
            debug!("simulator ignored {}", hex::encode(frame));
            return;
        };
        let noise = std::mem::take(&mut self.before_reply);
        self.outbox.extend(noise);
        if std::mem::take(&mut self.broadcast_before_reply) {
            let broadcast = self.broadcast();
            self.outbox.extend(broadcast);
        }
        self.outbox.extend(reply);
    }

    fn px100(&mut self, cmd: u8, data: [u8; 2]) -> Option<Vec<u8>> {
        let decimal = u32::from(data[0]) * 100 + u32::from(data[1]);
        if Px100Command::is_set(cmd) {
            if !self.refuse_sets {
                match cmd {
                    0x01 => self.output_on = data[0] != 0,
                    0x02 => self.set_current = decimal,
                    0x03 => self.set_cutoff = decimal,
                    0x04 => self.set_timer_secs = u32::from(u16::from_be_bytes(data)),
                    0x05 => {
                        self.milliamp_hours = 0;
                        self.milliwatt_hours = 0;
                        self.timer_secs = 0;
                    }
                    _ => return None,
                }
            }
            return Some(vec![SHORT_ACK]);
        }

        let value = match cmd {
            0x10 => u32::from(self.output_on),
            0x11 => self.millivolts,
            0x12 => self.milliamps,
            0x13 => hms(self.timer_secs),
            0x14 => self.milliamp_hours,
            0x15 => self.milliwatt_hours,
            0x16 => self.temperature,
            0x17 => self.set_current,
            0x18 => self.set_cutoff,
            0x19 => hms(self.set_timer_secs),
            _ => return None,
        };
        Some(query_reply(value & 0x00FF_FFFF))
    }

    fn atorch(&mut self, cmd: u8, data: [u8; 4]) -> Vec<u8> {
        let supported = match cmd {
            c if c == AtorchCommand::ClearAll.code() => {
                self.milliamp_hours = 0;
                self.milliwatt_hours = 0;
                self.timer_secs = 0;
                true
            }
            c if c == AtorchCommand::ClearCapacity.code() => {
                self.milliamp_hours = 0;
                true
            }
            c if c == AtorchCommand::ClearTime.code() => {
                self.timer_secs = 0;
                true
            }
            c if c == AtorchCommand::SetBacklight.code() => {
                self.backlight = data[0];
                true
            }
            c if c == AtorchCommand::SetCost.code() => {
                self.price = u32::from_be_bytes([0, data[0], data[2], data[3]]);
                true
            }
            c if c == AtorchCommand::ButtonOk.code() => {
                self.output_on = !self.output_on;
                true
            }
            c if c == AtorchCommand::ButtonSetup.code()
                || c == AtorchCommand::ButtonRight.code()
                || c == AtorchCommand::ButtonLeft.code() =>
            {
                true
            }
            _ => false,
        };

        let mut reply = vec![0u8; COMMAND_REPLY_LEN];
        reply[..2].copy_from_slice(&ATORCH_SYNC);
        reply[2] = ATORCH_REPLY;
        reply[3] = if supported { 0x01 } else { 0x03 };
        reply[COMMAND_REPLY_LEN - 1] = atorch_checksum(&reply[2..COMMAND_REPLY_LEN - 1]);
        reply
    }
}

/// Shared view of a [`SimulatedLoad`]
#[derive(Debug, Clone, Default)]
pub struct SimHandle {
    device: Arc<Mutex<SimDevice>>,
}

impl SimHandle {
    /// Read or change device registers
    pub fn with_device<R>(&self, f: impl FnOnce(&mut SimDevice) -> R) -> R {
        f(&mut self.device.lock())
    }

    /// Every frame the host has written so far
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.device.lock().requests.clone()
    }

    /// Queue bytes for the host right away
    pub fn inject(&self, bytes: &[u8]) {
        self.device.lock().outbox.extend(bytes.iter().copied());
    }

    /// Emit `bytes` ahead of the next reply
    pub fn inject_before_reply(&self, bytes: &[u8]) {
        self.device.lock().before_reply.extend_from_slice(bytes);
    }

    /// Emit a status broadcast ahead of the next reply
    pub fn inject_broadcast_before_reply(&self) {
        self.device.lock().broadcast_before_reply = true;
    }

    /// Queue a status broadcast now
    pub fn push_broadcast(&self) {
        let mut device = self.device.lock();
        let frame = device.broadcast();
        device.outbox.extend(frame);
    }
}

/// Transport backed by a [`SimDevice`]
pub struct SimulatedLoad {
    handle: SimHandle,
    state: ConnectionState,
    stats: TransportStats,
    events: broadcast::Sender<TransportEvent>,
}

impl SimulatedLoad {
    /// Simulated DC load with default registers
    pub fn new() -> Self {
        Self::with_device(SimDevice::default())
    }

    /// Simulated load starting from the given registers
    pub fn with_device(device: SimDevice) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            handle: SimHandle {
                device: Arc::new(Mutex::new(device)),
            },
            state: ConnectionState::Disconnected,
            stats: TransportStats::default(),
            events,
        }
    }

    /// Handle for steering the device from a test
    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

impl Default for SimulatedLoad {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for SimulatedLoad {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.handle.device.lock().fail_connect {
            self.stats.errors += 1;
            return Err(TransportError::ConnectionFailed {
                target: "simulator".to_string(),
                attempts: CONNECT_ATTEMPTS,
                reason: "connection refused".to_string(),
            });
        }
        self.state = ConnectionState::Connected;
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state = ConnectionState::Disconnected;
        let _ = self.events.send(TransportEvent::Closed);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.ensure_connected()?;
        self.handle.device.lock().handle_request(data);
        self.stats.bytes_sent += data.len() as u64;
        self.stats.packets_sent += 1;
        Ok(data.len())
    }

    async fn available(&mut self) -> Result<usize, TransportError> {
        self.ensure_connected()?;
        Ok(self.handle.device.lock().outbox.len())
    }

    async fn receive(&mut self, max: usize) -> Result<Bytes, TransportError> {
        self.ensure_connected()?;
        let mut device = self.handle.device.lock();
        let count = max.min(device.outbox.len());
        let bytes: Vec<u8> = device.outbox.drain(..count).collect();
        if !bytes.is_empty() {
            self.stats.bytes_received += bytes.len() as u64;
            self.stats.packets_received += 1;
        }
        Ok(Bytes::from(bytes))
    }

    async fn flush_input(&mut self) -> Result<usize, TransportError> {
        self.ensure_connected()?;
        let mut device = self.handle.device.lock();
        let dropped = device.outbox.len();
        device.outbox.clear();
        Ok(dropped)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Simulated
    }

    fn connection_info(&self) -> String {
        "simulated DL24".to_string()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
