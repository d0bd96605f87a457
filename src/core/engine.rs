//! Request/response engine
//!
//! Owns the transport, the receive buffer and the broadcast-derived device
//! state of one instrument. Exactly one request is in flight at a time: a
//! command is encoded, written, and the receive side is polled at a fixed
//! interval until a reply of the expected class shows up or the wait budget
//! runs out. Broadcasts decoded while waiting update [`DeviceState`] and never
//! count as a reply.

use crate::core::protocol::framing::{Expectation, FrameDecoder};
use crate::core::protocol::packet::{encode_atorch, encode_px100, Packet, Px100Command};
use crate::core::state::DeviceState;
use crate::core::transport::{DeviceTransport, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Wait budget for raw byte pass-through
const RAW_WAIT_RETRIES: u32 = 30;

/// Retry and timing knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Times a request is re-sent before giving up
    pub retries: u32,
    /// Polls per wait (Family A multiplies by the attempt number)
    pub wait_retries: u32,
    /// Interval between polls, milliseconds
    pub retry_delay_ms: u64,
    /// Set-and-verify rounds for settings
    pub command_retries: u32,
    /// Read settings back after writing them
    pub verify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            wait_retries: 50,
            retry_delay_ms: 50,
            command_retries: 3,
            verify: true,
        }
    }
}

impl EngineConfig {
    /// Longer waits and more resends for flaky wireless links
    #[must_use]
    pub fn robust(mut self) -> Self {
        self.retries = self.retries.saturating_mul(2);
        self.wait_retries = self.wait_retries.saturating_mul(2);
        self
    }

    /// Give up after the first timeout
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.retries = 1;
        self.command_retries = 1;
        self
    }

    /// Poll interval, never shorter than a millisecond
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.max(1))
    }
}

/// Reply shapes a request can be satisfied by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// Family A set command: `0x6F`
    ShortAck,
    /// Family A query: query reply (or an Atorch command reply)
    Data,
    /// Family B command: short ack or Atorch command reply
    Acknowledge,
    /// Raw pass-through: any non-broadcast packet
    Any,
}

impl ReplyClass {
    /// Sync bytes the decoder should recognise while waiting
    pub fn expectation(self) -> Expectation {
        match self {
            Self::ShortAck | Self::Acknowledge => Expectation {
                short_ack: true,
                query: false,
            },
            Self::Data => Expectation {
                short_ack: false,
                query: true,
            },
            Self::Any => Expectation {
                short_ack: true,
                query: true,
            },
        }
    }

    /// Whether `packet` satisfies a request of this class
    pub fn accepts(self, packet: &Packet) -> bool {
        match (self, packet) {
            (_, Packet::Broadcast(_)) => false,
            (Self::ShortAck, Packet::ShortAck) => true,
            (Self::Data, Packet::QueryReply { .. } | Packet::CommandReply { .. }) => true,
            (Self::Acknowledge, Packet::ShortAck | Packet::CommandReply { .. }) => true,
            (Self::Any, _) => true,
            _ => false,
        }
    }
}

/// How the wait budget evolves over resends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitPolicy {
    /// `wait_retries * (attempt + 1)`
    Growing,
    /// `wait_retries` every time
    Fixed,
}

impl WaitPolicy {
    /// Reply polls allowed for the given zero-based attempt
    fn budget(self, wait_retries: u32, attempt: u32) -> u32 {
        match self {
            Self::Growing => wait_retries.saturating_mul(attempt.saturating_add(1)),
            Self::Fixed => wait_retries,
        }
    }
}

/// The request currently in flight
#[derive(Debug)]
struct PendingRequest {
    name: String,
    frame: Vec<u8>,
    class: ReplyClass,
    policy: WaitPolicy,
}

/// Command-level failure
#[derive(Error, Debug)]
pub enum CommandError {
    /// No matching reply within the retry budget
    #[error("no response to {command}")]
    Timeout {
        /// Request name
        command: String,
    },

    /// A reply arrived but had the wrong shape
    #[error("unexpected {reply} in response to {command}")]
    UnexpectedReply {
        /// Request name
        command: String,
        /// Kind of packet received
        reply: &'static str,
    },

    /// The transport failed and could not recover
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Single-instrument command engine
pub struct CommandEngine<T> {
    transport: T,
    decoder: FrameDecoder,
    state: DeviceState,
    config: EngineConfig,
}

impl<T: DeviceTransport> CommandEngine<T> {
    /// Wrap a transport. Nothing is sent until the first command.
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
            state: DeviceState::new(),
            config,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Mutable engine configuration
    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    /// Broadcast-derived device state
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Mutable device state, for the update marker
    pub fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Frame decoder, for its counters
    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    /// Pull whatever the transport has, decode it, and apply broadcasts.
    ///
    /// Returns the non-broadcast packets decoded by this read.
    pub async fn poll(&mut self) -> Result<Vec<Packet>, TransportError> {
        let available = self.transport.available().await?;
        if available == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.transport.receive(available).await?;
        self.decoder.push(&bytes);

        let mut replies = Vec::new();
        for packet in self.decoder.drain() {
            match packet {
                Packet::Broadcast(frame) => self.state.apply_broadcast(&frame),
                other => replies.push(other),
            }
        }
        Ok(replies)
    }

    /// Poll at the configured interval until a packet of `class` arrives.
    ///
    /// Returns `None` once `budget` polls came up empty.
    async fn wait_for_reply(
        &mut self,
        class: ReplyClass,
        budget: u32,
    ) -> Result<Option<Packet>, TransportError> {
        let delay = self.config.retry_delay();
        let mut ticker = interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for _ in 0..budget {
            ticker.tick().await;
            for packet in self.poll().await? {
                if class.accepts(&packet) {
                    return Ok(Some(packet));
                }
                debug!("stale {} discarded while waiting", packet.kind());
            }
        }
        warn!("REPLY TIMEOUT");
        Ok(None)
    }

    async fn issue(&mut self, request: PendingRequest) -> Result<Packet, CommandError> {
        let result = self.run(&request).await;
        self.decoder.set_expectation(Expectation::IDLE);
        result
    }

    async fn run(&mut self, request: &PendingRequest) -> Result<Packet, CommandError> {
        for attempt in 0..self.config.retries {
            self.decoder.clear();
            self.decoder.set_expectation(request.class.expectation());
            debug!("SEND {}: {}", request.name, hex::encode(&request.frame));
            self.transport.send(&request.frame).await?;

            let budget = request.policy.budget(self.config.wait_retries, attempt);
            if let Some(packet) = self.wait_for_reply(request.class, budget).await? {
                return Ok(packet);
            }
            if attempt + 1 < self.config.retries {
                debug!("resending {} (attempt {})", request.name, attempt + 2);
            }
        }
        warn!("no response to {}", request.name);
        Err(CommandError::Timeout {
            command: request.name.clone(),
        })
    }

    /// Send a Family A frame and wait for the matching reply class
    pub async fn px100(&mut self, cmd: u8, data: [u8; 2]) -> Result<Packet, CommandError> {
        let class = if Px100Command::is_set(cmd) {
            ReplyClass::ShortAck
        } else {
            ReplyClass::Data
        };
        self.issue(PendingRequest {
            name: format!("PX100 command {cmd:02x}"),
            frame: encode_px100(cmd, data).to_vec(),
            class,
            policy: WaitPolicy::Growing,
        })
        .await
    }

    /// Family A set command, acknowledged by a short ack
    pub async fn px100_set(&mut self, cmd: Px100Command, data: [u8; 2]) -> Result<(), CommandError> {
        self.issue(PendingRequest {
            name: cmd.name().to_string(),
            frame: encode_px100(cmd.code(), data).to_vec(),
            class: ReplyClass::ShortAck,
            policy: WaitPolicy::Growing,
        })
        .await
        .map(|_| ())
    }

    /// Family A query returning the raw 24-bit value
    pub async fn px100_query(&mut self, cmd: Px100Command) -> Result<u32, CommandError> {
        let packet = self
            .issue(PendingRequest {
                name: cmd.name().to_string(),
                frame: encode_px100(cmd.code(), [0, 0]).to_vec(),
                class: ReplyClass::Data,
                policy: WaitPolicy::Growing,
            })
            .await?;
        match packet {
            Packet::QueryReply { value } => {
                debug!("PX100-value ({}): {}", cmd.name(), value);
                Ok(value)
            }
            other => {
                warn!("bad PX100 response ({}): {}", cmd.name(), other.kind());
                Err(CommandError::UnexpectedReply {
                    command: cmd.name().to_string(),
                    reply: other.kind(),
                })
            }
        }
    }

    /// Send a Family B frame addressed with the observed device sub-type
    pub async fn atorch(&mut self, cmd: u8, data: [u8; 4]) -> Result<Packet, CommandError> {
        let adu = self.state.adu();
        self.issue(PendingRequest {
            name: format!("Atorch command {cmd:02x}"),
            frame: encode_atorch(adu, cmd, data).to_vec(),
            class: ReplyClass::Acknowledge,
            policy: WaitPolicy::Fixed,
        })
        .await
    }

    /// Write arbitrary bytes once and wait for any decodable reply
    pub async fn send_bytes(&mut self, raw: &[u8]) -> Result<Packet, CommandError> {
        self.decoder.set_expectation(ReplyClass::Any.expectation());
        debug!("SEND raw: {}", hex::encode(raw));
        let result = match self.transport.send(raw).await {
            Ok(_) => self.wait_for_reply(ReplyClass::Any, RAW_WAIT_RETRIES).await,
            Err(e) => Err(e),
        };
        self.decoder.set_expectation(Expectation::IDLE);
        result?.ok_or_else(|| CommandError::Timeout {
            command: "raw send".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::packet::{AtorchCommand, ReplyOutcome, SHORT_ACK};
    use crate::core::simulator::SimulatedLoad;
    use crate::core::transport::MockDeviceTransport;

    fn engine() -> (CommandEngine<SimulatedLoad>, crate::core::simulator::SimHandle) {
        let sim = SimulatedLoad::new();
        let handle = sim.handle();
        (CommandEngine::new(sim, EngineConfig::default()), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_returns_raw_value() {
        let (mut engine, handle) = engine();
        handle.with_device(|d| d.millivolts = 12_345);
        engine.transport_mut().connect().await.unwrap();

        let value = engine.px100_query(Px100Command::GetVoltage).await.unwrap();
        assert_eq!(value, 12_345);
        assert_eq!(
            handle.requests(),
            vec![vec![0xB1, 0xB2, 0x11, 0x00, 0x00, 0xB6]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_acks_do_not_satisfy_query() {
        let (mut engine, handle) = engine();
        handle.with_device(|d| d.milliamps = 1_500);
        handle.inject_before_reply(&[SHORT_ACK, SHORT_ACK, SHORT_ACK]);
        engine.transport_mut().connect().await.unwrap();

        let value = engine.px100_query(Px100Command::GetCurrent).await.unwrap();
        assert_eq!(value, 1_500);
        assert_eq!(handle.requests().len(), 1);
        assert_eq!(engine.decoder().discarded(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_after_growing_waits() {
        let (mut engine, handle) = engine();
        handle.with_device(|d| d.silent = true);
        engine.transport_mut().connect().await.unwrap();

        let started = Instant::now();
        let err = engine.px100_query(Px100Command::GetVoltage).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert_eq!(handle.requests().len(), 3);

        // 50 + 100 + 150 polls at 50 ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(15_100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_dropped_request() {
        let (mut engine, handle) = engine();
        handle.with_device(|d| {
            d.drop_requests = 1;
            d.set_current = 123;
        });
        engine.transport_mut().connect().await.unwrap();

        let value = engine
            .px100_query(Px100Command::GetSetCurrent)
            .await
            .unwrap();
        assert_eq!(value, 123);
        assert_eq!(handle.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_while_waiting_updates_state() {
        let (mut engine, handle) = engine();
        handle.with_device(|d| {
            d.millivolts = 12_500;
            d.milliamps = 800;
        });
        handle.inject_broadcast_before_reply();
        engine.transport_mut().connect().await.unwrap();

        engine.px100_set(Px100Command::SetOnOff, [1, 0]).await.unwrap();
        assert_eq!(engine.state().broadcast_count(), 1);
        assert_eq!(engine.state().measurements().voltage, Some(12.5));
        assert_eq!(engine.state().measurements().current, Some(0.8));
        assert!(handle.with_device(|d| d.output_on));
    }

    #[tokio::test(start_paused = true)]
    async fn test_atorch_command_uses_observed_adu() {
        let (mut engine, handle) = engine();
        handle.with_device(|d| d.variant = 3);
        engine.transport_mut().connect().await.unwrap();

        handle.push_broadcast();
        engine.poll().await.unwrap();
        assert_eq!(engine.state().adu(), 3);

        let reply = engine
            .atorch(AtorchCommand::ButtonSetup.code(), [0; 4])
            .await
            .unwrap();
        assert_eq!(
            reply,
            Packet::CommandReply {
                outcome: ReplyOutcome::Ok,
                payload: [0, 0, 0]
            }
        );
        let requests = handle.requests();
        assert_eq!(requests[0][3], 3);
        assert_eq!(requests[0][4], 0x31);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_bytes_waits_for_any_reply() {
        let (mut engine, handle) = engine();
        handle.with_device(|d| d.temperature = 31);
        engine.transport_mut().connect().await.unwrap();

        let reply = engine
            .send_bytes(&[0xB1, 0xB2, 0x16, 0x00, 0x00, 0xB6])
            .await
            .unwrap();
        assert_eq!(reply, Packet::QueryReply { value: 31 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_a_transport_error() {
        let mut transport = MockDeviceTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Err(TransportError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "gone",
            )))
        });
        let mut engine = CommandEngine::new(transport, EngineConfig::default());

        let err = engine.px100_query(Px100Command::GetVoltage).await.unwrap_err();
        assert!(matches!(err, CommandError::Transport(TransportError::IoError(_))));
        assert_eq!(engine.decoder().expectation(), Expectation::IDLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_config_sends_once() {
        let (mut engine, handle) = engine();
        *engine.config_mut() = EngineConfig::default().no_retry();
        handle.with_device(|d| d.silent = true);
        engine.transport_mut().connect().await.unwrap();

        assert!(engine.px100_set(Px100Command::ResetCounters, [0, 0]).await.is_err());
        assert_eq!(handle.requests().len(), 1);
    }

    #[test]
    fn test_reply_class_acceptance() {
        let ack = Packet::ShortAck;
        let query = Packet::QueryReply { value: 1 };
        assert!(ReplyClass::ShortAck.accepts(&ack));
        assert!(!ReplyClass::ShortAck.accepts(&query));
        assert!(!ReplyClass::Data.accepts(&ack));
        assert!(ReplyClass::Data.accepts(&query));
        assert!(ReplyClass::Acknowledge.accepts(&ack));
        assert!(ReplyClass::Any.accepts(&query));
    }

    #[test]
    fn test_config_presets() {
        let robust = EngineConfig::default().robust();
        assert_eq!(robust.retries, 6);
        assert_eq!(robust.wait_retries, 100);
        let config: EngineConfig = toml::from_str("retry_delay_ms = 20").unwrap();
        assert_eq!(config.retry_delay(), Duration::from_millis(20));
        assert_eq!(config.retries, 3);
    }

    #[test]
    fn test_large_retry_settings_saturate() {
        let config = EngineConfig {
            retries: u32::MAX,
            wait_retries: u32::MAX - 1,
            ..EngineConfig::default()
        }
        .robust();
        assert_eq!(config.retries, u32::MAX);
        assert_eq!(config.wait_retries, u32::MAX);

        assert_eq!(WaitPolicy::Growing.budget(50, 0), 50);
        assert_eq!(WaitPolicy::Growing.budget(50, 2), 150);
        assert_eq!(WaitPolicy::Growing.budget(u32::MAX / 2, 3), u32::MAX);
        assert_eq!(WaitPolicy::Fixed.budget(u32::MAX, 9), u32::MAX);

        let config: EngineConfig = toml::from_str("retry_delay_ms = 0").unwrap();
        assert_eq!(config.retry_delay(), Duration::from_millis(1));
    }
}
