//! Instrument facade
//!
//! [`Instrument`] is the session object a front end talks to. It owns the
//! command engine and exposes typed operations: measurements, verified
//! settings, counters, buttons, and a merged state report.

use crate::core::engine::{CommandEngine, CommandError, EngineConfig};
use crate::core::protocol::packet::{
    split_decimal, AtorchCommand, Family, Packet, Px100Command, ReplyOutcome,
};
use crate::core::state::{DeviceState, DeviceVariant, Measurements};
use crate::core::transport::{DeviceTransport, TransportError};
use chrono::{Local, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Highest sink current the load accepts, amps
pub const CURRENT_LIMIT: f64 = 24.1;
/// Highest cutoff voltage the load accepts, volts
pub const CUTOFF_LIMIT: f64 = 255.2;

/// Instrument-level failure
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// No reply within the retry budget
    #[error("no response to {command}")]
    CommandTimeout {
        /// Request name
        command: String,
    },

    /// A reply arrived with the wrong shape
    #[error("unexpected {reply} in response to {command}")]
    UnexpectedReply {
        /// Request name
        command: String,
        /// Kind of packet received
        reply: &'static str,
    },

    /// The device answered but the setting did not stick
    #[error("cannot set {setting}: desired={desired}, actual={}", fmt_actual(.actual))]
    SetVerificationFailed {
        /// Setting name
        setting: &'static str,
        /// Requested value
        desired: f64,
        /// Last value read back, if any
        actual: Option<f64>,
    },

    /// The device rejected an Atorch command
    #[error("{command} refused ({outcome})")]
    Refused {
        /// Request name
        command: String,
        /// Outcome byte of the reply
        outcome: ReplyOutcome,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Bad argument from the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn fmt_actual(actual: &Option<f64>) -> String {
    actual.map_or_else(|| "none".to_string(), |v| v.to_string())
}

impl From<CommandError> for InstrumentError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout { command } => Self::CommandTimeout { command },
            CommandError::UnexpectedReply { command, reply } => {
                Self::UnexpectedReply { command, reply }
            }
            CommandError::Transport(e) => Self::Transport(e),
        }
    }
}

/// Values readable with a Family A query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    /// Load enabled (0/1)
    Output,
    /// Measured voltage
    Voltage,
    /// Measured current
    Current,
    /// Configured sink current
    SetCurrent,
    /// Configured cutoff voltage
    Cutoff,
    /// Capacity counter
    AmpHours,
    /// Energy counter
    WattHours,
    /// MOSFET temperature
    Temperature,
}

impl Measurement {
    /// Every measurement, in display order
    pub const ALL: [Measurement; 8] = [
        Self::Output,
        Self::Voltage,
        Self::Current,
        Self::SetCurrent,
        Self::Cutoff,
        Self::AmpHours,
        Self::WattHours,
        Self::Temperature,
    ];

    /// Query command
    pub fn command(self) -> Px100Command {
        match self {
            Self::Output => Px100Command::GetOnOff,
            Self::Voltage => Px100Command::GetVoltage,
            Self::Current => Px100Command::GetCurrent,
            Self::SetCurrent => Px100Command::GetSetCurrent,
            Self::Cutoff => Px100Command::GetSetCutoff,
            Self::AmpHours => Px100Command::GetAmpHours,
            Self::WattHours => Px100Command::GetWattHours,
            Self::Temperature => Px100Command::GetTemperature,
        }
    }

    /// Raw register value per unit
    pub fn divisor(self) -> f64 {
        match self {
            Self::Output | Self::Temperature => 1.0,
            Self::SetCurrent | Self::Cutoff => 100.0,
            Self::Voltage | Self::Current | Self::AmpHours | Self::WattHours => 1000.0,
        }
    }

    /// Short key, as used on the command line and in reports
    pub fn key(self) -> &'static str {
        match self {
            Self::Output => "out",
            Self::Voltage => "V",
            Self::Current => "A",
            Self::SetCurrent => "Iset",
            Self::Cutoff => "Vcut",
            Self::AmpHours => "Ah",
            Self::WattHours => "Wh",
            Self::Temperature => "temp",
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Measurement {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "out" | "output" | "onoff" => Ok(Self::Output),
            "v" | "volt" | "voltage" => Ok(Self::Voltage),
            "a" | "amp" | "current" => Ok(Self::Current),
            "iset" | "setcurrent" => Ok(Self::SetCurrent),
            "vcut" | "cutoff" => Ok(Self::Cutoff),
            "ah" => Ok(Self::AmpHours),
            "wh" => Ok(Self::WattHours),
            "temp" | "temperature" => Ok(Self::Temperature),
            other => Err(InstrumentError::InvalidArgument(format!(
                "unknown measurement {other:?}"
            ))),
        }
    }
}

/// Unit handling for [`Instrument::get_measurement`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
    /// Volts, amps, amp-hours, watt-hours
    #[default]
    Scaled,
    /// Register value as sent by the device
    Raw,
}

/// Front-panel buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    /// Setup
    Setup,
    /// OK, toggles the load
    OnOff,
    /// Right / plus
    Plus,
    /// Left / minus
    Minus,
}

impl Button {
    fn command(self) -> AtorchCommand {
        match self {
            Self::Setup => AtorchCommand::ButtonSetup,
            Self::OnOff => AtorchCommand::ButtonOk,
            Self::Plus => AtorchCommand::ButtonRight,
            Self::Minus => AtorchCommand::ButtonLeft,
        }
    }
}

impl FromStr for Button {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "setup" | "set" => Ok(Self::Setup),
            "ok" | "onoff" => Ok(Self::OnOff),
            "plus" | "right" | "+" => Ok(Self::Plus),
            "minus" | "left" | "-" => Ok(Self::Minus),
            other => Err(InstrumentError::InvalidArgument(format!(
                "unknown button {other:?}"
            ))),
        }
    }
}

/// Counters cleared by Family B commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Capacity, energy and time
    All,
    /// Capacity only
    Capacity,
    /// Run time only
    Time,
}

impl CounterKind {
    fn command(self) -> AtorchCommand {
        match self {
            Self::All => AtorchCommand::ClearAll,
            Self::Capacity => AtorchCommand::ClearCapacity,
            Self::Time => AtorchCommand::ClearTime,
        }
    }
}

impl FromStr for CounterKind {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "capacity" | "ah" => Ok(Self::Capacity),
            "time" => Ok(Self::Time),
            other => Err(InstrumentError::InvalidArgument(format!(
                "unknown counter {other:?}"
            ))),
        }
    }
}

/// Timestamp style for state reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// Local wall clock
    Local,
    /// UTC
    Utc,
}

/// What [`Instrument::read_state`] queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Report only what broadcasts carried, send nothing
    pub listen_only: bool,
    /// Stop after on/off and voltage
    pub short: bool,
    /// Include Ah and Wh
    pub energy: bool,
    /// Include configured current and cutoff
    pub limits: bool,
    /// Include temperature
    pub temperature: bool,
    /// Add a timestamp
    pub timestamp: Option<TimestampMode>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            listen_only: false,
            short: true,
            energy: true,
            limits: true,
            temperature: true,
            timestamp: None,
        }
    }
}

impl ReadOptions {
    /// Every query
    pub fn full() -> Self {
        Self {
            short: false,
            ..Self::default()
        }
    }

    /// On/off, voltage and current only
    pub fn basic() -> Self {
        Self {
            short: false,
            energy: false,
            limits: false,
            temperature: false,
            ..Self::default()
        }
    }

    /// Broadcast data only
    pub fn listen_only() -> Self {
        Self {
            listen_only: true,
            ..Self::default()
        }
    }

    /// Add a timestamp
    #[must_use]
    pub fn with_timestamp(mut self, mode: TimestampMode) -> Self {
        self.timestamp = Some(mode);
        self
    }
}

/// How long [`Instrument::listen`] keeps reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    /// Queries made for each report
    pub read: ReadOptions,
    /// Stop after this many reports
    pub count: Option<u64>,
    /// Stop once the output reads off
    pub until_off: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            read: ReadOptions::listen_only(),
            count: None,
            until_off: false,
        }
    }
}

/// Why [`Instrument::listen`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenEnd {
    /// The requested number of reports was produced
    Count,
    /// The load was switched off
    OutputOff,
}

/// Queried values merged over the broadcast snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateReport {
    /// ISO-8601 timestamp, millisecond precision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Load enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<bool>,
    /// Measurements
    #[serde(flatten)]
    pub measurements: Measurements,
    /// Configured current, amps
    #[serde(rename = "Iset", skip_serializing_if = "Option::is_none")]
    pub set_current: Option<f64>,
    /// Configured cutoff, volts
    #[serde(rename = "Vcut", skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<f64>,
}

/// A verifiable Family A setting
struct Setting {
    name: &'static str,
    set: Px100Command,
    get: Px100Command,
    /// Readback register to setting units
    decode: fn(u32) -> u32,
    /// Setting units per displayed unit
    scale: f64,
}

const OUTPUT: Setting = Setting {
    name: "output",
    set: Px100Command::SetOnOff,
    get: Px100Command::GetOnOff,
    decode: identity,
    scale: 1.0,
};

const CURRENT: Setting = Setting {
    name: "current",
    set: Px100Command::SetCurrent,
    get: Px100Command::GetSetCurrent,
    decode: identity,
    scale: 100.0,
};

const CUTOFF: Setting = Setting {
    name: "cutoff voltage",
    set: Px100Command::SetCutoff,
    get: Px100Command::GetSetCutoff,
    decode: identity,
    scale: 100.0,
};

const TIMER: Setting = Setting {
    name: "timer",
    set: Px100Command::SetTimer,
    get: Px100Command::GetSetTimer,
    decode: hms_to_secs,
    scale: 1.0,
};

fn identity(raw: u32) -> u32 {
    raw
}

fn hms_to_secs(raw: u32) -> u32 {
    let [_, hours, minutes, seconds] = raw.to_be_bytes();
    u32::from(hours) * 3600 + u32::from(minutes) * 60 + u32::from(seconds)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One connected load
pub struct Instrument<T> {
    engine: CommandEngine<T>,
    off_on_close: bool,
}

impl<T: DeviceTransport> Instrument<T> {
    /// Wrap a transport; call [`Instrument::connect`] before use
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self {
            engine: CommandEngine::new(transport, config),
            off_on_close: false,
        }
    }

    /// Switch the output off when the session is closed
    #[must_use]
    pub fn with_off_on_close(mut self, enabled: bool) -> Self {
        self.off_on_close = enabled;
        self
    }

    /// Command engine
    pub fn engine(&self) -> &CommandEngine<T> {
        &self.engine
    }

    /// Mutable command engine
    pub fn engine_mut(&mut self) -> &mut CommandEngine<T> {
        &mut self.engine
    }

    /// Broadcast-derived state
    pub fn state(&self) -> &DeviceState {
        self.engine.state()
    }

    /// Open the transport and drop whatever was queued before
    pub async fn connect(&mut self) -> Result<(), InstrumentError> {
        let transport = self.engine.transport_mut();
        transport.connect().await?;
        let stale = transport.flush_input().await?;
        if stale > 0 {
            debug!("flushed {} stale byte(s)", stale);
        }
        info!("connected: {}", transport.connection_info());
        Ok(())
    }

    /// Close the transport, switching the output off first if configured
    pub async fn close(&mut self) -> Result<(), InstrumentError> {
        if self.off_on_close {
            if let Err(e) = self.set_output(false).await {
                warn!("could not switch output off on close: {}", e);
            }
        }
        self.engine.transport_mut().close().await?;
        Ok(())
    }

    /// Query one register
    pub async fn get_measurement(
        &mut self,
        measurement: Measurement,
        scale: Scale,
    ) -> Result<f64, InstrumentError> {
        let raw = f64::from(self.engine.px100_query(measurement.command()).await?);
        Ok(match scale {
            Scale::Raw => raw,
            Scale::Scaled => raw / measurement.divisor(),
        })
    }

    /// Whether the load is enabled
    pub async fn get_output(&mut self) -> Result<bool, InstrumentError> {
        Ok(self.engine.px100_query(Px100Command::GetOnOff).await? != 0)
    }

    /// Enable or disable the load, verified by readback
    pub async fn set_output(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.set_verified(&OUTPUT, [u8::from(on), 0], u32::from(on))
            .await
    }

    /// Flip the load state, returning the new state
    pub async fn toggle_output(&mut self) -> Result<bool, InstrumentError> {
        let on = !self.get_output().await?;
        self.set_output(on).await?;
        Ok(on)
    }

    /// Set the sink current, optionally relative to the configured value.
    ///
    /// The value is rounded to 10 mA and clamped to `0..=24.1` A. Returns the
    /// value actually requested.
    pub async fn set_current(&mut self, amps: f64, relative: bool) -> Result<f64, InstrumentError> {
        let mut value = amps;
        if relative {
            value += self
                .get_measurement(Measurement::SetCurrent, Scale::Scaled)
                .await?;
        }
        let value = self.clamp_setting("current", value, CURRENT_LIMIT)?;
        let data = split_decimal(value);
        self.set_verified(&CURRENT, data, centi(data)).await?;
        Ok(value)
    }

    /// Set the cutoff voltage, rounded to 10 mV and clamped to `0..=255.2` V
    pub async fn set_cutoff(&mut self, volts: f64) -> Result<f64, InstrumentError> {
        let value = self.clamp_setting("cutoff voltage", volts, CUTOFF_LIMIT)?;
        let data = split_decimal(value);
        self.set_verified(&CUTOFF, data, centi(data)).await?;
        Ok(value)
    }

    fn clamp_setting(&self, name: &str, value: f64, limit: f64) -> Result<f64, InstrumentError> {
        if !value.is_finite() {
            return Err(InstrumentError::InvalidArgument(format!(
                "{name} must be a number, got {value}"
            )));
        }
        let clamped = round2(value).clamp(0.0, limit);
        if clamped != round2(value) {
            debug!("{} {} clamped to {}", name, value, clamped);
        }
        Ok(clamped)
    }

    /// Elapsed discharge time
    pub async fn get_timer(&mut self) -> Result<Duration, InstrumentError> {
        let raw = self.engine.px100_query(Px100Command::GetTimer).await?;
        Ok(Duration::from_secs(u64::from(hms_to_secs(raw))))
    }

    /// Configured discharge timer
    pub async fn get_timer_limit(&mut self) -> Result<Duration, InstrumentError> {
        let raw = self.engine.px100_query(Px100Command::GetSetTimer).await?;
        Ok(Duration::from_secs(u64::from(hms_to_secs(raw))))
    }

    /// Configure the discharge timer, whole seconds up to 65535
    pub async fn set_timer(&mut self, limit: Duration) -> Result<(), InstrumentError> {
        let secs = u16::try_from(limit.as_secs()).map_err(|_| {
            InstrumentError::InvalidArgument(format!(
                "timer {}s exceeds {}s",
                limit.as_secs(),
                u16::MAX
            ))
        })?;
        self.set_verified(&TIMER, secs.to_be_bytes(), u32::from(secs))
            .await
    }

    /// Zero the Ah/Wh/time counters (Family A)
    pub async fn reset_counters(&mut self) -> Result<(), InstrumentError> {
        self.engine
            .px100_set(Px100Command::ResetCounters, [0, 0])
            .await?;
        Ok(())
    }

    /// Zero one counter group (Family B)
    pub async fn clear_counter(&mut self, kind: CounterKind) -> Result<(), InstrumentError> {
        self.atorch_checked(kind.command(), [0; 4]).await
    }

    /// Set the display backlight level
    pub async fn set_backlight(&mut self, level: u8) -> Result<(), InstrumentError> {
        self.atorch_checked(AtorchCommand::SetBacklight, [level, 0, 0, 0])
            .await
    }

    /// Press a front-panel button
    pub async fn press_button(&mut self, button: Button) -> Result<(), InstrumentError> {
        self.atorch_checked(button.command(), [0; 4]).await
    }

    async fn atorch_checked(
        &mut self,
        cmd: AtorchCommand,
        data: [u8; 4],
    ) -> Result<(), InstrumentError> {
        match self.engine.atorch(cmd.code(), data).await? {
            Packet::CommandReply { outcome, .. } if outcome != ReplyOutcome::Ok => {
                warn!("{:?} refused: {}", cmd, outcome);
                Err(InstrumentError::Refused {
                    command: format!("{cmd:?}"),
                    outcome,
                })
            }
            _ => Ok(()),
        }
    }

    /// Read pending input once; true if a new broadcast was applied
    pub async fn poll_once(&mut self) -> Result<bool, InstrumentError> {
        for packet in self.engine.poll().await? {
            debug!("unsolicited {} ignored", packet.kind());
        }
        Ok(self.engine.state_mut().has_new_update())
    }

    /// Report every new status broadcast until a stop condition is met.
    ///
    /// Without a count or `until_off` this only returns on error. With
    /// `until_off` the output state comes from the report when it was queried
    /// and from a separate query otherwise; a query that goes unanswered
    /// keeps listening.
    pub async fn listen<F, E>(
        &mut self,
        options: ListenOptions,
        mut report: F,
    ) -> Result<ListenEnd, E>
    where
        F: FnMut(&StateReport) -> Result<(), E>,
        E: From<InstrumentError>,
    {
        let delay = self.engine.config().retry_delay();
        let mut ticker = interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reported = 0u64;

        loop {
            ticker.tick().await;
            if !self.poll_once().await? {
                continue;
            }
            let state = self.read_state(options.read).await?;
            report(&state)?;
            reported += 1;
            if options.count.is_some_and(|n| reported >= n) {
                return Ok(ListenEnd::Count);
            }
            if !options.until_off {
                continue;
            }
            let on = match state.out {
                Some(on) => on,
                None => match self.get_output().await {
                    Ok(on) => on,
                    Err(
                        InstrumentError::CommandTimeout { .. }
                        | InstrumentError::UnexpectedReply { .. },
                    ) => {
                        debug!("output state unknown, still listening");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            if !on {
                info!("output off after {} report(s)", reported);
                return Ok(ListenEnd::OutputOff);
            }
        }
    }

    /// Wait until a broadcast reveals the device type
    pub async fn wait_for_device(&mut self, max_polls: u32) -> Result<DeviceVariant, InstrumentError> {
        if let Some(variant) = self.state().variant() {
            return Ok(variant);
        }
        let delay = self.engine.config().retry_delay();
        let mut ticker = interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for _ in 0..max_polls {
            ticker.tick().await;
            self.engine.poll().await?;
            if let Some(variant) = self.state().variant() {
                info!("device type {}", variant);
                return Ok(variant);
            }
        }
        Err(InstrumentError::CommandTimeout {
            command: "device type broadcast".to_string(),
        })
    }

    /// Send a frame of either family without interpreting the reply
    pub async fn send_raw(
        &mut self,
        family: Family,
        cmd: u8,
        payload: &[u8],
    ) -> Result<Packet, InstrumentError> {
        let packet = match family {
            Family::Px100 => {
                let mut data = [0u8; 2];
                pad_payload(family, payload, &mut data)?;
                self.engine.px100(cmd, data).await?
            }
            Family::Atorch => {
                let mut data = [0u8; 4];
                pad_payload(family, payload, &mut data)?;
                self.engine.atorch(cmd, data).await?
            }
        };
        Ok(packet)
    }

    /// Write arbitrary bytes and return the first decodable reply
    pub async fn send_bytes(&mut self, raw: &[u8]) -> Result<Packet, InstrumentError> {
        if raw.is_empty() {
            return Err(InstrumentError::InvalidArgument("nothing to send".to_string()));
        }
        Ok(self.engine.send_bytes(raw).await?)
    }

    /// Query the device and merge the answers over the broadcast snapshot.
    ///
    /// Queries that time out leave their field empty.
    pub async fn read_state(&mut self, options: ReadOptions) -> Result<StateReport, InstrumentError> {
        let mut report = StateReport {
            time: options.timestamp.map(|mode| match mode {
                TimestampMode::Local => Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                TimestampMode::Utc => Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            }),
            ..StateReport::default()
        };

        if !options.listen_only {
            report.out = self.query(Measurement::Output).await?.map(|v| v != 0.0);
        }
        report.measurements = self.state().measurements().clone();
        if options.listen_only {
            return Ok(report);
        }

        let m = &mut report.measurements;
        m.voltage = self.query(Measurement::Voltage).await?.or(m.voltage);
        if options.short {
            return Ok(report);
        }

        let m = &mut report.measurements;
        m.current = self.query(Measurement::Current).await?.or(m.current);
        if options.energy {
            m.amp_hours = self.query(Measurement::AmpHours).await?.or(m.amp_hours);
            m.watt_hours = self.query(Measurement::WattHours).await?.or(m.watt_hours);
        }
        if options.limits {
            report.set_current = self.query(Measurement::SetCurrent).await?;
            report.cutoff = self.query(Measurement::Cutoff).await?;
        }
        if options.temperature {
            if let Some(temp) = self.query(Measurement::Temperature).await? {
                report.measurements.temperature = Some(temp as u16);
            }
        }
        Ok(report)
    }

    async fn query(&mut self, measurement: Measurement) -> Result<Option<f64>, InstrumentError> {
        match self.get_measurement(measurement, Scale::Scaled).await {
            Ok(value) => Ok(Some(value)),
            Err(InstrumentError::CommandTimeout { .. } | InstrumentError::UnexpectedReply { .. }) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn set_verified(
        &mut self,
        setting: &Setting,
        data: [u8; 2],
        desired: u32,
    ) -> Result<(), InstrumentError> {
        let config = self.engine.config().clone();
        let mut acknowledged = false;
        let mut actual = None;

        for _ in 0..config.command_retries.max(1) {
            match self.engine.px100_set(setting.set, data).await {
                Ok(()) => acknowledged = true,
                Err(CommandError::Timeout { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            if !config.verify {
                if acknowledged {
                    return Ok(());
                }
                continue;
            }

            match self.engine.px100_query(setting.get).await {
                Ok(raw) => {
                    let value = (setting.decode)(raw);
                    if value == desired {
                        return Ok(());
                    }
                    actual = Some(value);
                    warn!(
                        "cannot set {}, desired={}, actual={}",
                        setting.name,
                        f64::from(desired) / setting.scale,
                        f64::from(value) / setting.scale
                    );
                }
                Err(CommandError::Timeout { .. } | CommandError::UnexpectedReply { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        warn!("{} set failed", setting.name);
        if !acknowledged {
            return Err(InstrumentError::CommandTimeout {
                command: setting.set.name().to_string(),
            });
        }
        Err(InstrumentError::SetVerificationFailed {
            setting: setting.name,
            desired: f64::from(desired) / setting.scale,
            actual: actual.map(|v| f64::from(v) / setting.scale),
        })
    }
}

fn centi(data: [u8; 2]) -> u32 {
    u32::from(data[0]) * 100 + u32::from(data[1])
}

fn pad_payload(family: Family, payload: &[u8], data: &mut [u8]) -> Result<(), InstrumentError> {
    if payload.len() > data.len() {
        return Err(InstrumentError::InvalidArgument(format!(
            "{family} payload takes at most {} bytes, got {}",
            data.len(),
            payload.len()
        )));
    }
    data[..payload.len()].copy_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulator::{SimHandle, SimulatedLoad};

    async fn instrument() -> (Instrument<SimulatedLoad>, SimHandle) {
        let sim = SimulatedLoad::new();
        let handle = sim.handle();
        let mut instrument = Instrument::new(sim, EngineConfig::default());
        instrument.connect().await.unwrap();
        (instrument, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_current_clamps_to_limit() {
        let (mut load, handle) = instrument().await;

        let value = load.set_current(25.0, false).await.unwrap();
        assert_eq!(value, 24.1);
        assert_eq!(handle.requests()[0], vec![0xB1, 0xB2, 0x02, 24, 10, 0xB6]);
        assert_eq!(handle.with_device(|d| d.set_current), 2410);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_current_round_trip() {
        let (mut load, _handle) = instrument().await;

        load.set_current(1.23, false).await.unwrap();
        let value = load
            .get_measurement(Measurement::SetCurrent, Scale::Scaled)
            .await
            .unwrap();
        assert_eq!(value, 1.23);
        let raw = load
            .get_measurement(Measurement::SetCurrent, Scale::Raw)
            .await
            .unwrap();
        assert_eq!(raw, 123.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relative_current() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| d.set_current = 100);

        assert_eq!(load.set_current(0.5, true).await.unwrap(), 1.5);
        assert_eq!(load.set_current(-5.0, true).await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_cutoff_clamps_to_zero() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| d.set_cutoff = 1200);

        assert_eq!(load.set_cutoff(-3.0).await.unwrap(), 0.0);
        assert_eq!(handle.with_device(|d| d.set_cutoff), 0);
        assert_eq!(load.set_cutoff(300.0).await.unwrap(), 255.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_failure_is_distinct() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| d.refuse_sets = true);

        let err = load.set_current(2.0, false).await.unwrap_err();
        match err {
            InstrumentError::SetVerificationFailed {
                setting,
                desired,
                actual,
            } => {
                assert_eq!(setting, "current");
                assert_eq!(desired, 2.0);
                assert_eq!(actual, Some(0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
        // three set/readback rounds
        assert_eq!(handle.requests().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unverified_set_skips_readback() {
        let (mut load, handle) = instrument().await;
        load.engine_mut().config_mut().verify = false;
        handle.with_device(|d| d.refuse_sets = true);

        load.set_output(true).await.unwrap();
        assert_eq!(handle.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_reports_timeout() {
        let sim = SimulatedLoad::new();
        let handle = sim.handle();
        let mut load = Instrument::new(sim, EngineConfig::default().no_retry());
        load.connect().await.unwrap();
        handle.with_device(|d| d.silent = true);

        assert!(matches!(
            load.set_output(true).await,
            Err(InstrumentError::CommandTimeout { .. })
        ));
        assert!(matches!(
            load.get_measurement(Measurement::Voltage, Scale::Scaled).await,
            Err(InstrumentError::CommandTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_and_close_switches_off() {
        let sim = SimulatedLoad::new();
        let handle = sim.handle();
        let mut load = Instrument::new(sim, EngineConfig::default()).with_off_on_close(true);
        load.connect().await.unwrap();

        assert!(load.toggle_output().await.unwrap());
        assert!(handle.with_device(|d| d.output_on));

        load.close().await.unwrap();
        assert!(!handle.with_device(|d| d.output_on));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_get_and_set() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| d.timer_secs = 3_725);

        assert_eq!(load.get_timer().await.unwrap(), Duration::from_secs(3_725));
        load.set_timer(Duration::from_secs(5_400)).await.unwrap();
        assert_eq!(handle.with_device(|d| d.set_timer_secs), 5_400);
        assert_eq!(
            load.get_timer_limit().await.unwrap(),
            Duration::from_secs(5_400)
        );
        assert!(matches!(
            load.set_timer(Duration::from_secs(70_000)).await,
            Err(InstrumentError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_family_b_operations() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| d.milliamp_hours = 900);

        load.press_button(Button::OnOff).await.unwrap();
        assert!(handle.with_device(|d| d.output_on));

        load.clear_counter(CounterKind::Capacity).await.unwrap();
        assert_eq!(handle.with_device(|d| d.milliamp_hours), 0);

        load.set_backlight(10).await.unwrap();
        assert_eq!(handle.with_device(|d| d.backlight), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_raw_returns_reply_unchecked() {
        let (mut load, _handle) = instrument().await;
        let reply = load.send_raw(Family::Atorch, 0x7E, &[]).await.unwrap();
        assert!(matches!(
            reply,
            Packet::CommandReply {
                outcome: ReplyOutcome::Unsupported,
                ..
            }
        ));
        assert!(matches!(
            load.send_raw(Family::Px100, 0x10, &[1, 2, 3]).await,
            Err(InstrumentError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_and_wait_for_device() {
        let (mut load, handle) = instrument().await;
        assert!(!load.poll_once().await.unwrap());
        assert!(matches!(
            load.wait_for_device(5).await,
            Err(InstrumentError::CommandTimeout { .. })
        ));

        handle.with_device(|d| d.millivolts = 4_200);
        handle.push_broadcast();
        assert_eq!(load.wait_for_device(5).await.unwrap(), DeviceVariant::Dc);
        assert!(load.poll_once().await.unwrap());
        assert!(!load.poll_once().await.unwrap());
        assert_eq!(load.state().measurements().voltage, Some(4.2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_state_modes() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| {
            d.output_on = true;
            d.millivolts = 12_000;
            d.milliamps = 1_250;
            d.milliamp_hours = 340;
            d.set_current = 125;
            d.set_cutoff = 1_050;
            d.temperature = 41;
        });
        handle.push_broadcast();
        load.poll_once().await.unwrap();
        let before = handle.requests().len();

        let listen = load.read_state(ReadOptions::listen_only()).await.unwrap();
        assert_eq!(handle.requests().len(), before);
        assert_eq!(listen.out, None);
        assert_eq!(listen.measurements.voltage, Some(12.0));

        let short = load.read_state(ReadOptions::default()).await.unwrap();
        assert_eq!(short.out, Some(true));
        assert_eq!(short.set_current, None);
        let json = serde_json::to_value(&short).unwrap();
        assert_eq!(json["out"], true);
        assert_eq!(json["V"], 12.0);

        let full = load.read_state(ReadOptions::full()).await.unwrap();
        assert_eq!(full.measurements.current, Some(1.25));
        assert_eq!(full.measurements.amp_hours, Some(0.34));
        assert_eq!(full.set_current, Some(1.25));
        assert_eq!(full.cutoff, Some(10.5));
        assert_eq!(full.measurements.temperature, Some(41));

        let stamped = load
            .read_state(ReadOptions::listen_only().with_timestamp(TimestampMode::Utc))
            .await
            .unwrap();
        assert_eq!(stamped.time.map(|t| t.len()), Some(23));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_stops_when_output_switches_off() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| {
            d.output_on = true;
            d.millivolts = 12_000;
        });
        handle.push_broadcast();

        let options = ListenOptions {
            until_off: true,
            ..ListenOptions::default()
        };
        let mut seen = Vec::new();
        let end = load
            .listen(options, |report| {
                seen.push(report.measurements.voltage);
                if seen.len() == 2 {
                    handle.with_device(|d| d.output_on = false);
                }
                handle.push_broadcast();
                Ok::<_, InstrumentError>(())
            })
            .await
            .unwrap();

        assert_eq!(end, ListenEnd::OutputOff);
        assert_eq!(seen, vec![Some(12.0), Some(12.0)]);
        // one on/off query per report, nothing else
        assert_eq!(handle.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_uses_queried_output_state() {
        let (mut load, handle) = instrument().await;
        handle.push_broadcast();

        let options = ListenOptions {
            read: ReadOptions::basic(),
            count: None,
            until_off: true,
        };
        let mut reports = 0;
        let end = load
            .listen(options, |report| {
                assert_eq!(report.out, Some(false));
                reports += 1;
                Ok::<_, InstrumentError>(())
            })
            .await
            .unwrap();

        assert_eq!(end, ListenEnd::OutputOff);
        assert_eq!(reports, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_count_sends_nothing() {
        let (mut load, handle) = instrument().await;
        handle.with_device(|d| d.output_on = true);
        handle.push_broadcast();

        let options = ListenOptions {
            count: Some(3),
            ..ListenOptions::default()
        };
        let mut reports = 0;
        let end = load
            .listen(options, |_| {
                reports += 1;
                handle.push_broadcast();
                Ok::<_, InstrumentError>(())
            })
            .await
            .unwrap();

        assert_eq!(end, ListenEnd::Count);
        assert_eq!(reports, 3);
        assert!(handle.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_propagates_report_errors() {
        let (mut load, handle) = instrument().await;
        handle.push_broadcast();

        let result = load
            .listen(ListenOptions::default(), |_| {
                Err(InstrumentError::InvalidArgument("stdout closed".to_string()))
            })
            .await;
        assert!(matches!(result, Err(InstrumentError::InvalidArgument(_))));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("vcut".parse::<Measurement>().unwrap(), Measurement::Cutoff);
        assert_eq!("Ah".parse::<Measurement>().unwrap(), Measurement::AmpHours);
        assert_eq!("+".parse::<Button>().unwrap(), Button::Plus);
        assert_eq!("time".parse::<CounterKind>().unwrap(), CounterKind::Time);
        assert!("bogus".parse::<Measurement>().is_err());
    }

    #[test]
    fn test_verification_error_message() {
        let err = InstrumentError::SetVerificationFailed {
            setting: "current",
            desired: 1.5,
            actual: None,
        };
        assert_eq!(err.to_string(), "cannot set current: desired=1.5, actual=none");
    }
}
