//! dl24ctl - command-line control of DL24 / PX100 electronic loads
//!
//! Measurements go to stdout, diagnostics to stderr.

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use dl24_core::cli::{
    exit_code_table, format_packet, format_record, format_value, parse_hex, CliResult, ExitCodes,
    OutputFormat,
};
use dl24_core::config::{default_config_path, AppConfig, ConfigError};
use dl24_core::core::engine::EngineConfig;
use dl24_core::core::instrument::{
    Button, CounterKind, Instrument, InstrumentError, ListenOptions, Measurement, ReadOptions,
    Scale, StateReport, TimestampMode,
};
use dl24_core::core::protocol::Family;
use dl24_core::core::transport::{
    create_transport, list_ports, DeviceTransport, SerialConfig, TcpConfig, TransportConfig,
    TransportError,
};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Polls spent waiting for the first status broadcast
const DEVICE_WAIT_POLLS: u32 = 100;

type Load = Instrument<Box<dyn DeviceTransport>>;

/// DL24 electronic load control
#[derive(Parser, Debug)]
#[command(
    name = "dl24ctl",
    version,
    about = "Control Atorch DL24 / PX100 electronic loads over serial or TCP",
    long_about = None,
    after_help = exit_code_table()
)]
struct Cli {
    /// Serial port, PATH[@BAUD] (e.g. /dev/ttyUSB0@9600)
    #[arg(short, long, global = true, conflicts_with = "tcp")]
    port: Option<String>,

    /// TCP bridge, HOST[:PORT]
    #[arg(short, long, global = true)]
    tcp: Option<String>,

    /// Config file (default: user config directory)
    #[arg(short, long, global = true, env = "DL24CTL_CONFIG")]
    config: Option<PathBuf>,

    /// More logging on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Wait for a status broadcast before sending commands
    #[arg(long, global = true)]
    wait: bool,

    /// Longer waits and more resends
    #[arg(long, global = true)]
    robust: bool,

    /// Do not resend timed-out commands
    #[arg(long, global = true, conflicts_with = "robust")]
    no_retry: bool,

    /// Do not read settings back after writing them
    #[arg(long, global = true)]
    no_verify: bool,

    /// Switch the output off on exit
    #[arg(long, global = true)]
    off_on_close: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the device state (default)
    State {
        /// Query everything
        #[arg(long)]
        full: bool,
        /// Query on/off, voltage and current only
        #[arg(long, conflicts_with = "full")]
        basic: bool,
        /// Report broadcast data only, send nothing
        #[arg(long)]
        listen: bool,
        /// Add a local timestamp
        #[arg(long)]
        time: bool,
        /// Add a UTC timestamp
        #[arg(long)]
        utc: bool,
    },

    /// Print status broadcasts until interrupted
    Listen {
        /// Stop after this many broadcasts
        #[arg(short = 'n', long)]
        count: Option<u64>,
        /// Stop once the output is switched off
        #[arg(long)]
        until_off: bool,
        /// Also query on/off and voltage
        #[arg(long)]
        query: bool,
        /// Also query on/off, voltage and current
        #[arg(long, conflicts_with = "query")]
        basic: bool,
        /// Also query everything
        #[arg(long, conflicts_with_all = ["query", "basic"])]
        full: bool,
        /// Add a local timestamp
        #[arg(long)]
        time: bool,
        /// Add a UTC timestamp
        #[arg(long)]
        utc: bool,
    },

    /// Query one value: out, v, a, iset, vcut, ah, wh, temp
    Get {
        /// Value to read
        what: Measurement,
        /// Print the register value unscaled
        #[arg(long)]
        raw: bool,
    },

    /// Switch the load on
    On,

    /// Switch the load off
    Off,

    /// Flip the load state
    Toggle,

    /// Set the sink current in amps; a leading + or - makes it relative
    Current {
        /// Amps, e.g. 1.5, +0.1, -0.25
        #[arg(allow_hyphen_values = true)]
        amps: String,
    },

    /// Set the cutoff voltage in volts
    Cutoff {
        /// Volts
        volts: f64,
    },

    /// Show the discharge timer, or set its limit in seconds
    Timer {
        /// New limit in seconds
        seconds: Option<u64>,
    },

    /// Reset counters: all PX100 counters, or one Atorch group (all, capacity, time)
    Reset {
        /// Counter group
        counter: Option<CounterKind>,
    },

    /// Press a front-panel button: setup, ok, plus, minus
    Button {
        /// Button name
        button: Button,
    },

    /// Set the backlight level
    Backlight {
        /// Level
        level: u8,
    },

    /// Print the device type reported by broadcasts
    Type,

    /// Send an Atorch-style command, e.g. `raw-atorch 21 3c`
    RawAtorch {
        /// Command byte, hex
        #[arg(value_parser = parse_command_byte)]
        cmd: u8,
        /// Up to four payload bytes, hex
        payload: Option<String>,
    },

    /// Send a PX100-style command, e.g. `raw-px100 10`
    RawPx100 {
        /// Command byte, hex
        #[arg(value_parser = parse_command_byte)]
        cmd: u8,
        /// Up to two payload bytes, hex
        payload: Option<String>,
    },

    /// Send raw bytes and print the first decodable reply
    RawSend {
        /// Bytes, hex
        bytes: String,
    },

    /// Print a commented config file template
    ConfigTemplate,

    /// List serial ports
    Ports,
}

fn parse_command_byte(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("{s:?} is not a hex byte: {e}"))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dl24_core={level},dl24ctl={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!("dl24ctl v{}", env!("CARGO_PKG_VERSION"));

    let result = match run(cli).await {
        Ok(result) => result,
        Err(err) => classify(err),
    };
    match (&result, result.message()) {
        (CliResult::Success(_), Some(msg)) => println!("{msg}"),
        (CliResult::Error(..), Some(msg)) => eprintln!("ERROR: {msg}"),
        _ => {}
    }
    result.to_exit_code()
}

fn classify(err: anyhow::Error) -> CliResult {
    let err = match err.downcast::<InstrumentError>() {
        Ok(e) => return e.into(),
        Err(err) => err,
    };
    let err = match err.downcast::<TransportError>() {
        Ok(e) => return e.into(),
        Err(err) => err,
    };
    match err.downcast::<ConfigError>() {
        Ok(e) => e.into(),
        Err(err) => CliResult::error(ExitCodes::ERROR, format!("{err:#}")),
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig, ConfigError> {
    match cli.config.as_deref().map(PathBuf::from).or_else(default_config_path) {
        Some(path) => AppConfig::load_from(&path),
        None => Ok(AppConfig::default()),
    }
}

fn select_transport(cli: &Cli, config: &AppConfig) -> anyhow::Result<Option<TransportConfig>> {
    if let Some(port) = &cli.port {
        let serial: SerialConfig = port.parse()?;
        return Ok(Some(TransportConfig::Serial(serial)));
    }
    if let Some(addr) = &cli.tcp {
        let tcp: TcpConfig = addr.parse()?;
        return Ok(Some(TransportConfig::Tcp(config.tune_tcp(tcp))));
    }
    Ok(config.transport())
}

async fn run(cli: Cli) -> anyhow::Result<CliResult> {
    let format = OutputFormat::from_json_flag(cli.json);

    match &cli.command {
        Some(Commands::ConfigTemplate) => {
            let path = cli.config.clone().or_else(default_config_path);
            return Ok(CliResult::success_with_message(
                AppConfig::template(path.as_deref()).trim_end(),
            ));
        }
        Some(Commands::Ports) => {
            let ports = list_ports()?;
            let names: Vec<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();
            let out = match format {
                OutputFormat::Json => json!(names).to_string(),
                OutputFormat::Text => names.join("\n"),
            };
            return Ok(CliResult::success_with_message(out));
        }
        _ => {}
    }

    let config = load_config(&cli)?;
    let Some(transport) = select_transport(&cli, &config)? else {
        return Ok(CliResult::error(
            ExitCodes::ERROR,
            "unknown serial port or TCP host; use --port PATH[@BAUD] or --tcp HOST[:PORT]",
        ));
    };

    let mut engine: EngineConfig = config.engine.clone();
    if cli.robust {
        engine = engine.robust();
    }
    if cli.no_retry {
        engine = engine.no_retry();
    }
    if cli.no_verify {
        engine.verify = false;
    }

    let mut load: Load = Instrument::new(create_transport(transport), engine)
        .with_off_on_close(cli.off_on_close || config.off_on_close);
    load.connect().await?;

    if cli.wait || config.wait_for_device {
        load.wait_for_device(DEVICE_WAIT_POLLS).await?;
    }

    let command = cli.command.unwrap_or(Commands::State {
        full: false,
        basic: false,
        listen: false,
        time: false,
        utc: false,
    });
    let outcome = execute(&mut load, command, format, config.stop_on_off).await;
    let closed = load.close().await;
    let result = outcome?;
    closed?;
    Ok(result)
}

fn timestamp(time: bool, utc: bool) -> Option<TimestampMode> {
    if utc {
        Some(TimestampMode::Utc)
    } else if time {
        Some(TimestampMode::Local)
    } else {
        None
    }
}

fn payload(hex: Option<&str>) -> Result<Vec<u8>, CliResult> {
    hex.map_or(Ok(Vec::new()), |h| {
        parse_hex(h).map_err(|e| CliResult::invalid_args(format!("bad payload {h:?}: {e}")))
    })
}

async fn execute(
    load: &mut Load,
    command: Commands,
    format: OutputFormat,
    stop_on_off: bool,
) -> anyhow::Result<CliResult> {
    match command {
        Commands::State {
            full,
            basic,
            listen,
            time,
            utc,
        } => {
            let mut options = if listen {
                ReadOptions::listen_only()
            } else if full {
                ReadOptions::full()
            } else if basic {
                ReadOptions::basic()
            } else {
                ReadOptions::default()
            };
            options.timestamp = timestamp(time, utc);
            if listen {
                load.wait_for_device(DEVICE_WAIT_POLLS).await?;
            }
            let report = load.read_state(options).await?;
            Ok(CliResult::success_with_message(format_record(&report, format)?))
        }

        Commands::Listen {
            count,
            until_off,
            query,
            basic,
            full,
            time,
            utc,
        } => {
            let mut read = if full {
                ReadOptions::full()
            } else if basic {
                ReadOptions::basic()
            } else if query {
                ReadOptions::default()
            } else {
                ReadOptions::listen_only()
            };
            read.timestamp = timestamp(time, utc);
            let options = ListenOptions {
                read,
                count,
                until_off: until_off || stop_on_off,
            };
            listen(load, options, format).await?;
            Ok(CliResult::success())
        }

        Commands::Get { what, raw } => {
            let scale = if raw { Scale::Raw } else { Scale::Scaled };
            let value = load.get_measurement(what, scale).await?;
            Ok(CliResult::success_with_message(format_value(
                what.key(),
                value,
                format,
            )))
        }

        Commands::On => {
            load.set_output(true).await?;
            Ok(CliResult::success())
        }

        Commands::Off => {
            load.set_output(false).await?;
            Ok(CliResult::success())
        }

        Commands::Toggle => {
            let on = load.toggle_output().await?;
            Ok(CliResult::success_with_message(format_value(
                Measurement::Output.key(),
                f64::from(u8::from(on)),
                format,
            )))
        }

        Commands::Current { amps } => {
            let relative = amps.starts_with('+') || amps.starts_with('-');
            let Ok(value) = amps.parse::<f64>() else {
                return Ok(CliResult::invalid_args(format!("bad current {amps:?}")));
            };
            load.set_current(value, relative).await?;
            Ok(CliResult::success())
        }

        Commands::Cutoff { volts } => {
            load.set_cutoff(volts).await?;
            Ok(CliResult::success())
        }

        Commands::Timer { seconds: Some(secs) } => {
            load.set_timer(Duration::from_secs(secs)).await?;
            Ok(CliResult::success())
        }

        Commands::Timer { seconds: None } => {
            let elapsed = load.get_timer().await?;
            let limit = load.get_timer_limit().await?;
            let record = json!({ "timer": elapsed.as_secs(), "limit": limit.as_secs() });
            Ok(CliResult::success_with_message(format_record(&record, format)?))
        }

        Commands::Reset { counter: None } => {
            load.reset_counters().await?;
            Ok(CliResult::success())
        }

        Commands::Reset {
            counter: Some(kind),
        } => {
            load.clear_counter(kind).await?;
            Ok(CliResult::success())
        }

        Commands::Button { button } => {
            load.press_button(button).await?;
            Ok(CliResult::success())
        }

        Commands::Backlight { level } => {
            load.set_backlight(level).await?;
            Ok(CliResult::success())
        }

        Commands::Type => {
            let variant = load.wait_for_device(DEVICE_WAIT_POLLS).await?;
            let out = match format {
                OutputFormat::Json => json!({ "type": variant.code(), "name": variant.name() }).to_string(),
                OutputFormat::Text => format!("TYPE: {variant}"),
            };
            Ok(CliResult::success_with_message(out))
        }

        Commands::RawAtorch { cmd, payload: hex } => {
            raw_command(load, Family::Atorch, cmd, hex.as_deref(), format).await
        }

        Commands::RawPx100 { cmd, payload: hex } => {
            raw_command(load, Family::Px100, cmd, hex.as_deref(), format).await
        }

        Commands::RawSend { bytes } => {
            let raw = match parse_hex(&bytes) {
                Ok(raw) => raw,
                Err(e) => return Ok(CliResult::invalid_args(format!("bad bytes {bytes:?}: {e}"))),
            };
            let reply = load.send_bytes(&raw).await?;
            Ok(CliResult::success_with_message(format_packet(&reply, format)))
        }

        Commands::ConfigTemplate | Commands::Ports => Ok(CliResult::success()),
    }
}

async fn raw_command(
    load: &mut Load,
    family: Family,
    cmd: u8,
    hex: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<CliResult> {
    let data = match payload(hex) {
        Ok(data) => data,
        Err(result) => return Ok(result),
    };
    let reply = load.send_raw(family, cmd, &data).await?;
    Ok(CliResult::success_with_message(format_packet(&reply, format)))
}

async fn listen(load: &mut Load, options: ListenOptions, format: OutputFormat) -> anyhow::Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    let print = |report: &StateReport| -> anyhow::Result<()> {
        println!("{}", format_record(report, format)?);
        Ok(())
    };

    tokio::select! {
        res = shutdown => {
            res.context("cannot listen for Ctrl-C")?;
            tracing::info!("interrupted");
        }
        end = load.listen(options, print) => {
            tracing::info!("listen finished: {:?}", end?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_flags() {
        let cli = Cli::try_parse_from(["dl24ctl", "listen", "--until-off", "--basic", "-n", "4"])
            .unwrap();
        match cli.command {
            Some(Commands::Listen {
                count,
                until_off,
                basic,
                query,
                full,
                ..
            }) => {
                assert_eq!(count, Some(4));
                assert!(until_off && basic);
                assert!(!query && !full);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(Cli::try_parse_from(["dl24ctl", "listen", "--query", "--full"]).is_err());
    }
}
