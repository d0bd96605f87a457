//! CLI Exit Codes
//!
//! Exit codes for scripted use of the load.

use crate::config::ConfigError;
use crate::core::instrument::InstrumentError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error, including commands the device did not answer
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Connection could not be established
    pub const CONNECTION_FAILED: u8 = 12;

    /// A setting did not read back as written
    pub const VERIFICATION_FAILED: u8 = 17;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for stdout
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Bad command-line input
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::INVALID_ARGS, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        let code = match err {
            TransportError::ConnectionFailed { .. } => ExitCodes::CONNECTION_FAILED,
            TransportError::InvalidConfiguration(_) => ExitCodes::INVALID_ARGS,
            _ => ExitCodes::ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<InstrumentError> for CliResult {
    fn from(err: InstrumentError) -> Self {
        match err {
            InstrumentError::Transport(e) => e.into(),
            InstrumentError::SetVerificationFailed { .. } => {
                Self::Error(ExitCodes::VERIFICATION_FAILED, err.to_string())
            }
            InstrumentError::InvalidArgument(_) => {
                Self::Error(ExitCodes::INVALID_ARGS, err.to_string())
            }
            _ => Self::Error(ExitCodes::ERROR, err.to_string()),
        }
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        8 => "Configuration error",
        12 => "Connection failed",
        17 => "Verification failed",
        _ => "Unknown error",
    }
}

/// Exit code table, one code per line
pub fn exit_code_table() -> String {
    let mut table = String::from("Exit Codes:\n");
    for code in [0, 1, 2, 8, 12, 17] {
        table.push_str(&format!("  {:>3}  {}\n", code, exit_code_description(code)));
    }
    table
}
