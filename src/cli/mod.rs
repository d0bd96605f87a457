//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Text and JSON output

pub mod exit_codes;
pub mod output;

pub use exit_codes::{exit_code_description, exit_code_table, CliResult, ExitCodes};
pub use output::{format_packet, format_record, format_value, parse_hex, OutputFormat};
