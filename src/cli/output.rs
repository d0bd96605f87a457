//! Output formatting for the command-line front end
//!
//! Measurements and replies go to stdout, as text or JSON; logs stay on
//! stderr.

use crate::core::protocol::packet::Packet;
use serde::Serialize;
use serde_json::json;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON, one document per line
    Json,
}

impl OutputFormat {
    /// Pick the format from the `--json` flag
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Render a serializable record. Text output is `key: value` pairs.
pub fn format_record<T: Serialize>(record: &T, format: OutputFormat) -> serde_json::Result<String> {
    let value = serde_json::to_value(record)?;
    Ok(match format {
        OutputFormat::Json => value.to_string(),
        OutputFormat::Text => match value {
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(key, value)| format!("{key}: {}", plain(value)))
                .collect::<Vec<_>>()
                .join(", "),
            other => plain(&other),
        },
    })
}

/// Render one named value
pub fn format_value(name: &str, value: f64, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => json!({ name: value }).to_string(),
        OutputFormat::Text => value.to_string(),
    }
}

/// Render a decoded reply packet
pub fn format_packet(packet: &Packet, format: OutputFormat) -> String {
    let (kind, detail) = match packet {
        Packet::ShortAck => ("short ack", json!(null)),
        Packet::QueryReply { value } => ("query reply", json!(value)),
        Packet::CommandReply { outcome, payload } => (
            "command reply",
            json!({ "outcome": outcome.to_string(), "payload": hex::encode(payload) }),
        ),
        Packet::Broadcast(frame) => ("broadcast", json!(hex::encode(frame.raw()))),
    };
    match format {
        OutputFormat::Json => json!({ "reply": kind, "value": detail }).to_string(),
        OutputFormat::Text if detail.is_null() => kind.to_string(),
        OutputFormat::Text => format!("{kind}: {}", plain(&detail)),
    }
}

fn plain(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

/// Parse a hex string such as `b1b2100000b6` or `b1 b2 10 00 00 b6`
pub fn parse_hex(input: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(compact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::packet::ReplyOutcome;
    use std::collections::BTreeMap;

    #[test]
    fn test_record_text_and_json() {
        let mut record = BTreeMap::new();
        record.insert("A", 1.5);
        record.insert("V", 12.0);
        assert_eq!(
            format_record(&record, OutputFormat::Text).unwrap(),
            "A: 1.5, V: 12.0"
        );
        assert_eq!(
            format_record(&record, OutputFormat::Json).unwrap(),
            r#"{"A":1.5,"V":12.0}"#
        );
    }

    #[test]
    fn test_packet_formats() {
        let reply = Packet::CommandReply {
            outcome: ReplyOutcome::Unsupported,
            payload: [0, 0, 1],
        };
        assert_eq!(
            format_packet(&reply, OutputFormat::Text),
            r#"command reply: {"outcome":"reply:UNSUPPORTED","payload":"000001"}"#
        );
        assert_eq!(
            format_packet(&Packet::QueryReply { value: 7 }, OutputFormat::Json),
            r#"{"reply":"query reply","value":7}"#
        );
        assert_eq!(format_packet(&Packet::ShortAck, OutputFormat::Text), "short ack");
    }

    #[test]
    fn test_parse_hex_separators() {
        assert_eq!(
            parse_hex("b1:b2 10 00:00 b6").unwrap(),
            vec![0xB1, 0xB2, 0x10, 0x00, 0x00, 0xB6]
        );
        assert!(parse_hex("b1b").is_err());
    }
}
