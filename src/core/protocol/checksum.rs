//! Checksum used by the Atorch (Family B) frames
//!
//! The device sums the covered bytes, XORs the low byte with `0x44` and
//! appends the result. Coverage always starts after the `FF 55` sync pair and
//! stops before the checksum byte itself.

/// XOR mask applied to the 8-bit sum
pub const ATORCH_XOR: u8 = 0x44;

/// Simple 8-bit sum
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Atorch checksum: `(sum(data) XOR 0x44) & 0xFF`
pub fn atorch_checksum(data: &[u8]) -> u8 {
    sum8_checksum(data) ^ ATORCH_XOR
}

/// Verify a complete `FF 55 ...` frame.
///
/// A frame is valid iff `atorch_checksum(frame[2..len-1]) == frame[len-1]`.
/// Frames shorter than the sync pair plus a checksum byte never verify.
pub fn verify_frame(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((&checksum, body)) if body.len() >= 2 => atorch_checksum(&body[2..]) == checksum,
        _ => false,
    }
}
