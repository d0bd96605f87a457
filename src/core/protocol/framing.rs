//! Streaming frame decoder for the DL24 byte stream
//!
//! Bytes are appended as they arrive from the transport. `extract` pulls at
//! most one packet from the head of the buffer, dropping unrecognised bytes
//! until a sync byte for one of the three frame shapes is found. When a frame
//! is only partially buffered nothing is consumed, so the same prefix is
//! examined again after the next read.

use super::checksum::verify_frame;
use super::packet::{
    be24, BroadcastFrame, Packet, ReplyOutcome, ATORCH_BROADCAST, ATORCH_REPLY, ATORCH_SYNC,
    BROADCAST_LEN, COMMAND_REPLY_LEN, QUERY_REPLY_LEN, QUERY_SYNC, QUERY_SYNC2, QUERY_TRAILER,
    SHORT_ACK,
};
use tracing::{debug, warn};

/// Which reply sync bytes are currently meaningful.
///
/// `0x6F` and `0xCA` occur freely inside other traffic, so they are only
/// treated as frame starts while a matching request is outstanding.
/// Broadcast sync (`0xFF`) is always recognised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expectation {
    /// Accept `0x6F` as a short acknowledgement
    pub short_ack: bool,
    /// Accept `0xCA` as the start of a query reply
    pub query: bool,
}

impl Expectation {
    /// Only broadcasts are recognised
    pub const IDLE: Self = Self {
        short_ack: false,
        query: false,
    };
}

/// Why a complete frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Status broadcast failed its checksum
    BroadcastChecksum,
    /// Command reply failed its checksum
    ReplyChecksum,
}

/// Result of a single extraction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    /// A well-formed packet was consumed
    Packet(Packet),
    /// A frame start is buffered but more bytes are needed
    Incomplete,
    /// Nothing left in the buffer
    Empty,
    /// A complete frame was consumed and discarded
    Rejected(RejectReason),
}

/// Streaming decoder holding the receive buffer
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    expect: Expectation,
    discarded: u64,
    rejected: u64,
}

impl FrameDecoder {
    /// Create an empty decoder that only recognises broadcasts
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Set which reply shapes are recognised
    pub fn set_expectation(&mut self, expect: Expectation) {
        self.expect = expect;
    }

    /// Current expectation
    pub fn expectation(&self) -> Expectation {
        self.expect
    }

    /// Bytes still buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total garbage bytes dropped while resynchronising
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Total complete frames dropped for a bad checksum
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn is_sync(&self, byte: u8) -> bool {
        (self.expect.short_ack && byte == SHORT_ACK)
            || (self.expect.query && byte == QUERY_SYNC)
            || byte == ATORCH_SYNC[0]
    }

    /// Strip leading bytes that cannot start a frame. Returns false if the
    /// buffer ran empty.
    fn resync(&mut self) -> bool {
        let skip = self
            .buffer
            .iter()
            .position(|&b| self.is_sync(b))
            .unwrap_or(self.buffer.len());
        if skip > 0 {
            self.drop_garbage(skip);
        }
        !self.buffer.is_empty()
    }

    fn drop_garbage(&mut self, count: usize) {
        let dropped: Vec<u8> = self.buffer.drain(..count).collect();
        self.discarded += dropped.len() as u64;
        debug!("discarded {} byte(s): {}", dropped.len(), hex::encode(&dropped));
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        self.buffer.drain(..count).collect()
    }

    /// Pull at most one packet from the head of the buffer
    pub fn extract(&mut self) -> Extracted {
        loop {
            if !self.resync() {
                return Extracted::Empty;
            }

            let head = self.buffer[0];

            if self.expect.short_ack && head == SHORT_ACK {
                self.buffer.remove(0);
                debug!("short ANS");
                return Extracted::Packet(Packet::ShortAck);
            }

            if self.expect.query && head == QUERY_SYNC {
                if self.buffer.len() < QUERY_REPLY_LEN {
                    return Extracted::Incomplete;
                }
                if self.buffer[1] != QUERY_SYNC2 || self.buffer[5..7] != QUERY_TRAILER {
                    self.drop_garbage(1);
                    continue;
                }
                let frame = self.take(QUERY_REPLY_LEN);
                debug!("ANS: {}", hex::encode(&frame));
                return Extracted::Packet(Packet::QueryReply {
                    value: be24(&frame, 2),
                });
            }

            // Only the broadcast sync byte remains
            if self.buffer.len() < 3 {
                return Extracted::Incomplete;
            }
            if self.buffer[1] != ATORCH_SYNC[1] {
                self.drop_garbage(1);
                continue;
            }

            match self.buffer[2] {
                ATORCH_BROADCAST => {
                    if self.buffer.len() < BROADCAST_LEN {
                        return Extracted::Incomplete;
                    }
                    let frame = self.take(BROADCAST_LEN);
                    if !verify_frame(&frame) {
                        self.rejected += 1;
                        warn!("status broadcast checksum failed: {}", hex::encode(&frame));
                        return Extracted::Rejected(RejectReason::BroadcastChecksum);
                    }
                    let mut raw = [0u8; BROADCAST_LEN];
                    raw.copy_from_slice(&frame);
                    return Extracted::Packet(Packet::Broadcast(BroadcastFrame::from_raw(raw)));
                }
                ATORCH_REPLY => {
                    if self.buffer.len() < COMMAND_REPLY_LEN {
                        return Extracted::Incomplete;
                    }
                    let frame = self.take(COMMAND_REPLY_LEN);
                    let outcome = ReplyOutcome::from(frame[3]);
                    if !verify_frame(&frame) {
                        self.rejected += 1;
                        warn!("{} checksum failed: {}", outcome, hex::encode(&frame));
                        return Extracted::Rejected(RejectReason::ReplyChecksum);
                    }
                    debug!("{}: {}", outcome, hex::encode(&frame));
                    return Extracted::Packet(Packet::CommandReply {
                        outcome,
                        payload: [frame[4], frame[5], frame[6]],
                    });
                }
                _ => {
                    self.drop_garbage(1);
                }
            }
        }
    }

    /// Extract every complete packet currently buffered.
    ///
    /// Rejected frames are skipped; the partial tail, if any, stays buffered.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        loop {
            match self.extract() {
                Extracted::Packet(packet) => packets.push(packet),
                Extracted::Rejected(_) => {}
                Extracted::Incomplete | Extracted::Empty => return packets,
            }
        }
    }
}
