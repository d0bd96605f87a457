//! DL24 wire protocol
//!
//! - Atorch checksum
//! - Packet shapes and request encoders for both command families
//! - Streaming frame decoder with resynchronisation

pub mod checksum;
pub mod framing;
pub mod packet;

pub use checksum::{atorch_checksum, verify_frame};
pub use framing::{Expectation, Extracted, FrameDecoder, RejectReason};
pub use packet::{
    encode_atorch, encode_px100, split_decimal, AtorchCommand, BroadcastFrame, Family, Packet,
    Px100Command, ReplyOutcome,
};
