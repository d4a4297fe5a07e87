//! Protocol implementations.

pub mod crc;
pub mod hci;

// Re-export common types
pub use hci::{Command, CommandFrame, FlashCommand, FrameDecoder, ProbeReply, Response};
