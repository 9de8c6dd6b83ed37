//! CLIPRDR virtual channel adapter
//!
//! Frames clipboard PDUs over a byte stream and feeds them to the bridge.

pub mod channel;
pub mod codec;

pub use channel::{run_channel, run_stdio, ChannelSender, CliprdrChannel};
pub use codec::CliprdrCodec;
