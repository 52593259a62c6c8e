//! Wire types and framing for the LiveKit SFU signaling protocol (v15).
//!
//! The message definitions themselves are generated artifacts (see
//! `build.rs`); this crate's own code is the URL builder and the frame
//! codec wrapped around the generated types.

mod codec;
mod error;
mod url;

pub use codec::{decode_data_packet, decode_response, encode_data_packet, encode_request};
pub use error::ProtocolError;
pub use url::{build_url, redact, ClientInfo};

include!(concat!(env!("OUT_DIR"), "/livekit.rs"));

/// Standalone aliases so call sites needn't spell the nested module path.
pub type SignalRequestMessage = signal_request::Message;
pub type SignalResponseMessage = signal_response::Message;
pub type DataPacketValue = data_packet::Value;
pub type RpcResponseValue = rpc_response::Value;
