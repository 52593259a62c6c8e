//! Client-side control plane for a LiveKit room: a signaling client over
//! protobuf/WebSocket, a publisher+subscriber WebRTC peer-connection pair,
//! an orchestrating engine, and a thin room façade with an RPC envelope.

mod config;
mod engine;
mod error;
mod media;
mod peer;
mod rpc;
mod signal;
mod state;

pub mod room;

pub use config::{AudioEncodeOptions, IceOptions, MediaKind, PublishOptions, RoomOptions, SubscribeOptions, VideoEncodeOptions};
pub use error::{EngineError, PeerError, RoomError, SignalError};
pub use media::{AudioCodec, AudioFrame, AudioStreamInfo, Capturer, Renderer, VideoCodec, VideoFrame};
pub use room::{Room, RoomHandler};
pub use rpc::RpcHandler;
pub use state::ConnectionState;
