use thiserror::Error;
use livekit_protocol::ProtocolError;

/// Errors from the signaling client.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error(transparent)]
    InvalidUrl(#[from] ProtocolError),

    #[error("websocket transport failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protobuf encode/decode failure, message dropped: {0}")]
    Message(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Errors from a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("underlying peer connection library failure: {0}")]
    Rtc(#[from] webrtc::Error),
}

/// Errors from the engine: a roll-up of signaling and peer failures plus media faults.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Signaling(#[from] SignalError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("media capture/render failure: {0}")]
    Media(String),
}

/// Errors from the room facade: option validation and engine roll-up.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("no RPC handler registered for method {0:?}")]
    RpcMethodNotFound(String),
}
