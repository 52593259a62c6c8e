use thiserror::Error;

/// Failures from the wire codec and URL builder. Both are local and
/// surfaced synchronously — neither performs I/O.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode protobuf message: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to decode protobuf message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("signaling url rejected: {0}")]
    InvalidUrl(&'static str),
}
