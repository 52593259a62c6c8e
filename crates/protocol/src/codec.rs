use bytes::Bytes;
use prost::Message;

use crate::error::ProtocolError;
use crate::{DataPacket, SignalRequest, SignalResponse};

/// Encodes a `SignalRequest` as a single binary WebSocket frame payload.
///
/// There is no manual buffer lifecycle here: `prost::Message::encode_to_vec`
/// returns an owned `Vec<u8>` that the caller sends and drops, which is the
/// Rust-native equivalent of a compute-size/allocate/encode/send/free
/// sequence.
pub fn encode_request(request: &SignalRequest) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(request.encode_to_vec()))
}

/// Decodes one binary WebSocket frame payload into a `SignalResponse`.
///
/// The returned value owns all of its fields; there is no separate release
/// step analogous to `pb_release` — the value is freed when it (and
/// whatever dispatch match arm consumes it) goes out of scope, so a decoded
/// message is released exactly once without any explicit bookkeeping.
pub fn decode_response(frame: &[u8]) -> Result<SignalResponse, ProtocolError> {
    Ok(SignalResponse::decode(frame)?)
}

pub fn encode_data_packet(packet: &DataPacket) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(packet.encode_to_vec()))
}

pub fn decode_data_packet(frame: &[u8]) -> Result<DataPacket, ProtocolError> {
    Ok(DataPacket::decode(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal_request::Message as ReqMessage;
    use crate::{DataPacketKind, LeaveRequest, LeaveRequestAction, UserPacket};

    #[test]
    fn leave_request_roundtrips() {
        let request = SignalRequest {
            message: Some(ReqMessage::Leave(LeaveRequest {
                can_reconnect: false,
                reason: crate::DisconnectReason::ClientInitiated as i32,
                action: LeaveRequestAction::Disconnect as i32,
            })),
        };

        let encoded = encode_request(&request).unwrap();
        let decoded = SignalRequest::decode(encoded.as_ref()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn data_packet_roundtrips() {
        let packet = DataPacket {
            kind: DataPacketKind::Lossy as i32,
            destination_identities: vec!["peer-1".to_string()],
            participant_identity: String::new(),
            value: Some(crate::data_packet::Value::User(UserPacket {
                topic: "chat".to_string(),
                payload: b"hello".to_vec(),
                destination_identities: vec![],
            })),
        };

        let encoded = encode_data_packet(&packet).unwrap();
        let decoded = decode_data_packet(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_garbage_reports_error() {
        let err = decode_response(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
