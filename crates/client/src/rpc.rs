//! RPC envelope manager layered above the data-packet transport. Fixes only
//! the envelope shape — `register`/`unregister`/`handle_packet` — with an
//! `RpcAck` sent immediately on receipt and an `RpcResponse` carrying the
//! handler's result sent afterward. Dispatch policy beyond that (retries,
//! timeouts, routing) is left to the registered handler.

use std::collections::HashMap;
use std::sync::Mutex;

use livekit_protocol::{rpc_response::Value as RpcResponseValue, DataPacket, RpcAck, RpcError, RpcResponse};

pub type RpcHandler = Box<dyn Fn(String) -> Result<String, String> + Send + Sync>;

pub struct RpcManager {
    handlers: Mutex<HashMap<String, RpcHandler>>,
}

impl RpcManager {
    pub fn new() -> Self {
        Self { handlers: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, method: &str, handler: RpcHandler) {
        self.handlers.lock().unwrap().insert(method.to_string(), handler);
    }

    pub fn unregister(&self, method: &str) {
        self.handlers.lock().unwrap().remove(method);
    }

    /// Invokes the handler registered for `request.method`, if any, and
    /// returns the frames to send back: an immediate `RpcAck` plus an
    /// `RpcResponse` once the handler (synchronous, per the contract this
    /// port implements) has produced a result. `None` for the response half
    /// means no handler was registered for that method.
    pub fn handle_request(&self, request: &livekit_protocol::RpcRequest) -> (RpcAck, Option<RpcResponse>) {
        let ack = RpcAck { request_id: request.id.clone() };

        let handler_result = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(&request.method).map(|h| h(request.payload.clone()))
        };

        let response = handler_result.map(|result| {
            let value = match result {
                Ok(payload) => RpcResponseValue::Payload(payload),
                Err(message) => RpcResponseValue::Error(RpcError { code: 0, message, data: String::new() }),
            };
            RpcResponse { request_id: request.id.clone(), value: Some(value) }
        });

        (ack, response)
    }
}

impl Default for RpcManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes an inbound `DataPacket` by `which_value`: `User` goes to the
/// caller's data handler (handled by `Room` directly); RPC variants are
/// dispatched here. Returns `true` if this packet was an RPC variant
/// (consumed), `false` if it should be treated as ordinary user data.
pub fn is_rpc_packet(packet: &DataPacket) -> bool {
    matches!(
        packet.value,
        Some(livekit_protocol::data_packet::Value::RpcRequest(_))
            | Some(livekit_protocol::data_packet::Value::RpcAck(_))
            | Some(livekit_protocol::data_packet::Value::RpcResponse(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use livekit_protocol::RpcRequest;

    #[test]
    fn unregistered_method_yields_no_response() {
        let manager = RpcManager::new();
        let request = RpcRequest {
            id: "req1".to_string(),
            method: "ping".to_string(),
            payload: "{}".to_string(),
            response_timeout_ms: 1000,
            version: 1,
        };
        let (ack, response) = manager.handle_request(&request);
        assert_eq!(ack.request_id, "req1");
        assert!(response.is_none());
    }

    #[test]
    fn registered_method_echoes_payload() {
        let manager = RpcManager::new();
        manager.register("echo", Box::new(|payload| Ok(payload)));
        let request = RpcRequest {
            id: "req2".to_string(),
            method: "echo".to_string(),
            payload: "hello".to_string(),
            response_timeout_ms: 1000,
            version: 1,
        };
        let (_, response) = manager.handle_request(&request);
        match response.unwrap().value {
            Some(RpcResponseValue::Payload(p)) => assert_eq!(p, "hello"),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn handler_error_becomes_rpc_error() {
        let manager = RpcManager::new();
        manager.register("fail", Box::new(|_| Err("boom".to_string())));
        let request = RpcRequest {
            id: "req3".to_string(),
            method: "fail".to_string(),
            payload: String::new(),
            response_timeout_ms: 1000,
            version: 1,
        };
        let (_, response) = manager.handle_request(&request);
        match response.unwrap().value {
            Some(RpcResponseValue::Error(e)) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn unregister_removes_handler() {
        let manager = RpcManager::new();
        manager.register("echo", Box::new(|payload| Ok(payload)));
        manager.unregister("echo");
        let request = RpcRequest {
            id: "req4".to_string(),
            method: "echo".to_string(),
            payload: "x".to_string(),
            response_timeout_ms: 1000,
            version: 1,
        };
        let (_, response) = manager.handle_request(&request);
        assert!(response.is_none());
    }
}
