//! The public-facing room handle. Wraps an `Engine`, maps its callbacks
//! onto user-facing ones, and layers the RPC manager over the data-packet
//! transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::warn;

use livekit_protocol::{data_packet::Value as DataPacketValue, DataPacket, DataPacketKind, ParticipantInfo, Room as RoomInfo};

use crate::config::RoomOptions;
use crate::engine::{user_data_packet, Engine, EngineHandler};
use crate::error::RoomError;
use crate::rpc::{is_rpc_packet, RpcHandler, RpcManager};
use crate::state::ConnectionState;

/// Event callbacks supplied by the room's owner. Modeled as a trait rather
/// than a struct of function pointers: every method is required, so a
/// `Room` can't exist with a half-wired callback set.
pub trait RoomHandler: Send + Sync {
    fn on_state_changed(&self, state: ConnectionState);
    fn on_room_info(&self, room: RoomInfo);
    fn on_participant_info(&self, participant: ParticipantInfo, is_local: bool);
    fn on_data_received(&self, payload: Vec<u8>, topic: String, participant_identity: String);
}

/// Bridges `Engine`'s callback set onto the room's. Constructed before the
/// engine exists (the engine needs a handler to be built), so `engine` is
/// filled in with a `Weak<Engine>` right after `Engine::new` returns rather
/// than at `EngineBridge::new` time.
struct EngineBridge {
    handler: Arc<dyn RoomHandler>,
    rpc: Arc<RpcManager>,
    engine: OnceLock<Weak<Engine>>,
}

impl EngineHandler for EngineBridge {
    fn on_state_changed(&self, state: ConnectionState) {
        self.handler.on_state_changed(state);
    }

    fn on_room_info(&self, room: RoomInfo) {
        self.handler.on_room_info(room);
    }

    fn on_participant_info(&self, participant: ParticipantInfo, is_local: bool) {
        self.handler.on_participant_info(participant, is_local);
    }

    /// Routes by `which_value`: `User` → the caller's data handler;
    /// `RpcRequest`/`RpcAck`/`RpcResponse` → the RPC manager.
    fn on_data_received(&self, packet: DataPacket) {
        if is_rpc_packet(&packet) {
            if let Some(DataPacketValue::RpcRequest(request)) = &packet.value {
                let (ack, response) = self.rpc.handle_request(request);
                if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                    let ack_packet = DataPacket {
                        kind: DataPacketKind::Reliable as i32,
                        destination_identities: vec![packet.participant_identity.clone()],
                        participant_identity: String::new(),
                        value: Some(DataPacketValue::RpcAck(ack)),
                    };
                    if let Err(e) = engine.send_data_packet(&ack_packet, DataPacketKind::Reliable) {
                        warn!("failed to send rpc ack: {e}");
                    }
                    if let Some(response) = response {
                        let response_packet = DataPacket {
                            kind: DataPacketKind::Reliable as i32,
                            destination_identities: vec![packet.participant_identity],
                            participant_identity: String::new(),
                            value: Some(DataPacketValue::RpcResponse(response)),
                        };
                        if let Err(e) = engine.send_data_packet(&response_packet, DataPacketKind::Reliable) {
                            warn!("failed to send rpc response: {e}");
                        }
                    }
                }
            }
            return;
        }

        if let Some(DataPacketValue::User(user)) = packet.value {
            self.handler.on_data_received(user.payload, user.topic, packet.participant_identity);
        }
    }
}

pub struct Room {
    engine: Arc<Engine>,
    rpc: Arc<RpcManager>,
    closed: AtomicBool,
}

impl Room {
    /// Validates `options` before building the engine. Creation never
    /// performs I/O and never returns `Failed` — only structural errors.
    pub fn new(options: RoomOptions, handler: Arc<dyn RoomHandler>) -> Result<Self, RoomError> {
        options.validate().map_err(|issues| RoomError::InvalidArg(issues.join("; ")))?;

        let rpc = Arc::new(RpcManager::new());
        let bridge = Arc::new(EngineBridge { handler, rpc: Arc::clone(&rpc), engine: OnceLock::new() });
        let engine = Engine::new(options, Arc::clone(&bridge) as Arc<dyn EngineHandler>);
        let _ = bridge.engine.set(Arc::downgrade(&engine));

        Ok(Self { engine, rpc, closed: AtomicBool::new(false) })
    }

    pub async fn connect(&self, server_url: &str, token: &str) -> Result<(), RoomError> {
        self.engine.connect(server_url, token).await?;
        Ok(())
    }

    /// Idempotent: closing an already-closed room is a no-op, never `Failed`.
    pub async fn close(&self) -> Result<(), RoomError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.close().await?;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Allocates a `UserPacket` wrapped in a `DataPacket` with the
    /// destination identity list, selects `Reliable`/`Lossy`.
    pub async fn publish_data(
        &self,
        payload: Vec<u8>,
        topic: &str,
        destination_identities: Vec<String>,
        lossy: bool,
    ) -> Result<(), RoomError> {
        let mut packet = user_data_packet(payload, topic.to_string(), destination_identities);
        let kind = if lossy { DataPacketKind::Lossy } else { DataPacketKind::Reliable };
        packet.kind = kind as i32;
        self.engine.send_data_packet(&packet, kind)?;
        Ok(())
    }

    pub fn rpc_register(&self, method: &str, handler: RpcHandler) -> Result<(), RoomError> {
        self.rpc.register(method, handler);
        Ok(())
    }

    pub fn rpc_unregister(&self, method: &str) -> Result<(), RoomError> {
        self.rpc.unregister(method);
        Ok(())
    }
}

/// Dropping a room not already disconnected implicitly closes it. `close`
/// is async and `Drop` isn't, so this spawns the shutdown onto the ambient
/// runtime rather than blocking the dropping thread.
impl Drop for Room {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = Arc::clone(&self.engine);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = engine.close().await;
                });
            }
            Err(_) => warn!("Room dropped outside a tokio runtime; engine was not closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaKind, PublishOptions};

    struct NoopRoomHandler;
    impl RoomHandler for NoopRoomHandler {
        fn on_state_changed(&self, _state: ConnectionState) {}
        fn on_room_info(&self, _room: RoomInfo) {}
        fn on_participant_info(&self, _participant: ParticipantInfo, _is_local: bool) {}
        fn on_data_received(&self, _payload: Vec<u8>, _topic: String, _participant_identity: String) {}
    }

    #[test]
    fn new_room_with_default_options_succeeds() {
        let room = Room::new(RoomOptions::default(), Arc::new(NoopRoomHandler));
        assert!(room.is_ok());
        assert_eq!(room.unwrap().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn new_room_rejects_invalid_options() {
        let options = RoomOptions {
            publish: PublishOptions { kind: MediaKind::AUDIO, ..Default::default() },
            ..Default::default()
        };
        let err = Room::new(options, Arc::new(NoopRoomHandler)).unwrap_err();
        assert!(matches!(err, RoomError::InvalidArg(_)));
    }

    #[tokio::test]
    async fn close_before_connect_is_a_harmless_noop() {
        let room = Room::new(RoomOptions::default(), Arc::new(NoopRoomHandler)).unwrap();
        assert!(room.close().await.is_ok());
        assert!(room.close().await.is_ok());
    }
}
