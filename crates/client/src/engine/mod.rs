//! Orchestrates the signaling client and the publisher/subscriber peer pair.
//!
//! `SignalBridge`/`PeerBridge` hold only a `Weak<Engine>` and implement
//! `SignalHandler`/`PeerHandler`; they're handed to `SignalClient`/`Peer`
//! at construction via `Arc::new_cyclic`, which is how the engine gets a
//! callback set pointing back at itself without a reference cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use livekit_protocol::{
    data_packet::Value as DataPacketValue, AddTrackRequest, AudioTrackFeature, ClientInfo, DataPacket, DataPacketKind,
    DisconnectReason, IceServer, JoinResponse, LeaveRequestAction, ParticipantInfo, Room, SignalTarget, TrackSource,
    TrackType, UserPacket, VideoLayer, VideoQuality,
};

use crate::config::{MediaKind, RoomOptions};
use crate::error::EngineError;
use crate::media::{AudioFrame, VideoFrame};
use crate::peer::{IceServerConfig, Peer, PeerConfig, PeerHandler, PeerRole};
use crate::signal::{SignalClient, SignalHandler};
use crate::state::{aggregate_state, ConnectionState, ConstituentStates};

/// Callbacks the room façade supplies. Does not include an RPC-specific
/// callback; the room layers RPC dispatch on top of `on_data_received`
/// itself.
pub trait EngineHandler: Send + Sync {
    fn on_state_changed(&self, state: ConnectionState);
    fn on_room_info(&self, room: Room);
    fn on_participant_info(&self, participant: ParticipantInfo, is_local: bool);
    fn on_data_received(&self, packet: DataPacket);
}

struct SignalBridge {
    engine: Weak<Engine>,
}

impl SignalHandler for SignalBridge {
    fn on_state_changed(&self, state: ConnectionState) {
        if let Some(engine) = self.engine.upgrade() {
            engine.set_sig_state(state);
        }
    }

    fn on_join(&self, join: JoinResponse) {
        if let Some(engine) = self.engine.upgrade() {
            tokio::spawn(async move { engine.handle_join(join).await });
        }
    }

    fn on_leave(&self, _reason: DisconnectReason, _action: LeaveRequestAction) {
        if let Some(engine) = self.engine.upgrade() {
            tokio::spawn(async move { engine.handle_leave().await });
        }
    }

    fn on_room_update(&self, room: Room) {
        if let Some(engine) = self.engine.upgrade() {
            engine.handler.on_room_info(room);
        }
    }

    fn on_participant_update(&self, participant: ParticipantInfo) {
        if let Some(engine) = self.engine.upgrade() {
            tokio::spawn(async move { engine.handle_participant_update(participant).await });
        }
    }

    fn on_answer(&self, sdp: String) {
        if let Some(engine) = self.engine.upgrade() {
            tokio::spawn(async move { engine.apply_publisher_answer(sdp).await });
        }
    }

    fn on_offer(&self, sdp: String) {
        if let Some(engine) = self.engine.upgrade() {
            tokio::spawn(async move { engine.apply_subscriber_offer(sdp).await });
        }
    }

    fn on_trickle(&self, candidate: String, target: SignalTarget) {
        if let Some(engine) = self.engine.upgrade() {
            tokio::spawn(async move { engine.apply_trickle(candidate, target).await });
        }
    }
}

struct PeerBridge {
    engine: Weak<Engine>,
    role: PeerRole,
}

impl PeerHandler for PeerBridge {
    fn on_state_changed(&self, role: PeerRole, state: ConnectionState) {
        if let Some(engine) = self.engine.upgrade() {
            engine.set_peer_state(role, state);
        }
    }

    fn on_sdp(&self, role: PeerRole, sdp: String) {
        let result = match role {
            PeerRole::Publisher => self.engine.upgrade().map(|e| e.signal.send_offer(sdp)),
            PeerRole::Subscriber => self.engine.upgrade().map(|e| e.signal.send_answer(sdp)),
        };
        if let Some(Err(e)) = result {
            warn!("failed to send {role:?} sdp: {e}");
        }
    }

    fn on_data_packet(&self, packet: DataPacket) {
        if let Some(engine) = self.engine.upgrade() {
            engine.handler.on_data_received(packet);
        }
    }

    fn on_audio_info(&self, info: crate::media::AudioStreamInfo) {
        if let Some(engine) = self.engine.upgrade() {
            if let Some(renderer) = &engine.subscribe_options.renderer {
                renderer.configure(info);
            }
        }
    }

    fn on_audio_frame(&self, frame: AudioFrame) {
        if let Some(engine) = self.engine.upgrade() {
            if let Some(renderer) = &engine.subscribe_options.renderer {
                renderer.push_audio(frame);
            }
        }
    }
}

pub struct Engine {
    signal: SignalClient,
    handler: Arc<dyn EngineHandler>,
    options: RoomOptions,
    states: Mutex<ConstituentStates>,
    reported_aggregate: Mutex<ConnectionState>,
    publisher: Mutex<Option<Arc<Peer>>>,
    subscriber: Mutex<Option<Arc<Peer>>>,
    ice_servers: Mutex<Vec<IceServer>>,
    local_participant_sid: Mutex<Option<String>>,
    sub_audio_track_sid: Mutex<Option<String>>,
    media_streaming: Arc<AtomicBool>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(options: RoomOptions, handler: Arc<dyn EngineHandler>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Engine>| {
            let signal_handler: Arc<dyn SignalHandler> = Arc::new(SignalBridge { engine: weak.clone() });
            Self {
                signal: SignalClient::new(signal_handler, ClientInfo::default()),
                handler,
                options,
                states: Mutex::new(ConstituentStates {
                    sig: ConnectionState::Disconnected,
                    publisher: ConnectionState::Disconnected,
                    subscriber: ConnectionState::Disconnected,
                    subscriber_primary: false,
                    media_failed: false,
                }),
                reported_aggregate: Mutex::new(ConnectionState::Disconnected),
                publisher: Mutex::new(None),
                subscriber: Mutex::new(None),
                ice_servers: Mutex::new(Vec::new()),
                local_participant_sid: Mutex::new(None),
                sub_audio_track_sid: Mutex::new(None),
                media_streaming: Arc::new(AtomicBool::new(false)),
                stream_task: Mutex::new(None),
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.reported_aggregate.lock().unwrap()
    }

    fn recompute_aggregate(&self) {
        let states = *self.states.lock().unwrap();
        let new_state = aggregate_state(states);
        let mut reported = self.reported_aggregate.lock().unwrap();
        if *reported != new_state {
            *reported = new_state;
            drop(reported);
            self.handler.on_state_changed(new_state);
        }
    }

    fn set_sig_state(&self, state: ConnectionState) {
        self.states.lock().unwrap().sig = state;
        self.recompute_aggregate();
    }

    /// Sticky: once capture start or the stream task fails, the engine's
    /// aggregate state reports `Failed` until the next `Join` rebuilds it.
    fn set_media_failed(&self) {
        self.states.lock().unwrap().media_failed = true;
        self.recompute_aggregate();
    }

    fn set_peer_state(self: &Arc<Self>, role: PeerRole, state: ConnectionState) {
        {
            let mut states = self.states.lock().unwrap();
            match role {
                PeerRole::Publisher => states.publisher = state,
                PeerRole::Subscriber => states.subscriber = state,
            }
        }
        self.recompute_aggregate();
        if role == PeerRole::Publisher && state == ConnectionState::Connected {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.start_publish_pipeline().await });
        }
    }

    pub async fn connect(self: &Arc<Self>, server_url: &str, token: &str) -> Result<(), EngineError> {
        self.signal.connect(server_url, token).await?;
        Ok(())
    }

    async fn handle_join(self: Arc<Self>, join: JoinResponse) {
        if join.subscriber_primary {
            warn!("subscriber-primary join rejected: not implemented in this revision");
            return;
        }

        self.disconnect_peers().await;
        self.states.lock().unwrap().media_failed = false;

        // The engine owns this list for the life of the session and
        // rebuilds it fresh on every Join.
        *self.ice_servers.lock().unwrap() = join.ice_servers.clone();

        let force_relay = self.options.ice.force_relay;

        // One `IceServerConfig` per URL, even when a single `IceServer`
        // lists many — each carries the same username/credential as the
        // server entry it came from.
        let ice_servers: Vec<IceServerConfig> = join
            .ice_servers
            .iter()
            .flat_map(|server| {
                server.urls.iter().map(move |url| IceServerConfig {
                    urls: vec![url.clone()],
                    username: (!server.username.is_empty()).then(|| server.username.clone()),
                    credential: (!server.credential.is_empty()).then(|| server.credential.clone()),
                })
            })
            .collect();

        let publisher_handler: Arc<dyn PeerHandler> = Arc::new(PeerBridge {
            engine: Arc::downgrade(&self),
            role: PeerRole::Publisher,
        });
        let subscriber_handler: Arc<dyn PeerHandler> = Arc::new(PeerBridge {
            engine: Arc::downgrade(&self),
            role: PeerRole::Subscriber,
        });

        let publisher_config = PeerConfig {
            role: PeerRole::Publisher,
            ice_servers: ice_servers.clone(),
            force_relay,
            audio: self.options.publish.audio_encode.clone(),
            video: self.options.publish.video_encode.clone(),
        };
        let subscriber_config = PeerConfig {
            role: PeerRole::Subscriber,
            ice_servers,
            force_relay,
            audio: None,
            video: None,
        };

        let publisher = match Peer::new(publisher_config, publisher_handler).await {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to create publisher peer: {e}");
                return;
            }
        };
        let subscriber = match Peer::new(subscriber_config, subscriber_handler).await {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to create subscriber peer: {e}");
                return;
            }
        };

        *self.publisher.lock().unwrap() = Some(Arc::clone(&publisher));
        *self.subscriber.lock().unwrap() = Some(Arc::clone(&subscriber));

        if let Err(e) = publisher.connect().await {
            warn!("publisher connect (offer generation) failed: {e}");
        }
        if let Err(e) = subscriber.connect().await {
            warn!("subscriber connect failed: {e}");
        }

        if let Some(participant) = &join.participant {
            *self.local_participant_sid.lock().unwrap() = Some(participant.sid.clone());
        }

        if let Some(room) = join.room {
            self.handler.on_room_info(room);
        }
        if let Some(participant) = join.participant {
            self.handler.on_participant_info(participant, true);
        }
        for participant in join.other_participants {
            self.handler.on_participant_info(participant, false);
        }
    }

    async fn handle_leave(self: Arc<Self>) {
        self.disconnect_peers().await;
        *self.local_participant_sid.lock().unwrap() = None;
        *self.sub_audio_track_sid.lock().unwrap() = None;
    }

    /// Clears the streaming flag before aborting the stream task, then
    /// stops the capturer.
    fn stop_publish_pipeline(&self) {
        self.media_streaming.store(false, Ordering::Release);
        if let Some(task) = self.stream_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(capturer) = &self.options.publish.capturer {
            capturer.stop();
        }
    }

    async fn disconnect_peer_connections(&self) {
        let publisher = self.publisher.lock().unwrap().take();
        let subscriber = self.subscriber.lock().unwrap().take();
        if let Some(p) = publisher {
            let _ = p.disconnect().await;
        }
        if let Some(s) = subscriber {
            let _ = s.disconnect().await;
        }
    }

    async fn disconnect_peers(&self) {
        self.stop_publish_pipeline();
        self.disconnect_peer_connections().await;
    }

    async fn apply_publisher_answer(self: Arc<Self>, sdp: String) {
        let publisher = self.publisher.lock().unwrap().clone();
        match publisher {
            Some(p) => {
                if let Err(e) = p.apply_remote_answer(sdp).await {
                    warn!("failed to apply publisher answer: {e}");
                }
            }
            // An Offer/Answer arriving before Join has no peer to apply to
            // yet; discarded.
            None => warn!("received answer with no publisher peer, discarding"),
        }
    }

    async fn apply_subscriber_offer(self: Arc<Self>, sdp: String) {
        let subscriber = self.subscriber.lock().unwrap().clone();
        match subscriber {
            Some(s) => {
                if let Err(e) = s.apply_remote_offer(sdp).await {
                    warn!("failed to apply subscriber offer: {e}");
                }
            }
            None => warn!("received offer with no subscriber peer, discarding"),
        }
    }

    async fn apply_trickle(self: Arc<Self>, candidate: String, target: SignalTarget) {
        let peer = match target {
            SignalTarget::Publisher => self.publisher.lock().unwrap().clone(),
            SignalTarget::Subscriber => self.subscriber.lock().unwrap().clone(),
        };
        if let Some(peer) = peer {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("failed to apply trickle candidate: {e}");
            }
        }
    }

    /// Subscribe policy: only ever one remote audio track subscribed at a
    /// time, first one seen wins.
    async fn handle_participant_update(self: Arc<Self>, participant: ParticipantInfo) {
        if self.sub_audio_track_sid.lock().unwrap().is_some() {
            return;
        }
        let first_audio = participant
            .tracks
            .iter()
            .find(|t| t.r#type() == TrackType::Audio)
            .map(|t| t.sid.clone());

        if let Some(sid) = first_audio {
            *self.sub_audio_track_sid.lock().unwrap() = Some(sid.clone());
            if let Err(e) = self.signal.send_update_subscription(sid, true) {
                warn!("failed to send update_subscription: {e}");
            }
        }
    }

    /// Starts capture, the ~20 ms publish stream task, and sends one
    /// `AddTrack` per configured media kind.
    async fn start_publish_pipeline(self: Arc<Self>) {
        let publish = &self.options.publish;
        if publish.kind == MediaKind::NONE {
            return;
        }
        let Some(capturer) = publish.capturer.clone() else { return };
        if let Err(e) = capturer.start() {
            warn!("capturer start failed: {e}");
            self.set_media_failed();
            return;
        }

        if publish.kind.contains(MediaKind::AUDIO) {
            if let Some(audio) = &publish.audio_encode {
                let mut features = Vec::new();
                if audio.channels == 2 {
                    features.push(AudioTrackFeature::TfStereo as i32);
                }
                let request = AddTrackRequest {
                    cid: "audio0".to_string(),
                    name: "Audio".to_string(),
                    r#type: TrackType::Audio as i32,
                    source: TrackSource::Microphone as i32,
                    muted: false,
                    audio_features: features,
                    layers: vec![],
                    stereo: audio.channels == 2,
                };
                if let Err(e) = self.signal.send_add_track(request) {
                    warn!("failed to send audio add_track: {e}");
                }
            }
        }

        if publish.kind.contains(MediaKind::VIDEO) {
            if let Some(video) = &publish.video_encode {
                let request = AddTrackRequest {
                    cid: "video0".to_string(),
                    name: "Video".to_string(),
                    r#type: TrackType::Video as i32,
                    source: TrackSource::Camera as i32,
                    muted: false,
                    audio_features: vec![],
                    layers: vec![VideoLayer {
                        quality: VideoQuality::High as i32,
                        width: video.width,
                        height: video.height,
                        bitrate: 0,
                        ssrc: 0,
                    }],
                    stereo: false,
                };
                if let Err(e) = self.signal.send_add_track(request) {
                    warn!("failed to send video add_track: {e}");
                }
            }
        }

        self.media_streaming.store(true, Ordering::Release);
        let engine = Arc::clone(&self);
        let flag = Arc::clone(&self.media_streaming);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(20));
            while flag.load(Ordering::Acquire) {
                interval.tick().await;
                let publisher = engine.publisher.lock().unwrap().clone();
                let Some(publisher) = publisher else { break };
                let Some(capturer) = engine.options.publish.capturer.clone() else { break };
                while let Some(frame) = capturer.try_recv_audio() {
                    if let Err(e) = publisher.send_audio(frame).await {
                        warn!("failed to forward captured audio frame: {e}");
                    }
                }
                if let Some(frame) = capturer.try_recv_video() {
                    if let Err(e) = publisher.send_video(frame).await {
                        warn!("failed to forward captured video frame: {e}");
                    }
                }
            }
        });
        *self.stream_task.lock().unwrap() = Some(handle);
    }

    /// Stops the publish loop, resets the renderer, disconnects both peers,
    /// sends `Leave`, then closes the signaling socket — in that order.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.stop_publish_pipeline();
        if let Some(renderer) = &self.options.subscribe.renderer {
            renderer.reset();
        }
        self.disconnect_peer_connections().await;
        self.signal.close().await?;
        Ok(())
    }

    pub fn send_data_packet(&self, packet: &DataPacket, kind: DataPacketKind) -> Result<(), EngineError> {
        let publisher = self
            .publisher
            .lock()
            .unwrap()
            .clone()
            .ok_or(EngineError::InvalidState("not connected"))?;
        // `send_data_packet` is synchronous in the room's public API; the
        // actual SCTP send is async, so it's dispatched onto a task. The
        // "channel open or InvalidState" contract is still honored —
        // `Peer::send_data_packet` re-checks channel state before sending.
        let packet = packet.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.send_data_packet(&packet, kind).await {
                warn!("data packet send failed: {e}");
            }
        });
        Ok(())
    }
}

pub fn user_data_packet(payload: Vec<u8>, topic: String, destination_identities: Vec<String>) -> DataPacket {
    DataPacket {
        kind: DataPacketKind::Reliable as i32,
        destination_identities,
        participant_identity: String::new(),
        value: Some(DataPacketValue::User(UserPacket {
            topic,
            payload,
            destination_identities: vec![],
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;
    impl EngineHandler for NoopHandler {
        fn on_state_changed(&self, _state: ConnectionState) {}
        fn on_room_info(&self, _room: Room) {}
        fn on_participant_info(&self, _participant: ParticipantInfo, _is_local: bool) {}
        fn on_data_received(&self, _packet: DataPacket) {}
    }

    #[test]
    fn new_engine_starts_disconnected() {
        let engine = Engine::new(RoomOptions::default(), Arc::new(NoopHandler));
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn user_data_packet_defaults_to_reliable_kind() {
        let packet = user_data_packet(vec![1, 2, 3], "t".to_string(), vec![]);
        assert_eq!(packet.kind, DataPacketKind::Reliable as i32);
        match packet.value {
            Some(DataPacketValue::User(user)) => assert_eq!(user.topic, "t"),
            _ => panic!("expected user packet"),
        }
    }
}
