//! A publisher or subscriber WebRTC peer connection.
//!
//! The underlying peer connection library (`webrtc`, i.e. webrtc-rs) is
//! callback/future-driven rather than polled. `disconnect` gets a
//! deterministic-shutdown guarantee — it doesn't return until all of this
//! peer's background work has stopped — by tracking spawned task handles
//! and aborting them before closing the underlying connection.

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::ice_transport::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use livekit_protocol::{decode_data_packet, encode_data_packet, DataPacket, DataPacketKind};

use crate::config::{AudioEncodeOptions, VideoEncodeOptions};
use crate::error::PeerError;
use crate::media::{AudioCodec, AudioFrame, VideoCodec, VideoFrame};
use crate::state::ConnectionState;

/// `0xFFFF`, distinct from any valid SCTP stream id.
const STREAM_ID_INVALID: u16 = 0xFFFF;

const RELIABLE_LABEL: &str = "_reliable";
const LOSSY_LABEL: &str = "_lossy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Publisher,
    Subscriber,
}

#[derive(Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

pub struct PeerConfig {
    pub role: PeerRole,
    pub ice_servers: Vec<IceServerConfig>,
    pub force_relay: bool,
    pub audio: Option<AudioEncodeOptions>,
    pub video: Option<VideoEncodeOptions>,
}

/// Callback set a `Peer` invokes on its owner (the engine). One `Peer`
/// instance always drives exactly one of these.
pub trait PeerHandler: Send + Sync {
    fn on_state_changed(&self, role: PeerRole, state: ConnectionState);
    /// Publisher: an offer it generated. Subscriber: an answer it generated
    /// in response to the server's offer. The engine routes each to the
    /// right outbound signaling request by role.
    fn on_sdp(&self, role: PeerRole, sdp: String);
    fn on_data_packet(&self, packet: DataPacket);
    fn on_audio_info(&self, info: crate::media::AudioStreamInfo);
    fn on_audio_frame(&self, frame: AudioFrame);
}

fn to_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        // `Connected` is intentionally not mapped here: for the publisher it
        // only triggers data-channel creation; the peer isn't reported
        // Connected until both channels open.
        _ => None,
    }
}

struct DataChannelSlot {
    channel: Arc<RTCDataChannel>,
    stream_id: AtomicU16,
}

pub struct Peer {
    role: PeerRole,
    pc: Arc<RTCPeerConnection>,
    handler: Arc<dyn PeerHandler>,
    reported_state: AtomicU8,
    reliable: Mutex<Option<Arc<DataChannelSlot>>>,
    lossy: Mutex<Option<Arc<DataChannelSlot>>>,
    audio_track: Mutex<Option<Arc<TrackLocalStaticSample>>>,
    video_track: Mutex<Option<Arc<TrackLocalStaticSample>>>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// AtomicU8-backed cache of the last reported ConnectionState, used only for
// the edge-triggering dedup in `report_state`.
fn state_to_tag(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Disconnected => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Reconnecting => 3,
        ConnectionState::Failed => 4,
    }
}

impl Peer {
    pub async fn new(config: PeerConfig, handler: Arc<dyn PeerHandler>) -> Result<Arc<Self>, PeerError> {
        if matches!(config.video, Some(VideoEncodeOptions { codec: VideoCodec::Mjpeg, .. })) {
            return Err(PeerError::InvalidArg("MJPEG over data channel is not supported yet"));
        }

        let mut media_engine = MediaEngine::default();
        let video_fmtp = register_codecs(&mut media_engine, &config)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(PeerError::Rtc)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }]
        } else {
            config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect()
        };

        let ice_transport_policy = if config.force_relay {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        };

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(PeerError::Rtc)?);

        let mut audio_track = None;
        let mut video_track = None;
        let mut video_sender = None;

        if config.role == PeerRole::Publisher {
            if let Some(audio) = &config.audio {
                let track = Arc::new(TrackLocalStaticSample::new(
                    audio_capability(audio.codec),
                    "audio".to_string(),
                    "livekit".to_string(),
                ));
                pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(PeerError::Rtc)?;
                audio_track = Some(track);
            }
            if config.video.is_some() {
                let track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90000,
                        sdp_fmtp_line: video_fmtp.unwrap_or_default(),
                        ..Default::default()
                    },
                    "video".to_string(),
                    "livekit".to_string(),
                ));
                let sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(PeerError::Rtc)?;
                video_track = Some(track);
                video_sender = Some(sender);
            }
        } else {
            // Subscriber: RecvOnly transceivers for whatever remote tracks
            // the SFU attaches. Only the first remote audio track is ever
            // forwarded up; video subscription is not initiated from the
            // engine in this revision, so no video transceiver is
            // pre-added here.
            use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
            use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
            pc.add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(PeerError::Rtc)?;
        }

        let peer = Arc::new(Self {
            role: config.role,
            pc: Arc::clone(&pc),
            handler,
            reported_state: AtomicU8::new(state_to_tag(ConnectionState::Disconnected)),
            reliable: Mutex::new(None),
            lossy: Mutex::new(None),
            audio_track: Mutex::new(audio_track),
            video_track: Mutex::new(video_track),
            video_sender: Mutex::new(video_sender),
            tasks: Mutex::new(Vec::new()),
        });

        peer.wire_state_callback();
        if peer.role == PeerRole::Subscriber {
            peer.wire_track_callback();
        }
        if let Some(sender) = peer.video_sender.lock().unwrap().clone() {
            peer.spawn_rtcp_reader(sender);
        }

        Ok(peer)
    }

    fn wire_state_callback(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc.on_peer_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(peer) = weak.upgrade() else { return };
                if state == RTCPeerConnectionState::Connected {
                    if peer.role == PeerRole::Publisher {
                        if let Err(e) = peer.create_data_channels().await {
                            warn!("failed to create data channels: {e}");
                        }
                    } else {
                        peer.report_state(ConnectionState::Connected);
                    }
                    return;
                }
                if let Some(mapped) = to_connection_state(state) {
                    peer.report_state(mapped);
                }
            })
        }));
    }

    fn wire_track_callback(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(peer) = weak.upgrade() else { return };
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                let params = track.codec();
                let info = crate::media::audio_stream_info(
                    mime_to_audio_codec(&params.capability.mime_type),
                    params.capability.clock_rate,
                    params.capability.channels.max(1) as u8,
                );
                peer.handler.on_audio_info(info);

                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            peer.handler.on_audio_frame(AudioFrame {
                                pts_us: packet.header.timestamp as u64,
                                data: packet.payload.to_vec(),
                            });
                        }
                        Err(_) => break,
                    }
                }
            })
        }));
    }

    fn spawn_rtcp_reader(self: &Arc<Self>, sender: Arc<RTCRtpSender>) {
        let handle = tokio::spawn(async move {
            while sender.read_rtcp().await.is_ok() {}
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn report_state(&self, new_state: ConnectionState) {
        let tag = state_to_tag(new_state);
        if self.reported_state.swap(tag, Ordering::AcqRel) != tag {
            self.handler.on_state_changed(self.role, new_state);
        }
    }

    /// Publisher only, and only once the underlying connection reaches
    /// `Connected`. `_reliable` is ordered/reliable; `_lossy` is unordered
    /// with zero retransmits.
    async fn create_data_channels(self: &Arc<Self>) -> Result<(), PeerError> {
        let reliable_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let lossy_init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };

        let reliable = self
            .pc
            .create_data_channel(RELIABLE_LABEL, Some(reliable_init))
            .await
            .map_err(PeerError::Rtc)?;
        let lossy = self
            .pc
            .create_data_channel(LOSSY_LABEL, Some(lossy_init))
            .await
            .map_err(PeerError::Rtc)?;

        self.wire_data_channel(reliable, &self.reliable);
        self.wire_data_channel(lossy, &self.lossy);
        Ok(())
    }

    fn wire_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>, slot: &Mutex<Option<Arc<DataChannelSlot>>>) {
        let entry = Arc::new(DataChannelSlot {
            channel: Arc::clone(&dc),
            stream_id: AtomicU16::new(STREAM_ID_INVALID),
        });
        *slot.lock().unwrap() = Some(Arc::clone(&entry));

        let open_peer = Arc::clone(self);
        let open_entry = Arc::clone(&entry);
        dc.on_open(Box::new(move || {
            if let Some(id) = open_entry.channel.id() {
                open_entry.stream_id.store(id, Ordering::Release);
            }
            let peer = Arc::clone(&open_peer);
            Box::pin(async move {
                if peer.channels_open() {
                    peer.report_state(ConnectionState::Connected);
                }
            })
        }));

        let close_entry = Arc::clone(&entry);
        dc.on_close(Box::new(move || {
            close_entry.stream_id.store(STREAM_ID_INVALID, Ordering::Release);
            Box::pin(async {})
        }));

        let msg_peer = Arc::clone(self);
        dc.on_message(Box::new(move |msg| {
            let peer = Arc::clone(&msg_peer);
            Box::pin(async move {
                match decode_data_packet(&msg.data) {
                    Ok(packet) => peer.handler.on_data_packet(packet),
                    Err(e) => warn!("failed to decode inbound data packet, dropping: {e}"),
                }
            })
        }));
    }

    fn channels_open(&self) -> bool {
        let reliable_open = self
            .reliable
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.stream_id.load(Ordering::Acquire) != STREAM_ID_INVALID)
            .unwrap_or(false);
        let lossy_open = self
            .lossy
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.stream_id.load(Ordering::Acquire) != STREAM_ID_INVALID)
            .unwrap_or(false);
        reliable_open && lossy_open
    }

    /// Publisher: generates and applies a local offer, then hands it to the
    /// caller via `on_sdp`. Subscriber: no-op, it waits for an inbound
    /// offer (`apply_remote_offer`).
    pub async fn connect(self: &Arc<Self>) -> Result<(), PeerError> {
        if self.role != PeerRole::Publisher {
            return Ok(());
        }
        let offer = self.pc.create_offer(None).await.map_err(PeerError::Rtc)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(PeerError::Rtc)?;
        self.handler.on_sdp(self.role, offer.sdp);
        Ok(())
    }

    /// Subscriber: applies the server-initiated offer and generates an
    /// answer, handed back via `on_sdp`.
    pub async fn apply_remote_offer(&self, sdp: String) -> Result<(), PeerError> {
        let offer = RTCSessionDescription::offer(sdp).map_err(PeerError::Rtc)?;
        self.pc.set_remote_description(offer).await.map_err(PeerError::Rtc)?;
        let answer = self.pc.create_answer(None).await.map_err(PeerError::Rtc)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(PeerError::Rtc)?;
        self.handler.on_sdp(self.role, answer.sdp);
        Ok(())
    }

    /// Publisher: applies the server's answer to the offer we generated.
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(sdp).map_err(PeerError::Rtc)?;
        self.pc.set_remote_description(answer).await.map_err(PeerError::Rtc)
    }

    pub async fn add_ice_candidate(&self, candidate: String) -> Result<(), PeerError> {
        debug!(candidate, role = ?self.role, "applying remote ice candidate");
        self.pc
            .add_ice_candidate(RTCIceCandidateInit { candidate, ..Default::default() })
            .await
            .map_err(PeerError::Rtc)
    }

    /// `InvalidState` if the channel for `kind` isn't open yet.
    pub async fn send_data_packet(&self, packet: &DataPacket, kind: DataPacketKind) -> Result<(), PeerError> {
        let slot_guard = match kind {
            DataPacketKind::Reliable => self.reliable.lock().unwrap().clone(),
            DataPacketKind::Lossy => self.lossy.lock().unwrap().clone(),
        };
        let slot = slot_guard.ok_or(PeerError::InvalidState("data channel not yet open"))?;
        if slot.stream_id.load(Ordering::Acquire) == STREAM_ID_INVALID {
            return Err(PeerError::InvalidState("data channel not yet open"));
        }
        let bytes = encode_data_packet(packet).map_err(|_| PeerError::InvalidState("failed to encode data packet"))?;
        slot.channel.send(&bytes).await.map_err(PeerError::Rtc)?;
        Ok(())
    }

    pub async fn send_audio(&self, frame: AudioFrame) -> Result<(), PeerError> {
        assert_eq!(self.role, PeerRole::Publisher, "send_audio is publisher-only");
        let track = self
            .audio_track
            .lock()
            .unwrap()
            .clone()
            .ok_or(PeerError::InvalidState("no audio track configured"))?;
        track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(frame.data),
                duration: Duration::from_millis(20),
                ..Default::default()
            })
            .await
            .map_err(PeerError::Rtc)
    }

    pub async fn send_video(&self, frame: VideoFrame) -> Result<(), PeerError> {
        assert_eq!(self.role, PeerRole::Publisher, "send_video is publisher-only");
        let track = self
            .video_track
            .lock()
            .unwrap()
            .clone()
            .ok_or(PeerError::InvalidState("no video track configured"))?;
        track
            .write_sample(&webrtc::media::Sample {
                data: bytes::Bytes::from(frame.data),
                duration: Duration::from_millis(1000 / 30),
                ..Default::default()
            })
            .await
            .map_err(PeerError::Rtc)
    }

    /// Aborts every task this peer spawned, then closes the underlying
    /// connection. Returns only once both have happened — the deterministic-
    /// shutdown contract the source's pause/resume/exit bits gave the
    /// polled dispatch task (see module docs).
    pub async fn disconnect(&self) -> Result<(), PeerError> {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.pc.close().await.map_err(PeerError::Rtc)?;
        info!(role = ?self.role, "peer connection closed");
        Ok(())
    }
}

fn mime_to_audio_codec(mime_type: &str) -> AudioCodec {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMA) {
        AudioCodec::G711A
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
        AudioCodec::G711U
    } else {
        AudioCodec::Opus
    }
}

fn audio_capability(codec: AudioCodec) -> RTCRtpCodecCapability {
    match codec {
        AudioCodec::Opus => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            ..Default::default()
        },
        AudioCodec::G711A => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMA.to_string(),
            clock_rate: 8000,
            channels: 1,
            ..Default::default()
        },
        AudioCodec::G711U => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_string(),
            clock_rate: 8000,
            channels: 1,
            ..Default::default()
        },
    }
}

/// Registers exactly the codecs this peer's configuration needs, never
/// `register_default_codecs`: registering unused codecs invites the
/// remote side to negotiate one this peer can't actually produce. Returns
/// the H.264 fmtp line to reuse when constructing the local video track,
/// if video was configured.
fn register_codecs(media_engine: &mut MediaEngine, config: &PeerConfig) -> Result<Option<String>, PeerError> {
    if let Some(audio) = &config.audio {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: audio_capability(audio.codec),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(PeerError::Rtc)?;
    } else if config.role == PeerRole::Subscriber {
        // Subscriber always needs to be able to decode whatever audio the
        // SFU forwards; register Opus as the common default.
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: audio_capability(AudioCodec::Opus),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(PeerError::Rtc)?;
    }

    if let Some(video) = &config.video {
        let fmtp = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90000,
                        sdp_fmtp_line: fmtp.clone(),
                        ..Default::default()
                    },
                    payload_type: 125,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(PeerError::Rtc)?;
        let _ = video.width; // resolution/fps shape the capturer, not the SDP fmtp line
        return Ok(Some(fmtp));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_sentinel_is_0xffff() {
        assert_eq!(STREAM_ID_INVALID, 0xFFFF);
    }

    #[test]
    fn mime_type_mapping_forces_g711_variants() {
        assert_eq!(mime_to_audio_codec(MIME_TYPE_PCMA), AudioCodec::G711A);
        assert_eq!(mime_to_audio_codec(MIME_TYPE_PCMU), AudioCodec::G711U);
        assert_eq!(mime_to_audio_codec(MIME_TYPE_OPUS), AudioCodec::Opus);
    }

    #[test]
    fn state_tag_round_trips_through_every_variant() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ] {
            let tag = state_to_tag(state);
            assert!(tag < 5);
        }
    }
}
