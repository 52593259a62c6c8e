//! Signaling client: WebSocket session, keepalive timer, response dispatch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use livekit_protocol::{
    build_url, decode_response, encode_request, redact, signal_request::Message as ReqMsg,
    signal_response::Message as RespMsg, AddTrackRequest, ClientInfo, DisconnectReason,
    LeaveRequest, LeaveRequestAction, MuteTrackRequest, ParticipantInfo, PingRequest, Room,
    SessionDescription, SignalRequest, SignalTarget, TrickleRequest, UpdateSubscription,
};

use crate::error::SignalError;
use crate::state::ConnectionState;

/// Callback set supplied at creation. Every method is required — a caller
/// cannot construct a `SignalClient` without implementing all of them,
/// the compile-time form of "all handlers are required; missing any
/// yields `InvalidArg` at creation."
pub trait SignalHandler: Send + Sync {
    fn on_state_changed(&self, state: ConnectionState);
    fn on_join(&self, join: livekit_protocol::JoinResponse);
    fn on_leave(&self, reason: DisconnectReason, action: LeaveRequestAction);
    fn on_room_update(&self, room: Room);
    fn on_participant_update(&self, participant: ParticipantInfo);
    fn on_answer(&self, sdp: String);
    fn on_offer(&self, sdp: String);
    fn on_trickle(&self, candidate: String, target: SignalTarget);
}

enum Outbound {
    Frame(bytes::Bytes),
    Close,
}

struct Inner {
    handler: Arc<dyn SignalHandler>,
    client_info: ClientInfo,
    state: Mutex<ConnectionState>,
    rtt_ms: AtomicI64,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns one WebSocket session to the SFU. Created without I/O; `connect`
/// performs the handshake and spawns the reader/writer/ping tasks.
pub struct SignalClient {
    inner: Arc<Inner>,
}

impl SignalClient {
    pub fn new(handler: Arc<dyn SignalHandler>, client_info: ClientInfo) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                client_info,
                state: Mutex::new(ConnectionState::Disconnected),
                rtt_ms: AtomicI64::new(0),
                outbound_tx: Mutex::new(None),
                ping_task: Mutex::new(None),
                io_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.inner.state.lock().unwrap();
        if *state != new_state {
            *state = new_state;
            drop(state);
            self.inner.handler.on_state_changed(new_state);
        }
    }

    /// Opens the WebSocket and spawns the reader/writer/ping machinery.
    /// At most one signaling WebSocket is active per engine: calling
    /// `connect` while already connected is rejected.
    pub async fn connect(&self, server_url: &str, token: &str) -> Result<(), SignalError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(SignalError::InvalidState("signal client is not disconnected"));
        }

        let url = build_url(server_url, token, &self.inner.client_info)?;
        debug!(url = %redact(&url), "connecting to signaling server");
        self.set_state(ConnectionState::Connecting);

        let root_store = native_root_store();
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = tokio_tungstenite::Connector::Rustls(Arc::new(tls_config));

        let (ws_stream, _) =
            tokio_tungstenite::connect_async_tls_with_config(&url, None, false, Some(connector))
                .await
                .map_err(|e| {
                    self.set_state(ConnectionState::Failed);
                    e
                })?;

        info!("signaling websocket connected");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        *self.inner.outbound_tx.lock().unwrap() = Some(outbound_tx);

        // Single writer loop: outbound sends are serialized through this one
        // channel (at most one send in flight at a time), and `close`
        // enqueues its Close sentinel behind any already-queued Leave frame
        // so Leave is flushed before the socket closes.
        let writer_inner = Arc::clone(&self.inner);
        let writer = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(bytes) => {
                        if let Err(e) = ws_tx.send(WsMessage::Binary(bytes)).await {
                            warn!("signaling send failed: {e}");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            *writer_inner.outbound_tx.lock().unwrap() = None;
        });

        let reader_inner = Arc::clone(&self.inner);
        let reader = tokio::spawn(async move {
            loop {
                match ws_rx.next().await {
                    Some(Ok(WsMessage::Binary(data))) => dispatch(&reader_inner, &data),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        stop_ping(&reader_inner);
                        set_state_via_inner(&reader_inner, ConnectionState::Disconnected);
                        break;
                    }
                    Some(Ok(_other)) => {
                        debug!("ignoring non-binary signaling frame");
                    }
                    Some(Err(e)) => {
                        warn!("signaling transport error: {e}");
                        stop_ping(&reader_inner);
                        set_state_via_inner(&reader_inner, ConnectionState::Failed);
                        break;
                    }
                }
            }
        });

        self.inner.io_tasks.lock().unwrap().extend([writer, reader]);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Sends `Leave` (if still connected) and enqueues the close handshake
    /// behind it on the same ordered channel, then waits for the I/O tasks
    /// to finish so the caller observes a settled state on return.
    pub async fn close(&self) -> Result<(), SignalError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let _ = self.send_leave();
        stop_ping(&self.inner);
        if let Some(tx) = self.inner.outbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Outbound::Close);
        }
        let tasks: Vec<_> = self.inner.io_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn send(&self, message: ReqMsg) -> Result<(), SignalError> {
        let request = SignalRequest { message: Some(message) };
        let frame = encode_request(&request).map_err(|e| SignalError::Message(e.to_string()))?;
        let guard = self.inner.outbound_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Outbound::Frame(frame))
                .map_err(|_| SignalError::InvalidState("signaling writer has stopped")),
            None => Err(SignalError::InvalidState("not connected")),
        }
    }

    pub fn send_offer(&self, sdp: String) -> Result<(), SignalError> {
        self.send(ReqMsg::Offer(SessionDescription { r#type: "offer".to_string(), sdp }))
    }

    pub fn send_answer(&self, sdp: String) -> Result<(), SignalError> {
        self.send(ReqMsg::Answer(SessionDescription { r#type: "answer".to_string(), sdp }))
    }

    pub fn send_leave(&self) -> Result<(), SignalError> {
        self.send(ReqMsg::Leave(LeaveRequest {
            can_reconnect: false,
            reason: DisconnectReason::ClientInitiated as i32,
            action: LeaveRequestAction::Disconnect as i32,
        }))
    }

    pub fn send_add_track(&self, request: AddTrackRequest) -> Result<(), SignalError> {
        self.send(ReqMsg::AddTrack(request))
    }

    pub fn send_update_subscription(&self, track_sid: String, subscribe: bool) -> Result<(), SignalError> {
        self.send(ReqMsg::Subscription(UpdateSubscription {
            track_sids: vec![track_sid],
            subscribe,
            participant_tracks: vec![],
        }))
    }

    #[allow(dead_code)]
    fn send_mute(&self, sid: String, muted: bool) -> Result<(), SignalError> {
        self.send(ReqMsg::Mute(MuteTrackRequest { sid, muted }))
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

fn start_ping(inner: &Arc<Inner>, period: Duration) {
    let ping_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let rtt = ping_inner.rtt_ms.load(Ordering::Relaxed);
            let request = SignalRequest {
                message: Some(ReqMsg::PingReq(PingRequest { timestamp: now_ms(), rtt })),
            };
            match encode_request(&request) {
                Ok(frame) => {
                    let guard = ping_inner.outbound_tx.lock().unwrap();
                    if let Some(tx) = guard.as_ref() {
                        if tx.send(Outbound::Frame(frame)).is_err() {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                Err(e) => warn!("failed to encode ping: {e}"),
            }
        }
    });
    *inner.ping_task.lock().unwrap() = Some(handle);
}

fn stop_ping(inner: &Arc<Inner>) {
    if let Some(handle) = inner.ping_task.lock().unwrap().take() {
        handle.abort();
    }
}

fn set_state_via_inner(inner: &Arc<Inner>, new_state: ConnectionState) {
    let mut state = inner.state.lock().unwrap();
    if *state != new_state {
        *state = new_state;
        drop(state);
        inner.handler.on_state_changed(new_state);
    }
}

fn dispatch(inner: &Arc<Inner>, frame: &[u8]) {
    let response = match decode_response(frame) {
        Ok(response) => response,
        Err(e) => {
            // A decode failure drops this frame only; the session
            // continues.
            warn!("failed to decode signal response, dropping frame: {e}");
            return;
        }
    };

    match response.message {
        Some(RespMsg::Join(join)) => {
            let period = Duration::from_millis(join.ping_interval as u64 * 1000);
            start_ping(inner, period);
            inner.handler.on_join(join);
        }
        Some(RespMsg::Leave(leave)) => {
            stop_ping(inner);
            let reason = DisconnectReason::try_from(leave.reason).unwrap_or(DisconnectReason::UnknownReason);
            let action = LeaveRequestAction::try_from(leave.action).unwrap_or(LeaveRequestAction::Disconnect);
            inner.handler.on_leave(reason, action);
        }
        Some(RespMsg::Answer(sdp)) => inner.handler.on_answer(sdp.sdp),
        Some(RespMsg::Offer(sdp)) => inner.handler.on_offer(sdp.sdp),
        Some(RespMsg::Trickle(trickle)) => dispatch_trickle(inner, trickle),
        Some(RespMsg::RoomUpdate(update)) => {
            if let Some(room) = update.room {
                inner.handler.on_room_update(room);
            }
        }
        Some(RespMsg::Update(update)) => {
            for participant in update.participants {
                inner.handler.on_participant_update(participant);
            }
        }
        Some(RespMsg::PongResp(pong)) | Some(RespMsg::Pong(pong)) => {
            let rtt = now_ms() - pong.last_ping_timestamp;
            inner.rtt_ms.store(rtt, Ordering::Relaxed);
        }
        Some(RespMsg::RefreshToken(_token)) => {
            // Accepted, not acted upon in this revision (DESIGN.md Open
            // Question 1); the sandbox token fetcher that would consume a
            // refreshed credential is out of scope.
            info!("received refresh_token, ignoring per current revision");
        }
        // Everything else decodes into an owned value that simply drops
        // here: speakers_changed, connection_quality_update,
        // stream_state_update, subscribed_quality_update,
        // subscription_permission_update, track_published/unpublished,
        // mute, reconnect, subscription_response, request_response,
        // track_subscribed, room_moved.
        Some(_) => {}
        None => {}
    }
}

fn dispatch_trickle(inner: &Arc<Inner>, trickle: TrickleRequest) {
    #[derive(serde::Deserialize)]
    struct CandidateInit {
        candidate: Option<serde_json::Value>,
    }

    let candidate = match serde_json::from_str::<CandidateInit>(&trickle.candidate_init) {
        Ok(parsed) => match parsed.candidate {
            Some(serde_json::Value::String(s)) => s,
            _ => {
                warn!("trickle candidate_init missing a string \"candidate\" field, ignoring");
                return;
            }
        },
        Err(e) => {
            warn!("trickle candidate_init is not valid json, ignoring: {e}");
            return;
        }
    };

    let target = SignalTarget::try_from(trickle.target).unwrap_or(SignalTarget::Publisher);
    inner.handler.on_trickle(candidate, target);
}

fn native_root_store() -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = store.add(cert);
            }
        }
        Err(e) => warn!("failed to load platform root certificates: {e}"),
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        trickles: StdMutex<Vec<(String, SignalTarget)>>,
        states: StdMutex<Vec<ConnectionState>>,
    }

    impl SignalHandler for RecordingHandler {
        fn on_state_changed(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }
        fn on_join(&self, _join: livekit_protocol::JoinResponse) {}
        fn on_leave(&self, _reason: DisconnectReason, _action: LeaveRequestAction) {}
        fn on_room_update(&self, _room: Room) {}
        fn on_participant_update(&self, _participant: ParticipantInfo) {}
        fn on_answer(&self, _sdp: String) {}
        fn on_offer(&self, _sdp: String) {}
        fn on_trickle(&self, candidate: String, target: SignalTarget) {
            self.trickles.lock().unwrap().push((candidate, target));
        }
    }

    fn test_inner() -> (Arc<Inner>, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let inner = Arc::new(Inner {
            handler: handler.clone() as Arc<dyn SignalHandler>,
            client_info: ClientInfo::default(),
            state: Mutex::new(ConnectionState::Disconnected),
            rtt_ms: AtomicI64::new(0),
            outbound_tx: Mutex::new(None),
            ping_task: Mutex::new(None),
            io_tasks: Mutex::new(Vec::new()),
        });
        (inner, handler)
    }

    #[test]
    fn trickle_with_string_candidate_is_forwarded() {
        let (inner, handler) = test_inner();
        let trickle = TrickleRequest {
            candidate_init: r#"{"candidate":"candidate:1 1 UDP 1 1.2.3.4 1 typ host","sdpMid":"0"}"#.to_string(),
            target: SignalTarget::Subscriber as i32,
            r#final: false,
        };
        dispatch_trickle(&inner, trickle);
        let trickles = handler.trickles.lock().unwrap();
        assert_eq!(trickles.len(), 1);
        assert_eq!(trickles[0].1, SignalTarget::Subscriber);
    }

    #[test]
    fn trickle_missing_candidate_field_is_dropped_not_fatal() {
        let (inner, handler) = test_inner();
        let trickle = TrickleRequest {
            candidate_init: r#"{"sdpMid":"0"}"#.to_string(),
            target: SignalTarget::Publisher as i32,
            r#final: false,
        };
        dispatch_trickle(&inner, trickle);
        assert!(handler.trickles.lock().unwrap().is_empty());
    }

    #[test]
    fn trickle_non_string_candidate_is_dropped() {
        let (inner, handler) = test_inner();
        let trickle = TrickleRequest {
            candidate_init: r#"{"candidate":42}"#.to_string(),
            target: SignalTarget::Publisher as i32,
            r#final: false,
        };
        dispatch_trickle(&inner, trickle);
        assert!(handler.trickles.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_response_frame_does_not_panic() {
        let (inner, _handler) = test_inner();
        dispatch(&inner, &[0xFF, 0x00, 0xAB]);
    }
}
