//! Session state machine shared by both ends of a bridge session
//!
//! # States
//!
//! ```text
//!  server:  NotStarted ─► AwaitingRemoteSet ─► AwaitingLocalCreate ─► Negotiated
//!  client:  NotStarted ─► AwaitingLocalCreate ─► AwaitingAnswer ─► AwaitingRemoteSet ─► Negotiated
//!
//!  Negotiated ──(control channel open)──► Established
//!  any state  ──(stop / failure / auto-close / control closed)──► Stopped
//! ```
//!
//! A session owns one peer connection, the control channel (id 0) and the
//! channels of its tunnels. All state lives behind one lock that is only
//! taken on the session's signaling thread; peer and channel events are
//! re-posted there before they touch it. Completion callbacks are always
//! posted, never run inline.

pub mod client;
pub mod server;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::error::{IceExchangeCallback, NegotiationCallback};
use crate::executor::{SignalingHandle, TaskHandle, ThreadChecker};
use crate::peer::{
    ChannelState, DataChannel, DataChannelObserver, MessageType, PeerConnection,
    PeerConnectionFactory, PeerConnectionObserver, RtcConfiguration, SdpType, CONTROL_CHANNEL_ID,
};
use crate::tunnel::SocketTunnel;

pub use client::ClientSession;
pub use server::ServerSession;

use client::ClientRole;
use server::ServerRole;

/// Negotiation progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    AwaitingRemoteSet,
    AwaitingLocalCreate,
    /// Client only: offer sent, waiting for the server's answer
    AwaitingAnswer,
    Negotiated,
    Established,
    Stopped,
}

impl SessionState {
    fn is_negotiated(self) -> bool {
        matches!(self, SessionState::Negotiated | SessionState::Established)
    }
}

/// Invoked once when a session closes itself
pub type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// The signaling RPC surface of a bridge server.
///
/// Callbacks may run on any thread.
pub trait SessionEndpoint: Send + Sync {
    fn start_session(
        &self,
        session_id: &str,
        config: RtcConfiguration,
        offer: String,
        callback: NegotiationCallback,
    );

    fn renegotiate(&self, session_id: &str, offer: String, callback: NegotiationCallback);

    fn ice_exchange(&self, session_id: &str, candidates: Vec<String>, callback: IceExchangeCallback);
}

// ============================================================================
// Session Core
// ============================================================================

enum Role {
    Server(ServerRole),
    Client(ClientRole),
}

struct TunnelSlot {
    channel_id: u16,
    tunnel: Arc<dyn SocketTunnel>,
    channel: Option<Arc<dyn DataChannel>>,
}

struct SessionInner {
    phase: SessionState,
    pc: Option<Box<dyn PeerConnection>>,
    control: Option<Arc<dyn DataChannel>>,
    tunnels: Vec<TunnelSlot>,
    control_opened: bool,
    ice_connected: bool,
    local_candidates: Vec<String>,
    auto_close: Option<TaskHandle>,
    /// Server: gathering delay of a pending exchange. Client: next ICE round.
    ice_timer: Option<TaskHandle>,
    negotiation_cb: Option<NegotiationCallback>,
    ice_cb: Option<IceExchangeCallback>,
    on_close: Option<CloseHook>,
    role: Role,
}

impl SessionInner {
    fn has_pending_request(&self) -> bool {
        self.negotiation_cb.is_some() || self.ice_cb.is_some()
    }

    fn send_control(&self, text: &str) {
        if let Some(control) = &self.control {
            control.send(text.as_bytes(), MessageType::Text);
        }
    }
}

pub(crate) struct SessionCore {
    session_id: String,
    executor: SignalingHandle,
    checker: ThreadChecker,
    config: SessionConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    inner: Mutex<SessionInner>,
}

impl SessionCore {
    fn new(
        session_id: String,
        role: Role,
        factory: Arc<dyn PeerConnectionFactory>,
        executor: SignalingHandle,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            executor,
            checker: ThreadChecker::new(),
            config,
            factory,
            inner: Mutex::new(SessionInner {
                phase: SessionState::NotStarted,
                pc: None,
                control: None,
                tunnels: Vec::new(),
                control_opened: false,
                ice_connected: false,
                local_candidates: Vec::new(),
                auto_close: None,
                ice_timer: None,
                negotiation_cb: None,
                ice_cb: None,
                on_close: None,
                role,
            }),
        })
    }

    fn state(&self) -> SessionState {
        self.inner.lock().phase
    }

    fn add_tunnel(&self, channel_id: u16, tunnel: Arc<dyn SocketTunnel>) {
        debug_assert_ne!(channel_id, CONTROL_CHANNEL_ID);
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.phase, SessionState::NotStarted);
        inner.tunnels.push(TunnelSlot {
            channel_id,
            tunnel,
            channel: None,
        });
    }

    fn set_close_hook(&self, hook: CloseHook) {
        self.inner.lock().on_close = Some(hook);
    }

    /// Post `result` to `callback` on the signaling thread
    fn complete<T: Send + 'static>(
        &self,
        callback: Option<Box<dyn FnOnce(T) + Send + 'static>>,
        result: T,
    ) {
        if let Some(callback) = callback {
            self.executor.post(move || callback(result));
        }
    }

    /// Wrap a handler so that a result arriving on any thread is handled on
    /// the signaling thread while the session is alive
    fn callback_on_thread<T: Send + 'static>(
        self: &Arc<Self>,
        handler: fn(&Arc<SessionCore>, T),
    ) -> Box<dyn FnOnce(T) + Send + 'static> {
        let weak = Arc::downgrade(self);
        let executor = self.executor.clone();
        Box::new(move |result| {
            executor.post(move || {
                if let Some(core) = weak.upgrade() {
                    handler(&core, result);
                }
            });
        })
    }

    /// Create the peer connection and its channels, binding tunnels
    fn connect(self: &Arc<Self>, inner: &mut SessionInner, rtc_config: &RtcConfiguration) {
        let observer = Arc::new(PeerEvents {
            core: Arc::downgrade(self),
        });
        let mut pc = self.factory.create_peer_connection(rtc_config, observer);

        let control = pc.create_data_channel(CONTROL_CHANNEL_ID);
        control.register_observer(Arc::new(ControlEvents {
            core: Arc::downgrade(self),
        }));

        for slot in &mut inner.tunnels {
            let channel = pc.create_data_channel(slot.channel_id);
            slot.tunnel.bind(channel.clone());
            slot.channel = Some(channel);
        }

        inner.control = Some(control);
        inner.pc = Some(pc);
    }

    fn arm_auto_close(self: &Arc<Self>, inner: &mut SessionInner) {
        if inner.control_opened || inner.auto_close.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        inner.auto_close = Some(self.executor.post_delayed(
            self.config.auto_close_timeout,
            move || {
                if let Some(core) = weak.upgrade() {
                    core.on_auto_close();
                }
            },
        ));
    }

    fn on_auto_close(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.phase == SessionState::Stopped || inner.control_opened {
                return;
            }
            inner.auto_close = None;
        }
        log::info!(
            "Session {}: control channel not opened within {:?}, closing",
            self.session_id,
            self.config.auto_close_timeout
        );
        self.close_self();
    }

    // ========================================================================
    // Peer connection events
    // ========================================================================

    fn on_local_description(self: &Arc<Self>, sdp_type: SdpType, sdp: String) {
        let inner = self.inner.lock();
        if inner.phase != SessionState::AwaitingLocalCreate {
            log::debug!(
                "Session {}: ignoring local {} in {:?}",
                self.session_id,
                sdp_type,
                inner.phase
            );
            return;
        }
        if matches!(inner.role, Role::Server(_)) {
            self.answer_created(inner, sdp);
        } else {
            self.offer_created(inner, sdp);
        }
    }

    fn on_remote_description_set(self: &Arc<Self>) {
        let inner = self.inner.lock();
        if inner.phase != SessionState::AwaitingRemoteSet {
            log::debug!(
                "Session {}: ignoring remote description in {:?}",
                self.session_id,
                inner.phase
            );
            return;
        }
        if matches!(inner.role, Role::Server(_)) {
            self.offer_applied(inner);
        } else {
            self.answer_applied(inner);
        }
    }

    fn on_failure(self: &Arc<Self>, reason: String) {
        let (negotiation_cb, ice_cb) = {
            let mut inner = self.inner.lock();
            if inner.phase == SessionState::Stopped {
                return;
            }
            (inner.negotiation_cb.take(), inner.ice_cb.take())
        };
        log::warn!("Session {}: peer connection failed: {}", self.session_id, reason);

        let error = crate::error::SessionError::Negotiation(reason);
        self.complete(negotiation_cb, Err(error.clone()));
        self.complete(ice_cb, Err(error));
        self.close_self();
    }

    fn on_ice_candidate(self: &Arc<Self>, candidate: String) {
        let mut inner = self.inner.lock();
        if inner.phase == SessionState::Stopped {
            return;
        }
        log::trace!("Session {}: local candidate {}", self.session_id, candidate);
        inner.local_candidates.push(candidate);
        if matches!(inner.role, Role::Server(_)) {
            self.notify_ice_exchange(&mut inner);
        } else {
            self.schedule_ice_round(&mut inner);
        }
    }

    fn on_ice_connection_change(&self, connected: bool) {
        let mut inner = self.inner.lock();
        if inner.phase == SessionState::Stopped {
            return;
        }
        if inner.ice_connected != connected {
            log::info!(
                "Session {}: ICE {}",
                self.session_id,
                if connected { "connected" } else { "disconnected" }
            );
        }
        inner.ice_connected = connected;
    }

    // ========================================================================
    // Control channel events
    // ========================================================================

    fn on_control_state(self: &Arc<Self>, state: ChannelState) {
        match state {
            ChannelState::Open => {
                let mut inner = self.inner.lock();
                if inner.phase == SessionState::Stopped {
                    return;
                }
                inner.control_opened = true;
                inner.phase = SessionState::Established;
                if let Some(timer) = inner.auto_close.take() {
                    timer.cancel();
                }
                log::info!("Session {}: established", self.session_id);
                if matches!(inner.role, Role::Server(_)) {
                    self.notify_ice_exchange(&mut inner);
                }
            }
            ChannelState::Closed => {
                let was_open = {
                    let inner = self.inner.lock();
                    inner.phase != SessionState::Stopped && inner.control_opened
                };
                if was_open {
                    log::info!("Session {}: control channel closed", self.session_id);
                    self.close_self();
                }
            }
        }
    }

    fn on_control_message(self: &Arc<Self>, data: Vec<u8>) {
        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Session {}: non-UTF-8 control message: {}", self.session_id, e);
                return;
            }
        };
        let is_server = {
            let inner = self.inner.lock();
            if inner.phase == SessionState::Stopped {
                return;
            }
            matches!(inner.role, Role::Server(_))
        };
        if is_server {
            self.on_client_message(&text);
        } else {
            self.on_server_message(&text);
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear the session down: fail pending callbacks, dispose tunnels and
    /// the control channel, then the peer connection.
    fn stop(&self) {
        debug_assert!(self.checker.check(), "stop off the signaling thread");

        let (negotiation_cb, ice_cb) = {
            let mut inner = self.inner.lock();
            if inner.phase == SessionState::Stopped {
                log::debug!("Session {}: already stopped", self.session_id);
                return;
            }
            inner.phase = SessionState::Stopped;

            if let Some(timer) = inner.auto_close.take() {
                timer.cancel();
            }
            if let Some(timer) = inner.ice_timer.take() {
                timer.cancel();
            }

            for slot in inner.tunnels.drain(..) {
                slot.tunnel.dispose();
                if let Some(channel) = slot.channel {
                    channel.dispose();
                }
            }
            if let Some(control) = inner.control.take() {
                control.unregister_observer();
                control.dispose();
            }
            if let Some(mut pc) = inner.pc.take() {
                pc.dispose();
            }

            (inner.negotiation_cb.take(), inner.ice_cb.take())
        };

        let error = crate::error::SessionError::Stopped;
        self.complete(negotiation_cb, Err(error.clone()));
        self.complete(ice_cb, Err(error));
        log::info!("Session {}: stopped", self.session_id);
    }

    /// Stop on the session's own initiative and tell the owner, once
    fn close_self(&self) {
        if self.state() == SessionState::Stopped {
            return;
        }
        self.stop();
        let hook = self.inner.lock().on_close.take();
        if let Some(hook) = hook {
            self.executor.post(hook);
        }
    }
}

// ============================================================================
// Event Observers
// ============================================================================

fn post_to(core: &Weak<SessionCore>, task: impl FnOnce(&Arc<SessionCore>) + Send + 'static) {
    if let Some(strong) = core.upgrade() {
        let weak = core.clone();
        strong.executor.post(move || {
            if let Some(core) = weak.upgrade() {
                task(&core);
            }
        });
    }
}

struct PeerEvents {
    core: Weak<SessionCore>,
}

impl PeerConnectionObserver for PeerEvents {
    fn on_local_description_created_and_set(&self, sdp_type: SdpType, sdp: String) {
        post_to(&self.core, move |core| core.on_local_description(sdp_type, sdp));
    }

    fn on_remote_description_set(&self) {
        post_to(&self.core, |core| core.on_remote_description_set());
    }

    fn on_failure(&self, reason: String) {
        post_to(&self.core, move |core| core.on_failure(reason));
    }

    fn on_ice_candidate(&self, candidate: String) {
        post_to(&self.core, move |core| core.on_ice_candidate(candidate));
    }

    fn on_ice_connection_change(&self, connected: bool) {
        post_to(&self.core, move |core| core.on_ice_connection_change(connected));
    }
}

struct ControlEvents {
    core: Weak<SessionCore>,
}

impl DataChannelObserver for ControlEvents {
    fn on_state_change(&self, state: ChannelState) {
        post_to(&self.core, move |core| core.on_control_state(state));
    }

    fn on_message(&self, data: &[u8]) {
        let data = data.to_vec();
        post_to(&self.core, move |core| core.on_control_message(data));
    }
}

// ============================================================================
// Test Support
// ============================================================================
