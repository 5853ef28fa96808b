//! Answering end of a session

use std::mem;
use std::sync::Arc;

use parking_lot::MutexGuard;

use super::{CloseHook, Role, SessionCore, SessionInner, SessionState};
use crate::config::SessionConfig;
use crate::control::{ClientMessage, ServerMessage};
use crate::error::{IceExchangeCallback, NegotiationCallback, SessionError};
use crate::executor::SignalingHandle;
use crate::peer::{PeerConnectionFactory, RtcConfiguration, SdpType};
use crate::tunnel::SocketTunnel;

/// Server half of the session state
pub(super) struct ServerRole {
    /// An `ICE_EXCHANGE` went out and the client has not pulled yet
    ice_notified: bool,
}

/// A session answering a remote client's offer.
///
/// Every method must be called on the signaling thread given at
/// construction. Requests from any other thread fail with
/// [`SessionError::WrongThread`].
pub struct ServerSession {
    core: Arc<SessionCore>,
}

impl ServerSession {
    pub fn new(
        session_id: impl Into<String>,
        factory: Arc<dyn PeerConnectionFactory>,
        executor: SignalingHandle,
        config: SessionConfig,
    ) -> Self {
        let role = Role::Server(ServerRole {
            ice_notified: false,
        });
        Self {
            core: SessionCore::new(session_id.into(), role, factory, executor, config),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.core.session_id
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Attach a tunnel on its own data channel. Only before `start_session`.
    pub fn add_tunnel(&self, channel_id: u16, tunnel: Arc<dyn SocketTunnel>) {
        self.core.add_tunnel(channel_id, tunnel);
    }

    /// Hook run when the session closes on its own (failure, auto-close,
    /// control channel closed). Not run for [`ServerSession::stop`].
    pub fn set_close_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let hook: CloseHook = Box::new(hook);
        self.core.set_close_hook(hook);
    }

    /// Apply the client's offer and answer it
    pub fn start_session(
        &self,
        rtc_config: &RtcConfiguration,
        offer: &str,
        callback: NegotiationCallback,
    ) {
        let core = &self.core;
        if !core.checker.check() {
            core.complete(Some(callback), Err(SessionError::WrongThread));
            return;
        }

        let mut inner = core.inner.lock();
        let error = if inner.has_pending_request() {
            Some(SessionError::ConcurrentRequests)
        } else if inner.phase != SessionState::NotStarted {
            Some(SessionError::AlreadyStarted)
        } else {
            None
        };
        if let Some(error) = error {
            drop(inner);
            log::warn!("Session {}: start rejected: {}", core.session_id, error);
            core.complete(Some(callback), Err(error));
            return;
        }

        log::info!("Session {}: starting", core.session_id);
        core.connect(&mut inner, rtc_config);
        inner.negotiation_cb = Some(callback);
        inner.phase = SessionState::AwaitingRemoteSet;
        if let Some(pc) = inner.pc.as_mut() {
            pc.set_remote_description(SdpType::Offer, offer);
        }
    }

    /// Renegotiation is not supported; always fails once validated
    pub fn renegotiate(&self, _offer: &str, callback: NegotiationCallback) {
        let core = &self.core;
        let error = if !core.checker.check() {
            SessionError::WrongThread
        } else {
            let inner = core.inner.lock();
            if inner.has_pending_request() {
                SessionError::ConcurrentRequests
            } else if inner.phase == SessionState::NotStarted {
                SessionError::NotStarted
            } else if inner.phase == SessionState::Stopped {
                SessionError::Stopped
            } else {
                SessionError::NotImplemented
            }
        };
        log::debug!("Session {}: renegotiate: {}", core.session_id, error);
        core.complete(Some(callback), Err(error));
    }

    /// Apply the client's candidates and answer with ours after the
    /// gathering delay
    pub fn ice_exchange(&self, candidates: Vec<String>, callback: IceExchangeCallback) {
        let core = &self.core;
        if !core.checker.check() {
            core.complete(Some(callback), Err(SessionError::WrongThread));
            return;
        }

        let mut inner = core.inner.lock();
        let error = if inner.has_pending_request() {
            Some(SessionError::ConcurrentRequests)
        } else if inner.phase == SessionState::NotStarted {
            Some(SessionError::NotStarted)
        } else if inner.phase == SessionState::Stopped {
            Some(SessionError::Stopped)
        } else {
            None
        };
        if let Some(error) = error {
            drop(inner);
            log::debug!("Session {}: ICE exchange rejected: {}", core.session_id, error);
            core.complete(Some(callback), Err(error));
            return;
        }

        if let Some(pc) = inner.pc.as_mut() {
            for candidate in &candidates {
                if let Err(e) = pc.add_ice_candidate(candidate) {
                    log::warn!("Session {}: {}", core.session_id, e);
                }
            }
        }
        inner.ice_cb = Some(callback);

        let weak = Arc::downgrade(core);
        inner.ice_timer = Some(core.executor.post_delayed(
            core.config.ice_gathering_delay,
            move || {
                if let Some(core) = weak.upgrade() {
                    core.finish_ice_exchange();
                }
            },
        ));
    }

    /// Tear the session down. A second call is a no-op.
    pub fn stop(&self) {
        self.core.stop();
    }
}

impl SessionCore {
    /// Remote offer accepted: create the answer
    pub(super) fn offer_applied(&self, mut inner: MutexGuard<'_, SessionInner>) {
        inner.phase = SessionState::AwaitingLocalCreate;
        if let Some(pc) = inner.pc.as_mut() {
            pc.create_and_set_local_description(SdpType::Answer);
        }
    }

    pub(super) fn answer_created(
        self: &Arc<Self>,
        mut inner: MutexGuard<'_, SessionInner>,
        sdp: String,
    ) {
        inner.phase = SessionState::Negotiated;
        self.arm_auto_close(&mut inner);
        let callback = inner.negotiation_cb.take();
        drop(inner);

        log::info!("Session {}: negotiated", self.session_id);
        self.complete(callback, Ok(sdp));
    }

    fn finish_ice_exchange(&self) {
        let (callback, candidates) = {
            let mut inner = self.inner.lock();
            if inner.phase == SessionState::Stopped {
                return;
            }
            inner.ice_timer = None;
            if let Role::Server(role) = &mut inner.role {
                role.ice_notified = false;
            }
            (inner.ice_cb.take(), mem::take(&mut inner.local_candidates))
        };
        log::debug!(
            "Session {}: returning {} candidates",
            self.session_id,
            candidates.len()
        );
        self.complete(callback, Ok(candidates));
    }

    /// Ask the client to pull once new candidates wait on an open control
    /// channel
    pub(super) fn notify_ice_exchange(&self, inner: &mut SessionInner) {
        if !inner.control_opened || inner.ice_cb.is_some() || inner.local_candidates.is_empty() {
            return;
        }
        let notified = match &mut inner.role {
            Role::Server(role) => &mut role.ice_notified,
            Role::Client(_) => return,
        };
        if *notified {
            return;
        }
        *notified = true;

        log::debug!("Session {}: notifying client of new candidates", self.session_id);
        inner.send_control(&ServerMessage::IceExchange.encode());
    }

    pub(super) fn on_client_message(&self, text: &str) {
        match ClientMessage::decode(text) {
            Ok(message) => {
                log::debug!("Session {}: control request {:?}", self.session_id, message);
                self.inner
                    .lock()
                    .send_control(&message.response().encode());
            }
            Err(e) => log::warn!("Session {}: {}", self.session_id, e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
