//! Offering end of a session
//!
//! The client creates the offer, hands it to a [`SessionEndpoint`] and
//! applies the answer. ICE candidates then move in pull rounds:
//!
//! ```text
//!  negotiated ─────────────────────► round
//!  ICE_EXCHANGE from server ───────► round (or follow-up if one is in flight)
//!  local candidate, ICE not up ────► round after the gathering delay
//!  round = ice_exchange(our buffered candidates) → apply theirs
//! ```

use std::mem;
use std::sync::Arc;

use parking_lot::MutexGuard;

use super::{CloseHook, Role, SessionCore, SessionEndpoint, SessionInner, SessionState};
use crate::config::SessionConfig;
use crate::control::ServerMessage;
use crate::error::{IceExchangeResult, NegotiationResult, SessionError};
use crate::executor::SignalingHandle;
use crate::peer::{PeerConnectionFactory, RtcConfiguration, SdpType};
use crate::tunnel::SocketTunnel;

/// Client half of the session state
pub(super) struct ClientRole {
    endpoint: Arc<dyn SessionEndpoint>,
    rtc_config: RtcConfiguration,
    exchange_in_flight: bool,
    /// A round was requested while another was in flight
    follow_up: bool,
}

/// A session that offers to a remote bridge server
pub struct ClientSession {
    core: Arc<SessionCore>,
}

impl ClientSession {
    pub fn new(
        session_id: impl Into<String>,
        factory: Arc<dyn PeerConnectionFactory>,
        executor: SignalingHandle,
        config: SessionConfig,
        endpoint: Arc<dyn SessionEndpoint>,
    ) -> Self {
        let role = Role::Client(ClientRole {
            endpoint,
            rtc_config: RtcConfiguration::default(),
            exchange_in_flight: false,
            follow_up: false,
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

    pub fn add_tunnel(&self, channel_id: u16, tunnel: Arc<dyn SocketTunnel>) {
        self.core.add_tunnel(channel_id, tunnel);
    }

    pub fn set_close_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let hook: CloseHook = Box::new(hook);
        self.core.set_close_hook(hook);
    }

    /// Create the peer connection and begin negotiating. Must run on the
    /// signaling thread.
    pub fn start(&self, rtc_config: &RtcConfiguration) -> Result<(), SessionError> {
        let core = &self.core;
        if !core.checker.check() {
            return Err(SessionError::WrongThread);
        }

        let mut inner = core.inner.lock();
        if inner.phase != SessionState::NotStarted {
            return Err(SessionError::AlreadyStarted);
        }
        if let Role::Client(role) = &mut inner.role {
            role.rtc_config = rtc_config.clone();
        }

        log::info!("Session {}: offering", core.session_id);
        core.connect(&mut inner, rtc_config);
        inner.phase = SessionState::AwaitingLocalCreate;
        if let Some(pc) = inner.pc.as_mut() {
            pc.create_and_set_local_description(SdpType::Offer);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.core.stop();
    }
}

impl SessionCore {
    pub(super) fn offer_created(self: &Arc<Self>, mut inner: MutexGuard<'_, SessionInner>, sdp: String) {
        inner.phase = SessionState::AwaitingAnswer;
        let Role::Client(role) = &inner.role else {
            return;
        };
        let endpoint = role.endpoint.clone();
        let rtc_config = role.rtc_config.clone();
        drop(inner);

        endpoint.start_session(
            &self.session_id,
            rtc_config,
            sdp,
            self.callback_on_thread(SessionCore::on_answer),
        );
    }

    fn on_answer(self: &Arc<Self>, result: NegotiationResult) {
        match result {
            Ok(sdp) => {
                let mut inner = self.inner.lock();
                if inner.phase != SessionState::AwaitingAnswer {
                    return;
                }
                inner.phase = SessionState::AwaitingRemoteSet;
                if let Some(pc) = inner.pc.as_mut() {
                    pc.set_remote_description(SdpType::Answer, &sdp);
                }
            }
            Err(e) => {
                if self.state() == SessionState::Stopped {
                    return;
                }
                log::warn!("Session {}: server refused offer: {}", self.session_id, e);
                self.close_self();
            }
        }
    }

    pub(super) fn answer_applied(self: &Arc<Self>, mut inner: MutexGuard<'_, SessionInner>) {
        inner.phase = SessionState::Negotiated;
        self.arm_auto_close(&mut inner);
        drop(inner);

        log::info!("Session {}: negotiated", self.session_id);
        self.run_ice_round();
    }

    /// Send our buffered candidates and apply the server's
    fn run_ice_round(self: &Arc<Self>) {
        let (endpoint, candidates) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if !inner.phase.is_negotiated() {
                return;
            }
            if let Some(timer) = inner.ice_timer.take() {
                timer.cancel();
            }
            let Role::Client(role) = &mut inner.role else {
                return;
            };
            if role.exchange_in_flight {
                role.follow_up = true;
                return;
            }
            role.exchange_in_flight = true;
            (role.endpoint.clone(), mem::take(&mut inner.local_candidates))
        };

        log::debug!(
            "Session {}: ICE round with {} candidates",
            self.session_id,
            candidates.len()
        );
        endpoint.ice_exchange(
            &self.session_id,
            candidates,
            self.callback_on_thread(SessionCore::on_ice_response),
        );
    }

    fn on_ice_response(self: &Arc<Self>, result: IceExchangeResult) {
        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                if self.state() == SessionState::Stopped {
                    return;
                }
                log::warn!("Session {}: ICE exchange failed: {}", self.session_id, e);
                self.close_self();
                return;
            }
        };

        let follow_up = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.phase == SessionState::Stopped {
                return;
            }
            if let Some(pc) = inner.pc.as_mut() {
                for candidate in &remote {
                    if let Err(e) = pc.add_ice_candidate(candidate) {
                        log::warn!("Session {}: {}", self.session_id, e);
                    }
                }
            }
            let follow_up = match &mut inner.role {
                Role::Client(role) => {
                    role.exchange_in_flight = false;
                    mem::take(&mut role.follow_up)
                }
                Role::Server(_) => false,
            };
            if !follow_up {
                self.schedule_ice_round(inner);
            }
            follow_up
        };

        if follow_up {
            self.run_ice_round();
        }
    }

    /// Pull again after the gathering delay while ICE is still connecting
    pub(super) fn schedule_ice_round(self: &Arc<Self>, inner: &mut SessionInner) {
        if inner.ice_connected
            || inner.ice_timer.is_some()
            || inner.local_candidates.is_empty()
            || !inner.phase.is_negotiated()
        {
            return;
        }
        let weak = Arc::downgrade(self);
        inner.ice_timer = Some(self.executor.post_delayed(
            self.config.ice_gathering_delay,
            move || {
                if let Some(core) = weak.upgrade() {
                    core.inner.lock().ice_timer = None;
                    core.run_ice_round();
                }
            },
        ));
    }

    pub(super) fn on_server_message(self: &Arc<Self>, text: &str) {
        match ServerMessage::decode(text) {
            Ok(ServerMessage::IceExchange) => {
                log::debug!("Session {}: server has new candidates", self.session_id);
                self.run_ice_round();
            }
            Ok(ServerMessage::UnknownResponse { raw_type }) => {
                log::debug!("Session {}: server did not understand {}", self.session_id, raw_type);
            }
            Err(e) => log::warn!("Session {}: {}", self.session_id, e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IceExchangeCallback, NegotiationCallback};
    use crate::executor::SignalingThread;
    use crate::peer::{ChannelState, CONTROL_CHANNEL_ID};
    use crate::session::test_support::FakeFactory;
    use crate::tunnel::test_support::{flush, on_thread};
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    enum Request {
        Start {
            offer: String,
            callback: NegotiationCallback,
        },
        Ice {
            candidates: Vec<String>,
            callback: IceExchangeCallback,
        },
    }

    /// Endpoint that hands every request to the test
    struct QueueEndpoint {
        tx: Sender<Request>,
    }

    impl SessionEndpoint for QueueEndpoint {
        fn start_session(
            &self,
            _session_id: &str,
            _config: RtcConfiguration,
            offer: String,
            callback: NegotiationCallback,
        ) {
            let _ = self.tx.send(Request::Start { offer, callback });
        }

        fn renegotiate(&self, _session_id: &str, _offer: String, callback: NegotiationCallback) {
            callback(Err(SessionError::NotImplemented));
        }

        fn ice_exchange(
            &self,
            _session_id: &str,
            candidates: Vec<String>,
            callback: IceExchangeCallback,
        ) {
            let _ = self.tx.send(Request::Ice {
                candidates,
                callback,
            });
        }
    }

    struct Fixture {
        thread: SignalingThread,
        factory: Arc<FakeFactory>,
        session: Arc<ClientSession>,
        requests: Receiver<Request>,
        closes: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let thread = SignalingThread::spawn("client-session-test").unwrap();
        let factory = Arc::new(FakeFactory::default());
        let (tx, requests) = unbounded();
        let config = SessionConfig::default()
            .with_auto_close_timeout(Duration::from_secs(30))
            .with_ice_gathering_delay(Duration::from_millis(50));
        let session = Arc::new(ClientSession::new(
            "c1",
            factory.clone(),
            thread.handle(),
            config,
            Arc::new(QueueEndpoint { tx }),
        ));
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        session.set_close_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        Fixture {
            thread,
            factory,
            session,
            requests,
            closes,
        }
    }

    fn start(f: &Fixture) -> Result<(), SessionError> {
        let session = f.session.clone();
        on_thread(&f.thread.handle(), move || {
            session.start(&RtcConfiguration::builder().ice_server("stun:example.org").build())
        })
    }

    fn next_ice(f: &Fixture) -> (Vec<String>, IceExchangeCallback) {
        match f.requests.recv_timeout(WAIT).unwrap() {
            Request::Ice {
                candidates,
                callback,
            } => (candidates, callback),
            Request::Start { .. } => panic!("expected an ICE exchange"),
        }
    }

    /// Drive the offer through a successful negotiation
    fn negotiate(f: &Fixture) {
        start(f).unwrap();
        let peer = f.factory.peer();
        peer.observer
            .on_local_description_created_and_set(SdpType::Offer, "v=0 offer".to_string());
        let callback = match f.requests.recv_timeout(WAIT).unwrap() {
            Request::Start { offer, callback } => {
                assert_eq!(offer, "v=0 offer");
                callback
            }
            Request::Ice { .. } => panic!("expected a start request"),
        };
        callback(Ok("v=0 answer".to_string()));
        flush(&f.thread.handle());
        peer.observer.on_remote_description_set();
        flush(&f.thread.handle());
    }

    #[test]
    fn test_offer_answer_then_first_ice_round() {
        let f = fixture();
        start(&f).unwrap();
        let peer = f.factory.peer();
        peer.observer.on_ice_candidate("0:0:candidate:local".to_string());
        flush(&f.thread.handle());

        peer.observer
            .on_local_description_created_and_set(SdpType::Offer, "v=0 offer".to_string());
        let Request::Start { callback, .. } = f.requests.recv_timeout(WAIT).unwrap() else {
            panic!("expected a start request");
        };
        callback(Ok("v=0 answer".to_string()));
        flush(&f.thread.handle());
        assert_eq!(f.session.state(), SessionState::AwaitingRemoteSet);
        peer.observer.on_remote_description_set();

        let (candidates, callback) = next_ice(&f);
        assert_eq!(candidates, vec!["0:0:candidate:local"]);
        callback(Ok(vec!["0:0:candidate:remote".to_string()]));
        flush(&f.thread.handle());

        assert_eq!(f.session.state(), SessionState::Negotiated);
        assert_eq!(
            peer.calls(),
            vec![
                "create_local:offer",
                "set_remote:answer:v=0 answer",
                "candidate:0:0:candidate:remote",
            ]
        );
    }

    #[test]
    fn test_start_twice_fails() {
        let f = fixture();
        start(&f).unwrap();
        assert_eq!(start(&f), Err(SessionError::AlreadyStarted));
    }

    #[test]
    fn test_ice_exchange_notification_triggers_round() {
        let f = fixture();
        negotiate(&f);
        let (_, first) = next_ice(&f);
        first(Ok(vec![]));

        let control = f.factory.peer().channel(CONTROL_CHANNEL_ID);
        control.set_state(ChannelState::Open);
        control.deliver(r#"{"type":"ICE_EXCHANGE"}"#);
        let (candidates, _) = next_ice(&f);
        assert!(candidates.is_empty());
        assert_eq!(f.session.state(), SessionState::Established);
    }

    #[test]
    fn test_notification_during_round_schedules_follow_up() {
        let f = fixture();
        negotiate(&f);
        let (_, first) = next_ice(&f);

        let control = f.factory.peer().channel(CONTROL_CHANNEL_ID);
        control.deliver(r#"{"type":"ICE_EXCHANGE"}"#);
        flush(&f.thread.handle());
        assert!(f.requests.is_empty());

        first(Ok(vec![]));
        let (candidates, _) = next_ice(&f);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_late_local_candidate_pulls_again() {
        let f = fixture();
        negotiate(&f);
        let (_, first) = next_ice(&f);
        first(Ok(vec![]));
        flush(&f.thread.handle());

        f.factory
            .peer()
            .observer
            .on_ice_candidate("0:0:candidate:late".to_string());
        let (candidates, _) = next_ice(&f);
        assert_eq!(candidates, vec!["0:0:candidate:late"]);
    }

    #[test]
    fn test_refused_offer_closes_session() {
        let f = fixture();
        start(&f).unwrap();
        f.factory
            .peer()
            .observer
            .on_local_description_created_and_set(SdpType::Offer, "v=0 offer".to_string());
        let Request::Start { callback, .. } = f.requests.recv_timeout(WAIT).unwrap() else {
            panic!("expected a start request");
        };
        callback(Err(SessionError::SessionExists));
        flush(&f.thread.handle());
        flush(&f.thread.handle());

        assert_eq!(f.session.state(), SessionState::Stopped);
        assert_eq!(f.closes.load(Ordering::SeqCst), 1);
        assert_eq!(f.factory.peer().calls().last().unwrap(), "dispose_peer");
    }

    #[test]
    fn test_failed_ice_round_closes_session() {
        let f = fixture();
        negotiate(&f);
        let (_, first) = next_ice(&f);
        first(Err(SessionError::SessionNotFound));
        flush(&f.thread.handle());
        flush(&f.thread.handle());

        assert_eq!(f.session.state(), SessionState::Stopped);
        assert_eq!(f.closes.load(Ordering::SeqCst), 1);
    }
}
