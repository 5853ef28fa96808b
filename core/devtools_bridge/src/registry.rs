//! Server-side session registry
//!
//! [`BridgeServer`] owns a signaling thread and every [`ServerSession`]
//! started through it. Public methods may be called from any thread.
//! Duplicate and unknown session ids are decided at the call; everything
//! else runs on the signaling thread. Callbacks always run there too.
//!
//! ```text
//!  start_session(id) ─► duplicate? ──yes──► "Session already exists"
//!                           │no
//!                           ▼
//!                   resolve socket name (async, id reserved meanwhile)
//!                           ▼
//!            ServerSession + SocketTunnelServer(socket name)
//!                           ▼
//!               register, notify host, negotiate
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::error::{IceExchangeCallback, NegotiationCallback, SessionError};
use crate::executor::{SignalingHandle, SignalingThread, ThreadChecker};
use crate::metrics::Metrics;
use crate::peer::{PeerConnectionFactory, RtcConfiguration, DEFAULT_TUNNEL_CHANNEL_ID};
use crate::session::{ServerSession, SessionEndpoint};
use crate::tunnel::{SocketTunnelServer, TunnelObserver};

// ============================================================================
// Host Contracts
// ============================================================================

/// Told whenever the number of registered sessions changes
pub trait ServerHost: Send + Sync {
    fn on_session_count_changed(&self, count: usize);
}

/// Completion of a socket name lookup: the name, or a failure reason
pub type ResolveCallback = Box<dyn FnOnce(Result<String, String>) + Send + 'static>;

/// Finds the local socket a new session should tunnel to
pub trait SocketNameResolver: Send + Sync {
    fn resolve(&self, session_id: &str, callback: ResolveCallback);
}

/// Resolves every session to the same socket
#[derive(Debug, Clone)]
pub struct FixedSocketName(pub String);

impl SocketNameResolver for FixedSocketName {
    fn resolve(&self, _session_id: &str, callback: ResolveCallback) {
        callback(Ok(self.0.clone()));
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A start request waiting for its socket name
struct PendingStart {
    config: RtcConfiguration,
    offer: String,
    callback: NegotiationCallback,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<ServerSession>>,
    /// Ids whose socket name is still being resolved
    resolving: HashMap<String, PendingStart>,
}

struct RegistryInner {
    this: Weak<RegistryInner>,
    executor: SignalingHandle,
    checker: ThreadChecker,
    factory: Arc<dyn PeerConnectionFactory>,
    resolver: Arc<dyn SocketNameResolver>,
    host: Arc<dyn ServerHost>,
    config: SessionConfig,
    metrics: Arc<Metrics>,
    state: Mutex<RegistryState>,
}

/// Registry of server sessions, one signaling thread for all of them
pub struct BridgeServer {
    inner: Arc<RegistryInner>,
    thread: Option<SignalingThread>,
}

impl BridgeServer {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        resolver: Arc<dyn SocketNameResolver>,
        host: Arc<dyn ServerHost>,
        config: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> io::Result<Self> {
        let thread = SignalingThread::spawn("bridge-signaling")?;
        let executor = thread.handle();
        let inner = Arc::new_cyclic(|this| RegistryInner {
            this: this.clone(),
            executor,
            checker: ThreadChecker::new(),
            factory,
            resolver,
            host,
            config,
            metrics,
            state: Mutex::new(RegistryState::default()),
        });
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    /// The registry's signaling thread
    pub fn executor(&self) -> SignalingHandle {
        self.inner.executor.clone()
    }

    /// In-process endpoint for clients sharing this process
    pub fn endpoint(&self) -> Arc<dyn SessionEndpoint> {
        self.inner.clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn start_session(
        &self,
        session_id: &str,
        config: RtcConfiguration,
        offer: String,
        callback: NegotiationCallback,
    ) {
        SessionEndpoint::start_session(&*self.inner, session_id, config, offer, callback);
    }

    pub fn renegotiate(&self, session_id: &str, offer: String, callback: NegotiationCallback) {
        SessionEndpoint::renegotiate(&*self.inner, session_id, offer, callback);
    }

    pub fn ice_exchange(
        &self,
        session_id: &str,
        candidates: Vec<String>,
        callback: IceExchangeCallback,
    ) {
        SessionEndpoint::ice_exchange(&*self.inner, session_id, candidates, callback);
    }

    /// Stop every session and clear the table
    pub fn close_all_sessions(&self) {
        let inner = self.inner.clone();
        self.inner.executor.post(move || inner.close_all_sessions());
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.close_all_sessions();
        if let Some(thread) = self.thread.take() {
            thread.shutdown();
        }
    }
}

impl SessionEndpoint for RegistryInner {
    fn start_session(
        &self,
        session_id: &str,
        config: RtcConfiguration,
        offer: String,
        callback: NegotiationCallback,
    ) {
        let pending = PendingStart {
            config,
            offer,
            callback,
        };
        if let Err(pending) = self.reserve(session_id, pending) {
            self.reject(pending.callback, SessionError::SessionExists);
            return;
        }
        let session_id = session_id.to_string();
        self.post(move |inner| inner.resolve_session(session_id));
    }

    fn renegotiate(&self, session_id: &str, offer: String, callback: NegotiationCallback) {
        let Some(session) = self.lookup(session_id) else {
            self.reject(callback, SessionError::SessionNotFound);
            return;
        };
        self.post(move |_| session.renegotiate(&offer, callback));
    }

    fn ice_exchange(&self, session_id: &str, candidates: Vec<String>, callback: IceExchangeCallback) {
        let Some(session) = self.lookup(session_id) else {
            self.reject(callback, SessionError::SessionNotFound);
            return;
        };
        self.post(move |_| session.ice_exchange(candidates, callback));
    }
}

impl RegistryInner {
    fn post(&self, task: impl FnOnce(&Arc<RegistryInner>) + Send + 'static) {
        let this = self.this.clone();
        self.executor.post(move || {
            if let Some(inner) = this.upgrade() {
                task(&inner);
            }
        });
    }

    /// Fail a request; the callback still runs later, not inline
    fn reject<T: Send + 'static>(
        &self,
        callback: Box<dyn FnOnce(Result<T, SessionError>) + Send + 'static>,
        error: SessionError,
    ) {
        log::warn!("Request rejected: {}", error);
        self.executor.post(move || callback(Err(error)));
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<ServerSession>> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    /// Claim `session_id` until its socket name resolves. Hands the request
    /// back if the id is registered or already claimed.
    fn reserve(&self, session_id: &str, pending: PendingStart) -> Result<(), PendingStart> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(session_id) || state.resolving.contains_key(session_id) {
            return Err(pending);
        }
        state.resolving.insert(session_id.to_string(), pending);
        Ok(())
    }

    fn resolve_session(self: &Arc<Self>, session_id: String) {
        debug_assert!(self.checker.check(), "registry used off the signaling thread");
        let this = self.this.clone();
        let executor = self.executor.clone();
        let id = session_id.clone();
        self.resolver.resolve(
            &session_id,
            Box::new(move |resolved| {
                executor.post(move || {
                    if let Some(inner) = this.upgrade() {
                        inner.on_resolved(id, resolved);
                    }
                });
            }),
        );
    }

    fn on_resolved(self: &Arc<Self>, session_id: String, resolved: Result<String, String>) {
        // Absent once close_all_sessions has failed the request.
        let Some(PendingStart {
            config,
            offer,
            callback,
        }) = self.state.lock().resolving.remove(&session_id)
        else {
            return;
        };

        let socket_name = match resolved {
            Ok(socket_name) => socket_name,
            Err(reason) => {
                self.reject(callback, SessionError::SocketResolution(reason));
                return;
            }
        };

        let observer: Arc<dyn TunnelObserver> = self.metrics.clone();
        let tunnel = match SocketTunnelServer::new(socket_name.clone(), self.executor.clone(), observer)
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                log::error!("Session {}: tunnel setup failed: {}", session_id, e);
                self.reject(callback, SessionError::SocketResolution(e.to_string()));
                return;
            }
        };

        let session = Arc::new(ServerSession::new(
            session_id.clone(),
            self.factory.clone(),
            self.executor.clone(),
            self.config,
        ));
        session.add_tunnel(DEFAULT_TUNNEL_CHANNEL_ID, Arc::new(tunnel));

        let this = self.this.clone();
        let closed_id = session_id.clone();
        let closed_session = Arc::downgrade(&session);
        session.set_close_hook(move || {
            if let Some(inner) = this.upgrade() {
                inner.on_session_closed(&closed_id, &closed_session);
            }
        });

        let count = {
            let mut state = self.state.lock();
            state.sessions.insert(session_id.clone(), session.clone());
            state.sessions.len()
        };
        self.metrics
            .sessions_started_total
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .active_sessions
            .store(count as u64, Ordering::Relaxed);
        log::info!("Session {}: registered, tunneling to '{}'", session_id, socket_name);
        self.host.on_session_count_changed(count);

        session.start_session(&config, &offer, callback);
    }

    fn on_session_closed(&self, session_id: &str, session: &Weak<ServerSession>) {
        let count = {
            let mut state = self.state.lock();
            let current = state
                .sessions
                .get(session_id)
                .map(|registered| Weak::ptr_eq(&Arc::downgrade(registered), session))
                .unwrap_or(false);
            if !current {
                return;
            }
            state.sessions.remove(session_id);
            state.sessions.len()
        };
        self.metrics
            .sessions_closed_total
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .active_sessions
            .store(count as u64, Ordering::Relaxed);
        log::info!("Session {}: closed itself, {} remaining", session_id, count);
        self.host.on_session_count_changed(count);
    }

    fn close_all_sessions(&self) {
        let (sessions, pending): (Vec<Arc<ServerSession>>, Vec<PendingStart>) = {
            let mut state = self.state.lock();
            (
                state.sessions.drain().map(|(_, session)| session).collect(),
                state.resolving.drain().map(|(_, pending)| pending).collect(),
            )
        };
        for request in pending {
            self.reject(request.callback, SessionError::Stopped);
        }
        for session in &sessions {
            session.stop();
        }
        self.metrics
            .sessions_closed_total
            .fetch_add(sessions.len() as u64, Ordering::Relaxed);
        self.metrics.active_sessions.store(0, Ordering::Relaxed);
        log::info!("Closed {} sessions", sessions.len());
        self.host.on_session_count_changed(0);
    }
}

// ============================================================================
// Tests
// ============================================================================
