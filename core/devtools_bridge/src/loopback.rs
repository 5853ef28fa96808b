//! In-memory peer connections for tests and the loopback binary
//!
//! Peers created from one [`LoopbackNetwork`] find each other through the
//! offer: the offerer writes its key into an `o=loopback <key>` line and
//! the answerer looks it up. There is no transport; sends are delivered
//! straight to the peer channel's observer.
//!
//! ```text
//!  offerer                          answerer
//!  create offer   ─► candidate
//!                                   set remote offer (pairs by key)
//!                                   create answer ─► candidate
//!  set remote answer
//!  add remote candidate             add remote candidate
//!        └──────── both ready ────────┘ ─► ICE connected, channels open
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::peer::{
    ChannelState, DataChannel, DataChannelObserver, IceCandidate, InvalidCandidate, MessageType,
    PeerConnection, PeerConnectionFactory, PeerConnectionObserver, RtcConfiguration, SdpType,
};

const ORIGIN_PREFIX: &str = "o=loopback ";

type Event = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Network
// ============================================================================

struct PeerState {
    observer: Arc<dyn PeerConnectionObserver>,
    /// Key of the paired peer
    remote: Option<u64>,
    local: Option<SdpType>,
    remote_set: bool,
    remote_candidates: usize,
    connected: bool,
    channels: HashMap<u16, Arc<LoopbackChannel>>,
}

impl PeerState {
    fn ready(&self) -> bool {
        self.local.is_some() && self.remote_set && self.remote_candidates > 0
    }
}

#[derive(Default)]
struct NetworkState {
    next_key: u64,
    peers: HashMap<u64, PeerState>,
}

/// Factory of peer connections that can only reach each other
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (not disposed) peer connections
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }
}

impl PeerConnectionFactory for LoopbackNetwork {
    fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Box<dyn PeerConnection> {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = state.next_key;
        state.peers.insert(
            key,
            PeerState {
                observer,
                remote: None,
                local: None,
                remote_set: false,
                remote_candidates: 0,
                connected: false,
                channels: HashMap::new(),
            },
        );
        log::debug!(
            "Loopback peer {} created ({} ICE servers ignored)",
            key,
            config.ice_servers().len()
        );
        Box::new(LoopbackPeer {
            key,
            state: self.state.clone(),
        })
    }
}

fn run(events: Vec<Event>) {
    for event in events {
        event();
    }
}

fn parse_origin(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(ORIGIN_PREFIX))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|key| key.parse().ok())
}

/// Connect `key` and its remote once both are ready
fn try_connect(state: &mut NetworkState, key: u64, events: &mut Vec<Event>) {
    let Some(remote) = state.peers.get(&key).and_then(|peer| peer.remote) else {
        return;
    };
    let (Some(local_peer), Some(remote_peer)) = (state.peers.get(&key), state.peers.get(&remote))
    else {
        return;
    };
    if local_peer.connected || !local_peer.ready() || !remote_peer.ready() {
        return;
    }

    for (id, channel) in &local_peer.channels {
        if let Some(other) = remote_peer.channels.get(id) {
            pair_channels(channel, other, events);
        }
    }
    for peer_key in [key, remote] {
        if let Some(peer) = state.peers.get_mut(&peer_key) {
            peer.connected = true;
            let observer = peer.observer.clone();
            events.push(Box::new(move || observer.on_ice_connection_change(true)));
        }
    }
    log::debug!("Loopback peers {} and {} connected", key, remote);
}

fn pair_channels(a: &Arc<LoopbackChannel>, b: &Arc<LoopbackChannel>, events: &mut Vec<Event>) {
    a.link_to(b);
    b.link_to(a);
    for channel in [a.clone(), b.clone()] {
        events.push(Box::new(move || channel.notify(ChannelState::Open)));
    }
}

// ============================================================================
// Peer Connection
// ============================================================================

struct LoopbackPeer {
    key: u64,
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackPeer {
    fn observer(&self, state: &NetworkState) -> Option<Arc<dyn PeerConnectionObserver>> {
        state.peers.get(&self.key).map(|peer| peer.observer.clone())
    }

    fn fail(&self, state: &NetworkState, reason: String, events: &mut Vec<Event>) {
        if let Some(observer) = self.observer(state) {
            events.push(Box::new(move || observer.on_failure(reason)));
        }
    }
}

impl PeerConnection for LoopbackPeer {
    fn create_and_set_local_description(&mut self, sdp_type: SdpType) {
        let mut events: Vec<Event> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(peer) = state.peers.get_mut(&self.key) else {
                return;
            };
            let sdp = match sdp_type {
                SdpType::Offer => format!("v=0\r\n{}{}\r\n", ORIGIN_PREFIX, self.key),
                SdpType::Answer => match peer.remote {
                    Some(remote) if peer.remote_set => {
                        format!("v=0\r\n{}{} answer\r\n", ORIGIN_PREFIX, remote)
                    }
                    _ => {
                        let observer = peer.observer.clone();
                        events.push(Box::new(move || {
                            observer.on_failure("No remote offer to answer".to_string())
                        }));
                        drop(state);
                        run(events);
                        return;
                    }
                },
            };
            peer.local = Some(sdp_type);

            let observer = peer.observer.clone();
            let candidate = IceCandidate::new("0", 0, format!("candidate:loopback {}", self.key));
            events.push(Box::new(move || {
                observer.on_local_description_created_and_set(sdp_type, sdp);
                observer.on_ice_candidate(candidate.to_string());
            }));
            try_connect(&mut state, self.key, &mut events);
        }
        run(events);
    }

    fn set_remote_description(&mut self, sdp_type: SdpType, sdp: &str) {
        let mut events: Vec<Event> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(origin) = parse_origin(sdp) else {
                self.fail(&state, format!("Invalid {}: no origin", sdp_type), &mut events);
                drop(state);
                run(events);
                return;
            };

            let valid = match sdp_type {
                SdpType::Offer => state
                    .peers
                    .get(&origin)
                    .map(|offerer| offerer.local == Some(SdpType::Offer) && offerer.remote.is_none())
                    .unwrap_or(false),
                SdpType::Answer => {
                    origin == self.key
                        && state.peers.get(&self.key).and_then(|peer| peer.remote).is_some()
                }
            };
            if !valid || (origin == self.key && sdp_type == SdpType::Offer) {
                self.fail(&state, format!("Unknown {} origin {}", sdp_type, origin), &mut events);
                drop(state);
                run(events);
                return;
            }

            if sdp_type == SdpType::Offer {
                if let Some(offerer) = state.peers.get_mut(&origin) {
                    offerer.remote = Some(self.key);
                }
            }
            if let Some(peer) = state.peers.get_mut(&self.key) {
                if sdp_type == SdpType::Offer {
                    peer.remote = Some(origin);
                }
                peer.remote_set = true;
                let observer = peer.observer.clone();
                events.push(Box::new(move || observer.on_remote_description_set()));
            }
            try_connect(&mut state, self.key, &mut events);
        }
        run(events);
    }

    fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), InvalidCandidate> {
        candidate.parse::<IceCandidate>()?;
        let mut events: Vec<Event> = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(peer) = state.peers.get_mut(&self.key) {
                peer.remote_candidates += 1;
            }
            try_connect(&mut state, self.key, &mut events);
        }
        run(events);
        Ok(())
    }

    fn create_data_channel(&mut self, channel_id: u16) -> Arc<dyn DataChannel> {
        let channel = Arc::new(LoopbackChannel::new(channel_id));
        let mut events: Vec<Event> = Vec::new();
        {
            let mut state = self.state.lock();
            let remote = match state.peers.get_mut(&self.key) {
                Some(peer) => {
                    peer.channels.insert(channel_id, channel.clone());
                    peer.remote.filter(|_| peer.connected)
                }
                None => None,
            };
            let other = remote
                .and_then(|remote| state.peers.get(&remote))
                .and_then(|peer| peer.channels.get(&channel_id).cloned());
            if let Some(other) = other {
                pair_channels(&channel, &other, &mut events);
            }
        }
        run(events);
        channel
    }

    fn dispose(&mut self) {
        let (channels, remote_observer) = {
            let mut state = self.state.lock();
            let Some(peer) = state.peers.remove(&self.key) else {
                return;
            };
            let remote_observer = peer.remote.and_then(|remote| {
                let other = state.peers.get_mut(&remote)?;
                let was_connected = other.connected;
                other.connected = false;
                was_connected.then(|| other.observer.clone())
            });
            (peer.channels, remote_observer)
        };
        for channel in channels.into_values() {
            channel.close();
        }
        if let Some(observer) = remote_observer {
            observer.on_ice_connection_change(false);
        }
        log::debug!("Loopback peer {} disposed", self.key);
    }
}

// ============================================================================
// Data Channel
// ============================================================================

struct ChannelLink {
    peer: Weak<LoopbackChannel>,
    open: bool,
}

struct LoopbackChannel {
    id: u16,
    observer: Mutex<Option<Arc<dyn DataChannelObserver>>>,
    link: Mutex<ChannelLink>,
}

impl LoopbackChannel {
    fn new(id: u16) -> Self {
        Self {
            id,
            observer: Mutex::new(None),
            link: Mutex::new(ChannelLink {
                peer: Weak::new(),
                open: false,
            }),
        }
    }

    fn link_to(&self, peer: &Arc<LoopbackChannel>) {
        let mut link = self.link.lock();
        link.peer = Arc::downgrade(peer);
        link.open = true;
    }

    fn notify(&self, state: ChannelState) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_state_change(state);
        }
    }

    /// Peer link, if the channel was open
    fn mark_closed(&self) -> Option<Weak<LoopbackChannel>> {
        let mut link = self.link.lock();
        if !link.open {
            return None;
        }
        link.open = false;
        Some(link.peer.clone())
    }
}

impl DataChannel for LoopbackChannel {
    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn unregister_observer(&self) {
        self.observer.lock().take();
    }

    fn send(&self, data: &[u8], _message_type: MessageType) {
        let peer = {
            let link = self.link.lock();
            if !link.open {
                log::trace!("Loopback channel {}: dropping send while closed", self.id);
                return;
            }
            link.peer.upgrade()
        };
        let observer = peer.and_then(|peer| peer.observer.lock().clone());
        if let Some(observer) = observer {
            observer.on_message(data);
        }
    }

    fn close(&self) {
        let Some(peer) = self.mark_closed() else {
            return;
        };
        self.notify(ChannelState::Closed);
        if let Some(peer) = peer.upgrade() {
            if peer.mark_closed().is_some() {
                peer.notify(ChannelState::Closed);
            }
        }
    }

    fn dispose(&self) {
        self.close();
        self.observer.lock().take();
    }
}

// ============================================================================
// Tests
// ============================================================================
