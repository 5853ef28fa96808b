//! DevTools Bridge
//!
//! Lets a remote client reach a local UNIX socket (typically a DevTools
//! socket) through a data-channel session:
//! - Session negotiation (offer/answer, ICE exchange) as a state machine
//!   driven on a signaling thread
//! - Socket tunneling: up to 64 local connections multiplexed over one
//!   data channel with a small framed protocol
//! - A server-side registry of sessions and a framed signaling transport
//! - An in-memory loopback peer connection for tests and local use
//!
//! ```text
//!  local client ─► SocketTunnelClient ═ data channel 1 ═► SocketTunnelServer ─► target socket
//!                  ClientSession      ═ control ch. 0 ═► ServerSession
//!                        │                                    ▲
//!                        └── RemoteEndpoint ── signaling ── BridgeServer
//! ```

use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod lifetime;
pub mod loopback;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod tunnel;

pub use config::SessionConfig;
pub use error::SessionError;
pub use executor::{SignalingHandle, SignalingThread, TaskHandle};
pub use lifetime::{KeepAlive, LoggingKeepAlive, SessionCountLock};
pub use loopback::LoopbackNetwork;
pub use metrics::Metrics;
pub use peer::{RtcConfiguration, CONTROL_CHANNEL_ID, DEFAULT_TUNNEL_CHANNEL_ID};
pub use registry::{BridgeServer, FixedSocketName, ServerHost, SocketNameResolver};
pub use session::{ClientSession, ServerSession, SessionEndpoint, SessionState};
pub use signaling::{serve_stream, RemoteEndpoint};
pub use tunnel::{SocketTunnel, SocketTunnelClient, SocketTunnelServer, TunnelObserver};

// ============================================================================
// Session IDs
// ============================================================================

/// Length of a generated session ID in random bytes
const SESSION_ID_BYTES: usize = 16;

/// Fresh random session ID as lowercase hex
pub fn generate_session_id() -> Result<String, ring::error::Unspecified> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rng.fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}
