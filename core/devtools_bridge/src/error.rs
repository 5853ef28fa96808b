//! Failures reported to signaling callers
//!
//! The `Display` text of each variant is what a remote caller sees as the
//! failure reason, so it stays stable.

use serde::{Deserialize, Serialize};

/// Failure of a session or registry request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SessionError {
    /// Another negotiation or ICE exchange is still in flight
    #[error("Concurrent requests detected")]
    ConcurrentRequests,
    #[error("Session already started")]
    AlreadyStarted,
    #[error("Session not started")]
    NotStarted,
    /// Request was cancelled because the session stopped
    #[error("Session stopped")]
    Stopped,
    #[error("Not implemented")]
    NotImplemented,
    /// Request did not arrive on the session's signaling thread
    #[error("Called off the signaling thread")]
    WrongThread,
    /// Peer connection rejected a description or failed
    #[error("{0}")]
    Negotiation(String),
    #[error("Session already exists")]
    SessionExists,
    #[error("Session does not exist")]
    SessionNotFound,
    /// Target socket name could not be resolved
    #[error("Socket resolution failed: {0}")]
    SocketResolution(String),
    /// Signaling transport failed before a response arrived
    #[error("Signaling failed: {0}")]
    Transport(String),
}

/// Result delivered to a negotiation callback: the remote's SDP on success
pub type NegotiationResult = Result<String, SessionError>;

/// Result delivered to an ICE exchange callback: the remote's candidates
pub type IceExchangeResult = Result<Vec<String>, SessionError>;

/// One-shot completion of `start_session` / `renegotiate`
pub type NegotiationCallback = Box<dyn FnOnce(NegotiationResult) + Send + 'static>;

/// One-shot completion of `ice_exchange`
pub type IceExchangeCallback = Box<dyn FnOnce(IceExchangeResult) + Send + 'static>;
