//! Peer connection and data channel contracts
//!
//! The bridge never implements WebRTC itself. Sessions drive a peer
//! connection through the traits in this module and receive its events
//! through observers. Implementations may invoke observers from any thread;
//! sessions and tunnels re-post every event onto their signaling thread.
//!
//! # ICE Candidate Strings
//!
//! Candidates cross the signaling channel as single strings:
//! ```text
//! <sdpMid>:<sdpMLineIndex>:<sdp>
//! ```
//! The split is limited to three parts, so the SDP part may itself contain
//! colons.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Pre-negotiated data channel carrying session control messages
pub const CONTROL_CHANNEL_ID: u16 = 0;

/// Pre-negotiated data channel carrying the default socket tunnel
pub const DEFAULT_TUNNEL_CHANNEL_ID: u16 = 1;

// ============================================================================
// Session Description
// ============================================================================

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

// ============================================================================
// RTC Configuration
// ============================================================================

/// A STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub uri: String,
    pub username: String,
    pub credential: String,
}

/// Ordered list of ICE servers handed to the peer connection.
///
/// Immutable once built; use [`RtcConfiguration::builder`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfiguration {
    ice_servers: Vec<IceServer>,
}

impl RtcConfiguration {
    pub fn builder() -> RtcConfigurationBuilder {
        RtcConfigurationBuilder::default()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }
}

/// Builder for [`RtcConfiguration`]
#[derive(Debug, Default)]
pub struct RtcConfigurationBuilder {
    ice_servers: Vec<IceServer>,
}

impl RtcConfigurationBuilder {
    /// Append a server without credentials
    pub fn ice_server(self, uri: impl Into<String>) -> Self {
        self.ice_server_with_credentials(uri, "", "")
    }

    /// Append a server with TURN credentials
    pub fn ice_server_with_credentials(
        mut self,
        uri: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(IceServer {
            uri: uri.into(),
            username: username.into(),
            credential: credential.into(),
        });
        self
    }

    pub fn build(self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: self.ice_servers,
        }
    }
}

// ============================================================================
// ICE Candidate
// ============================================================================

/// An ICE candidate as exchanged over the signaling channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_m_line_index: u32,
    pub sdp: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_m_line_index: u32, sdp: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_m_line_index,
            sdp: sdp.into(),
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sdp_mid, self.sdp_m_line_index, self.sdp)
    }
}

/// Error parsing a candidate string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ICE candidate: {0}")]
pub struct InvalidCandidate(pub String);

impl FromStr for IceCandidate {
    type Err = InvalidCandidate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(mid), Some(index), Some(sdp)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(InvalidCandidate(s.to_string()));
        };
        let index = index
            .parse::<u32>()
            .map_err(|_| InvalidCandidate(s.to_string()))?;
        Ok(IceCandidate::new(mid, index, sdp))
    }
}

// ============================================================================
// Data Channel
// ============================================================================

/// Payload kind of a data channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

/// Data channel readiness as reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// Receives data channel events
pub trait DataChannelObserver: Send + Sync {
    fn on_state_change(&self, state: ChannelState);
    fn on_message(&self, data: &[u8]);
}

/// An ordered, reliable, pre-negotiated, message-oriented channel.
///
/// `send` must be callable from any thread.
pub trait DataChannel: Send + Sync {
    fn register_observer(&self, observer: Arc<dyn DataChannelObserver>);
    fn unregister_observer(&self);
    fn send(&self, data: &[u8], message_type: MessageType);
    fn close(&self);
    fn dispose(&self);
}

// ============================================================================
// Peer Connection
// ============================================================================

/// Receives peer connection events.
///
/// Every operation on [`PeerConnection`] that completes asynchronously
/// reports through exactly one of these callbacks.
pub trait PeerConnectionObserver: Send + Sync {
    fn on_local_description_created_and_set(&self, sdp_type: SdpType, sdp: String);
    fn on_remote_description_set(&self);
    fn on_failure(&self, reason: String);
    fn on_ice_candidate(&self, candidate: String);
    fn on_ice_connection_change(&self, connected: bool);
}

/// Capability interface over a WebRTC-style peer connection
pub trait PeerConnection: Send {
    fn create_and_set_local_description(&mut self, sdp_type: SdpType);
    fn set_remote_description(&mut self, sdp_type: SdpType, sdp: &str);
    fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), InvalidCandidate>;
    fn create_data_channel(&mut self, channel_id: u16) -> Arc<dyn DataChannel>;

    /// Release the connection. Channels created from it must already be
    /// disposed.
    fn dispose(&mut self);
}

/// Creates peer connections for sessions
pub trait PeerConnectionFactory: Send + Sync {
    fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Box<dyn PeerConnection>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_keeps_colons_in_sdp() {
        let candidate: IceCandidate = "audio:0:candidate:1 1 udp 2122 10.0.0.1 5000 typ host"
            .parse()
            .unwrap();
        assert_eq!(candidate.sdp_mid, "audio");
        assert_eq!(candidate.sdp_m_line_index, 0);
        assert_eq!(candidate.sdp, "candidate:1 1 udp 2122 10.0.0.1 5000 typ host");
        assert_eq!(
            candidate.to_string(),
            "audio:0:candidate:1 1 udp 2122 10.0.0.1 5000 typ host"
        );
    }

    #[test]
    fn test_candidate_rejects_short_or_bad_index() {
        assert!("mid:0".parse::<IceCandidate>().is_err());
        assert!("mid:x:sdp".parse::<IceCandidate>().is_err());
    }

    #[test]
    fn test_rtc_configuration_builder_keeps_order() {
        let config = RtcConfiguration::builder()
            .ice_server("stun:stun.example.org")
            .ice_server_with_credentials("turn:turn.example.org", "user", "secret")
            .build();

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].uri, "stun:stun.example.org");
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }
}
