//! Peer-connection collaborator traits.
//!
//! The peer-connection/data-channel primitive is supplied by the embedder
//! (a WebRTC stack, a loopback pipe, a test double). These traits pin down
//! exactly what the negotiation controllers and the transfer layer rely on:
//! offer/answer SDP negotiation, trickled ICE, one ordered reliable channel
//! with a readable buffered-amount counter and a low-watermark event, and
//! connection-state notification.
//!
//! Events are delivered over `tokio::sync::broadcast` so several tasks can
//! observe the same connection, mirroring the subscribe-style event surface of
//! rustrtc-like stacks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ChannelError;

/// Connection state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Freshly constructed, no negotiation yet.
    New,
    /// ICE/DTLS in progress.
    Connecting,
    /// Direct path established.
    Connected,
    /// Path lost; may recover or fail.
    Disconnected,
    /// Negotiation or transport failed permanently.
    Failed,
    /// Closed by either side.
    Closed,
}

/// SDP signaling state, used to reject stale answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No offer outstanding.
    Stable,
    /// A local offer has been set and an answer is expected.
    HaveLocalOffer,
    /// A remote offer has been set and a local answer is pending.
    HaveRemoteOffer,
}

/// Ready state of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Underlying transport still negotiating.
    Connecting,
    /// Open for traffic.
    Open,
    /// Close in progress.
    Closing,
    /// Closed.
    Closed,
}

/// An SDP session description exchanged over the relay.
///
/// Serializes to the `{"type": ..., "sdp": ...}` shape both browsers and
/// native stacks use for description init dictionaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub sdp_type: String,
    /// The SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    /// Create an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate exchanged over the relay.
///
/// Field names follow the candidate-init dictionary (`sdpMid`,
/// `sdpMLineIndex`) so relay payloads interoperate with browser peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line, `candidate:...` format.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Events emitted by a [`PeerConnection`].
pub enum PeerEvent {
    /// Connection state transition.
    ConnectionStateChange(PeerConnectionState),
    /// Locally gathered ICE candidate to forward to the peer.
    /// `None` signals end of gathering and is a no-op for consumers.
    IceCandidate(Option<IceCandidate>),
    /// The remote peer created a data channel on this connection.
    DataChannel(Arc<dyn DataChannel>),
}

impl Clone for PeerEvent {
    fn clone(&self) -> Self {
        match self {
            Self::ConnectionStateChange(s) => Self::ConnectionStateChange(*s),
            Self::IceCandidate(c) => Self::IceCandidate(c.clone()),
            Self::DataChannel(dc) => Self::DataChannel(Arc::clone(dc)),
        }
    }
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionStateChange(s) => f.debug_tuple("ConnectionStateChange").field(s).finish(),
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
        }
    }
}

/// Events emitted by a [`DataChannel`].
#[derive(Debug, Clone)]
pub enum DataChannelEvent {
    /// Ready state reached `Open`.
    Open,
    /// Ready state reached `Closed`.
    Close,
    /// A complete text message arrived.
    Message(String),
    /// Buffered amount dropped to the configured low threshold.
    BufferedAmountLow,
}

/// The negotiated transport primitive.
///
/// Owned exclusively by a negotiation controller; replaced, never reused,
/// across disconnect/reconnect cycles.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Synthesize a local offer description.
    async fn create_offer(&self) -> Result<SessionDescription, ChannelError>;

    /// Synthesize a local answer to the current remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, ChannelError>;

    /// Apply a local description.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ChannelError>;

    /// Apply a remote description.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ChannelError>;

    /// Add a remote ICE candidate. Candidate loss is tolerated per ICE
    /// semantics; callers log and continue on error.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ChannelError>;

    /// Current connection state.
    fn connection_state(&self) -> PeerConnectionState;

    /// Current SDP signaling state.
    fn signaling_state(&self) -> SignalingState;

    /// Create the (single) local data channel on this connection.
    fn create_data_channel(&self, label: &str) -> Arc<dyn DataChannel>;

    /// Subscribe to connection events. Every subscriber sees every event
    /// emitted after the call.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    /// Close the connection and release its transport resources.
    fn close(&self);
}

/// The bidirectional transport once negotiation succeeds.
///
/// Buffered-amount accounting is owned entirely by the implementation; the
/// transfer layer only reads it to decide whether to dispatch.
pub trait DataChannel: Send + Sync {
    /// Channel label agreed during negotiation.
    fn label(&self) -> String;

    /// Current ready state.
    fn ready_state(&self) -> DataChannelState;

    /// Bytes queued for send inside the transport.
    fn buffered_amount(&self) -> u64;

    /// Set the watermark below which [`DataChannelEvent::BufferedAmountLow`]
    /// fires.
    fn set_buffered_amount_low_threshold(&self, threshold: u64);

    /// Queue a text message for ordered reliable delivery.
    fn send_text(&self, text: &str) -> Result<(), ChannelError>;

    /// Subscribe to channel events.
    fn subscribe(&self) -> broadcast::Receiver<DataChannelEvent>;

    /// Close the channel.
    fn close(&self);
}

/// Factory for peer connections.
///
/// Controllers call this once at startup and once per rebuild cycle; each call
/// must return a fresh, unconnected instance.
pub trait PeerConnector: Send + Sync {
    /// Construct a new peer connection.
    fn create_peer_connection(&self) -> Arc<dyn PeerConnection>;
}
