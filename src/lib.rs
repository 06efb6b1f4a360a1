//! Peer-to-peer data channel negotiated over a casting host's message bus.
//!
//! Two endpoints — a sender and a receiver — can initially only exchange small
//! control messages through the host's low-throughput relay. This crate
//! negotiates a direct peer connection over that relay (offer/answer/ICE) and
//! then moves bulk traffic onto the resulting data channel, rebuilding the
//! connection whenever it drops.
//!
//! # Architecture
//!
//! ```text
//! CastSender / CastReceiver
//!     |-- SignalingAdapter (relay control plane: connected/ice/offer)
//!     |-- Negotiation controller (peer-connection lifecycle, reconnection)
//!     `-- TransferManager (outbound queue, watermark drain, inbound fanout)
//! ```
//!
//! The relay, the peer-connection primitive, and the host session lifecycle are
//! external collaborators expressed as traits ([`RelayTransport`],
//! [`ReceiverPlatform`], [`PeerConnector`] / [`PeerConnection`] /
//! [`DataChannel`]). The embedder supplies implementations; the crate owns only
//! the negotiation state machines and the flow-controlled transfer layer.
//!
//! # Delivery guarantee
//!
//! Within one data-channel lifetime, send order equals delivery order. Across a
//! reconnect the outbound queue is cleared wholesale: delivery is at-most-once
//! with no redelivery of items that were pending when the channel closed.

pub mod events;
pub mod receiver;
pub mod sender;
pub mod signaling;
pub mod transfer;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

// Re-export the public surface
pub use receiver::{CastReceiver, ReceiverPlatform, StartOptions};
pub use sender::{CastSender, SessionState};
pub use signaling::{PayloadShape, RelayTransport, SignalHandler, SignalKind, SignalingAdapter};
pub use transfer::{OutboundItem, TransferManager};
pub use transport::{
    DataChannel, DataChannelEvent, DataChannelState, IceCandidate, PeerConnection,
    PeerConnectionState, PeerConnector, PeerEvent, SessionDescription, SignalingState,
};

/// Errors that can occur during channel operations.
///
/// Transient negotiation failures (ICE add, description set) are logged and
/// swallowed inside the controllers; this type surfaces only to explicit
/// callers of fallible operations.
#[derive(Debug)]
pub enum ChannelError {
    /// Peer-connection negotiation step failed.
    NegotiationFailed(String),
    /// Failed to write to the data channel.
    SendFailed(String),
    /// A deadline elapsed (liveness handshake, buffer drain).
    Timeout,
    /// The channel or session is gone.
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegotiationFailed(msg) => write!(f, "Negotiation failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}
