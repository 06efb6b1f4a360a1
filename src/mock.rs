//! In-memory collaborator doubles used by the module tests.
//!
//! These implement the relay, platform, and peer-connection traits with fully
//! test-controlled state: tests set ready states and buffered amounts
//! directly and emit transport events by hand, so timing-sensitive properties
//! can be exercised deterministically under a paused Tokio clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::receiver::{ReceiverPlatform, StartOptions};
use crate::signaling::{RelayTransport, SignalHandler};
use crate::transport::{
    DataChannel, DataChannelEvent, DataChannelState, IceCandidate, PeerConnection,
    PeerConnectionState, PeerConnector, PeerEvent, SessionDescription, SignalingState,
};
use crate::ChannelError;

const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Relay / platform
// ---------------------------------------------------------------------------

/// In-memory relay bus endpoint.
///
/// Records everything sent through it and delivers inbound messages to
/// registered listeners synchronously. Two endpoints can be linked so that a
/// send on one side is delivered to the other, optionally re-wrapped in the
/// receiver platform's `{"data": ...}` envelope.
pub struct MockRelay {
    sent: Mutex<Vec<(String, Value)>>,
    listeners: Mutex<HashMap<String, Vec<SignalHandler>>>,
    peer: Mutex<Weak<MockRelay>>,
    /// Wrap deliveries arriving over a link in a `{"data": ...}` envelope.
    wrap_inbound: bool,
    started: Mutex<Vec<StartOptions>>,
}

impl std::fmt::Debug for MockRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRelay")
            .field("sent", &lock(&self.sent).len())
            .field("wrap_inbound", &self.wrap_inbound)
            .finish()
    }
}

impl MockRelay {
    /// Create an unlinked endpoint delivering payloads directly.
    pub fn new() -> Self {
        Self::with_wrapping(false)
    }

    /// Create an unlinked endpoint; `wrap_inbound` selects the receiver
    /// platform's envelope shape for linked deliveries.
    pub fn with_wrapping(wrap_inbound: bool) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            peer: Mutex::new(Weak::new()),
            wrap_inbound,
            started: Mutex::new(Vec::new()),
        }
    }

    /// Link two endpoints so sends on one deliver to the other.
    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
    }

    /// Deliver an inbound message to this endpoint's listeners, exactly as a
    /// platform callback would.
    pub fn deliver(&self, namespace: &str, payload: Value) {
        let handlers: Vec<SignalHandler> = lock(&self.listeners)
            .get(namespace)
            .map(|v| v.iter().map(Arc::clone).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload.clone());
        }
    }

    fn deliver_from_link(&self, namespace: &str, payload: Value) {
        let payload = if self.wrap_inbound {
            json!({ "data": payload })
        } else {
            payload
        };
        self.deliver(namespace, payload);
    }

    /// Everything sent through this endpoint, in order.
    pub fn sent(&self) -> Vec<(String, Value)> {
        lock(&self.sent).clone()
    }

    /// Sent messages for one namespace.
    pub fn sent_on(&self, namespace: &str) -> Vec<Value> {
        lock(&self.sent)
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Startup options captured by [`ReceiverPlatform::start`].
    pub fn started(&self) -> Vec<StartOptions> {
        lock(&self.started).clone()
    }
}

impl RelayTransport for MockRelay {
    fn send_message(&self, namespace: &str, payload: Value) {
        lock(&self.sent).push((namespace.to_string(), payload.clone()));
        if let Some(peer) = lock(&self.peer).upgrade() {
            peer.deliver_from_link(namespace, payload);
        }
    }

    fn add_message_listener(&self, namespace: &str, handler: SignalHandler) {
        lock(&self.listeners)
            .entry(namespace.to_string())
            .or_default()
            .push(handler);
    }
}

impl ReceiverPlatform for MockRelay {
    fn start(&self, options: StartOptions) {
        lock(&self.started).push(options);
    }
}

// ---------------------------------------------------------------------------
// Data channel
// ---------------------------------------------------------------------------

/// Test-controlled data channel.
///
/// `send_text` records the text and grows the buffered amount by the text
/// length; tests drain the buffer with [`set_buffered_amount`] and fire
/// transport events with [`emit`].
///
/// [`set_buffered_amount`]: MockDataChannel::set_buffered_amount
/// [`emit`]: MockDataChannel::emit
pub struct MockDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    buffered: AtomicU64,
    threshold: AtomicU64,
    sent: Mutex<Vec<String>>,
    events: broadcast::Sender<DataChannelEvent>,
}

impl std::fmt::Debug for MockDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDataChannel")
            .field("label", &self.label)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl MockDataChannel {
    /// Create a channel in the `Connecting` state.
    pub fn new(label: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            buffered: AtomicU64::new(0),
            threshold: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Create a channel already in the `Open` state.
    pub fn open(label: &str) -> Arc<Self> {
        let dc = Self::new(label);
        dc.set_ready_state(DataChannelState::Open);
        dc
    }

    /// Set the ready state without emitting an event.
    pub fn set_ready_state(&self, state: DataChannelState) {
        *lock(&self.state) = state;
    }

    /// Set the transport-owned buffered amount.
    pub fn set_buffered_amount(&self, amount: u64) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// Emit a transport event to all subscribers.
    pub fn emit(&self, event: DataChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Texts written to the channel, in dispatch order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// The configured buffered-amount-low threshold.
    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::SeqCst)
    }
}

impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *lock(&self.state)
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.threshold.store(threshold, Ordering::SeqCst);
    }

    fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        lock(&self.sent).push(text.to_string());
        self.buffered.fetch_add(text.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DataChannelEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        *lock(&self.state) = DataChannelState::Closed;
        let _ = self.events.send(DataChannelEvent::Close);
    }
}

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

/// Test-controlled peer connection.
///
/// Descriptions and candidates are recorded; the signaling state follows the
/// usual offer/answer progression so controllers can exercise their
/// `have-local-offer` guards.
pub struct MockPeerConnection {
    connection_state: Mutex<PeerConnectionState>,
    signaling_state: Mutex<SignalingState>,
    local_descriptions: Mutex<Vec<SessionDescription>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    ice_candidates: Mutex<Vec<IceCandidate>>,
    data_channels: Mutex<Vec<Arc<MockDataChannel>>>,
    events: broadcast::Sender<PeerEvent>,
    closed: AtomicBool,
    offer_seq: AtomicU64,
}

impl std::fmt::Debug for MockPeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeerConnection")
            .field("connection_state", &*lock(&self.connection_state))
            .field("signaling_state", &*lock(&self.signaling_state))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockPeerConnection {
    /// Create a fresh, unconnected instance.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            connection_state: Mutex::new(PeerConnectionState::New),
            signaling_state: Mutex::new(SignalingState::Stable),
            local_descriptions: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            ice_candidates: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
            offer_seq: AtomicU64::new(0),
        })
    }

    /// Emit a connection event to all subscribers.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    /// Set the connection state and emit the matching event.
    pub fn transition(&self, state: PeerConnectionState) {
        *lock(&self.connection_state) = state;
        self.emit(PeerEvent::ConnectionStateChange(state));
    }

    /// Remote descriptions applied so far.
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.remote_descriptions).clone()
    }

    /// Local descriptions applied so far.
    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.local_descriptions).clone()
    }

    /// Remote ICE candidates added so far.
    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.ice_candidates).clone()
    }

    /// Locally created data channels.
    pub fn data_channels(&self) -> Vec<Arc<MockDataChannel>> {
        lock(&self.data_channels).clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ChannelError> {
        let n = self.offer_seq.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("mock-sdp-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ChannelError> {
        Ok(SessionDescription::answer("mock-sdp-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ChannelError> {
        *lock(&self.signaling_state) = if desc.sdp_type == "offer" {
            SignalingState::HaveLocalOffer
        } else {
            SignalingState::Stable
        };
        lock(&self.local_descriptions).push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), ChannelError> {
        *lock(&self.signaling_state) = if desc.sdp_type == "offer" {
            SignalingState::HaveRemoteOffer
        } else {
            SignalingState::Stable
        };
        lock(&self.remote_descriptions).push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ChannelError> {
        lock(&self.ice_candidates).push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *lock(&self.connection_state)
    }

    fn signaling_state(&self) -> SignalingState {
        *lock(&self.signaling_state)
    }

    fn create_data_channel(&self, label: &str) -> Arc<dyn DataChannel> {
        let dc = MockDataChannel::new(label);
        lock(&self.data_channels).push(Arc::clone(&dc));
        dc
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *lock(&self.connection_state) = PeerConnectionState::Closed;
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Factory recording every peer connection it hands out.
pub struct MockConnector {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("created", &lock(&self.created).len())
            .finish()
    }
}

impl MockConnector {
    /// Create an empty factory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
        })
    }

    /// Connections created so far, oldest first.
    pub fn created(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.created).clone()
    }

    /// Number of connections created.
    pub fn created_count(&self) -> usize {
        lock(&self.created).len()
    }
}

impl PeerConnector for MockConnector {
    fn create_peer_connection(&self) -> Arc<dyn PeerConnection> {
        let pc = MockPeerConnection::new();
        lock(&self.created).push(Arc::clone(&pc));
        pc
    }
}
