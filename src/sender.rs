//! Sender-side negotiation controller.
//!
//! The sender drives the connection: once the host reports an active cast
//! session it runs the liveness handshake (probe the relay until the receiver
//! acknowledges), builds a peer connection, proactively creates the data
//! channel, and sends the offer. Whenever the connection degrades or the
//! channel closes, the whole cycle runs again against a fresh peer connection.
//!
//! ```text
//! Idle -> WaitForSession -> LivenessHandshake -> Offering -> Open
//!                                ^                             |
//!                                `---- channel close ----------'
//! ```
//!
//! Event-loop tasks are tied to a generation counter. Every rebuild bumps the
//! generation; loops spawned for an older peer connection observe the bump
//! and exit, so a replaced connection can never act on the controller again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, oneshot, watch};

use crate::events::CallbackRegistry;
use crate::signaling::{PayloadShape, RelayTransport, SignalKind, SignalingAdapter};
use crate::transfer::{OutboundItem, TransferManager, BUFFERED_AMOUNT_LOW_THRESHOLD};
use crate::transport::{
    DataChannel, DataChannelEvent, IceCandidate, PeerConnection, PeerConnectionState,
    PeerConnector, PeerEvent, SessionDescription, SignalingState,
};
use crate::ChannelError;

/// Label of the data channel the sender creates on every peer connection.
pub const DATA_CHANNEL_LABEL: &str = "CastDataChannel";

/// Cadence of the liveness probe.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling on the liveness handshake; an unanswered probe window this long
/// abandons negotiation for the current session activation.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Host session lifecycle states relevant to the sender.
///
/// `Started` and `Resumed` both map to an active session; anything else the
/// host reports is treated as the session ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A new cast session started.
    Started,
    /// An existing session was resumed.
    Resumed,
    /// The session ended (or entered any unrecognized state).
    Ended,
}

impl SessionState {
    /// Whether this state carries an active session.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Started | Self::Resumed)
    }
}

struct SenderInner {
    connector: Arc<dyn PeerConnector>,
    adapter: SignalingAdapter,
    transfer: TransferManager,
    connected: CallbackRegistry<()>,
    disconnected: CallbackRegistry<()>,
    session_active: AtomicBool,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    /// Bumped on every rebuild; event loops for older generations exit.
    generation: watch::Sender<u64>,
}

impl SenderInner {
    fn current_peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The sender endpoint: session tracking, liveness handshake, offer-side
/// negotiation, and the flow-controlled outbound queue.
///
/// Must be created and driven inside a Tokio runtime; negotiation work runs
/// on spawned tasks.
pub struct CastSender {
    inner: Arc<SenderInner>,
}

impl std::fmt::Debug for CastSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CastSender")
            .field(
                "session_active",
                &self.inner.session_active.load(Ordering::SeqCst),
            )
            .field("has_peer", &self.inner.current_peer().is_some())
            .finish()
    }
}

impl CastSender {
    /// Create a sender with no session. Negotiation begins once the host
    /// reports an active session via
    /// [`handle_session_state`](Self::handle_session_state).
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        let (generation, _) = watch::channel(0u64);
        let inner = Arc::new(SenderInner {
            connector,
            adapter: SignalingAdapter::new(PayloadShape::Direct),
            transfer: TransferManager::new(),
            connected: CallbackRegistry::new(),
            disconnected: CallbackRegistry::new(),
            session_active: AtomicBool::new(false),
            peer: Mutex::new(None),
            generation,
        });

        // One persistent ICE listener routing to whichever peer connection is
        // current; per-rebuild registration would accumulate subscribers.
        {
            let weak = Arc::downgrade(&inner);
            inner.adapter.receive(SignalKind::Ice, move |payload| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let candidate: IceCandidate = match serde_json::from_value(payload) {
                    Ok(c) => c,
                    Err(e) => {
                        log::debug!("[Sender] Dropping malformed ICE candidate: {e}");
                        return;
                    }
                };
                if let Some(peer) = inner.current_peer() {
                    tokio::spawn(async move {
                        if let Err(e) = peer.add_ice_candidate(candidate).await {
                            log::warn!("[Sender] Failed to add ICE candidate: {e}");
                        }
                    });
                }
            });
        }

        Self { inner }
    }

    /// Feed a host session-state transition into the controller.
    ///
    /// `Started`/`Resumed` attach the session's relay and kick off the
    /// liveness handshake; any other state detaches the relay, closes the
    /// current peer connection, and suspends reconnection until a new session
    /// starts.
    pub fn handle_session_state(
        &self,
        state: SessionState,
        relay: Option<Arc<dyn RelayTransport>>,
    ) {
        self.inner.adapter.set_relay(None);

        if !state.is_active() {
            log::info!("[Sender] Session ended");
            self.inner.session_active.store(false, Ordering::SeqCst);
            self.inner.generation.send_modify(|g| *g += 1);
            if let Some(peer) = self
                .inner
                .peer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                peer.close();
            }
            self.inner.transfer.reset();
            return;
        }

        log::info!("[Sender] Session active, starting liveness handshake");
        self.inner.session_active.store(true, Ordering::SeqCst);
        self.inner.adapter.set_relay(relay);
        tokio::spawn(start_connected(Arc::clone(&self.inner)));
    }

    /// Queue a payload for ordered, flow-controlled delivery.
    pub fn send(&self, item: OutboundItem) {
        self.inner.transfer.send(item);
    }

    /// Register a callback for inbound data-channel messages.
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.inner.transfer.on_data(callback);
    }

    /// Register a callback for per-item delivery progress.
    pub fn on_percentage<F>(&self, callback: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.inner.transfer.on_percentage(callback);
    }

    /// Register a callback for data-channel open events.
    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.connected.add(move |()| callback());
    }

    /// Register a callback for data-channel close events.
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.disconnected.add(move |()| callback());
    }

    /// Empty the outbound queue now and wait for the transport buffer to
    /// drain; see [`TransferManager::clear_buffer`].
    pub fn clear_buffer(
        &self,
        timeout: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send + 'static {
        self.inner.transfer.clear_buffer(timeout)
    }

    /// Close the current data channel, if any. The close propagates through
    /// the usual disconnect handling.
    pub fn close(&self) {
        if let Some(dc) = self.inner.transfer.channel_handle() {
            dc.close();
        }
    }
}

/// Liveness handshake, then peer-connection setup and offer.
async fn start_connected(inner: Arc<SenderInner>) {
    match when_connected(&inner).await {
        Ok(()) => {
            setup_rtc(&inner);
            send_offer(inner).await;
        }
        Err(e) => log::warn!("[Sender] Liveness handshake failed: {e}"),
    }
}

/// Probe the relay every 100ms until the receiver acknowledges.
///
/// Fails with [`ChannelError::Timeout`] after 30s without an acknowledgment,
/// or [`ChannelError::Closed`] if the session ends mid-handshake.
async fn when_connected(inner: &Arc<SenderInner>) -> Result<(), ChannelError> {
    let (ack_tx, mut ack_rx) = oneshot::channel::<()>();
    let ack_tx = Mutex::new(Some(ack_tx));
    inner.adapter.receive_once(SignalKind::Connected, move |_| {
        if let Some(tx) = ack_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    });

    let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);
    let mut probe = tokio::time::interval(PROBE_INTERVAL);

    loop {
        tokio::select! {
            biased;
            result = &mut ack_rx => {
                return match result {
                    Ok(()) => Ok(()),
                    Err(_) => Err(ChannelError::Closed),
                };
            }
            () = &mut deadline => return Err(ChannelError::Timeout),
            _ = probe.tick() => {
                if !inner.session_active.load(Ordering::SeqCst) {
                    return Err(ChannelError::Closed);
                }
                inner.adapter.send(SignalKind::Connected, json!({}));
            }
        }
    }
}

/// Replace the peer connection: close the old one, clear the outbound queue,
/// build a fresh connection with its data channel, and start the event loops
/// for the new generation.
fn setup_rtc(inner: &Arc<SenderInner>) {
    let mut generation = 0;
    inner.generation.send_modify(|g| {
        *g += 1;
        generation = *g;
    });

    if let Some(old) = inner
        .peer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    {
        old.close();
    }
    inner.transfer.reset();

    let pc = inner.connector.create_peer_connection();
    let dc = pc.create_data_channel(DATA_CHANNEL_LABEL);
    dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD);
    inner.transfer.attach(Arc::clone(&dc));
    *inner
        .peer
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&pc));

    tokio::spawn(run_peer_events(Arc::clone(inner), pc, generation));
    tokio::spawn(run_channel_events(Arc::clone(inner), dc, generation));
}

/// Create and send the offer, with a one-shot guarded listener for the
/// answer.
async fn send_offer(inner: Arc<SenderInner>) {
    let Some(pc) = inner.current_peer() else {
        return;
    };

    let offer = match pc.create_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            log::warn!("[Sender] Failed to create offer: {e}");
            return;
        }
    };
    if let Err(e) = pc.set_local_description(offer.clone()).await {
        log::warn!("[Sender] Failed to set local description: {e}");
        return;
    }

    // One-shot answer listener, armed before the offer goes out. The
    // signaling-state guard rejects stale answers arriving after the
    // exchange has already advanced.
    {
        let weak_pc = Arc::downgrade(&pc);
        inner.adapter.receive_once(SignalKind::Offer, move |payload| {
            let Some(pc) = weak_pc.upgrade() else {
                return;
            };
            if pc.signaling_state() != SignalingState::HaveLocalOffer {
                log::debug!("[Sender] Ignoring answer outside have-local-offer");
                return;
            }
            let answer: SessionDescription = match serde_json::from_value(payload) {
                Ok(desc) => desc,
                Err(e) => {
                    log::warn!("[Sender] Dropping malformed answer: {e}");
                    return;
                }
            };
            tokio::spawn(async move {
                if let Err(e) = pc.set_remote_description(answer).await {
                    log::warn!("[Sender] Failed to apply answer: {e}");
                }
            });
        });
    }

    match serde_json::to_value(&offer) {
        Ok(payload) => inner.adapter.send(SignalKind::Offer, payload),
        Err(e) => log::warn!("[Sender] Failed to serialize offer: {e}"),
    }
}

/// Peer-connection event loop for one generation: forward gathered ICE
/// candidates outward and rebuild when the connection degrades.
async fn run_peer_events(
    inner: Arc<SenderInner>,
    pc: Arc<dyn PeerConnection>,
    generation: u64,
) {
    let mut events = pc.subscribe();
    let mut gen_rx = inner.generation.subscribe();

    loop {
        if *inner.generation.borrow() != generation {
            return;
        }
        tokio::select! {
            changed = gen_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            event = events.recv() => match event {
                Ok(PeerEvent::IceCandidate(Some(candidate))) => {
                    match serde_json::to_value(&candidate) {
                        Ok(payload) => inner.adapter.send(SignalKind::Ice, payload),
                        Err(e) => log::warn!("[Sender] Failed to serialize ICE candidate: {e}"),
                    }
                }
                // End of gathering, nothing to forward
                Ok(PeerEvent::IceCandidate(None)) => {}
                Ok(PeerEvent::ConnectionStateChange(state)) => {
                    if state == PeerConnectionState::Disconnected
                        && inner.session_active.load(Ordering::SeqCst)
                    {
                        log::info!("[Sender] Connection degraded, rebuilding");
                        setup_rtc(&inner);
                        tokio::spawn(send_offer(Arc::clone(&inner)));
                        return;
                    }
                }
                // The sender creates its own channel
                Ok(PeerEvent::DataChannel(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[Sender] Peer event loop lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Data-channel event loop for one generation: open/close notifications,
/// inbound fanout, and the watermark drain.
async fn run_channel_events(
    inner: Arc<SenderInner>,
    dc: Arc<dyn DataChannel>,
    generation: u64,
) {
    let mut events = dc.subscribe();
    let mut gen_rx = inner.generation.subscribe();

    loop {
        if *inner.generation.borrow() != generation {
            return;
        }
        tokio::select! {
            changed = gen_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            event = events.recv() => match event {
                Ok(DataChannelEvent::Open) => {
                    log::info!("[Sender] Data channel open");
                    inner.connected.emit(&());
                }
                Ok(DataChannelEvent::Message(text)) => inner.transfer.handle_message(&text),
                Ok(DataChannelEvent::BufferedAmountLow) => inner.transfer.drain(),
                Ok(DataChannelEvent::Close) => {
                    log::info!("[Sender] Data channel closed");
                    inner.disconnected.emit(&());
                    if inner.session_active.load(Ordering::SeqCst) {
                        // Full cycle: handshake again, then rebuild and re-offer
                        tokio::spawn(start_connected(Arc::clone(&inner)));
                    }
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[Sender] Channel event loop lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
