//! Receiver-side negotiation controller.
//!
//! The receiver is purely reactive: it answers liveness probes, answers
//! offers, applies trickled ICE candidates, and adopts whatever data channel
//! the sender creates. When that channel closes it discards the peer
//! connection, builds a fresh one, and waits for the next offer.
//!
//! ```text
//! Idle -> AwaitingOffer -> Answering -> Open
//!            ^                           |
//!            `------ channel close -----'
//! ```
//!
//! Relay listeners are registered once, on construction, and route to the
//! current peer connection; rebuilds swap the connection underneath them
//! instead of re-registering.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use crate::events::CallbackRegistry;
use crate::signaling::{PayloadShape, RelayTransport, SignalKind, SignalingAdapter};
use crate::transfer::TransferManager;
use crate::transport::{
    DataChannel, DataChannelEvent, IceCandidate, PeerConnection, PeerConnector, PeerEvent,
    SessionDescription,
};

/// Startup configuration forwarded to the host platform.
///
/// [`CastReceiver::start`] augments the namespace registrations with the
/// three negotiation message types before handing it over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    /// Relay namespace to message-encoding registrations (`"JSON"` for every
    /// namespace this crate uses).
    pub custom_namespaces: BTreeMap<String, String>,
    /// Host-specific startup options, forwarded untouched.
    pub extra: serde_json::Map<String, Value>,
}

/// The host platform collaborator on the receiver side: the relay plus the
/// application startup entry point.
pub trait ReceiverPlatform: RelayTransport {
    /// Start the host application with the given configuration.
    fn start(&self, options: StartOptions);
}

struct ReceiverInner {
    platform: Arc<dyn ReceiverPlatform>,
    connector: Arc<dyn PeerConnector>,
    adapter: SignalingAdapter,
    transfer: TransferManager,
    connected: CallbackRegistry<()>,
    disconnected: CallbackRegistry<()>,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    /// Bumped on every rebuild; event loops for older generations exit.
    generation: watch::Sender<u64>,
}

impl ReceiverInner {
    fn current_peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The receiver endpoint: answer-side negotiation plus inbound message
/// fanout over the adopted data channel.
///
/// Must be created and driven inside a Tokio runtime; negotiation work runs
/// on spawned tasks.
pub struct CastReceiver {
    inner: Arc<ReceiverInner>,
}

impl std::fmt::Debug for CastReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CastReceiver")
            .field("has_peer", &self.inner.current_peer().is_some())
            .field(
                "has_channel",
                &self.inner.transfer.channel_handle().is_some(),
            )
            .finish()
    }
}

impl CastReceiver {
    /// Create a receiver bound to the host platform and build the first peer
    /// connection, ready for the sender's offer.
    pub fn new<P>(platform: Arc<P>, connector: Arc<dyn PeerConnector>) -> Self
    where
        P: ReceiverPlatform + 'static,
    {
        let adapter = SignalingAdapter::with_relay(
            Arc::clone(&platform) as Arc<dyn RelayTransport>,
            PayloadShape::Wrapped,
        );
        let (generation, _) = watch::channel(0u64);
        let inner = Arc::new(ReceiverInner {
            platform,
            connector,
            adapter,
            transfer: TransferManager::new(),
            connected: CallbackRegistry::new(),
            disconnected: CallbackRegistry::new(),
            peer: Mutex::new(None),
            generation,
        });

        // Liveness probes are echoed straight back
        {
            let weak = Arc::downgrade(&inner);
            inner.adapter.receive(SignalKind::Connected, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.adapter.send(SignalKind::Connected, json!({}));
                }
            });
        }

        {
            let weak = Arc::downgrade(&inner);
            inner.adapter.receive(SignalKind::Ice, move |payload| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let candidate: IceCandidate = match serde_json::from_value(payload) {
                    Ok(c) => c,
                    Err(e) => {
                        log::debug!("[Receiver] Dropping malformed ICE candidate: {e}");
                        return;
                    }
                };
                if let Some(peer) = inner.current_peer() {
                    tokio::spawn(async move {
                        if let Err(e) = peer.add_ice_candidate(candidate).await {
                            log::warn!("[Receiver] Failed to add ICE candidate: {e}");
                        }
                    });
                }
            });
        }

        {
            let weak = Arc::downgrade(&inner);
            inner.adapter.receive(SignalKind::Offer, move |payload| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let offer: SessionDescription = match serde_json::from_value(payload) {
                    Ok(desc) => desc,
                    Err(e) => {
                        log::warn!("[Receiver] Dropping malformed offer: {e}");
                        return;
                    }
                };
                tokio::spawn(answer_offer(inner, offer));
            });
        }

        setup_rtc(&inner);
        Self { inner }
    }

    /// Start the host application, registering the negotiation namespaces on
    /// top of the caller's configuration.
    pub fn start(&self, mut options: StartOptions) {
        for kind in SignalKind::ALL {
            options
                .custom_namespaces
                .insert(kind.namespace(), "JSON".to_string());
        }
        self.inner.platform.start(options);
    }

    /// Write a payload to the data channel immediately. Silently dropped when
    /// no channel is open.
    pub fn send(&self, payload: &Value) {
        self.inner.transfer.send_immediate(payload);
    }

    /// Register a callback for inbound data-channel messages.
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.transfer.on_data(callback);
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

    /// Close the current data channel, if any. The close propagates through
    /// the usual disconnect handling.
    pub fn close(&self) {
        if let Some(dc) = self.inner.transfer.channel_handle() {
            dc.close();
        }
    }
}

/// Apply a remote offer and send back the local answer. Each failing step is
/// logged and ends the attempt; the next offer supersedes naturally.
async fn answer_offer(inner: Arc<ReceiverInner>, offer: SessionDescription) {
    let Some(pc) = inner.current_peer() else {
        return;
    };

    if let Err(e) = pc.set_remote_description(offer).await {
        log::warn!("[Receiver] Failed to set remote description: {e}");
        return;
    }
    let answer = match pc.create_answer().await {
        Ok(answer) => answer,
        Err(e) => {
            log::warn!("[Receiver] Failed to create answer: {e}");
            return;
        }
    };
    if let Err(e) = pc.set_local_description(answer.clone()).await {
        log::warn!("[Receiver] Failed to set local description: {e}");
        return;
    }
    match serde_json::to_value(&answer) {
        Ok(payload) => inner.adapter.send(SignalKind::Offer, payload),
        Err(e) => log::warn!("[Receiver] Failed to serialize answer: {e}"),
    }
}

/// Replace the peer connection and start the event loop for the new
/// generation. The receiver waits for the sender to open the data channel.
fn setup_rtc(inner: &Arc<ReceiverInner>) {
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
    *inner
        .peer
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&pc));

    // Subscribe before spawning so events emitted before the task first
    // runs are not lost.
    let events = pc.subscribe();
    tokio::spawn(run_peer_events(Arc::clone(inner), events, generation));
}

/// Peer-connection event loop: forward gathered ICE candidates outward and
/// adopt the sender-created data channel.
async fn run_peer_events(
    inner: Arc<ReceiverInner>,
    mut events: broadcast::Receiver<PeerEvent>,
    generation: u64,
) {
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
                        Err(e) => log::warn!("[Receiver] Failed to serialize ICE candidate: {e}"),
                    }
                }
                Ok(PeerEvent::IceCandidate(None)) => {}
                Ok(PeerEvent::DataChannel(dc)) => {
                    log::info!("[Receiver] Adopted data channel \"{}\"", dc.label());
                    inner.transfer.attach(Arc::clone(&dc));
                    tokio::spawn(run_channel_events(Arc::clone(&inner), dc, generation));
                }
                // Reconnection is driven by channel close, not connection state
                Ok(PeerEvent::ConnectionStateChange(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[Receiver] Peer event loop lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Data-channel event loop: open/close notifications and inbound fanout.
/// A close rebuilds the peer connection and waits for a new offer.
async fn run_channel_events(
    inner: Arc<ReceiverInner>,
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
                    log::info!("[Receiver] Data channel open");
                    inner.connected.emit(&());
                }
                Ok(DataChannelEvent::Message(text)) => inner.transfer.handle_message(&text),
                Ok(DataChannelEvent::BufferedAmountLow) => {}
                Ok(DataChannelEvent::Close) => {
                    log::info!("[Receiver] Data channel closed, rebuilding");
                    setup_rtc(&inner);
                    inner.disconnected.emit(&());
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[Receiver] Channel event loop lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
