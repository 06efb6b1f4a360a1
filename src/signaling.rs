//! Signaling Adapter: control-plane messages over the casting host's relay.
//!
//! The relay carries small opaque JSON payloads keyed by a namespaced
//! message-type string. This module maps the three logical negotiation types
//! (`connected`, `ice`, `offer`) onto that primitive, normalizes the relay's
//! delivery quirks, and owns a per-instance listener registry so that two
//! controllers in one process never share subscribers.
//!
//! Bulk data never traverses this layer; it exists only for negotiation
//! control messages.
//!
//! # Delivery quirks
//!
//! - Sender-side relays may hand payloads over as JSON strings or as
//!   already-parsed objects. [`SignalingAdapter`] parses string payloads
//!   before fanning out.
//! - Receiver-side relays wrap the payload in a `{"data": ...}` envelope.
//!   Adapters built with [`PayloadShape::Wrapped`] unwrap it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

/// Reverse-domain prefix for relay message-type namespaces.
pub const NAMESPACE_PREFIX: &str = "urn:x-cast:com.castdatachannel.";

/// Logical negotiation message types carried over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Liveness probe and its acknowledgment.
    Connected,
    /// A trickled ICE candidate.
    Ice,
    /// An SDP description. The same type carries offers sender→receiver and
    /// answers receiver→sender; roles are asymmetric so there is no ambiguity.
    Offer,
}

impl SignalKind {
    /// All message types, in registration order.
    pub const ALL: [Self; 3] = [Self::Connected, Self::Ice, Self::Offer];

    /// Short type name used as the namespace suffix.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Ice => "ice",
            Self::Offer => "offer",
        }
    }

    /// Fully qualified relay namespace for this type.
    pub fn namespace(self) -> String {
        format!("{NAMESPACE_PREFIX}{}", self.name())
    }
}

/// Shape in which the relay delivers payloads to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Payload arrives directly (possibly as a JSON string — sender side).
    Direct,
    /// Payload arrives wrapped in a `{"data": ...}` envelope (receiver side).
    Wrapped,
}

/// Callback invoked with a normalized JSON payload.
pub type SignalHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// The relay transport collaborator: the casting host's message bus.
///
/// Sends are fire-and-forget; there is no delivery confirmation and no error
/// propagation beyond the implementation's own logging. Multiple listeners per
/// namespace are all active simultaneously.
pub trait RelayTransport: Send + Sync {
    /// Forward a JSON payload tagged with the given namespace.
    fn send_message(&self, namespace: &str, payload: Value);

    /// Register a listener for inbound messages on the given namespace.
    fn add_message_listener(&self, namespace: &str, handler: SignalHandler);
}

struct HandlerEntry {
    handler: SignalHandler,
    /// One-shot entries are removed from the registry when they fire.
    once: bool,
}

struct AdapterShared {
    shape: PayloadShape,
    /// Nullable session handle. On the sender side this is replaced whenever
    /// the host signals a session-state change; `None` makes sends a no-op.
    relay: Mutex<Option<Arc<dyn RelayTransport>>>,
    handlers: Mutex<HashMap<SignalKind, Vec<HandlerEntry>>>,
}

/// Maps logical message types to the relay's send/receive primitive.
///
/// Pure translation plus listener bookkeeping — no negotiation state lives
/// here. The relay handle is passed in explicitly so adapters are independent
/// and testable; nothing in this module is process-global.
pub struct SignalingAdapter {
    shared: Arc<AdapterShared>,
}

impl std::fmt::Debug for SignalingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingAdapter")
            .field("shape", &self.shared.shape)
            .field("has_relay", &self.shared.relay.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .finish()
    }
}

impl SignalingAdapter {
    /// Create an adapter with no relay attached. Sends are dropped until
    /// [`set_relay`](Self::set_relay) provides one.
    pub fn new(shape: PayloadShape) -> Self {
        Self {
            shared: Arc::new(AdapterShared {
                shape,
                relay: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create an adapter bound to a relay from the start (receiver side,
    /// where the platform context outlives the adapter).
    pub fn with_relay(relay: Arc<dyn RelayTransport>, shape: PayloadShape) -> Self {
        let adapter = Self::new(shape);
        adapter.set_relay(Some(relay));
        adapter
    }

    /// Replace the relay handle.
    ///
    /// `None` detaches: sends become no-ops and nothing new is delivered.
    /// A new relay is wired for all three message types; registered handlers
    /// survive the swap, so listeners installed before a session starts fire
    /// once messages begin to arrive.
    pub fn set_relay(&self, relay: Option<Arc<dyn RelayTransport>>) {
        if let Some(ref relay) = relay {
            for kind in SignalKind::ALL {
                let shared = Arc::downgrade(&self.shared);
                relay.add_message_listener(
                    &kind.namespace(),
                    Arc::new(move |payload| {
                        if let Some(shared) = Weak::upgrade(&shared) {
                            dispatch(&shared, kind, payload);
                        }
                    }),
                );
            }
        }
        *self.shared.relay.lock().unwrap_or_else(PoisonError::into_inner) = relay;
    }

    /// Forward `payload` tagged with `kind` over the relay, fire-and-forget.
    ///
    /// A missing relay (no active session) drops the message silently,
    /// matching the bus's own nullable-session semantics.
    pub fn send(&self, kind: SignalKind, payload: Value) {
        let relay = self
            .shared
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match relay {
            Some(relay) => relay.send_message(&kind.namespace(), payload),
            None => log::debug!("[Signaling] No relay attached, dropping {} message", kind.name()),
        }
    }

    /// Register `handler` for every inbound message of type `kind`.
    ///
    /// Registrations accumulate; there are no replacement semantics. Each
    /// handler receives the normalized payload.
    pub fn receive<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.push_entry(kind, Arc::new(handler), false);
    }

    /// Register a one-shot handler: it fires for the next message of type
    /// `kind` and is then deregistered.
    ///
    /// Used for the sender's answer listener so reconnect cycles do not
    /// accumulate stale subscribers.
    pub fn receive_once<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.push_entry(kind, Arc::new(handler), true);
    }

    fn push_entry(&self, kind: SignalKind, handler: SignalHandler, once: bool) {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(HandlerEntry { handler, once });
    }

    /// Number of live handler registrations for `kind`.
    #[cfg(test)]
    pub(crate) fn handler_count(&self, kind: SignalKind) -> usize {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Fan a relay delivery out to all registered handlers.
///
/// The handler snapshot is taken (and one-shots removed) before any handler
/// runs, so a handler may register new listeners without deadlocking and a
/// one-shot can never fire twice.
fn dispatch(shared: &Arc<AdapterShared>, kind: SignalKind, payload: Value) {
    let payload = normalize(shared.shape, payload);

    let to_run: Vec<SignalHandler> = {
        let mut handlers = shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = handlers.get_mut(&kind) else {
            return;
        };
        let snapshot = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
        entries.retain(|e| !e.once);
        snapshot
    };

    for handler in to_run {
        handler(payload.clone());
    }
}

/// Normalize a relay delivery into plain JSON.
///
/// Unwraps the receiver side's `{"data": ...}` envelope, then parses payloads
/// the relay delivered as JSON strings. Unparseable strings pass through
/// untouched so callers see exactly what arrived.
fn normalize(shape: PayloadShape, payload: Value) -> Value {
    let payload = match shape {
        PayloadShape::Wrapped => match payload {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Object(map)),
            other => other,
        },
        PayloadShape::Direct => payload,
    };

    match payload {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    }
}
