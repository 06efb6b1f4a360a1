//! Transfer Manager: flow-controlled delivery over the negotiated channel.
//!
//! Owns the outbound FIFO queue and drains it against the transport's
//! buffered-amount counter, reports per-item progress, and fans inbound
//! messages out to data subscribers. The negotiation controllers attach and
//! detach the live [`DataChannel`] as connections come and go.
//!
//! # Flow control
//!
//! ```text
//! send(item) ──> queue ──┬─ buffered_amount == 0 ──> dispatch immediately
//!                        └─ otherwise ──> wait for BufferedAmountLow,
//!                            then drain while buffered < HIGH_WATERMARK
//! ```
//!
//! Buffered-amount accounting is advisory and owned entirely by the
//! transport; this layer only reads it.
//!
//! # Delivery guarantee
//!
//! At-most-once, no redelivery. Dispatch against a channel that is not open
//! is a no-op (the head item stays queued), and the whole queue is cleared
//! when the controller rebuilds the connection — items pending at disconnect
//! are lost by design.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::CallbackRegistry;
use crate::transport::{DataChannel, DataChannelState};
use crate::ChannelError;

/// Buffered-amount watermark below which the transport fires the low event.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: u64 = 25_000;

/// Drain stops once the transport reports this many bytes buffered.
pub const HIGH_WATERMARK: u64 = 50_000;

/// Poll cadence while waiting for the transport buffer to empty.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default deadline for [`TransferManager::clear_buffer`].
pub const DEFAULT_CLEAR_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Sequencing metadata plus caller payload carried by every outbound item.
///
/// `index` and `length` are embedded by the caller at enqueue time and drive
/// progress reporting; all other payload fields are flattened alongside them
/// on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemValue {
    /// Zero-based position of this item within the overall transfer.
    pub index: u64,
    /// Total number of items in the transfer.
    pub length: u64,
    /// Caller payload fields, flattened into the same JSON object.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

/// A queued outbound payload: `{"value": {"index", "length", ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundItem {
    /// Sequencing metadata and payload.
    pub value: ItemValue,
}

impl OutboundItem {
    /// Create an item with no payload fields.
    pub fn new(index: u64, length: u64) -> Self {
        Self::with_payload(index, length, serde_json::Map::new())
    }

    /// Create an item carrying extra payload fields.
    pub fn with_payload(index: u64, length: u64, payload: serde_json::Map<String, Value>) -> Self {
        Self {
            value: ItemValue {
                index,
                length,
                payload,
            },
        }
    }

    /// Completion fraction after this item is dispatched: `(index+1)/length`.
    pub fn progress(&self) -> f64 {
        if self.value.length == 0 {
            return 1.0;
        }
        (self.value.index + 1) as f64 / self.value.length as f64
    }
}

/// Queues outbound items, drains them under the buffer watermark, reports
/// progress, and delivers inbound messages to subscribers.
pub struct TransferManager {
    queue: Mutex<VecDeque<OutboundItem>>,
    /// The live channel, if any. Shared with in-flight `clear_buffer` futures
    /// so they always observe the current transport.
    channel: Arc<Mutex<Option<Arc<dyn DataChannel>>>>,
    data_callbacks: CallbackRegistry<Value>,
    percentage_callbacks: CallbackRegistry<f64>,
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("pending", &self.pending_count())
            .field("attached", &self.channel_handle().is_some())
            .finish()
    }
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferManager {
    /// Create a manager with no channel attached.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            channel: Arc::new(Mutex::new(None)),
            data_callbacks: CallbackRegistry::new(),
            percentage_callbacks: CallbackRegistry::new(),
        }
    }

    /// Attach the live data channel after negotiation succeeds.
    pub(crate) fn attach(&self, channel: Arc<dyn DataChannel>) {
        *self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(channel);
    }

    /// Drop the channel and clear the queue wholesale (reconnect path).
    /// In-flight items are not re-queued.
    pub(crate) fn reset(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The currently attached channel, if any.
    pub(crate) fn channel_handle(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a callback for inbound messages.
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.data_callbacks.add(callback);
    }

    /// Register a callback for per-item completion fractions.
    pub fn on_percentage<F>(&self, callback: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.percentage_callbacks.add(move |p: &f64| callback(*p));
    }

    /// Enqueue an item for ordered delivery.
    ///
    /// Dispatches immediately only when the transport reports exactly zero
    /// bytes buffered; otherwise the pending watermark-low event drains the
    /// queue.
    pub fn send(&self, item: OutboundItem) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);

        if self.channel_handle().map(|dc| dc.buffered_amount()) == Some(0) {
            self.dispatch_one();
        }
    }

    /// Number of items waiting in the outbound queue.
    pub fn pending_count(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Pop and write exactly one item.
    ///
    /// Returns `false` without touching the queue when no channel is attached
    /// or the channel is not open; the watermark loop uses this to stop.
    fn dispatch_one(&self) -> bool {
        let Some(dc) = self.channel_handle() else {
            return false;
        };
        if dc.ready_state() != DataChannelState::Open {
            return false;
        }
        let Some(item) = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        else {
            return false;
        };

        self.percentage_callbacks.emit(&item.progress());

        match serde_json::to_string(&item) {
            Ok(text) => {
                if let Err(e) = dc.send_text(&text) {
                    log::warn!("[Transfer] Data channel write failed: {e}");
                }
            }
            Err(e) => log::warn!("[Transfer] Failed to serialize outbound item: {e}"),
        }
        true
    }

    /// Watermark-low handler: batch dispatches while the transport stays
    /// under [`HIGH_WATERMARK`] and the queue is non-empty.
    pub(crate) fn drain(&self) {
        loop {
            let Some(dc) = self.channel_handle() else {
                return;
            };
            if dc.buffered_amount() >= HIGH_WATERMARK {
                return;
            }
            if !self.dispatch_one() {
                return;
            }
        }
    }

    /// Write a payload directly, bypassing the queue (receiver role).
    /// Silently dropped when the channel is not open.
    pub(crate) fn send_immediate(&self, payload: &Value) {
        let Some(dc) = self.channel_handle() else {
            return;
        };
        if dc.ready_state() != DataChannelState::Open {
            return;
        }
        match serde_json::to_string(payload) {
            Ok(text) => {
                if let Err(e) = dc.send_text(&text) {
                    log::warn!("[Transfer] Data channel write failed: {e}");
                }
            }
            Err(e) => log::warn!("[Transfer] Failed to serialize payload: {e}"),
        }
    }

    /// Inbound fanout: parse the wire text as JSON and invoke every data
    /// callback in registration order. Non-JSON messages are dropped.
    pub(crate) fn handle_message(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.data_callbacks.emit(&value),
            Err(e) => log::warn!("[Transfer] Dropping non-JSON inbound message: {e}"),
        }
    }

    /// Empty the outbound queue immediately and wait for the transport
    /// buffer to drain.
    ///
    /// The queue is cleared synchronously, before the returned future is
    /// first polled and regardless of its outcome. The future resolves once
    /// the transport's buffered amount observably reaches zero (polled every
    /// 100 ms) or fails with [`ChannelError::Timeout`] after `timeout`
    /// (default 10 s). Items already handed to the transport are not
    /// recalled.
    pub fn clear_buffer(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send + 'static {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let channel = Arc::clone(&self.channel);
        let timeout = timeout.unwrap_or(DEFAULT_CLEAR_TIMEOUT);

        async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let mut poll = tokio::time::interval(DRAIN_POLL_INTERVAL);

            loop {
                tokio::select! {
                    () = &mut deadline => return Err(ChannelError::Timeout),
                    _ = poll.tick() => {
                        let drained = channel
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .as_ref()
                            .is_some_and(|dc| dc.buffered_amount() == 0);
                        if drained {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
