//! Writer task owning the send half of a connection.
//!
//! Every outgoing message is encoded and sent here, in submission order.

use crate::codec;
use crate::events::OutboundMessage;
use crate::transport::FrameSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Messages the writer may fall behind by before new ones are dropped,
/// about five seconds of 20 ms audio blocks.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Handle for submitting messages to the writer task.
///
/// Cloning is cheap. The writer drains and closes the connection once every
/// handle has been dropped.
#[derive(Debug, Clone)]
pub struct SendQueue {
    tx: Sender<OutboundMessage>,
    dropped: Arc<AtomicU64>,
}

impl SendQueue {
    /// Start a writer task that owns `sink`.
    pub fn spawn(sink: FrameSink) -> (Self, JoinHandle<()>) {
        Self::with_capacity(sink, SEND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(sink: FrameSink, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(rx, sink));
        let queue = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, handle)
    }

    /// Enqueue without waiting. Works from any thread. Returns false when the
    /// message was dropped: the writer has stopped or is too far behind.
    pub fn submit(&self, message: OutboundMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 {
                    warn!("Send queue full, dropping {} message", message.kind());
                } else {
                    trace!("Send queue full, {} messages dropped so far", dropped);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Messages dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Run the websocket writer task
pub async fn run_writer(mut outgoing_rx: Receiver<OutboundMessage>, mut sink: FrameSink) {
    info!("WebSocket writer task started");
    let mut failures = 0u64;

    while let Some(message) = outgoing_rx.recv().await {
        let kind = message.kind();
        let text = match codec::encode(&message) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} message: {}", kind, e);
                continue;
            }
        };

        match sink.send(Message::text(text)).await {
            Ok(()) => trace!("📤 Sent {} message", kind),
            Err(e) => {
                failures += 1;
                // A dead socket fails every send; only the first one is interesting
                if failures == 1 {
                    warn!("Failed to send {} message: {}", kind, e);
                } else {
                    debug!("Failed to send {} message: {}", kind, e);
                }
            }
        }
    }

    debug!("Send queue closed, closing WebSocket");
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!("Failed to send close frame: {}", e);
    }
    if let Err(e) = sink.close().await {
        debug!("Failed to close WebSocket: {}", e);
    }
    info!("WebSocket writer task shutting down ({} failed sends)", failures);
}
