//! Receive loop for one connection.

use crate::codec;
use crate::events::InboundEvent;
use crate::transport::FrameStream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// One-shot cancellation signal shared between a session and its tasks.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Why a receive loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// Cancelled locally
    Cancelled,
    /// Close frame or end of stream
    Closed,
    /// Transport error
    Failed(String),
}

/// Read frames until cancelled or the connection ends, handing each decoded
/// message to `on_event` in arrival order.
pub async fn run_reader<F>(mut stream: FrameStream, cancel: &CancelFlag, mut on_event: F) -> ReaderExit
where
    F: FnMut(InboundEvent),
{
    debug!("WebSocket reader task started");

    loop {
        if cancel.is_cancelled() {
            return ReaderExit::Cancelled;
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReaderExit::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                trace!("📥 Received text frame ({} bytes)", text.len());
                on_event(codec::decode(text.as_str()));
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    trace!("📥 Received binary frame ({} bytes)", bytes.len());
                    on_event(codec::decode(text));
                }
                Err(_) => debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed by server: {:?}", frame);
                return ReaderExit::Closed;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive error: {}", e);
                return ReaderExit::Failed(e.to_string());
            }
            None => {
                info!("WebSocket stream ended");
                return ReaderExit::Closed;
            }
        }
    }
}
