//! WebSocket connection seam
//!
//! The session only sees a boxed frame sink and a boxed frame stream, so the
//! real `tokio-tungstenite` socket and in-memory test doubles are
//! interchangeable.

use crate::error::Result;
use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Write half of a connection
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of a connection
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

/// An open, full-duplex connection
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections to the service
pub trait Connector: Send + Sync {
    /// `url` carries the API key and must never be logged.
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection>>;
}

/// Connector backed by `tokio_tungstenite::connect_async` (TLS via native-tls)
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            debug!("Opening WebSocket connection");
            let (ws, response) = connect_async(url).await?;
            debug!("WebSocket handshake complete (HTTP {})", response.status());

            let (sink, stream) = ws.split();
            Ok(Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}
