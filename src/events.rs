//! Messages exchanged with the service and events surfaced to the application.

use crate::audio::AudioChunk;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Response modality requested in the setup message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// Parameters of the first message on a connection
#[derive(Debug, Clone, PartialEq)]
pub struct SetupParams {
    pub model: String,
    pub system_instruction: String,
    pub response_modalities: Vec<ResponseModality>,
    pub voice_name: Option<String>,
}

/// A message on its way to the service
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Setup(SetupParams),
    /// Microphone audio in the capture format
    Audio(AudioChunk),
    /// One JPEG-encoded frame
    VideoFrame(Vec<u8>),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::Audio(_) => "audio",
            Self::VideoFrame(_) => "video",
        }
    }
}

/// Content pushed by the service during a turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    pub interrupted: Option<bool>,
    /// Audio parts of the model turn, in order
    pub audio_chunks: SmallVec<[AudioChunk; 2]>,
    pub turn_complete: Option<bool>,
}

impl ServerContent {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted == Some(true)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete == Some(true)
    }
}

/// A decoded message from the service
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SetupComplete,
    ServerContent(ServerContent),
    /// The service is about to close the connection
    GoAway,
    /// Anything that is not one of the above
    Unrecognized,
}

/// Receives session callbacks on the receive task.
///
/// Implementations must return quickly; the next inbound message is not read
/// until the callback returns.
pub trait SessionListener: Send + Sync {
    fn on_audio_received(&self, _chunk: &AudioChunk) {}
    fn on_turn_complete(&self) {}
    fn on_interrupted(&self) {}
}

/// Listener that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Owned form of the listener callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AudioReceived(AudioChunk),
    TurnComplete,
    Interrupted,
}

/// Forwards callbacks into a bounded channel. A full channel drops the event.
pub struct ChannelListener {
    tx: mpsc::Sender<SessionEvent>,
}

impl ChannelListener {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!("Session event channel full, dropping {}", event_name(&event));
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Session event channel closed");
                }
            }
        }
    }
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::AudioReceived(_) => "AudioReceived",
        SessionEvent::TurnComplete => "TurnComplete",
        SessionEvent::Interrupted => "Interrupted",
    }
}

impl SessionListener for ChannelListener {
    fn on_audio_received(&self, chunk: &AudioChunk) {
        self.forward(SessionEvent::AudioReceived(chunk.clone()));
    }

    fn on_turn_complete(&self) {
        self.forward(SessionEvent::TurnComplete);
    }

    fn on_interrupted(&self) {
        self.forward(SessionEvent::Interrupted);
    }
}

/// Logs turn boundaries
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl SessionListener for LoggingListener {
    fn on_audio_received(&self, chunk: &AudioChunk) {
        debug!("🔊 Received {} bytes of audio", chunk.len());
    }

    fn on_turn_complete(&self) {
        info!("✅ Turn complete");
    }

    fn on_interrupted(&self) {
        info!("✋ Model interrupted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    #[test]
    fn test_channel_listener_forwards_in_order() {
        let (listener, mut rx) = ChannelListener::new(4);
        let chunk = AudioChunk::from_i16(&[1, 2, 3], AudioFormat::remote());

        listener.on_audio_received(&chunk);
        listener.on_interrupted();
        listener.on_turn_complete();

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::AudioReceived(chunk));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Interrupted);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::TurnComplete);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_listener_drops_when_full() {
        let (listener, mut rx) = ChannelListener::new(1);
        listener.on_turn_complete();
        listener.on_interrupted();

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::TurnComplete);
        assert!(rx.try_recv().is_err());

        drop(rx);
        // Closed channel is ignored
        listener.on_turn_complete();
    }

    #[test]
    fn test_server_content_flags() {
        let content = ServerContent {
            interrupted: Some(true),
            turn_complete: Some(false),
            ..ServerContent::default()
        };
        assert!(content.is_interrupted());
        assert!(!content.is_turn_complete());
        assert!(!ServerContent::default().is_interrupted());
    }
}
