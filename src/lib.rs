//! livevoice - full-duplex voice sessions with a live multimodal model
//!
//! Microphone audio is captured, converted to 16 kHz mono PCM and streamed
//! over a WebSocket together with optional JPEG video frames. The model's
//! 24 kHz speech is played back as it arrives and flushed when the model is
//! interrupted.

#![forbid(unsafe_code)]

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod transport;
pub mod video;
pub mod ws_reader;
pub mod ws_writer;

pub use audio::{AudioChunk, AudioFormat, AudioPipeline, AudioPlaybackRenderer, SampleFormat};
pub use config::{DeviceConfig, LiveConfig};
pub use error::{AudioError, Result, SessionError};
pub use events::{ChannelListener, LoggingListener, SessionEvent, SessionListener};
pub use session::{ConnectionPhase, LiveSession, SessionBuilder, SessionState};
