//! Live voice session
//!
//! A [`LiveSession`] owns one connection at a time. It drives the connection
//! phases, forwards microphone audio and video frames to the writer task and
//! dispatches server messages to the playback renderer and the listener.
//!
//! Every `connect` and `disconnect` bumps an epoch counter kept under the
//! control mutex. Work started for an older epoch (a slow `connect`, a reader
//! that lost the race with `disconnect`) notices the change and backs out
//! without touching the current state.

use crate::audio::{AudioChunk, AudioFormat, AudioPlaybackRenderer, SampleFormat};
use crate::codec;
use crate::config::LiveConfig;
use crate::error::{Result, SessionError};
use crate::events::{
    InboundEvent, NoopListener, OutboundMessage, ResponseModality, ServerContent, SessionListener,
    SetupParams,
};
use crate::transport::{Connector, FrameSink, FrameStream, WsConnector};
use crate::video::{ImageEncoder, JpegFrameEncoder};
use crate::ws_reader::{run_reader, CancelFlag, ReaderExit};
use crate::ws_writer::SendQueue;
use futures_util::SinkExt;
use image::DynamicImage;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Connection phase of a session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    SettingUp,
    Ready,
    /// The last connection attempt failed
    Error(String),
}

impl ConnectionPhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// A connection is open or being opened.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::SettingUp | Self::Ready)
    }

    /// Allowed phase changes. Phases only move forward within one
    /// connection; `Disconnected` and `Error` start over.
    pub fn can_transition_to(&self, next: &ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        match (self, next) {
            (Disconnected, Connecting) | (Disconnected, Error(_)) => true,
            (Connecting, SettingUp) | (Connecting, Error(_)) | (Connecting, Disconnected) => true,
            (SettingUp, Ready) | (SettingUp, Error(_)) | (SettingUp, Disconnected) => true,
            (Ready, Disconnected) => true,
            (Error(_), Connecting) | (Error(_), Error(_)) | (Error(_), Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::SettingUp => write!(f, "setting up"),
            Self::Ready => write!(f, "ready"),
            Self::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Snapshot of the observable session state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    /// The model is producing audio for the current turn
    pub is_remote_speaking: bool,
}

/// Tasks and queue of the open connection
struct Link {
    outbound: SendQueue,
    cancel: Arc<CancelFlag>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    epoch: u64,
    link: Option<Link>,
}

struct SessionInner {
    config: LiveConfig,
    state: watch::Sender<SessionState>,
    control: Mutex<Control>,
    renderer: Arc<AudioPlaybackRenderer>,
    listener: Arc<dyn SessionListener>,
    encoder: Box<dyn ImageEncoder>,
    connector: Arc<dyn Connector>,
}

impl SessionInner {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn phase(&self) -> ConnectionPhase {
        self.state.borrow().phase.clone()
    }

    /// Publish a phase change. Takes the control guard so state only changes
    /// under the lock.
    fn set_phase(&self, _control: &mut Control, next: ConnectionPhase) {
        self.state.send_if_modified(|state| {
            if state.phase == next {
                return false;
            }
            if !state.phase.can_transition_to(&next) {
                warn!("Ignoring phase change {} -> {}", state.phase, next);
                return false;
            }
            debug!("Session phase {} -> {}", state.phase, next);
            if !next.is_active() {
                state.is_remote_speaking = false;
            }
            state.phase = next;
            true
        });
    }

    fn set_speaking(&self, _control: &mut Control, speaking: bool) {
        self.state.send_if_modified(|state| {
            if state.is_remote_speaking == speaking {
                return false;
            }
            state.is_remote_speaking = speaking;
            true
        });
    }

    /// Move to `next` if `epoch` is still current.
    fn advance(&self, epoch: u64, next: ConnectionPhase) -> bool {
        let mut control = self.lock_control();
        if control.epoch != epoch {
            return false;
        }
        self.set_phase(&mut control, next);
        true
    }

    /// Record a failed connection attempt. A superseded attempt reports
    /// `Cancelled` and leaves the state alone.
    fn connect_failed(&self, epoch: u64, e: SessionError) -> SessionError {
        let mut control = self.lock_control();
        if control.epoch != epoch {
            debug!("Superseded connect failed: {}", e);
            return SessionError::Cancelled;
        }
        error!("Connection failed: {}", e);
        self.set_phase(&mut control, ConnectionPhase::Error(e.to_string()));
        e
    }

    fn setup_params(&self) -> SetupParams {
        SetupParams {
            model: self.config.model.clone(),
            system_instruction: self.config.system_instruction.clone(),
            response_modalities: vec![ResponseModality::Audio],
            voice_name: self.config.voice_name.clone(),
        }
    }

    /// Enqueue a message if the session is ready.
    fn submit(&self, message: OutboundMessage) -> bool {
        let control = self.lock_control();
        if !self.state.borrow().phase.is_ready() {
            trace!("Dropping {} message, session not ready", message.kind());
            return false;
        }
        match &control.link {
            Some(link) => link.outbound.submit(message),
            None => false,
        }
    }

    fn handle_event(&self, epoch: u64, event: InboundEvent) {
        match event {
            InboundEvent::SetupComplete => {
                let mut control = self.lock_control();
                if control.epoch != epoch {
                    return;
                }
                if self.phase() == ConnectionPhase::SettingUp {
                    self.set_phase(&mut control, ConnectionPhase::Ready);
                    info!("✅ Session ready");
                } else {
                    debug!("Ignoring setupComplete outside setup");
                }
            }
            InboundEvent::ServerContent(content) => self.handle_server_content(epoch, content),
            InboundEvent::GoAway => warn!("Server sent goAway, the connection will close soon"),
            InboundEvent::Unrecognized => trace!("Ignoring unrecognized server message"),
        }
    }

    /// State first, then playback, then the listener.
    fn handle_server_content(&self, epoch: u64, content: ServerContent) {
        let interrupted = content.is_interrupted();
        let turn_complete = content.is_turn_complete();
        let has_audio = !content.audio_chunks.is_empty();

        {
            let mut control = self.lock_control();
            if control.epoch != epoch {
                return;
            }
            let speaking = if turn_complete {
                Some(false)
            } else if has_audio {
                Some(true)
            } else if interrupted {
                Some(false)
            } else {
                None
            };
            if let Some(speaking) = speaking {
                self.set_speaking(&mut control, speaking);
            }
        }

        if interrupted {
            info!("✋ Model interrupted, flushing playback");
            self.renderer.stop();
            self.listener.on_interrupted();
        }

        for chunk in &content.audio_chunks {
            if let Err(e) = self.renderer.schedule(chunk) {
                warn!("Dropping received audio: {}", e);
            }
            self.listener.on_audio_received(chunk);
        }

        if turn_complete {
            debug!("Turn complete");
            self.listener.on_turn_complete();
        }
    }

    /// The reader for `epoch` saw the connection end.
    fn transport_lost(&self, epoch: u64) {
        let link = {
            let mut control = self.lock_control();
            if control.epoch != epoch {
                return;
            }
            control.epoch += 1;
            let link = control.link.take();
            self.set_phase(&mut control, ConnectionPhase::Disconnected);
            link
        };
        self.renderer.stop();

        // Dropping the queue lets the writer drain and close the socket
        if let Some(link) = link {
            link.cancel.cancel();
        }
        info!("🔌 Connection lost");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let control = match self.control.get_mut() {
            Ok(control) => control,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(link) = control.link.take() {
            link.cancel.cancel();
        }
    }
}

/// Configures and builds a [`LiveSession`]
pub struct SessionBuilder {
    config: LiveConfig,
    connector: Option<Arc<dyn Connector>>,
    listener: Option<Arc<dyn SessionListener>>,
    encoder: Option<Box<dyn ImageEncoder>>,
    renderer: Option<Arc<AudioPlaybackRenderer>>,
}

impl SessionBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn image_encoder(mut self, encoder: Box<dyn ImageEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Renderer that receives the model's audio, usually the one owned by an
    /// [`AudioPipeline`](crate::audio::AudioPipeline).
    pub fn renderer(mut self, renderer: Arc<AudioPlaybackRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn build(self) -> Result<LiveSession> {
        let renderer = match self.renderer {
            Some(renderer) => renderer,
            None => {
                let remote = self.config.remote_format;
                let output = AudioFormat::new(remote.sample_rate_hz, 1, SampleFormat::F32);
                Arc::new(AudioPlaybackRenderer::new(remote, output)?)
            }
        };
        let encoder = self
            .encoder
            .unwrap_or_else(|| Box::new(JpegFrameEncoder::new(self.config.image_quality)));
        let (state, _) = watch::channel(SessionState::default());

        Ok(LiveSession {
            inner: Arc::new(SessionInner {
                config: self.config,
                state,
                control: Mutex::new(Control::default()),
                renderer,
                listener: self.listener.unwrap_or_else(|| Arc::new(NoopListener)),
                encoder,
                connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
            }),
        })
    }
}

/// Handle to a live voice session. Clones share the same session.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<SessionInner>,
}

impl LiveSession {
    pub fn builder(config: LiveConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            connector: None,
            listener: None,
            encoder: None,
            renderer: None,
        }
    }

    /// Session with the WebSocket connector and no listener.
    pub fn new(config: LiveConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &LiveConfig {
        &self.inner.config
    }

    pub fn renderer(&self) -> &Arc<AudioPlaybackRenderer> {
        &self.inner.renderer
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Open the connection and send the setup message.
    ///
    /// Returns once the setup message is on the wire, before the server has
    /// confirmed it; watch for [`ConnectionPhase::Ready`]. Does nothing while a
    /// connection is already open or opening.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let (epoch, url) = {
            let mut control = inner.lock_control();
            let phase = inner.phase();
            if phase.is_active() {
                debug!("connect() ignored, session is {}", phase);
                return Ok(());
            }
            let url = match inner.config.endpoint() {
                Ok(url) => url,
                Err(e) => {
                    error!("Cannot connect: {}", e);
                    inner.set_phase(&mut control, ConnectionPhase::Error(e.to_string()));
                    return Err(e);
                }
            };
            control.epoch += 1;
            inner.set_phase(&mut control, ConnectionPhase::Connecting);
            (control.epoch, url)
        };

        info!("🔌 Connecting to live API (model {})", inner.config.model);
        let timeout = inner.config.connect_timeout;
        let mut connection = match tokio::time::timeout(timeout, inner.connector.connect(&url)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(inner.connect_failed(epoch, e)),
            Err(_) => return Err(inner.connect_failed(epoch, SessionError::Timeout)),
        };

        if !inner.advance(epoch, ConnectionPhase::SettingUp) {
            close_quietly(connection.sink).await;
            return Err(SessionError::Cancelled);
        }

        let sent = match codec::encode(&OutboundMessage::Setup(inner.setup_params())) {
            Ok(text) => match tokio::time::timeout(timeout, connection.sink.send(Message::text(text))).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SessionError::from(e)),
                Err(_) => Err(SessionError::Timeout),
            },
            Err(e) => Err(SessionError::from(e)),
        };
        if let Err(e) = sent {
            close_quietly(connection.sink).await;
            return Err(inner.connect_failed(epoch, e));
        }
        debug!("📤 Setup sent");

        let superseded = {
            let mut control = inner.lock_control();
            if control.epoch == epoch {
                let (outbound, writer) = SendQueue::spawn(connection.sink);
                let cancel = Arc::new(CancelFlag::new());
                let reader = spawn_reader(Arc::downgrade(inner), epoch, connection.stream, cancel.clone());
                control.link = Some(Link {
                    outbound,
                    cancel,
                    reader,
                    writer,
                });
                None
            } else {
                Some(connection.sink)
            }
        };
        if let Some(sink) = superseded {
            close_quietly(sink).await;
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    /// Close the connection and return to `Disconnected`.
    ///
    /// Stops the reader, lets the writer flush what is queued and send a close
    /// frame, and flushes playback. Safe to call in any phase, any number of
    /// times.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let link = {
            let mut control = inner.lock_control();
            control.epoch += 1;
            let link = control.link.take();
            inner.set_phase(&mut control, ConnectionPhase::Disconnected);
            link
        };
        inner.renderer.stop();

        let Some(Link {
            outbound,
            cancel,
            reader,
            mut writer,
        }) = link
        else {
            return;
        };

        cancel.cancel();
        drop(outbound);
        if let Err(e) = reader.await {
            if e.is_panic() {
                error!("WebSocket reader task panicked");
            }
        }
        if tokio::time::timeout(inner.config.connect_timeout, &mut writer).await.is_err() {
            warn!("WebSocket writer did not finish in time");
            writer.abort();
        }
        info!("🔌 Disconnected");
    }

    /// Queue a microphone chunk. Dropped unless the session is ready; returns
    /// whether it was queued. Never blocks.
    pub fn send_audio(&self, chunk: AudioChunk) -> bool {
        self.inner.submit(OutboundMessage::Audio(chunk))
    }

    /// Encode and queue a video frame. Frames are dropped without encoding
    /// unless the session is ready.
    pub fn send_video_frame(&self, frame: &DynamicImage) -> Result<bool> {
        if !self.inner.phase().is_ready() {
            return Ok(false);
        }
        let jpeg = self.inner.encoder.encode(frame)?;
        Ok(self.send_jpeg_frame(jpeg))
    }

    /// Queue an already encoded JPEG frame.
    pub fn send_jpeg_frame(&self, jpeg: Vec<u8>) -> bool {
        self.inner.submit(OutboundMessage::VideoFrame(jpeg))
    }
}

fn spawn_reader(
    session: Weak<SessionInner>,
    epoch: u64,
    stream: FrameStream,
    cancel: Arc<CancelFlag>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let exit = run_reader(stream, &cancel, |event| {
            if let Some(inner) = session.upgrade() {
                inner.handle_event(epoch, event);
            }
        })
        .await;

        match exit {
            ReaderExit::Cancelled => debug!("WebSocket reader cancelled"),
            ReaderExit::Closed | ReaderExit::Failed(_) => {
                if let Some(inner) = session.upgrade() {
                    inner.transport_lost(epoch);
                }
            }
        }
    })
}

async fn close_quietly(mut sink: FrameSink) {
    if let Err(e) = sink.close().await {
        debug!("Failed to close WebSocket: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::i16_to_f32;
    use crate::config::{DEFAULT_MODEL, DEFAULT_URL};
    use crate::events::{ChannelListener, SessionEvent};
    use crate::transport::testing::{fake_connection, FakeServer, MockConnector};
    use base64::engine::general_purpose;
    use base64::Engine;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        session: LiveSession,
        server: FakeServer,
        connector: Arc<MockConnector>,
        renderer: Arc<AudioPlaybackRenderer>,
        events: mpsc::Receiver<SessionEvent>,
    }

    fn test_renderer() -> Arc<AudioPlaybackRenderer> {
        let output = AudioFormat::new(24_000, 1, SampleFormat::F32);
        Arc::new(AudioPlaybackRenderer::new(AudioFormat::remote(), output).unwrap())
    }

    fn harness() -> Harness {
        let (connection, server) = fake_connection();
        let connector = Arc::new(MockConnector::with(connection));
        let renderer = test_renderer();
        let (listener, events) = ChannelListener::new(16);
        let session = LiveSession::builder(LiveConfig::from_api_key("test-key"))
            .connector(connector.clone())
            .renderer(renderer.clone())
            .listener(Arc::new(listener))
            .build()
            .unwrap();
        Harness {
            session,
            server,
            connector,
            renderer,
            events,
        }
    }

    async fn ready_harness() -> Harness {
        let h = harness();
        h.session.connect().await.unwrap();
        h.server.send_json(json!({"setupComplete": {}}));
        wait_until(&h.session, |s| s.phase.is_ready()).await;
        h
    }

    async fn wait_until(session: &LiveSession, mut condition: impl FnMut(&SessionState) -> bool) {
        let mut rx = session.subscribe();
        let waited = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| condition(s))).await;
        let reached = waited.map(|r| r.is_ok()).unwrap_or(false);
        assert!(reached, "timed out waiting, state is {:?}", session.state());
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "condition never became true");
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for listener")
            .expect("listener channel closed")
    }

    fn mic_chunk() -> AudioChunk {
        AudioChunk::from_i16(&[100; 320], AudioFormat::capture_target())
    }

    fn audio_content(samples: &[i16]) -> serde_json::Value {
        let bytes = AudioChunk::from_i16(samples, AudioFormat::remote()).into_bytes();
        json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {
                    "mimeType": "audio/pcm;rate=24000",
                    "data": general_purpose::STANDARD.encode(bytes)
                }}]}
            }
        })
    }

    #[tokio::test]
    async fn test_connect_without_credentials() {
        let connector = Arc::new(MockConnector::default());
        let session = LiveSession::builder(LiveConfig::default())
            .connector(connector.clone())
            .build()
            .unwrap();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCredentials));
        assert_eq!(session.state().phase, ConnectionPhase::Error("no credentials".to_string()));
        assert!(connector.urls().is_empty());

        session.disconnect().await;
        assert_eq!(session.state().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_setup_sent_then_ready() {
        let h = harness();
        h.session.connect().await.unwrap();
        assert_eq!(h.session.state().phase, ConnectionPhase::SettingUp);
        assert_eq!(h.connector.urls(), vec![format!("{}?key=test-key", DEFAULT_URL)]);

        let frames = h.server.recorded.json();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["setup"]["model"], DEFAULT_MODEL);
        assert_eq!(frames[0]["setup"]["generationConfig"]["responseModalities"], json!(["AUDIO"]));

        h.server.send_json(json!({"setupComplete": {}}));
        wait_until(&h.session, |s| s.phase == ConnectionPhase::Ready).await;

        // Already connected
        h.session.connect().await.unwrap();
        assert_eq!(h.connector.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_media_dropped_until_ready() {
        let h = harness();
        let frame = DynamicImage::new_rgb8(8, 8);
        assert!(!h.session.send_audio(mic_chunk()));

        h.session.connect().await.unwrap();
        assert!(!h.session.send_audio(mic_chunk()));
        assert!(!h.session.send_video_frame(&frame).unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.server.recorded.frames().len(), 1);

        h.server.send_json(json!({"setupComplete": {}}));
        wait_until(&h.session, |s| s.phase.is_ready()).await;
        assert!(h.session.send_audio(mic_chunk()));
        assert!(h.session.send_video_frame(&frame).unwrap());

        h.server.recorded.wait_for_frames(3).await;
        let frames = h.server.recorded.json();
        assert_eq!(frames[1]["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(frames[2]["realtimeInput"]["video"]["mimeType"], "image/jpeg");
    }

    #[tokio::test]
    async fn test_interrupted_flushes_playback() {
        let mut h = ready_harness().await;

        h.server.send_json(audio_content(&[1000; 480]));
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::AudioReceived(_)));
        assert!(h.session.state().is_remote_speaking);
        assert_eq!(h.renderer.queued_buffers(), 1);

        h.server.send_json(json!({"serverContent": {"interrupted": true}}));
        assert_eq!(next_event(&mut h.events).await, SessionEvent::Interrupted);

        let state = h.session.state();
        assert!(!state.is_remote_speaking);
        assert_eq!(state.phase, ConnectionPhase::Ready);
        assert_eq!(h.renderer.queued_buffers(), 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_turn_complete_clears_speaking() {
        let mut h = ready_harness().await;

        h.server.send_json(audio_content(&[500; 240]));
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::AudioReceived(_)));
        assert!(h.session.state().is_remote_speaking);

        h.server.send_json(json!({"serverContent": {"turnComplete": true}}));
        assert_eq!(next_event(&mut h.events).await, SessionEvent::TurnComplete);
        assert!(!h.session.state().is_remote_speaking);
        // Finishing a turn does not cut off what is still playing
        assert_eq!(h.renderer.queued_buffers(), 1);

        // Audio and turnComplete in one message leave the flag cleared
        let mut message = audio_content(&[500; 240]);
        message["serverContent"]["turnComplete"] = json!(true);
        h.server.send_json(message);
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::AudioReceived(_)));
        assert_eq!(next_event(&mut h.events).await, SessionEvent::TurnComplete);
        assert!(!h.session.state().is_remote_speaking);
        assert_eq!(h.renderer.queued_buffers(), 2);
    }

    #[tokio::test]
    async fn test_speaking_follows_latest_event() {
        let mut h = harness();
        h.session.connect().await.unwrap();

        // Interruptions are honored before setup has completed
        h.server.send_json(audio_content(&[700; 240]));
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::AudioReceived(_)));
        assert!(h.session.state().is_remote_speaking);
        h.server.send_json(json!({"serverContent": {"interrupted": true}}));
        assert_eq!(next_event(&mut h.events).await, SessionEvent::Interrupted);
        let state = h.session.state();
        assert_eq!(state.phase, ConnectionPhase::SettingUp);
        assert!(!state.is_remote_speaking);
        assert_eq!(h.renderer.queued_buffers(), 0);

        h.server.send_json(json!({"setupComplete": {}}));
        wait_until(&h.session, |s| s.phase.is_ready()).await;

        // Interruption and new audio in one message: the old audio is
        // flushed, the new audio plays and the model is speaking again
        h.server.send_json(audio_content(&[700; 240]));
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::AudioReceived(_)));
        let mut message = audio_content(&[900; 240]);
        message["serverContent"]["interrupted"] = json!(true);
        h.server.send_json(message);
        assert_eq!(next_event(&mut h.events).await, SessionEvent::Interrupted);
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::AudioReceived(_)));
        assert!(h.session.state().is_remote_speaking);
        assert_eq!(h.renderer.queued_buffers(), 1);
        let mut out = [0.0f32; 4];
        assert_eq!(h.renderer.render(&mut out), 4);
        assert_eq!(out, [i16_to_f32(900); 4]);

        // A repeated setupComplete while ready changes nothing
        h.server.send_json(json!({"setupComplete": {}}));
        h.server.send_json(audio_content(&[100; 240]));
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::AudioReceived(_)));
        let state = h.session.state();
        assert_eq!(state.phase, ConnectionPhase::Ready);
        assert!(state.is_remote_speaking);

        h.server.send_json(json!({"serverContent": {"turnComplete": true}}));
        assert_eq!(next_event(&mut h.events).await, SessionEvent::TurnComplete);
        assert!(!h.session.state().is_remote_speaking);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_end_disconnects() {
        let mut h = ready_harness().await;
        h.server.send_json(audio_content(&[1000; 480]));
        next_event(&mut h.events).await;

        h.server.hang_up();
        wait_until(&h.session, |s| s.phase == ConnectionPhase::Disconnected).await;
        assert!(!h.session.state().is_remote_speaking);
        assert!(!h.session.send_audio(mic_chunk()));

        let recorded = h.server.recorded.clone();
        eventually(|| recorded.is_closed()).await;
        let renderer = h.renderer.clone();
        eventually(|| renderer.queued_buffers() == 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let h = ready_harness().await;
        assert!(h.session.send_audio(mic_chunk()));

        h.session.disconnect().await;
        assert_eq!(h.session.state().phase, ConnectionPhase::Disconnected);
        assert!(h.server.recorded.is_closed());
        // Queued audio is flushed before the close frame
        let frames = h.server.recorded.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.last(), Some(&Message::Close(None)));

        h.session.disconnect().await;
        assert_eq!(h.session.state().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (first, first_server) = fake_connection();
        let (second, second_server) = fake_connection();
        let session = LiveSession::builder(LiveConfig::from_api_key("k"))
            .connector(Arc::new(MockConnector::sequence(vec![first, second])))
            .renderer(test_renderer())
            .build()
            .unwrap();

        session.connect().await.unwrap();
        first_server.send_json(json!({"setupComplete": {}}));
        wait_until(&session, |s| s.phase.is_ready()).await;
        session.disconnect().await;

        session.connect().await.unwrap();
        assert_eq!(session.state().phase, ConnectionPhase::SettingUp);
        assert_eq!(second_server.recorded.json().len(), 1);

        // The old connection no longer affects the session
        first_server.send_json(json!({"setupComplete": {}}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.state().phase, ConnectionPhase::SettingUp);

        second_server.send_json(json!({"setupComplete": {}}));
        wait_until(&session, |s| s.phase.is_ready()).await;
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        let session = LiveSession::builder(LiveConfig::from_api_key("k"))
            .connector(Arc::new(MockConnector::default()))
            .build()
            .unwrap();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed));
        assert_eq!(session.state().phase, ConnectionPhase::Error("connection closed".to_string()));
        assert!(!session.send_audio(mic_chunk()));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let (connection, _server) = fake_connection();
        let (connector, _gate) = MockConnector::gated(connection);
        let config = LiveConfig {
            connect_timeout: Duration::from_millis(50),
            ..LiveConfig::from_api_key("k")
        };
        let session = LiveSession::builder(config).connector(Arc::new(connector)).build().unwrap();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(session.state().phase, ConnectionPhase::Error("connection timed out".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let (connection, server) = fake_connection();
        let (connector, gate) = MockConnector::gated(connection);
        let session = LiveSession::builder(LiveConfig::from_api_key("k"))
            .connector(Arc::new(connector))
            .build()
            .unwrap();

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });
        wait_until(&session, |s| s.phase == ConnectionPhase::Connecting).await;

        session.disconnect().await;
        assert_eq!(session.state().phase, ConnectionPhase::Disconnected);

        gate.notify_one();
        let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(session.state().phase, ConnectionPhase::Disconnected);
        assert!(server.recorded.is_closed());
        assert!(server.recorded.frames().is_empty());
    }

    #[test]
    fn test_phase_transitions() {
        use ConnectionPhase::*;
        let error = || Error("boom".to_string());

        assert!(Disconnected.can_transition_to(&Connecting));
        assert!(Disconnected.can_transition_to(&error()));
        assert!(Connecting.can_transition_to(&SettingUp));
        assert!(SettingUp.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Disconnected));
        assert!(error().can_transition_to(&Connecting));

        // No skipping or going backwards
        assert!(!Disconnected.can_transition_to(&Ready));
        assert!(!Disconnected.can_transition_to(&SettingUp));
        assert!(!Connecting.can_transition_to(&Ready));
        assert!(!SettingUp.can_transition_to(&Connecting));
        assert!(!Ready.can_transition_to(&SettingUp));
        assert!(!Ready.can_transition_to(&error()));
        assert!(!error().can_transition_to(&Ready));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ConnectionPhase::SettingUp.to_string(), "setting up");
        assert_eq!(ConnectionPhase::Error("no credentials".into()).to_string(), "error: no credentials");
    }
}
