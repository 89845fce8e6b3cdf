//! livevoice - talk to a live model through the default microphone and speaker
//!
//! Reads `GEMINI_API_KEY` (and the optional `LIVEVOICE_*` overrides) from the
//! environment, connects, and streams until Ctrl+C or the connection ends.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use livevoice::{
    AudioPipeline, ConnectionPhase, DeviceConfig, LiveConfig, LiveSession, LoggingListener,
    SessionState,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting livevoice");

    let config = LiveConfig::from_env();
    let devices = DeviceConfig::from_env();

    let mut pipeline = AudioPipeline::new(devices, config.capture_format, config.remote_format)
        .context("invalid audio configuration")?;

    let session = LiveSession::builder(config)
        .renderer(pipeline.renderer())
        .listener(Arc::new(LoggingListener))
        .build()
        .context("failed to create session")?;

    session.connect().await.context("failed to connect")?;
    let mut state = session.subscribe();
    wait_for_ready(&mut state).await?;

    let uplink = session.clone();
    pipeline
        .start(move |chunk| {
            uplink.send_audio(chunk);
        })
        .context("failed to open audio devices")?;
    info!("🎤 Listening, press Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("Stopping");
        }
        _ = state.wait_for(|s| !s.phase.is_active()) => {
            let phase = session.state().phase;
            warn!("Session ended: {}", phase);
        }
    }

    pipeline.stop();
    session.disconnect().await;
    Ok(())
}

/// Wait for the setup handshake to finish.
async fn wait_for_ready(state: &mut watch::Receiver<SessionState>) -> Result<()> {
    let phase = state
        .wait_for(|s| !matches!(s.phase, ConnectionPhase::Connecting | ConnectionPhase::SettingUp))
        .await
        .context("session dropped")?
        .phase
        .clone();
    match phase {
        ConnectionPhase::Ready => Ok(()),
        other => bail!("session did not become ready: {}", other),
    }
}
