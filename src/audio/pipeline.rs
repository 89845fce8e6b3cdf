//! Microphone and speaker wired together.

use super::capture::AudioCaptureResampler;
use super::device::{PulseCapture, PulsePlayback};
use super::playback::AudioPlaybackRenderer;
use super::{AudioChunk, AudioFormat};
use crate::config::DeviceConfig;
use crate::error::AudioError;
use std::sync::Arc;
use tracing::info;

/// Owns the capture and playback devices of one voice session.
///
/// `start` and `stop` acquire and release the devices and may be called any
/// number of times. Flushing queued speech is the renderer's `stop`, which
/// leaves the devices running.
pub struct AudioPipeline {
    config: DeviceConfig,
    capture_target: AudioFormat,
    renderer: Arc<AudioPlaybackRenderer>,
    capture: Option<PulseCapture>,
    playback: Option<PulsePlayback>,
}

impl AudioPipeline {
    /// Validate the formats and build the renderer. No device is opened yet.
    pub fn new(
        config: DeviceConfig,
        capture_target: AudioFormat,
        remote: AudioFormat,
    ) -> Result<Self, AudioError> {
        AudioCaptureResampler::new(config.capture_native, capture_target)?;
        let renderer = Arc::new(AudioPlaybackRenderer::new(remote, config.playback)?);

        Ok(Self {
            config,
            capture_target,
            renderer,
            capture: None,
            playback: None,
        })
    }

    /// Renderer fed by the session and drained by the speaker.
    pub fn renderer(&self) -> Arc<AudioPlaybackRenderer> {
        self.renderer.clone()
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_some()
    }

    /// Open both devices. Every converted microphone chunk is passed to
    /// `on_chunk` on the capture thread. Does nothing if already running.
    pub fn start<F>(&mut self, mut on_chunk: F) -> Result<(), AudioError>
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }

        if self.playback.is_none() {
            self.playback = Some(PulsePlayback::start(
                &self.config.app_name,
                self.config.playback_device.as_deref(),
                self.renderer.clone(),
                self.config.block_duration,
            )?);
        }

        let mut resampler = AudioCaptureResampler::new(self.config.capture_native, self.capture_target)?;
        let capture = PulseCapture::start(
            &self.config.app_name,
            self.config.capture_device.as_deref(),
            self.config.capture_native,
            self.config.block_duration,
            move |buffer| {
                if let Some(chunk) = resampler.process(buffer) {
                    on_chunk(chunk);
                }
            },
        );

        match capture {
            Ok(capture) => {
                info!(
                    "Audio pipeline running (capture {} -> {}, playback {})",
                    capture.format(),
                    self.capture_target,
                    self.config.playback
                );
                self.capture = Some(capture);
                Ok(())
            }
            Err(e) => {
                if let Some(mut playback) = self.playback.take() {
                    playback.stop();
                }
                Err(e)
            }
        }
    }

    /// Close both devices and drop pending playback. Safe to call at any time.
    pub fn stop(&mut self) {
        let was_running = self.capture.is_some() || self.playback.is_some();
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        self.renderer.stop();
        if was_running {
            info!("Audio pipeline stopped");
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;

    #[test]
    fn test_stop_without_start_is_harmless() {
        let mut pipeline = AudioPipeline::new(
            DeviceConfig::default(),
            AudioFormat::capture_target(),
            AudioFormat::remote(),
        )
        .unwrap();
        assert!(!pipeline.is_running());

        pipeline.renderer().schedule(&AudioChunk::from_i16(&[100; 48], AudioFormat::remote())).unwrap();
        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.renderer().queued_buffers(), 0);
    }

    #[test]
    fn test_new_rejects_bad_formats() {
        let stereo_target = AudioFormat::new(16_000, 2, SampleFormat::I16);
        assert!(AudioPipeline::new(DeviceConfig::default(), stereo_target, AudioFormat::remote()).is_err());

        let planar_speaker = DeviceConfig {
            playback: AudioFormat::new(48_000, 2, SampleFormat::F32).planar(),
            ..DeviceConfig::default()
        };
        assert!(AudioPipeline::new(planar_speaker, AudioFormat::capture_target(), AudioFormat::remote()).is_err());
    }
}
