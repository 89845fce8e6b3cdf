//! PulseAudio device threads
//!
//! Both directions use the blocking simple API on a dedicated OS thread. The
//! connection is opened on that thread and the outcome reported back before
//! `start` returns, so device errors surface to the caller.

use super::capture::NativeBuffer;
use super::playback::AudioPlaybackRenderer;
use super::{convert_f32_to_i16, AudioFormat, SampleFormat};
use crate::error::AudioError;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Map a device format onto a PulseAudio sample spec.
fn pulse_spec(format: AudioFormat) -> Result<Spec, AudioError> {
    if !format.interleaved {
        return Err(AudioError::UnsupportedFormat(format!(
            "PulseAudio streams are interleaved, got {}",
            format
        )));
    }
    let channels = u8::try_from(format.channels)
        .map_err(|_| AudioError::UnsupportedFormat(format!("too many channels: {}", format)))?;

    let spec = Spec {
        format: match format.sample_format {
            SampleFormat::I16 => Format::S16NE,
            SampleFormat::F32 => Format::FLOAT32NE,
        },
        channels,
        rate: format.sample_rate_hz,
    };
    if !spec.is_valid() {
        return Err(AudioError::UnsupportedFormat(format.to_string()));
    }
    Ok(spec)
}

/// Interleaved samples per block of `duration`.
fn block_samples(format: AudioFormat, duration: Duration) -> usize {
    let frames = (format.sample_rate_hz as u128 * duration.as_millis() / 1000).max(1) as usize;
    frames * format.channels as usize
}

/// A device thread with a shutdown flag.
struct DeviceThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Spawn `name`, open the device with `open` on the new thread and wait
    /// for the result, then hand the device to `run`.
    fn spawn<O, R>(name: &str, open: O, run: R) -> Result<Self, AudioError>
    where
        O: FnOnce() -> Result<Simple, AudioError> + Send + 'static,
        R: FnOnce(Simple, &AtomicBool) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let simple = match open() {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run(simple, &flag);
            })
            .map_err(|e| AudioError::Device(format!("failed to spawn {}: {}", name, e)))?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::Device(format!("{} exited during setup", name))));
        if let Err(e) = opened {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Audio device thread panicked");
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Microphone capture that hands every native block to a tap callback.
pub struct PulseCapture {
    thread: DeviceThread,
    format: AudioFormat,
}

impl PulseCapture {
    /// Open a record stream in `native` format and start delivering blocks of
    /// `block` duration to `tap` on the capture thread.
    pub fn start<F>(
        app_name: &str,
        device: Option<&str>,
        native: AudioFormat,
        block: Duration,
        mut tap: F,
    ) -> Result<Self, AudioError>
    where
        F: FnMut(NativeBuffer<'_>) + Send + 'static,
    {
        let spec = pulse_spec(native)?;
        let app_name = app_name.to_string();
        let device = device.map(str::to_string);
        let samples = block_samples(native, block);

        let open = move || {
            Simple::new(
                None,
                &app_name,
                Direction::Record,
                device.as_deref(),
                "microphone",
                &spec,
                None,
                None,
            )
            .map_err(|e| AudioError::Device(format!("failed to open capture stream: {}", e)))
        };

        let run = move |simple: Simple, shutdown: &AtomicBool| {
            info!("Microphone capture started");
            match native.sample_format {
                SampleFormat::I16 => {
                    let mut buffer = vec![0i16; samples];
                    while !shutdown.load(Ordering::Relaxed) {
                        match simple.read(bytemuck::cast_slice_mut(&mut buffer)) {
                            Ok(()) => tap(NativeBuffer::I16(&buffer)),
                            Err(e) => read_failed(e, block),
                        }
                    }
                }
                SampleFormat::F32 => {
                    let mut buffer = vec![0f32; samples];
                    while !shutdown.load(Ordering::Relaxed) {
                        match simple.read(bytemuck::cast_slice_mut(&mut buffer)) {
                            Ok(()) => tap(NativeBuffer::F32(&buffer)),
                            Err(e) => read_failed(e, block),
                        }
                    }
                }
            }
            info!("Microphone capture stopped");
        };

        let thread = DeviceThread::spawn("livevoice-capture", open, run)?;
        Ok(Self {
            thread,
            format: native,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Stop capturing and release the device. Safe to call more than once.
    pub fn stop(&mut self) {
        self.thread.stop();
    }
}

fn read_failed(reason: impl std::fmt::Display, block: Duration) {
    warn!("Audio read error: {}", reason);
    thread::sleep(block);
}

/// Speaker output that pulls interleaved frames from a renderer.
pub struct PulsePlayback {
    thread: DeviceThread,
    renderer: Arc<AudioPlaybackRenderer>,
}

impl PulsePlayback {
    /// Open a playback stream in the renderer's output format and keep it fed
    /// in blocks of `block` duration until stopped.
    pub fn start(
        app_name: &str,
        device: Option<&str>,
        renderer: Arc<AudioPlaybackRenderer>,
        block: Duration,
    ) -> Result<Self, AudioError> {
        let output = renderer.output_format();
        let spec = pulse_spec(output)?;
        let app_name = app_name.to_string();
        let device = device.map(str::to_string);
        let samples = block_samples(output, block);

        // Keep about two blocks queued in the server so a flush is audible
        // right away.
        let block_bytes = (samples * output.bits_per_sample() as usize / 8) as u32;
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: block_bytes * 2,
            prebuf: block_bytes,
            minreq: block_bytes,
            fragsize: u32::MAX,
        };

        let open = move || {
            Simple::new(
                None,
                &app_name,
                Direction::Playback,
                device.as_deref(),
                "speaker",
                &spec,
                None,
                Some(&attr),
            )
            .map_err(|e| AudioError::Device(format!("failed to open playback stream: {}", e)))
        };

        let source = renderer.clone();
        let run = move |simple: Simple, shutdown: &AtomicBool| {
            info!("Speaker playback started");
            let mut frames = vec![0f32; samples];
            let mut ints = vec![0i16; samples];
            let mut generation = source.generation();

            while !shutdown.load(Ordering::Relaxed) {
                let current = source.generation();
                if current != generation {
                    generation = current;
                    if let Err(e) = simple.flush() {
                        warn!("Failed to flush playback stream: {}", e);
                    } else {
                        debug!("Playback stream flushed");
                    }
                }

                source.render(&mut frames);
                let written = match output.sample_format {
                    SampleFormat::F32 => simple.write(bytemuck::cast_slice(&frames)),
                    SampleFormat::I16 => {
                        convert_f32_to_i16(&frames, &mut ints);
                        simple.write(bytemuck::cast_slice(&ints))
                    }
                };
                if let Err(e) = written {
                    warn!("Audio write error: {}", e);
                    thread::sleep(block);
                }
            }
            info!("Speaker playback stopped");
        };

        let thread = DeviceThread::spawn("livevoice-playback", open, run)?;
        Ok(Self { thread, renderer })
    }

    pub fn renderer(&self) -> &Arc<AudioPlaybackRenderer> {
        &self.renderer
    }

    /// Stop the playback thread. Safe to call more than once.
    pub fn stop(&mut self) {
        self.thread.stop();
    }
}
