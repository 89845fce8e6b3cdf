//! Gapless playback of synthesized audio
//!
//! Inbound chunks are converted to the device format when they are
//! scheduled, then queued. The device thread pulls interleaved float frames
//! through [`AudioPlaybackRenderer::render`], strictly in arrival order.

use super::resample::{output_frames, upmix_interleaved, RateConverter};
use super::{i16_to_f32, AudioChunk, AudioFormat, SampleFormat};
use crate::error::AudioError;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct PlaybackQueue {
    /// Converted buffers, interleaved at the device rate
    buffers: VecDeque<Vec<f32>>,
    /// Read position inside the front buffer
    cursor: usize,
    playing: bool,
    /// Bumped on every flush
    generation: u64,
}

/// FIFO of converted buffers shared by the session and the playback device.
pub struct AudioPlaybackRenderer {
    source: AudioFormat,
    output: AudioFormat,
    /// Kept apart from the queue so converting never stalls `render`
    converter: Mutex<RateConverter>,
    queue: Mutex<PlaybackQueue>,
}

impl AudioPlaybackRenderer {
    /// `source` is the format of inbound chunks (mono 16-bit), `output` the
    /// device format (interleaved).
    pub fn new(source: AudioFormat, output: AudioFormat) -> Result<Self, AudioError> {
        if source.channels != 1 || source.sample_format != SampleFormat::I16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "playback source must be mono 16-bit PCM, got {}",
                source
            )));
        }
        if !output.interleaved || output.channels == 0 || output.sample_rate_hz == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "playback output must be interleaved, got {}",
                output
            )));
        }

        let converter = new_converter(source.sample_rate_hz, output.sample_rate_hz)?;
        Ok(Self {
            source,
            output,
            converter: Mutex::new(converter),
            queue: Mutex::new(PlaybackQueue::default()),
        })
    }

    pub fn source_format(&self) -> AudioFormat {
        self.source
    }

    pub fn output_format(&self) -> AudioFormat {
        self.output
    }

    /// Convert a chunk and append it to the queue. Starts playback when idle.
    ///
    /// The chunk's own sample rate is honored, so a chunk announced at a
    /// different rate than the source format still plays at the right speed.
    pub fn schedule(&self, chunk: &AudioChunk) -> Result<(), AudioError> {
        let format = chunk.format();
        if format.channels != self.source.channels
            || format.sample_format != self.source.sample_format
            || format.sample_rate_hz == 0
        {
            return Err(AudioError::FormatMismatch {
                expected: self.source.to_string(),
                actual: format.to_string(),
            });
        }

        let mono: Vec<f32> = chunk.i16_samples().map(i16_to_f32).collect();
        if mono.is_empty() {
            return Ok(());
        }

        let frames = output_frames(mono.len(), format.sample_rate_hz, self.output.sample_rate_hz);
        if frames == 0 {
            trace!("Dropping {} sample chunk that resamples to nothing", mono.len());
            return Ok(());
        }
        let mut resampled = Vec::with_capacity(frames);
        {
            let mut converter = lock(&self.converter);
            if converter.in_rate() != format.sample_rate_hz {
                debug!("Playback source rate changed to {} Hz", format.sample_rate_hz);
                *converter = new_converter(format.sample_rate_hz, self.output.sample_rate_hz)?;
            }
            converter.process(&mono, &mut resampled)?;
        }

        let converted = if self.output.channels == 1 {
            resampled
        } else {
            let mut interleaved = Vec::with_capacity(frames * self.output.channels as usize);
            upmix_interleaved(&resampled, self.output.channels as usize, &mut interleaved);
            interleaved
        };

        let mut queue = self.lock();
        queue.buffers.push_back(converted);
        if !queue.playing {
            queue.playing = true;
            debug!("Playback started");
        }
        Ok(())
    }

    /// Fill `out` with interleaved device samples, padding with silence once
    /// the queue runs dry. Returns how many samples came from queued audio.
    pub fn render(&self, out: &mut [f32]) -> usize {
        let mut queue = self.lock();
        let mut written = 0;

        while written < out.len() {
            let cursor = queue.cursor;
            let Some(front) = queue.buffers.front() else {
                break;
            };
            let take = (front.len() - cursor).min(out.len() - written);
            out[written..written + take].copy_from_slice(&front[cursor..cursor + take]);
            written += take;

            if cursor + take == front.len() {
                queue.buffers.pop_front();
                queue.cursor = 0;
            } else {
                queue.cursor = cursor + take;
            }
        }

        if queue.buffers.is_empty() && queue.playing {
            queue.playing = false;
            debug!("Playback drained");
        }
        drop(queue);

        out[written..].fill(0.0);
        written
    }

    /// Halt output and discard everything not yet rendered. The renderer
    /// stays ready for new buffers.
    pub fn stop(&self) {
        let mut queue = self.lock();
        let dropped = queue.buffers.len();
        queue.buffers.clear();
        queue.cursor = 0;
        queue.playing = false;
        queue.generation = queue.generation.wrapping_add(1);
        drop(queue);

        lock(&self.converter).reset();
        debug!("Playback flushed ({} buffers dropped)", dropped);
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn queued_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Flush counter; a change tells the device to drop what it has buffered.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackQueue> {
        lock(&self.queue)
    }
}

/// Poison-tolerant lock; both guarded values stay consistent between calls.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Converter from `in_rate`, stepping at most a second of input at a time.
fn new_converter(in_rate: u32, out_rate: u32) -> Result<RateConverter, AudioError> {
    RateConverter::new(in_rate, out_rate, in_rate.max(1) as usize)
}
