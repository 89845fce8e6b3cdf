//! Microphone buffer conversion
//!
//! Runs inside the capture device's callback, so it never returns errors and
//! never grows its scratch space: anything it cannot convert is dropped.

use super::resample::{output_frames, RateConverter};
use super::{f32_to_i16, i16_to_f32, AudioChunk, AudioFormat, SampleFormat};
use crate::error::AudioError;
use tracing::trace;

/// Longest buffer accepted per call, in seconds of native audio.
const MAX_BUFFER_SECONDS: usize = 1;

/// A device-native buffer handed over by the capture callback
#[derive(Debug, Clone, Copy)]
pub enum NativeBuffer<'a> {
    I16(&'a [i16]),
    F32(&'a [f32]),
}

impl NativeBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::I16(samples) => samples.len(),
            Self::F32(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn sample(&self, index: usize) -> f32 {
        match self {
            Self::I16(samples) => i16_to_f32(samples[index]),
            Self::F32(samples) => samples[index],
        }
    }
}

/// Converts native microphone buffers into outbound capture chunks.
pub struct AudioCaptureResampler {
    native: AudioFormat,
    target: AudioFormat,
    max_frames: usize,
    converter: RateConverter,
    mono: Vec<f32>,
    resampled: Vec<f32>,
}

impl AudioCaptureResampler {
    /// The target must be interleaved mono 16-bit PCM.
    pub fn new(native: AudioFormat, target: AudioFormat) -> Result<Self, AudioError> {
        if target.channels != 1 || target.sample_format != SampleFormat::I16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "capture target must be mono 16-bit PCM, got {}",
                target
            )));
        }
        if native.sample_rate_hz == 0 || native.channels == 0 || target.sample_rate_hz == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "cannot convert {} to {}",
                native, target
            )));
        }

        let max_frames = native.sample_rate_hz as usize * MAX_BUFFER_SECONDS;
        let converter = RateConverter::new(native.sample_rate_hz, target.sample_rate_hz, max_frames)?;
        let max_out = output_frames(max_frames, native.sample_rate_hz, target.sample_rate_hz)
            + converter.output_frames_max();

        Ok(Self {
            native,
            target,
            max_frames,
            converter,
            mono: Vec::with_capacity(max_frames),
            resampled: Vec::with_capacity(max_out),
        })
    }

    pub fn native_format(&self) -> AudioFormat {
        self.native
    }

    pub fn target_format(&self) -> AudioFormat {
        self.target
    }

    /// True when buffers only need re-encoding, not resampling.
    pub fn is_passthrough(&self) -> bool {
        self.native.same_shape(&self.target)
    }

    /// Convert one buffer. Returns `None` when the buffer is dropped.
    pub fn process(&mut self, input: NativeBuffer<'_>) -> Option<AudioChunk> {
        let channels = self.native.channels as usize;
        if input.len() % channels != 0 {
            trace!("Dropping ragged capture buffer ({} samples, {} ch)", input.len(), channels);
            return None;
        }

        let frames = input.len() / channels;
        if frames == 0 || frames > self.max_frames {
            trace!("Dropping capture buffer of {} frames", frames);
            return None;
        }

        if self.is_passthrough() {
            return Some(self.reencode(input));
        }

        let out_frames = output_frames(frames, self.native.sample_rate_hz, self.target.sample_rate_hz);
        if out_frames == 0 {
            trace!("Capture buffer of {} frames resamples to nothing", frames);
            return None;
        }

        self.mono.clear();
        let scale = 1.0 / channels as f32;
        for frame in 0..frames {
            let mut sum = 0.0f32;
            for ch in 0..channels {
                let index = if self.native.interleaved {
                    frame * channels + ch
                } else {
                    ch * frames + frame
                };
                sum += input.sample(index);
            }
            self.mono.push(sum * scale);
        }

        self.resampled.clear();
        if let Err(e) = self.converter.process(&self.mono, &mut self.resampled) {
            trace!("Dropping capture buffer: {}", e);
            return None;
        }

        let mut data = Vec::with_capacity(out_frames * 2);
        for &sample in &self.resampled {
            data.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
        }
        Some(AudioChunk::new(data, self.target))
    }

    /// Fast path: same rate and channel count, only the encoding changes.
    fn reencode(&self, input: NativeBuffer<'_>) -> AudioChunk {
        let mut data = Vec::with_capacity(input.len() * 2);
        match input {
            NativeBuffer::I16(samples) => {
                for sample in samples {
                    data.extend_from_slice(&sample.to_le_bytes());
                }
            }
            NativeBuffer::F32(samples) => {
                for &sample in samples {
                    data.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
                }
            }
        }
        AudioChunk::new(data, self.target)
    }
}
