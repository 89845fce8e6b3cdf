//! Audio formats, chunks and sample conversions
//!
//! Everything that leaves the microphone or arrives from the service is PCM.
//! The capture side produces 16-bit little-endian mono chunks at 16 kHz, and
//! the service answers with 16-bit little-endian mono at 24 kHz. Devices are
//! free to run at whatever rate and channel count they like; the capture
//! resampler and the playback renderer bridge the gap.

pub mod capture;
pub mod device;
pub mod pipeline;
pub mod playback;
pub mod resample;

pub use capture::{AudioCaptureResampler, NativeBuffer};
pub use pipeline::AudioPipeline;
pub use playback::AudioPlaybackRenderer;

use std::fmt;

/// Input rate expected by the service for microphone audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Output rate of the audio the service synthesizes.
pub const REMOTE_SAMPLE_RATE: u32 = 24_000;

/// Largest positive 16-bit sample, used as the scale in both directions.
///
/// Dividing by 32767 rather than 32768 makes `i16::MIN` land slightly below
/// -1.0; the clamp on the way back absorbs it.
const I16_SCALE: f32 = 32767.0;

/// Sample encoding of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    F32,
}

impl SampleFormat {
    pub fn bits_per_sample(&self) -> u16 {
        match self {
            Self::I16 => 16,
            Self::F32 => 32,
        }
    }
}

/// Describes a PCM stream layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Interleaved frames (`LRLR..`) rather than planar (`LL..RR..`)
    pub interleaved: bool,
}

impl AudioFormat {
    /// Interleaved format with the given rate, channel count and encoding.
    pub const fn new(sample_rate_hz: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate_hz,
            channels,
            sample_format,
            interleaved: true,
        }
    }

    /// Same format with planar channel layout.
    pub const fn planar(mut self) -> Self {
        self.interleaved = false;
        self
    }

    /// Format of outbound microphone chunks: mono 16-bit PCM at 16 kHz.
    pub const fn capture_target() -> Self {
        Self::new(CAPTURE_SAMPLE_RATE, 1, SampleFormat::I16)
    }

    /// Format of audio synthesized by the service: mono 16-bit PCM at 24 kHz.
    pub const fn remote() -> Self {
        Self::new(REMOTE_SAMPLE_RATE, 1, SampleFormat::I16)
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.sample_format.bits_per_sample()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample() / 8) as usize
    }

    /// Same rate and channel count; encoding and layout may differ.
    pub fn same_shape(&self, other: &AudioFormat) -> bool {
        self.sample_rate_hz == other.sample_rate_hz && self.channels == other.channels
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}{}",
            self.sample_rate_hz,
            self.channels,
            self.bits_per_sample(),
            match self.sample_format {
                SampleFormat::I16 => "int",
                SampleFormat::F32 => "float",
            },
            if self.interleaved { "" } else { ", planar" }
        )
    }
}

/// An immutable slice of little-endian PCM audio.
///
/// Chunks move between stages by value; nothing mutates one after it has
/// been produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    data: Vec<u8>,
    format: AudioFormat,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self { data, format }
    }

    /// Build a 16-bit chunk from samples.
    pub fn from_i16(samples: &[i16], format: AudioFormat) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self { data, format }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of whole frames in the chunk.
    pub fn frames(&self) -> usize {
        match self.format.bytes_per_frame() {
            0 => 0,
            n => self.data.len() / n,
        }
    }

    /// Decode 16-bit samples. A trailing odd byte is ignored.
    pub fn i16_samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Convert one 16-bit sample to float by dividing by 32767.
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / I16_SCALE
}

/// Convert one float sample to 16 bits: clamp to [-1, 1], scale by 32767,
/// then truncate toward zero.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * I16_SCALE) as i16
}

/// Slice form of [`i16_to_f32`]. Converts `min(src.len(), dst.len())` samples.
pub fn convert_i16_to_f32(src: &[i16], dst: &mut [f32]) -> usize {
    let n = src.len().min(dst.len());
    for (out, &sample) in dst[..n].iter_mut().zip(&src[..n]) {
        *out = i16_to_f32(sample);
    }
    n
}

/// Slice form of [`f32_to_i16`]. Converts `min(src.len(), dst.len())` samples.
pub fn convert_f32_to_i16(src: &[f32], dst: &mut [i16]) -> usize {
    let n = src.len().min(dst.len());
    for (out, &sample) in dst[..n].iter_mut().zip(&src[..n]) {
        *out = f32_to_i16(sample);
    }
    n
}
