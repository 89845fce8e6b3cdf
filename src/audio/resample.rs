//! Band-limited sample rate conversion on top of `rubato`.
//!
//! One [`RateConverter`] per stream keeps the sinc filter history between
//! buffers, so consecutive buffers join without clicks. Every call still emits
//! exactly [`output_frames`] frames for its input.

use crate::error::AudioError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

const SINC_LEN: usize = 128;
const OVERSAMPLING: usize = 128;
/// Relative to the lower of the two Nyquist frequencies
const CUTOFF: f32 = 0.95;

/// Output frame count for `input_frames` converted from `in_rate` to `out_rate`,
/// rounded to the nearest frame.
pub fn output_frames(input_frames: usize, in_rate: u32, out_rate: u32) -> usize {
    if in_rate == 0 {
        return 0;
    }
    (input_frames as f64 * out_rate as f64 / in_rate as f64).round() as usize
}

/// Mono streaming resampler. Equal rates pass samples straight through.
pub struct RateConverter {
    in_rate: u32,
    out_rate: u32,
    max_chunk: usize,
    sinc: Option<SincFixedIn<f32>>,
    scratch: Vec<f32>,
}

impl RateConverter {
    /// `max_chunk` bounds the frames handed to the filter per step; longer
    /// inputs are processed in several steps.
    pub fn new(in_rate: u32, out_rate: u32, max_chunk: usize) -> Result<Self, AudioError> {
        if in_rate == 0 || out_rate == 0 || max_chunk == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "cannot resample {} Hz to {} Hz",
                in_rate, out_rate
            )));
        }

        let (sinc, scratch) = if in_rate == out_rate {
            (None, Vec::new())
        } else {
            let params = SincInterpolationParameters {
                sinc_len: SINC_LEN,
                f_cutoff: CUTOFF,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: OVERSAMPLING,
                window: WindowFunction::BlackmanHarris2,
            };
            let sinc = SincFixedIn::<f32>::new(out_rate as f64 / in_rate as f64, 1.0, params, max_chunk, 1)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            let scratch = vec![0.0; sinc.output_frames_max()];
            (Some(sinc), scratch)
        };

        Ok(Self {
            in_rate,
            out_rate,
            max_chunk,
            sinc,
            scratch,
        })
    }

    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.sinc.is_none()
    }

    /// Most frames a single filter step can produce.
    pub fn output_frames_max(&self) -> usize {
        self.scratch.len()
    }

    /// Resample `input` and append exactly `output_frames(input.len(), ..)`
    /// frames to `out`. The filter delay is absorbed by trimming or holding
    /// the last sample, at most a frame per call.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), AudioError> {
        let target = output_frames(input.len(), self.in_rate, self.out_rate);
        let start = out.len();

        match &mut self.sinc {
            None => out.extend_from_slice(input),
            Some(sinc) => {
                for piece in input.chunks(self.max_chunk) {
                    sinc.set_chunk_size(piece.len())
                        .map_err(|e| AudioError::Resample(e.to_string()))?;
                    let (_, written) = sinc
                        .process_into_buffer(&[piece], &mut [&mut self.scratch[..]], None)
                        .map_err(|e| AudioError::Resample(e.to_string()))?;
                    out.extend_from_slice(&self.scratch[..written]);
                }
            }
        }

        let hold = if out.len() > start { out[out.len() - 1] } else { 0.0 };
        out.resize(start + target, hold);
        Ok(())
    }

    /// Forget the filter history, e.g. after a flush.
    pub fn reset(&mut self) {
        if let Some(sinc) = &mut self.sinc {
            sinc.reset();
        }
    }
}

/// Append `mono` to `out` as interleaved frames with `channels` copies each.
pub fn upmix_interleaved(mono: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.reserve(mono.len() * channels);
    for &sample in mono {
        for _ in 0..channels {
            out.push(sample);
        }
    }
}

#[cfg(test)]
pub(crate) fn sine(freq: f32, rate: u32, frames: usize, offset: usize, amplitude: f32) -> Vec<f32> {
    (offset..offset + frames)
        .map(|i| (i as f32 * freq * std::f32::consts::TAU / rate as f32).sin() * amplitude)
        .collect()
}
