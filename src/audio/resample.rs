//! Channel down-mixing and linear-interpolation resampling.
//!
//! Capture devices rarely run at 16 kHz mono, and output devices rarely
//! run at 24 kHz; both directions go through these helpers.

/// Append `data` (interleaved, `channels` wide) to `out` as mono samples.
///
/// Each frame is averaged after `convert` maps the device sample type to f32.
pub fn append_downmixed<T: Copy>(
    out: &mut Vec<f32>,
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> f32,
) {
    let channels = channels.max(1);
    if channels == 1 {
        out.extend(data.iter().map(|&s| convert(s)));
        return;
    }
    for frame in data.chunks_exact(channels) {
        let sum: f32 = frame.iter().map(|&s| convert(s)).sum();
        out.push(sum / channels as f32);
    }
}

/// Resample mono audio from `from_rate` to `to_rate` by linear interpolation.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return input.to_vec();
    }
    let out_len = (input.len() as f64 * f64::from(to_rate) / f64::from(from_rate))
        .round()
        .max(1.0) as usize;
    resample_linear_exact(input, from_rate, to_rate, out_len)
}

/// Like [`resample_linear`], but produces exactly `out_len` samples. Reads
/// past the end of `input` repeat its last sample.
pub fn resample_linear_exact(input: &[f32], from_rate: u32, to_rate: u32, out_len: usize) -> Vec<f32> {
    let Some(last) = input.len().checked_sub(1) else {
        return vec![0.0; out_len];
    };
    let ratio = if from_rate == 0 || to_rate == 0 {
        1.0
    } else {
        f64::from(from_rate) / f64::from(to_rate)
    };

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = ((pos - idx as f64) as f32).clamp(0.0, 1.0);
            let s0 = input[idx];
            let s1 = input[(idx + 1).min(last)];
            s0 + frac * (s1 - s0)
        })
        .collect()
}

/// Linear resampler for a continuous stream delivered in arbitrary pieces.
///
/// The read position and the last input sample carry over between calls,
/// so output length tracks the true rate ratio and interpolation spans
/// buffer boundaries.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    step: f64,
    /// Read position relative to the start of the next input buffer;
    /// `-1.0..0.0` interpolates from `prev`.
    pos: f64,
    prev: Option<f32>,
    passthrough: bool,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let passthrough = from_rate == 0 || to_rate == 0 || from_rate == to_rate;
        Self {
            step: if passthrough {
                1.0
            } else {
                f64::from(from_rate) / f64::from(to_rate)
            },
            pos: 0.0,
            prev: None,
            passthrough,
        }
    }

    /// Resample `input` and append the result to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.passthrough {
            out.extend_from_slice(input);
            return;
        }
        let Some(&last) = input.last() else {
            return;
        };

        let len = input.len() as f64;
        let sample_at = |i: isize, prev: Option<f32>| -> f32 {
            if i < 0 {
                prev.unwrap_or(input[0])
            } else {
                input[i as usize]
            }
        };
        while self.pos < len - 1.0 {
            let idx = self.pos.floor();
            let frac = (self.pos - idx) as f32;
            let s0 = sample_at(idx as isize, self.prev);
            let s1 = sample_at(idx as isize + 1, self.prev);
            out.push(s0 + frac * (s1 - s0));
            self.pos += self.step;
        }

        self.pos -= len;
        self.prev = Some(last);
    }
}
