//! Output mixing and the cpal speaker.
//!
//! The [`Mixer`] owns the output clock: it counts frames rendered by the
//! device callback and starts each voice on its scheduled frame.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::codec::AudioBuffer;
use super::playback::{AudioSink, SegmentId, Speaker};
use super::resample::resample_linear_exact;
use crate::error::{VoiceError, VoiceResult};

struct Voice {
    id: SegmentId,
    samples: Vec<f32>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sums scheduled voices into the device buffer.
pub struct Mixer {
    sample_rate: u32,
    frames_rendered: Arc<AtomicU64>,
    voices: Vec<Voice>,
    ended: mpsc::UnboundedSender<SegmentId>,
}

impl Mixer {
    pub fn new(sample_rate: u32, ended: mpsc::UnboundedSender<SegmentId>) -> Self {
        Self {
            sample_rate,
            frames_rendered: Arc::new(AtomicU64::new(0)),
            voices: Vec::new(),
            ended,
        }
    }

    /// Shared frame counter, readable without locking the mixer.
    pub fn clock(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames_rendered)
    }

    pub fn current_time(&self) -> f64 {
        frames_to_seconds(self.frames_rendered.load(Ordering::Acquire), self.sample_rate)
    }

    /// Add a voice. The buffer is down-mixed and converted to the mixer rate.
    ///
    /// Start and end frames are both rounded from scheduled times, so a
    /// voice scheduled at the previous one's end begins on the exact frame
    /// where that one stops.
    pub fn add(&mut self, id: SegmentId, buffer: &AudioBuffer, start_at: f64) {
        let mono: Vec<f32> = (0..buffer.frame_count())
            .map(|i| buffer.mixed_sample(i))
            .collect();
        let start_frame = self.seconds_to_frame(start_at);
        let end_frame = self.seconds_to_frame(start_at + buffer.duration());
        let len = usize::try_from(end_frame.saturating_sub(start_frame)).unwrap_or(usize::MAX);
        let samples = resample_linear_exact(&mono, buffer.sample_rate, self.sample_rate, len);
        self.voices.push(Voice {
            id,
            samples,
            start_frame,
        });
    }

    fn seconds_to_frame(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    pub fn remove(&mut self, id: SegmentId) {
        self.voices.retain(|v| v.id != id);
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Render `out.len() / channels` frames, duplicating mono across channels.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let base = self.frames_rendered.load(Ordering::Acquire);
        out.fill(0.0);

        // Voices are indexed by absolute frame, so one added after its start
        // frame has passed joins mid-way instead of playing late.
        for voice in &self.voices {
            for frame in 0..frames {
                let now = base + frame as u64;
                if now < voice.start_frame {
                    continue;
                }
                let Some(&sample) = voice.samples.get((now - voice.start_frame) as usize) else {
                    break;
                };
                for ch in 0..channels {
                    out[frame * channels + ch] += sample;
                }
            }
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        let ended = &self.ended;
        let rendered_to = base + frames as u64;
        self.voices.retain(|v| {
            let done = v.end_frame() <= rendered_to;
            if done {
                let _ = ended.send(v.id);
            }
            !done
        });

        self.frames_rendered.store(rendered_to, Ordering::Release);
    }
}

fn frames_to_seconds(frames: u64, rate: u32) -> f64 {
    if rate == 0 {
        return 0.0;
    }
    frames as f64 / f64::from(rate)
}

// ── cpal speaker ───────────────────────────────────────────────────

/// Default (or named) output device via cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalSpeaker {
    preferred_device: Option<String>,
}

impl CpalSpeaker {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[async_trait]
impl Speaker for CpalSpeaker {
    async fn open(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<SegmentId>,
    ) -> VoiceResult<Box<dyn AudioSink>> {
        let preferred = self.preferred_device.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<OutputHandle>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("jarvis-speaker".into())
            .spawn(move || {
                match open_output_stream(preferred.as_deref(), sample_rate, ended) {
                    Ok((stream, handle)) => {
                        if ready_tx.send(Ok(handle)).is_err() {
                            return;
                        }
                        let _ = stop_rx.recv();
                        drop(stream);
                        tracing::debug!("Output stream released");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| VoiceError::AudioDevice(format!("failed to spawn output thread: {e}")))?;

        let handle = ready_rx
            .await
            .map_err(|_| VoiceError::AudioDevice("output thread exited".into()))??;
        tracing::info!(
            device = %handle.device_name,
            rate = handle.device_rate,
            "Output device opened"
        );

        Ok(Box::new(CpalSink {
            handle,
            stop_tx: Some(stop_tx),
        }))
    }
}

struct OutputHandle {
    mixer: Arc<Mutex<Mixer>>,
    clock: Arc<AtomicU64>,
    device_rate: u32,
    device_name: String,
}

struct CpalSink {
    handle: OutputHandle,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl AudioSink for CpalSink {
    fn current_time(&self) -> f64 {
        frames_to_seconds(self.handle.clock.load(Ordering::Acquire), self.handle.device_rate)
    }

    fn start_segment(&mut self, id: SegmentId, buffer: AudioBuffer, start_at: f64) {
        self.handle.mixer.lock().add(id, &buffer, start_at);
    }

    fn stop_segment(&mut self, id: SegmentId) {
        self.handle.mixer.lock().remove(id);
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            self.handle.mixer.lock().clear();
            let _ = tx.send(());
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_output_stream(
    preferred: Option<&str>,
    requested_rate: u32,
    ended: mpsc::UnboundedSender<SegmentId>,
) -> VoiceResult<(cpal::Stream, OutputHandle)> {
    let host = cpal::default_host();
    let device = match preferred {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::AudioDevice(format!("output device '{name}' not found")))?,
        None => host
            .default_output_device()
            .ok_or_else(|| VoiceError::AudioDevice("no default output device available".into()))?,
    };
    let device_name = device
        .name()
        .unwrap_or_else(|_| "unknown output device".to_string());

    // Prefer running the device at the model's rate; otherwise resample per voice.
    let supported = device
        .supported_output_configs()
        .ok()
        .and_then(|mut configs| {
            configs.find(|c| {
                c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate().0 <= requested_rate
                    && c.max_sample_rate().0 >= requested_rate
            })
        })
        .map(|c| c.with_sample_rate(cpal::SampleRate(requested_rate)));
    let supported = match supported {
        Some(c) => c,
        None => device
            .default_output_config()
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?,
    };

    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let device_rate = config.sample_rate.0;
    let channels = usize::from(config.channels.max(1));

    let mixer = Arc::new(Mutex::new(Mixer::new(device_rate, ended)));
    let clock = mixer.lock().clock();
    let err_fn = |err| tracing::warn!(error = %err, "Output stream error");

    let stream = match format {
        SampleFormat::F32 => {
            let mixer = Arc::clone(&mixer);
            device.build_output_stream(
                &config,
                move |out: &mut [f32], _| mixer.lock().render(out, channels),
                err_fn,
                None,
            )?
        }
        SampleFormat::I16 => {
            let mixer = Arc::clone(&mixer);
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |out: &mut [i16], _| {
                    scratch.resize(out.len(), 0.0);
                    mixer.lock().render(&mut scratch, channels);
                    for (dst, src) in out.iter_mut().zip(&scratch) {
                        *dst = (src * 32_767.0) as i16;
                    }
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::U16 => {
            let mixer = Arc::clone(&mixer);
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |out: &mut [u16], _| {
                    scratch.resize(out.len(), 0.0);
                    mixer.lock().render(&mut scratch, channels);
                    for (dst, src) in out.iter_mut().zip(&scratch) {
                        *dst = ((src * 32_767.0) + 32_768.0) as u16;
                    }
                },
                err_fn,
                None,
            )?
        }
        other => {
            return Err(VoiceError::AudioDevice(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    };
    stream.play()?;

    Ok((
        stream,
        OutputHandle {
            mixer,
            clock,
            device_rate,
            device_name,
        },
    ))
}
