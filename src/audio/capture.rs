//! Microphone capture into fixed-size 16 kHz mono blocks.
//!
//! The device callback down-mixes and resamples whatever the hardware
//! delivers, then feeds a [`BlockSink`]. Blocks only leave the sink while
//! its forwarding gate is open; the controller opens the gate once the
//! remote session reports ready.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::resample::{append_downmixed, StreamResampler};
use crate::error::{VoiceError, VoiceResult};

/// One capture block of mono f32 samples at the input rate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    /// Session generation that produced this block.
    pub generation: u64,
}

// ── Block accumulation ─────────────────────────────────────────────

/// Producer half of the capture path, moved into the device callback.
pub struct BlockSink {
    block_size: usize,
    pending: Vec<f32>,
    tx: mpsc::UnboundedSender<AudioChunk>,
    forwarding: Arc<AtomicBool>,
    generation: u64,
}

impl BlockSink {
    pub fn new(block_size: usize, generation: u64, tx: mpsc::UnboundedSender<AudioChunk>) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            tx,
            forwarding: Arc::new(AtomicBool::new(false)),
            generation,
        }
    }

    /// Shared forwarding switch; starts closed.
    pub fn gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.forwarding)
    }

    /// Accumulate samples, emitting a block every `block_size` samples.
    ///
    /// While the gate is closed input is discarded, including any partial
    /// block.
    pub fn push(&mut self, samples: &[f32]) {
        if !self.forwarding.load(Ordering::Acquire) {
            self.pending.clear();
            return;
        }
        for &sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.block_size {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                // Receiver gone means the session was torn down.
                let _ = self.tx.send(AudioChunk {
                    samples: block,
                    generation: self.generation,
                });
            }
        }
    }
}

// ── Capture stream handle ──────────────────────────────────────────

/// A live input device. Dropping it must release the device.
pub trait CaptureDevice: Send {
    fn device_name(&self) -> &str;
    fn release(&mut self);
}

/// Controller-side handle for an acquired microphone.
pub struct CaptureStream {
    forwarding: Arc<AtomicBool>,
    device: Box<dyn CaptureDevice>,
}

impl CaptureStream {
    pub fn new(forwarding: Arc<AtomicBool>, device: Box<dyn CaptureDevice>) -> Self {
        Self { forwarding, device }
    }

    pub fn set_forwarding(&self, enabled: bool) {
        self.forwarding.store(enabled, Ordering::Release);
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Acquire)
    }

    pub fn device_name(&self) -> &str {
        self.device.device_name()
    }

    /// Close the gate and release the device.
    pub fn stop(mut self) {
        self.set_forwarding(false);
        self.device.release();
    }
}

/// Source of microphone streams.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the device and start feeding `sink`.
    ///
    /// Missing devices and refused access map to
    /// [`VoiceError::PermissionDenied`].
    async fn acquire(&self, sink: BlockSink) -> VoiceResult<CaptureStream>;
}

// ── cpal implementation ────────────────────────────────────────────

/// System microphone via cpal.
///
/// cpal streams are not `Send`, so each acquired stream lives on its own
/// thread until released.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    preferred_device: Option<String>,
    target_rate: u32,
}

impl CpalMicrophone {
    pub fn new(preferred_device: Option<String>, target_rate: u32) -> Self {
        Self {
            preferred_device,
            target_rate,
        }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self, sink: BlockSink) -> VoiceResult<CaptureStream> {
        let gate = sink.gate();
        let preferred = self.preferred_device.clone();
        let target_rate = self.target_rate;
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<String>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("jarvis-mic".into())
            .spawn(move || match open_input_stream(preferred.as_deref(), target_rate, sink) {
                Ok((stream, name)) => {
                    if ready_tx.send(Ok(name)).is_err() {
                        // Acquisition was cancelled while we were opening.
                        return;
                    }
                    // Blocks until release() or the handle is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("Microphone stream released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| VoiceError::AudioDevice(format!("failed to spawn capture thread: {e}")))?;

        let name = ready_rx
            .await
            .map_err(|_| VoiceError::AudioDevice("capture thread exited".into()))??;
        tracing::info!(device = %name, rate = target_rate, "Microphone acquired");

        Ok(CaptureStream::new(
            gate,
            Box::new(CpalCaptureDevice {
                name,
                stop_tx: Some(stop_tx),
            }),
        ))
    }
}

struct CpalCaptureDevice {
    name: String,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl CaptureDevice for CpalCaptureDevice {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CpalCaptureDevice {
    fn drop(&mut self) {
        self.release();
    }
}

fn select_input_device(preferred: Option<&str>) -> VoiceResult<cpal::Device> {
    let host = cpal::default_host();
    match preferred {
        Some(name) => host
            .input_devices()
            .map_err(|e| VoiceError::PermissionDenied(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::PermissionDenied(format!("input device '{name}' not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::PermissionDenied("no default input device available".into())),
    }
}

fn open_input_stream(
    preferred: Option<&str>,
    target_rate: u32,
    mut sink: BlockSink,
) -> VoiceResult<(cpal::Stream, String)> {
    let device = select_input_device(preferred)?;
    let name = device
        .name()
        .unwrap_or_else(|_| "unknown input device".to_string());

    let default_config = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            VoiceError::PermissionDenied(format!("'{name}' is not available. {}", mic_permission_hint()))
        }
        other => VoiceError::AudioDevice(other.to_string()),
    })?;
    let format = default_config.sample_format();
    let config: StreamConfig = default_config.into();
    let device_rate = config.sample_rate.0;
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = %name,
        format = ?format,
        device_rate,
        channels,
        target_rate,
        "Opening input stream"
    );

    let err_fn = |err| tracing::warn!(error = %err, "Input stream error");
    let mut mono = Vec::new();
    let mut resampled = Vec::new();
    let mut resampler = StreamResampler::new(device_rate, target_rate);

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                mono.clear();
                append_downmixed(&mut mono, data, channels, |s| s);
                resampled.clear();
                resampler.process(&mono, &mut resampled);
                sink.push(&resampled);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                mono.clear();
                append_downmixed(&mut mono, data, channels, |s| f32::from(s) / 32_768.0);
                resampled.clear();
                resampler.process(&mono, &mut resampled);
                sink.push(&resampled);
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _| {
                mono.clear();
                append_downmixed(&mut mono, data, channels, |s| {
                    (f32::from(s) - 32_768.0) / 32_768.0
                });
                resampled.clear();
                resampler.process(&mono, &mut resampled);
                sink.push(&resampled);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(VoiceError::AudioDevice(format!(
                "unsupported input sample format: {other:?}"
            )))
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            VoiceError::PermissionDenied(format!("'{name}' is not available. {}", mic_permission_hint()))
        }
        other => VoiceError::from(other),
    })?;

    stream.play()?;
    Ok((stream, name))
}

/// Platform-specific pointer to where microphone access is granted.
pub fn mic_permission_hint() -> &'static str {
    if cfg!(target_os = "macos") {
        "Grant access in System Settings > Privacy & Security > Microphone."
    } else if cfg!(target_os = "windows") {
        "Grant access in Settings > Privacy > Microphone."
    } else {
        "Check that the device is connected and not held by another application."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(block: usize) -> (BlockSink, mpsc::UnboundedReceiver<AudioChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BlockSink::new(block, 7, tx), rx)
    }

    #[test]
    fn closed_gate_drops_samples() {
        let (mut sink, mut rx) = sink(4);
        sink.push(&[0.1; 10]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn emits_fixed_size_blocks() {
        let (mut sink, mut rx) = sink(4);
        sink.gate().store(true, Ordering::Release);
        sink.push(&[0.1; 3]);
        assert!(rx.try_recv().is_err());
        sink.push(&[0.2; 6]);
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.samples, vec![0.1, 0.1, 0.1, 0.2]);
        assert_eq!(second.samples.len(), 4);
        assert_eq!(first.generation, 7);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closing_gate_discards_partial_block() {
        let (mut sink, mut rx) = sink(4);
        let gate = sink.gate();
        gate.store(true, Ordering::Release);
        sink.push(&[0.5; 3]);
        gate.store(false, Ordering::Release);
        sink.push(&[0.5]);
        gate.store(true, Ordering::Release);
        sink.push(&[0.0; 4]);
        assert_eq!(rx.try_recv().unwrap().samples, vec![0.0; 4]);
    }

    struct FakeDevice(Arc<AtomicBool>);

    impl CaptureDevice for FakeDevice {
        fn device_name(&self) -> &str {
            "fake"
        }
        fn release(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_closes_gate_and_releases() {
        let released = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(AtomicBool::new(false));
        let stream = CaptureStream::new(Arc::clone(&gate), Box::new(FakeDevice(Arc::clone(&released))));
        stream.set_forwarding(true);
        assert!(gate.load(Ordering::SeqCst));
        assert_eq!(stream.device_name(), "fake");
        stream.stop();
        assert!(!gate.load(Ordering::SeqCst));
        assert!(released.load(Ordering::SeqCst));
    }
}
