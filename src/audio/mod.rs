//! Audio I/O for live voice sessions.
//!
//! - `codec`: PCM, base64 and WAV conversions
//! - `capture`: microphone → fixed 16 kHz mono blocks
//! - `playback`: gapless scheduling on the output clock
//! - `mixer`: output rendering and the cpal speaker
//! - `resample`: down-mixing and rate conversion

pub mod capture;
pub mod codec;
pub mod mixer;
pub mod playback;
pub mod resample;

pub use capture::{AudioChunk, BlockSink, CaptureStream, CpalMicrophone, Microphone};
pub use codec::{AudioBuffer, EncodedBlob};
pub use mixer::{CpalSpeaker, Mixer};
pub use playback::{AudioSink, PlaybackScheduler, ScheduledSegment, SegmentId, Speaker};

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::VoiceResult;

/// Names of the devices cpal can see, for `jarvis devices`.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

pub fn list_devices() -> VoiceResult<DeviceList> {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()?
        .filter_map(|d| d.name().ok())
        .collect();
    let outputs = host
        .output_devices()?
        .filter_map(|d| d.name().ok())
        .collect();
    Ok(DeviceList {
        inputs,
        outputs,
        default_input: host.default_input_device().and_then(|d| d.name().ok()),
        default_output: host.default_output_device().and_then(|d| d.name().ok()),
    })
}
