//! PCM and base64 conversions between the device and the wire.
//!
//! Outbound: f32 samples → clamped i16 little-endian → base64.
//! Inbound: base64 → i16 little-endian → f32 in `[-1, 1)`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{VoiceError, VoiceResult};

/// MIME type attached to every outbound capture block.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// Scale between normalized f32 samples and i16 PCM.
const PCM16_SCALE: f32 = 32768.0;

/// Base64 payload plus its MIME type, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBlob {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Decoded multi-channel audio at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// One `Vec` per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Average of all channels for one frame.
    pub fn mixed_sample(&self, frame: usize) -> f32 {
        let n = self.channels.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .channels
            .iter()
            .map(|ch| ch.get(frame).copied().unwrap_or(0.0))
            .sum();
        sum / n as f32
    }
}

// ── base64 ─────────────────────────────────────────────────────────

/// Standard base64 with padding.
pub fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> VoiceResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| VoiceError::MalformedInput(format!("invalid base64: {e}")))
}

// ── PCM ────────────────────────────────────────────────────────────

/// Convert normalized samples to i16 little-endian bytes.
///
/// Values outside `[-1, 1)` saturate at the i16 bounds.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32);
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    out
}

/// Encode one capture block for the outbound stream.
pub fn encode_chunk(samples: &[f32]) -> EncodedBlob {
    EncodedBlob {
        data: encode(&float_to_pcm16(samples)),
        mime_type: INPUT_AUDIO_MIME.to_string(),
    }
}

/// Interpret `bytes` as interleaved i16 little-endian PCM.
///
/// An odd trailing byte is ignored, as is any trailing partial frame when
/// `channels > 1`.
pub fn decode_audio_data(bytes: &[u8], sample_rate: u32, channels: usize) -> AudioBuffer {
    let channels = channels.max(1);
    let total_samples = bytes.len() / 2;
    let frames = total_samples / channels;

    let mut out: Vec<Vec<f32>> = (0..channels).map(|_| Vec::with_capacity(frames)).collect();
    for (i, pair) in bytes.chunks_exact(2).take(frames * channels).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels].push(f32::from(value) / PCM16_SCALE);
    }

    AudioBuffer {
        channels: out,
        sample_rate,
    }
}

/// Decode a base64 PCM payload straight into an [`AudioBuffer`].
pub fn decode_payload(b64: &str, sample_rate: u32, channels: usize) -> VoiceResult<AudioBuffer> {
    let bytes = decode(b64)?;
    Ok(decode_audio_data(&bytes, sample_rate, channels))
}

// ── WAV container ──────────────────────────────────────────────────

/// Serialize a buffer as a 16-bit PCM WAV file.
pub fn encode_wav(buffer: &AudioBuffer) -> VoiceResult<Vec<u8>> {
    let channels = u16::try_from(buffer.channel_count().max(1))
        .map_err(|_| VoiceError::MalformedInput("too many channels".into()))?;
    let spec = hound::WavSpec {
        channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for frame in 0..buffer.frame_count() {
            for ch in &buffer.channels {
                let scaled = (ch[frame] * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32);
                writer.write_sample(scaled as i16)?;
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Parse a WAV file (16-bit integer or 32-bit float) into an [`AudioBuffer`].
pub fn decode_wav(bytes: &[u8]) -> VoiceResult<AudioBuffer> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| f32::from(v) / PCM16_SCALE))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(VoiceError::MalformedInput(format!(
                "unsupported WAV sample format {format:?}/{bits}-bit"
            )))
        }
    };

    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(interleaved.len() / channels); channels];
    for (i, sample) in interleaved.into_iter().enumerate() {
        out[i % channels].push(sample);
    }
    Ok(AudioBuffer {
        channels: out,
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        for bytes in [&[][..], &[0u8][..], &[1, 2, 3][..], &[255, 0, 128, 7][..]] {
            assert_eq!(decode(&encode(bytes)).unwrap(), bytes);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode("not*base64!"),
            Err(VoiceError::MalformedInput(_))
        ));
    }

    #[test]
    fn decode_audio_data_even_length() {
        let buf = decode_audio_data(&[0, 0, 0, 0x40, 0, 0x80, 0xff, 0x7f], 24_000, 1);
        assert_eq!(buf.frame_count(), 4);
        assert_eq!(buf.channels[0][0], 0.0);
        assert_eq!(buf.channels[0][1], 0.5);
        assert_eq!(buf.channels[0][2], -1.0);
        assert!((buf.channels[0][3] - 32767.0 / 32768.0).abs() < f32::EPSILON);
    }

    #[test]
    fn decode_audio_data_drops_odd_byte() {
        let buf = decode_audio_data(&[0, 0x40, 0, 0x40, 9], 24_000, 1);
        assert_eq!(buf.frame_count(), 2);
        assert!(decode_audio_data(&[7], 24_000, 1).is_empty());
        assert!(decode_audio_data(&[], 24_000, 1).is_empty());
    }

    #[test]
    fn decode_audio_data_deinterleaves() {
        // L=0.5, R=-0.5, then a dangling left sample.
        let buf = decode_audio_data(&[0, 0x40, 0, 0xc0, 0, 0x40], 16_000, 2);
        assert_eq!(buf.channel_count(), 2);
        assert_eq!(buf.frame_count(), 1);
        assert_eq!(buf.channels[0], vec![0.5]);
        assert_eq!(buf.channels[1], vec![-0.5]);
    }

    #[test]
    fn duration_uses_sample_rate() {
        let buf = AudioBuffer::mono(vec![0.0; 12_000], 24_000);
        assert!((buf.duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn float_to_pcm16_clamps() {
        let bytes = float_to_pcm16(&[0.0, 0.5, -1.0, 1.0, 2.0, -3.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![0, 16384, -32768, 32767, 32767, -32768]);
    }

    #[test]
    fn encode_chunk_tags_mime() {
        let blob = encode_chunk(&[0.25; 4]);
        assert_eq!(blob.mime_type, INPUT_AUDIO_MIME);
        assert_eq!(decode(&blob.data).unwrap().len(), 8);
        let json = serde_json::to_string(&blob).unwrap();
        assert!(json.contains("\"mimeType\""));
    }

    #[test]
    fn capture_then_playback_preserves_samples() {
        let samples = [0.0, 0.25, -0.25, 0.5];
        let blob = encode_chunk(&samples);
        let buf = decode_payload(&blob.data, 16_000, 1).unwrap();
        assert_eq!(buf.channels[0], samples);
    }

    #[test]
    fn wav_round_trip() {
        let buf = AudioBuffer::mono(vec![0.0, 0.5, -0.5, 0.25], 24_000);
        let wav = encode_wav(&buf).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        let back = decode_wav(&wav).unwrap();
        assert_eq!(back, buf);
    }

    #[test]
    fn decode_wav_rejects_junk() {
        assert!(matches!(
            decode_wav(b"definitely not a wav"),
            Err(VoiceError::MalformedInput(_))
        ));
    }
}
