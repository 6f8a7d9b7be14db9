//! JARVIS: a conversational assistant client for Gemini.
//!
//! Two paths share one configuration and localization layer:
//!
//! - **Voice**: microphone audio streamed to the Gemini Live API, model
//!   audio scheduled for gapless playback, barge-in handled by
//!   interrupting everything queued ([`voice`], [`audio`])
//! - **Chat**: streaming text replies with per-conversation history and
//!   a rolling upload quota for standard accounts ([`chat`], [`profile`])

pub mod audio;
pub mod chat;
pub mod config;
pub mod error;
pub mod i18n;
pub mod profile;
pub mod voice;

pub use config::Config;
pub use error::{VoiceError, VoiceResult};
pub use i18n::Language;
