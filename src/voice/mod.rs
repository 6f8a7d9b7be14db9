//! Live voice sessions with the Gemini native-audio model.
//!
//! ## Design
//! - Transport abstraction (`LiveTransport`) with a Gemini Live WebSocket
//!   implementation
//! - Single-task lifecycle controller (`VoiceController`) owning the
//!   microphone, speaker, playback scheduler and session handle
//! - Front-ends drive it through a cloneable `VoiceHandle` and observe it
//!   through `VoiceObserver` and a `watch` channel

pub mod controller;
pub mod events;
pub mod gemini_live;
pub mod transport;

pub use controller::{
    NoopObserver, SessionState, TranscriptRole, VoiceController, VoiceControllerConfig,
    VoiceHandle, VoiceObserver, VoicePreferences,
};
pub use events::{ServerEvent, TransportEvent};
pub use gemini_live::GeminiLiveTransport;
pub use transport::{LiveConnection, LiveSessionConfig, LiveTransport, OutboundMessage};
