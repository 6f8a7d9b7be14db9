//! Transport abstraction for live voice sessions.
//!
//! `open` returns immediately with a handle; readiness, inbound messages,
//! errors and closure arrive later on the event channel.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::TransportEvent;
use crate::audio::EncodedBlob;
use crate::error::{VoiceError, VoiceResult};

/// Parameters fixed for the lifetime of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSessionConfig {
    pub session_id: String,
    pub model: String,
    /// Prebuilt voice name.
    pub voice: String,
    pub system_instruction: String,
    /// Ask the server for input/output transcripts.
    pub transcribe: bool,
}

/// Messages queued for the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Audio(EncodedBlob),
    Close,
}

/// Caller-side handle to an open (or opening) session.
///
/// Dropping the handle cancels the connection; [`LiveConnection::close`]
/// additionally asks for a graceful close frame.
#[derive(Debug)]
pub struct LiveConnection {
    session_id: String,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    cancel: CancellationToken,
}

impl LiveConnection {
    pub fn new(
        session_id: String,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            outbound,
            cancel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue a capture block. Does not wait for delivery.
    pub fn send(&self, blob: EncodedBlob) -> VoiceResult<()> {
        self.outbound
            .send(OutboundMessage::Audio(blob))
            .map_err(|_| VoiceError::Transport("session connection closed".into()))
    }

    pub fn close(self) {
        let _ = self.outbound.send(OutboundMessage::Close);
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A live, bidirectional audio session provider.
pub trait LiveTransport: Send + Sync {
    /// Begin opening a session. Must not block on the network.
    fn open(
        &self,
        config: LiveSessionConfig,
    ) -> VoiceResult<(LiveConnection, mpsc::UnboundedReceiver<TransportEvent>)>;
}
