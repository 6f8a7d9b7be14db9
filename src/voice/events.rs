//! Events delivered from a live session to its controller.

/// Content decoded from one server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Server acknowledged the setup message.
    SetupComplete,
    /// Base64 PCM audio from the model.
    Audio {
        data: String,
        mime_type: Option<String>,
    },
    /// The user barged in; queued model audio must be discarded.
    Interrupted,
    /// Model finished a response turn.
    TurnComplete,
    /// Transcription of the user's speech.
    InputTranscript { text: String },
    /// Transcription (or text part) of the model's reply.
    OutputTranscript { text: String },
    /// Server-reported failure.
    Error { message: String },
}

/// Session lifecycle plus inbound messages, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established and ready for audio.
    Opened,
    Message(ServerEvent),
    Error(String),
    /// Connection ended. Never followed by further events.
    Closed,
}

impl From<ServerEvent> for TransportEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::Error { message } => TransportEvent::Error(message),
            other => TransportEvent::Message(other),
        }
    }
}

/// Sample rate declared by a PCM MIME type such as `audio/pcm;rate=24000`.
pub fn pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_rate_parses_parameter() {
        assert_eq!(pcm_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(pcm_rate("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(pcm_rate("audio/pcm"), None);
        assert_eq!(pcm_rate("audio/pcm;rate=fast"), None);
    }

    #[test]
    fn server_error_becomes_transport_error() {
        let event: TransportEvent = ServerEvent::Error {
            message: "quota".into(),
        }
        .into();
        assert_eq!(event, TransportEvent::Error("quota".into()));

        let event: TransportEvent = ServerEvent::Interrupted.into();
        assert_eq!(event, TransportEvent::Message(ServerEvent::Interrupted));
    }
}
