//! Gemini Live WebSocket transport.
//!
//! Implements the BidiGenerateContent streaming protocol:
//!
//! 1. **Connect**: open the WebSocket with the API key in the query string
//! 2. **Setup**: send model, AUDIO modality, prebuilt voice and system
//!    instruction; wait for `setupComplete`
//! 3. **Stream**: send capture blocks as `realtimeInput.mediaChunks`,
//!    receive `serverContent` with base64 PCM audio
//! 4. **Close**: send a close frame when the controller tears down
//!
//! ## Binary frames
//!
//! The server delivers its JSON messages in Binary frames as often as in
//! Text frames. Binary payloads starting with `{` are parsed as JSON; any
//! other binary payload is logged and skipped.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::events::{ServerEvent, TransportEvent};
use super::transport::{LiveConnection, LiveSessionConfig, LiveTransport, OutboundMessage};
use crate::audio::EncodedBlob;
use crate::error::{VoiceError, VoiceResult};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ── Constants ──────────────────────────────────────────────────────

/// How long to wait for `setupComplete` after sending setup.
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// How long the inbound loop may run after the outbound side closed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ── Setup message (JSON sent as first frame) ───────────────────────

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(rename = "inputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(rename = "outputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty object; its presence enables transcription.
#[derive(Debug, Serialize)]
pub struct TranscriptionConfig {}

/// Build the setup message for a session.
pub fn build_setup_message(config: &LiveSessionConfig) -> SetupMessage {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };
    let system_instruction = (!config.system_instruction.is_empty()).then(|| SystemInstruction {
        parts: vec![TextPart {
            text: config.system_instruction.clone(),
        }],
    });

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
            input_audio_transcription: config.transcribe.then_some(TranscriptionConfig {}),
            output_audio_transcription: config.transcribe.then_some(TranscriptionConfig {}),
        },
    }
}

// ── Audio input message ────────────────────────────────────────────

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "...", "data": "<base64>"}]}}`
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage<'a> {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput<'a> {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: [&'a EncodedBlob; 1],
}

pub fn build_audio_message(blob: &EncodedBlob) -> RealtimeInputMessage<'_> {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: [blob],
        },
    }
}

// ── Server messages ────────────────────────────────────────────────

/// Parse one server JSON message into events, in the order they should
/// be applied: audio parts first, then interruption, then turn end.
pub fn parse_server_message(json_text: &str) -> VoiceResult<Vec<ServerEvent>> {
    let value: serde_json::Value = serde_json::from_str(json_text)
        .map_err(|e| VoiceError::MalformedInput(format!("server message is not JSON: {e}")))?;
    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(inline) = part.get("inlineData") {
                    if let Some(data) = inline.get("data").and_then(|v| v.as_str()) {
                        events.push(ServerEvent::Audio {
                            data: data.to_string(),
                            mime_type: inline
                                .get("mimeType")
                                .and_then(|v| v.as_str())
                                .map(str::to_string),
                        });
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    events.push(ServerEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ServerEvent::Interrupted);
        }
        for (key, input) in [("inputTranscription", true), ("outputTranscription", false)] {
            if let Some(text) = content.pointer(&format!("/{key}/text")).and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(if input {
                        ServerEvent::InputTranscript { text: text.to_string() }
                    } else {
                        ServerEvent::OutputTranscript { text: text.to_string() }
                    });
                }
            }
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(ServerEvent::Error {
            message: message.to_string(),
        });
    }

    Ok(events)
}

/// JSON text carried by a frame, if any.
fn frame_json(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

// ── Transport ──────────────────────────────────────────────────────

/// [`LiveTransport`] backed by the Gemini Live API.
#[derive(Clone)]
pub struct GeminiLiveTransport {
    endpoint: String,
    api_key: String,
}

impl std::fmt::Debug for GeminiLiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl GeminiLiveTransport {
    /// Fails with [`VoiceError::UnsetCredential`] on an empty key.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> VoiceResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(VoiceError::UnsetCredential);
        }
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

impl LiveTransport for GeminiLiveTransport {
    fn open(
        &self,
        config: LiveSessionConfig,
    ) -> VoiceResult<(LiveConnection, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let session_id = config.session_id.clone();
        let setup = build_setup_message(&config);

        tracing::info!(
            session_id = %session_id,
            model = %config.model,
            voice = %config.voice,
            "Opening Gemini Live session"
        );

        tokio::spawn(run_session(
            url,
            setup,
            session_id.clone(),
            outbound_rx,
            event_tx,
            cancel.clone(),
        ));

        Ok((LiveConnection::new(session_id, outbound_tx, cancel), event_rx))
    }
}

async fn run_session(
    url: String,
    setup: SetupMessage,
    session_id: String,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(session_id = %session_id, "Session closed before it opened");
            return;
        }
        result = connect_and_setup(&url, &setup, &session_id) => result,
    };

    let ws = match connected {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Gemini Live connect failed");
            let _ = events.send(TransportEvent::Error(e.to_string()));
            return;
        }
    };

    let _ = events.send(TransportEvent::Opened);

    let (sink, stream) = ws.split();
    let mut inbound = tokio::spawn(inbound_loop(stream, events, session_id.clone()));
    outbound_loop(sink, &mut outbound, &cancel, &session_id).await;

    if tokio::time::timeout(CLOSE_GRACE, &mut inbound).await.is_err() {
        inbound.abort();
    }
    tracing::debug!(session_id = %session_id, "Gemini Live session task finished");
}

async fn connect_and_setup(
    url: &str,
    setup: &SetupMessage,
    session_id: &str,
) -> VoiceResult<WsStream> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| VoiceError::Transport(format!("Failed to connect to Gemini Live: {e}")))?;

    let setup_json = serde_json::to_string(setup)
        .map_err(|e| VoiceError::Transport(format!("Failed to encode setup: {e}")))?;
    tracing::debug!(session_id = %session_id, setup = %setup_json, "Sending Gemini Live setup");
    ws.send(WsMessage::Text(setup_json.into())).await?;

    tokio::time::timeout(SETUP_TIMEOUT, wait_for_setup(&mut ws, session_id))
        .await
        .map_err(|_| VoiceError::Timeout("Gemini Live setupComplete"))??;

    tracing::info!(session_id = %session_id, "Gemini Live setup complete, ready to stream");
    Ok(ws)
}

async fn wait_for_setup(ws: &mut WsStream, session_id: &str) -> VoiceResult<()> {
    while let Some(msg) = ws.next().await {
        let msg = msg?;
        if let WsMessage::Close(frame) = &msg {
            return Err(VoiceError::Transport(format!(
                "Connection closed before setupComplete: {frame:?}"
            )));
        }
        let Some(text) = frame_json(&msg) else {
            continue;
        };
        match parse_server_message(text) {
            Ok(events) => {
                for event in events {
                    match event {
                        ServerEvent::SetupComplete => return Ok(()),
                        ServerEvent::Error { message } => {
                            return Err(VoiceError::Transport(message))
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Skipping setup-phase frame");
            }
        }
    }
    Err(VoiceError::Transport(
        "Stream ended before setupComplete".into(),
    ))
}

async fn outbound_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    cancel: &CancellationToken,
    session_id: &str,
) {
    let mut chunk_count: u64 = 0;

    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = cancel.cancelled() => None,
        };
        match msg {
            Some(OutboundMessage::Audio(blob)) => {
                chunk_count += 1;
                let json = match serde_json::to_string(&build_audio_message(&blob)) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to serialize audio message");
                        continue;
                    }
                };
                if chunk_count == 1 || chunk_count % 50 == 0 {
                    tracing::debug!(
                        session_id = %session_id,
                        chunk = chunk_count,
                        b64_len = blob.data.len(),
                        "Sending audio chunk"
                    );
                }
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    tracing::warn!(session_id = %session_id, error = %e, "WebSocket send failed, closing outbound loop");
                    break;
                }
            }
            Some(OutboundMessage::Close) | None => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, chunks = chunk_count, "Outbound loop terminated");
}

async fn inbound_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
    session_id: String,
) {
    let start = Instant::now();
    let mut audio_count: u64 = 0;

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                let _ = events.send(TransportEvent::Error(format!("WebSocket error: {e}")));
                return;
            }
        };

        if let WsMessage::Close(frame) = &msg {
            tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
            break;
        }

        let Some(text) = frame_json(&msg) else {
            if let WsMessage::Binary(data) = &msg {
                tracing::warn!(
                    session_id = %session_id,
                    len = data.len(),
                    "Unexpected non-JSON binary frame, skipping"
                );
            }
            continue;
        };

        let parsed = match parse_server_message(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Skipping malformed server message");
                continue;
            }
        };

        for event in parsed {
            match &event {
                ServerEvent::Audio { data, .. } => {
                    audio_count += 1;
                    tracing::trace!(
                        session_id = %session_id,
                        t = format!("{:.1}s", start.elapsed().as_secs_f32()),
                        audio_n = audio_count,
                        b64_len = data.len(),
                        "Model audio received"
                    );
                }
                ServerEvent::Interrupted => {
                    tracing::info!(session_id = %session_id, "Model output interrupted");
                }
                ServerEvent::TurnComplete => {
                    tracing::debug!(session_id = %session_id, audio_chunks = audio_count, "Turn complete");
                }
                _ => {}
            }
            if events.send(event.into()).is_err() {
                tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                return;
            }
        }
    }

    let _ = events.send(TransportEvent::Closed);
    tracing::debug!(session_id = %session_id, "Inbound loop terminated");
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session_config() -> LiveSessionConfig {
        LiveSessionConfig {
            session_id: "test".into(),
            model: "gemini-2.5-flash-native-audio-preview-09-2025".into(),
            voice: "Kore".into(),
            system_instruction: "You must respond in English.".into(),
            transcribe: false,
        }
    }

    #[test]
    fn setup_message_shape() {
        let msg = build_setup_message(&session_config());
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            json["setup"]["model"],
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json.pointer("/setup/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName")
                .unwrap(),
            "Kore"
        );
        assert_eq!(
            json.pointer("/setup/systemInstruction/parts/0/text").unwrap(),
            "You must respond in English."
        );
        assert!(json["setup"].get("inputAudioTranscription").is_none());
    }

    #[test]
    fn setup_message_requests_transcripts() {
        let mut config = session_config();
        config.transcribe = true;
        config.model = "models/custom".into();
        let json = serde_json::to_string(&build_setup_message(&config)).unwrap();
        assert!(json.contains("\"inputAudioTranscription\":{}"));
        assert!(json.contains("\"outputAudioTranscription\":{}"));
        assert!(json.contains("\"model\":\"models/custom\""));
    }

    #[test]
    fn audio_message_wraps_blob() {
        let blob = crate::audio::codec::encode_chunk(&[0.5, -0.5]);
        let json: serde_json::Value =
            serde_json::to_value(build_audio_message(&blob)).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], blob.data);
    }

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn parse_audio_response() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAABAA=="}}
        ]}}}"#;
        let events = parse_server_message(json).unwrap();
        assert_eq!(
            events,
            vec![ServerEvent::Audio {
                data: "AAABAA==".into(),
                mime_type: Some("audio/pcm;rate=24000".into()),
            }]
        );
    }

    #[test]
    fn audio_precedes_interruption() {
        let json = r#"{"serverContent": {"interrupted": true, "modelTurn": {"parts": [
            {"inlineData": {"data": "AAA="}}
        ]}}}"#;
        let events = parse_server_message(json).unwrap();
        assert!(matches!(events[0], ServerEvent::Audio { .. }));
        assert_eq!(events[1], ServerEvent::Interrupted);
    }

    #[test]
    fn parse_turn_complete_and_transcripts() {
        let json = r#"{"serverContent": {
            "turnComplete": true,
            "inputTranscription": {"text": "hello"},
            "outputTranscription": {"text": ""}
        }}"#;
        let events = parse_server_message(json).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::InputTranscript { text: "hello".into() },
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn parse_error() {
        let events = parse_server_message(r#"{"error": {"message": "Rate limit exceeded"}}"#).unwrap();
        assert_eq!(
            events,
            vec![ServerEvent::Error {
                message: "Rate limit exceeded".into()
            }]
        );
    }

    #[test]
    fn parse_invalid_json_is_malformed() {
        assert!(matches!(
            parse_server_message("not json at all"),
            Err(VoiceError::MalformedInput(_))
        ));
    }

    #[test]
    fn binary_json_frames_are_recognised() {
        let frame = WsMessage::Binary(br#"{"setupComplete":{}}"#.to_vec().into());
        assert_eq!(frame_json(&frame), Some(r#"{"setupComplete":{}}"#));
        let raw = WsMessage::Binary(vec![0u8, 1, 2].into());
        assert_eq!(frame_json(&raw), None);
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            GeminiLiveTransport::new("wss://example.invalid", "  "),
            Err(VoiceError::UnsetCredential)
        ));
    }

    #[test]
    fn debug_output_hides_key() {
        let transport = GeminiLiveTransport::new("wss://example.invalid", "secret").unwrap();
        assert!(!format!("{transport:?}").contains("secret"));
    }
}
