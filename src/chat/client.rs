//! Streaming text chat against the Gemini REST API.
//!
//! Uses `models/{model}:streamGenerateContent?alt=sse`. Each SSE `data:`
//! line carries a partial `GenerateContentResponse`; the text parts of the
//! first candidate are surfaced as fragments in arrival order.

use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{VoiceError, VoiceResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self::text("user", text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::text("model", text)
    }

    fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: [PartRef<'a>; 1],
}

#[derive(Debug, Serialize)]
struct PartRef<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    contents: &'a [Content],
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Text carried by one SSE `data:` payload.
/// Splits a byte stream into lines. Bytes are decoded only once a whole
/// line has arrived, so a character split across network chunks survives.
#[derive(Debug, Default)]
struct SseLines {
    pending: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }

    fn finish(self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// JSON payload of an SSE `data:` line, if it carries one.
fn data_payload(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim_start();
    (!data.is_empty() && data != "[DONE]").then_some(data)
}

fn chunk_text(data: &str) -> VoiceResult<String> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| VoiceError::MalformedInput(format!("bad stream chunk: {e}")))?;
    if let Some(err) = chunk.error {
        return Err(VoiceError::Chat(err.message));
    }
    Ok(chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default())
}

// ── Client ─────────────────────────────────────────────────────────

/// HTTP client for the chat model.
#[derive(Clone)]
pub struct GeminiChatClient {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for GeminiChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiChatClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GeminiChatClient {
    /// Fails with [`VoiceError::UnsetCredential`] on an empty key.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> VoiceResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(VoiceError::UnsetCredential);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &Config) -> VoiceResult<Self> {
        Self::new(
            &config.gemini.base_url,
            &config.gemini.chat_model,
            config.api_key()?,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// A multi-turn conversation sharing this client.
    pub fn start_chat(&self, system_instruction: impl Into<String>) -> ChatSession {
        ChatSession {
            client: self.clone(),
            system_instruction: system_instruction.into(),
            history: Vec::new(),
        }
    }

    /// Stream a reply to `contents`, calling `on_fragment` for every text
    /// fragment. Returns the full reply.
    pub async fn stream_generate(
        &self,
        system_instruction: Option<&str>,
        contents: &[Content],
        mut on_fragment: impl FnMut(&str),
    ) -> VoiceResult<String> {
        let start = Instant::now();
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            self.base_url, self.model
        );
        let body = StreamRequest {
            contents,
            system_instruction: system_instruction
                .filter(|s| !s.is_empty())
                .map(|text| SystemInstruction {
                    parts: [PartRef { text }],
                }),
        };

        let response = self
            .client
            .post(&url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(model = %self.model, status = %status, "Chat request rejected");
            return Err(VoiceError::Chat(format!(
                "Gemini API error {status}: {error_text}"
            )));
        }

        let mut stream = response.bytes_stream();
        let mut lines = SseLines::default();
        let mut reply = String::new();
        let mut fragments = 0usize;
        let mut emit = |line: &str| -> VoiceResult<()> {
            let Some(data) = data_payload(line) else {
                return Ok(());
            };
            match chunk_text(data) {
                Ok(text) if !text.is_empty() => {
                    fragments += 1;
                    on_fragment(&text);
                    reply.push_str(&text);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(VoiceError::MalformedInput(e)) => {
                    tracing::debug!(error = %e, "Skipping unparsable SSE chunk");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        while let Some(bytes) = stream.try_next().await? {
            lines.push(&bytes);
            while let Some(line) = lines.next_line() {
                emit(&line)?;
            }
        }
        // A final line without a trailing newline.
        if let Some(line) = lines.finish() {
            emit(&line)?;
        }

        tracing::debug!(
            model = %self.model,
            fragments,
            chars = reply.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat reply streamed"
        );
        Ok(reply)
    }
}

/// Conversation state kept on the client side between turns.
#[derive(Debug, Clone)]
pub struct ChatSession {
    client: GeminiChatClient,
    system_instruction: String,
    history: Vec<Content>,
}

impl ChatSession {
    /// Send `text` and stream the reply. The turn is added to the history
    /// only when the reply completes.
    pub async fn send_message_stream(
        &mut self,
        text: &str,
        on_fragment: impl FnMut(&str),
    ) -> VoiceResult<String> {
        let mut contents = self.history.clone();
        contents.push(Content::user(text));

        let reply = self
            .client
            .stream_generate(Some(&self.system_instruction), &contents, on_fragment)
            .await?;

        contents.push(Content::model(reply.clone()));
        self.history = contents;
        Ok(reply)
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_split_across_chunks_is_preserved() {
        let body = "data: {\"text\":\"français\"}\n".as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut lines = SseLines::default();
        lines.push(&body[..split]);
        assert_eq!(lines.next_line(), None);
        lines.push(&body[split..]);
        assert_eq!(
            lines.next_line().as_deref(),
            Some("data: {\"text\":\"français\"}")
        );
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn unterminated_last_line_is_flushed() {
        let mut lines = SseLines::default();
        lines.push("data: a\r\n\r\ndata: é".as_bytes());
        assert_eq!(lines.next_line().as_deref(), Some("data: a"));
        assert_eq!(lines.next_line().as_deref(), Some(""));
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.finish().as_deref(), Some("data: é"));
    }

    #[test]
    fn data_payload_skips_markers() {
        assert_eq!(data_payload("data: {}"), Some("{}"));
        assert_eq!(data_payload("data:[DONE]"), None);
        assert_eq!(data_payload("data:   "), None);
        assert_eq!(data_payload(": keep-alive"), None);
    }

    #[test]
    fn chunk_text_joins_parts() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Good "},{"text":"evening"}]}}]}"#;
        assert_eq!(chunk_text(data).unwrap(), "Good evening");
    }

    #[test]
    fn chunk_without_candidates_is_empty() {
        assert_eq!(chunk_text(r#"{"usageMetadata":{}}"#).unwrap(), "");
    }

    #[test]
    fn chunk_error_is_chat_error() {
        let err = chunk_text(r#"{"error":{"code":429,"message":"quota"}}"#).unwrap_err();
        assert!(matches!(err, VoiceError::Chat(m) if m == "quota"));
    }

    #[test]
    fn request_shape() {
        let contents = vec![Content::user("hi")];
        let body = StreamRequest {
            contents: &contents,
            system_instruction: Some(SystemInstruction {
                parts: [PartRef { text: "be brief" }],
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
    }

    #[test]
    fn empty_key_is_unset_credential() {
        assert!(matches!(
            GeminiChatClient::new("http://localhost", "gemini-2.5-flash", ""),
            Err(VoiceError::UnsetCredential)
        ));
    }

    #[test]
    fn debug_hides_key() {
        let client = GeminiChatClient::new("http://localhost/", "m", "secret").unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("http://localhost\""));
    }
}
