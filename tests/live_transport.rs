use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jarvis::audio::codec::encode_chunk;
use jarvis::voice::{
    GeminiLiveTransport, LiveSessionConfig, LiveTransport, ServerEvent, TransportEvent,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

fn session_config() -> LiveSessionConfig {
    LiveSessionConfig {
        session_id: "it-session".into(),
        model: "gemini-2.5-flash-native-audio-preview-09-2025".into(),
        voice: "Charon".into(),
        system_instruction: "You must respond in English.".into(),
        transcribe: false,
    }
}

async fn next_event(events: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event channel closed")
}

#[tokio::test]
async fn session_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let setup = ws.next().await.unwrap().unwrap();
        let setup: serde_json::Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();

        // The live API answers in binary frames.
        ws.send(Message::Binary(br#"{"setupComplete":{}}"#.to_vec().into()))
            .await
            .unwrap();
        let audio = json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAABAA=="}}
        ]}}});
        ws.send(Message::Text(audio.to_string().into())).await.unwrap();
        ws.send(Message::Text(r#"{"serverContent":{"interrupted":true}}"#.into()))
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => received.push(text.to_string()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        (setup, received)
    });

    let transport = GeminiLiveTransport::new(format!("ws://{addr}/ws"), "test-key").unwrap();
    let (connection, mut events) = transport.open(session_config()).unwrap();
    assert_eq!(connection.session_id(), "it-session");

    assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message(ServerEvent::Audio {
            data: "AAABAA==".into(),
            mime_type: Some("audio/pcm;rate=24000".into()),
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message(ServerEvent::Interrupted)
    );

    connection.send(encode_chunk(&[0.5, -0.5])).unwrap();
    connection.close();

    let (setup, received) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        setup["setup"]["model"],
        "models/gemini-2.5-flash-native-audio-preview-09-2025"
    );
    assert_eq!(
        setup
            .pointer("/setup/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName")
            .unwrap(),
        "Charon"
    );

    assert_eq!(received.len(), 1);
    let chunk: serde_json::Value = serde_json::from_str(&received[0]).unwrap();
    assert_eq!(
        chunk["realtimeInput"]["mediaChunks"][0]["mimeType"],
        "audio/pcm;rate=16000"
    );
}

#[tokio::test]
async fn setup_rejection_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _setup = ws.next().await;
        let _ = ws
            .send(Message::Text(
                r#"{"error":{"message":"API key not valid"}}"#.into(),
            ))
            .await;
        let _ = ws.next().await;
    });

    let transport = GeminiLiveTransport::new(format!("ws://{addr}/ws"), "bad-key").unwrap();
    let (_connection, mut events) = transport.open(session_config()).unwrap();

    match next_event(&mut events).await {
        TransportEvent::Error(message) => assert!(message.contains("API key not valid")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = GeminiLiveTransport::new(format!("ws://{addr}/ws"), "test-key").unwrap();
    let (_connection, mut events) = transport.open(session_config()).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(_)
    ));
}
