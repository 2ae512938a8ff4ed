//! Gemini Live websocket transport
//!
//! Protocol:
//! 1. connect to the BidiGenerateContent endpoint with the API key
//! 2. send the setup message (model, voice, system instruction)
//! 3. wait for `setupComplete`; the server may send JSON in binary frames
//! 4. stream `realtimeInput` audio out, parse `serverContent` coming back

use crate::error::{VoiceError, VoiceResult};
use crate::session::{
    AttemptId, ConnectRequest, SessionEvent, SessionHandle, SessionTransport, TransportEvent,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage {
    setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupPayload {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
    output_audio_transcription: EmptyConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct EmptyConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: &'a str,
}

/// Setup message JSON for a session request
pub fn build_setup_message(request: &ConnectRequest) -> VoiceResult<String> {
    let model = if request.model.starts_with("models/") {
        request.model.clone()
    } else {
        format!("models/{}", request.model)
    };
    let message = SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: request.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: request.system_instruction.clone(),
                }],
            },
            output_audio_transcription: EmptyConfig {},
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// `realtimeInput` message carrying one base64 PCM chunk
pub fn build_audio_message(pcm_base64: &str) -> VoiceResult<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: [MediaChunk {
                mime_type: INPUT_AUDIO_MIME,
                data: pcm_base64,
            }],
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Session events carried by one server message, in delivery order
pub fn parse_server_message(json_text: &str) -> Vec<SessionEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable server message: {}", e);
            return events;
        }
    };

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(|v| v.as_array()) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    events.push(SessionEvent::ChunkReceived(data.to_string()));
                }
            }
        }
        if let Some(text) = content
            .pointer("/outputTranscription/text")
            .and_then(|v| v.as_str())
        {
            if !text.is_empty() {
                events.push(SessionEvent::TextDelta(text.to_string()));
            }
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(SessionEvent::TurnComplete);
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(SessionEvent::Error(message.to_string()));
    }

    events
}

/// Text of a frame if it carries JSON
fn frame_json(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

/// [`SessionTransport`] backed by the Gemini Live API
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    endpoint: String,
}

impl Default for GeminiLiveTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiLiveTransport {
    pub fn new() -> Self {
        Self::with_endpoint(GEMINI_LIVE_WS_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    async fn await_setup_complete(ws: &mut WsStream) -> VoiceResult<()> {
        while let Some(frame) = ws.next().await {
            let frame = frame?;
            if let Message::Close(reason) = &frame {
                return Err(VoiceError::Transport(format!(
                    "Connection closed before setupComplete: {:?}",
                    reason
                )));
            }
            match frame_json(&frame) {
                Some(text) if text.contains("setupComplete") => return Ok(()),
                Some(text) => {
                    if let Some(SessionEvent::Error(message)) = parse_server_message(text)
                        .into_iter()
                        .find(|e| matches!(e, SessionEvent::Error(_)))
                    {
                        return Err(VoiceError::Transport(message));
                    }
                }
                None => debug!("Non-JSON frame during setup"),
            }
        }
        Err(VoiceError::Transport("Stream ended before setupComplete".to_string()))
    }
}

#[async_trait::async_trait]
impl SessionTransport for GeminiLiveTransport {
    async fn connect(
        &self,
        request: ConnectRequest,
        attempt: AttemptId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> VoiceResult<Box<dyn SessionHandle>> {
        let url = format!("{}?key={}", self.endpoint, request.api_key);
        info!(attempt = attempt.0, model = %request.model, voice = %request.voice_name, "🌐 Connecting to Gemini Live");

        let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;

        let setup = build_setup_message(&request)?;
        ws.send(Message::text(setup)).await?;

        match tokio::time::timeout(SETUP_TIMEOUT, Self::await_setup_complete(&mut ws)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(VoiceError::Transport(format!(
                    "setupComplete timeout ({}s)",
                    SETUP_TIMEOUT.as_secs()
                )))
            }
        }
        info!(attempt = attempt.0, "Gemini Live setup complete");

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(outbound_loop(out_rx, sink, attempt));
        tokio::spawn(inbound_loop(stream, events.clone(), attempt));

        events
            .send(TransportEvent::new(attempt, SessionEvent::Opened))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;

        Ok(Box::new(GeminiSession { out_tx }))
    }
}

#[derive(Debug)]
enum Outbound {
    Audio(String),
    Close,
}

struct GeminiSession {
    out_tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle for GeminiSession {
    fn send_audio(&self, pcm_base64: &str) -> VoiceResult<()> {
        self.out_tx
            .send(Outbound::Audio(pcm_base64.to_string()))
            .map_err(|_| VoiceError::Transport("Session closed".to_string()))
    }

    fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close);
    }
}

async fn outbound_loop(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut sink: SplitSink<WsStream, Message>,
    attempt: AttemptId,
) {
    let mut chunks: u64 = 0;

    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Audio(data) => {
                let json = match build_audio_message(&data) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(attempt = attempt.0, "Failed to encode audio message: {}", e);
                        continue;
                    }
                };
                chunks += 1;
                if data.len() > 10_000 {
                    debug!(attempt = attempt.0, bytes = data.len(), "🚀 Sending burst");
                }
                if sink.send(Message::text(json)).await.is_err() {
                    warn!(attempt = attempt.0, "Websocket send failed, closing outbound loop");
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    debug!(attempt = attempt.0, chunks, "Outbound loop ended");
}

async fn inbound_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
    attempt: AttemptId,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let _ = events.send(TransportEvent::new(attempt, SessionEvent::Error(e.to_string())));
                break;
            }
        };
        if let Message::Close(reason) = &frame {
            debug!(attempt = attempt.0, "Server closed the session: {:?}", reason);
            break;
        }
        let Some(text) = frame_json(&frame) else {
            continue;
        };
        for event in parse_server_message(text) {
            if events.send(TransportEvent::new(attempt, event)).is_err() {
                return;
            }
        }
    }

    let _ = events.send(TransportEvent::new(attempt, SessionEvent::Closed));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            api_key: "AIzaSyExample123".into(),
            system_instruction: "Translate.".into(),
            voice_name: "Puck".into(),
            model: "gemini-2.5-flash-native-audio-preview-12-2025".into(),
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let json = build_setup_message(&request()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.5-flash-native-audio-preview-12-2025");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Translate.");
        assert!(setup["outputAudioTranscription"].is_object());
    }

    #[test]
    fn test_audio_message_shape() {
        let json = build_audio_message("AAAA").unwrap();
        assert_eq!(
            json,
            r#"{"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=16000","data":"AAAA"}]}}"#
        );
    }

    #[test]
    fn test_parse_server_content() {
        let msg = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAEC"}},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AwQF"}}
                ]},
                "outputTranscription": {"text": "Hej"},
                "turnComplete": true
            }
        }"#;
        assert_eq!(
            parse_server_message(msg),
            vec![
                SessionEvent::ChunkReceived("AAEC".into()),
                SessionEvent::ChunkReceived("AwQF".into()),
                SessionEvent::TextDelta("Hej".into()),
                SessionEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_parse_error_and_garbage() {
        assert_eq!(
            parse_server_message(r#"{"error": {"message": "503 unavailable"}}"#),
            vec![SessionEvent::Error("503 unavailable".into())]
        );
        assert!(parse_server_message("not json").is_empty());
        assert!(parse_server_message(r#"{"setupComplete": {}}"#).is_empty());
    }

    #[test]
    fn test_binary_json_frames_are_read() {
        let frame = Message::binary(br#"{"setupComplete":{}}"#.to_vec());
        assert_eq!(frame_json(&frame), Some(r#"{"setupComplete":{}}"#));
        assert_eq!(frame_json(&Message::binary(vec![0u8, 1, 2])), None);
    }
}
