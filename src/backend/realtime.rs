//! Realtime voice backend over WebSocket.
//!
//! A single secure WebSocket to a vendor realtime voice endpoint. On open
//! the session is configured once (voice, personality, server-side VAD,
//! μ-law in both directions, tool list) and everything after that is
//! event-driven: JSON frames tagged by `type` in both directions, audio
//! payloads base64-encoded μ-law.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{BackendEvent, EventSender, Usage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

fn b64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn b64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(input)
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

/// Tool exposed to the agent, in the vendor's function-tool shape.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDef {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function",
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionConfig {
    modalities: Vec<String>,
    voice: String,
    instructions: String,
    input_audio_format: String,
    output_audio_format: String,
    input_audio_transcription: serde_json::Value,
    turn_detection: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDef>,
}

/// Client → server events.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate {
        event_id: String,
        session: SessionConfig,
    },
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ItemCreate {
        event_id: String,
        item: serde_json::Value,
    },
    #[serde(rename = "response.create")]
    ResponseCreate {
        event_id: String,
        response: ResponseConfig,
    },
}

#[derive(Debug, Serialize)]
struct ResponseConfig {
    modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
}

impl ResponseConfig {
    fn both_modalities(instructions: Option<String>) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions,
        }
    }
}

/// Server → client events. Unknown types fall through to `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone { transcript: String },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseBody,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        name: String,
        arguments: String,
        #[serde(default)]
        call_id: Option<String>,
    },
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Connection settings for the realtime backend.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Full wss:// URL including the model query parameter.
    pub url: String,
    pub api_key: String,
    /// Agent voice preset name.
    pub voice: String,
    /// Personality / system instructions.
    pub instructions: String,
    pub tools: Vec<ToolDef>,
}

/// WebSocket client for a remote realtime voice API.
pub struct RealtimeBackend {
    config: RealtimeConfig,
    sink: Option<Arc<Mutex<WsSink>>>,
    connected: Arc<AtomicBool>,
    recv_task: Option<JoinHandle<()>>,
}

impl RealtimeBackend {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            sink: None,
            connected: Arc::new(AtomicBool::new(false)),
            recv_task: None,
        }
    }

    pub async fn connect(&mut self, events: EventSender) -> Result<()> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .context("building realtime request")?;
        request.headers_mut().insert(
            http::header::AUTHORIZATION,
            format!("Bearer {}", self.config.api_key)
                .parse()
                .context("authorization header")?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            http::HeaderValue::from_static("realtime=v1"),
        );

        info!(url = %self.config.url, "Connecting to realtime voice API");
        let (stream, _) = connect_async(request)
            .await
            .context("realtime WebSocket connect")?;
        let (mut sink, source) = stream.split();

        // Configure the session before any audio moves.
        let update = ClientEvent::SessionUpdate {
            event_id: event_id(),
            session: SessionConfig {
                modalities: vec!["text".to_string(), "audio".to_string()],
                voice: self.config.voice.clone(),
                instructions: self.config.instructions.clone(),
                input_audio_format: "g711_ulaw".to_string(),
                output_audio_format: "g711_ulaw".to_string(),
                input_audio_transcription: serde_json::json!({ "model": "whisper-1" }),
                turn_detection: serde_json::json!({ "type": "server_vad" }),
                tools: self.config.tools.clone(),
            },
        };
        sink.send(Message::Text(serde_json::to_string(&update)?))
            .await
            .context("sending session.update")?;

        self.connected.store(true, Ordering::SeqCst);
        self.sink = Some(Arc::new(Mutex::new(sink)));

        let connected = self.connected.clone();
        self.recv_task = Some(tokio::spawn(receive_loop(source, events.clone(), connected)));

        let _ = events.send(BackendEvent::Ready);
        info!(
            codec = super::AUDIO_CODEC,
            rate = super::AUDIO_SAMPLE_RATE,
            mime = super::AUDIO_MIME,
            "Realtime session configured"
        );
        Ok(())
    }

    pub async fn send_audio(&self, mulaw: &[u8]) -> Result<()> {
        self.send_event(&ClientEvent::AudioAppend {
            audio: b64_encode(mulaw),
        })
        .await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_event(&ClientEvent::ItemCreate {
            event_id: event_id(),
            item: serde_json::json!({
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            }),
        })
        .await?;
        self.request_response(None).await
    }

    pub async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<()> {
        self.send_event(&ClientEvent::ItemCreate {
            event_id: event_id(),
            item: serde_json::json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            }),
        })
        .await?;
        self.request_response(None).await
    }

    pub async fn prompt_response(&self, instructions: &str) -> Result<()> {
        self.request_response(Some(instructions.to_string())).await
    }

    pub async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(sink) = self.sink.take() {
            let mut sink = sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request_response(&self, instructions: Option<String>) -> Result<()> {
        self.send_event(&ClientEvent::ResponseCreate {
            event_id: event_id(),
            response: ResponseConfig::both_modalities(instructions),
        })
        .await
    }

    /// Serialize and send one client event. No-op when not connected.
    async fn send_event(&self, event: &ClientEvent) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let json = serde_json::to_string(event)?;
        let mut sink = sink.lock().await;
        sink.send(Message::Text(json))
            .await
            .context("realtime send")?;
        Ok(())
    }
}

fn event_id() -> String {
    format!("evt_{}", uuid::Uuid::new_v4().as_simple())
}

/// Pump server events into the session's channel until the socket closes.
async fn receive_loop(mut source: WsSource, events: EventSender, connected: Arc<AtomicBool>) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let event = match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "Unparseable realtime event");
                        continue;
                    }
                };
                if dispatch_server_event(event, &events).is_err() {
                    break; // Session event loop is gone.
                }
            }
            Ok(Message::Close(_)) => {
                info!("Realtime connection closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected.load(Ordering::SeqCst) {
                    error!(error = %e, "Realtime WebSocket error");
                    let _ = events.send(BackendEvent::Error(e.to_string()));
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(BackendEvent::Closed);
}

fn dispatch_server_event(event: ServerEvent, events: &EventSender) -> Result<(), ()> {
    let send = |e: BackendEvent| events.send(e).map_err(|_| ());
    match event {
        ServerEvent::AudioDelta { delta } => match b64_decode(&delta) {
            Ok(audio) => send(BackendEvent::Audio(audio))?,
            Err(e) => warn!(error = %e, "Bad audio delta payload"),
        },
        ServerEvent::TranscriptDelta { delta } => send(BackendEvent::TranscriptDelta(delta))?,
        ServerEvent::TranscriptDone { transcript } => send(BackendEvent::Transcript(transcript))?,
        ServerEvent::ResponseDone { response } => {
            send(BackendEvent::ResponseDone(response.usage))?
        }
        ServerEvent::SpeechStarted => send(BackendEvent::SpeechStarted)?,
        ServerEvent::SpeechStopped => send(BackendEvent::SpeechStopped)?,
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            send(BackendEvent::InputTranscript(transcript))?
        }
        ServerEvent::FunctionCallDone {
            name,
            arguments,
            call_id,
        } => send(BackendEvent::ToolCall {
            name,
            arguments,
            call_id,
        })?,
        ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
            debug!("Realtime session acknowledged");
        }
        ServerEvent::Error { error } => {
            warn!(message = %error.message, "Realtime API error");
            send(BackendEvent::Error(error.message))?;
        }
        ServerEvent::Other => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_append_serializes_with_type_tag() {
        let event = ClientEvent::AudioAppend {
            audio: b64_encode(&[0xFF; 4]),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"input_audio_buffer.append\""));
        assert!(json.contains("\"audio\":\"/////w==\""));
    }

    #[test]
    fn response_create_omits_missing_instructions() {
        let event = ClientEvent::ResponseCreate {
            event_id: "evt_test".to_string(),
            response: ResponseConfig::both_modalities(None),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("response.create"));
        assert!(!json.contains("instructions"));
    }

    #[test]
    fn audio_delta_parses() {
        let json = r#"{"type":"response.audio.delta","delta":"/////w=="}"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::AudioDelta { delta } => {
                assert_eq!(b64_decode(&delta).unwrap(), vec![0xFF; 4]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn function_call_done_parses() {
        let json = r#"{"type":"response.function_call_arguments.done",
                       "name":"classify_intent",
                       "arguments":"{\"intent\":\"send_text\"}",
                       "call_id":"c1"}"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::FunctionCallDone {
                name,
                arguments,
                call_id,
            } => {
                assert_eq!(name, "classify_intent");
                assert!(arguments.contains("send_text"));
                assert_eq!(call_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let json = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(json).unwrap(),
            ServerEvent::Other
        ));
    }

    #[test]
    fn response_done_carries_usage() {
        let json = r#"{"type":"response.done",
                       "response":{"usage":{"total_tokens":42,"input_tokens":30,"output_tokens":12}}}"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::ResponseDone { response } => {
                assert_eq!(response.usage.total_tokens, Some(42));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
