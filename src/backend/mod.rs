//! Voice backend contract.
//!
//! A backend is anything that can hold one side of a phone conversation:
//! it consumes caller audio, produces agent audio, and reports transcript
//! and tool activity. Two implementations exist: a remote realtime API
//! over WebSocket and a local STT→LLM→TTS subprocess pipeline. Both speak
//! telephony μ-law at 8 kHz and deliver output frame-aligned (multiples of
//! 160 bytes) so the bridge never has to split a partial frame.

pub mod local;
pub mod realtime;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Negotiated telephony codec name.
pub const AUDIO_CODEC: &str = "PCMU";

/// Telephony sample rate.
pub const AUDIO_SAMPLE_RATE: u32 = crate::audio::SAMPLE_RATE;

/// MIME type for the negotiated stream.
pub const AUDIO_MIME: &str = "audio/PCMU;rate=8000";

/// Token usage metadata reported with a completed response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// Everything a backend can tell the session.
///
/// Delivered over an unbounded channel handed to `connect`; the session's
/// event loop is the single consumer.
#[derive(Debug)]
pub enum BackendEvent {
    /// Session configured, ready to stream.
    Ready,
    /// μ-law audio the agent wants to speak, frame-aligned.
    Audio(Vec<u8>),
    /// Incremental agent transcript text (verbose display only).
    TranscriptDelta(String),
    /// Full transcript of a completed agent utterance.
    Transcript(String),
    /// Full transcript of a completed caller utterance.
    InputTranscript(String),
    /// VAD detected caller speech.
    SpeechStarted,
    /// VAD detected end of caller speech.
    SpeechStopped,
    /// Backend finished producing an utterance.
    ResponseDone(Usage),
    /// Backend invoked a tool.
    ToolCall {
        name: String,
        arguments: String,
        call_id: Option<String>,
    },
    /// Non-fatal or fatal backend error.
    Error(String),
    /// Backend disconnected.
    Closed,
}

/// Channel on which backends publish their events.
pub type EventSender = mpsc::UnboundedSender<BackendEvent>;

/// Enum dispatch over the available backends.
///
/// Avoids dyn-compatibility friction with async methods; the local
/// pipeline is a sibling implementation, not a refinement of the
/// realtime one.
pub enum BackendAdapter {
    Realtime(realtime::RealtimeBackend),
    Local(local::LocalBackend),
}

impl BackendAdapter {
    /// Connect and start streaming events to `events`.
    pub async fn connect(&mut self, events: EventSender) -> Result<()> {
        match self {
            Self::Realtime(b) => b.connect(events).await,
            Self::Local(b) => b.connect(events).await,
        }
    }

    /// Feed one or more μ-law frames of caller audio.
    pub async fn send_audio(&self, mulaw: &[u8]) -> Result<()> {
        match self {
            Self::Realtime(b) => b.send_audio(mulaw).await,
            Self::Local(b) => b.send_audio(mulaw).await,
        }
    }

    /// Inject a caller-side text turn.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        match self {
            Self::Realtime(b) => b.send_text(text).await,
            Self::Local(b) => b.send_text(text).await,
        }
    }

    /// Return a tool invocation result to the conversation.
    pub async fn send_tool_result(&self, call_id: &str, output: &str) -> Result<()> {
        match self {
            Self::Realtime(b) => b.send_tool_result(call_id, output).await,
            Self::Local(b) => b.send_tool_result(call_id, output).await,
        }
    }

    /// Ask the backend to speak specific content without a caller turn.
    pub async fn prompt_response(&self, instructions: &str) -> Result<()> {
        match self {
            Self::Realtime(b) => b.prompt_response(instructions).await,
            Self::Local(b) => b.prompt_response(instructions).await,
        }
    }

    /// Tear the backend down. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        match self {
            Self::Realtime(b) => b.disconnect().await,
            Self::Local(b) => b.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::Realtime(b) => b.is_connected(),
            Self::Local(b) => b.is_connected(),
        }
    }
}
