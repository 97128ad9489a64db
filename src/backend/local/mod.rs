//! Local voice pipeline backend.
//!
//! Replaces the realtime API with three cooperating pieces: an STT
//! subprocess, a TTS subprocess, and a streaming text LLM call. Both
//! subprocesses report line-buffered JSON status on stderr; protocol
//! traffic runs on stdin/stdout:
//!
//! - STT stdin: raw linear-16 8 kHz audio. STT stdout: one JSON object
//!   per line: `{"type":"speech_started"}`, `{"type":"speech_stopped"}`,
//!   `{"type":"transcript","text":...,"latency":...}`.
//! - TTS stdin: one JSON object per line: `{"text":"..."}`. TTS stdout:
//!   raw linear-16 8 kHz audio padded to 320-byte frames, each utterance
//!   terminated by the `0xDEADBEEF` sentinel.
//!
//! A single utterance worker serializes transcript → LLM → TTS so two
//! generations can never interleave their audio.

pub mod generate;
pub mod sentinel;

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audio::ulaw;
use crate::llm::{LlmClient, Role};

use super::{BackendEvent, EventSender};
use generate::ConversationHistory;
use sentinel::{SentinelFramer, TtsChunk};

/// Model load can be slow; give subprocesses this long to report ready.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Grace for reader tasks to finish after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Interruptions must be at least this long to beat echo suppression.
const BARGE_IN_MIN_CHARS: usize = 10;
const BARGE_IN_MIN_WORDS: usize = 2;

/// Transcripts shorter than this never pass the greeting gate.
const GATE_MIN_CHARS: usize = 4;

/// Common one-word STT hallucinations on ring-tones and line noise.
const GATE_FILLERS: &[&str] = &["mm-hmm", "mhm", "uh-huh", "hmm", "thank you", "thanks"];

/// Status line format both subprocesses emit on stderr.
#[derive(Debug, Deserialize)]
struct StatusLine {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// STT stdout events.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum SttEvent {
    SpeechStarted,
    SpeechStopped,
    Transcript {
        text: String,
        #[serde(default)]
        latency: Option<f64>,
    },
}

/// Work items for the utterance worker.
#[derive(Debug)]
pub enum UtteranceJob {
    /// A caller turn: append to history, then generate.
    CallerText(String),
    /// Speak per explicit instructions without a caller turn.
    Prompt(String),
}

/// State shared between the STT reader, TTS reader, and utterance worker.
pub struct PipelineShared {
    pub history: ConversationHistory,
    /// True from the first sentence of a response to the last.
    pub speaking: AtomicBool,
    /// Set when a substantial caller transcript arrives mid-response.
    pub barge_in: AtomicBool,
    /// The transcript that triggered the barge-in.
    pub interrupt_text: std::sync::Mutex<Option<String>>,
    /// Echo cooldown: transcripts before this instant are suspect.
    cooldown_until: std::sync::Mutex<Option<Instant>>,
    /// Released by the first real transcript; blocks ring-tone noise.
    pub gate_open: AtomicBool,
    /// TTS stdin, shared so disconnect can close it under the worker.
    pub tts_stdin: Mutex<Option<ChildStdin>>,
}

impl PipelineShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            history: ConversationHistory::default(),
            speaking: AtomicBool::new(false),
            barge_in: AtomicBool::new(false),
            interrupt_text: std::sync::Mutex::new(None),
            cooldown_until: std::sync::Mutex::new(None),
            gate_open: AtomicBool::new(false),
            tts_stdin: Mutex::new(None),
        })
    }

    pub fn set_cooldown(&self, until: Instant) {
        *self.cooldown_until.lock().unwrap() = Some(until);
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .lock()
            .unwrap()
            .is_some_and(|until| Instant::now() < until)
    }
}

/// What to do with an incoming STT transcript.
#[derive(Debug, PartialEq)]
enum Disposition {
    /// Forward as a caller turn.
    Accept,
    /// Substantial speech during agent output; interrupt.
    BargeIn,
    /// Ring-tone noise before the gate opened.
    GateDrop,
    /// Echo of the agent's own voice.
    EchoDrop,
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Classify a transcript against the greeting gate and echo suppression.
fn classify_transcript(text: &str, gate_open: bool, agent_audio_active: bool) -> Disposition {
    let trimmed = text.trim();
    if !gate_open {
        let bare = trimmed
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase();
        if trimmed.len() < GATE_MIN_CHARS || GATE_FILLERS.contains(&bare.as_str()) {
            return Disposition::GateDrop;
        }
    }
    if agent_audio_active {
        if trimmed.len() >= BARGE_IN_MIN_CHARS && word_count(trimmed) >= BARGE_IN_MIN_WORDS {
            return Disposition::BargeIn;
        }
        return Disposition::EchoDrop;
    }
    Disposition::Accept
}

/// Paths and settings for the local pipeline.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// STT subprocess invocation: program followed by arguments.
    pub stt_command: Vec<String>,
    /// TTS subprocess invocation: program followed by arguments.
    pub tts_command: Vec<String>,
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub llm_model: String,
    /// Personality / system instructions.
    pub instructions: String,
}

pub struct LocalBackend {
    config: LocalConfig,
    connected: Arc<AtomicBool>,
    shared: Arc<PipelineShared>,
    stt_stdin: Arc<Mutex<Option<ChildStdin>>>,
    utterance_tx: Option<mpsc::UnboundedSender<UtteranceJob>>,
    children: Vec<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            shared: PipelineShared::new(),
            stt_stdin: Arc::new(Mutex::new(None)),
            utterance_tx: None,
            children: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub async fn connect(&mut self, events: EventSender) -> Result<()> {
        let llm = LlmClient::new(
            &self.config.llm_endpoint,
            &self.config.llm_api_key,
            &self.config.llm_model,
        )?;

        // ── STT subprocess ───────────────────────────────────────────
        let mut stt = spawn_subprocess(&self.config.stt_command).context("spawning STT")?;
        let stt_stderr = lines_of(stt.stderr.take().expect("piped stderr"));
        let mut stt_stderr = wait_for_ready(stt_stderr, "stt").await?;
        info!("STT subprocess ready");

        // ── TTS subprocess ───────────────────────────────────────────
        let mut tts = spawn_subprocess(&self.config.tts_command).context("spawning TTS")?;
        let tts_stderr = lines_of(tts.stderr.take().expect("piped stderr"));
        let mut tts_stderr = wait_for_ready(tts_stderr, "tts").await?;
        info!("TTS subprocess ready");

        *self.stt_stdin.lock().await = stt.stdin.take();
        *self.shared.tts_stdin.lock().await = tts.stdin.take();

        // Keep logging subprocess status for the rest of the call.
        self.tasks.push(tokio::spawn(async move {
            while let Ok(Some(line)) = stt_stderr.next_line().await {
                log_status_line("stt", &line);
            }
        }));
        self.tasks.push(tokio::spawn(async move {
            while let Ok(Some(line)) = tts_stderr.next_line().await {
                log_status_line("tts", &line);
            }
        }));

        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();

        // ── STT stdout reader ────────────────────────────────────────
        let stt_stdout = stt.stdout.take().expect("piped stdout");
        self.tasks.push(tokio::spawn(stt_reader(
            stt_stdout,
            self.shared.clone(),
            events.clone(),
            utterance_tx.clone(),
        )));

        // ── TTS stdout reader ────────────────────────────────────────
        let tts_stdout = tts.stdout.take().expect("piped stdout");
        self.tasks.push(tokio::spawn(tts_reader(
            tts_stdout,
            events.clone(),
            delivered_tx,
        )));

        // ── Utterance worker ─────────────────────────────────────────
        self.tasks.push(tokio::spawn(utterance_worker(
            llm,
            self.config.instructions.clone(),
            self.shared.clone(),
            events.clone(),
            utterance_tx.clone(),
            utterance_rx,
            delivered_rx,
        )));

        self.children.push(stt);
        self.children.push(tts);
        self.utterance_tx = Some(utterance_tx);
        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(BackendEvent::Ready);
        Ok(())
    }

    /// Feed caller audio to the STT subprocess as linear-16.
    pub async fn send_audio(&self, mulaw: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let pcm = ulaw::ulaw_to_linear(mulaw);
        let mut guard = self.stt_stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            stdin.write_all(&pcm).await.context("STT stdin write")?;
        }
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.queue_job(UtteranceJob::CallerText(text.to_string()))
    }

    /// The local pipeline exposes no tools; results have nowhere to go.
    pub async fn send_tool_result(&self, call_id: &str, _output: &str) -> Result<()> {
        debug!(call_id, "Tool result ignored by local pipeline");
        Ok(())
    }

    pub async fn prompt_response(&self, instructions: &str) -> Result<()> {
        self.queue_job(UtteranceJob::Prompt(instructions.to_string()))
    }

    pub async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        // Closing the queue stops the utterance worker after the current job.
        self.utterance_tx = None;
        // Closing stdin is each subprocess's shutdown signal.
        self.stt_stdin.lock().await.take();
        self.shared.tts_stdin.lock().await.take();

        for task in self.tasks.drain(..) {
            let mut task = task;
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        for child in self.children.iter_mut() {
            if let Ok(None) = child.try_wait() {
                warn!("Subprocess still alive after stdin close, killing");
                let _ = child.kill().await;
            }
        }
        self.children.clear();
        info!(turns = self.shared.history.len(), "Local pipeline stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn queue_job(&self, job: UtteranceJob) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        if let Some(tx) = &self.utterance_tx {
            tx.send(job).map_err(|_| anyhow::anyhow!("utterance worker gone"))?;
        }
        Ok(())
    }
}

fn spawn_subprocess(command: &[String]) -> Result<Child> {
    let (program, args) = command
        .split_first()
        .context("subprocess command is empty")?;
    tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", program))
}

fn lines_of(stderr: ChildStderr) -> Lines<BufReader<ChildStderr>> {
    BufReader::new(stderr).lines()
}

/// Consume stderr status lines until the subprocess reports ready.
///
/// Model loading dominates startup, so the timeout is generous; hitting
/// it is a startup error, not a retry.
async fn wait_for_ready(
    mut stderr: Lines<BufReader<ChildStderr>>,
    name: &str,
) -> Result<Lines<BufReader<ChildStderr>>> {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        match tokio::time::timeout(remaining, stderr.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Ok(status) = serde_json::from_str::<StatusLine>(&line) {
                    if status.status.as_deref() == Some("ready") {
                        return Ok(stderr);
                    }
                    debug!(subprocess = name, ?status, "Startup status");
                } else {
                    debug!(subprocess = name, line = %line, "Startup output");
                }
            }
            Ok(Ok(None)) => bail!("{} subprocess exited during startup", name),
            Ok(Err(e)) => bail!("{} subprocess stderr read failed: {}", name, e),
            Err(_) => bail!(
                "{} subprocess did not become ready within {:?}",
                name,
                STARTUP_TIMEOUT
            ),
        }
    }
}

fn log_status_line(name: &str, line: &str) {
    match serde_json::from_str::<StatusLine>(line) {
        Ok(status) => debug!(
            subprocess = name,
            status = status.status.as_deref().unwrap_or(""),
            message = status.message.as_deref().unwrap_or(""),
            "Subprocess status"
        ),
        Err(_) => debug!(subprocess = name, line = %line, "Subprocess output"),
    }
}

/// STT stdout loop: JSON lines → VAD events and gated transcripts.
async fn stt_reader(
    stdout: tokio::process::ChildStdout,
    shared: Arc<PipelineShared>,
    events: EventSender,
    utterances: mpsc::UnboundedSender<UtteranceJob>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "STT stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<SttEvent>(&line) {
            Ok(e) => e,
            Err(e) => {
                // Malformed line: skip, the loop continues.
                debug!(error = %e, line = %line, "Unparseable STT line");
                continue;
            }
        };
        match event {
            SttEvent::SpeechStarted => {
                let _ = events.send(BackendEvent::SpeechStarted);
            }
            SttEvent::SpeechStopped => {
                let _ = events.send(BackendEvent::SpeechStopped);
            }
            SttEvent::Transcript { text, latency } => {
                debug!(latency = ?latency, text = %text, "STT transcript");
                handle_transcript(&shared, &events, &utterances, &text);
            }
        }
    }
    debug!("STT reader exiting");
}

fn handle_transcript(
    shared: &Arc<PipelineShared>,
    events: &EventSender,
    utterances: &mpsc::UnboundedSender<UtteranceJob>,
    text: &str,
) {
    let agent_audio_active = shared.speaking.load(Ordering::SeqCst) || shared.in_cooldown();
    let gate_open = shared.gate_open.load(Ordering::SeqCst);

    match classify_transcript(text, gate_open, agent_audio_active) {
        Disposition::GateDrop => {
            debug!(text = %text, "Dropped pre-greeting noise");
        }
        Disposition::EchoDrop => {
            debug!(text = %text, "Dropped suspected echo");
        }
        Disposition::BargeIn => {
            shared.gate_open.store(true, Ordering::SeqCst);
            info!(text = %text, "Caller barge-in");
            *shared.interrupt_text.lock().unwrap() = Some(text.trim().to_string());
            shared.barge_in.store(true, Ordering::SeqCst);
            let _ = events.send(BackendEvent::InputTranscript(text.trim().to_string()));
        }
        Disposition::Accept => {
            shared.gate_open.store(true, Ordering::SeqCst);
            let text = text.trim().to_string();
            let _ = events.send(BackendEvent::InputTranscript(text.clone()));
            let _ = utterances.send(UtteranceJob::CallerText(text));
        }
    }
}

/// TTS stdout loop: sentinel framing → μ-law audio + delivery signals.
async fn tts_reader(
    mut stdout: tokio::process::ChildStdout,
    events: EventSender,
    delivered: mpsc::UnboundedSender<()>,
) {
    let mut framer = SentinelFramer::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "TTS stdout read failed");
                break;
            }
        };
        for chunk in framer.feed(&buf[..n]) {
            match chunk {
                TtsChunk::Frame(pcm) => {
                    let _ = events.send(BackendEvent::Audio(ulaw::linear_to_ulaw(&pcm)));
                }
                TtsChunk::UtteranceEnd => {
                    let _ = delivered.send(());
                }
            }
        }
    }
    debug!("TTS reader exiting");
}

/// The single generation consumer. Jobs run strictly one at a time.
async fn utterance_worker(
    llm: LlmClient,
    personality: String,
    shared: Arc<PipelineShared>,
    events: EventSender,
    requeue: mpsc::UnboundedSender<UtteranceJob>,
    mut jobs: mpsc::UnboundedReceiver<UtteranceJob>,
    mut delivered: mpsc::UnboundedReceiver<()>,
) {
    while let Some(job) = jobs.recv().await {
        let extra = match &job {
            UtteranceJob::CallerText(text) => {
                shared.history.push(Role::User, text);
                None
            }
            UtteranceJob::Prompt(instructions) => Some(instructions.clone()),
        };

        let result = generate::stream_and_speak(
            &llm,
            &personality,
            extra.as_deref(),
            &shared,
            &events,
            &requeue,
            &mut delivered,
        )
        .await;

        if let Err(e) = result {
            error!(error = %e, "Generation failed");
            let _ = events.send(BackendEvent::Error(e.to_string()));
            // Even a failed goodbye must unblock anyone waiting on
            // response completion.
            let _ = events.send(BackendEvent::ResponseDone(Default::default()));
        }
    }
    debug!("Utterance worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_drops_ring_tone_hallucinations() {
        for noise in ["you", "the", "mm-hmm"] {
            assert_eq!(
                classify_transcript(noise, false, false),
                Disposition::GateDrop,
                "{:?} should be gated",
                noise
            );
        }
    }

    #[test]
    fn gate_releases_on_real_speech() {
        assert_eq!(
            classify_transcript("hello there", false, false),
            Disposition::Accept
        );
    }

    #[test]
    fn open_gate_accepts_short_turns() {
        assert_eq!(classify_transcript("yes", true, false), Disposition::Accept);
    }

    #[test]
    fn echo_is_dropped_while_speaking() {
        assert_eq!(
            classify_transcript("option", true, true),
            Disposition::EchoDrop
        );
    }

    #[test]
    fn substantial_speech_interrupts() {
        assert_eq!(
            classify_transcript("wait, tell me about the other option", true, true),
            Disposition::BargeIn
        );
    }

    #[test]
    fn short_two_word_echo_is_still_dropped() {
        // Two words but under the length floor.
        assert_eq!(classify_transcript("ok bye", true, true), Disposition::EchoDrop);
    }

    #[test]
    fn stt_events_parse() {
        let line = r#"{"type":"transcript","text":"hello there","latency":0.42}"#;
        match serde_json::from_str::<SttEvent>(line).unwrap() {
            SttEvent::Transcript { text, latency } => {
                assert_eq!(text, "hello there");
                assert_eq!(latency, Some(0.42));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            serde_json::from_str::<SttEvent>(r#"{"type":"speech_started"}"#).unwrap(),
            SttEvent::SpeechStarted
        ));
    }
}
