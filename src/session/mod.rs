//! Call session orchestration.
//!
//! One session per process: dial, wire the audio bridge and voice backend
//! together, watch the transcript stream through the trigger manager, and
//! wind the call down gracefully, either on a caller farewell or through
//! the two-phase silence sequence ("are you still there?" → goodbye).
//!
//! The session event loop is the single task that touches conversation
//! state; everything concurrent (drain waits, safety timers, delegation
//! requests) is a spawned task that reports back over the control
//! channel.

pub mod lock;
pub mod transcript;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assistant::AssistantClient;
use crate::audio::bridge::AudioBridge;
use crate::audio::FRAME_DURATION;
use crate::backend::{BackendAdapter, BackendEvent, Usage};
use crate::llm::Role;
use crate::sip::SipControl;
use crate::triggers::{Action, Firing, TriggerContext, TriggerManager, TriggerPayload};

use lock::SessionLock;
use transcript::{TranscriptRole, TranscriptWriter};

/// Phase-1 prompt when the line goes quiet.
const STILL_THERE_PROMPT: &str =
    "The caller has been quiet for a while. Briefly ask if they are still there.";

/// Phase-2 prompt before hanging up on silence.
const GOODBYE_PROMPT: &str =
    "The caller seems to be gone. Say a brief, polite goodbye and end the call.";

/// Safety timer: how long phase 1 may wait for any progress.
const SILENCE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Safety timer: how long a pending goodbye may take to complete.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(8);

/// Poll interval while draining the write queue before hangup.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Extra wait after the queue empties so tail audio clears the socket.
const DRAIN_TAIL: Duration = Duration::from_millis(500);

/// Grace for spawned helper tasks at hangup.
const TASK_GRACE: Duration = Duration::from_secs(1);

/// Fallback spoken when the assistant fails.
const DELEGATE_FALLBACK: &str = "Sorry, I wasn't able to complete that request.";

/// Process-global paths the session owns. Injected so tests can redirect
/// both without touching /tmp fixtures other processes use.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub lock: PathBuf,
    pub audio_socket: PathBuf,
}

/// Why a goodbye is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GoodbyePhase {
    None = 0,
    Silence = 1,
    Keyword = 2,
}

impl GoodbyePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Silence,
            2 => Self::Keyword,
            _ => Self::None,
        }
    }
}

/// Flags shared with drain tasks, atomically.
#[derive(Debug, Default)]
struct SharedFlags {
    hanging_up: AtomicBool,
    goodbye_pending: AtomicU8,
}

impl SharedFlags {
    fn goodbye_phase(&self) -> GoodbyePhase {
        GoodbyePhase::from_u8(self.goodbye_pending.load(Ordering::Acquire))
    }

    fn set_goodbye(&self, phase: GoodbyePhase) {
        self.goodbye_pending.store(phase as u8, Ordering::Release);
    }
}

/// Messages helper tasks post back to the event loop.
#[derive(Debug)]
enum Control {
    /// The response's audio backlog has drained; the silence clock may
    /// start.
    ResponseSettled,
    /// Phase-1 safety timer expired.
    SilenceCheckTimeout,
    /// Phase-2 safety timer expired.
    GoodbyeTimeout,
    /// Queue drained after a goodbye; finish the hangup.
    FinishHangup,
    /// Delegation result ready for the backend.
    ToolResult {
        call_id: Option<String>,
        text: String,
    },
    /// Assistant reply to a wake-phrase capture.
    SpeakText(String),
}

/// Injects the session's collaborators.
pub struct SessionBuilder {
    number: String,
    backend: BackendAdapter,
    triggers: TriggerManager,
    assistant: Option<Arc<AssistantClient>>,
    sip: SipControl,
    paths: SessionPaths,
    transcript_path: Option<PathBuf>,
    greeting: Option<String>,
    verbose: bool,
}

impl SessionBuilder {
    pub fn new(number: &str, backend: BackendAdapter, sip: SipControl, paths: SessionPaths) -> Self {
        Self {
            number: number.to_string(),
            backend,
            triggers: TriggerManager::new(),
            assistant: None,
            sip,
            paths,
            transcript_path: None,
            greeting: None,
            verbose: false,
        }
    }

    pub fn triggers(mut self, triggers: TriggerManager) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn assistant(mut self, assistant: AssistantClient) -> Self {
        self.assistant = Some(Arc::new(assistant));
        self
    }

    pub fn transcript_path(mut self, path: Option<PathBuf>) -> Self {
        self.transcript_path = path;
        self
    }

    pub fn greeting(mut self, greeting: Option<String>) -> Self {
        self.greeting = greeting;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn build(self) -> Session {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Session {
            number: self.number,
            backend: self.backend,
            triggers: self.triggers,
            assistant: self.assistant,
            sip: self.sip,
            paths: self.paths,
            transcript_path: self.transcript_path,
            greeting: self.greeting,
            verbose: self.verbose,
            flags: Arc::new(SharedFlags::default()),
            bridge: None,
            transcript: None,
            last_response_at: None,
            is_speaking: false,
            silence_prompted: false,
            silence_check_pending: false,
            silence_timer: None,
            goodbye_timer: None,
            helper_tasks: Vec::new(),
            control_tx,
            control_rx: Some(control_rx),
            ticks: 0,
        }
    }
}

pub struct Session {
    number: String,
    backend: BackendAdapter,
    triggers: TriggerManager,
    assistant: Option<Arc<AssistantClient>>,
    sip: SipControl,
    paths: SessionPaths,
    transcript_path: Option<PathBuf>,
    greeting: Option<String>,
    verbose: bool,

    flags: Arc<SharedFlags>,
    bridge: Option<Arc<AudioBridge>>,
    transcript: Option<TranscriptWriter>,
    /// Set only after a response's audio backlog drains, so the silence
    /// timer never runs while audio is still playing out.
    last_response_at: Option<Instant>,
    is_speaking: bool,
    /// An "are you still there?" prompt has gone out this quiet spell.
    silence_prompted: bool,
    /// The prompt is still being spoken or awaited.
    silence_check_pending: bool,
    silence_timer: Option<JoinHandle<()>>,
    goodbye_timer: Option<JoinHandle<()>>,
    helper_tasks: Vec<JoinHandle<()>>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Option<mpsc::UnboundedReceiver<Control>>,
    ticks: u64,
}

impl Session {
    /// Dial, stream, and block until hangup. Returns Ok on a clean call.
    pub async fn run(mut self) -> Result<()> {
        let mut lock = SessionLock::acquire(&self.paths.lock)?;

        if let Some(path) = &self.transcript_path {
            self.transcript = Some(TranscriptWriter::create(path, &self.number)?);
        }

        // A dead registration would ring into nothing; fail now.
        let reginfo = self.sip.reginfo().await.context("SIP registration check")?;
        if reginfo.get("registered").and_then(|v| v.as_bool()) == Some(false) {
            anyhow::bail!("SIP user agent is not registered");
        }
        debug!(?reginfo, "Registration ok");

        info!(number = %self.number, "Dialing");
        self.sip.dial(&self.number).await.context("dial failed")?;
        self.record(TranscriptRole::System, &format!("Dialing {}", self.number));

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(AudioBridge::start(&self.paths.audio_socket, inbound_tx).await?);
        self.bridge = Some(bridge);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        self.backend.connect(event_tx).await?;

        let mut control_rx = self.control_rx.take().expect("run called once");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt, hanging up");
                    break;
                }
                frame = inbound_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.backend.send_audio(&frame).await {
                            debug!(error = %e, "Dropping caller audio");
                        }
                    }
                    None => {
                        info!("Audio stream ended");
                        break;
                    }
                },
                event = event_rx.recv() => match event {
                    Some(event) => {
                        if self.handle_backend_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                command = control_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_control(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.handle_tick().await,
            }
        }

        self.hangup("session ended").await;
        lock.release();
        Ok(())
    }

    /// Returns true when the loop should exit (terminal hangup).
    async fn handle_backend_event(&mut self, event: BackendEvent) -> bool {
        match event {
            BackendEvent::Ready => {
                info!("Voice backend ready");
                if let Some(greeting) = self.greeting.clone() {
                    if let Err(e) = self.backend.prompt_response(&greeting).await {
                        warn!(error = %e, "Greeting prompt failed");
                    }
                }
            }
            BackendEvent::Audio(mulaw) => {
                self.is_speaking = true;
                if let Some(bridge) = &self.bridge {
                    bridge.enqueue(&mulaw);
                }
            }
            BackendEvent::TranscriptDelta(delta) => {
                if self.verbose {
                    debug!(delta = %delta, "Agent speaking");
                }
            }
            BackendEvent::Transcript(text) => {
                self.record(TranscriptRole::Agent, &text);
                let firings = self
                    .triggers
                    .check(&TriggerContext::transcript(&text, Role::Assistant));
                self.handle_firings(firings).await;
            }
            BackendEvent::InputTranscript(text) => {
                self.record(TranscriptRole::Caller, &text);
                self.on_caller_activity();
                let firings = self
                    .triggers
                    .check(&TriggerContext::transcript(&text, Role::User));
                self.handle_firings(firings).await;
            }
            BackendEvent::SpeechStarted => {
                debug!("Caller speech started");
                self.on_caller_activity();
            }
            BackendEvent::SpeechStopped => {
                debug!("Caller speech stopped");
            }
            BackendEvent::ResponseDone(usage) => {
                self.on_response_done(usage);
            }
            BackendEvent::ToolCall {
                name,
                arguments,
                call_id,
            } => {
                info!(tool = %name, "Tool call");
                let firings = self.triggers.check(&TriggerContext::tool(
                    &name,
                    &arguments,
                    call_id.as_deref(),
                ));
                self.handle_firings(firings).await;
            }
            BackendEvent::Error(message) => {
                error!(message = %message, "Backend error");
                self.record(TranscriptRole::System, &format!("Error: {}", message));
            }
            BackendEvent::Closed => {
                if !self.flags.hanging_up.load(Ordering::SeqCst) {
                    warn!("Backend disconnected");
                    return true;
                }
            }
        }
        false
    }

    async fn handle_control(&mut self, command: Control) -> bool {
        match command {
            Control::ResponseSettled => {
                self.last_response_at = Some(Instant::now());
                self.silence_check_pending = false;
                if let Some(timer) = self.silence_timer.take() {
                    timer.abort();
                }
            }
            Control::SilenceCheckTimeout => {
                if self.silence_check_pending {
                    // The check prompt never completed; move straight to
                    // the goodbye phase.
                    warn!("Still-there prompt stalled, escalating to goodbye");
                    self.silence_check_pending = false;
                    self.begin_goodbye(GoodbyePhase::Silence).await;
                }
            }
            Control::GoodbyeTimeout => {
                if self.flags.goodbye_phase() != GoodbyePhase::None {
                    warn!("Goodbye did not complete in time, forcing hangup");
                    return true;
                }
            }
            Control::FinishHangup => return true,
            Control::ToolResult { call_id, text } => match call_id {
                Some(call_id) => {
                    if let Err(e) = self.backend.send_tool_result(&call_id, &text).await {
                        warn!(error = %e, "Failed to deliver tool result");
                    }
                }
                None => {
                    // Without a call id the backend cannot attach the
                    // result to anything, so nothing will be spoken.
                    warn!("Delegation finished but no call id was recorded");
                }
            },
            Control::SpeakText(text) => {
                if let Err(e) = self.backend.send_text(&text).await {
                    warn!(error = %e, "Failed to speak assistant reply");
                }
            }
        }
        false
    }

    async fn handle_tick(&mut self) {
        self.ticks += 1;
        let firings = self
            .triggers
            .check(&TriggerContext::timing(self.last_response_at, self.is_speaking));
        self.handle_firings(firings).await;

        if self.verbose && self.ticks % 10 == 0 {
            if let Some(bridge) = &self.bridge {
                info!(
                    bytes_in = bridge.bytes_in(),
                    bytes_out = bridge.bytes_out(),
                    queued_frames = bridge.queued_frames(),
                    "Bridge stats"
                );
            }
        }
    }

    async fn handle_firings(&mut self, firings: Vec<Firing>) {
        for firing in firings {
            debug!(trigger = %firing.trigger, action = ?firing.action, "Trigger fired");
            match firing.action {
                Action::Hangup if firing.trigger == "silence" => self.on_silence_fire().await,
                Action::Hangup => self.on_farewell_fire(firing.payload).await,
                Action::Delegate => self.on_delegate(firing.payload),
                Action::Capture => self.on_capture(firing.payload),
            }
        }
    }

    /// Caller spoke: pending goodbye and silence checks are void.
    fn on_caller_activity(&mut self) {
        if self.silence_check_pending
            || self.silence_prompted
            || self.flags.goodbye_phase() != GoodbyePhase::None
        {
            info!("Caller is back, cancelling goodbye sequence");
        }
        self.silence_check_pending = false;
        self.silence_prompted = false;
        self.flags.set_goodbye(GoodbyePhase::None);
        self.abort_timers();
        self.triggers.reset();
        // Caller speech restarts the quiet clock; without this the
        // re-armed silence trigger would fire in the gap before the
        // agent's reply settles.
        if self.last_response_at.is_some() {
            self.last_response_at = Some(Instant::now());
        }
    }

    /// Farewell keyword heard. The backend is already answering the
    /// farewell itself, so no prompt goes out; just arm the drain.
    async fn on_farewell_fire(&mut self, payload: Option<TriggerPayload>) {
        if let Some(TriggerPayload::Match(keyword)) = &payload {
            info!(keyword = %keyword, "Farewell detected");
        }
        self.flags.set_goodbye(GoodbyePhase::Keyword);
        self.schedule_goodbye_timer();
    }

    async fn on_silence_fire(&mut self) {
        if self.silence_check_pending || self.flags.goodbye_phase() != GoodbyePhase::None {
            return;
        }
        if !self.silence_prompted {
            info!("Silence: asking if the caller is still there");
            self.silence_prompted = true;
            self.silence_check_pending = true;
            if let Err(e) = self.backend.prompt_response(STILL_THERE_PROMPT).await {
                warn!(error = %e, "Still-there prompt failed");
            }
            self.triggers.reset();

            let tx = self.control_tx.clone();
            self.replace_timer(
                TimerSlot::Silence,
                tokio::spawn(async move {
                    tokio::time::sleep(SILENCE_CHECK_TIMEOUT).await;
                    let _ = tx.send(Control::SilenceCheckTimeout);
                }),
            );
        } else {
            info!("Silence persisted, saying goodbye");
            self.begin_goodbye(GoodbyePhase::Silence).await;
        }
    }

    async fn begin_goodbye(&mut self, phase: GoodbyePhase) {
        self.flags.set_goodbye(phase);
        if phase == GoodbyePhase::Silence {
            if let Err(e) = self.backend.prompt_response(GOODBYE_PROMPT).await {
                warn!(error = %e, "Goodbye prompt failed");
            }
        }
        self.schedule_goodbye_timer();
    }

    fn schedule_goodbye_timer(&mut self) {
        let tx = self.control_tx.clone();
        self.replace_timer(
            TimerSlot::Goodbye,
            tokio::spawn(async move {
                tokio::time::sleep(GOODBYE_TIMEOUT).await;
                let _ = tx.send(Control::GoodbyeTimeout);
            }),
        );
    }

    fn on_response_done(&mut self, usage: Usage) {
        if self.verbose {
            debug!(
                input_tokens = ?usage.input_tokens,
                output_tokens = ?usage.output_tokens,
                total_tokens = ?usage.total_tokens,
                "Response done"
            );
        }
        self.is_speaking = false;

        let Some(bridge) = self.bridge.clone() else {
            return;
        };
        let tx = self.control_tx.clone();

        if self.flags.goodbye_phase() != GoodbyePhase::None {
            // The goodbye has been generated; let it play out, then end.
            let flags = self.flags.clone();
            self.spawn_helper(tokio::spawn(async move {
                loop {
                    if flags.goodbye_phase() == GoodbyePhase::None {
                        return; // Caller came back during the drain.
                    }
                    if bridge.queued_frames() == 0 {
                        break;
                    }
                    tokio::time::sleep(DRAIN_POLL).await;
                }
                tokio::time::sleep(DRAIN_TAIL).await;
                let _ = tx.send(Control::FinishHangup);
            }));
        } else {
            // Hold the silence clock until the queued audio has played.
            let backlog = FRAME_DURATION * bridge.queued_frames() as u32;
            self.spawn_helper(tokio::spawn(async move {
                tokio::time::sleep(backlog).await;
                let _ = tx.send(Control::ResponseSettled);
            }));
        }
    }

    fn on_delegate(&mut self, payload: Option<TriggerPayload>) {
        let Some(TriggerPayload::Tool { payload, call_id }) = payload else {
            warn!("Delegate trigger fired without a tool payload");
            return;
        };

        let intent = payload.get("intent").unwrap_or("unknown").to_string();
        let request = match payload.get("request") {
            Some(request) => request.to_string(),
            None => match &payload {
                crate::triggers::ToolPayload::Raw(raw) => raw.clone(),
                _ => String::new(),
            },
        };

        let Some(assistant) = self.assistant.clone() else {
            warn!("No assistant configured, sending fallback result");
            let _ = self.control_tx.send(Control::ToolResult {
                call_id,
                text: DELEGATE_FALLBACK.to_string(),
            });
            return;
        };

        let tx = self.control_tx.clone();
        self.spawn_helper(tokio::spawn(async move {
            let text = match assistant.run(&intent, &request).await {
                Ok(reply) if !reply.is_empty() => reply,
                Ok(_) => DELEGATE_FALLBACK.to_string(),
                Err(e) => {
                    error!(error = %e, "Assistant request failed");
                    DELEGATE_FALLBACK.to_string()
                }
            };
            let _ = tx.send(Control::ToolResult { call_id, text });
        }));
    }

    fn on_capture(&mut self, payload: Option<TriggerPayload>) {
        let Some(TriggerPayload::Capture(request)) = payload else {
            return;
        };
        let Some(assistant) = self.assistant.clone() else {
            debug!("Wake-phrase captured but no assistant configured");
            return;
        };
        let tx = self.control_tx.clone();
        self.spawn_helper(tokio::spawn(async move {
            match assistant.run("request", &request).await {
                Ok(reply) if !reply.is_empty() => {
                    let _ = tx.send(Control::SpeakText(reply));
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Wake-phrase delegation failed"),
            }
        }));
    }

    /// Idempotent teardown: every terminal path funnels through here.
    async fn hangup(&mut self, reason: &str) {
        if self.flags.hanging_up.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason, "Hanging up");
        self.flags.set_goodbye(GoodbyePhase::None);
        self.abort_timers();

        if let Some(bridge) = &self.bridge {
            bridge.stop().await;
        }
        self.backend.disconnect().await;

        if let Err(e) = self.sip.hangup().await {
            debug!(error = %e, "SIP hangup command failed");
        }

        if let Some(transcript) = &mut self.transcript {
            let _ = transcript.close();
        }

        for task in self.helper_tasks.drain(..) {
            let mut task = task;
            if tokio::time::timeout(TASK_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!("Session finished");
    }

    fn record(&mut self, role: TranscriptRole, text: &str) {
        if let Some(transcript) = &mut self.transcript {
            if let Err(e) = transcript.record(role, text) {
                warn!(error = %e, "Transcript write failed");
            }
        }
    }

    fn abort_timers(&mut self) {
        if let Some(timer) = self.silence_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.goodbye_timer.take() {
            timer.abort();
        }
    }

    fn replace_timer(&mut self, slot: TimerSlot, handle: JoinHandle<()>) {
        let slot = match slot {
            TimerSlot::Silence => &mut self.silence_timer,
            TimerSlot::Goodbye => &mut self.goodbye_timer,
        };
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    fn spawn_helper(&mut self, handle: JoinHandle<()>) {
        self.helper_tasks.retain(|t| !t.is_finished());
        self.helper_tasks.push(handle);
    }
}

enum TimerSlot {
    Silence,
    Goodbye,
}
