//! Sentence-paced response generation for the local pipeline.
//!
//! One utterance at a time: stream LLM tokens, cut the accumulating text
//! at sentence boundaries, hand each sentence to the TTS subprocess, and
//! gate on the previous sentence's audio-delivered signal before sending
//! the next. The gaps double as barge-in checkpoints.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{BackendEvent, EventSender};
use crate::llm::{ChatMessage, LlmClient, Role};

use super::{PipelineShared, UtteranceJob};

/// How long one sentence's audio may take to come back before the
/// generation is abandoned.
const SENTINEL_WAIT: Duration = Duration::from_secs(30);

/// STT transcripts are ignored for this long after the agent stops
/// speaking, to reject acoustic echo of its own voice.
const ECHO_COOLDOWN: Duration = Duration::from_millis(1500);

/// Minimum candidate length before a `.!?` boundary may cut a sentence,
/// so "Mr. Smith" and "U.S." survive intact.
const MIN_SENTENCE_CHARS: usize = 20;

/// History entries included in each LLM request.
const HISTORY_WINDOW: usize = 20;

/// Ordered conversation record. Mutated under one lock; readers snapshot.
#[derive(Default)]
pub struct ConversationHistory {
    messages: std::sync::Mutex<Vec<ChatMessage>>,
}

impl ConversationHistory {
    pub fn push(&self, role: Role, text: &str) {
        self.messages
            .lock()
            .unwrap()
            .push(ChatMessage::new(role, text));
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

/// Pull the next complete sentence off the front of `buf`, if one exists.
///
/// A sentence ends at `.`, `!`, or `?` followed by whitespace, and only
/// once the candidate has reached the minimum length.
pub fn extract_sentence(buf: &mut String) -> Option<String> {
    let chars: Vec<(usize, char)> = buf.char_indices().collect();
    for (n, &(idx, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let followed_by_space = chars.get(n + 1).is_some_and(|&(_, next)| next.is_whitespace());
        if !followed_by_space {
            continue;
        }
        if n + 1 < MIN_SENTENCE_CHARS {
            continue;
        }
        let rest = buf.split_off(idx + c.len_utf8());
        let sentence = std::mem::replace(buf, rest.trim_start().to_string());
        return Some(sentence.trim().to_string());
    }
    None
}

/// Assemble the request: personality, the last N history entries, and an
/// optional per-turn instruction.
fn build_messages(
    personality: &str,
    history: &[ChatMessage],
    extra_instruction: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new(Role::System, personality)];
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    messages.extend_from_slice(&history[start..]);
    if let Some(instruction) = extra_instruction {
        messages.push(ChatMessage::new(Role::System, instruction));
    }
    messages
}

/// Stream one LLM response and speak it sentence by sentence.
///
/// Runs on the utterance worker and never concurrently with itself, or two
/// generations would interleave audio and corrupt the history.
#[allow(clippy::too_many_arguments)]
pub async fn stream_and_speak(
    llm: &LlmClient,
    personality: &str,
    extra_instruction: Option<&str>,
    shared: &Arc<PipelineShared>,
    events: &EventSender,
    requeue: &mpsc::UnboundedSender<UtteranceJob>,
    audio_delivered: &mut mpsc::UnboundedReceiver<()>,
) -> Result<()> {
    let history = shared.history.snapshot();
    let messages = build_messages(personality, &history, extra_instruction);

    let mut tokens = llm.stream_chat(&messages).await?;

    shared.speaking.store(true, Ordering::SeqCst);
    let mut pending = String::new();
    let mut spoken = String::new();
    let mut sentences_sent = 0usize;

    let outcome: Result<Completion> = async {
        while let Some(delta) = tokens.recv().await {
            pending.push_str(&delta);
            while let Some(sentence) = extract_sentence(&mut pending) {
                if sentences_sent > 0 {
                    wait_delivered(audio_delivered).await?;
                }
                if check_barge_in(shared, requeue) {
                    return Ok(Completion::Interrupted);
                }
                speak_sentence(shared, &sentence).await?;
                push_spoken(&mut spoken, &sentence);
                sentences_sent += 1;
            }
        }

        // Stream ended; flush whatever is left as the final sentence.
        let tail = pending.trim().to_string();
        if !tail.is_empty() {
            if sentences_sent > 0 {
                wait_delivered(audio_delivered).await?;
            }
            if check_barge_in(shared, requeue) {
                return Ok(Completion::Interrupted);
            }
            speak_sentence(shared, &tail).await?;
            push_spoken(&mut spoken, &tail);
            sentences_sent += 1;
        }

        if sentences_sent > 0 {
            wait_delivered(audio_delivered).await?;
        }
        Ok(Completion::Completed)
    }
    .await;

    shared.speaking.store(false, Ordering::SeqCst);

    // An interrupt that landed during the final sentence's playout is
    // handled the same as one caught at a checkpoint.
    let completion = match outcome? {
        Completion::Completed if shared.barge_in.swap(false, Ordering::SeqCst) => {
            requeue_interrupt(shared, requeue);
            Completion::Interrupted
        }
        other => other,
    };

    if !spoken.is_empty() {
        shared.history.push(Role::Assistant, &spoken);
    }

    match completion {
        Completion::Interrupted => {
            debug!(sentences = sentences_sent, "Generation halted by barge-in");
        }
        Completion::Completed => {
            if !spoken.is_empty() {
                let _ = events.send(BackendEvent::Transcript(spoken.clone()));
            }
            shared.set_cooldown(Instant::now() + ECHO_COOLDOWN);
            let _ = events.send(BackendEvent::ResponseDone(Default::default()));
            info!(sentences = sentences_sent, chars = spoken.len(), "Response spoken");
        }
    }
    Ok(())
}

/// How a generation run ended.
enum Completion {
    Completed,
    Interrupted,
}

/// Send one `{"text": ...}` line to the TTS subprocess.
async fn speak_sentence(shared: &Arc<PipelineShared>, sentence: &str) -> Result<()> {
    let line = serde_json::to_string(&serde_json::json!({ "text": sentence }))?;
    debug!(chars = sentence.len(), "Sentence to TTS");

    let mut guard = shared.tts_stdin.lock().await;
    let stdin = guard.as_mut().context("TTS stdin closed")?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

async fn wait_delivered(audio_delivered: &mut mpsc::UnboundedReceiver<()>) -> Result<()> {
    tokio::time::timeout(SENTINEL_WAIT, audio_delivered.recv())
        .await
        .map_err(|_| anyhow!("TTS did not deliver audio within {:?}", SENTINEL_WAIT))?
        .ok_or_else(|| anyhow!("TTS audio channel closed"))
}

fn check_barge_in(
    shared: &Arc<PipelineShared>,
    requeue: &mpsc::UnboundedSender<UtteranceJob>,
) -> bool {
    if !shared.barge_in.swap(false, Ordering::SeqCst) {
        return false;
    }
    requeue_interrupt(shared, requeue);
    true
}

fn requeue_interrupt(shared: &Arc<PipelineShared>, requeue: &mpsc::UnboundedSender<UtteranceJob>) {
    if let Some(text) = shared.interrupt_text.lock().unwrap().take() {
        info!(text = %text, "Barge-in: re-queuing caller transcript");
        let _ = requeue.send(UtteranceJob::CallerText(text));
    }
}

fn push_spoken(spoken: &mut String, sentence: &str) {
    if !spoken.is_empty() {
        spoken.push(' ');
    }
    spoken.push_str(sentence);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentence_cut_at_terminator_with_space() {
        let mut buf = "This is a complete sentence. And the start of".to_string();
        let sentence = extract_sentence(&mut buf).unwrap();
        assert_eq!(sentence, "This is a complete sentence.");
        assert_eq!(buf, "And the start of");
    }

    #[test]
    fn abbreviations_do_not_split_early() {
        let mut buf = "Mr. Smith went to Washington. More text follows".to_string();
        let sentence = extract_sentence(&mut buf).unwrap();
        // The period after "Mr" is inside the minimum length window.
        assert_eq!(sentence, "Mr. Smith went to Washington.");
    }

    #[test]
    fn no_cut_without_trailing_whitespace() {
        let mut buf = "Waiting for the stream to continue after 3.14".to_string();
        assert!(extract_sentence(&mut buf).is_none());
        assert!(buf.starts_with("Waiting"));
    }

    #[test]
    fn question_and_exclamation_terminate() {
        let mut buf = "Would you like to hear more about it? I can".to_string();
        assert_eq!(
            extract_sentence(&mut buf).unwrap(),
            "Would you like to hear more about it?"
        );

        let mut buf = "That is absolutely wonderful news! Next".to_string();
        assert_eq!(
            extract_sentence(&mut buf).unwrap(),
            "That is absolutely wonderful news!"
        );
    }

    #[test]
    fn short_fragment_is_not_extracted() {
        let mut buf = "Okay. ".to_string();
        assert!(extract_sentence(&mut buf).is_none());
    }

    #[test]
    fn history_window_trims_to_last_twenty() {
        let history: Vec<ChatMessage> = (0..30)
            .map(|i| ChatMessage::new(Role::User, format!("turn {}", i)))
            .collect();
        let messages = build_messages("You are terse.", &history, None);
        assert_eq!(messages.len(), 21);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "turn 10");
    }

    #[test]
    fn extra_instruction_is_appended() {
        let messages = build_messages("Persona.", &[], Some("Say goodbye briefly."));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::System);
        assert_eq!(messages[1].content, "Say goodbye briefly.");
    }

    #[test]
    fn history_snapshot_is_a_copy() {
        let history = ConversationHistory::default();
        history.push(Role::User, "hello there");
        let snap = history.snapshot();
        history.push(Role::Assistant, "hi");
        assert_eq!(snap.len(), 1);
        assert_eq!(history.len(), 2);
    }
}
