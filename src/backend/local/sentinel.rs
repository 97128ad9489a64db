//! Utterance-boundary framing for the raw TTS audio stream.
//!
//! The TTS subprocess writes 8 kHz linear-16 audio padded to 320-byte
//! frame boundaries, and marks the end of each utterance with the 4-byte
//! sentinel `0xDEADBEEF` (little-endian). The framer accumulates stdout
//! bytes, slices out complete frames as they arrive, and reports each
//! consumed sentinel as an utterance boundary.
//!
//! A fixed sentinel inside a raw audio stream can in principle collide
//! with real sample data; the stream is padded and silence-terminated, so
//! the chance of those four bytes appearing naturally is accepted here.
//! Bytes at the tail that could be the start of a sentinel are held back
//! until the next read resolves them.
//!
//! The very first sentinel is the subprocess's warm-up flush: its audio
//! and its boundary are both discarded.

use crate::audio::FRAME_BYTES_LINEAR;

/// `0xDEADBEEF` as it appears on the wire.
const SENTINEL: [u8; 4] = 0xDEADBEEFu32.to_le_bytes();

/// Output of one scan step.
#[derive(Debug, PartialEq)]
pub enum TtsChunk {
    /// One complete 320-byte linear-16 frame.
    Frame(Vec<u8>),
    /// A sentinel was consumed; the current utterance's audio is fully
    /// emitted.
    UtteranceEnd,
}

#[derive(Debug, Default)]
pub struct SentinelFramer {
    buf: Vec<u8>,
    warmed_up: bool,
}

impl SentinelFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw TTS stdout bytes, returning any frames and utterance
    /// boundaries they complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<TtsChunk> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            match find_sentinel(&self.buf) {
                Some(pos) => {
                    if self.warmed_up {
                        emit_frames(&mut out, &self.buf[..pos], true);
                        out.push(TtsChunk::UtteranceEnd);
                    } else {
                        // Warm-up flush: drop the audio, skip the boundary.
                        self.warmed_up = true;
                    }
                    self.buf.drain(..pos + SENTINEL.len());
                }
                None => {
                    if self.warmed_up {
                        // Emit complete frames, but keep back any tail that
                        // could be the start of a sentinel.
                        let safe = self.buf.len() - sentinel_prefix_len(&self.buf);
                        let emit = safe - safe % FRAME_BYTES_LINEAR;
                        if emit > 0 {
                            emit_frames(&mut out, &self.buf[..emit], false);
                            self.buf.drain(..emit);
                        }
                    }
                    break;
                }
            }
        }
        out
    }
}

fn find_sentinel(buf: &[u8]) -> Option<usize> {
    buf.windows(SENTINEL.len()).position(|w| w == SENTINEL)
}

/// Length of the longest proper sentinel prefix that ends `buf`.
fn sentinel_prefix_len(buf: &[u8]) -> usize {
    for take in (1..SENTINEL.len()).rev() {
        if buf.len() >= take && buf[buf.len() - take..] == SENTINEL[..take] {
            return take;
        }
    }
    0
}

/// Slice `data` into 320-byte frames. When `flush` is set a short final
/// chunk is zero-padded to a full frame so a partial frame never reaches
/// the caller path.
fn emit_frames(out: &mut Vec<TtsChunk>, data: &[u8], flush: bool) {
    let mut chunks = data.chunks_exact(FRAME_BYTES_LINEAR);
    for frame in &mut chunks {
        out.push(TtsChunk::Frame(frame.to_vec()));
    }
    let tail = chunks.remainder();
    if flush && !tail.is_empty() {
        let mut frame = tail.to_vec();
        frame.resize(FRAME_BYTES_LINEAR, 0);
        out.push(TtsChunk::Frame(frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warmed() -> SentinelFramer {
        let mut framer = SentinelFramer::new();
        // Warm-up flush: some junk audio and the first sentinel.
        let events = framer.feed(&[0u8; 64]);
        assert!(events.is_empty());
        let events = framer.feed(&SENTINEL);
        assert!(events.is_empty(), "warm-up flush must be silent");
        framer
    }

    #[test]
    fn warmup_sentinel_is_swallowed() {
        let _ = warmed();
    }

    #[test]
    fn utterance_emits_frames_then_boundary() {
        let mut framer = warmed();

        let mut stream = vec![1u8; FRAME_BYTES_LINEAR * 2];
        stream.extend_from_slice(&SENTINEL);
        let events = framer.feed(&stream);

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], TtsChunk::Frame(f) if f.len() == FRAME_BYTES_LINEAR));
        assert!(matches!(&events[1], TtsChunk::Frame(_)));
        assert_eq!(events[2], TtsChunk::UtteranceEnd);
    }

    #[test]
    fn frames_stream_before_the_sentinel_arrives() {
        let mut framer = warmed();

        let events = framer.feed(&[2u8; FRAME_BYTES_LINEAR + 10]);
        assert_eq!(events.len(), 1, "complete frame should not wait for the sentinel");

        // The 10 leftover bytes join the next read.
        let mut rest = vec![2u8; FRAME_BYTES_LINEAR - 10];
        rest.extend_from_slice(&SENTINEL);
        let events = framer.feed(&rest);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], TtsChunk::UtteranceEnd);
    }

    #[test]
    fn sentinel_split_across_reads() {
        let mut framer = warmed();

        let mut first = vec![3u8; FRAME_BYTES_LINEAR];
        first.extend_from_slice(&SENTINEL[..2]);
        let events = framer.feed(&first);
        // The frame is emitted; the two sentinel-prefix bytes are held.
        assert_eq!(events.len(), 1);

        let events = framer.feed(&SENTINEL[2..]);
        assert_eq!(events, vec![TtsChunk::UtteranceEnd]);
    }

    #[test]
    fn short_tail_is_padded_at_boundary() {
        let mut framer = warmed();

        let mut stream = vec![4u8; 100];
        stream.extend_from_slice(&SENTINEL);
        let events = framer.feed(&stream);

        assert_eq!(events.len(), 2);
        match &events[0] {
            TtsChunk::Frame(f) => {
                assert_eq!(f.len(), FRAME_BYTES_LINEAR);
                assert!(f[100..].iter().all(|&b| b == 0));
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn back_to_back_utterances() {
        let mut framer = warmed();

        let mut stream = vec![5u8; FRAME_BYTES_LINEAR];
        stream.extend_from_slice(&SENTINEL);
        stream.extend_from_slice(&[6u8; FRAME_BYTES_LINEAR]);
        stream.extend_from_slice(&SENTINEL);
        let events = framer.feed(&stream);

        let boundaries = events
            .iter()
            .filter(|e| **e == TtsChunk::UtteranceEnd)
            .count();
        assert_eq!(boundaries, 2);
        assert_eq!(events.len(), 4);
    }
}
