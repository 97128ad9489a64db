//! Durable call transcript.
//!
//! Append-only, flushed on every write so a crash leaves a valid partial
//! record. Lines are stamped with elapsed call time as `[mm:ss.s]`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    Caller,
    Agent,
    System,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "Caller"),
            Self::Agent => write!(f, "Agent"),
            Self::System => write!(f, "System"),
        }
    }
}

pub struct TranscriptWriter {
    file: File,
    started: Instant,
    closed: bool,
}

impl TranscriptWriter {
    /// Open the transcript and write its header.
    pub fn create(path: &Path, number: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening transcript {}", path.display()))?;

        writeln!(
            file,
            "Call Transcript — {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(file, "Number: {}", number)?;
        writeln!(file, "{}", "-".repeat(40))?;
        file.flush()?;

        Ok(Self {
            file,
            started: Instant::now(),
            closed: false,
        })
    }

    /// Append one utterance.
    pub fn record(&mut self, role: TranscriptRole, text: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let minutes = (elapsed / 60.0) as u64;
        let seconds = elapsed % 60.0;
        writeln!(self.file, "[{:02}:{:04.1}] {}: {}", minutes, seconds, role, text)?;
        self.file.flush()?;
        Ok(())
    }

    /// Write the footer. Later records are ignored.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        writeln!(
            self.file,
            "Call ended (duration: {}s)",
            self.started.elapsed().as_secs()
        )?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for TranscriptWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn transcript_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "callwire-transcript-{}-{}.txt",
            tag,
            std::process::id()
        ))
    }

    #[test]
    fn header_lines_and_footer() {
        let path = transcript_path("full");
        let _ = std::fs::remove_file(&path);

        {
            let mut transcript = TranscriptWriter::create(&path, "15551234567").unwrap();
            transcript
                .record(TranscriptRole::Caller, "Okay, goodbye!")
                .unwrap();
            transcript
                .record(TranscriptRole::Agent, "Take care, goodbye.")
                .unwrap();
            transcript.close().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("Call Transcript — "));
        assert!(contents.contains("Number: 15551234567"));
        assert!(contents.contains("Caller: Okay, goodbye!"));
        assert!(contents.contains("Agent: Take care, goodbye."));
        assert!(contents.contains("Call ended (duration: "));

        // Every utterance line is stamped [mm:ss.s].
        for line in contents.lines().filter(|l| l.contains(": Okay")) {
            assert!(line.starts_with('['));
            assert!(line.contains("] Caller:"));
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn records_after_close_are_dropped() {
        let path = transcript_path("closed");
        let _ = std::fs::remove_file(&path);

        let mut transcript = TranscriptWriter::create(&path, "911").unwrap();
        transcript.close().unwrap();
        transcript
            .record(TranscriptRole::System, "should not appear")
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("should not appear"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn timestamp_format_is_mm_ss_tenths() {
        let path = transcript_path("stamp");
        let _ = std::fs::remove_file(&path);

        let mut transcript = TranscriptWriter::create(&path, "0").unwrap();
        transcript.record(TranscriptRole::System, "mark").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().find(|l| l.contains("mark")).unwrap();
        // e.g. "[00:00.0] System: mark"
        assert_eq!(&line[0..1], "[");
        assert_eq!(&line[3..4], ":");
        assert_eq!(&line[6..7], ".");
        assert_eq!(&line[8..9], "]");
        let _ = std::fs::remove_file(&path);
    }
}
