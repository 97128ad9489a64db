//! Telephony audio primitives.
//!
//! Everything on the wire is mono 8 kHz. The canonical unit is a 20 ms
//! frame: 160 samples, which is 320 bytes as signed 16-bit little-endian
//! linear PCM or 160 bytes as G.711 μ-law.

pub mod bridge;
pub mod ulaw;

use std::time::Duration;

/// Telephony sample rate in Hz.
pub const SAMPLE_RATE: u32 = 8_000;

/// Samples per 20 ms frame.
pub const FRAME_SAMPLES: usize = 160;

/// Bytes per frame as linear-16.
pub const FRAME_BYTES_LINEAR: usize = FRAME_SAMPLES * 2;

/// Bytes per frame as μ-law.
pub const FRAME_BYTES_ULAW: usize = FRAME_SAMPLES;

/// Wall-clock duration of one frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
