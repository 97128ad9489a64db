//! G.711 μ-law companding.
//!
//! Pure functions over bytes. Encoding follows the classic segment/mantissa
//! packing: clip to 32635, add the 132 bias, look up the segment number from
//! the upper bits, and complement the packed byte. Decoding reads a
//! precomputed 256-entry table.

/// Encoder bias added before segment lookup.
const BIAS: i32 = 0x84;

/// Largest magnitude representable before clipping.
const CLIP: i32 = 32635;

/// Segment number lookup, indexed by bits 7..14 of the biased magnitude.
static SEG_LUT: [u8; 256] = build_seg_lut();

/// μ-law byte → linear-16 sample.
static DECODE_LUT: [i16; 256] = build_decode_lut();

const fn build_seg_lut() -> [u8; 256] {
    let mut lut = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        lut[i] = match i {
            0..=1 => 0,
            2..=3 => 1,
            4..=7 => 2,
            8..=15 => 3,
            16..=31 => 4,
            32..=63 => 5,
            64..=127 => 6,
            _ => 7,
        };
        i += 1;
    }
    lut
}

const fn build_decode_lut() -> [i16; 256] {
    // Segment base magnitudes: (0x84 << seg) - 0x84.
    const SEG_BASE: [i32; 8] = [0, 132, 396, 924, 1980, 4092, 8316, 16764];
    let mut lut = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        let byte = !(i as u8);
        let sign = byte & 0x80;
        let segment = ((byte >> 4) & 0x07) as usize;
        let mantissa = (byte & 0x0F) as i32;
        let magnitude = SEG_BASE[segment] + (mantissa << (segment + 3));
        lut[i] = if sign != 0 {
            -(magnitude as i16)
        } else {
            magnitude as i16
        };
        i += 1;
    }
    lut
}

/// Encode one linear-16 sample as a μ-law byte.
///
/// Silence (0) encodes to 0xFF.
pub fn encode(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign = if value < 0 {
        value = -value;
        0x80u8
    } else {
        0x00
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    let segment = SEG_LUT[((value >> 7) & 0xFF) as usize];
    let mantissa = ((value >> (segment + 3)) & 0x0F) as u8;
    !(sign | (segment << 4) | mantissa)
}

/// Decode one μ-law byte to a linear-16 sample.
pub fn decode(byte: u8) -> i16 {
    DECODE_LUT[byte as usize]
}

/// Convert s16le PCM bytes to μ-law. Halves the byte count.
///
/// A trailing odd byte is dropped.
pub fn linear_to_ulaw(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|pair| encode(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Convert μ-law bytes to s16le PCM. Doubles the byte count.
pub fn ulaw_to_linear(ulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ulaw.len() * 2);
    for &byte in ulaw {
        out.extend_from_slice(&decode(byte).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_round_trip() {
        assert_eq!(encode(0), 0xFF);
        assert_eq!(decode(0xFF), 0);
    }

    #[test]
    fn reencode_stays_in_segment() {
        for b in 0u8..=255 {
            let reencoded = encode(decode(b));
            assert_eq!(
                reencoded & 0x70,
                b & 0x70,
                "byte {:#04x} re-encoded to {:#04x} in a different segment",
                b,
                reencoded
            );
        }
    }

    #[test]
    fn sine_within_quantization_noise() {
        // One frame of a 400 Hz sine at amplitude 16000, 8 kHz.
        for i in 0..160 {
            let phase = 2.0 * std::f64::consts::PI * 400.0 * i as f64 / 8000.0;
            let sample = (16000.0 * phase.sin()) as i16;
            let round_trip = decode(encode(sample));
            let error = (round_trip as i32 - sample as i32).abs();
            let bound = ((sample as i32).abs() / 8).max(200);
            assert!(
                error <= bound,
                "sample {} round-tripped to {} (error {}, bound {})",
                sample,
                round_trip,
                error,
                bound
            );
        }
    }

    #[test]
    fn extremes_do_not_overflow() {
        for s in [i16::MIN, i16::MIN + 1, -CLIP as i16, CLIP as i16, i16::MAX] {
            let decoded = decode(encode(s));
            assert_eq!(decoded.signum(), s.signum());
            assert!((decoded as i32).abs() <= 32767);
        }
    }

    #[test]
    fn batch_forms_invert() {
        let pcm: Vec<u8> = [-12000i16, -64, 0, 64, 12000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let ulaw = linear_to_ulaw(&pcm);
        assert_eq!(ulaw.len(), 5);
        let back = ulaw_to_linear(&ulaw);
        assert_eq!(back.len(), 10);
        // Re-encoding the decoded stream must be byte-identical.
        assert_eq!(linear_to_ulaw(&back), ulaw);
    }
}
