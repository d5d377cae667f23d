//! G.711 μ-law codec.
//!
//! Pure functions between signed 16-bit linear samples and 8-bit μ-law
//! bytes, plus batch forms over S16LE byte slices. Linear silence (0)
//! encodes to `0xFF` and back.

/// Bias added to the magnitude before segment lookup.
const BIAS: i32 = 0x84;

/// Maximum magnitude before clipping.
const CLIP: i32 = 32_635;

/// Segment number for each value of the biased magnitude's upper bits.
static SEGMENT: [u8; 256] = build_segment_table();

/// Decoded linear value for each μ-law byte.
static DECODE: [i16; 256] = build_decode_table();

const fn build_segment_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = match i {
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
    table
}

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        let byte = !(i as u8);
        let sign = byte & 0x80;
        let segment = ((byte >> 4) & 0x07) as i32;
        let mantissa = (byte & 0x0F) as i32;
        let magnitude = (((mantissa << 3) + BIAS) << segment) - BIAS;
        table[i] = if sign != 0 {
            -(magnitude as i16)
        } else {
            magnitude as i16
        };
        i += 1;
    }
    table
}

/// Encode one linear sample to a μ-law byte.
pub fn encode_sample(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign = if value < 0 {
        value = -value;
        0x80u8
    } else {
        0
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    let segment = SEGMENT[((value >> 7) & 0xFF) as usize];
    let mantissa = ((value >> (segment + 3)) & 0x0F) as u8;
    !(sign | (segment << 4) | mantissa)
}

/// Decode one μ-law byte to a linear sample.
pub fn decode_sample(byte: u8) -> i16 {
    DECODE[byte as usize]
}

/// Convert S16LE bytes to μ-law bytes. Output is half the input length;
/// a trailing odd byte is ignored.
pub fn linear_to_ulaw(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|pair| encode_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Convert μ-law bytes to S16LE bytes. Output is twice the input length.
pub fn ulaw_to_linear(ulaw: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(ulaw.len() * 2);
    for &byte in ulaw {
        pcm.extend_from_slice(&decode_sample(byte).to_le_bytes());
    }
    pcm
}
