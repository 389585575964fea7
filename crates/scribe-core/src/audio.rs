//! Recorded-audio container sniffing.
//!
//! Classification is magic-byte based and deterministic: the same input
//! always yields the same format, and anything unrecognized is treated as
//! raw PCM downstream.

/// Size of the canonical RIFF/WAVE header stripped before decoding.
pub const WAVE_HEADER_LEN: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveFormat {
    /// Mono 8 kHz 16-bit PCM WAVE, directly decodable.
    StandardWave,
    /// RIFF/WAVE in some other layout.
    Wave,
    /// Two-channel WAVE, split before decoding.
    Wave2Ch,
    /// Mono MPEG audio.
    Mpeg,
    /// MPEG audio behind an ID3 tag.
    MpegId3,
    /// Stereo MPEG audio.
    Mpeg2Ch,
    /// No recognizable container; treated as raw PCM.
    Unknown,
}

// Standard MPEG-1/2/2.5 bitrate table, kbit/s, indexed [version][layer][bits].
const BITRATE: [[[i16; 16]; 4]; 4] = [
    // version 2.5
    [
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    ],
    // reserved
    [
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    ],
    // version 2
    [
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0],
    ],
    // version 1
    [
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0],
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0],
    ],
];

// Standard MPEG sampling-rate table, Hz, indexed [version][bits].
const SAMPLING_RATE: [[i32; 4]; 4] = [
    [11025, 12000, 8000, 0], // version 2.5
    [0, 0, 0, 0],            // reserved
    [22050, 24000, 16000, 0], // version 2
    [44100, 48000, 32000, 0], // version 1
];

fn le_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*data.get(at)?, *data.get(at + 1)?]))
}

fn le_i32(data: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_le_bytes([
        *data.get(at)?,
        *data.get(at + 1)?,
        *data.get(at + 2)?,
        *data.get(at + 3)?,
    ]))
}

/// Classify an incoming byte blob. Inputs shorter than 4 bytes are `Unknown`.
pub fn check_wave_format(data: &[u8]) -> WaveFormat {
    if data.len() < 4 {
        return WaveFormat::Unknown;
    }

    if &data[..4] == b"RIFF" {
        let is_wavefmt = data.get(8..15).is_some_and(|m| m == b"WAVEfmt");
        let channels = le_u16(data, 22).unwrap_or(0);
        let sample_rate = le_i32(data, 24).unwrap_or(0);
        let bits = le_u16(data, 34).unwrap_or(0);

        if is_wavefmt {
            if sample_rate == 8000 && bits == 16 && channels == 1 {
                return WaveFormat::StandardWave;
            } else if channels == 2 {
                return WaveFormat::Wave2Ch;
            }
        }

        tracing::debug!(sample_rate, bits, channels, "non-standard RIFF input");
        return WaveFormat::Wave;
    }

    // Frame sync: AAAAAAAA AAABBCCD — eleven set bits, then version/layer.
    if data[0] == 0xFF && (data[1] & 0xE0) == 0xE0 {
        let version = ((data[1] & 0x18) >> 3) as usize;
        let layer = ((data[1] & 0x06) >> 1) as usize;
        if version != 1 && layer != 0 {
            tracing::debug!(
                bitrate_kbps = BITRATE[version][layer][((data[2] & 0xF0) >> 4) as usize],
                sampling_hz = SAMPLING_RATE[version][((data[2] & 0x0C) >> 2) as usize],
                "MPEG frame header"
            );
            // Channel mode 3 is single-channel; everything else is stereo.
            return match (data[3] & 0xC0) >> 6 {
                3 => WaveFormat::Mpeg,
                _ => WaveFormat::Mpeg2Ch,
            };
        }
    }

    if &data[..3] == b"ID3" {
        return WaveFormat::MpegId3;
    }

    WaveFormat::Unknown
}

/// Reinterpret a little-endian byte blob as 16-bit signed samples.
///
/// A trailing odd byte is dropped, matching a short final read.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Build a minimal standard WAVE header for mono 8 kHz 16-bit data.
pub fn standard_wave_header(data_len: u32) -> [u8; WAVE_HEADER_LEN] {
    let mut h = [0u8; WAVE_HEADER_LEN];
    h[..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    h[8..16].copy_from_slice(b"WAVEfmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    h[22..24].copy_from_slice(&1u16.to_le_bytes()); // mono
    h[24..28].copy_from_slice(&8000u32.to_le_bytes());
    h[28..32].copy_from_slice(&16000u32.to_le_bytes());
    h[32..34].copy_from_slice(&2u16.to_le_bytes());
    h[34..36].copy_from_slice(&16u16.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}
