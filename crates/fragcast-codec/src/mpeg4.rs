//! MPEG-4 audio helpers: the 2-byte AudioSpecificConfig and the
//! sample-rate index table shared by ADTS headers and esds descriptors.

use tracing::warn;

/// Sample rates by 4-bit frequency index. The reserved indices 13/14
/// decode as 48 kHz.
const RATES: [u32; 15] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    48000, 48000,
];

/// Decoded AudioSpecificConfig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// MPEG-4 Audio Object Type (1 = Main, 2 = LC, 3 = SSR, ...).
    pub object_type: u8,
    pub rate_index: u8,
    /// Sample rate in Hz resolved from the index.
    pub rate: u32,
    pub channels: u8,
}

/// Sample rate for a 4-bit frequency index.
pub fn rate_from_index(index: u8) -> u32 {
    RATES.get(usize::from(index)).copied().unwrap_or(0)
}

/// Frequency index for an exact sample rate, when one exists.
pub fn index_from_rate(rate: u32) -> Option<u8> {
    RATES[..13]
        .iter()
        .position(|&value| value == rate)
        .map(|index| index as u8)
}

/// Encode the 2-byte AudioSpecificConfig:
/// 5 bits object type, 4 bits rate index, 4 bits channel configuration.
pub fn write_audio_config(object_type: u8, rate_index: u8, channels: u8) -> [u8; 2] {
    [
        (object_type << 3) | ((rate_index & 0x0F) >> 1),
        ((rate_index & 0x01) << 7) | ((channels & 0x0F) << 3),
    ]
}

/// Decode an AudioSpecificConfig; `None` (with a warning) on a payload
/// too short or with a zero object type.
pub fn read_audio_config(data: &[u8]) -> Option<AudioConfig> {
    if data.len() < 2 {
        warn!("AAC configuration packet must have a minimum size of 2 bytes");
        return None;
    }

    let object_type = data[0] >> 3;
    if object_type == 0 {
        warn!("AAC configuration packet invalid");
        return None;
    }

    let rate_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
    Some(AudioConfig {
        object_type,
        rate_index,
        rate: rate_from_index(rate_index),
        channels: (data[1] >> 3) & 0x0F,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        for (object_type, rate_index, channels) in [(2u8, 3u8, 2u8), (1, 11, 1), (5, 8, 6)] {
            let config = write_audio_config(object_type, rate_index, channels);
            let decoded = read_audio_config(&config).unwrap();
            assert_eq!(decoded.object_type, object_type);
            assert_eq!(decoded.rate_index, rate_index);
            assert_eq!(decoded.channels, channels);
            assert_eq!(decoded.rate, rate_from_index(rate_index));
        }
    }

    #[test]
    fn rate_table_resolves_both_ways() {
        assert_eq!(rate_from_index(3), 48000);
        assert_eq!(rate_from_index(4), 44100);
        assert_eq!(rate_from_index(12), 7350);
        assert_eq!(rate_from_index(15), 0);
        assert_eq!(index_from_rate(44100), Some(4));
        assert_eq!(index_from_rate(48000), Some(3));
        assert_eq!(index_from_rate(1234), None);
    }

    #[test]
    fn invalid_config_rejected() {
        assert!(read_audio_config(&[0x12]).is_none());
        assert!(read_audio_config(&[0x00, 0x00]).is_none());
    }
}
