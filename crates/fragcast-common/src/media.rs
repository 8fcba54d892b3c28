//! Canonical media model: tags, packets, the sink contract, and the
//! compact wire tag encoding.
//!
//! Every demultiplexer writes into a [`Source`]; the remultiplexer
//! implements one. Presentation times are unsigned milliseconds that
//! wrap modulo 2^32 and are always compared through the wraparound-aware
//! [`distance32`].

use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::error::{Error, Result};

/// Sample rates addressable by the 5-bit wire rate index.
const RATES: [u32; 32] = [
    0, 5512, 7350, 8000, 11025, 12000, 16000, 18900, 22050, 24000, 32000, 37800, 44056, 44100,
    47250, 48000, 50000, 50400, 64000, 88200, 96000, 176400, 192000, 352800, 2822400, 5644800, 0,
    0, 0, 0, 0, 0,
];

fn rate_to_index(rate: u32) -> Option<u8> {
    RATES
        .iter()
        .position(|&value| value == rate && rate != 0)
        .or(if rate == 0 { Some(0) } else { None })
        .map(|index| index as u8)
}

/// Signed distance from `from` to `to` on the wrapping 32-bit timeline.
///
/// Negative means `to` is behind `from`; the result is exact for any two
/// times less than 2^31 ms apart.
pub fn distance32(from: u32, to: u32) -> i32 {
    to.wrapping_sub(from) as i32
}

/// Advance a wrapping 32-bit time by a signed distance.
pub fn add_distance32(time: u32, distance: i32) -> u32 {
    time.wrapping_add(distance as u32)
}

/// Media kind, encoded on 2 bits in the wire form.
///
/// Audio and video have the first bit set, which is what lets the packed
/// tag lead byte distinguish timed media from data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    None,
    Data,
    Audio,
    Video,
}

impl MediaKind {
    pub fn code(self) -> u8 {
        match self {
            MediaKind::None => 0,
            MediaKind::Data => 1,
            MediaKind::Audio => 2,
            MediaKind::Video => 3,
        }
    }
}

/// Audio codec ids (numeric values fixed by the wire encoding, shared
/// with the FLV codec nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Mp3,
    Aac,
}

impl AudioCodec {
    pub fn code(self) -> u8 {
        match self {
            AudioCodec::Mp3 => 2,
            AudioCodec::Aac => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(AudioCodec::Mp3),
            10 => Some(AudioCodec::Aac),
            _ => None,
        }
    }
}

/// Video codec ids (numeric values fixed by the wire encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    pub fn code(self) -> u8 {
        match self {
            VideoCodec::H264 => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            7 => Some(VideoCodec::H264),
            _ => None,
        }
    }
}

/// Frame significance of a video packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Unspecified,
    Key,
    Inter,
    /// H.263 only.
    DisposableInter,
    Info,
    CC,
    Config,
}

impl FrameKind {
    pub fn code(self) -> u8 {
        match self {
            FrameKind::Unspecified => 0,
            FrameKind::Key => 1,
            FrameKind::Inter => 2,
            FrameKind::DisposableInter => 3,
            FrameKind::Info => 5,
            FrameKind::CC => 6,
            FrameKind::Config => 7,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => FrameKind::Key,
            2 => FrameKind::Inter,
            3 => FrameKind::DisposableInter,
            5 => FrameKind::Info,
            6 => FrameKind::CC,
            7 => FrameKind::Config,
            _ => FrameKind::Unspecified,
        }
    }
}

/// Payload interpretation of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Unknown,
    Amf,
    Amf0,
    Json,
    XmlRpc,
    Query,
    Text,
}

impl DataKind {
    pub fn code(self) -> u8 {
        match self {
            DataKind::Unknown => 0,
            DataKind::Amf => 1,
            DataKind::Amf0 => 2,
            DataKind::Json => 3,
            DataKind::XmlRpc => 4,
            DataKind::Query => 5,
            DataKind::Text => 6,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => DataKind::Amf,
            2 => DataKind::Amf0,
            3 => DataKind::Json,
            4 => DataKind::XmlRpc,
            5 => DataKind::Query,
            6 => DataKind::Text,
            _ => DataKind::Unknown,
        }
    }
}

/// Tag of an audio packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTag {
    pub codec: AudioCodec,
    /// Presentation time in milliseconds (wraps mod 2^32).
    pub time: u32,
    /// Sample rate in Hz (0 = unknown, resolved by a config packet).
    pub rate: u32,
    pub channels: u8,
    /// True when the payload is a decoder configuration
    /// (AudioSpecificConfig), not samples.
    pub is_config: bool,
}

impl Default for AudioTag {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            time: 0,
            rate: 0,
            channels: 0,
            is_config: false,
        }
    }
}

/// Tag of a video packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTag {
    pub codec: VideoCodec,
    /// Presentation time in milliseconds (wraps mod 2^32).
    pub time: u32,
    pub frame: FrameKind,
    /// PTS - DTS, non-negative, capped at 16 bits.
    pub composition_offset: u16,
}

impl Default for VideoTag {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            time: 0,
            frame: FrameKind::Unspecified,
            composition_offset: 0,
        }
    }
}

/// Consumer of the canonical packet stream.
///
/// All demultiplexers write into this contract; the remultiplexer
/// implements it. `track` is a small integer starting at 1 (0 =
/// untracked); payloads may be empty (silence/marker packets). `reset`
/// means a new program/stream begins and all track state must be
/// discarded; `flush` means no more data is coming right now.
pub trait Source {
    fn write_audio(&mut self, track: u8, tag: &AudioTag, data: &[u8]);
    fn write_video(&mut self, track: u8, tag: &VideoTag, data: &[u8]);
    fn write_data(&mut self, _track: u8, _kind: DataKind, _data: &[u8]) {}
    /// Out-of-band properties update (opaque key->string payload, e.g.
    /// `audioLang`), surfaced apart from media timing.
    fn set_properties(&mut self, _track: u8, _kind: DataKind, _data: &[u8]) {}
    /// Quantified continuity loss on the given kind/track.
    fn report_lost(&mut self, _kind: MediaKind, _lost: u32, _track: u8) {}
    fn reset(&mut self) {}
    fn flush(&mut self) {}
}

/// Sink that discards everything; useful for draining a demultiplexer.
#[derive(Debug, Default)]
pub struct NullSource;

impl Source for NullSource {
    fn write_audio(&mut self, _track: u8, _tag: &AudioTag, _data: &[u8]) {}
    fn write_video(&mut self, _track: u8, _tag: &VideoTag, _data: &[u8]) {}
}

/// A tag decoded from (or encodable to) the compact wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedTag {
    Audio { track: u8, tag: AudioTag },
    Video { track: u8, tag: VideoTag },
    Data { track: u8, kind: DataKind },
}

/// Encode a video tag into its 2-10 byte wire form.
///
/// Layout: `11CCCCCC FFFFF0ON [O:u16] [N:u8] time:u32` where C = codec,
/// F = frame, O = composition offset present, N = track != 1 present.
/// Time is written last so a carrying protocol with its own time field
/// can strip it.
pub fn pack_video(buf: &mut BytesMut, tag: &VideoTag, track: u8) {
    buf.put_u8((MediaKind::Video.code() << 6) | (tag.codec.code() & 0x3F));
    let mut flags = tag.frame.code() << 3;
    if tag.composition_offset != 0 {
        flags |= 2;
    }
    if track != 1 {
        flags |= 1;
    }
    buf.put_u8(flags);
    if tag.composition_offset != 0 {
        buf.put_u16(tag.composition_offset);
    }
    if track != 1 {
        buf.put_u8(track);
    }
    buf.put_u32(tag.time);
}

/// Encode an audio tag into its 2-10 byte wire form.
///
/// Layout: `10CCCCCC SSSSSSSS RRRRR0IN [N:u8] time:u32` where C = codec,
/// S = channels, R = rate index, I = is-config, N = track != 1 present.
pub fn pack_audio(buf: &mut BytesMut, tag: &AudioTag, track: u8) {
    buf.put_u8((MediaKind::Audio.code() << 6) | (tag.codec.code() & 0x3F));
    buf.put_u8(tag.channels);
    let mut value = match rate_to_index(tag.rate) {
        Some(index) => index << 3,
        None => {
            // unsupported rate: leave 0 so the player falls back to the
            // config packet
            warn!("Rate {} not supported by tag packing", tag.rate);
            0
        }
    };
    if tag.is_config {
        value |= 2;
    }
    if track != 1 {
        value |= 1;
    }
    buf.put_u8(value);
    if track != 1 {
        buf.put_u8(track);
    }
    buf.put_u32(tag.time);
}

/// Encode a data tag into its 1-2 byte wire form: `0NTTTTTT [N:u8]`.
pub fn pack_data(buf: &mut BytesMut, kind: DataKind, track: u8) {
    if track == 0 {
        buf.put_u8(kind.code() & 0x3F);
    } else {
        buf.put_u8(0x40 | (kind.code() & 0x3F));
        buf.put_u8(track);
    }
}

/// Decode a packed tag; returns the tag and the number of header bytes
/// consumed (the payload follows).
pub fn unpack(data: &[u8]) -> Result<(PackedTag, usize)> {
    let need = |need: usize| Error::TruncatedTag {
        need,
        have: data.len(),
    };
    if data.is_empty() {
        return Err(need(1));
    }
    if data[0] & 0x80 == 0 {
        // DATA
        let kind = DataKind::from_code(data[0] & 0x3F);
        if data[0] & 0x40 == 0 {
            return Ok((PackedTag::Data { track: 0, kind }, 1));
        }
        if data.len() < 2 {
            return Err(need(2));
        }
        return Ok((
            PackedTag::Data {
                track: data[1],
                kind,
            },
            2,
        ));
    }

    let codec = data[0] & 0x3F;
    if data[0] & 0x40 != 0 {
        // VIDEO
        if data.len() < 2 {
            return Err(need(2));
        }
        let mut tag = VideoTag {
            codec: VideoCodec::from_code(codec).ok_or(Error::UnsupportedCodec(codec))?,
            frame: FrameKind::from_code(data[1] >> 3),
            ..VideoTag::default()
        };
        let mut pos = 2;
        if data[1] & 2 != 0 {
            if data.len() < pos + 2 {
                return Err(need(pos + 2));
            }
            tag.composition_offset = u16::from_be_bytes([data[pos], data[pos + 1]]);
            pos += 2;
        }
        let track = if data[1] & 1 != 0 {
            if data.len() < pos + 1 {
                return Err(need(pos + 1));
            }
            pos += 1;
            data[pos - 1]
        } else {
            1
        };
        if data.len() < pos + 4 {
            return Err(need(pos + 4));
        }
        tag.time = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        return Ok((PackedTag::Video { track, tag }, pos + 4));
    }

    // AUDIO
    if data.len() < 3 {
        return Err(need(3));
    }
    let mut tag = AudioTag {
        codec: AudioCodec::from_code(codec).ok_or(Error::UnsupportedCodec(codec))?,
        channels: data[1],
        rate: RATES[usize::from(data[2] >> 3)],
        is_config: data[2] & 2 != 0,
        ..AudioTag::default()
    };
    let mut pos = 3;
    let track = if data[2] & 1 != 0 {
        if data.len() < 4 {
            return Err(need(4));
        }
        pos += 1;
        data[3]
    } else {
        1
    };
    if data.len() < pos + 4 {
        return Err(need(pos + 4));
    }
    tag.time = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
    Ok((PackedTag::Audio { track, tag }, pos + 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_handles_wraparound() {
        assert_eq!(distance32(0, 100), 100);
        assert_eq!(distance32(100, 50), -50);
        assert_eq!(distance32(0xFFFF_FFF0, 4), 20);
        assert_eq!(distance32(4, 0xFFFF_FFF0), -20);
        assert_eq!(add_distance32(0xFFFF_FFF0, 20), 4);
    }

    #[test]
    fn audio_tag_roundtrip() {
        let tag = AudioTag {
            codec: AudioCodec::Aac,
            time: 123_456,
            rate: 48000,
            channels: 2,
            is_config: true,
        };
        let mut buf = BytesMut::new();
        pack_audio(&mut buf, &tag, 1);
        assert_eq!(buf.len(), 7); // no track byte for track 1
        let (unpacked, consumed) = unpack(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(unpacked, PackedTag::Audio { track: 1, tag });
    }

    #[test]
    fn audio_tag_roundtrip_with_track() {
        let tag = AudioTag {
            codec: AudioCodec::Mp3,
            time: 42,
            rate: 44100,
            channels: 1,
            is_config: false,
        };
        let mut buf = BytesMut::new();
        pack_audio(&mut buf, &tag, 3);
        let (unpacked, _) = unpack(&buf).unwrap();
        assert_eq!(unpacked, PackedTag::Audio { track: 3, tag });
    }

    #[test]
    fn video_tag_roundtrip_with_offset() {
        let tag = VideoTag {
            codec: VideoCodec::H264,
            time: 0xDEAD_BEEF,
            frame: FrameKind::Key,
            composition_offset: 40,
        };
        let mut buf = BytesMut::new();
        pack_video(&mut buf, &tag, 2);
        assert_eq!(buf.len(), 9);
        let (unpacked, consumed) = unpack(&buf).unwrap();
        assert_eq!(consumed, 9);
        assert_eq!(unpacked, PackedTag::Video { track: 2, tag });
    }

    #[test]
    fn data_tag_roundtrip() {
        let mut buf = BytesMut::new();
        pack_data(&mut buf, DataKind::Json, 0);
        assert_eq!(buf.len(), 1);
        let (unpacked, consumed) = unpack(&buf).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(
            unpacked,
            PackedTag::Data {
                track: 0,
                kind: DataKind::Json
            }
        );

        buf.clear();
        pack_data(&mut buf, DataKind::Amf, 5);
        let (unpacked, consumed) = unpack(&buf).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(
            unpacked,
            PackedTag::Data {
                track: 5,
                kind: DataKind::Amf
            }
        );
    }

    #[test]
    fn truncated_tag_is_an_error() {
        let tag = VideoTag::default();
        let mut buf = BytesMut::new();
        pack_video(&mut buf, &tag, 1);
        assert!(matches!(
            unpack(&buf[..buf.len() - 1]),
            Err(Error::TruncatedTag { .. })
        ));
    }
}
