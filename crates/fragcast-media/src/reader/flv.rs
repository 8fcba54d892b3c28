//! FLV container reader.
//!
//! Tag loop keyed on a 1-byte type + 24-bit size + split timestamp +
//! 24-bit stream id. Audio/video tag headers carry the codec bits; AAC
//! config sub-packets and H.264 avcC records are converted to canonical
//! config packets.

use bytes::BytesMut;
use fragcast_codec::{avc, mpeg4};
use fragcast_common::media::{
    AudioCodec, AudioTag, DataKind, FrameKind, Source, VideoCodec, VideoTag,
};
use fragcast_common::ByteReader;
use tracing::warn;

// FLV tag types (RTMP message ids)
const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;
const TAG_DATA: u8 = 18;

const ON_META_DATA: &[u8] = b"\x02\x00\x0AonMetaData";

/// Streaming FLV parser.
pub struct FlvReader {
    begin: bool,
    size: usize,
    tag_type: u8,
    sync_error: bool,
    audio_error: bool,
    video_error: bool,
    video: VideoTag,
    audio: AudioTag,
    audio_config: Option<AudioTag>,
}

impl FlvReader {
    pub fn new() -> Self {
        Self {
            begin: true,
            size: 0,
            tag_type: 0,
            sync_error: false,
            audio_error: false,
            video_error: false,
            video: VideoTag::default(),
            audio: AudioTag::default(),
            audio_config: None,
        }
    }

    /// Decode the 1-2 byte audio tag header; returns the header length,
    /// or `None` for an unsupported codec (packet dropped).
    fn read_audio_header(&mut self, data: &[u8]) -> Option<usize> {
        let tag = &mut self.audio;
        let mut reader = ByteReader::new(data);
        if reader.available() == 0 {
            // empty packet = audio end marker
            if let Some(config) = &mut self.audio_config {
                *config = *tag;
            }
            tag.is_config = true;
            return Some(0); // keep other tag properties unchanged
        }
        let codecs = reader.read8();
        match codecs >> 4 {
            10 => {
                tag.codec = AudioCodec::Aac;
                tag.is_config = false;
                if reader.available() > 0 && reader.read8() == 0 {
                    if let Some(config) = mpeg4::read_audio_config(&data[reader.position()..]) {
                        // the AAC config is more precise than the header bits
                        tag.rate = config.rate;
                        tag.channels = config.channels;
                        tag.is_config = true;
                        self.audio_config = Some(*tag);
                        return Some(reader.position());
                    }
                }
            }
            14 => {
                // MP3 at a fixed 8 kHz
                tag.codec = AudioCodec::Mp3;
                tag.rate = 8000;
                tag.channels = (codecs & 0x01) + 1;
                tag.is_config = false;
                return Some(reader.position());
            }
            2 => {
                tag.codec = AudioCodec::Mp3;
                tag.is_config = false;
            }
            other => {
                if !self.audio_error {
                    warn!("FLV audio codec {other} unsupported");
                    self.audio_error = true;
                }
                return None;
            }
        }
        match &self.audio_config {
            Some(config) => {
                tag.rate = config.rate;
                tag.channels = config.channels;
            }
            None => {
                tag.rate = (5512.5 * f64::from(1u32 << ((codecs & 0x0C) >> 2))) as u32;
                tag.channels = (codecs & 0x01) + 1;
            }
        }
        Some(reader.position())
    }

    /// Decode the 1- or 5-byte video tag header; returns the header
    /// length, or `None` for an unsupported codec.
    fn read_video_header(&mut self, data: &[u8]) -> Option<usize> {
        let tag = &mut self.video;
        let mut reader = ByteReader::new(data);
        if reader.available() == 0 {
            return Some(0); // keep other tag properties unchanged
        }
        let codecs = reader.read8();
        tag.frame = FrameKind::from_code((codecs & 0xF0) >> 4);
        match codecs & 0x0F {
            7 => {
                tag.codec = VideoCodec::H264;
                if reader.read8() == 0 {
                    tag.frame = FrameKind::Config;
                }
                tag.composition_offset = reader.read24().min(0xFFFF) as u16;
                Some(5)
            }
            other => {
                if !self.video_error {
                    warn!("FLV video codec {other} unsupported");
                    self.video_error = true;
                }
                None
            }
        }
    }

    pub fn parse(&mut self, data: &[u8], source: &mut dyn Source) -> usize {
        let mut reader = ByteReader::new(data);

        if self.begin {
            if self.size == 0 {
                loop {
                    if reader.available() < 9 {
                        return reader.available();
                    }
                    if reader.read24() == 0x464C56 {
                        break;
                    }
                    if !self.sync_error {
                        warn!("FLVReader signature not found");
                        self.sync_error = true;
                    }
                }
                self.sync_error = false;
                reader.next(2); // version + type flags
                self.size = reader.read32() as usize;
                if self.size > 9 {
                    self.size -= 4; // rest of header + previous-tag-size field
                } else {
                    self.size = 5;
                }
            }
            self.begin = false;
        }

        while reader.available() > 0 {
            if self.tag_type == 0 {
                if reader.available() < self.size {
                    self.size -= reader.available();
                    return 0;
                }
                reader.next(self.size - 1);
                self.tag_type = reader.read8();
                self.size = 0;
            }
            if self.size == 0 {
                if reader.available() < 3 {
                    return reader.available();
                }
                self.size = reader.read24() as usize + 7;
            }

            if reader.available() < self.size {
                return reader.available();
            }

            match self.tag_type {
                TAG_VIDEO => {
                    self.video.time = reader.read24() | (u32::from(reader.read8()) << 24);
                    let track = Self::track_of(reader.read24());
                    self.size -= 7;
                    let content = &data[reader.position()..reader.position() + self.size];
                    if let Some(header_len) = self.read_video_header(content) {
                        let mut content = &content[header_len..];
                        if self.video.frame == FrameKind::Config
                            && self.video.codec == VideoCodec::H264
                        {
                            let mut prefixed = BytesMut::new();
                            let consumed = avc::read_video_config(content, &mut prefixed);
                            content = &content[consumed..];
                            source.write_video(track, &self.video, &prefixed);
                        }
                        if !content.is_empty() {
                            // a pure config tag has no payload left
                            source.write_video(track, &self.video, content);
                        }
                    }
                }
                TAG_AUDIO => {
                    self.audio.time = reader.read24() | (u32::from(reader.read8()) << 24);
                    let track = Self::track_of(reader.read24());
                    self.size -= 7;
                    let content = &data[reader.position()..reader.position() + self.size];
                    if let Some(header_len) = self.read_audio_header(content) {
                        source.write_audio(track, &self.audio, &content[header_len..]);
                    }
                }
                TAG_DATA => {
                    reader.next(4); // time
                    let track = reader.read24().min(255) as u8;
                    self.size -= 7;
                    let content = &data[reader.position()..reader.position() + self.size];
                    if content.len() >= ON_META_DATA.len()
                        && &content[..ON_META_DATA.len()] == ON_META_DATA
                    {
                        source.set_properties(
                            track,
                            DataKind::Amf,
                            &content[ON_META_DATA.len()..],
                        );
                    } else {
                        source.write_data(track, DataKind::Amf, content);
                    }
                }
                other => warn!("FLVReader with an unknown tag type {other}"),
            }

            reader.next(self.size);
            self.tag_type = 0;
            self.size = 5; // previous-tag-size footer + next type byte
        }

        0
    }

    pub fn on_flush(&mut self, _source: &mut dyn Source) {
        self.begin = true;
        self.size = 0;
        self.tag_type = 0;
        self.audio_config = None;
        self.sync_error = false;
    }

    fn track_of(stream_id: u32) -> u8 {
        if stream_id == 0 {
            1
        } else {
            stream_id.min(255) as u8
        }
    }
}

impl Default for FlvReader {
    fn default() -> Self {
        Self::new()
    }
}
