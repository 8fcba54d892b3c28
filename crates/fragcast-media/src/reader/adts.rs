//! ADTS elementary-stream reader (AAC).
//!
//! Self-framing: a 12-bit `0xFFF` sync word starts every frame, followed
//! by a 7-byte header (9 with CRC). Decoder parameters live in every
//! header; a change in any of {object type, rate index, channels}
//! synthesizes a fresh AudioSpecificConfig packet ahead of the frame.

use fragcast_codec::mpeg4;
use fragcast_common::media::{AudioTag, Source};
use fragcast_common::ByteReader;
use tracing::warn;

/// Streaming ADTS parser, usable standalone or as an elementary track
/// reader inside MPEG-TS (which then drives `track`/`time` externally).
pub struct AdtsReader {
    pub track: u8,
    /// Next frame's presentation time in ms; self-advances by the frame
    /// duration, or is overwritten by the container's PES timing.
    pub time: u32,
    sync_error: bool,
    size: usize,
    tag: AudioTag,
    /// Packed fingerprint of the last seen decoder parameters:
    /// object type << 12 | rate index << 8 | channels.
    infos: u32,
}

impl AdtsReader {
    pub fn new(track: u8) -> Self {
        Self {
            track,
            time: 0,
            sync_error: false,
            size: 0,
            tag: AudioTag::default(),
            infos: 0,
        }
    }

    /// Parse as much as possible; returns the size of the unconsumed
    /// tail (0 = everything consumed).
    pub fn parse(&mut self, data: &[u8], source: &mut dyn Source) -> usize {
        let mut reader = ByteReader::new(data);

        while reader.available() > 0 {
            if self.size == 0 {
                if reader.available() < 7 {
                    return reader.available();
                }
                let header = &data[reader.position()..];

                // 12-bit syncword
                if header[0] != 0xFF || header[1] & 0xF0 != 0xF0 {
                    if !self.sync_error {
                        warn!("ADTS syncword xFFF not found");
                        self.sync_error = true;
                    }
                    reader.next(if header[0] != 0xFF { 1 } else { 2 });
                    continue;
                }
                self.sync_error = false;

                // CRC-absent flag selects the header size
                let header_size = if header[1] & 0x01 != 0 { 7 } else { 9 };
                if reader.available() < header_size {
                    return reader.available();
                }
                reader.next(header_size);

                let is_aac_mp2 = header[1] & 0x08 != 0;

                let mut size = (usize::from(header[4]) << 3) | (usize::from(header[5] & 0xE0) >> 5);
                if !is_aac_mp2 {
                    size |= usize::from(header[3] & 0x03) << 11;
                }
                if size < header_size {
                    warn!("ADTS frame size {size} error (inferior to header)");
                    continue;
                }
                self.size = size - header_size;

                // 2-bit profile (MPEG-4 audio object type minus 1)
                let object = u32::from(header[2] >> 6);
                if self.infos >> 12 != object {
                    self.infos = (self.infos & 0x0FFF) | (object << 12);
                    self.tag.is_config = true;
                }

                let rate_index = (header[2] >> 2) & 0x0F;
                if (self.infos >> 8) & 0x0F != u32::from(rate_index) {
                    self.infos = (self.infos & 0xF0FF) | (u32::from(rate_index) << 8);
                    self.tag.is_config = true;
                }
                self.tag.rate = mpeg4::rate_from_index(rate_index);

                self.tag.time = self.time;
                // 1024 samples per frame, clamped to 16 bits
                let step = (1_024_000.0 / f64::from(self.tag.rate)).round() as u32;
                self.time = self.time.wrapping_add(step.min(0xFFFF));

                self.tag.channels = ((header[2] & 0x01) << 2) | ((header[3] >> 6) & 0x03);
                // channels == 0 means an inline PCE; too involved to
                // decode, assumed stereo (and WMP cannot read inband PCE
                // either)
                if self.tag.channels == 0 {
                    self.tag.channels = 2;
                }
                if self.infos & 0xFF != u32::from(self.tag.channels) {
                    self.infos = (self.infos & !0xFF) | u32::from(self.tag.channels);
                    self.tag.is_config = true;
                }

                if self.tag.is_config {
                    let config =
                        mpeg4::write_audio_config((header[2] >> 6) + 1, rate_index, self.tag.channels);
                    source.write_audio(self.track, &self.tag, &config);
                    self.tag.is_config = false; // just one time
                }
            }

            if reader.available() < self.size {
                return reader.available();
            }

            source.write_audio(self.track, &self.tag, reader.read(self.size));
            self.size = 0;
        }

        0
    }

    /// Emit a partially accumulated frame and reset the parser state.
    pub fn on_flush(&mut self, leftover: &[u8], source: &mut dyn Source) {
        if self.size != 0 {
            source.write_audio(self.track, &self.tag, leftover);
        }
        self.size = 0;
        self.infos = 0;
        self.sync_error = false;
        self.time = 0;
    }
}
