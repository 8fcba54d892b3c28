//! Annex-B NAL byte-stream reassembly into length-prefixed access units.
//!
//! A 4-state scanner finds `00 00 01` / `00 00 00 01` start codes; NAL
//! units accumulate length-prefixed into a single access-unit buffer.
//! The buffer flushes when a configuration pair (SPS+PPS) completes,
//! when a non-config unit follows configuration, when the container time
//! changes, or when an access-unit delimiter (or higher type) arrives.

use bytes::{BufMut, BytesMut};
use fragcast_codec::avc;
use fragcast_common::media::{FrameKind, Source, VideoTag};
use tracing::warn;

/// Max accumulated access-unit size (a 0x900000 slice + prefix + some
/// SEI); beyond this the buffer is dropped rather than grown.
const MAX_NAL_SIZE: usize = 0x00A0_0000;

/// H.264 elementary track reader. The container sets `track`, `time`
/// and `composition_offset` from its own timing (PES headers).
pub struct NalTrackReader {
    pub track: u8,
    pub time: u32,
    pub composition_offset: u16,
    tag: VideoTag,
    state: u8,
    nal_type: u8,
    /// Accumulated access unit; every contained NAL unit is prefixed
    /// with its 32-bit size, the current one at `position`.
    nal: Option<BytesMut>,
    position: usize,
}

impl NalTrackReader {
    pub fn new(track: u8) -> Self {
        Self {
            track,
            time: 0,
            composition_offset: 0,
            tag: VideoTag::default(),
            state: 0,
            nal_type: 0xFF,
            nal: None,
            position: 0,
        }
    }

    /// Scan a chunk for start codes; always consumes everything.
    pub fn parse(&mut self, data: &[u8], source: &mut dyn Source) -> usize {
        let mut nal_start = 0usize;
        let mut position = 0usize;

        while position < data.len() {
            let value = data[position];
            position += 1;

            // 00 00 01 vs 00 00 00 01: two or more zeros both delimit
            match self.state {
                0 => {
                    if value == 0x00 {
                        self.state = 1;
                    }
                }
                1 => self.state = if value == 0x00 { 2 } else { 0 },
                2 | 3 => {
                    if value == 0x00 {
                        self.state = 3; // any further zeros stay here
                    } else {
                        if value == 0x01 {
                            self.write_nal(data, nal_start, position - nal_start, source, true);
                            nal_start = position;
                            self.nal_type = 0xFF; // new NAL
                        }
                        self.state = 0;
                    }
                }
                _ => self.state = 0,
            }
        }

        if position != nal_start {
            self.write_nal(data, nal_start, position - nal_start, source, false);
        }
        0
    }

    fn write_nal(
        &mut self,
        data: &[u8],
        offset: usize,
        size: usize,
        source: &mut dyn Source,
        end_of_nal: bool,
    ) {
        let mut flush = false;
        if self.nal_type == 0xFF {
            // NAL begin
            self.nal_type = avc::nal_type(data[offset]);
            if self.nal_type >= avc::nal::AUD {
                // flush whatever waits and ignore this unit entirely
                return self.flush_nal(source);
            }

            if self.tag.frame == FrameKind::Config {
                let prev_type = self
                    .nal
                    .as_ref()
                    .map(|nal| avc::nal_type(nal[self.position + 4]))
                    .unwrap_or(0xFF);
                if self.nal_type == prev_type {
                    // repeated config type: erase it and wait for the
                    // other half
                    self.nal = Some(BytesMut::new());
                } else if avc::frame_from_nal(self.nal_type) != FrameKind::Config {
                    if prev_type == avc::nal::SPS {
                        self.flush_nal(source); // a lone SPS is valid
                    } else {
                        self.nal = Some(BytesMut::new()); // a lone PPS is not
                    }
                    self.tag.frame = avc::update_frame(self.nal_type, FrameKind::Unspecified);
                } else {
                    flush = true; // SPS+PPS pair completes with this unit
                }
            } else {
                if avc::frame_from_nal(self.nal_type) == FrameKind::Config {
                    self.flush_nal(source); // flush everything before config
                } else if self.tag.time != self.time
                    || self.tag.composition_offset != self.composition_offset
                {
                    self.flush_nal(source); // flush on time change
                }
                self.tag.frame = avc::update_frame(self.nal_type, self.tag.frame);
            }

            match &mut self.nal {
                Some(nal) => {
                    if nal.is_empty() {
                        self.position = 0;
                    } else {
                        // close the previous unit's size prefix
                        let unit_size = (nal.len() - self.position - 4) as u32;
                        nal[self.position..self.position + 4]
                            .copy_from_slice(&unit_size.to_be_bytes());
                        self.position = nal.len();
                    }
                    nal.put_u32(0); // reserve this unit's size slot
                }
                None => {
                    self.tag.time = self.time;
                    self.tag.composition_offset = self.composition_offset;
                    self.position = 0;
                    let mut nal = BytesMut::with_capacity(size + 4);
                    nal.put_u32(0);
                    self.nal = Some(nal);
                }
            }
        } else {
            let Some(nal) = &self.nal else {
                return; // continuation of an ignored unit
            };
            if nal.len() + size > MAX_NAL_SIZE {
                warn!("NAL buffer exceeds maximum slice size");
                self.tag.frame = FrameKind::Unspecified;
                self.nal = None; // drop and wait for the next start code
                return;
            }
        }

        // end_of_nal: the accumulated bytes include the start code that
        // terminated this unit; trim it (it may straddle chunks)
        let trim = if end_of_nal {
            usize::from(self.state) + 1
        } else {
            0
        };
        if let Some(nal) = &mut self.nal {
            if trim > size {
                let excess = trim - size;
                let keep = nal.len().saturating_sub(excess).max(self.position + 4);
                nal.truncate(keep);
            } else {
                nal.put_slice(&data[offset..offset + size - trim]);
            }
        }

        if flush {
            self.flush_nal(source);
        }
    }

    fn flush_nal(&mut self, source: &mut dyn Source) {
        let Some(mut nal) = self.nal.take() else {
            return;
        };
        if nal.len() >= self.position + 4 {
            let unit_size = (nal.len() - self.position - 4) as u32;
            nal[self.position..self.position + 4].copy_from_slice(&unit_size.to_be_bytes());
        }
        // an empty unit is only valid for a config frame
        if self.tag.frame == FrameKind::Config || nal.len() > 4 {
            source.write_video(self.track, &self.tag, &nal);
        }
        self.tag.frame = FrameKind::Unspecified;
    }

    pub fn on_flush(&mut self, source: &mut dyn Source) {
        self.flush_nal(source);
        self.nal_type = 0xFF;
        self.state = 0;
        self.time = 0;
        self.composition_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragcast_common::media::AudioTag;

    struct Collect {
        packets: Vec<(VideoTag, Vec<u8>)>,
    }

    impl Source for Collect {
        fn write_audio(&mut self, _track: u8, _tag: &AudioTag, _data: &[u8]) {}
        fn write_video(&mut self, _track: u8, tag: &VideoTag, data: &[u8]) {
            self.packets.push((*tag, data.to_vec()));
        }
    }

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F];
    const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x80, 0x10, 0x00];
    const SLICE: &[u8] = &[0x41, 0x9A, 0x02];

    #[test]
    fn config_pair_flushes_as_one_packet() {
        let mut source = Collect {
            packets: Vec::new(),
        };
        let mut reader = NalTrackReader::new(1);
        reader.parse(&annexb(&[SPS, PPS, IDR]), &mut source);
        reader.on_flush(&mut source);

        assert_eq!(source.packets.len(), 2);
        let (config_tag, config) = &source.packets[0];
        assert_eq!(config_tag.frame, FrameKind::Config);
        // length-prefixed SPS then PPS in one payload
        let mut expected = Vec::new();
        expected.extend_from_slice(&(SPS.len() as u32).to_be_bytes());
        expected.extend_from_slice(SPS);
        expected.extend_from_slice(&(PPS.len() as u32).to_be_bytes());
        expected.extend_from_slice(PPS);
        assert_eq!(config, &expected);

        let (frame_tag, frame) = &source.packets[1];
        assert_eq!(frame_tag.frame, FrameKind::Key);
        let mut expected = Vec::new();
        expected.extend_from_slice(&(IDR.len() as u32).to_be_bytes());
        expected.extend_from_slice(IDR);
        assert_eq!(frame, &expected);
    }

    #[test]
    fn time_change_flushes_pending_unit() {
        let mut source = Collect {
            packets: Vec::new(),
        };
        let mut reader = NalTrackReader::new(1);
        reader.time = 0;
        reader.parse(&annexb(&[SLICE]), &mut source);
        reader.time = 33;
        reader.parse(&annexb(&[SLICE]), &mut source);
        reader.time = 67;
        reader.parse(&annexb(&[SLICE]), &mut source);
        reader.on_flush(&mut source);

        let times: Vec<u32> = source.packets.iter().map(|(tag, _)| tag.time).collect();
        assert_eq!(times, vec![0, 33, 67]);
        assert!(source
            .packets
            .iter()
            .all(|(tag, _)| tag.frame == FrameKind::Inter));
    }

    #[test]
    fn start_code_split_across_chunks() {
        let mut source = Collect {
            packets: Vec::new(),
        };
        let mut reader = NalTrackReader::new(1);
        let stream = annexb(&[SLICE, SLICE]);
        // force the second start code to straddle the chunk boundary
        let cut = 4 + SLICE.len() + 2;
        reader.time = 10;
        reader.parse(&stream[..cut], &mut source);
        reader.time = 20;
        reader.parse(&stream[cut..], &mut source);
        reader.on_flush(&mut source);

        assert_eq!(source.packets.len(), 2);
        let mut unit = Vec::new();
        unit.extend_from_slice(&(SLICE.len() as u32).to_be_bytes());
        unit.extend_from_slice(SLICE);
        // the stream-leading start code yields a zero-length first unit
        let mut first = vec![0, 0, 0, 0];
        first.extend_from_slice(&unit);
        assert_eq!(source.packets[0].1, first);
        assert_eq!(source.packets[1].1, unit);
    }

    #[test]
    fn aud_closes_the_access_unit() {
        let mut source = Collect {
            packets: Vec::new(),
        };
        let mut reader = NalTrackReader::new(1);
        let aud = [0x09, 0xF0];
        reader.parse(&annexb(&[SLICE, &aud, SLICE]), &mut source);
        reader.on_flush(&mut source);
        // the AUD itself is swallowed, the slices come out separately
        assert_eq!(source.packets.len(), 2);
    }
}
