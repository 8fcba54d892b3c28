//! Fragmented-MP4 remultiplexer.
//!
//! Consumes the canonical packet stream, buffers frames per track, and
//! emits an init segment (`ftyp` + `moov`) followed by media segments
//! (`moof` + `mdat`), each independently appendable by an MSE-style
//! consumer. No media segment is written unless every started track
//! contributes at least one sample; a track that stays silent past the
//! buffer window is restarted and announced through a fresh init
//! segment.

mod init;
mod moof;

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use fragcast_common::media::{distance32, AudioTag, FrameKind, Source, VideoTag};
use tracing::{debug, info, warn};

/// Steady-state minimum buffered window before a segment is cut (ms).
const MIN_SEGMENT_MS: i32 = 100;

/// One buffered frame (sample).
pub(crate) struct Frame {
    pub is_sync: bool,
    pub time: u32,
    pub composition_offset: u16,
    pub data: Vec<u8>,
}

/// Per-track FIFO of pending frames plus rolling metadata.
pub(crate) struct Frames {
    /// Codec id of the buffered frames (0 = none yet).
    pub codec: u8,
    pub has_composition_offset: bool,
    pub has_key: bool,
    pub rate: u32,
    pub last_duration: u32,
    pub last_time: u32,
    pub config: Option<Vec<u8>>,
    pub write_config: bool,
    started: bool,
    frames: VecDeque<Frame>,
}

impl Default for Frames {
    fn default() -> Self {
        Self {
            codec: 0,
            has_composition_offset: false,
            has_key: false,
            rate: 0,
            last_duration: 0,
            last_time: 0,
            config: None,
            write_config: false,
            started: false,
            frames: VecDeque::new(),
        }
    }
}

impl Frames {
    pub fn started(&self) -> bool {
        self.started
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn front(&self) -> Option<&Frame> {
        self.frames.front()
    }

    pub fn back(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// traf byte size for the current frame list and flag set.
    pub fn size_traf(&self) -> usize {
        let per_sample = match (self.has_composition_offset, self.has_key) {
            (true, true) => 16,
            (true, false) => 12,
            (false, true) => 12,
            (false, false) => 8,
        };
        60 + self.frames.len() * per_sample
    }

    fn push(&mut self, is_sync: bool, time: u32, composition_offset: u16, codec: u8, data: Vec<u8>) {
        self.frames.push_back(Frame {
            is_sync,
            time,
            composition_offset,
            data,
        });
        if self.codec == 0 {
            // first use: delta starts at zero for this track
            self.last_time = self.frames[0].time;
        }
        self.codec = codec;
        self.started = true;
    }

    fn restart(&mut self) {
        info!("MP4 track removed");
        self.started = false;
    }

    /// Hand over the buffered frames, prepending the pending decoder
    /// config exactly once.
    fn flush(&mut self) -> VecDeque<Frame> {
        self.has_key = false;
        self.has_composition_offset = false;
        let mut frames = std::mem::take(&mut self.frames);
        if self.write_config {
            if let Some(config) = &self.config {
                frames.push_front(Frame {
                    is_sync: true,
                    time: 0,
                    composition_offset: 0,
                    data: config.clone(),
                });
            }
            self.write_config = false;
        }
        frames
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum FlushMode {
    /// Ordinary buffering check.
    Check,
    /// Forced by a configuration/codec change.
    Reset,
    /// Final flush of the stream.
    Final,
}

/// Fragmented-MP4 writer.
///
/// `buffer_time` (ms) controls the cold-start window: the first segment
/// waits for that much buffered media, steady state cuts every 100 ms.
/// Output is delivered through the `on_write` callback, header before
/// payload; returning `false` detaches the callback.
pub struct Mp4Writer {
    buffer_time: u32,
    videos: Vec<Frames>,
    audios: Vec<Frames>,
    buffering: bool,
    sequence: u32,
    started: bool,
    time_front: u32,
    time_back: u32,
    codecs: Option<String>,
    on_write: Option<Box<dyn FnMut(&[u8]) -> bool + Send>>,
}

impl Mp4Writer {
    pub fn new(buffer_time_ms: u32) -> Self {
        debug!("MP4 bufferTime set to {buffer_time_ms} ms");
        Self {
            buffer_time: buffer_time_ms,
            videos: Vec::new(),
            audios: Vec::new(),
            buffering: true,
            sequence: 0,
            started: false,
            time_front: 0,
            time_back: 0,
            codecs: None,
            on_write: None,
        }
    }

    /// Install the segment consumer.
    pub fn set_on_write(&mut self, on_write: impl FnMut(&[u8]) -> bool + Send + 'static) {
        self.on_write = Some(Box::new(on_write));
    }

    /// Codec string accumulated from the last init segment
    /// (`avc1.PPCCLL`, `mp4a.40.2`), for container MIME selection.
    pub fn codecs(&self) -> Option<&str> {
        self.codecs.as_deref()
    }

    pub fn write_audio(&mut self, track: u8, tag: &AudioTag, data: &[u8]) {
        let index = usize::from(track.max(1)) - 1;
        while self.audios.len() <= index {
            self.audios.push(Frames::default());
        }

        let audios = &self.audios[index];
        let last = audios
            .back()
            .map(|frame| frame.time)
            .unwrap_or(audios.last_time);
        if distance32(last, tag.time) < 0 {
            warn!("Non-monotonic audio timestamp, packet ignored");
            return;
        }

        if tag.is_config {
            if self.audios[index].config.as_deref() != Some(data) {
                if self.audios[index].started {
                    // MSE requires decoder reinitialization on change
                    self.flush_segments(FlushMode::Reset);
                }
                self.audios[index].config = Some(data.to_vec());
            }
            if self.audios[index].rate == 0 {
                // sometimes only the config packet carries the rate
                self.audios[index].rate = tag.rate;
            }
            return;
        }

        self.time_back = tag.time;
        // flush before buffering the new frame, with a reset when the
        // codec changes or a new track appears mid-stream
        let mode = if self.audios[index].started {
            if self.audios[index].codec != tag.codec.code() {
                FlushMode::Reset
            } else {
                FlushMode::Check
            }
        } else if !self.buffering {
            FlushMode::Reset
        } else {
            FlushMode::Check
        };
        self.flush_segments(mode);

        let audios = &mut self.audios[index];
        if audios.rate == 0 {
            audios.rate = tag.rate;
        }
        audios.push(true, tag.time, 0, tag.codec.code(), data.to_vec());
    }

    pub fn write_video(&mut self, track: u8, tag: &VideoTag, data: &[u8]) {
        let index = usize::from(track.max(1)) - 1;
        while self.videos.len() <= index {
            self.videos.push(Frames::default());
        }

        let videos = &self.videos[index];
        let last = videos
            .back()
            .map(|frame| frame.time)
            .unwrap_or(videos.last_time);
        if distance32(last, tag.time) < 0 {
            warn!("Non-monotonic video timestamp, packet ignored");
            return;
        }

        if tag.frame == FrameKind::Config {
            if self.videos[index].config.as_deref() != Some(data) {
                if self.videos[index].started {
                    self.flush_segments(FlushMode::Reset);
                }
                self.videos[index].config = Some(data.to_vec());
            }
            return;
        }

        self.time_back = tag.time;
        let mode = if self.videos[index].started {
            if self.videos[index].codec != tag.codec.code() {
                FlushMode::Reset
            } else {
                FlushMode::Check
            }
        } else if !self.buffering {
            FlushMode::Reset
        } else {
            FlushMode::Check
        };
        self.flush_segments(mode);

        let videos = &mut self.videos[index];
        if tag.frame == FrameKind::Key {
            videos.has_key = true;
        }
        if tag.composition_offset != 0 {
            videos.has_composition_offset = true;
        }
        videos.push(
            tag.frame == FrameKind::Key,
            tag.time,
            tag.composition_offset,
            tag.codec.code(),
            data.to_vec(),
        );
    }

    /// Write out whatever is buffered and reinitialize.
    pub fn flush(&mut self) {
        if self.started {
            self.flush_segments(FlushMode::Final);
        }
        self.videos.clear();
        self.audios.clear();
        self.buffering = true;
        self.sequence = 0;
        self.started = false;
        self.time_front = 0;
        self.time_back = 0;
        self.codecs = None;
    }

    fn flush_segments(&mut self, mode: FlushMode) {
        if !self.started {
            self.started = true;
            self.time_front = self.time_back;
        }

        let reset = mode != FlushMode::Check;
        let delta = distance32(self.time_front, self.time_back);
        let threshold = if self.buffering {
            self.buffer_time as i32
        } else {
            MIN_SEGMENT_MS
        };
        if !reset && delta < threshold {
            return;
        }

        // MSE requires at least one sample per started track in every
        // segment; compute the moof size along the way
        let mut size_moof = 0usize;
        let sequence = self.sequence;
        let buffer_time = self.buffer_time as i32;
        for videos in &mut self.videos {
            if !videos.started {
                continue;
            }
            if sequence < 14 {
                // firefox starts playing early when the sync-sample
                // flag is absent; keep it set over the initial window
                videos.has_key = true;
            }
            if videos.is_empty() {
                if delta < buffer_time {
                    if reset {
                        self.buffering = true;
                    }
                    return; // wait for a sample on this track
                }
                videos.restart();
                self.buffering = true;
            } else {
                size_moof += videos.size_traf();
            }
        }
        for audios in &mut self.audios {
            if !audios.started {
                continue;
            }
            if audios.is_empty() {
                if delta < buffer_time {
                    if reset {
                        self.buffering = true;
                    }
                    return;
                }
                audios.restart();
                self.buffering = true;
            } else {
                size_moof += audios.size_traf();
            }
        }
        if size_moof == 0 {
            // nothing to write
            self.buffering = true;
            return;
        }

        let mut writer = BytesMut::new();

        if self.buffering {
            self.buffering = false;
            self.codecs = None;
            init::write_init_segment(
                &mut writer,
                &mut self.videos,
                &mut self.audios,
                &mut self.codecs,
            );
        }

        // moof
        let size_moof = size_moof + 24;
        writer.put_u32(size_moof as u32);
        writer.put_slice(b"moof");
        // mfhd, sequence starts at 1
        writer.put_u32(16);
        writer.put_slice(b"mfhd");
        writer.put_u32(0); // version + flags
        self.sequence += 1;
        writer.put_u32(self.sequence);

        // traf track ids count started tracks, matching the init traks
        let mut data_offset = size_moof + 8; // 8 for the mdat header
        let mut track = 0u32;
        let time_back = self.time_back;
        for videos in &mut self.videos {
            if videos.started {
                track += 1;
                data_offset = moof::write_track(&mut writer, track, videos, data_offset, time_back);
            }
        }
        for audios in &mut self.audios {
            if audios.started {
                track += 1;
                data_offset = moof::write_track(&mut writer, track, audios, data_offset, time_back);
            }
        }

        // mdat
        writer.put_u32((data_offset - size_moof) as u32);
        writer.put_slice(b"mdat");

        // hand over the payload and fully update state before invoking
        // the sink, so a reentrant flush sees cleared buffers
        let mut media_frames = Vec::new();
        for videos in &mut self.videos {
            if videos.started {
                media_frames.push(videos.flush());
            }
        }
        for audios in &mut self.audios {
            if audios.started {
                media_frames.push(audios.flush());
            }
        }
        self.time_front = self.time_back;
        if reset {
            self.buffering = true;
            if mode == FlushMode::Reset {
                info!("MP4 dynamic configuration change");
            }
        }

        // header first, then payload frame by frame, as separate writes
        let header = writer.freeze();
        self.emit(&header);
        for frames in media_frames {
            for frame in frames {
                self.emit(&frame.data);
            }
        }
    }

    fn emit(&mut self, data: &[u8]) {
        if let Some(on_write) = &mut self.on_write {
            if !on_write(data) {
                self.on_write = None;
            }
        }
    }
}

impl Source for Mp4Writer {
    fn write_audio(&mut self, track: u8, tag: &AudioTag, data: &[u8]) {
        Mp4Writer::write_audio(self, track, tag, data);
    }

    fn write_video(&mut self, track: u8, tag: &VideoTag, data: &[u8]) {
        Mp4Writer::write_video(self, track, tag, data);
    }

    fn reset(&mut self) {
        Mp4Writer::flush(self);
    }

    fn flush(&mut self) {
        Mp4Writer::flush(self);
    }
}
