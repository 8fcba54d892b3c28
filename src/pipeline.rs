//! Glue between a demultiplexer and the fragmented-MP4 writer that
//! keeps running stream statistics for the CLI summary.

use fragcast_common::media::{AudioTag, DataKind, MediaKind, Source, VideoTag};
use fragcast_media::Mp4Writer;
use serde::Serialize;

/// Counters reported by `--summary`.
#[derive(Debug, Default, Serialize)]
pub struct StreamSummary {
    pub format: String,
    pub bytes: u64,
    pub audio_packets: u64,
    pub video_packets: u64,
    pub data_packets: u64,
    pub audio_tracks: u8,
    pub video_tracks: u8,
    pub lost_bytes: u64,
    pub resets: u64,
    /// Number of output writes (segment headers + frame payloads).
    pub writes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codecs: Option<String>,
}

/// Forwards the canonical packet stream into the remultiplexer while
/// counting what passes through.
pub struct Pipeline {
    writer: Mp4Writer,
    summary: StreamSummary,
}

impl Pipeline {
    pub fn new(writer: Mp4Writer) -> Self {
        Self {
            writer,
            summary: StreamSummary::default(),
        }
    }

    pub fn into_summary(mut self) -> StreamSummary {
        self.capture_codecs();
        self.summary
    }

    fn capture_codecs(&mut self) {
        if self.summary.codecs.is_none() {
            self.summary.codecs = self.writer.codecs().map(str::to_owned);
        }
    }
}

impl Source for Pipeline {
    fn write_audio(&mut self, track: u8, tag: &AudioTag, data: &[u8]) {
        self.summary.audio_packets += 1;
        self.summary.audio_tracks = self.summary.audio_tracks.max(track);
        self.writer.write_audio(track, tag, data);
        self.capture_codecs();
    }

    fn write_video(&mut self, track: u8, tag: &VideoTag, data: &[u8]) {
        self.summary.video_packets += 1;
        self.summary.video_tracks = self.summary.video_tracks.max(track);
        self.writer.write_video(track, tag, data);
        self.capture_codecs();
    }

    fn write_data(&mut self, _track: u8, _kind: DataKind, _data: &[u8]) {
        self.summary.data_packets += 1;
    }

    fn set_properties(&mut self, track: u8, _kind: DataKind, data: &[u8]) {
        tracing::debug!(
            "track {track} properties: {}",
            String::from_utf8_lossy(data)
        );
    }

    fn report_lost(&mut self, kind: MediaKind, lost: u32, track: u8) {
        tracing::warn!("lost {lost} bytes on {kind:?} track {track}");
        self.summary.lost_bytes += u64::from(lost);
    }

    fn reset(&mut self) {
        self.summary.resets += 1;
        self.capture_codecs();
        Source::reset(&mut self.writer);
    }

    fn flush(&mut self) {
        Source::flush(&mut self.writer);
    }
}
