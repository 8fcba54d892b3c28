//! Fragmented-MP4 remultiplexer scenarios: segment structure,
//! timestamp round-trips, monotonicity, and per-segment completeness.

mod common;

use std::sync::{Arc, Mutex};

use common::{assert_box_sizes, find_box, length_prefixed, sps, walk_boxes, PPS};
use fragcast_common::media::{AudioCodec, AudioTag, FrameKind, VideoCodec, VideoTag};
use fragcast_media::Mp4Writer;

/// Writer wired to collect every output write separately.
fn collected_writer(buffer_time: u32) -> (Mp4Writer, Arc<Mutex<Vec<Vec<u8>>>>) {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let sink = writes.clone();
    let mut writer = Mp4Writer::new(buffer_time);
    writer.set_on_write(move |data: &[u8]| {
        sink.lock().unwrap().push(data.to_vec());
        true
    });
    (writer, writes)
}

fn concat(writes: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<u8> {
    writes.lock().unwrap().concat()
}

fn audio_tag(time: u32) -> AudioTag {
    AudioTag {
        codec: AudioCodec::Aac,
        time,
        rate: 48000,
        channels: 2,
        is_config: false,
    }
}

fn video_tag(time: u32, frame: FrameKind) -> VideoTag {
    VideoTag {
        codec: VideoCodec::H264,
        time,
        frame,
        composition_offset: 0,
    }
}

/// Decode the trun sample durations and sizes from a media segment.
fn trun_entries(moof: &[u8]) -> (u32, Vec<(u32, u32)>) {
    let trun = find_box(moof, b"trun").expect("trun present");
    let flags = u32::from_be_bytes([trun[0], trun[1], trun[2], trun[3]]);
    let count = u32::from_be_bytes([trun[4], trun[5], trun[6], trun[7]]);
    let mut position = 12; // version/flags + count + data offset
    let mut entries = Vec::new();
    for _ in 0..count {
        let duration = u32::from_be_bytes([
            trun[position],
            trun[position + 1],
            trun[position + 2],
            trun[position + 3],
        ]);
        let size = u32::from_be_bytes([
            trun[position + 4],
            trun[position + 5],
            trun[position + 6],
            trun[position + 7],
        ]);
        entries.push((duration, size));
        position += 8;
        if flags & 0x400 != 0 {
            position += 4;
        }
        if flags & 0x800 != 0 {
            position += 4;
        }
    }
    (flags, entries)
}

#[test]
fn audio_round_trip_reconstructs_durations() {
    let (mut writer, writes) = collected_writer(1000);
    let config = [0x11, 0x90]; // AAC-LC 48 kHz stereo
    writer.write_audio(
        1,
        &AudioTag {
            is_config: true,
            ..audio_tag(0)
        },
        &config,
    );

    // 21 ms cadence until past the cold-start window
    let mut time = 0u32;
    while time <= 1050 {
        writer.write_audio(1, &audio_tag(time), &[0xAA; 32]);
        time += 21;
    }

    let segment = concat(&writes);
    assert!(!segment.is_empty(), "cold-start window exceeded");
    assert_eq!(&segment[4..8], b"ftyp");
    assert_box_sizes(&segment);

    let moof = find_box(&segment, b"moof").expect("media segment present");
    let tfdt = find_box(moof, b"tfdt").expect("tfdt present");
    assert_eq!(u32::from_be_bytes([tfdt[4], tfdt[5], tfdt[6], tfdt[7]]), 0);

    let (_, entries) = trun_entries(moof);
    // every buffered frame, each 21 ms, 32 bytes
    assert!(entries.len() >= 48);
    assert!(entries.iter().all(|&(duration, size)| duration == 21 && size == 32));

    // the codec string reflects the embedded config
    assert_eq!(writer.codecs(), Some("mp4a.40.2"));
}

#[test]
fn non_monotonic_frame_is_dropped_once() {
    let (mut writer, writes) = collected_writer(10_000);
    for &time in &[0u32, 100, 50, 150] {
        writer.write_audio(1, &audio_tag(time), &[time as u8; 4]);
    }
    writer.flush();

    let segment = concat(&writes);
    let moof = find_box(&segment, b"moof").expect("final flush wrote a segment");
    let (_, entries) = trun_entries(moof);
    // exactly the packet at t=50 was dropped
    assert_eq!(entries.len(), 3);
    let sizes: Vec<u32> = entries.iter().map(|&(_, size)| size).collect();
    assert_eq!(sizes, vec![4, 4, 4]);
}

#[test]
fn segment_waits_for_every_started_track() {
    let video_config = length_prefixed(&[&sps(320, 240), PPS]);
    let (mut writer, writes) = collected_writer(1000);

    writer.write_video(1, &video_tag(0, FrameKind::Config), &video_config);
    writer.write_video(1, &video_tag(0, FrameKind::Key), &[0x99; 64]);
    writer.write_audio(1, &audio_tag(0), &[0xAA; 16]);

    // audio advances in 20 ms steps, video in 33 ms steps
    let mut audio_time = 20u32;
    let mut video_time = 33u32;
    while audio_time <= 1200 {
        while video_time <= audio_time {
            writer.write_video(
                1,
                &video_tag(video_time, FrameKind::Inter),
                &[0x99; 48],
            );
            video_time += 33;
        }
        writer.write_audio(1, &audio_tag(audio_time), &[0xAA; 16]);
        audio_time += 20;
    }

    let segment = concat(&writes);
    assert!(!segment.is_empty());
    assert_eq!(&segment[4..8], b"ftyp");
    assert_box_sizes(&segment);

    // both tracks contributed to the first media segment
    let moof = find_box(&segment, b"moof").expect("media segment present");
    let trafs = walk_boxes(moof)
        .into_iter()
        .filter(|(name, _)| name == b"traf")
        .count();
    assert_eq!(trafs, 2);

    // both codecs are announced
    let codecs = writer.codecs().expect("codec string accumulated");
    assert!(codecs.starts_with("avc1.42"), "unexpected codecs {codecs}");
    assert!(codecs.contains("mp4a.40"));
}

#[test]
fn init_segment_structure_is_valid() {
    let video_config = length_prefixed(&[&sps(1280, 720), PPS]);
    let (mut writer, writes) = collected_writer(100);

    writer.write_video(1, &video_tag(0, FrameKind::Config), &video_config);
    writer.write_video(1, &video_tag(0, FrameKind::Key), &[0x01; 32]);
    writer.write_video(1, &video_tag(120, FrameKind::Inter), &[0x02; 16]);

    let segment = concat(&writes);
    assert_box_sizes(&segment);

    let moov = find_box(&segment, b"moov").expect("init segment present");
    // tkhd carries the SPS-derived dimensions in 16.16 fixed point
    let tkhd = find_box(moov, b"tkhd").expect("tkhd present");
    let width = u16::from_be_bytes([tkhd[76], tkhd[77]]);
    let height = u16::from_be_bytes([tkhd[80], tkhd[81]]);
    assert_eq!((width, height), (1280, 720));

    assert!(find_box(moov, b"avcC").is_some());
    assert!(find_box(moov, b"trex").is_some());
    assert!(find_box(moov, b"mvhd").is_some());

    // mfhd sequence starts at 1
    let moof = find_box(&segment, b"moof").expect("media segment present");
    let mfhd = find_box(moof, b"mfhd").expect("mfhd present");
    assert_eq!(u32::from_be_bytes([mfhd[4], mfhd[5], mfhd[6], mfhd[7]]), 1);
}

#[test]
fn config_change_forces_new_init_segment() {
    let (mut writer, writes) = collected_writer(50);
    writer.write_audio(
        1,
        &AudioTag {
            is_config: true,
            ..audio_tag(0)
        },
        &[0x11, 0x90],
    );
    let mut time = 0;
    while time <= 200 {
        writer.write_audio(1, &audio_tag(time), &[0xAA; 8]);
        time += 21;
    }
    let segments_before = {
        let data = concat(&writes);
        assert_eq!(&data[4..8], b"ftyp");
        walk_boxes(&data).len()
    };
    assert!(segments_before > 0);

    // a different AudioSpecificConfig requires decoder reinitialization
    writer.write_audio(
        1,
        &AudioTag {
            is_config: true,
            ..audio_tag(time)
        },
        &[0x12, 0x10],
    );
    while time <= 500 {
        writer.write_audio(1, &audio_tag(time), &[0xBB; 8]);
        time += 21;
    }
    writer.flush();

    let data = concat(&writes);
    let ftyps = walk_boxes(&data)
        .into_iter()
        .filter(|(name, _)| name == b"ftyp")
        .count();
    assert_eq!(ftyps, 2, "config change re-emits the init segment");
}
