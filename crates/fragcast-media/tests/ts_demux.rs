//! MPEG-TS demultiplexer scenarios: program discovery, PES timing,
//! continuity accounting, and stream-change resets.

mod common;

use common::{annexb, pat, pes, pmt, sps, ts_packet, Recorder, IDR, PPS, SLICE};
use fragcast_common::media::{FrameKind, MediaKind};
use fragcast_media::{Demuxer, Format};

const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;
const PMT_PID: u16 = 0x1000;

fn ms(milliseconds: u64) -> u64 {
    milliseconds * 90
}

#[test]
fn single_program_video_end_to_end() {
    // one PAT, one PMT mapping an H.264 pid, three PES-wrapped access
    // units with PTS 0/33/67 ms
    let sps = sps(1280, 720);
    let mut stream = Vec::new();
    stream.extend(ts_packet(0, true, 0, &pat(PMT_PID, 0x1111_1111)));
    stream.extend(ts_packet(
        PMT_PID,
        true,
        0,
        &pmt(&[(0x1B, VIDEO_PID, &[])], 0),
    ));
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        0,
        &pes(0xE0, ms(0), &annexb(&[&sps, PPS, IDR])),
    ));
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        1,
        &pes(0xE0, ms(33), &annexb(&[SLICE])),
    ));
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        2,
        &pes(0xE0, ms(67), &annexb(&[SLICE])),
    ));

    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Ts);
    // arbitrary chunking must not matter
    for chunk in stream.chunks(100) {
        demuxer.read(chunk, &mut source);
    }
    demuxer.flush(&mut source);

    assert_eq!(source.video.len(), 4, "one config + three frames");
    let (track, tag, config) = &source.video[0];
    assert_eq!(*track, 1);
    assert_eq!(tag.frame, FrameKind::Config);
    assert_eq!(tag.time, 0);
    // SPS and PPS length-prefixed in one payload
    assert_eq!(config[..4], (sps.len() as u32).to_be_bytes());
    assert_eq!(&config[4..4 + sps.len()], &sps[..]);

    let times: Vec<u32> = source.video[1..].iter().map(|(_, tag, _)| tag.time).collect();
    assert_eq!(times, vec![0, 33, 67]);
    assert_eq!(source.video[1].1.frame, FrameKind::Key);
    assert_eq!(source.video[2].1.frame, FrameKind::Inter);
    assert!(source.lost.is_empty());
    // flush resets the sink before flushing it
    assert_eq!(source.resets, 1);
    assert_eq!(source.flushes, 1);
}

#[test]
fn continuity_gap_reports_lost_bytes() {
    let mut stream = Vec::new();
    stream.extend(ts_packet(0, true, 0, &pat(PMT_PID, 0x2222_2222)));
    stream.extend(ts_packet(
        PMT_PID,
        true,
        0,
        &pmt(&[(0x1B, VIDEO_PID, &[])], 0),
    ));
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        0,
        &pes(0xE0, ms(0), &annexb(&[SLICE])),
    ));
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        1,
        &pes(0xE0, ms(33), &annexb(&[SLICE])),
    ));
    // continuity jumps from 1 to 5: 3 packets missing
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        5,
        &pes(0xE0, ms(167), &annexb(&[SLICE])),
    ));

    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Ts);
    demuxer.read(&stream, &mut source);
    demuxer.flush(&mut source);

    assert_eq!(source.lost.len(), 1);
    let (kind, lost, track) = source.lost[0];
    assert_eq!(kind, MediaKind::Video);
    assert_eq!(lost, 3 * 184);
    assert_eq!(track, 1);
    // the stream resumes at the next PES header
    assert!(source
        .video
        .iter()
        .any(|(_, tag, _)| tag.time == 167));
}

#[test]
fn adts_track_inside_ts() {
    // an ADTS AAC elementary stream gets its own audio track id and a
    // synthesized config packet
    let frame_len = 7 + 8;
    let mut adts = vec![
        0xFF,
        0xF1,
        (1 << 6) | (3 << 2), // AAC-LC, 48 kHz
        (2 << 6) | ((frame_len >> 11) as u8 & 0x03),
        (frame_len >> 3) as u8,
        ((frame_len as u8 & 0x07) << 5) | 0x1F,
        0xFC,
    ];
    adts.extend_from_slice(&[0x11; 8]);

    let mut stream = Vec::new();
    stream.extend(ts_packet(0, true, 0, &pat(PMT_PID, 0x3333_3333)));
    stream.extend(ts_packet(
        PMT_PID,
        true,
        0,
        &pmt(&[(0x0F, AUDIO_PID, &[])], 0),
    ));
    stream.extend(ts_packet(AUDIO_PID, true, 0, &pes(0xC0, ms(10), &adts)));

    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Ts);
    demuxer.read(&stream, &mut source);
    demuxer.flush(&mut source);

    assert_eq!(source.audio.len(), 2);
    let (track, tag, _) = &source.audio[0];
    assert_eq!(*track, 1);
    assert!(tag.is_config);
    assert_eq!(tag.rate, 48000);
    assert_eq!(tag.channels, 2);
    let (_, tag, payload) = &source.audio[1];
    assert!(!tag.is_config);
    assert_eq!(tag.time, 10);
    assert_eq!(payload, &vec![0x11; 8]);
}

#[test]
fn pat_checksum_change_resets_the_sink() {
    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Ts);

    let mut stream = Vec::new();
    stream.extend(ts_packet(0, true, 0, &pat(PMT_PID, 0x4444_4444)));
    stream.extend(ts_packet(
        PMT_PID,
        true,
        0,
        &pmt(&[(0x1B, VIDEO_PID, &[])], 0),
    ));
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        0,
        &pes(0xE0, ms(0), &annexb(&[SLICE])),
    ));
    demuxer.read(&stream, &mut source);
    assert_eq!(source.resets, 0);

    // a different PAT fingerprint means a brand-new program lineup
    demuxer.read(&ts_packet(0, true, 1, &pat(PMT_PID, 0x5555_5555)), &mut source);
    assert_eq!(source.resets, 1);

    // same fingerprint again: no reset
    demuxer.read(&ts_packet(0, true, 2, &pat(PMT_PID, 0x5555_5555)), &mut source);
    assert_eq!(source.resets, 1);
}

#[test]
fn audio_language_descriptor_surfaces_as_properties() {
    let language: &[u8] = &[0x0A, 0x04, b'e', b'n', b'g', 0x00];
    let mut stream = Vec::new();
    stream.extend(ts_packet(0, true, 0, &pat(PMT_PID, 0x6666_6666)));
    stream.extend(ts_packet(
        PMT_PID,
        true,
        0,
        &pmt(&[(0x0F, AUDIO_PID, language)], 0),
    ));

    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Ts);
    demuxer.read(&stream, &mut source);

    assert_eq!(source.properties.len(), 1);
    let (track, _, payload) = &source.properties[0];
    assert_eq!(*track, 1);
    let parsed: std::collections::BTreeMap<String, String> =
        serde_json::from_slice(payload).unwrap();
    assert_eq!(parsed.get("audioLang").map(String::as_str), Some("eng"));
}

#[test]
fn garbage_between_packets_resynchronizes() {
    let mut stream = vec![0x12, 0x34, 0x56]; // leading garbage
    stream.extend(ts_packet(0, true, 0, &pat(PMT_PID, 0x7777_7777)));
    stream.extend(ts_packet(
        PMT_PID,
        true,
        0,
        &pmt(&[(0x1B, VIDEO_PID, &[])], 0),
    ));
    stream.extend(ts_packet(
        VIDEO_PID,
        true,
        0,
        &pes(0xE0, ms(0), &annexb(&[SLICE])),
    ));

    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Ts);
    demuxer.read(&stream, &mut source);
    demuxer.flush(&mut source);

    assert_eq!(source.video.len(), 1);
}
