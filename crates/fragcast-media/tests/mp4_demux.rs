//! MP4 reader scenarios: static sample tables, fragmented input, and
//! codec configuration handling.

mod common;

use common::{length_prefixed, mp4_box, sps, Recorder, IDR, PPS, SLICE};
use fragcast_codec::mpeg4;
use fragcast_common::media::{AudioCodec, FrameKind};
use fragcast_media::{Demuxer, Format};

fn full_box(name: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut content = vec![version];
    content.extend_from_slice(&flags.to_be_bytes()[1..]);
    content.extend_from_slice(payload);
    mp4_box(name, &content)
}

fn tkhd(track_id: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 8]; // creation + modification
    payload.extend_from_slice(&track_id.to_be_bytes());
    full_box(b"tkhd", 0, 0, &payload)
}

fn mdhd(timescale: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 8]; // creation + modification
    payload.extend_from_slice(&timescale.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // duration
    payload.extend_from_slice(&0x55C4u16.to_be_bytes()); // und
    payload.extend_from_slice(&[0, 0]); // pre-defined
    full_box(b"mdhd", 0, 0, &payload)
}

/// esds descriptor chain carrying an inline AudioSpecificConfig.
fn esds(config: &[u8]) -> Vec<u8> {
    let mut descriptor5 = vec![0x05, config.len() as u8];
    descriptor5.extend_from_slice(config);

    let mut descriptor4 = vec![0x04, (13 + descriptor5.len()) as u8, 0x40, 0x15];
    descriptor4.extend_from_slice(&[0; 11]); // buffer size + bitrates
    descriptor4.extend_from_slice(&descriptor5);

    let mut descriptor3 = vec![0x03, (3 + descriptor4.len()) as u8, 0x00, 0x01, 0x00];
    descriptor3.extend_from_slice(&descriptor4);

    full_box(b"esds", 0, 0, &descriptor3)
}

fn mp4a(rate: u16, channels: u16, esds: &[u8]) -> Vec<u8> {
    let mut entry = vec![0u8; 6]; // reserved
    entry.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    entry.extend_from_slice(&0u16.to_be_bytes()); // version 0
    entry.extend_from_slice(&[0; 6]); // revision + vendor
    entry.extend_from_slice(&channels.to_be_bytes());
    entry.extend_from_slice(&16u16.to_be_bytes()); // sample size
    entry.extend_from_slice(&[0; 4]); // compression + packet size
    entry.extend_from_slice(&rate.to_be_bytes());
    entry.extend_from_slice(&[0, 0]);
    entry.extend_from_slice(esds);
    mp4_box(b"mp4a", &entry)
}

fn avc1(sps: &[u8]) -> Vec<u8> {
    let mut entry = vec![0u8; 6]; // reserved
    entry.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    entry.extend_from_slice(&[0; 70]); // version .. depth + color id
    let mut avcc = bytes::BytesMut::new();
    fragcast_codec::avc::write_video_config(&mut avcc, sps, None);
    entry.extend_from_slice(&mp4_box(b"avcC", &avcc));
    mp4_box(b"avc1", &entry)
}

fn stsd(entry: &[u8]) -> Vec<u8> {
    let mut payload = 1u32.to_be_bytes().to_vec(); // entry count
    payload.extend_from_slice(entry);
    full_box(b"stsd", 0, 0, &payload)
}

fn stts(entries: &[(u32, u32)]) -> Vec<u8> {
    let mut payload = (entries.len() as u32).to_be_bytes().to_vec();
    for &(count, delta) in entries {
        payload.extend_from_slice(&count.to_be_bytes());
        payload.extend_from_slice(&delta.to_be_bytes());
    }
    full_box(b"stts", 0, 0, &payload)
}

fn stsc(entries: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut payload = (entries.len() as u32).to_be_bytes().to_vec();
    for &(first, samples, index) in entries {
        payload.extend_from_slice(&first.to_be_bytes());
        payload.extend_from_slice(&samples.to_be_bytes());
        payload.extend_from_slice(&index.to_be_bytes());
    }
    full_box(b"stsc", 0, 0, &payload)
}

fn stsz(sizes: &[u32]) -> Vec<u8> {
    let mut payload = 0u32.to_be_bytes().to_vec(); // no uniform size
    payload.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
    for &size in sizes {
        payload.extend_from_slice(&size.to_be_bytes());
    }
    full_box(b"stsz", 0, 0, &payload)
}

fn stco(offsets: &[u32]) -> Vec<u8> {
    let mut payload = (offsets.len() as u32).to_be_bytes().to_vec();
    for &offset in offsets {
        payload.extend_from_slice(&offset.to_be_bytes());
    }
    full_box(b"stco", 0, 0, &payload)
}

#[test]
fn plain_audio_mp4_delivers_config_then_samples() {
    let asc = mpeg4::write_audio_config(2, 3, 2); // AAC-LC 48 kHz stereo
    let samples: [&[u8]; 2] = [&[0xA1; 5], &[0xB2; 6]];

    // the chunk offset depends on the moov size; build it with a
    // placeholder first
    let build = |chunk_offset: u32| -> Vec<u8> {
        let stbl_payload = [
            stsd(&mp4a(48000, 2, &esds(&asc))),
            stts(&[(2, 21)]),
            stsc(&[(1, 2, 1)]),
            stsz(&[5, 6]),
            stco(&[chunk_offset]),
        ]
        .concat();
        let minf = mp4_box(b"minf", &mp4_box(b"stbl", &stbl_payload));
        let mdia = mp4_box(b"mdia", &[mdhd(1000), minf].concat());
        let trak = mp4_box(b"trak", &[tkhd(1), mdia].concat());
        mp4_box(b"moov", &trak)
    };
    let moov_len = build(0).len();
    let mut stream = build(moov_len as u32 + 8);
    stream.extend(mp4_box(b"mdat", &samples.concat()));

    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Mp4);
    for chunk in stream.chunks(37) {
        demuxer.read(chunk, &mut source);
    }
    demuxer.flush(&mut source);

    assert_eq!(source.audio.len(), 3);
    let (track, tag, payload) = &source.audio[0];
    assert_eq!(*track, 1);
    assert!(tag.is_config);
    assert_eq!(tag.codec, AudioCodec::Aac);
    assert_eq!(tag.rate, 48000);
    assert_eq!(tag.channels, 2);
    assert_eq!(payload, &asc.to_vec());

    assert_eq!(source.audio[1].1.time, 0);
    assert_eq!(source.audio[1].2, vec![0xA1; 5]);
    // 21 timescale units at 1 ms per unit
    assert_eq!(source.audio[2].1.time, 21);
    assert_eq!(source.audio[2].2, vec![0xB2; 6]);
}

#[test]
fn fragmented_video_mp4_uses_trex_defaults() {
    let sps = sps(640, 480);
    let config = length_prefixed(&[&sps, PPS]);

    let mut trex_payload = 1u32.to_be_bytes().to_vec(); // track id
    trex_payload.extend_from_slice(&1u32.to_be_bytes()); // description index
    trex_payload.extend_from_slice(&33u32.to_be_bytes()); // default duration
    trex_payload.extend_from_slice(&0u32.to_be_bytes()); // default size
    trex_payload.extend_from_slice(&0u32.to_be_bytes()); // default flags
    let mvex = mp4_box(b"mvex", &full_box(b"trex", 0, 0, &trex_payload));

    let minf = mp4_box(b"minf", &mp4_box(b"stbl", &stsd(&avc1(&sps))));
    let mdia = mp4_box(b"mdia", &[mdhd(1000), minf].concat());
    let trak = mp4_box(b"trak", &[tkhd(1), mdia].concat());
    let moov = mp4_box(b"moov", &[trak, mvex].concat());

    let samples = [length_prefixed(&[IDR]), length_prefixed(&[SLICE])];
    let mdat = mp4_box(b"mdat", &samples.concat());

    // tfhd with only the track id; trun with data offset + sizes
    let tfhd = full_box(b"tfhd", 0, 0x020000, &1u32.to_be_bytes());
    let build_moof = |data_offset: u32| {
        let mut trun_payload = 2u32.to_be_bytes().to_vec(); // sample count
        trun_payload.extend_from_slice(&data_offset.to_be_bytes());
        trun_payload.extend_from_slice(&(samples[0].len() as u32).to_be_bytes());
        trun_payload.extend_from_slice(&(samples[1].len() as u32).to_be_bytes());
        let traf = mp4_box(
            b"traf",
            &[tfhd.clone(), full_box(b"trun", 0, 0x000201, &trun_payload)].concat(),
        );
        let mfhd = full_box(b"mfhd", 0, 0, &1u32.to_be_bytes());
        mp4_box(b"moof", &[mfhd, traf].concat())
    };
    let moof_len = build_moof(0).len();
    let moof = build_moof(moof_len as u32 + 8);

    let stream = [moov, moof, mdat].concat();

    let mut source = Recorder::default();
    let mut demuxer = Demuxer::new(Format::Mp4);
    demuxer.read(&stream, &mut source);
    demuxer.flush(&mut source);

    assert_eq!(source.video.len(), 3, "config + two frames");
    assert_eq!(source.video[0].1.frame, FrameKind::Config);
    assert_eq!(source.video[1].1.frame, FrameKind::Key);
    assert_eq!(source.video[1].1.time, 0);
    assert_eq!(source.video[2].1.frame, FrameKind::Inter);
    assert_eq!(source.video[2].1.time, 33);
}
