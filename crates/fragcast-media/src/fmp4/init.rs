//! Init segment (ftyp + moov) serialization.
//!
//! One `trak` per started track: video traks derive their dimensions
//! from the most recent SPS, audio traks embed the decoder config in
//! `esds`. The accumulated codec string (`avc1.PPCCLL`, `mp4a.40.2`)
//! lets the playback side pick a matching container MIME type.

use bytes::{BufMut, BytesMut};
use fragcast_codec::avc;
use fragcast_common::media::AudioCodec;
use tracing::warn;

use super::Frames;

/// Backpatch a 4-byte size field reserved at `start`.
fn patch_size(writer: &mut BytesMut, start: usize) {
    let size = (writer.len() - start) as u32;
    writer[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn append_codec(codecs: &mut Option<String>, value: &str) {
    match codecs {
        Some(list) => {
            list.push_str(", ");
            list.push_str(value);
        }
        None => *codecs = Some(value.to_string()),
    }
}

/// Serialize the whole init segment for every started track, and mark
/// video tracks to re-emit their config inband with the next segment.
pub(crate) fn write_init_segment(
    writer: &mut BytesMut,
    videos: &mut [Frames],
    audios: &mut [Frames],
    codecs: &mut Option<String>,
) {
    // ftyp: iso5 + iso6mp41
    writer.put_u32(24);
    writer.put_slice(b"ftyp");
    writer.put_slice(b"iso5"); // major brand
    writer.put_u32(0x200); // minor version
    writer.put_slice(b"iso6");
    writer.put_slice(b"mp41");

    // moov
    let moov_start = writer.len();
    writer.put_u32(0); // patched below
    writer.put_slice(b"moov");

    write_mvhd(writer, (videos.len() + audios.len() + 1) as u32);

    let mut track = 0u32;
    for frames in videos.iter_mut() {
        if !frames.started() {
            continue;
        }
        track += 1;
        frames.write_config = true;
        write_video_trak(writer, track, frames, codecs);
    }
    for frames in audios.iter_mut() {
        if !frames.started() {
            continue;
        }
        track += 1;
        write_audio_trak(writer, track, frames, codecs);
    }

    // mvex is required by the MSE byte-stream format
    writer.put_u32(8 + track * 32);
    writer.put_slice(b"mvex");
    let mut id = track;
    while id > 0 {
        writer.put_u32(32);
        writer.put_slice(b"trex");
        writer.put_u32(0); // version + flags
        writer.put_u32(id);
        writer.put_u32(1); // default sample description index
        writer.put_u32(0); // default sample duration
        writer.put_u32(0); // default sample size
        writer.put_u32(0); // default sample flags
        id -= 1;
    }

    patch_size(writer, moov_start);
}

fn write_mvhd(writer: &mut BytesMut, next_track_id: u32) {
    writer.put_u32(108);
    writer.put_slice(b"mvhd");
    writer.put_u32(0); // version + flags
    writer.put_u32(0); // creation time
    writer.put_u32(0); // modification time
    writer.put_u32(1000); // timescale, 1 ms precision
    writer.put_u32(0); // duration
    writer.put_u32(0x0001_0000); // rate = 1.0
    writer.put_u16(0x0100); // volume = 1.0
    writer.put_u16(0); // reserved
    writer.put_u64(0); // reserved
    write_identity_matrix(writer);
    for _ in 0..6 {
        writer.put_u32(0); // pre-defined
    }
    writer.put_u32(next_track_id);
}

fn write_identity_matrix(writer: &mut BytesMut) {
    writer.put_u32(0x0001_0000);
    writer.put_u32(0);
    writer.put_u32(0);
    writer.put_u32(0);
    writer.put_u32(0x0001_0000);
    writer.put_u32(0);
    writer.put_u32(0);
    writer.put_u32(0);
    writer.put_u32(0x4000_0000);
}

fn write_tkhd(writer: &mut BytesMut, track: u32, dimension: u32) {
    writer.put_u32(92);
    writer.put_slice(b"tkhd");
    writer.put_u32(3); // version 0, flags: enabled + in movie
    writer.put_u32(0); // creation time
    writer.put_u32(0); // modification time
    writer.put_u32(track);
    writer.put_u32(0); // reserved
    writer.put_u32(0); // duration
    writer.put_u64(0); // reserved
    writer.put_u16(0); // layer
    writer.put_u16(0); // alternate group
    writer.put_u16(0); // volume
    writer.put_u16(0); // reserved
    write_identity_matrix(writer);
    // width and height, 16.16 fixed point
    writer.put_u16((dimension >> 16) as u16);
    writer.put_u16(0);
    writer.put_u16((dimension & 0xFFFF) as u16);
    writer.put_u16(0);
}

fn write_mdhd(writer: &mut BytesMut) {
    writer.put_u32(32);
    writer.put_slice(b"mdhd");
    writer.put_u32(0); // version + flags
    writer.put_u32(0); // creation time
    writer.put_u32(0); // modification time
    writer.put_u32(1000); // timescale, 1 ms precision
    writer.put_u32(0); // duration
    writer.put_u16(0x55C4); // language: undetermined
    writer.put_u16(0); // pre-defined
}

fn write_hdlr(writer: &mut BytesMut, handler: &[u8; 4]) {
    writer.put_u32(33);
    writer.put_slice(b"hdlr");
    writer.put_u32(0); // version + flags
    writer.put_u32(0); // pre-defined
    writer.put_slice(handler);
    writer.put_u32(0); // reserved
    writer.put_u32(0);
    writer.put_u32(0);
    writer.put_u8(0); // empty name
}

fn write_dinf(writer: &mut BytesMut) {
    writer.put_u32(36);
    writer.put_slice(b"dinf");
    writer.put_u32(28);
    writer.put_slice(b"dref");
    writer.put_u32(0); // version + flags
    writer.put_u32(1); // entry count
    writer.put_u32(12);
    writer.put_slice(b"url ");
    writer.put_u32(1); // flags: self-contained
}

/// stts + stsc + stsz + stco, all empty (samples live in fragments).
fn write_empty_sample_tables(writer: &mut BytesMut) {
    writer.put_u32(16);
    writer.put_slice(b"stts");
    writer.put_u64(0);
    writer.put_u32(16);
    writer.put_slice(b"stsc");
    writer.put_u64(0);
    writer.put_u32(20);
    writer.put_slice(b"stsz");
    writer.put_u64(0);
    writer.put_u32(0);
    writer.put_u32(16);
    writer.put_slice(b"stco");
    writer.put_u64(0);
}

fn write_video_trak(
    writer: &mut BytesMut,
    track: u32,
    frames: &Frames,
    codecs: &mut Option<String>,
) {
    let trak_start = writer.len();
    writer.put_u32(0); // patched below
    writer.put_slice(b"trak");

    let mut sps: Option<&[u8]> = None;
    let mut pps: Option<&[u8]> = None;
    let mut dimension = 0u32;
    match frames.config.as_deref().and_then(avc::parse_video_config) {
        Some((found_sps, found_pps)) => {
            dimension = avc::sps_to_dimension(found_sps);
            sps = Some(found_sps);
            pps = found_pps;
        }
        None => warn!("No avcC configuration"),
    }

    write_tkhd(writer, track, dimension);

    // mdia
    let mdia_start = writer.len();
    writer.put_u32(0);
    writer.put_slice(b"mdia");
    write_mdhd(writer);
    write_hdlr(writer, b"vide");

    // minf
    let minf_start = writer.len();
    writer.put_u32(0);
    writer.put_slice(b"minf");
    writer.put_u32(20);
    writer.put_slice(b"vmhd");
    writer.put_u32(1); // version + flags
    writer.put_u16(0); // graphics mode
    writer.put_u16(0);
    writer.put_u16(0);
    writer.put_u16(0); // opcolor
    write_dinf(writer);

    // stbl
    let stbl_start = writer.len();
    writer.put_u32(0);
    writer.put_slice(b"stbl");

    // stsd
    let stsd_start = writer.len();
    writer.put_u32(0);
    writer.put_slice(b"stsd");
    writer.put_u32(0); // version + flags
    writer.put_u32(1); // entry count

    // avc1: the configuration record stays in the init segment (avc3
    // would allow inband-only config, players are not ready for it)
    let avc1_start = writer.len();
    writer.put_u32(0);
    writer.put_slice(b"avc1");
    writer.put_slice(&[0; 6]); // reserved
    writer.put_u16(1); // data reference index
    writer.put_u32(0); // version + revision level
    writer.put_u32(0); // vendor
    writer.put_u32(0); // temporal quality
    writer.put_u32(0); // spatial quality
    writer.put_u32(dimension); // width + height
    writer.put_u32(0); // horizontal resolution
    writer.put_u32(0); // vertical resolution
    writer.put_u32(0); // data size
    writer.put_u16(1); // frames per sample
    writer.put_slice(&[0; 32]); // compressor name
    writer.put_u16(0x0018); // depth
    writer.put_u16(0xFFFF); // default color table

    if let Some(sps) = sps {
        let avcc_start = writer.len();
        writer.put_u32(0);
        writer.put_slice(b"avcC");
        avc::write_video_config(writer, sps, pps);
        patch_size(writer, avcc_start);

        let mut codec = String::from("avc1.");
        for &value in &sps[1..4] {
            codec.push_str(&format!("{value:02x}"));
        }
        append_codec(codecs, &codec);
    }
    patch_size(writer, avc1_start);
    patch_size(writer, stsd_start);

    write_empty_sample_tables(writer);
    patch_size(writer, stbl_start);
    patch_size(writer, minf_start);
    patch_size(writer, mdia_start);
    patch_size(writer, trak_start);
}

fn write_audio_trak(
    writer: &mut BytesMut,
    track: u32,
    frames: &Frames,
    codecs: &mut Option<String>,
) {
    let trak_start = writer.len();
    writer.put_u32(0); // patched below
    writer.put_slice(b"trak");

    write_tkhd(writer, track, 0);

    // mdia
    let mdia_start = writer.len();
    writer.put_u32(0);
    writer.put_slice(b"mdia");
    write_mdhd(writer);
    write_hdlr(writer, b"soun");

    // minf + smhd + dinf + stbl + stsd + mp4a + esds carry their sizes
    // up front, so the esds descriptor lengths derive from one counter
    let mut config: Option<&[u8]> = None;
    let mut size = 223usize;
    match &frames.config {
        Some(bytes) if bytes.len() <= 0xFF => {
            config = Some(bytes);
            size += bytes.len() + 2;
        }
        Some(bytes) => {
            warn!(
                "Audio config with size of {} too large for mp4a/esds box",
                bytes.len()
            );
        }
        None => {
            if frames.codec == AudioCodec::Aac.code() {
                warn!("Audio AAC track without any configuration packet preloaded");
            }
        }
    }

    writer.put_u32(size as u32);
    writer.put_slice(b"minf");
    writer.put_u32(16);
    writer.put_slice(b"smhd");
    writer.put_u32(0); // version + flags
    writer.put_u16(0); // balance
    writer.put_u16(0); // reserved
    write_dinf(writer);

    size -= 60;
    writer.put_u32(size as u32);
    writer.put_slice(b"stbl");

    size -= 76;
    writer.put_u32(size as u32);
    writer.put_slice(b"stsd");
    writer.put_u32(0); // version + flags
    writer.put_u32(1); // entry count

    size -= 16;
    writer.put_u32(size as u32);
    // mp4a version 0: the config packet is the precise source anyway
    writer.put_slice(b"mp4a");
    writer.put_slice(&[0; 6]); // reserved
    writer.put_u16(1); // data reference index
    writer.put_u16(0); // version
    writer.put_u16(0); // revision level
    writer.put_u32(0); // vendor
    writer.put_u16(2); // channels
    writer.put_u16(16); // bits
    writer.put_u16(0); // compression id
    writer.put_u16(0); // packet size
    // introductory rate indication only, the config packet is precise
    writer.put_u16(frames.rate.min(0xFFFF) as u16);
    writer.put_u16(0);

    size -= 36;
    writer.put_u32(size as u32);
    writer.put_slice(b"esds");
    writer.put_u32(0); // version + flags
    writer.put_u8(0x03); // ES descriptor
    size -= 14;
    writer.put_u8(size as u8);
    writer.put_u16(track as u16); // ES id
    writer.put_u8(0); // flags + stream priority
    writer.put_u8(0x04); // decoder config descriptor
    size -= 8;
    writer.put_u8(size as u8);

    // 0x40 = MPEG-4 audio, 0x69 = MPEG-2 audio
    let mut codec = String::from("mp4a.");
    if frames.codec == AudioCodec::Aac.code() {
        writer.put_u8(0x40);
        codec.push_str("40");
    } else {
        writer.put_u8(0x69);
        codec.push_str("69");
    }

    writer.put_u8(0x15); // stream type: audio
    writer.put_slice(&[0; 3]); // buffer size
    writer.put_u32(0); // max bitrate
    writer.put_u32(0); // average bitrate

    if let Some(config) = config {
        writer.put_u8(0x05); // audio config descriptor
        writer.put_u8(config.len() as u8);
        writer.put_slice(config);
        if frames.codec == AudioCodec::Aac.code() {
            codec.push('.');
            codec.push_str(&(config[0] >> 3).to_string());
        }
    }
    append_codec(codecs, &codec);

    // SL config descriptor
    writer.put_u8(0x06);
    writer.put_u8(0x01);
    writer.put_u8(0x02);

    write_empty_sample_tables(writer);

    patch_size(writer, mdia_start);
    patch_size(writer, trak_start);
}
