//! End-to-end: a synthetic TS stream demultiplexed straight into the
//! fragmented-MP4 remultiplexer.

mod common;

use std::sync::{Arc, Mutex};

use common::{annexb, assert_box_sizes, find_box, pat, pes, pmt, sps, ts_packet, IDR, PPS, SLICE};
use fragcast_media::{Demuxer, Format, Mp4Writer};

#[test]
fn ts_to_fmp4_pipeline() {
    let sps = sps(640, 480);

    // H.264 access units at a 33 ms cadence
    let mut stream = Vec::new();
    stream.extend(ts_packet(0, true, 0, &pat(0x1000, 0x0BAD_CAFE)));
    stream.extend(ts_packet(0x1000, true, 0, &pmt(&[(0x1B, 0x0100, &[])], 0)));
    stream.extend(ts_packet(
        0x0100,
        true,
        0,
        &pes(0xE0, 0, &annexb(&[&sps, PPS, IDR])),
    ));
    for index in 1u64..8 {
        stream.extend(ts_packet(
            0x0100,
            true,
            index as u8,
            &pes(0xE0, index * 33 * 90, &annexb(&[SLICE])),
        ));
    }

    let writes = Arc::new(Mutex::new(Vec::new()));
    let sink = writes.clone();
    let mut writer = Mp4Writer::new(100);
    writer.set_on_write(move |data: &[u8]| {
        sink.lock().unwrap().push(data.to_vec());
        true
    });

    let mut demuxer = Demuxer::new(Format::Ts);
    assert_eq!(Format::detect(&stream).unwrap(), Format::Ts);
    for chunk in stream.chunks(64) {
        demuxer.read(chunk, &mut writer);
    }
    demuxer.flush(&mut writer);

    let output = writes.lock().unwrap().concat();
    assert!(!output.is_empty());
    assert_eq!(&output[4..8], b"ftyp");
    assert_box_sizes(&output);

    // init segment derives its dimensions from the inband SPS
    let moov = find_box(&output, b"moov").expect("init segment");
    let tkhd = find_box(moov, b"tkhd").expect("tkhd");
    let width = u16::from_be_bytes([tkhd[76], tkhd[77]]);
    let height = u16::from_be_bytes([tkhd[80], tkhd[81]]);
    assert_eq!((width, height), (640, 480));

    // at least one media segment with a sane sample count
    let moof = find_box(&output, b"moof").expect("media segment");
    let trun = find_box(moof, b"trun").expect("trun");
    let count = u32::from_be_bytes([trun[4], trun[5], trun[6], trun[7]]);
    assert!(count >= 1);
}
