//! End-to-end CLI test: remux a generated ADTS file and check the
//! fragmented-MP4 output.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

/// CRC-less ADTS frames for AAC-LC at 48 kHz stereo.
fn adts_stream(frames: usize) -> Vec<u8> {
    let payload = [0x42u8; 64];
    let frame_len = 7 + payload.len();
    let mut stream = Vec::new();
    for _ in 0..frames {
        stream.extend_from_slice(&[
            0xFF,
            0xF1,
            (1 << 6) | (3 << 2),
            ((frame_len >> 11) as u8 & 0x03) | (2 << 6),
            (frame_len >> 3) as u8,
            ((frame_len as u8 & 0x07) << 5) | 0x1F,
            0xFC,
        ]);
        stream.extend_from_slice(&payload);
    }
    stream
}

#[test]
fn remuxes_adts_to_fmp4() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("tone.aac");
    let output = dir.path().join("tone.mp4");
    // ~2 seconds of 21 ms frames, enough to pass the buffer window
    fs::write(&input, adts_stream(100)).unwrap();

    Command::cargo_bin("fragcast")
        .unwrap()
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .arg("--buffer-time")
        .arg("500")
        .arg("--summary")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"audio_packets\""))
        .stdout(predicate::str::contains("mp4a.40.2"));

    let produced = fs::read(&output).unwrap();
    assert!(produced.len() > 8);
    assert_eq!(&produced[4..8], b"ftyp");
}
