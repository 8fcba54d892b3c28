//! H.264/AVC bitstream helpers: NAL classification, decoder
//! configuration records, and SPS dimension extraction.

use bytes::{BufMut, BytesMut};
use fragcast_common::media::FrameKind;
use fragcast_common::{BitReader, ByteReader};
use tracing::{error, warn};

/// H.264 NAL unit type codes (5-bit).
pub mod nal {
    pub const UNDEFINED: u8 = 0;
    pub const SLICE_NIDR: u8 = 1;
    pub const SLICE_A: u8 = 2;
    pub const SLICE_B: u8 = 3;
    pub const SLICE_C: u8 = 4;
    pub const SLICE_IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    /// Access unit delimiter; this and higher types close the pending
    /// access unit.
    pub const AUD: u8 = 9;
    pub const END_SEQ: u8 = 10;
    pub const END_STREAM: u8 = 11;
    pub const FILLER: u8 = 12;
}

/// Frame significance of NAL types 0..=8; higher types are unspecified.
const FRAMES: [FrameKind; 9] = [
    FrameKind::Unspecified,
    FrameKind::Inter,
    FrameKind::Inter,
    FrameKind::Inter,
    FrameKind::Inter,
    FrameKind::Key,
    FrameKind::Info,
    FrameKind::Config, // SPS
    FrameKind::Config, // PPS
];

/// Extract the 5-bit NAL unit type from a NAL header byte.
pub fn nal_type(byte: u8) -> u8 {
    byte & 0x1F
}

/// Frame significance of a single NAL unit type.
pub fn frame_from_nal(nal_type: u8) -> FrameKind {
    if nal_type > 8 {
        FrameKind::Unspecified
    } else {
        FRAMES[usize::from(nal_type)]
    }
}

/// Fold one more NAL unit into the significance of the access unit being
/// accumulated.
///
/// Key/config significance is sticky: once reached it is never
/// downgraded by a later slice in the same access unit.
pub fn update_frame(nal_type: u8, frame: FrameKind) -> FrameKind {
    if frame == FrameKind::Key || frame == FrameKind::Config {
        return frame;
    }
    let kind = frame_from_nal(nal_type);
    if frame == FrameKind::Unspecified {
        return kind;
    }
    match kind {
        FrameKind::Unspecified => frame,
        FrameKind::Key | FrameKind::Config | FrameKind::Inter => kind,
        _ => {
            if frame == FrameKind::Inter || frame == FrameKind::DisposableInter {
                frame
            } else {
                kind
            }
        }
    }
}

/// Locate the SPS (and PPS, when present) inside a length-prefixed
/// decoder configuration payload.
///
/// Returns `None` (with a warning) when no SPS is found; a missing PPS
/// is tolerated.
pub fn parse_video_config(data: &[u8]) -> Option<(&[u8], Option<&[u8]>)> {
    let mut reader = ByteReader::new(data);
    let mut sps = None;
    let mut pps = None;
    while reader.available() > 0 {
        let mut length = reader.read32() as usize;
        if length > reader.available() {
            length = reader.available();
        }
        if length == 0 {
            continue;
        }
        let unit = &data[reader.position()..reader.position() + length];
        match nal_type(reader.current()) {
            nal::SPS => sps = Some(unit),
            nal::PPS => pps = Some(unit),
            _ => {}
        }
        reader.next(length);
    }
    if let Some(sps) = sps {
        return Some((sps, pps));
    }
    warn!("H264 configuration malformed");
    None
}

/// Convert an AVCDecoderConfigurationRecord (avcC) into the
/// length-prefixed NAL form used by the canonical config packet.
///
/// Returns the number of bytes consumed from `data`.
pub fn read_video_config(data: &[u8], out: &mut BytesMut) -> usize {
    let mut reader = ByteReader::new(data);
    // skip avcC version 1 + profile, compatibility, level + lengthSizeMinusOne
    reader.next(5);

    let mut count = reader.read8() & 0x1F; // number of SPS
    let mut is_pps = false;
    while reader.available() >= 2 && count > 0 {
        count -= 1;
        let mut size = usize::from(reader.read16());
        if size > reader.available() {
            size = reader.available();
        }
        out.put_u32(size as u32);
        out.put_slice(&data[reader.position()..reader.position() + size]);
        reader.next(size);
        if count == 0 {
            if is_pps {
                break;
            }
            count = reader.read8(); // PPS now
            is_pps = true;
        }
    }
    reader.position()
}

/// Serialize SPS + PPS into an AVCDecoderConfigurationRecord (avcC).
pub fn write_video_config(out: &mut BytesMut, sps: &[u8], pps: Option<&[u8]>) {
    out.put_u8(0x01); // avcC version 1
    out.put_slice(sps.get(1..4).unwrap_or(&[0, 0, 0])); // profile, compatibility, level
    out.put_u8(0xFF); // 111111 + 2-bit NAL size - 1

    out.put_u8(0xE1); // 111 + number of SPS
    out.put_u16(sps.len() as u16);
    out.put_slice(sps);

    out.put_u8(0x01); // number of PPS
    match pps {
        Some(pps) => {
            out.put_u16(pps.len() as u16);
            out.put_slice(pps);
        }
        None => out.put_u16(0),
    }
}

/// Decode the cropped pixel dimensions from an SPS NAL unit.
///
/// Returns `width << 16 | height`, or 0 when the payload is not an SPS.
pub fn sps_to_dimension(data: &[u8]) -> u32 {
    let mut reader = BitReader::new(data);
    if reader.read_bits(8) as u8 & 0x1F != nal::SPS {
        error!("Invalid SPS data");
        return 0;
    }

    let mut left_offset = 0u32;
    let mut right_offset = 0u32;
    let mut top_offset = 0u32;
    let mut bottom_offset = 0u32;
    let mut sub_width_c = 0u32;
    let mut sub_height_c = 0u32;

    let idc = reader.read_bits(8);
    reader.next(16); // constraint flags + level
    reader.read_exp_golomb(); // seq_parameter_set_id

    if matches!(idc, 100 | 110 | 122 | 144 | 44 | 83 | 86 | 118) {
        match reader.read_exp_golomb() {
            // chroma_format_idc
            1 => {
                // 4:2:0
                sub_width_c = 2;
                sub_height_c = 2;
            }
            2 => {
                // 4:2:2
                sub_width_c = 2;
                sub_height_c = 1;
            }
            3 => {
                // 4:4:4
                if !reader.read_bit() {
                    // separate_colour_plane_flag
                    sub_width_c = 1;
                    sub_height_c = 1;
                }
            }
            _ => {}
        }

        reader.read_exp_golomb(); // bit_depth_luma_minus8
        reader.read_exp_golomb(); // bit_depth_chroma_minus8
        reader.next(1); // qpprime_y_zero_transform_bypass_flag
        if reader.read_bit() {
            // seq_scaling_matrix_present_flag
            for i in 0..8 {
                if reader.read_bit() {
                    // seq_scaling_list_present_flag
                    let size_of_scaling_list = if i < 6 { 16 } else { 64 };
                    let mut scale = 8i32;
                    for _ in 0..size_of_scaling_list {
                        let raw = reader.read_exp_golomb() as i32;
                        let delta = if raw & 1 != 0 { (raw + 1) / 2 } else { -(raw / 2) };
                        scale = (scale + delta + 256) % 256;
                        if scale == 0 {
                            break;
                        }
                    }
                }
            }
        }
    }

    reader.read_exp_golomb(); // log2_max_frame_num_minus4
    let pic_order_cnt_type = reader.read_exp_golomb();
    if pic_order_cnt_type == 0 {
        reader.read_exp_golomb(); // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        reader.next(1); // delta_pic_order_always_zero_flag
        reader.read_exp_golomb(); // offset_for_non_ref_pic
        reader.read_exp_golomb(); // offset_for_top_to_bottom_field
        let ref_frames = reader.read_exp_golomb();
        for _ in 0..ref_frames {
            reader.read_exp_golomb(); // offset_for_ref_frame[i]
        }
    }
    reader.read_exp_golomb(); // max_num_ref_frames
    reader.next(1); // gaps_in_frame_num_value_allowed_flag
    let pic_width = (reader.read_exp_golomb() + 1) * 16;
    let mut pic_height = (reader.read_exp_golomb() + 1) * 16;
    if !reader.read_bit() {
        // frame_mbs_only_flag: interlaced, height counts field pairs
        pic_height *= 2;
        sub_height_c *= 2;
        reader.next(1); // mb_adaptive_frame_field_flag
    }

    reader.next(1); // direct_8x8_inference_flag
    if reader.read_bit() {
        // frame_cropping_flag
        left_offset = reader.read_exp_golomb();
        right_offset = reader.read_exp_golomb();
        top_offset = reader.read_exp_golomb();
        bottom_offset = reader.read_exp_golomb();
    }

    let width = pic_width.wrapping_sub(sub_width_c * (left_offset + right_offset)) & 0xFFFF;
    let height = pic_height.wrapping_sub(sub_height_c * (top_offset + bottom_offset)) & 0xFFFF;
    (width << 16) | height
}
