//! Track fragment (traf) serialization for media segments.

use bytes::{BufMut, BytesMut};
use fragcast_common::media::{add_distance32, distance32};
use tracing::warn;

use super::Frames;

/// Write one `traf` (tfhd + tfdt + trun) for the buffered frames.
///
/// `data_offset` addresses the track's payload inside the upcoming
/// `mdat` relative to the `moof` start; the updated offset (past this
/// track's samples) is returned.
pub(crate) fn write_track(
    writer: &mut BytesMut,
    track: u32,
    frames: &mut Frames,
    data_offset: usize,
    time_back: u32,
) -> usize {
    let position = writer.len();
    let size_traf = frames.size_traf();
    writer.put_u32(size_traf as u32);
    writer.put_slice(b"traf");

    // tfhd, flags = default-base-is-moof
    writer.put_u32(16);
    writer.put_slice(b"tfhd");
    writer.put_u32(0x0002_0000);
    writer.put_u32(track);

    // the front frame is never behind last_time: non-monotonic packets
    // were dropped on entry
    let front_time = frames.front().map(|frame| frame.time).unwrap_or(0);
    let mut delta = distance32(frames.last_time, front_time) - frames.last_duration as i32;
    if delta.abs() > 4 {
        warn!(
            "Timestamp delta {delta} superior to 4 ({front_time}-{}-{})",
            frames.last_time, frames.last_duration
        );
    }

    // tfdt carries the absolute decode time; an edit list, if any, is
    // ignored by MSE consumers when tfdt is present
    writer.put_u32(16);
    writer.put_slice(b"tfdt");
    writer.put_u32(0); // version + flags
    writer.put_u32(add_distance32(front_time, -delta));

    // trun
    writer.put_u32((size_traf - (writer.len() - position)) as u32);
    writer.put_slice(b"trun");
    let mut flags = 0x0000_0301u32; // data-offset + duration + size
    if frames.has_composition_offset {
        flags |= 0x0000_0800;
    }
    if frames.has_key {
        flags |= 0x0000_0400;
    }
    writer.put_u32(flags);
    writer.put_u32(frames.len() as u32);
    writer.put_u32(data_offset as u32);

    // per-sample entries: each frame lasts until the next one; the last
    // frame repeats the previous duration, or stretches to the newest
    // buffered time when there is none
    let list: Vec<(u32, bool, u16, usize)> = frames
        .iter()
        .map(|frame| {
            (
                frame.time,
                frame.is_sync,
                frame.composition_offset,
                frame.data.len(),
            )
        })
        .collect();
    // the pending config payload rides along as part of the first sample
    let mut size = match (&frames.config, frames.write_config) {
        (Some(config), true) => config.len(),
        _ => 0,
    };

    let mut data_offset = data_offset;
    let mut previous_duration = frames.last_duration;
    let mut last_written = frames.last_time;
    for (index, &(time, is_sync, composition_offset, data_len)) in list.iter().enumerate() {
        let duration = match list.get(index + 1) {
            Some(&(next_time, ..)) => distance32(time, next_time) as u32,
            None => {
                if previous_duration != 0 {
                    previous_duration
                } else {
                    distance32(time, time_back) as u32
                }
            }
        };
        previous_duration = duration;

        size += data_len;
        delta = write_frame(
            writer,
            frames.has_key,
            frames.has_composition_offset,
            duration,
            size,
            is_sync,
            composition_offset,
            delta,
        );
        data_offset += size;
        size = 0;
        last_written = add_distance32(time, -delta);
    }
    frames.last_duration = previous_duration;
    frames.last_time = last_written;

    data_offset
}

/// Write one trun sample entry; a negative inherited `delta` shortens
/// durations until the debt is repaid.
#[allow(clippy::too_many_arguments)]
fn write_frame(
    writer: &mut BytesMut,
    has_key: bool,
    has_composition_offset: bool,
    duration: u32,
    size: usize,
    is_sync: bool,
    composition_offset: u16,
    mut delta: i32,
) -> i32 {
    if delta >= 0 || (duration as i32) > -delta {
        writer.put_u32((duration as i32 + delta) as u32);
        delta = 0;
    } else {
        writer.put_u32(0);
        delta += duration as i32;
    }
    writer.put_u32(size as u32);
    if has_key {
        // 0x02000000 = sample_depends_on no (key or audio)
        // 0x01010000 = sample_depends_on yes + difference sample
        writer.put_u32(if is_sync { 0x0200_0000 } else { 0x0101_0000 });
    }
    if has_composition_offset {
        writer.put_u32(u32::from(composition_offset));
    }
    delta
}
