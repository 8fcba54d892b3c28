//! MPEG-2 Transport Stream reader.
//!
//! Fixed 188-byte packets behind a 0x47 sync byte. PID 0 carries the
//! PAT (its CRC bytes double as the stream fingerprint: a change means a
//! new program lineup and resets everything); PMT PIDs map elementary
//! streams to codec readers with auto-incrementing track ids per media
//! kind. Per-PID 4-bit continuity counters quantify packet loss; PES
//! headers convert the 90 kHz PTS/DTS clock into stream-relative
//! millisecond timing.

use std::collections::BTreeMap;
use std::collections::HashMap;

use super::adts::AdtsReader;
use super::nal::NalTrackReader;
use super::StreamBuffer;
use fragcast_common::media::{DataKind, MediaKind, Source};
use fragcast_common::ByteReader;
use tracing::{error, warn};

/// 184 is the maximum TS payload size; it is impossible to know whether
/// a missing packet carried a payload header or an adaptation field, so
/// the loss estimate is `gap * 184`.
const LOST_BYTES_PER_PACKET: u32 = 184;

enum Elementary {
    Nal(NalTrackReader),
    Adts(AdtsReader),
}

/// One elementary stream with its own accumulation buffer and timing
/// state driven by PES headers.
struct TrackReader {
    buffer: StreamBuffer,
    inner: Elementary,
}

impl TrackReader {
    fn new(inner: Elementary) -> Self {
        Self {
            buffer: StreamBuffer::default(),
            inner,
        }
    }

    fn is_same_kind(&self, other: &Elementary) -> bool {
        matches!(
            (&self.inner, other),
            (Elementary::Nal(_), Elementary::Nal(_)) | (Elementary::Adts(_), Elementary::Adts(_))
        )
    }

    fn read(&mut self, data: &[u8], source: &mut dyn Source) {
        if data.is_empty() {
            return;
        }
        let Self { buffer, inner } = self;
        let ok = buffer.feed(data, |bytes| match inner {
            Elementary::Nal(reader) => reader.parse(bytes, source),
            Elementary::Adts(reader) => reader.parse(bytes, source),
        });
        if !ok {
            warn!("TS elementary stream buffer overflow, resynchronizing");
            self.flush(source);
        }
    }

    fn flush(&mut self, source: &mut dyn Source) {
        let leftover = self.buffer.take();
        match &mut self.inner {
            Elementary::Nal(reader) => reader.on_flush(source),
            Elementary::Adts(reader) => reader.on_flush(&leftover, source),
        }
    }

    fn track(&self) -> u8 {
        match &self.inner {
            Elementary::Nal(reader) => reader.track,
            Elementary::Adts(reader) => reader.track,
        }
    }

    fn set_track(&mut self, track: u8) {
        match &mut self.inner {
            Elementary::Nal(reader) => reader.track = track,
            Elementary::Adts(reader) => reader.track = track,
        }
    }

    fn set_time(&mut self, time: u32) {
        match &mut self.inner {
            Elementary::Nal(reader) => reader.time = time,
            Elementary::Adts(reader) => reader.time = time,
        }
    }

    fn set_composition_offset(&mut self, offset: u16) {
        if let Elementary::Nal(reader) = &mut self.inner {
            reader.composition_offset = offset;
        }
    }
}

/// Per-PID program state.
struct Program {
    kind: MediaKind,
    reader: Option<TrackReader>,
    wait_header: bool,
    sequence: u8,
}

impl Default for Program {
    fn default() -> Self {
        Self {
            kind: MediaKind::None,
            reader: None,
            wait_header: true,
            sequence: 0xFF,
        }
    }
}

impl Program {
    /// Install a codec reader unless one of the same kind is already
    /// running (parameters are kept so only a change flushes).
    fn set(&mut self, kind: MediaKind, reader: Elementary, source: &mut dyn Source) {
        if let Some(current) = &self.reader {
            if current.is_same_kind(&reader) {
                return;
            }
        }
        self.kind = kind;
        if let Some(mut current) = self.reader.take() {
            current.flush(source);
        }
        self.reader = Some(TrackReader::new(reader));
    }

    /// Drop the codec reader; `kind` is kept so an unchanged PMT entry
    /// does not burn a new track id later.
    fn reset(&mut self, source: &mut dyn Source) {
        if let Some(mut current) = self.reader.take() {
            current.flush(source);
        }
    }

    fn flush(&mut self, source: &mut dyn Source) {
        if let Some(reader) = &mut self.reader {
            reader.flush(source);
        }
    }

    fn track(&self) -> u8 {
        self.reader.as_ref().map(|reader| reader.track()).unwrap_or(0)
    }
}

#[derive(Default)]
struct TrackProperties {
    map: BTreeMap<String, String>,
    dirty: bool,
}

/// Streaming MPEG-TS parser.
pub struct TsReader {
    sync_found: bool,
    sync_error: bool,
    crc_pat: u32,
    audio_track: u8,
    video_track: u8,
    start_time: Option<f64>,
    programs: HashMap<u16, Program>,
    /// PMT pid -> last parsed version (0xFF = not seen yet).
    pmts: HashMap<u16, u8>,
    properties: HashMap<u8, TrackProperties>,
}

impl TsReader {
    pub fn new() -> Self {
        Self {
            sync_found: false,
            sync_error: false,
            crc_pat: 0,
            audio_track: 0,
            video_track: 0,
            start_time: None,
            programs: HashMap::new(),
            pmts: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    pub fn parse(&mut self, data: &[u8], source: &mut dyn Source) -> usize {
        let mut input = ByteReader::new(data);

        loop {
            if !self.sync_found {
                loop {
                    if input.available() == 0 {
                        return 0;
                    }
                    if input.read8() == 0x47 {
                        break;
                    }
                    if !self.sync_error {
                        self.sync_error = true;
                        error!("TSReader 47 signature not found");
                    }
                }
                self.sync_found = true;
                self.sync_error = false;
            }

            if input.available() < 187 {
                return input.available();
            }

            let packet = input.read(187);
            self.sync_found = false;
            let mut reader = ByteReader::new(packet);

            let byte = reader.read8();
            let has_header = byte & 0x40 != 0; // payload unit start
            let pid = (u16::from(byte & 0x1F) << 8) | u16::from(reader.read8());

            let byte = reader.read8();
            let has_content = byte & 0x10 != 0;
            if byte & 0x20 != 0 {
                // adaptation field, with optional PCR
                let mut length = usize::from(reader.read8());
                if length >= 7 {
                    if reader.read8() & 0x10 != 0 {
                        length -= reader.next(6);
                    }
                    length -= 1;
                }
                reader.next(length);
            }

            if pid == 0 {
                // assume the PAT fits one packet (and needs a payload)
                if has_header && has_content {
                    self.parse_pat(&mut reader, source);
                }
                continue;
            }
            if pid == 0x1FFF {
                continue; // null packet, fixed-bandwidth padding
            }

            if !self.programs.contains_key(&pid) {
                if has_header && has_content && self.pmts.contains_key(&pid) {
                    self.parse_psi(&mut reader, pid, source);
                }
                continue;
            }

            // program known
            let Some(program) = self.programs.get_mut(&pid) else {
                continue;
            };
            if program.reader.is_none() {
                continue; // unsupported track, ignored
            }

            let sequence = byte & 0x0F;
            let mut gap = i32::from(sequence) - i32::from(program.sequence);
            if has_content {
                gap -= 1; // the counter only increments on payload
            }
            let lost = (gap & 0x0F) as u32 * LOST_BYTES_PER_PACKET;
            if lost != 0 {
                if !program.wait_header {
                    program.wait_header = true;
                    program.flush(source); // flush to reset the codec state
                }
                // sequence 0xFF is the first packet ever, nothing lost yet
                if program.sequence != 0xFF {
                    source.report_lost(program.kind, lost, program.track());
                }
            }
            program.sequence = sequence;

            if has_header {
                Self::read_pes_header(&mut self.start_time, &mut reader, program);
            }

            if has_content && !program.wait_header {
                let payload = &packet[reader.position()..];
                if let Some(reader) = &mut program.reader {
                    reader.read(payload, source);
                }
            }
        }
    }

    fn parse_pat(&mut self, reader: &mut ByteReader, source: &mut dyn Source) {
        let skip = usize::from(reader.read8());
        reader.next(skip); // pointer field
        if reader.read8() != 0 {
            warn!("PID = 0 points a non PAT table");
            return;
        }

        let mut pmts = HashMap::new();
        let size = usize::from(reader.read16() & 0x03FF);
        if reader.shrink(size) < size {
            warn!("PAT splitted table not supported, maximum supported PMT is 42");
        }
        // stream id + reserved + version/cni + section numbers
        reader.next(5);

        while reader.available() > 4 {
            reader.next(2); // program number
            pmts.insert(reader.read16() & 0x1FFF, 0xFFu8);
        }

        // the CRC bytes identify the stream: a new PAT is a new stream
        let crc = reader.read32();
        if self.crc_pat == crc {
            return;
        }
        if self.crc_pat != 0 {
            for program in self.programs.values_mut() {
                program.flush(source);
            }
            self.programs.clear();
            self.properties.clear();
            self.start_time = None;
            self.audio_track = 0;
            self.video_track = 0;
            source.reset();
        }
        self.pmts = pmts;
        self.crc_pat = crc;
    }

    fn parse_psi(&mut self, reader: &mut ByteReader, pid: u16, source: &mut dyn Source) {
        if reader.available() == 0 {
            return;
        }
        let skip = usize::from(reader.read8());
        if skip >= reader.available() {
            return;
        }
        reader.next(skip); // pointer field
        if reader.current() == 0x02 {
            reader.next(1);
            self.parse_pmt(reader, pid, source);
        }
    }

    fn parse_pmt(&mut self, reader: &mut ByteReader, pid: u16, source: &mut dyn Source) {
        let size = usize::from(reader.read16() & 0x03FF);
        if reader.shrink(size) < size {
            warn!("PMT splitted table not supported, maximum supported programs is 33");
        }
        if reader.available() < 9 {
            warn!("Invalid too shorter PMT table");
            return;
        }
        reader.next(2); // program number
        let version = (reader.read8() >> 1) & 0x1F;
        reader.next(2); // section numbers

        if self.pmts.get(&pid) == Some(&version) {
            return; // no change
        }
        // a PMT update is not a new stream: timestamps and sink state
        // stay untouched
        self.pmts.insert(pid, version);

        reader.next(2); // PCR pid
        let skip = usize::from(reader.read16() & 0x0FFF);
        reader.next(skip); // program info

        while reader.available() > 4 {
            let stream_type = reader.read8();
            let es_pid = reader.read16() & 0x1FFF;

            let program = self.programs.entry(es_pid).or_default();
            let old_kind = program.kind;

            match stream_type {
                0x1B => {
                    // H.264 video
                    program.set(MediaKind::Video, Elementary::Nal(NalTrackReader::new(1)), source);
                }
                0x24 => {
                    warn!("unsupported HEVC type in PMT");
                }
                0x0F => {
                    // AAC audio (ADTS framed)
                    program.set(MediaKind::Audio, Elementary::Adts(AdtsReader::new(0)), source);
                }
                0x03 | 0x04 => {
                    // MPEG-1/2 audio
                    warn!("unsupported MP3 type in PMT");
                }
                other => {
                    warn!("unsupported type {other:#x} in PMT");
                    program.reset(source);
                    let skip = usize::from(reader.read16() & 0x0FFF);
                    reader.next(skip); // ES info
                    continue;
                }
            }

            if old_kind != program.kind {
                // added or type changed
                match program.kind {
                    MediaKind::Audio => {
                        self.audio_track += 1;
                        if let Some(track) = &mut program.reader {
                            track.set_track(self.audio_track);
                        }
                    }
                    MediaKind::Video => {
                        self.video_track += 1;
                        if let Some(track) = &mut program.reader {
                            track.set_track(self.video_track);
                        }
                    }
                    _ => {}
                }
            }
            let track = program.track();
            Self::read_es_info(&mut self.properties, reader, track);
        }
        // 4 CRC bytes ignored

        // surface changed properties out-of-band
        for (&track, entry) in &mut self.properties {
            if !entry.dirty {
                continue;
            }
            entry.dirty = false;
            if let Ok(payload) = serde_json::to_vec(&entry.map) {
                source.set_properties(track, DataKind::Json, &payload);
            }
        }
    }

    /// Elementary stream info descriptors: ISO-639 audio language (0x0A)
    /// and ATSC caption services (0x86).
    fn read_es_info(
        properties: &mut HashMap<u8, TrackProperties>,
        reader: &mut ByteReader,
        track: u8,
    ) {
        let mut set = |key: u8, name: &str, lang: &[u8]| {
            let mut lang = lang;
            while !lang.is_empty() && lang[0] == 0 {
                lang = &lang[1..]; // possible zero prefix
            }
            if lang.is_empty() {
                return;
            }
            let entry = properties.entry(key).or_default();
            let value = String::from_utf8_lossy(lang).into_owned();
            if entry.map.get(name) != Some(&value) {
                entry.map.insert(name.to_string(), value);
                entry.dirty = true;
            }
        };

        let mut available = i32::from(reader.read16() & 0x0FFF);
        while available > 0 && reader.available() > 0 {
            available -= 1;
            let descriptor = reader.read8();
            if descriptor == 0xFF {
                continue; // null padding
            }
            available -= 1;
            if available < 0 {
                break;
            }
            let size = usize::from(reader.read8());
            let position = reader.position();
            let granted = reader.next(size);
            let data = &reader.data()[position..position + granted];
            available -= granted as i32;

            match descriptor {
                0x0A => {
                    // ISO 639 language + audio option
                    set(track, "audioLang", &data[..granted.min(3)]);
                }
                0x86 => {
                    // caption service descriptor
                    let mut desc = ByteReader::new(data);
                    let mut count = desc.read8() & 0x1F;
                    while count > 0 {
                        count -= 1;
                        let position = desc.position();
                        let got = desc.next(3);
                        let lang = &data[position..position + got];
                        let channel = desc.read8();
                        if channel & 0x80 != 0 {
                            set(
                                track.wrapping_mul(4).wrapping_add(channel & 0x3F),
                                "textLang",
                                lang,
                            );
                        }
                        desc.next(2);
                    }
                }
                _ => {}
            }
        }
    }

    /// Decode a PES optional header: 33-bit PTS/DTS on the 90 kHz clock
    /// into stream-relative milliseconds.
    fn read_pes_header(start_time: &mut Option<f64>, reader: &mut ByteReader, program: &mut Program) {
        // prefix 00 00 01 + stream id byte
        let value = reader.read32();
        let is_video = value & 0x20 != 0;
        if value & 0xFFC0 != 0x1C0 {
            warn!(
                "PES start code not found or not a {} packet",
                if is_video { "video" } else { "audio" }
            );
            return;
        }
        program.wait_header = false;
        reader.next(3); // packet length + marker bits

        let flags = (reader.read8() & 0xC0) >> 6;
        let mut length = i32::from(reader.read8());

        if flags & 0x02 != 0 {
            let mut pts = Self::read_timestamp(reader);
            length -= 5;
            pts /= 90.0;

            let dts = if flags == 0x03 {
                let mut dts = Self::read_timestamp(reader);
                length -= 5;
                dts /= 90.0;
                if pts < dts {
                    warn!("Decoding time {dts} superior to presentation time {pts}");
                    dts = pts;
                }
                dts
            } else {
                pts
            };

            // rebase long-session streams which start at a huge timestamp
            match *start_time {
                Some(start) if start > dts => {
                    warn!("Time {dts} inferior to start time {start}");
                    *start_time = Some(dts);
                }
                None => {
                    // keep a 200 ms guard under the first timestamp (the
                    // minimum required offset with PCR)
                    *start_time = Some(dts - dts.min(200.0));
                }
                _ => {}
            }
            let start = start_time.unwrap_or(0.0);
            if let Some(track) = &mut program.reader {
                track.set_time((dts.round() - start).min(4_294_967_295.0) as u32);
                track.set_composition_offset(((pts - dts).round().clamp(0.0, 65_535.0)) as u16);
            }
        }

        // skip the rest of the header
        if length < 0 {
            warn!(
                "Bad {} PES length",
                if is_video { "video" } else { "audio" }
            );
        } else {
            reader.next(length as usize);
        }
    }

    fn read_timestamp(reader: &mut ByteReader) -> f64 {
        let value = ((u64::from(reader.read8()) & 0x0E) << 29)
            | ((u64::from(reader.read16()) & 0xFFFE) << 14)
            | ((u64::from(reader.read16()) & 0xFFFE) >> 1);
        value as f64
    }

    pub fn on_flush(&mut self, source: &mut dyn Source) {
        for program in self.programs.values_mut() {
            program.flush(source);
        }
        self.programs.clear();
        self.audio_track = 0;
        self.video_track = 0;
        self.pmts.clear();
        self.properties.clear();
        self.sync_found = false;
        self.sync_error = false;
        self.crc_pat = 0;
        self.start_time = None;
    }
}

impl Default for TsReader {
    fn default() -> Self {
        Self::new()
    }
}
