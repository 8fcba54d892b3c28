//! ISO-BMFF (MP4) reader, plain and fragmented.
//!
//! A box-stack walker parses arbitrarily nested length-prefixed boxes
//! without buffering whole containers. Static sample tables
//! (stsc/stsz/stts/ctts/stco/co64) and per-fragment overrides
//! (trex/tfhd/trun) resolve every sample's offset, size, duration and
//! composition offset; payload delivery out of `mdat` follows a single
//! globally time-ordered index so packets reach the sink in
//! non-decreasing time order even though chunks are stored per track.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::BytesMut;
use fragcast_codec::{avc, mpeg4};
use fragcast_common::media::{
    AudioCodec, AudioTag, DataKind, FrameKind, MediaKind, Source, VideoCodec, VideoTag,
};
use fragcast_common::ByteReader;
use tracing::{error, warn};

const fn fourcc(name: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*name)
}

const TRAK: u32 = fourcc(b"trak");
const TRAF: u32 = fourcc(b"traf");
const MVEX: u32 = fourcc(b"mvex");
const MDIA: u32 = fourcc(b"mdia");
const MINF: u32 = fourcc(b"minf");
const STBL: u32 = fourcc(b"stbl");
const DINF: u32 = fourcc(b"dinf");
const EDTS: u32 = fourcc(b"edts");
const MOOV: u32 = fourcc(b"moov");
const MOOF: u32 = fourcc(b"moof");
const MDHD: u32 = fourcc(b"mdhd");
const MFHD: u32 = fourcc(b"mfhd");
const ELNG: u32 = fourcc(b"elng");
const CO64: u32 = fourcc(b"co64");
const STCO: u32 = fourcc(b"stco");
const STSD: u32 = fourcc(b"stsd");
const STSC: u32 = fourcc(b"stsc");
const STSZ: u32 = fourcc(b"stsz");
const ELST: u32 = fourcc(b"elst");
const STTS: u32 = fourcc(b"stts");
const CTTS: u32 = fourcc(b"ctts");
const TKHD: u32 = fourcc(b"tkhd");
const TREX: u32 = fourcc(b"trex");
const TFHD: u32 = fourcc(b"tfhd");
const TRUN: u32 = fourcc(b"trun");
const MDAT: u32 = fourcc(b"mdat");

/// Legacy QuickTime language codes (mdhd values below 0x400).
const MAC_LANGS: [&str; 150] = [
    "eng", "fre", "deu", "ita", "dut", "swe", "spa", "dan", "por", "nor", "heb", "jpn", "ara",
    "fin", "grk", "ice", "mlt", "tur", "hrv", "chi", "urd", "hin", "tha", "kor", "lit", "pol",
    "hun", "lav", "fiu", "fao", "per", "rus", "zho", "vls", "gle", "sqi", "ron", "cze", "slk",
    "slv", "yid", "srp", "mac", "bul", "ukr", "bel", "uzb", "kaz", "aze", "aze", "arm", "geo",
    "mol", "mol", "kir", "tgk", "tuk", "mon", "mon", "pus", "kur", "kas", "snd", "tib", "nep",
    "san", "mar", "ben", "asm", "guj", "pan", "ori", "mal", "kan", "tam", "tel", "sin", "bur",
    "khm", "lao", "vie", "ind", "tgl", "mal", "mal", "amh", "tir", "orm", "orm", "som", "swa",
    "kin", "run", "nya", "mlg", "epo", "und", "und", "und", "und", "und", "und", "und", "und",
    "und", "und", "und", "und", "und", "und", "und", "und", "und", "und", "und", "und", "und",
    "und", "und", "und", "und", "und", "und", "und", "und", "und", "und", "und", "und", "wel",
    "baq", "cat", "lat", "que", "grn", "aym", "crh", "uig", "dzo", "jav", "sun", "glg", "afr",
    "bre", "iku", "gla", "glv", "gle", "ton", "gre",
];

/// One frame of the box nesting stack.
#[derive(Debug, Clone, Copy, Default)]
struct BoxFrame {
    code: u32,
    size: usize,
    rest: usize,
}

impl BoxFrame {
    /// Read the next box header in place; false = needs more bytes.
    fn read_header(&mut self, reader: &mut ByteReader) -> bool {
        loop {
            if reader.available() < 8 {
                self.size = 0;
                self.rest = 0;
                return false;
            }
            let size = reader.read32() as usize;
            if size < 8 {
                error!("Bad box format without 4 char name");
                continue; // try to keep reading
            }
            let name = reader.read(4);
            self.code = u32::from_be_bytes([name[0], name[1], name[2], name[3]]);
            self.size = size;
            self.rest = size - 8;
            if self.rest > 0 {
                return true;
            }
            // empty box, read the next one
        }
    }

    fn decrement(&mut self, consumed: usize) -> usize {
        self.rest = self.rest.saturating_sub(consumed);
        self.rest
    }
}

/// Per-fragment sample defaults (trex, overridden by tfhd).
#[derive(Debug, Clone, Copy, Default)]
struct Fragment {
    type_index: u32,
    default_duration: u32,
    default_size: u32,
}

/// One entry of a sample description table (stsd).
struct TrackType {
    kind: MediaKind,
    audio: AudioTag,
    video: VideoTag,
    config: Option<Vec<u8>>,
}

impl TrackType {
    fn none() -> Self {
        Self {
            kind: MediaKind::None,
            audio: AudioTag::default(),
            video: VideoTag::default(),
            config: None,
        }
    }

    fn audio(codec: AudioCodec) -> Self {
        Self {
            kind: MediaKind::Audio,
            audio: AudioTag {
                codec,
                ..AudioTag::default()
            },
            ..Self::none()
        }
    }

    fn video(codec: VideoCodec) -> Self {
        Self {
            kind: MediaKind::Video,
            video: VideoTag {
                codec,
                ..VideoTag::default()
            },
            ..Self::none()
        }
    }
}

/// Run-length entry shared by the duration and composition tables.
#[derive(Debug, Clone, Copy)]
struct Repeat {
    count: u32,
    value: u32,
}

#[derive(Default)]
struct Track {
    // trex defaults
    type_index: u32,
    default_duration: u32,
    default_size: u32,

    track: u8,
    size: u32,
    time: f64,
    flush_properties: bool,
    time_step: f64,
    current_type: Option<usize>,
    lang: [u8; 3],

    types: Vec<TrackType>,
    /// stsc: first chunk ordinal -> (samples per chunk, type index).
    changes: BTreeMap<u32, (u32, u32)>,
    sizes: Vec<u32>,
    durations: VecDeque<Repeat>,
    durations_time: f64,
    composition_offsets: VecDeque<Repeat>,

    // reset on every fragment
    sample: u32,
    samples: u32,
    chunk: u32,
}

enum MediaEntry {
    Audio {
        track_index: usize,
        track: u8,
        tag: AudioTag,
        data: Vec<u8>,
    },
    Video {
        track_index: usize,
        track: u8,
        tag: VideoTag,
        data: Vec<u8>,
    },
    Lost(u32),
    /// Keeps the delivered-entry count aligned with the time index when
    /// a sample produced no packet.
    Placeholder,
}

/// Streaming MP4 parser.
pub struct Mp4Reader {
    position: u64,
    failed: bool,
    offset: u64,
    audios: u8,
    videos: u8,
    first_moov: bool,
    sequence: u32,
    /// Absolute file offset -> track index (chunk order).
    chunks: BTreeMap<u64, usize>,
    boxes: Vec<BoxFrame>,
    tracks: Vec<Track>,
    ids: HashMap<u32, usize>,
    /// Projected sample time -> expected packet count (global order).
    times: BTreeMap<u32, u32>,
    medias: BTreeMap<u32, VecDeque<MediaEntry>>,
    current_track: Option<usize>,
    fragment: Fragment,
}

impl Mp4Reader {
    pub fn new() -> Self {
        Self {
            position: 0,
            failed: false,
            offset: 0,
            audios: 0,
            videos: 0,
            first_moov: true,
            sequence: 0,
            chunks: BTreeMap::new(),
            boxes: vec![BoxFrame::default()],
            tracks: Vec::new(),
            ids: HashMap::new(),
            times: BTreeMap::new(),
            medias: BTreeMap::new(),
            current_track: None,
            fragment: Fragment::default(),
        }
    }

    pub fn parse(&mut self, data: &[u8], source: &mut dyn Source) -> usize {
        let rest = self.parse_boxes(data, source);
        self.position += (data.len() - rest) as u64;
        rest
    }

    fn parse_boxes(&mut self, data: &[u8], source: &mut dyn Source) -> usize {
        let mut reader = ByteReader::new(data);

        loop {
            let mut current = self.boxes.last().copied().unwrap_or_default();
            if current.rest == 0 {
                if !current.read_header(&mut reader) {
                    return reader.available();
                }
                if let Some(top) = self.boxes.last_mut() {
                    *top = current;
                }
            }

            match current.code {
                TRAK | TRAF | MVEX | MDIA | MINF | STBL | DINF | EDTS => {
                    if current.code == TRAK {
                        self.tracks.push(Track {
                            flush_properties: true,
                            ..Track::default()
                        });
                    } else if current.code == TRAF {
                        self.current_track = None;
                    }
                    self.boxes.push(BoxFrame::default());
                    continue;
                }
                MOOV => {
                    // a new moov is a new stream: flush and reset
                    self.times.clear();
                    if !self.first_moov {
                        self.flush_medias(source);
                        source.reset();
                    } else {
                        self.first_moov = false;
                    }
                    self.sequence = 0;
                    self.audios = 0;
                    self.videos = 0;
                    self.current_track = None;
                    self.tracks.clear();
                    self.chunks.clear();
                    self.ids.clear();
                    self.failed = false;
                    self.boxes.push(BoxFrame::default());
                    continue;
                }
                MOOF => {
                    self.offset = self.position + reader.position() as u64 - 8;
                    self.chunks.clear();
                    self.boxes.push(BoxFrame::default());
                    continue;
                }
                MDHD => {
                    // media header: timescale and language
                    if self.tracks.is_empty() {
                        error!("Media header box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let mut mdhd =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        let version = mdhd.read8();
                        mdhd.next(if version != 0 { 19 } else { 11 });
                        let track = self.tracks.last_mut().expect("checked non-empty");
                        let timescale = mdhd.read32();
                        track.time_step = if timescale != 0 {
                            1000.0 / f64::from(timescale)
                        } else {
                            0.0
                        };
                        mdhd.next(if version != 0 { 8 } else { 4 }); // duration
                        let lang = mdhd.read16();
                        if lang < 0x400 || lang == 0x7FFF {
                            // 0x7FFF = unspecified language code
                            let index = if lang >= 149 { 100 } else { usize::from(lang) };
                            track.lang.copy_from_slice(MAC_LANGS[index].as_bytes());
                        } else if lang != 0x55C4 {
                            // packed ISO-639: three 5-bit letters
                            track.lang[0] = ((lang >> 10) & 0x1F) as u8 + 0x60;
                            track.lang[1] = ((lang >> 5) & 0x1F) as u8 + 0x60;
                            track.lang[2] = (lang & 0x1F) as u8 + 0x60;
                        } else {
                            track.lang[0] = 0; // no language information
                        }
                    }
                }
                ELNG => {
                    // extended language overrides mdhd
                    if self.tracks.is_empty() {
                        error!("Extended language box not through a Track box");
                    } else {
                        if reader.available() < 6 {
                            return reader.available();
                        }
                        let elng = &data[reader.position()..reader.position() + 6];
                        let track = self.tracks.last_mut().expect("checked non-empty");
                        track.lang[0] = elng[4];
                        track.lang[1] = elng[5];
                        track.lang[2] = 0;
                    }
                }
                MFHD => {
                    // movie fragment header: sequence gap = data lost
                    if reader.available() < current.rest {
                        return reader.available();
                    }
                    let mut mfhd =
                        ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                    mfhd.next(4); // version + flags
                    let sequence = mfhd.read32();
                    self.sequence = self.sequence.wrapping_add(1);
                    if self.sequence != sequence {
                        self.sequence = sequence;
                        let index = match self.times.first_key_value() {
                            Some((&time, _)) => time,
                            None => self
                                .medias
                                .first_key_value()
                                .map(|(&time, _)| time)
                                .unwrap_or(0),
                        };
                        let lost = self.offset.saturating_sub(self.position).min(u64::from(u32::MAX));
                        self.medias
                            .entry(index)
                            .or_default()
                            .push_back(MediaEntry::Lost(lost as u32));
                    }
                }
                STCO | CO64 => {
                    // chunk offsets
                    if self.tracks.is_empty() {
                        error!("Chunk offset box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let track_index = self.tracks.len() - 1;
                        let mut stco =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        stco.next(4); // version + flags
                        let mut count = stco.read32();
                        while count > 0 && stco.available() > 0 {
                            count -= 1;
                            let offset = if current.code == STCO {
                                u64::from(stco.read32())
                            } else {
                                stco.read64()
                            };
                            self.chunks.entry(offset).or_insert(track_index);
                        }
                    }
                }
                STSD => {
                    if self.tracks.is_empty() {
                        error!("Sample description box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let payload = &data[reader.position()..reader.position() + current.rest];
                        self.parse_stsd(payload);
                    }
                }
                STSC => {
                    // sample-to-chunk runs
                    if self.tracks.is_empty() {
                        error!("Sample to chunks box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let track = self.tracks.last_mut().expect("checked non-empty");
                        let mut stsc =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        stsc.next(4);
                        let mut count = stsc.read32();
                        while count > 0 && stsc.available() >= 8 {
                            count -= 1;
                            let index = stsc.read32();
                            let samples = stsc.read32();
                            let type_index = stsc.read32().max(1);
                            track.changes.insert(index, (samples, type_index));
                        }
                    }
                }
                STSZ => {
                    if self.tracks.is_empty() {
                        error!("Sample size box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let track = self.tracks.last_mut().expect("checked non-empty");
                        let mut stsz =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        stsz.next(4);
                        let uniform = stsz.read32();
                        track.size = uniform;
                        track.default_size = uniform;
                        if uniform == 0 {
                            let mut count = stsz.read32();
                            while count > 0 && stsz.available() >= 4 {
                                count -= 1;
                                track.sizes.push(stsz.read32());
                            }
                        }
                    }
                }
                ELST => {
                    // edit list: leading empty edits become start silence
                    if self.tracks.is_empty() {
                        error!("Edit list box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let track = self.tracks.last_mut().expect("checked non-empty");
                        let mut elst =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        let version = elst.read8();
                        elst.next(3); // flags
                        let mut count = elst.read32();
                        track.durations_time = 0.0;
                        track.time = 0.0;
                        while count > 0 {
                            count -= 1;
                            let (duration, media_time) = if version != 0 {
                                (elst.read64() as f64, elst.read64() as i64)
                            } else {
                                (f64::from(elst.read32()), i64::from(elst.read32() as i32))
                            };
                            if media_time >= 0 {
                                break;
                            }
                            track.durations_time += duration;
                            track.time += duration;
                            elst.next(4); // media rate
                        }
                    }
                }
                STTS => {
                    // decode durations, projected into the global index
                    if self.tracks.is_empty() {
                        error!("Time to sample box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let track_index = self.tracks.len() - 1;
                        let mut stts =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        stts.next(4);
                        let mut count = stts.read32();
                        while count > 0 && stts.available() >= 8 {
                            count -= 1;
                            let repeat = Repeat {
                                count: stts.read32(),
                                value: stts.read32(),
                            };
                            let track = &mut self.tracks[track_index];
                            track.durations.push_back(repeat);
                            for _ in 0..repeat.count {
                                let time =
                                    track.durations_time.round().min(4_294_967_295.0) as u32;
                                *self.times.entry(time).or_insert(0) += 1;
                                track.durations_time +=
                                    f64::from(repeat.value) * track.time_step;
                            }
                        }
                    }
                }
                CTTS => {
                    if self.tracks.is_empty() {
                        error!("Composition offset box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let track = self.tracks.last_mut().expect("checked non-empty");
                        let mut ctts =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        ctts.next(4);
                        let mut count = ctts.read32();
                        while count > 0 && ctts.available() >= 8 {
                            count -= 1;
                            track.composition_offsets.push_back(Repeat {
                                count: ctts.read32(),
                                value: ctts.read32(),
                            });
                        }
                    }
                }
                TKHD => {
                    if self.tracks.is_empty() {
                        error!("Track header box not through a Track box");
                    } else {
                        if reader.available() < current.rest {
                            return reader.available();
                        }
                        let mut tkhd =
                            ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                        let version = tkhd.read8();
                        tkhd.next(if version != 0 { 19 } else { 11 });
                        let id = tkhd.read32();
                        if self.ids.contains_key(&id) {
                            error!("Bad track header id, identification {id} already used");
                        } else {
                            self.ids.insert(id, self.tracks.len() - 1);
                        }
                    }
                }
                TREX => {
                    if reader.available() < current.rest {
                        return reader.available();
                    }
                    let mut trex =
                        ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                    trex.next(4);
                    let id = trex.read32();
                    match self.ids.get(&id) {
                        Some(&track_index) => {
                            let track = &mut self.tracks[track_index];
                            track.type_index = trex.read32();
                            track.default_duration = trex.read32();
                            track.default_size = trex.read32();
                        }
                        None => error!("Impossible to find track with {id} as identification"),
                    }
                }
                TFHD => {
                    if reader.available() < current.rest {
                        return reader.available();
                    }
                    let mut tfhd =
                        ByteReader::new(&data[reader.position()..reader.position() + current.rest]);
                    tfhd.next(1); // version
                    let flags = tfhd.read24();
                    let id = tfhd.read32();
                    match self.ids.get(&id) {
                        Some(&track_index) => {
                            self.current_track = Some(track_index);
                            let track = &mut self.tracks[track_index];
                            track.chunk = 0;
                            track.sample = 0;
                            track.samples = 0;
                            track.changes.clear();
                            track.size = 0;
                            track.sizes.clear();
                            track.composition_offsets.clear();
                            // durations restart but their projected time
                            // keeps running across fragments
                            track.durations.clear();

                            if flags & 1 != 0 {
                                self.offset = tfhd.read64(); // base data offset
                            }
                            self.fragment.type_index = if flags & 2 != 0 {
                                tfhd.read32()
                            } else {
                                track.type_index
                            };
                            self.fragment.default_duration = if flags & 8 != 0 {
                                tfhd.read32()
                            } else {
                                track.default_duration
                            };
                            self.fragment.default_size = if flags & 0x10 != 0 {
                                tfhd.read32()
                            } else {
                                track.default_size
                            };
                        }
                        None => {
                            error!("Impossible to find track with {id} as identification");
                            self.current_track = None;
                        }
                    }
                }
                TRUN => {
                    if reader.available() < current.rest {
                        return reader.available();
                    }
                    let payload = &data[reader.position()..reader.position() + current.rest];
                    self.parse_trun(payload);
                }
                MDAT => {
                    let consumed = self.parse_mdat(&mut reader, source);
                    let mut rest = 0;
                    if let Some(top) = self.boxes.last_mut() {
                        rest = top.decrement(consumed);
                    }
                    self.flush_medias(source);
                    if reader.available() > 0 && rest > 0 && !self.chunks.is_empty() && !self.failed
                    {
                        // mid-sample: retain the tail and wait for more
                        return reader.available();
                    }
                }
                _ => {} // unknown or ignored box
            }

            // consume (the rest of) this box and pop finished parents
            let mut rest = 0;
            if let Some(top) = self.boxes.last_mut() {
                let consumed = reader.next(top.rest);
                rest = top.decrement(consumed);
            }
            if rest > 0 {
                if reader.available() == 0 {
                    return 0;
                }
                continue;
            }
            while let Some(finished) = self.boxes.pop() {
                match self.boxes.last_mut() {
                    Some(parent) => {
                        if parent.decrement(finished.size) > 0 {
                            break;
                        }
                    }
                    None => break,
                }
            }
            self.boxes.push(BoxFrame::default());

            if reader.available() == 0 {
                return 0;
            }
        }
    }

    /// Sample descriptions: codec type, audio parameters, and the
    /// avcC/esds decoder configuration extensions.
    fn parse_stsd(&mut self, data: &[u8]) {
        let track_index = self.tracks.len() - 1;
        let mut stsd = ByteReader::new(data);
        stsd.next(4); // version + flags
        let mut count = stsd.read32();
        while count > 0 && stsd.available() > 0 {
            count -= 1;
            let size = stsd.read32() as usize;
            let mut description = ByteReader::new(&data[stsd.position()..]);
            if description.shrink(stsd.next(size)) < 4 {
                continue;
            }
            let name = description.read(4);
            let name: [u8; 4] = [name[0], name[1], name[2], name[3]];
            description.next(8); // reserved + data reference index

            match &name {
                b"avc1" => {
                    self.tracks[track_index]
                        .types
                        .push(TrackType::video(VideoCodec::H264));
                    // version, revision, vendor, quality, dimensions,
                    // resolution, data size, frame count, compressor
                    // name, depth, color id
                    description.next(70);
                }
                b"mp4a" | b".mp3" => {
                    let codec = if name[0] == b'.' {
                        AudioCodec::Mp3
                    } else {
                        AudioCodec::Aac
                    };
                    let mut entry = TrackType::audio(codec);
                    let version = description.read16();
                    if version == 2 {
                        description.next(22);
                        // sound description v2 carries rate as a double
                        let rate = u64::from(description.read32()) << 32
                            | u64::from(description.read32());
                        entry.audio.rate = f64::from_bits(rate).round() as u32;
                        entry.audio.channels = description.read32().min(255) as u8;
                        description.next(20);
                    } else {
                        description.next(6); // revision + vendor
                        entry.audio.channels = description.read16().min(255) as u8;
                        description.next(6); // sample size, compression, packet size
                        entry.audio.rate = u32::from(description.read16());
                        description.next(2);
                        if version != 0 {
                            description.next(16);
                        }
                    }
                    self.tracks[track_index].types.push(entry);
                }
                other => {
                    // RTP hint tracks duplicate the media, no warning
                    if other != b"rtp " {
                        warn!(
                            "Unsupported {} media type",
                            String::from_utf8_lossy(other)
                        );
                    }
                    self.tracks[track_index].types.push(TrackType::none());
                    break;
                }
            }
            // extension boxes of the sample description
            while description.available() > 0 {
                let size = description.read32() as usize;
                if size < 5 {
                    continue;
                }
                let data = description.data();
                let mut extension = ByteReader::new(&data[description.position()..]);
                extension.shrink(description.next(size));
                let ext = extension.read(4);
                if ext == b"esds" {
                    self.parse_esds(track_index, extension);
                } else if ext == b"avcC" {
                    let payload = extension.data();
                    let mut prefixed = BytesMut::new();
                    avc::read_video_config(
                        &payload[extension.position()..extension.size()],
                        &mut prefixed,
                    );
                    self.tracks[track_index]
                        .types
                        .last_mut()
                        .expect("pushed above")
                        .config = Some(prefixed.to_vec());
                }
            }
        }
    }

    /// esds descriptor chain: ES(3) -> DecoderConfig(4) -> object type,
    /// then the inline AudioSpecificConfig(5) when present.
    fn parse_esds(&mut self, track_index: usize, mut extension: ByteReader) {
        extension.next(4); // version + flags
        if extension.read8() != 3 {
            return; // ES descriptor expected
        }
        let mut value = extension.read8();
        if value & 0x80 != 0 {
            // 3-byte extended descriptor
            extension.next(2);
            value = extension.read8();
        }
        extension.shrink(usize::from(value));
        extension.next(2); // ES id
        let value = extension.read8();
        if value & 0x80 != 0 {
            extension.next(2); // dependsOn ES id
        }
        if value & 0x40 != 0 {
            let skip = usize::from(extension.read8());
            extension.next(skip); // url
        }
        if value & 0x20 != 0 {
            extension.next(2); // OCR ES id
        }
        if extension.read8() != 4 {
            return; // decoder config descriptor expected
        }
        let mut value = extension.read8();
        if value & 0x80 != 0 {
            extension.next(2);
            value = extension.read8();
        }
        extension.shrink(usize::from(value));

        let Some(entry) = self.tracks[track_index].types.last_mut() else {
            return;
        };
        let object_type = extension.read8();
        match object_type {
            0x40 => {} // MPEG-4 AAC, config follows inline
            0x66 | 0x67 | 0x68 => {
                // MPEG-4/2 ADTS profiles: synthesize the config
                let profile = object_type - 0x65;
                let rate_index =
                    mpeg4::index_from_rate(entry.audio.rate).unwrap_or(0);
                entry.config = Some(
                    mpeg4::write_audio_config(profile, rate_index, entry.audio.channels).to_vec(),
                );
            }
            0x69 | 0x6B => {
                entry.audio.codec = AudioCodec::Mp3;
            }
            other => {
                if entry.kind == MediaKind::Audio {
                    warn!("Audio track with unsupported {other} codec");
                } else {
                    warn!("Video track with unsupported {other} codec");
                }
                entry.kind = MediaKind::None;
                return;
            }
        }
        // buffer size + max bitrate + average bitrate
        extension.next(12);
        if extension.read8() != 5 {
            return; // audio specific config expected
        }
        let mut value = extension.read8();
        if value & 0x80 != 0 {
            extension.next(2);
            value = extension.read8();
        }
        extension.shrink(usize::from(value));
        let payload = extension.data();
        let config = payload[extension.position()..extension.size()].to_vec();
        // the config packet is more precise than the sound description
        if let Some(parsed) = mpeg4::read_audio_config(&config) {
            entry.audio.rate = parsed.rate;
            entry.audio.channels = parsed.channels;
        }
        entry.config = Some(config);
    }

    /// Track fragment run: per-sample tables plus the chunk index entry
    /// for the fragment payload.
    fn parse_trun(&mut self, data: &[u8]) {
        let Some(track_index) = self.current_track else {
            error!("Track fragment run box without valid track fragment box before");
            return;
        };
        let mut trun = ByteReader::new(data);
        trun.next(1); // version
        let flags = trun.read24();
        let count = trun.read32();
        if count == 0 {
            warn!("Track fragment run box describes 0 samples");
            return;
        }

        {
            let track = &mut self.tracks[track_index];
            track
                .changes
                .insert(0, (count, self.fragment.type_index));
            track.size = if flags & 0x200 != 0 {
                0
            } else {
                self.fragment.default_size
            };
        }

        // ffmpeg's omit_tfhd_offset leaves the flag set with value 0
        let value = if flags & 1 != 0 { trun.read32() } else { 0 };
        if value != 0 {
            self.chunks
                .entry(self.offset + u64::from(value))
                .or_insert(track_index);
        } else if let Some((&last, _)) = self.chunks.last_key_value() {
            self.chunks.entry(last + 1).or_insert(track_index);
        } else {
            self.chunks.entry(self.offset).or_insert(track_index);
        }

        if flags & 4 != 0 {
            trun.next(4); // first sample flags
        }

        if flags & 0x100 == 0 {
            if self.fragment.default_duration == 0 {
                error!("No duration information in track fragment box");
                return;
            }
            let track = &mut self.tracks[track_index];
            track.durations.push_back(Repeat {
                count,
                value: self.fragment.default_duration,
            });
            for _ in 0..count {
                let time = track.durations_time.round().min(4_294_967_295.0) as u32;
                *self.times.entry(time).or_insert(0) += 1;
                track.durations_time +=
                    f64::from(self.fragment.default_duration) * track.time_step;
            }
        }

        let mut remaining = count;
        while remaining > 0 && trun.available() > 0 {
            remaining -= 1;
            if flags & 0x100 != 0 {
                let value = trun.read32();
                let track = &mut self.tracks[track_index];
                match track.durations.back_mut() {
                    Some(last) if last.value == value => last.count += 1,
                    _ => track.durations.push_back(Repeat { count: 1, value }),
                }
                let time = track.durations_time.round().min(4_294_967_295.0) as u32;
                *self.times.entry(time).or_insert(0) += 1;
                track.durations_time += f64::from(value) * track.time_step;
            }
            let track = &mut self.tracks[track_index];
            if flags & 0x200 != 0 {
                track.sizes.push(trun.read32());
            }
            if flags & 0x400 != 0 {
                trun.next(4); // sample flags
            }
            if flags & 0x800 != 0 {
                let value = trun.read32();
                match track.composition_offsets.back_mut() {
                    Some(last) if last.value == value => last.count += 1,
                    _ => track
                        .composition_offsets
                        .push_back(Repeat { count: 1, value }),
                }
            }
        }
    }

    /// Deliver mdat payload sample by sample following the chunk index;
    /// returns the bytes consumed from `reader`.
    fn parse_mdat(&mut self, reader: &mut ByteReader, source: &mut dyn Source) -> usize {
        let start = reader.position();

        while !self.failed && reader.available() > 0 {
            if self.tracks.is_empty() {
                error!("No tracks information before mdat (no support of mdat box before moov box)");
                self.failed = true;
                break;
            }
            let Some((&chunk_offset, &track_index)) = self.chunks.first_key_value() else {
                break;
            };

            let absolute = self.position + reader.position() as u64;
            if absolute < chunk_offset {
                let skip = (chunk_offset - absolute).min(reader.available() as u64) as usize;
                reader.next(skip);
                if reader.available() == 0 {
                    break;
                }
            }

            {
                let track = &self.tracks[track_index];
                if track.time_step == 0.0 {
                    error!("Data box without mdhd box with valid timeScale field before");
                    self.failed = true;
                    break;
                }
                if track.durations.is_empty() {
                    error!("Data box without valid Time to sample box before");
                    self.failed = true;
                    break;
                }
                if track.changes.is_empty() {
                    error!("Data box without valid Sample to chunk box before");
                    self.failed = true;
                    break;
                }
                if track.types.is_empty() {
                    error!("Data box without valid Sample description box before");
                    self.failed = true;
                    break;
                }
            }

            let (&change_index, &(samples, type_index)) = self.tracks[track_index]
                .changes
                .first_key_value()
                .expect("checked non-empty");
            if self.tracks[track_index].chunk < change_index {
                self.tracks[track_index].chunk = change_index;
            }

            let mut out_of_data = false;
            while self.tracks[track_index].sample < samples {
                let track = &self.tracks[track_index];
                let index = (track.sample + track.samples) as usize;
                let size = track
                    .sizes
                    .get(index)
                    .copied()
                    .unwrap_or(track.size) as usize;
                if reader.available() < size {
                    out_of_data = true;
                    break;
                }

                // resolve the sample description in effect
                let mut value = type_index as usize;
                if value == 0 || value > track.types.len() {
                    if value != 0 {
                        warn!("Bad type index indication");
                    }
                    value = if track.current_type.is_some() { 0 } else { 1 };
                }
                let type_idx = match value {
                    0 => track.current_type.expect("checked above"),
                    n => n - 1,
                };

                let time = track.time.round().min(4_294_967_295.0) as u32;
                let payload = reader.read(size);
                self.deliver_sample(track_index, type_idx, time, payload);

                // determine the next time
                let track = &mut self.tracks[track_index];
                let durations_len = track.durations.len();
                if let Some(front) = track.durations.front_mut() {
                    track.time += f64::from(front.value) * track.time_step;
                    if durations_len > 1 {
                        // repeat the last duration when entries run short
                        front.count = front.count.saturating_sub(1);
                        if front.count == 0 {
                            track.durations.pop_front();
                        }
                    }
                }
                track.sample += 1;
            }
            if out_of_data {
                break;
            }

            self.chunks.pop_first();
            let track = &mut self.tracks[track_index];
            track.chunk += 1;
            let second = {
                let mut keys = track.changes.keys();
                keys.next();
                keys.next().copied()
            };
            if let Some(second) = second {
                if track.chunk >= second {
                    track.changes.pop_first();
                }
            }
            track.samples += samples;
            track.sample = 0;
        }

        reader.position() - start
    }

    /// Queue one sample into the time-ordered delivery index, assigning
    /// the track id and emitting the decoder config on first use.
    fn deliver_sample(&mut self, track_index: usize, type_idx: usize, time: u32, payload: &[u8]) {
        let entries_before = self.medias.get(&time).map(|list| list.len()).unwrap_or(0);

        let kind = self.tracks[track_index].types[type_idx].kind;
        match kind {
            MediaKind::Audio => {
                let changed = self.tracks[track_index].current_type != Some(type_idx);
                if changed {
                    self.tracks[track_index].current_type = Some(type_idx);
                    if self.audios < 0xFF {
                        self.audios += 1;
                        self.tracks[track_index].track = self.audios;
                        let track_number = self.audios;
                        let entry = &self.tracks[track_index].types[type_idx];
                        if let Some(config) = entry.config.clone() {
                            let mut tag = entry.audio;
                            tag.time = time;
                            tag.is_config = true;
                            self.medias.entry(time).or_default().push_back(MediaEntry::Audio {
                                track_index,
                                track: track_number,
                                tag,
                                data: config,
                            });
                            // keep the time index in step with the extra packet
                            *self.times.entry(time).or_insert(0) += 1;
                        }
                    } else {
                        warn!("Audio track {} ignored because more than 255 tracks", self.audios);
                        self.tracks[track_index].track = 0;
                    }
                }
                let track_number = self.tracks[track_index].track;
                if track_number != 0 && !payload.is_empty() {
                    // an empty sample is silence, nothing to forward
                    let mut tag = self.tracks[track_index].types[type_idx].audio;
                    tag.time = time;
                    tag.is_config = false;
                    self.medias.entry(time).or_default().push_back(MediaEntry::Audio {
                        track_index,
                        track: track_number,
                        tag,
                        data: payload.to_vec(),
                    });
                }
            }
            MediaKind::Video => {
                let changed = self.tracks[track_index].current_type != Some(type_idx);
                if changed {
                    self.tracks[track_index].current_type = Some(type_idx);
                    if self.videos < 0xFF {
                        self.videos += 1;
                        self.tracks[track_index].track = self.videos;
                        let track_number = self.videos;
                        let entry = &self.tracks[track_index].types[type_idx];
                        if let Some(config) = entry.config.clone() {
                            let mut tag = entry.video;
                            tag.time = time;
                            tag.frame = FrameKind::Config;
                            self.medias.entry(time).or_default().push_back(MediaEntry::Video {
                                track_index,
                                track: track_number,
                                tag,
                                data: config,
                            });
                            *self.times.entry(time).or_insert(0) += 1;
                        }
                    } else {
                        warn!("Video track {} ignored because more than 255 tracks", self.videos);
                        self.tracks[track_index].track = 0;
                    }
                }
                let track_number = self.tracks[track_index].track;
                if track_number != 0 && !payload.is_empty() {
                    // composition offset from the ctts run in effect
                    let offset = {
                        let track = &mut self.tracks[track_index];
                        match track.composition_offsets.front_mut() {
                            Some(repeat) => {
                                let value = (f64::from(repeat.value) * track.time_step)
                                    .round()
                                    .clamp(0.0, 65_535.0) as u16;
                                repeat.count = repeat.count.saturating_sub(1);
                                if repeat.count == 0 {
                                    track.composition_offsets.pop_front();
                                }
                                value
                            }
                            None => 0,
                        }
                    };
                    self.tracks[track_index].types[type_idx].video.composition_offset = offset;
                    self.tracks[track_index].types[type_idx].video.time = time;
                    if self.tracks[track_index].types[type_idx].video.codec == VideoCodec::H264 {
                        self.frame_to_medias(track_index, type_idx, time, payload);
                    }
                }
            }
            _ => {} // unsupported description, ignored
        }

        // keep a placeholder when the sample produced no packet
        let entries_after = self.medias.get(&time).map(|list| list.len()).unwrap_or(0);
        if entries_before == entries_after {
            self.medias.entry(time).or_default().push_back(MediaEntry::Placeholder);
        }
    }

    /// Split an H.264 sample into access-unit packets with frame
    /// classification, extracting inline SPS/PPS as config packets.
    fn frame_to_medias(&mut self, track_index: usize, type_idx: usize, time: u32, data: &[u8]) {
        let track_number = self.tracks[track_index].track;
        let mut tag = self.tracks[track_index].types[type_idx].video;
        tag.frame = FrameKind::Unspecified;

        let mut frames = ByteReader::new(data);
        let mut frame_start: Option<usize> = None;
        let mut frame_size = 0usize;
        let mut wrote = false;

        let mut push = |this: &mut Self, tag: VideoTag, payload: Vec<u8>, wrote: &mut bool| {
            if *wrote {
                *this.times.entry(time).or_insert(0) += 1;
            }
            this.medias.entry(time).or_default().push_back(MediaEntry::Video {
                track_index,
                track: track_number,
                tag,
                data: payload,
            });
            *wrote = true;
        };

        while frames.available() > 4 {
            let frame_type = avc::nal_type(data[frames.position() + 4]);
            if let Some(start) = frame_start {
                if tag.frame == FrameKind::Config {
                    let prev_type = avc::nal_type(data[start + 4]);
                    if frame_type != prev_type {
                        if avc::frame_from_nal(frame_type) == FrameKind::Config {
                            // the pair completes with this unit
                            let length = frames.read32() as usize;
                            frame_size += frames.next(length) + 4;
                            let config = data[start..start + frame_size].to_vec();
                            self.tracks[track_index].types[type_idx].config =
                                Some(config.clone());
                            push(self, tag, config, &mut wrote);
                            frame_start = None;
                            continue;
                        }
                        if prev_type == avc::nal::SPS {
                            // a lone SPS is a valid config
                            let config = data[start..start + frame_size].to_vec();
                            self.tracks[track_index].types[type_idx].config =
                                Some(config.clone());
                            push(self, tag, config, &mut wrote);
                        }
                        // a lone PPS is dropped
                    }
                    // a repeated config type is erased
                    frame_start = None;
                } else if avc::frame_from_nal(frame_type) == FrameKind::Config {
                    // flush what precedes the config
                    push(self, tag, data[start..start + frame_size].to_vec(), &mut wrote);
                    frame_start = None;
                }
            }
            tag.frame = avc::update_frame(
                frame_type,
                if frame_start.is_some() {
                    tag.frame
                } else {
                    FrameKind::Unspecified
                },
            );
            if frame_start.is_none() {
                frame_start = Some(frames.position());
                frame_size = 0;
            }
            let length = frames.read32() as usize;
            frame_size += frames.next(length) + 4;
        }

        if let Some(start) = frame_start {
            let payload = data[start..start + frame_size].to_vec();
            if tag.frame == FrameKind::Config {
                self.tracks[track_index].types[type_idx].config = Some(payload.clone());
            }
            push(self, tag, payload, &mut wrote);
        }
    }

    /// Drain every time bucket whose expected packet count is satisfied.
    fn flush_medias(&mut self, source: &mut dyn Source) {
        while let Some((&key, _)) = self.medias.first_key_value() {
            loop {
                let done = {
                    let Some(list) = self.medias.get_mut(&key) else {
                        break;
                    };
                    list.is_empty()
                };
                if done {
                    break;
                }
                if let Some((&first_time, _)) = self.times.first_key_value() {
                    if key > first_time {
                        return; // an earlier sample is still pending
                    }
                    if key == first_time {
                        let count = self.times.get_mut(&first_time).expect("just read");
                        *count -= 1;
                        if *count == 0 {
                            self.times.pop_first();
                        }
                    }
                }
                let entry = self
                    .medias
                    .get_mut(&key)
                    .and_then(|list| list.pop_front())
                    .expect("checked non-empty");
                match entry {
                    MediaEntry::Audio {
                        track_index,
                        track,
                        tag,
                        data,
                    } => {
                        self.flush_properties(track_index, track, MediaKind::Audio, source);
                        source.write_audio(track, &tag, &data);
                    }
                    MediaEntry::Video {
                        track_index,
                        track,
                        tag,
                        data,
                    } => {
                        self.flush_properties(track_index, track, MediaKind::Video, source);
                        source.write_video(track, &tag, &data);
                    }
                    MediaEntry::Lost(lost) => source.report_lost(MediaKind::None, lost, 0),
                    MediaEntry::Placeholder => {}
                }
            }
            self.medias.pop_first();
        }
    }

    /// Surface the track language once, before its first packet.
    fn flush_properties(
        &mut self,
        track_index: usize,
        track_number: u8,
        kind: MediaKind,
        source: &mut dyn Source,
    ) {
        let track = &mut self.tracks[track_index];
        if !track.flush_properties {
            return;
        }
        track.flush_properties = false;
        if track.lang[0] == 0 {
            return;
        }
        let lang = String::from_utf8_lossy(&track.lang).into_owned();
        let key = if kind == MediaKind::Audio {
            "audioLang"
        } else {
            "textLang"
        };
        let mut map = BTreeMap::new();
        map.insert(key, lang);
        if let Ok(payload) = serde_json::to_vec(&map) {
            source.set_properties(track_number, DataKind::Json, &payload);
        }
    }

    pub fn on_flush(&mut self, source: &mut dyn Source) {
        // force everything out, then start from scratch
        self.times.clear();
        self.flush_medias(source);
        *self = Self::new();
    }
}

impl Default for Mp4Reader {
    fn default() -> Self {
        Self::new()
    }
}
