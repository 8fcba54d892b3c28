//! Streaming demultiplexer framework and format selection.
//!
//! The framework converts a "chunk at a time" input model into the
//! illusion of a contiguous buffer: [`StreamBuffer::feed`] appends new
//! bytes to any carried-over tail, invokes the format parser once, and
//! retains whatever the parser could not consume. Parsers never block;
//! they signal "need more bytes" by returning the size of their
//! unconsumed tail.

mod adts;
mod flv;
mod mp4;
mod nal;
mod ts;

pub use adts::AdtsReader;
pub use flv::FlvReader;
pub use mp4::Mp4Reader;
pub use nal::NalTrackReader;
pub use ts::TsReader;

use bytes::{Buf, BytesMut};
use fragcast_common::media::Source;
use fragcast_common::{Error, Result};
use tracing::warn;

/// Hard ceiling on carried-over bytes per reader. A parser that wants
/// more than this is off the rails; the buffer is dropped and parsing
/// restarts at the next syntactically valid point.
const STREAM_BUFFER_LIMIT: usize = 0x0100_0000;

/// Accumulation buffer shared by every streaming parser.
#[derive(Debug, Default)]
pub(crate) struct StreamBuffer {
    buffer: BytesMut,
}

impl StreamBuffer {
    /// Append `data`, run `parse` once over everything unconsumed so
    /// far, and retain the tail the parser reports.
    ///
    /// Returns `false` on a capacity violation (the retained tail would
    /// exceed the hard ceiling); the buffer is cleared and the caller is
    /// expected to resynchronize.
    pub fn feed(&mut self, data: &[u8], parse: impl FnOnce(&[u8]) -> usize) -> bool {
        let rest = if self.buffer.is_empty() {
            let rest = parse(data).min(data.len());
            if rest > 0 {
                self.buffer.extend_from_slice(&data[data.len() - rest..]);
            }
            rest
        } else {
            self.buffer.extend_from_slice(data);
            let rest = parse(&self.buffer).min(self.buffer.len());
            let consumed = self.buffer.len() - rest;
            self.buffer.advance(consumed);
            rest
        };
        if rest == 0 {
            self.buffer.clear();
            return true;
        }
        if rest > STREAM_BUFFER_LIMIT {
            self.buffer.clear();
            return false;
        }
        true
    }

    /// Give up the carried-over tail (used on flush).
    pub fn take(&mut self) -> BytesMut {
        std::mem::take(&mut self.buffer)
    }
}

/// Container formats understood by [`Demuxer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Adts,
    Flv,
    Mp4,
    Ts,
}

impl Format {
    /// Sniff the container format from the first bytes of a stream.
    pub fn detect(data: &[u8]) -> Result<Format> {
        if data.len() >= 3 && &data[..3] == b"FLV" {
            return Ok(Format::Flv);
        }
        if data.len() >= 8 {
            let name = [data[4], data[5], data[6], data[7]];
            if matches!(
                &name,
                b"ftyp" | b"styp" | b"moov" | b"moof" | b"free" | b"skip"
            ) {
                return Ok(Format::Mp4);
            }
        }
        if !data.is_empty() && data[0] == 0x47 && (data.len() <= 188 || data[188] == 0x47) {
            return Ok(Format::Ts);
        }
        if data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0 {
            return Ok(Format::Adts);
        }
        Err(Error::UnknownFormat)
    }
}

enum Parser {
    Adts(AdtsReader),
    Flv(FlvReader),
    Mp4(Box<Mp4Reader>),
    Ts(TsReader),
}

impl Parser {
    fn parse(&mut self, data: &[u8], source: &mut dyn Source) -> usize {
        match self {
            Parser::Adts(reader) => reader.parse(data, source),
            Parser::Flv(reader) => reader.parse(data, source),
            Parser::Mp4(reader) => reader.parse(data, source),
            Parser::Ts(reader) => reader.parse(data, source),
        }
    }

    fn on_flush(&mut self, leftover: &[u8], source: &mut dyn Source) {
        match self {
            Parser::Adts(reader) => reader.on_flush(leftover, source),
            Parser::Flv(reader) => reader.on_flush(source),
            Parser::Mp4(reader) => reader.on_flush(source),
            Parser::Ts(reader) => reader.on_flush(source),
        }
    }
}

/// Streaming demultiplexer over one logical byte stream.
///
/// Closed dispatch over the four format state machines; all of them
/// write into the same [`Source`] contract.
pub struct Demuxer {
    format: Format,
    buffer: StreamBuffer,
    parser: Parser,
}

impl Demuxer {
    pub fn new(format: Format) -> Self {
        let parser = match format {
            Format::Adts => Parser::Adts(AdtsReader::new(1)),
            Format::Flv => Parser::Flv(FlvReader::new()),
            Format::Mp4 => Parser::Mp4(Box::new(Mp4Reader::new())),
            Format::Ts => Parser::Ts(TsReader::new()),
        };
        Self {
            format,
            buffer: StreamBuffer::default(),
            parser,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Feed one chunk of the stream, of any size and alignment.
    pub fn read(&mut self, data: &[u8], source: &mut dyn Source) {
        if data.is_empty() {
            return;
        }
        let Self { buffer, parser, .. } = self;
        if !buffer.feed(data, |bytes| parser.parse(bytes, source)) {
            warn!(
                "{:?} stream buffer exceeds {} bytes, resynchronizing",
                self.format, STREAM_BUFFER_LIMIT
            );
            self.parser.on_flush(&[], source);
        }
    }

    /// Signal that no more data is coming right now: emit whatever is
    /// bufferable, then reset the sink before flushing it.
    pub fn flush(&mut self, source: &mut dyn Source) {
        let leftover = self.buffer.take();
        self.parser.on_flush(&leftover, source);
        source.reset();
        source.flush(); // flush after reset
    }
}
