//! Fragcast-Media: container demultiplexing and fragmented-MP4
//! serialization
//!
//! This crate turns arbitrary byte chunks of a supported container
//! (MPEG-2 TS, FLV, plain/fragmented MP4, raw ADTS) into the canonical
//! packet stream of `fragcast-common`, and repackages that stream as
//! fragmented MP4 suitable for progressive append-based playback.
//!
//! # Modules
//!
//! - `reader` - the streaming demultiplexer framework and the four
//!   format state machines
//! - `fmp4` - the fragmented-MP4 remultiplexer (init segment +
//!   moof/mdat media segments)
//!
//! # Streaming model
//!
//! Everything is synchronous and call-driven. A [`Demuxer`] is fed
//! chunks of any size; a format parser that needs more bytes simply
//! leaves them in the accumulation buffer and resumes on the next call.
//! Malformed input never aborts a stream: framing errors resynchronize,
//! continuity loss is quantified and reported, and unsupported pieces
//! are skipped with a single diagnostic.

pub mod fmp4;
pub mod reader;

pub use fmp4::Mp4Writer;
pub use reader::{Demuxer, Format};
