//! Fragcast-Common: shared vocabulary for the fragcast pipeline
//!
//! This crate holds everything the demultiplexers and the remultiplexer
//! agree on:
//!
//! - `buffer` - bounds-checked big-endian byte cursor over a borrowed slice
//! - `bits` - bit-granularity reader with Exp-Golomb support
//! - `media` - canonical tags/packets, the [`Source`](media::Source) sink
//!   contract, the compact wire tag encoding, and wraparound time helpers
//!
//! The cursors never fail: a read past the logical limit yields a defined
//! zero/empty value, and skips clamp to what is actually available. That
//! contract is what allows a format parser to be re-invoked safely on a
//! partially received buffer.

pub mod bits;
pub mod buffer;
pub mod error;
pub mod media;

pub use bits::BitReader;
pub use buffer::ByteReader;
pub use error::{Error, Result};
