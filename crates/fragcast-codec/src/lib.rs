//! Fragcast-Codec: codec bitstream helpers
//!
//! Everything here operates on elementary-stream payloads, independent of
//! any container:
//!
//! - `avc` - H.264 NAL unit classification, frame-significance tracking,
//!   decoder configuration (avcC) encode/decode, and SPS dimension
//!   extraction
//! - `mpeg4` - the 2-byte MPEG-4 AudioSpecificConfig and the sample-rate
//!   index table shared by ADTS and esds
//!
//! Payloads are never decoded; these helpers only read enough syntax to
//! classify, configure, and repackage.

pub mod avc;
pub mod mpeg4;
