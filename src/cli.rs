use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use fragcast_media::Format;

/// Normalize a TS/FLV/MP4/ADTS stream into fragmented MP4.
#[derive(Parser)]
#[command(name = "fragcast", version, about)]
pub struct Cli {
    /// Input media file ("-" reads from stdin)
    pub input: PathBuf,

    /// Output file for the fragmented-MP4 stream
    #[arg(short, long, default_value = "out.mp4")]
    pub output: PathBuf,

    /// Container format (sniffed from the stream by default)
    #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
    pub format: FormatArg,

    /// Cold-start buffer window in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub buffer_time: u32,

    /// Read chunk size in bytes
    #[arg(long, default_value_t = 65536)]
    pub chunk_size: usize,

    /// Print a JSON stream summary on completion
    #[arg(long)]
    pub summary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Auto,
    Adts,
    Flv,
    Mp4,
    Ts,
}

impl FormatArg {
    /// The fixed format, or `None` for auto-detection.
    pub fn resolve(self) -> Option<Format> {
        match self {
            FormatArg::Auto => None,
            FormatArg::Adts => Some(Format::Adts),
            FormatArg::Flv => Some(Format::Flv),
            FormatArg::Mp4 => Some(Format::Mp4),
            FormatArg::Ts => Some(Format::Ts),
        }
    }
}
