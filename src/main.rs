mod cli;
mod pipeline;

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use fragcast_media::{Demuxer, Format, Mp4Writer};
use pipeline::Pipeline;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let summary = run(&cli)?;
    if cli.summary {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<pipeline::StreamSummary> {
    let mut input: Box<dyn Read> = if cli.input == Path::new("-") {
        Box::new(std::io::stdin())
    } else {
        Box::new(
            File::open(&cli.input)
                .with_context(|| format!("cannot open {}", cli.input.display()))?,
        )
    };

    let output = File::create(&cli.output)
        .with_context(|| format!("cannot create {}", cli.output.display()))?;
    let mut output = BufWriter::new(output);

    let segments = Arc::new(AtomicU64::new(0));
    let mut writer = Mp4Writer::new(cli.buffer_time);
    {
        let segments = segments.clone();
        writer.set_on_write(move |data: &[u8]| {
            segments.fetch_add(1, Ordering::Relaxed);
            output.write_all(data).is_ok()
        });
    }
    let mut pipeline = Pipeline::new(writer);

    let mut demuxer: Option<Demuxer> = cli.format.resolve().map(Demuxer::new);
    let mut buffer = vec![0u8; cli.chunk_size.max(189)];
    let mut bytes = 0u64;
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        bytes += read as u64;
        let chunk = &buffer[..read];
        if demuxer.is_none() {
            let format = Format::detect(chunk).context("format detection failed")?;
            tracing::info!("detected {format:?} input");
            demuxer = Some(Demuxer::new(format));
        }
        if let Some(demuxer) = demuxer.as_mut() {
            demuxer.read(chunk, &mut pipeline);
        }
    }

    let mut demuxer = demuxer.context("empty input, nothing to remux")?;
    demuxer.flush(&mut pipeline);

    let mut summary = pipeline.into_summary();
    summary.format = format!("{:?}", demuxer.format());
    summary.bytes = bytes;
    summary.writes = segments.load(Ordering::Relaxed);
    tracing::info!(
        "remuxed {} bytes into {} ({} writes)",
        bytes,
        cli.output.display(),
        summary.writes
    );
    Ok(summary)
}
