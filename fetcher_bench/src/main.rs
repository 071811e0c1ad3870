use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing_subscriber::EnvFilter;

use template_shmem::writer::{self, TemplateWriter};
use template_shmem::{BlockTemplate, HexDigest};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "pool-fetcher.toml")]
    config: String,
    /// Templates to publish before exiting; 0 runs until signalled.
    #[clap(short = 'n', long = "count", default_value = "0")]
    count: u64,
    /// Pause between updates.
    #[clap(long = "interval-ms", default_value = "1000")]
    interval_ms: u64,
    #[clap(long = "start-height", default_value = "1")]
    start_height: u64,
    #[clap(long = "hashing-blob-size", default_value = "76")]
    hashing_blob_size: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: writer::WriterConfig = confy::load_path(&opts.config)?;
    // A segment still linked at startup was left by a fetcher that died.
    cfg.shmem.recreate = true;
    tracing::info!(config = %opts.config, "{:?}", &cfg.shmem);

    let closing = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&closing))?;
    }

    let writer = TemplateWriter::new(&cfg)?;
    let result = run(&writer, &opts, &closing);
    // The fetcher normally created the segment; closing it removes it.
    writer.close();
    result
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A stand-in for what the daemon would hand us at `height`.
fn synthetic_template(height: u64, hashing_blob_size: usize) -> BlockTemplate {
    let mut prev = [0u8; 32];
    prev[..8].copy_from_slice(&height.to_le_bytes());
    let epoch = (height / 2048) as u8;
    BlockTemplate {
        height,
        difficulty: 300_000_000 + height,
        seed_hash: HexDigest::from_digest(&[epoch; 32]),
        next_seed_hash: HexDigest::from_digest(&[epoch.wrapping_add(1); 32]),
        prev_hash: HexDigest::from_digest(&prev),
        hashing_blob: vec![(height % 251) as u8; hashing_blob_size],
        block_blob: Some(vec![(height % 251) as u8; hashing_blob_size * 4]),
        reserved_offset: 130,
        tx_count: height % 40,
        timestamp: now_secs(),
    }
}

fn run(writer: &TemplateWriter, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut called = 0u64;
    let interval = Duration::from_millis(opts.interval_ms);

    while !closing.load(Ordering::Relaxed) && (opts.count == 0 || called < opts.count) {
        let height = opts.start_height + called;
        let version = writer.update(&synthetic_template(height, opts.hashing_blob_size))?;
        called += 1;
        if opts.interval_ms > 0 || called % 100_000 == 0 {
            tracing::info!(version, height, "published template");
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    let duration = start.elapsed();
    let per_sec = (called as f64) / duration.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        updates = called,
        ?duration,
        "{:.0} template updates/s",
        per_sec
    );
    Ok(())
}
