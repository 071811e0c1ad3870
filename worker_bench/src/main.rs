use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing_subscriber::EnvFilter;

use template_shmem::reader::{self, TemplateReader, TemplateSnapshot};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "pool-worker.toml")]
    config: String,
    /// Stop after this many new templates; 0 runs until signalled.
    #[clap(short = 'n', long = "templates", default_value = "0")]
    templates: u64,
    /// Pause between polls; 0 spins.
    #[clap(long = "poll-interval-us", default_value = "100")]
    poll_interval_us: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: reader::ReaderConfig = confy::load_path(&opts.config)?;

    let closing = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&closing))?;
    }

    let reader = &mut TemplateReader::new(&cfg)?;
    run(reader, &opts, &closing)?;
    Ok(())
}

struct WorkerStats {
    polls: u64,
    templates: u64,
    skipped_versions: u64,
}

/// Sanity checks a worker can make without knowing what the fetcher sent.
fn check_snapshot(snapshot: &TemplateSnapshot, previous_version: u64) -> Result<(), String> {
    if snapshot.version <= previous_version {
        return Err(format!(
            "version {} is not newer than {}",
            snapshot.version, previous_version
        ));
    }
    let template = &snapshot.template;
    if template.hashing_blob.is_empty() {
        return Err(format!("version {} has an empty hashing blob", snapshot.version));
    }
    if template.reserved_offset as usize > template.block_blob.as_ref().map_or(usize::MAX, Vec::len) {
        return Err(format!(
            "version {} reserved offset {} is past the block blob",
            snapshot.version, template.reserved_offset
        ));
    }
    Ok(())
}

fn run(reader: &mut TemplateReader, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let pause = Duration::from_micros(opts.poll_interval_us);
    let mut stats = WorkerStats {
        polls: 0,
        templates: 0,
        skipped_versions: 0,
    };

    while !closing.load(Ordering::Relaxed) && (opts.templates == 0 || stats.templates < opts.templates) {
        let previous = reader.last_seen_version();
        stats.polls += 1;
        if let Some(snapshot) = reader.refresh()? {
            check_snapshot(&snapshot, previous)?;
            stats.templates += 1;
            stats.skipped_versions += snapshot.version - previous - 1;
            tracing::info!(
                version = snapshot.version,
                height = snapshot.template.height,
                prev_hash = %snapshot.template.prev_hash,
                "new block template"
            );
        }
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    let duration = start.elapsed();
    let per_sec = (stats.polls as f64) / duration.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        polls = stats.polls,
        templates = stats.templates,
        skipped_versions = stats.skipped_versions,
        ?duration,
        "{:.0} polls/s",
        per_sec
    );
    Ok(())
}
