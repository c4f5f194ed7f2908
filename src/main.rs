//! CDMS Monitor - live ion classification from the command line
//!
//! Runs the read-out pipeline, prints a status line every second, and
//! prints the final statistics on exit (Ctrl+C or block limit).

use anyhow::{bail, Context, Result};
use cdms_core::{EventClass, Pipeline, PipelineState, Snapshot, SourceKind, StatusEvent};
use cdms_monitor::config::MonitorConfig;
use clap::{Parser, ValueEnum};
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the main loop wakes to check for Ctrl+C and status events
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Status line interval
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Synthetic,
    RapidBlock,
    Streaming,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Synthetic => SourceKind::Synthetic,
            SourceArg::RapidBlock => SourceKind::PhysicalRapidBlock,
            SourceArg::Streaming => SourceKind::PhysicalStreaming,
        }
    }
}

#[derive(Parser)]
#[command(name = "cdms-monitor")]
#[command(author, version, about = "CDMS read-out: live ion classification", long_about = None)]
struct Cli {
    /// Waveform source
    #[arg(long, value_enum)]
    source: Option<SourceArg>,

    /// Sample rate in Hz
    #[arg(long)]
    fs: Option<f64>,

    /// Samples per block
    #[arg(long)]
    samples: Option<usize>,

    /// Period between blocks in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,

    /// Probability of an empty block (synthetic)
    #[arg(long)]
    empty_prob: Option<f64>,

    /// Probability of a second ion (synthetic)
    #[arg(long)]
    multi_prob: Option<f64>,

    /// Lowest fundamental in Hz (synthetic)
    #[arg(long)]
    f0_min: Option<f64>,

    /// Highest fundamental in Hz (synthetic)
    #[arg(long)]
    f0_max: Option<f64>,

    /// Ion SNR in dB (synthetic)
    #[arg(long)]
    snr_db: Option<f64>,

    /// RNG seed for reproducible synthetic runs
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many blocks
    #[arg(long)]
    blocks: Option<u64>,

    /// Config file (defaults to the per-user data directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    save_config: bool,

    /// Print the final snapshot as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn apply(&self, config: &mut MonitorConfig) {
        if let Some(source) = self.source {
            config.source = source.into();
        }

        let acq = &mut config.acquisition;
        if let Some(fs) = self.fs {
            acq.fs_hz = fs;
        }
        if let Some(samples) = self.samples {
            acq.n_samples = samples;
        }
        if let Some(period_ms) = self.period_ms {
            acq.period_ms = period_ms;
        }
        if self.blocks.is_some() {
            acq.block_limit = self.blocks;
        }

        let syn = &mut acq.synthetic;
        if let Some(p) = self.empty_prob {
            syn.empty_prob = p;
        }
        if let Some(p) = self.multi_prob {
            syn.multi_prob = p;
        }
        if let Some(lo) = self.f0_min {
            syn.f0_range.0 = lo;
        }
        if let Some(hi) = self.f0_max {
            syn.f0_range.1 = hi;
        }
        if let Some(snr) = self.snr_db {
            syn.snr_db = snr;
        }
        if self.seed.is_some() {
            syn.seed = self.seed;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cdms_monitor=info".parse()?)
                .add_directive("cdms_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(MonitorConfig::path);
    let mut config = MonitorConfig::load_from(&config_path);
    cli.apply(&mut config);

    if cli.save_config {
        config
            .save(&config_path)
            .with_context(|| format!("saving config to {}", config_path.display()))?;
    }

    println!(
        "CDMS Monitor v{} (built {})",
        cdms_core::VERSION,
        cdms_core::BUILD_DATE
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    let mut pipeline = Pipeline::new(config.pipeline.clone());
    let status = pipeline.status_events();

    if let Err(e) = pipeline.start(config.source, config.acquisition.clone()) {
        print_status(&status);
        bail!("Failed to start: {}", e);
    }

    println!("Press Ctrl+C to stop.");
    let started = Instant::now();
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
        print_status(&status);

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            print_line(started.elapsed(), &pipeline.snapshot());
        }

        if let PipelineState::Finished(_) = pipeline.state() {
            break;
        }
    }

    // Stop and let queued blocks finish
    let summary = pipeline.finish(Duration::ZERO);
    print_status(&status);

    let snapshot = pipeline.snapshot();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        if let Some(summary) = summary {
            println!(
                "\n{} blocks in {:.1}s from {} source",
                summary.blocks,
                summary.duration.as_secs_f64(),
                summary.kind
            );
        }
        print_summary(&snapshot);
    }

    Ok(())
}

fn print_status(status: &Receiver<StatusEvent>) {
    for event in status.try_iter() {
        if event.is_error() {
            eprintln!("! {}", event);
        } else {
            println!("* {}", event);
        }
    }
}

fn print_line(elapsed: Duration, snap: &Snapshot) {
    println!(
        "[{:>7.1}s] empty {:>6} | single {:>6} | multiple {:>6} | {:>6.1} evt/s",
        elapsed.as_secs_f64(),
        snap.counts.no_ion,
        snap.counts.single,
        snap.counts.multiple,
        snap.rate_evt_per_s
    );
}

fn print_summary(snap: &Snapshot) {
    println!("\n=== Event Summary ===");
    for class in EventClass::ALL {
        let count = snap.counts.get(class);
        let pct = if snap.total_events > 0 {
            100.0 * count as f64 / snap.total_events as f64
        } else {
            0.0
        };
        println!("  {:<9} {:>8} ({:>5.1}%)", class.as_str(), count, pct);
    }
    println!("  {:<9} {:>8}", "total", snap.total_events);

    if snap.histogram.is_empty() {
        return;
    }

    println!("\n=== Fundamental (single ions) ===");
    let peak = snap.histogram.iter().map(|b| b.count).max().unwrap_or(1).max(1);
    for bin in snap.histogram.iter().filter(|b| b.count > 0) {
        let bar = "#".repeat((40 * bin.count / peak) as usize);
        println!("  {:>8.2} kHz {:>5} {}", bin.center_khz, bin.count, bar);
    }
}
