//! CLI Entry Point for daq-readout
//!
//! Provides command-line interface for:
//! - Running the readout model against the source emulator for a fixed duration
//! - Validating a configuration file
//!
//! # Usage
//!
//! Run an emulated readout for ten seconds with fake triggers:
//! ```bash
//! daq-readout emulate --config config/readout.toml --duration-secs 10 --fake-trigger
//! ```
//!
//! Check a configuration file:
//! ```bash
//! daq-readout check-config config/readout.toml
//! ```

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use daq_readout::config::ReadoutConfig;
use daq_readout::emulator::SourceEmulator;
use daq_readout::fragment::{Fragment, FragmentErrorBits};
use daq_readout::logging::{self, OutputFormat, TracingConfig};
use daq_readout::readout::ReadoutModel;
use daq_readout::request::DataDestination;
use daq_readout::transport::ChannelTransport;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fragments buffered per registered destination.
const DESTINATION_QUEUE: usize = 10_000;

#[derive(Parser)]
#[command(name = "daq-readout")]
#[command(about = "Latency-buffered readout front-end with a synthetic source", long_about = None)]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the readout model fed by the source emulator
    Emulate {
        /// TOML config file (defaults to config/readout.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// How long to run before stopping
        #[arg(long, default_value = "5")]
        duration_secs: u64,

        /// Override the emulator rate in kHz
        #[arg(long)]
        rate_khz: Option<f64>,

        /// Issue a fake trigger on every timesync heartbeat
        #[arg(long)]
        fake_trigger: bool,
    },

    /// Load and validate a configuration file, then print the effective settings
    CheckConfig {
        /// TOML config file
        path: PathBuf,
    },
}

/// Tally of fragments received on the fake trigger destination.
#[derive(Debug, Default, Serialize)]
struct FragmentTally {
    fragments: u64,
    bytes: u64,
    complete: u64,
    incomplete: u64,
    not_found: u64,
    with_frame_errors: u64,
    undecodable: u64,
}

impl FragmentTally {
    fn record(&mut self, bytes: Bytes) {
        self.fragments += 1;
        self.bytes += bytes.len() as u64;
        match Fragment::from_bytes(bytes) {
            Ok(fragment) => {
                let bits = fragment.error_bits();
                if bits.contains(FragmentErrorBits::DATA_NOT_FOUND) {
                    self.not_found += 1;
                } else if bits.contains(FragmentErrorBits::INCOMPLETE) {
                    self.incomplete += 1;
                } else {
                    self.complete += 1;
                }
                if bits.intersects(FragmentErrorBits::MISSING_FRAMES | FragmentErrorBits::FAULTY_FRAMES)
                {
                    self.with_frame_errors += 1;
                }
            }
            Err(e) => {
                self.undecodable += 1;
                warn!(error = %e, "Received undecodable fragment");
            }
        }
    }

    fn drain(&mut self, rx: &Receiver<Bytes>) {
        for bytes in rx.try_iter() {
            self.record(bytes);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Emulate {
            config,
            duration_secs,
            rate_khz,
            fake_trigger,
        } => {
            let mut config = match config {
                Some(path) => ReadoutConfig::load_from(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ReadoutConfig::load()?,
            };
            if let Some(rate) = rate_khz {
                config.emulator.rate_khz = rate;
            }
            config.timesync.fake_trigger |= fake_trigger;
            init_logging(&config, cli.log_format)?;
            run_emulation(config, Duration::from_secs(duration_secs))
        }
        Commands::CheckConfig { path } => {
            let config = ReadoutConfig::load_from(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(config: &ReadoutConfig, format: OutputFormat) -> Result<()> {
    let tracing_config = TracingConfig::from_readout_config(config)?.with_format(format);
    logging::init(tracing_config)?;
    Ok(())
}

fn run_emulation(config: ReadoutConfig, duration: Duration) -> Result<()> {
    let transport = Arc::new(ChannelTransport::new());
    let fragments = transport.register(
        DataDestination::new(config.timesync.fake_trigger_destination.clone()),
        DESTINATION_QUEUE,
    );

    let mut model = ReadoutModel::new(config.clone(), transport)?;
    let timesyncs = model.timesync_receiver();
    model.start()?;

    let mut emulator = if config.emulator.enabled {
        let mut emulator = SourceEmulator::new(
            config.emulator.clone(),
            config.frames.clone(),
            model.frame_sender(),
        );
        emulator.start()?;
        Some(emulator)
    } else {
        info!("Source emulator disabled, readout idles");
        None
    };

    info!(duration_secs = duration.as_secs(), "Emulated readout running");
    let mut tally = FragmentTally::default();
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
        tally.drain(&fragments);
        if let Some(sync) = timesyncs.try_iter().last() {
            info!(daq_time = sync.daq_time, occupancy = model.buffer().occupancy(), "Timesync");
        }
    }

    let emulated = emulator.as_mut().map(|e| {
        e.stop();
        e.stats()
    });
    let readout = model.info();
    model.stop();
    tally.drain(&fragments);

    let summary = serde_json::json!({
        "emulator": emulated,
        "readout": readout,
        "fragments": tally,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
