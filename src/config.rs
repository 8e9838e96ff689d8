//! Readout configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (`ReadoutConfig::default()`)
//! 2. A TOML file (optional when loading through [`ReadoutConfig::load`])
//! 3. Environment variables prefixed with `DAQ_READOUT_`
//!
//! Nested fields use double underscores, for example
//! `DAQ_READOUT_LATENCY_BUFFER__CAPACITY=200000` or
//! `DAQ_READOUT_EMULATOR__RATE_KHZ=166`.
//!
//! # Example
//! ```no_run
//! use daq_readout::config::ReadoutConfig;
//!
//! let config = ReadoutConfig::load_from("config/readout.toml")?;
//! config.validate()?;
//! println!("Latency buffer capacity: {}", config.latency_buffer.capacity);
//! # Ok::<(), daq_readout::error::ReadoutError>(())
//! ```

use crate::error::{ReadoutError, ReadoutResult};
use crate::latency_buffer::MIN_CAPACITY;
use crate::request::ComponentId;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_READOUT_";

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/readout.toml";

/// Top-level readout configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Latency buffer sizing and retention
    pub latency_buffer: LatencyBufferConfig,
    /// Frame geometry and gap detection
    pub frames: FramesConfig,
    /// Source emulator settings
    pub emulator: EmulatorConfig,
    /// Request handling settings
    pub requests: RequestConfig,
    /// Timesync heartbeat settings
    pub timesync: TimesyncConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-readout".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Latency buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyBufferConfig {
    /// Maximum number of frames retained
    pub capacity: usize,
    /// Use the binary-search strategy (true) or the plain FIFO (false)
    pub search_optimized: bool,
    /// Occupancy fraction of capacity that triggers auto-cleanup (1.0 disables it)
    pub pop_limit_pct: f64,
    /// Fraction of occupancy popped per auto-cleanup
    pub pop_size_pct: f64,
}

impl Default for LatencyBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            search_optimized: true,
            pop_limit_pct: 1.0,
            pop_size_pct: 0.0,
        }
    }
}

/// Frame geometry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    /// Expected payload size of every frame in bytes
    pub frame_size_bytes: usize,
    /// Nominal timestamp increment between consecutive frames
    pub tick_duration: u64,
    /// Extra ticks tolerated before a gap is recorded
    pub gap_tolerance: u64,
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self {
            frame_size_bytes: 464,
            tick_duration: 25,
            gap_tolerance: 0,
        }
    }
}

/// Source emulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Whether the emulator feeds the readout model
    pub enabled: bool,
    /// Frame production rate in kHz
    pub rate_khz: f64,
    /// Fraction of frames carrying hardware error bits (0.0 to 1.0)
    pub error_rate: f64,
    /// Fraction of frames skipped entirely (0.0 to 1.0)
    pub dropout_rate: f64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
    /// Timeout for pushing a frame into the ingest queue, in milliseconds
    pub queue_timeout_ms: u64,
    /// Timestamp of the first emulated frame
    pub first_timestamp: u64,
    /// Capacity of the raw frame queue between emulator and ingest loop
    pub queue_capacity: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_khz: 166.0,
            error_rate: 0.0,
            dropout_rate: 0.0,
            seed: None,
            queue_timeout_ms: 100,
            first_timestamp: 0,
            queue_capacity: 100_000,
        }
    }
}

impl EmulatorConfig {
    /// Queue push timeout as a [`Duration`].
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Request handling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Fragment delivery timeout in milliseconds
    pub delivery_timeout_ms: u64,
    /// Answer every request with an empty fragment instead of searching
    pub empty_fragment_mode: bool,
    /// Identifier stamped into fragment headers
    pub component_id: ComponentId,
    /// How long the request loop waits for a request before re-checking the run flag
    pub request_queue_timeout_ms: u64,
    /// Capacity of the inbound request queue
    pub queue_capacity: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 100,
            empty_fragment_mode: false,
            component_id: 0,
            request_queue_timeout_ms: 100,
            queue_capacity: 1_000,
        }
    }
}

impl RequestConfig {
    /// Delivery timeout as a [`Duration`].
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Timesync and fake trigger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimesyncConfig {
    /// Heartbeat period in milliseconds
    pub interval_ms: u64,
    /// Issue a self-addressed data request on every heartbeat
    pub fake_trigger: bool,
    /// Width of the fake trigger window in ticks
    pub fake_trigger_width: u64,
    /// Distance of the fake trigger window start behind the current daq time, in ticks
    pub fake_trigger_offset: u64,
    /// Destination of fake trigger fragments
    pub fake_trigger_destination: String,
}

impl Default for TimesyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            fake_trigger: false,
            fake_trigger_width: 1_000,
            fake_trigger_offset: 25_100,
            fake_trigger_destination: "fake_trigger".to_string(),
        }
    }
}

impl ReadoutConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] if it exists, then environment variables.
    pub fn load() -> ReadoutResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(ReadoutConfig::default()));
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Load configuration from a specific TOML file, then environment variables.
    ///
    /// A missing file is an error here, unlike [`load`](Self::load).
    pub fn load_from<P: AsRef<Path>>(path: P) -> ReadoutResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ReadoutError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        Ok(Figment::from(Serialized::defaults(ReadoutConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> ReadoutResult<Self> {
        Ok(Figment::from(Serialized::defaults(ReadoutConfig::default()))
            .merge(Toml::string(toml))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ReadoutResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ReadoutError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let lb = &self.latency_buffer;
        if lb.capacity < MIN_CAPACITY {
            return Err(ReadoutError::InvalidCapacity {
                capacity: lb.capacity,
                min: MIN_CAPACITY,
            });
        }
        check_fraction("latency_buffer.pop_limit_pct", lb.pop_limit_pct)?;
        check_fraction("latency_buffer.pop_size_pct", lb.pop_size_pct)?;

        if self.frames.frame_size_bytes == 0 {
            return Err(ReadoutError::Configuration(
                "frames.frame_size_bytes must be greater than 0".to_string(),
            ));
        }
        if self.frames.tick_duration == 0 {
            return Err(ReadoutError::Configuration(
                "frames.tick_duration must be greater than 0".to_string(),
            ));
        }

        let emu = &self.emulator;
        if !emu.rate_khz.is_finite() || emu.rate_khz <= 0.0 {
            return Err(ReadoutError::InvalidRate(emu.rate_khz));
        }
        check_fraction("emulator.error_rate", emu.error_rate)?;
        check_fraction("emulator.dropout_rate", emu.dropout_rate)?;
        if emu.queue_capacity == 0 || self.requests.queue_capacity == 0 {
            return Err(ReadoutError::Configuration(
                "queue capacities must be greater than 0".to_string(),
            ));
        }

        if self.timesync.interval_ms == 0 {
            return Err(ReadoutError::Configuration(
                "timesync.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.timesync.fake_trigger && self.timesync.fake_trigger_destination.is_empty() {
            return Err(ReadoutError::Configuration(
                "timesync.fake_trigger_destination must be set when fake_trigger is enabled"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

fn check_fraction(name: &'static str, value: f64) -> ReadoutResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ReadoutError::InvalidFraction { name, value })
    }
}
