//! Global subscriber installation.
//!
//! Lives in its own test binary because it installs the process-wide
//! tracing subscriber.

use daq_readout::config::ReadoutConfig;
use daq_readout::logging::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    let config = ReadoutConfig::default();
    logging::init_from_config(&config).unwrap();

    // A second installation must not fail, whatever the format.
    let second = TracingConfig::new(Level::DEBUG)
        .with_format(OutputFormat::Json)
        .with_ansi(false);
    assert!(logging::init(second).is_ok());

    tracing::info!(test = "logging", "Subscriber installed");
}

#[test]
fn test_invalid_level_is_rejected_before_init() {
    let mut config = ReadoutConfig::default();
    config.application.log_level = "verbose".to_string();
    assert!(logging::init_from_config(&config).is_err());
}
