//! Error types for the detection engine

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    /// Network-level failure talking to the probe URL
    #[error("Probe transport error: {0}")]
    ProbeTransport(#[from] reqwest::Error),

    #[error("Probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Unknown detection strategy '{0}'")]
    InvalidStrategy(String),

    #[error("Invalid probe url '{url}': {reason}")]
    InvalidProbeUrl { url: String, reason: String },

    #[error("Invalid timing configuration: {0}")]
    InvalidTimings(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network query failed: {0}")]
    NetworkQuery(String),

    #[error("Detector service has shut down")]
    ServiceClosed,
}

pub type Result<T> = std::result::Result<T, DetectorError>;

impl DetectorError {
    /// Errors that can only come from bad configuration and must stop startup
    pub fn is_policy_misconfiguration(&self) -> bool {
        matches!(
            self,
            DetectorError::InvalidStrategy(_)
                | DetectorError::InvalidProbeUrl { .. }
                | DetectorError::InvalidTimings(_)
                | DetectorError::Config(_)
        )
    }

    /// Errors that a single probe attempt absorbs as a No-Response result
    pub fn is_transient_probe_failure(&self) -> bool {
        match self {
            // A request that could not even be built will fail the same way next time
            DetectorError::ProbeTransport(e) => !e.is_builder(),
            DetectorError::ProbeTimeout(_) => true,
            _ => false,
        }
    }
}
