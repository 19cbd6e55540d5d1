//! Portald - captive portal detection for the default network
//!
//! The detection core ([`detector::PortalDetector`]) is a single-owner state
//! machine. [`service`] runs it on one tokio task, [`probe`] talks HTTP and
//! [`network`] reports which network is the default one.

pub mod config;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod models;
pub mod network;
pub mod probe;
pub mod service;

pub use detector::{
    DetectorConfig, LogObserver, ObserverId, PortalDetector, PortalObserver, ResultCache,
    StrategyId,
};
pub use error::{DetectorError, Result};
pub use models::{CaptivePortalState, CaptivePortalStatus, NetworkIdentity};
pub use service::DetectorHandle;
