//! Telemetry boundary
//!
//! The detector only emits `(name, value)` pairs. Storage and aggregation
//! belong to whoever implements [`MetricsSink`].

use crate::models::{CaptivePortalStatus, DetectionState};

pub const ATTEMPT_DURATION_MS: &str = "portal_detector.attempt.duration_ms";
pub const DETECTION_DURATION_MS: &str = "portal_detector.detection.duration_ms";
pub const PORTAL_TO_ONLINE_MS: &str = "portal_detector.portal_to_online_ms";
pub const MANAGER_ONLINE_BUT_PORTAL: &str = "portal_detector.connection_manager.online_but_portal";
pub const MANAGER_PORTAL_BUT_ONLINE: &str = "portal_detector.connection_manager.portal_but_online";

pub fn attempt_result(status: CaptivePortalStatus) -> String {
    format!("portal_detector.attempt.result.{}", status.as_str())
}

pub fn transition(from: DetectionState, to: DetectionState) -> String {
    format!("portal_detector.transition.{}_to_{}", from.as_str(), to.as_str())
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &str, value: f64);
}

/// Default sink: metrics become debug events on the `portald::metrics` target
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, name: &str, value: f64) {
        tracing::debug!(target: "portald::metrics", metric = name, value, "metric");
    }
}
