//! Data models shared by the detector, probe and network layers

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Connection-manager labels that mean the link is up
const CONNECTED_STATES: &[&str] = &["ready", "portal", "online"];

/// Label the connection manager uses when it suspects a portal itself
pub const PORTAL_STATE: &str = "portal";

pub fn is_connected_state(label: &str) -> bool {
    CONNECTED_STATES.contains(&label)
}

/// The network being probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkIdentity {
    /// Human-readable name (SSID or connection name)
    pub name: String,
    /// Stable unique identifier for the lifetime of the connection
    pub id: String,
    /// Connection-manager state label ("online", "portal", "idle", ...)
    pub connection_state: String,
}

impl NetworkIdentity {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        connection_state: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            connection_state: connection_state.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        is_connected_state(&self.connection_state)
    }

    /// True if the connection manager already flags this network as a portal
    pub fn portal_suspected(&self) -> bool {
        self.connection_state == PORTAL_STATE
    }
}

/// Externally reported captive portal status of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptivePortalStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Portal,
    ProxyAuthRequired,
}

impl CaptivePortalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptivePortalStatus::Unknown => "unknown",
            CaptivePortalStatus::Online => "online",
            CaptivePortalStatus::Offline => "offline",
            CaptivePortalStatus::Portal => "portal",
            CaptivePortalStatus::ProxyAuthRequired => "proxy_auth_required",
        }
    }
}

impl fmt::Display for CaptivePortalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached detection record for one network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CaptivePortalState {
    pub status: CaptivePortalStatus,
    pub response_code: Option<u16>,
    #[serde(skip)]
    pub detected_at: Option<Instant>,
}

impl CaptivePortalState {
    pub fn with_status(status: CaptivePortalStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Coarse result of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The well-known URL answered with the expected trivial response
    Online,
    /// Redirect or unexpected content
    Portal,
    /// HTTP 407 from a proxy
    ProxyAuthRequired,
    /// Transport failure, timeout or server error
    NoResponse,
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeOutcome::Online => "online",
            ProbeOutcome::Portal => "portal",
            ProbeOutcome::ProxyAuthRequired => "proxy_auth_required",
            ProbeOutcome::NoResponse => "no_response",
        };
        f.write_str(s)
    }
}

/// Result of one detection attempt, consumed once by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub outcome: ProbeOutcome,
    pub response_code: Option<u16>,
    pub probe_duration: Duration,
    /// Server-provided `Retry-After` hint
    pub retry_after: Option<Duration>,
}

impl AttemptResult {
    pub fn new(outcome: ProbeOutcome, response_code: Option<u16>, probe_duration: Duration) -> Self {
        Self {
            outcome,
            response_code,
            probe_duration,
            retry_after: None,
        }
    }

    pub fn no_response(probe_duration: Duration) -> Self {
        Self::new(ProbeOutcome::NoResponse, None, probe_duration)
    }
}

/// Where the detection loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionState {
    Idle,
    AttemptPending,
    Probing,
}

impl DetectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionState::Idle => "idle",
            DetectionState::AttemptPending => "attempt_pending",
            DetectionState::Probing => "probing",
        }
    }
}

/// Streak bookkeeping used to compute backoff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    /// Attempts in a row with the same outcome as `last_outcome`
    pub same_result_count: u32,
    /// Attempts in a row that got no response
    pub no_response_count: u32,
    pub last_outcome: Option<ProbeOutcome>,
}

impl RetryCounters {
    pub fn record(&mut self, outcome: ProbeOutcome) {
        if self.last_outcome == Some(outcome) {
            self.same_result_count = self.same_result_count.saturating_add(1);
        } else {
            self.last_outcome = Some(outcome);
            self.same_result_count = 1;
        }

        if outcome == ProbeOutcome::NoResponse {
            self.no_response_count = self.no_response_count.saturating_add(1);
        } else {
            self.no_response_count = 0;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
