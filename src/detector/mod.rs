//! Captive portal detection state machine
//!
//! [`PortalDetector`] owns the detection loop for the default network:
//!
//! ```text
//! Idle -> AttemptPending -> Probing -> AttemptPending | Idle
//! ```
//!
//! It performs no IO. Timers and probes are requested through [`Command`]s
//! which the driver in [`crate::service`] executes, and their completions are
//! fed back stamped with the generation they were issued under. A stale
//! generation means the attempt was superseded and its result is dropped.

pub mod cache;
pub mod observer;
pub mod strategy;

pub use cache::ResultCache;
pub use observer::{LogObserver, ObserverId, ObserverRegistry, PortalObserver};
pub use strategy::{DetectionStrategy, StrategyId, StrategyTimings};

use crate::error::{DetectorError, Result};
use crate::metrics::{self, MetricsSink};
use crate::models::{
    AttemptResult, CaptivePortalState, CaptivePortalStatus, DetectionState, NetworkIdentity,
    ProbeOutcome, RetryCounters,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Immutable detector settings, validated at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// URL that returns 204 when the internet is reachable
    pub probe_url: Url,
    /// Bound on a single probe
    pub attempt_timeout: Duration,
    pub strategy: StrategyId,
    pub timings: StrategyTimings,
    /// Consecutive No-Response results before the network is reported offline
    pub no_response_offline_threshold: u32,
    /// Delay before re-probing after a proxy configuration change
    pub proxy_change_delay: Duration,
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        crate::probe::validate_probe_url(self.probe_url.as_str())?;
        self.timings.validate()?;
        if self.attempt_timeout.is_zero() {
            return Err(DetectorError::InvalidTimings(
                "attempt_timeout must be greater than zero".into(),
            ));
        }
        if self.no_response_offline_threshold == 0 {
            return Err(DetectorError::InvalidTimings(
                "no_response_offline_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Source of "now" for the detector
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Follows tokio's clock, so paused test time applies
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Work the driver must perform on behalf of the detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Arm the attempt timer, replacing any armed one
    ScheduleAttempt { generation: u64, delay: Duration },
    /// Issue a probe and arm its timeout
    StartProbe {
        generation: u64,
        url: Url,
        timeout: Duration,
    },
    /// Drop the timer, the timeout and abort the probe of this generation
    CancelAttempt { generation: u64 },
}

/// Last logged attempt, used to keep repeated identical results out of the info log
#[derive(Debug, Clone, PartialEq, Eq)]
struct AttemptReport {
    network_name: String,
    network_id: String,
    outcome: ProbeOutcome,
    response_code: Option<u16>,
}

pub struct PortalDetector {
    config: DetectorConfig,
    strategy: DetectionStrategy,
    pending_strategy: Option<StrategyId>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    cache: ResultCache,
    observers: ObserverRegistry,

    enabled: bool,
    state: DetectionState,
    network: Option<NetworkIdentity>,
    counters: RetryCounters,
    generation: u64,
    next_attempt_delay: Duration,

    detection_start: Option<Instant>,
    attempt_start: Option<Instant>,
    portal_since: Option<Instant>,
    last_report: Option<AttemptReport>,

    commands: VecDeque<Command>,
}

impl PortalDetector {
    /// Create a disabled detector. Fails on an invalid configuration.
    pub fn new(
        config: DetectorConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let strategy = DetectionStrategy::new(config.strategy, config.timings.clone());

        Ok(Self {
            config,
            strategy,
            pending_strategy: None,
            clock,
            metrics,
            cache: ResultCache::new(),
            observers: ObserverRegistry::new(),
            enabled: false,
            state: DetectionState::Idle,
            network: None,
            counters: RetryCounters::default(),
            generation: 0,
            next_attempt_delay: Duration::ZERO,
            detection_start: None,
            attempt_start: None,
            portal_since: None,
            last_report: None,
            commands: VecDeque::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn network(&self) -> Option<&NetworkIdentity> {
        self.network.as_ref()
    }

    pub fn counters(&self) -> &RetryCounters {
        &self.counters
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Delay used for the most recently scheduled attempt
    pub fn next_attempt_delay(&self) -> Duration {
        self.next_attempt_delay
    }

    pub fn strategy_id(&self) -> StrategyId {
        self.strategy.id()
    }

    /// Shared handle to the result cache, readable from any thread
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn status(&self, network_id: &str) -> CaptivePortalStatus {
        self.cache.get(network_id)
    }

    /// Commands produced since the last call, in order
    pub fn take_commands(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn PortalObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    /// Deliver the current network's last known state, then subscribe
    pub fn add_and_notify_current(&mut self, observer: Arc<dyn PortalObserver>) -> ObserverId {
        let state = self
            .network
            .as_ref()
            .and_then(|n| self.cache.state(&n.id))
            .unwrap_or_default();
        observer.on_portal_detection_completed(self.network.as_ref(), &state);
        self.observers.add(observer)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub fn enable(&mut self, start_detection: bool) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        self.counters.reset();
        tracing::info!("Portal detection enabled");

        if start_detection && self.state == DetectionState::Idle && self.can_probe() {
            self.start_detection();
        }
    }

    pub fn disable(&mut self) {
        if self.enabled {
            tracing::info!("Portal detection disabled");
        }
        self.enabled = false;
        self.stop_detection();
    }

    /// Start a prompt detection if nothing is scheduled or running
    pub fn start_detection_if_idle(&mut self) -> bool {
        if self.state != DetectionState::Idle || !self.can_probe() {
            return false;
        }
        self.start_detection();
        true
    }

    /// Swap the timing policy. Never takes effect in the middle of a probe.
    pub fn set_strategy(&mut self, id: StrategyId) {
        if self.state == DetectionState::Probing {
            tracing::debug!("Deferring strategy switch to {} until the probe completes", id);
            self.pending_strategy = Some(id);
            return;
        }

        self.pending_strategy = None;
        if id == self.strategy.id() {
            return;
        }
        self.apply_strategy(id);

        if self.state == DetectionState::AttemptPending {
            let is_first = self.counters.last_outcome.is_none();
            let delay = self.strategy.next_attempt_delay(&self.counters, is_first);
            self.schedule_attempt(delay);
        }
    }

    pub fn on_network_changed(&mut self, network: Option<NetworkIdentity>) {
        let Some(network) = network else {
            self.on_default_network_lost();
            return;
        };

        match self.network.take() {
            Some(current) if current.id == network.id => {
                if current.connection_state == network.connection_state {
                    // Spurious notification, only the name may have changed
                    self.network = Some(network);
                    return;
                }

                let reconnected = !current.is_connected() && network.is_connected();
                tracing::info!(
                    "Network '{}' changed state: {} -> {}",
                    network.name,
                    current.connection_state,
                    network.connection_state
                );
                self.network = Some(network);

                self.stop_detection();
                if reconnected {
                    self.reset_counters();
                }
            }
            _ => {
                tracing::info!(
                    "Default network is now '{}' ({}, {})",
                    network.name,
                    network.id,
                    network.connection_state
                );
                self.stop_detection();
                self.network = Some(network);
                self.reset_counters();
            }
        }

        if self.can_probe() {
            self.start_detection();
        }
    }

    /// The network vanished from the system; forget its cached result
    pub fn on_network_removed(&mut self, network_id: &str) {
        if self.cache.remove(network_id).is_some() {
            tracing::debug!("Dropped cached portal state for {}", network_id);
        }
    }

    /// Proxy settings changed, so the last result may no longer hold
    pub fn on_proxy_changed(&mut self) {
        if !self.can_probe() {
            return;
        }
        tracing::debug!("Proxy configuration changed, re-probing");
        self.stop_detection();
        self.detection_start = Some(self.clock.now());
        self.schedule_attempt(self.config.proxy_change_delay);
    }

    pub fn on_attempt_timer_fired(&mut self, generation: u64) {
        if generation != self.generation || self.state != DetectionState::AttemptPending {
            tracing::trace!("Ignoring stale attempt timer (generation {})", generation);
            return;
        }

        self.attempt_start = Some(self.clock.now());
        self.set_state(DetectionState::Probing);
        self.commands.push_back(Command::StartProbe {
            generation,
            url: self.config.probe_url.clone(),
            timeout: self.config.attempt_timeout,
        });
    }

    /// The probe outlived its bound; treat it as a No-Response result
    pub fn on_attempt_timeout(&mut self, generation: u64) {
        if generation != self.generation || self.state != DetectionState::Probing {
            return;
        }

        tracing::debug!("Probe timed out after {:?}", self.config.attempt_timeout);
        self.commands.push_back(Command::CancelAttempt { generation });
        let elapsed = self.elapsed_since_attempt_start();
        self.on_attempt_completed(generation, AttemptResult::no_response(elapsed));
    }

    pub fn on_attempt_completed(&mut self, generation: u64, result: AttemptResult) {
        if generation != self.generation || self.state != DetectionState::Probing {
            tracing::debug!(
                "Discarding stale probe result (generation {}, current {})",
                generation,
                self.generation
            );
            return;
        }
        let Some(network) = self.network.clone() else {
            self.set_state(DetectionState::Idle);
            return;
        };

        self.counters.record(result.outcome);
        let state = CaptivePortalState {
            status: self.reported_status(&network, &result),
            response_code: result.response_code,
            detected_at: Some(self.clock.now()),
        };

        self.report_attempt(&network, &result);
        self.record_detection_stats(&network, &result, state.status);
        self.cache.update(&network.id, state);
        self.attempt_start = None;

        if let Some(id) = self.pending_strategy.take() {
            self.apply_strategy(id);
        }

        self.observers.notify(Some(&network), &state);

        if self.can_probe() {
            let delay = self.delay_after(&network, &result, state.status);
            self.schedule_attempt(delay);
        } else {
            self.set_state(DetectionState::Idle);
        }
    }

    fn on_default_network_lost(&mut self) {
        if self.network.is_none() && self.state == DetectionState::Idle {
            return;
        }
        tracing::info!("No default network");

        self.stop_detection();
        self.network = None;
        self.reset_counters();

        let state = CaptivePortalState::with_status(CaptivePortalStatus::Offline);
        self.observers.notify(None, &state);
    }

    fn can_probe(&self) -> bool {
        self.enabled && self.network.as_ref().is_some_and(NetworkIdentity::is_connected)
    }

    fn start_detection(&mut self) {
        self.detection_start = Some(self.clock.now());
        let delay = self.strategy.next_attempt_delay(&self.counters, true);
        self.schedule_attempt(delay);
    }

    fn stop_detection(&mut self) {
        if self.state != DetectionState::Idle {
            self.commands.push_back(Command::CancelAttempt {
                generation: self.generation,
            });
            self.generation += 1;
            self.set_state(DetectionState::Idle);
        }
        self.attempt_start = None;
        self.detection_start = None;

        if let Some(id) = self.pending_strategy.take() {
            self.apply_strategy(id);
        }
    }

    fn schedule_attempt(&mut self, delay: Duration) {
        self.generation += 1;
        self.next_attempt_delay = delay;
        self.set_state(DetectionState::AttemptPending);
        tracing::debug!("Next portal check in {:?}", delay);
        self.commands.push_back(Command::ScheduleAttempt {
            generation: self.generation,
            delay,
        });
    }

    fn reset_counters(&mut self) {
        self.counters.reset();
        self.portal_since = None;
    }

    fn apply_strategy(&mut self, id: StrategyId) {
        if id == self.strategy.id() {
            return;
        }
        tracing::info!("Detection strategy: {} -> {}", self.strategy.id(), id);
        self.strategy = DetectionStrategy::new(id, self.config.timings.clone());
    }

    fn set_state(&mut self, next: DetectionState) {
        if next == self.state {
            return;
        }
        self.metrics.record(&metrics::transition(self.state, next), 1.0);
        tracing::trace!("{} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
    }

    /// Map the raw probe outcome onto the externally reported status
    fn reported_status(&self, network: &NetworkIdentity, result: &AttemptResult) -> CaptivePortalStatus {
        match result.outcome {
            ProbeOutcome::Online => CaptivePortalStatus::Online,
            ProbeOutcome::Portal => CaptivePortalStatus::Portal,
            ProbeOutcome::ProxyAuthRequired => CaptivePortalStatus::ProxyAuthRequired,
            ProbeOutcome::NoResponse
                if self.counters.no_response_count >= self.config.no_response_offline_threshold =>
            {
                CaptivePortalStatus::Offline
            }
            ProbeOutcome::NoResponse if network.portal_suspected() => CaptivePortalStatus::Portal,
            ProbeOutcome::NoResponse => self.cache.get(&network.id),
        }
    }

    fn delay_after(
        &self,
        network: &NetworkIdentity,
        result: &AttemptResult,
        status: CaptivePortalStatus,
    ) -> Duration {
        let delay = if status == CaptivePortalStatus::Online && network.portal_suspected() {
            // Connection manager disagrees with the probe, keep checking on the backoff schedule
            self.strategy.backoff_delay(self.counters.same_result_count)
        } else {
            self.strategy.next_attempt_delay(&self.counters, false)
        };

        // A server hint may postpone the next attempt, but never past the backoff cap
        match result.retry_after {
            Some(retry_after) => delay.max(retry_after.min(self.config.timings.max_backoff)),
            None => delay,
        }
    }

    fn elapsed_since_attempt_start(&self) -> Duration {
        self.attempt_start
            .map(|start| self.clock.now().saturating_duration_since(start))
            .unwrap_or_default()
    }

    fn report_attempt(&mut self, network: &NetworkIdentity, result: &AttemptResult) {
        let report = AttemptReport {
            network_name: network.name.clone(),
            network_id: network.id.clone(),
            outcome: result.outcome,
            response_code: result.response_code,
        };

        if self.last_report.as_ref() == Some(&report) {
            tracing::debug!(
                "Detection attempt on '{}': {} (repeated {}x)",
                network.name,
                result.outcome,
                self.counters.same_result_count
            );
            return;
        }

        tracing::info!(
            "Detection attempt completed: name='{}', id={}, result={}, response_code={:?}",
            report.network_name,
            report.network_id,
            report.outcome,
            report.response_code
        );
        self.last_report = Some(report);
    }

    fn record_detection_stats(
        &mut self,
        network: &NetworkIdentity,
        result: &AttemptResult,
        status: CaptivePortalStatus,
    ) {
        let now = self.clock.now();

        self.metrics.record(
            metrics::ATTEMPT_DURATION_MS,
            result.probe_duration.as_secs_f64() * 1000.0,
        );
        self.metrics.record(&metrics::attempt_result(status), 1.0);

        if status != CaptivePortalStatus::Unknown {
            if let Some(start) = self.detection_start.take() {
                let elapsed = now.saturating_duration_since(start);
                self.metrics
                    .record(metrics::DETECTION_DURATION_MS, elapsed.as_secs_f64() * 1000.0);
            }
        }

        match (network.connection_state.as_str(), status) {
            ("online", CaptivePortalStatus::Portal) => {
                self.metrics.record(metrics::MANAGER_ONLINE_BUT_PORTAL, 1.0)
            }
            (crate::models::PORTAL_STATE, CaptivePortalStatus::Online) => {
                self.metrics.record(metrics::MANAGER_PORTAL_BUT_ONLINE, 1.0)
            }
            _ => {}
        }

        match status {
            CaptivePortalStatus::Portal => {
                self.portal_since.get_or_insert(now);
            }
            CaptivePortalStatus::Online => {
                if let Some(since) = self.portal_since.take() {
                    let elapsed = now.saturating_duration_since(since);
                    self.metrics
                        .record(metrics::PORTAL_TO_ONLINE_MS, elapsed.as_secs_f64() * 1000.0);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::RecordingMetrics;
    use std::sync::Mutex;

    struct ManualClock(Mutex<Instant>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Instant::now())))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock().unwrap()
        }
    }

    type Events = Arc<Mutex<Vec<(Option<String>, CaptivePortalStatus)>>>;

    struct Harness {
        detector: PortalDetector,
        clock: Arc<ManualClock>,
        metrics: Arc<RecordingMetrics>,
        events: Events,
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            probe_url: Url::parse("http://clients3.google.com/generate_204").unwrap(),
            attempt_timeout: Duration::from_secs(5),
            strategy: StrategyId::Backoff,
            timings: StrategyTimings::default(),
            no_response_offline_threshold: 5,
            proxy_change_delay: Duration::from_secs(1),
        }
    }

    fn harness_with(config: DetectorConfig) -> Harness {
        let clock = ManualClock::new();
        let metrics = Arc::new(RecordingMetrics::default());
        let mut detector = PortalDetector::new(config, clock.clone(), metrics.clone()).unwrap();

        let events: Events = Arc::default();
        let sink = Arc::clone(&events);
        detector.add_observer(Arc::new(
            move |network: Option<&NetworkIdentity>, state: &CaptivePortalState| {
                sink.lock()
                    .unwrap()
                    .push((network.map(|n| n.id.clone()), state.status));
            },
        ));

        Harness {
            detector,
            clock,
            metrics,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    fn wifi(id: &str) -> NetworkIdentity {
        NetworkIdentity::new(id, id, "online")
    }

    fn result(outcome: ProbeOutcome) -> AttemptResult {
        let code = match outcome {
            ProbeOutcome::Online => Some(204),
            ProbeOutcome::Portal => Some(302),
            ProbeOutcome::ProxyAuthRequired => Some(407),
            ProbeOutcome::NoResponse => None,
        };
        AttemptResult::new(outcome, code, Duration::from_millis(120))
    }

    impl Harness {
        /// Fire the armed timer and return the generation of the probe it started
        fn fire_timer(&mut self) -> u64 {
            let commands = self.detector.take_commands();
            let Some(Command::ScheduleAttempt { generation, delay }) = commands
                .iter()
                .rev()
                .find(|c| matches!(c, Command::ScheduleAttempt { .. }))
                .cloned()
            else {
                panic!("no attempt scheduled: {:?}", commands);
            };
            self.clock.advance(delay);
            self.detector.on_attempt_timer_fired(generation);

            let commands = self.detector.take_commands();
            assert!(
                matches!(commands.as_slice(), [Command::StartProbe { generation: g, .. }] if *g == generation),
                "unexpected commands {:?}",
                commands
            );
            generation
        }

        fn complete(&mut self, outcome: ProbeOutcome) {
            let generation = self.fire_timer();
            self.clock.advance(Duration::from_millis(120));
            self.detector.on_attempt_completed(generation, result(outcome));
        }

        fn events(&self) -> Vec<(Option<String>, CaptivePortalStatus)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let clock = ManualClock::new();
        let metrics = Arc::new(RecordingMetrics::default());

        let mut bad = config();
        bad.no_response_offline_threshold = 0;
        assert!(PortalDetector::new(bad, clock.clone(), metrics.clone()).is_err());

        let mut bad = config();
        bad.probe_url = Url::parse("ftp://example.com/").unwrap();
        let err = PortalDetector::new(bad, clock, metrics).err().unwrap();
        assert!(err.is_policy_misconfiguration());
    }

    #[test]
    fn test_disabled_detector_stays_idle() {
        let mut h = harness();
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        assert_eq!(h.detector.state(), DetectionState::Idle);
        assert!(h.detector.take_commands().is_empty());
        assert!(!h.detector.start_detection_if_idle());
    }

    #[test]
    fn test_online_network_moves_to_light_polling() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));

        assert_eq!(h.detector.state(), DetectionState::AttemptPending);
        assert_eq!(h.detector.next_attempt_delay(), Duration::ZERO);

        h.complete(ProbeOutcome::Online);

        assert_eq!(h.detector.status("wifi-A"), CaptivePortalStatus::Online);
        assert_eq!(h.detector.state(), DetectionState::AttemptPending);
        assert_eq!(h.detector.next_attempt_delay(), Duration::from_secs(30));
        assert_eq!(
            h.events(),
            vec![(Some("wifi-A".to_string()), CaptivePortalStatus::Online)]
        );
        assert_eq!(h.metrics.count(metrics::DETECTION_DURATION_MS), 1);
    }

    #[test]
    fn test_repeated_portal_backs_off_and_reports_each_time() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));

        for _ in 0..3 {
            h.complete(ProbeOutcome::Portal);
        }

        assert_eq!(h.detector.counters().same_result_count, 3);
        assert_eq!(h.detector.next_attempt_delay(), Duration::from_secs(3 * 4));
        assert_eq!(
            h.events(),
            vec![(Some("wifi-B".to_string()), CaptivePortalStatus::Portal); 3]
        );
        assert_eq!(h.metrics.count(&metrics::attempt_result(CaptivePortalStatus::Portal)), 3);
    }

    #[test]
    fn test_backoff_never_exceeds_cap() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));

        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            h.complete(ProbeOutcome::ProxyAuthRequired);
            let delay = h.detector.next_attempt_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(300));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(192));
    }

    #[test]
    fn test_no_response_flips_to_offline_at_threshold() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-D")));

        for _ in 0..5 {
            h.complete(ProbeOutcome::NoResponse);
        }

        let statuses: Vec<_> = h.events().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            statuses,
            vec![
                CaptivePortalStatus::Unknown,
                CaptivePortalStatus::Unknown,
                CaptivePortalStatus::Unknown,
                CaptivePortalStatus::Unknown,
                CaptivePortalStatus::Offline,
            ]
        );
        assert_eq!(h.detector.counters().no_response_count, 5);
        assert_eq!(h.detector.status("wifi-D"), CaptivePortalStatus::Offline);
    }

    #[test]
    fn test_no_response_keeps_portal_hint_until_threshold() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector
            .on_network_changed(Some(NetworkIdentity::new("cafe", "cafe", "portal")));

        for _ in 0..4 {
            h.complete(ProbeOutcome::NoResponse);
        }
        assert_eq!(h.detector.status("cafe"), CaptivePortalStatus::Portal);

        h.complete(ProbeOutcome::NoResponse);
        assert_eq!(h.detector.status("cafe"), CaptivePortalStatus::Offline);
    }

    #[test]
    fn test_spurious_notifications_keep_counters() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        h.complete(ProbeOutcome::Portal);
        h.complete(ProbeOutcome::Portal);

        let generation = h.detector.generation();
        for _ in 0..5 {
            h.detector.on_network_changed(Some(wifi("wifi-B")));
        }

        assert_eq!(h.detector.counters().same_result_count, 2);
        assert_eq!(h.detector.generation(), generation);
        assert!(h.detector.take_commands().iter().all(|c| !matches!(c, Command::CancelAttempt { .. })));
    }

    #[test]
    fn test_identity_change_resets_counters() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        h.complete(ProbeOutcome::Portal);
        h.complete(ProbeOutcome::Portal);

        h.detector.on_network_changed(Some(wifi("wifi-C")));
        assert_eq!(*h.detector.counters(), RetryCounters::default());
        assert_eq!(h.detector.next_attempt_delay(), Duration::ZERO);

        h.complete(ProbeOutcome::Portal);
        assert_eq!(h.detector.counters().same_result_count, 1);
    }

    #[test]
    fn test_label_change_keeps_counters_while_connected() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector
            .on_network_changed(Some(NetworkIdentity::new("cafe", "cafe", "portal")));
        h.complete(ProbeOutcome::Portal);
        h.complete(ProbeOutcome::Portal);

        h.detector
            .on_network_changed(Some(NetworkIdentity::new("cafe", "cafe", "online")));
        assert_eq!(h.detector.counters().same_result_count, 2);
        assert_eq!(h.detector.state(), DetectionState::AttemptPending);
        assert_eq!(h.detector.next_attempt_delay(), Duration::ZERO);
    }

    #[test]
    fn test_reconnect_resets_counters() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        h.complete(ProbeOutcome::Portal);

        h.detector
            .on_network_changed(Some(NetworkIdentity::new("wifi-B", "wifi-B", "association")));
        assert_eq!(h.detector.state(), DetectionState::Idle);
        assert_eq!(h.detector.counters().same_result_count, 1);

        h.detector.on_network_changed(Some(wifi("wifi-B")));
        assert_eq!(*h.detector.counters(), RetryCounters::default());
        assert_eq!(h.detector.state(), DetectionState::AttemptPending);
    }

    #[test]
    fn test_identity_change_discards_in_flight_result() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        let stale = h.fire_timer();

        h.detector.on_network_changed(Some(wifi("wifi-C")));
        let commands = h.detector.take_commands();
        assert_eq!(commands[0], Command::CancelAttempt { generation: stale });
        assert!(matches!(
            commands[1],
            Command::ScheduleAttempt { delay, .. } if delay == Duration::ZERO
        ));

        h.detector.on_attempt_completed(stale, result(ProbeOutcome::Portal));
        assert!(h.events().is_empty());
        assert_eq!(h.detector.status("wifi-B"), CaptivePortalStatus::Unknown);
        assert_eq!(h.detector.state(), DetectionState::AttemptPending);
    }

    #[test]
    fn test_disable_cancels_and_discards() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        let generation = h.fire_timer();

        h.detector.disable();
        h.detector.disable();
        assert_eq!(h.detector.state(), DetectionState::Idle);
        assert_eq!(
            h.detector.take_commands(),
            vec![Command::CancelAttempt { generation }]
        );

        h.detector.on_attempt_completed(generation, result(ProbeOutcome::Online));
        h.detector.on_attempt_timeout(generation);
        assert!(h.events().is_empty());
        assert!(h.detector.cache().is_empty());
    }

    #[test]
    fn test_reenable_behaves_like_fresh_network() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        h.complete(ProbeOutcome::Portal);
        h.complete(ProbeOutcome::Portal);

        h.detector.disable();
        h.detector.enable(true);

        assert_eq!(*h.detector.counters(), RetryCounters::default());
        assert_eq!(h.detector.state(), DetectionState::AttemptPending);
        assert_eq!(h.detector.next_attempt_delay(), Duration::ZERO);
    }

    #[test]
    fn test_timeout_synthesizes_no_response() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        let generation = h.fire_timer();

        h.clock.advance(Duration::from_secs(5));
        h.detector.on_attempt_timeout(generation);

        let commands = h.detector.take_commands();
        assert_eq!(commands[0], Command::CancelAttempt { generation });
        assert_eq!(h.detector.counters().no_response_count, 1);
        assert_eq!(h.events().len(), 1);
        assert_eq!(
            h.metrics.values(metrics::ATTEMPT_DURATION_MS),
            vec![5000.0]
        );

        // The real result arriving late changes nothing
        h.detector.on_attempt_completed(generation, result(ProbeOutcome::Online));
        assert_eq!(h.events().len(), 1);
    }

    #[test]
    fn test_no_network_forces_idle() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        h.fire_timer();

        h.detector.on_network_changed(None);
        assert_eq!(h.detector.state(), DetectionState::Idle);
        assert!(h.detector.network().is_none());
        assert_eq!(h.events(), vec![(None, CaptivePortalStatus::Offline)]);

        h.detector.on_network_changed(None);
        assert_eq!(h.events().len(), 1);
    }

    #[test]
    fn test_add_and_notify_current() {
        let mut h = harness();
        h.detector.enable(true);

        let seen: Events = Arc::default();
        let sink = Arc::clone(&seen);
        let observer = Arc::new(
            move |network: Option<&NetworkIdentity>, state: &CaptivePortalState| {
                sink.lock()
                    .unwrap()
                    .push((network.map(|n| n.id.clone()), state.status));
            },
        );
        let id = h.detector.add_and_notify_current(observer.clone());
        assert_eq!(*seen.lock().unwrap(), vec![(None, CaptivePortalStatus::Unknown)]);
        h.detector.remove_observer(id);

        h.detector.on_network_changed(Some(wifi("wifi-A")));
        h.complete(ProbeOutcome::Portal);
        h.detector.add_and_notify_current(observer);
        assert_eq!(
            seen.lock().unwrap().last().cloned(),
            Some((Some("wifi-A".to_string()), CaptivePortalStatus::Portal))
        );
    }

    #[test]
    fn test_strategy_switch_waits_for_probe() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        let generation = h.fire_timer();

        h.detector.set_strategy(StrategyId::FixedInterval);
        assert_eq!(h.detector.strategy_id(), StrategyId::Backoff);
        assert!(h.detector.take_commands().is_empty());

        h.detector.on_attempt_completed(generation, result(ProbeOutcome::NoResponse));
        assert_eq!(h.detector.strategy_id(), StrategyId::FixedInterval);
        assert_eq!(h.detector.next_attempt_delay(), Duration::from_secs(15));
    }

    #[test]
    fn test_strategy_switch_rearms_pending_timer() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        h.complete(ProbeOutcome::NoResponse);
        let before = h.detector.generation();
        h.detector.take_commands();

        h.detector.set_strategy(StrategyId::FixedInterval);
        assert!(h.detector.generation() > before);
        assert_eq!(
            h.detector.take_commands(),
            vec![Command::ScheduleAttempt {
                generation: h.detector.generation(),
                delay: Duration::from_secs(15),
            }]
        );

        // The timer armed before the switch is now stale
        h.detector.on_attempt_timer_fired(before);
        assert!(h.detector.take_commands().is_empty());
    }

    #[test]
    fn test_retry_after_postpones_next_attempt() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        let generation = h.fire_timer();

        let mut busy = result(ProbeOutcome::NoResponse);
        busy.response_code = Some(503);
        busy.retry_after = Some(Duration::from_secs(90));
        h.detector.on_attempt_completed(generation, busy);

        assert_eq!(h.detector.next_attempt_delay(), Duration::from_secs(90));
    }

    #[test]
    fn test_huge_retry_after_is_clamped_to_max_backoff() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        let generation = h.fire_timer();

        let mut busy = result(ProbeOutcome::NoResponse);
        busy.response_code = Some(503);
        busy.retry_after = Some(Duration::from_secs(u64::from(u32::MAX)));
        h.detector.on_attempt_completed(generation, busy);

        let max_backoff = config().timings.max_backoff;
        assert_eq!(h.detector.next_attempt_delay(), max_backoff);
    }

    #[test]
    fn test_portal_hint_disagreeing_with_online_probe_backs_off() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector
            .on_network_changed(Some(NetworkIdentity::new("cafe", "cafe", "portal")));
        h.complete(ProbeOutcome::Online);
        h.complete(ProbeOutcome::Online);

        assert_eq!(h.detector.status("cafe"), CaptivePortalStatus::Online);
        assert_eq!(h.detector.next_attempt_delay(), Duration::from_secs(6));
        assert_eq!(h.metrics.count(metrics::MANAGER_PORTAL_BUT_ONLINE), 2);
    }

    #[test]
    fn test_portal_to_online_duration() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-B")));
        h.complete(ProbeOutcome::Portal);
        h.complete(ProbeOutcome::Portal);
        h.complete(ProbeOutcome::Online);

        // 3s and 6s backoff delays plus two 120ms probes
        let values = h.metrics.values(metrics::PORTAL_TO_ONLINE_MS);
        assert_eq!(values.len(), 1);
        assert!((values[0] - 9240.0).abs() < 1e-6, "got {}", values[0]);
    }

    #[test]
    fn test_proxy_change_reprobes_after_delay() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        h.complete(ProbeOutcome::Online);
        h.detector.take_commands();

        h.detector.on_proxy_changed();
        let commands = h.detector.take_commands();
        assert!(matches!(commands[0], Command::CancelAttempt { .. }));
        assert!(matches!(
            commands[1],
            Command::ScheduleAttempt { delay, .. } if delay == Duration::from_secs(1)
        ));
    }

    #[test]
    fn test_network_removed_drops_cache_entry() {
        let mut h = harness();
        h.detector.enable(true);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        h.complete(ProbeOutcome::Online);

        h.detector.on_network_removed("wifi-A");
        assert_eq!(h.detector.status("wifi-A"), CaptivePortalStatus::Unknown);
    }

    #[test]
    fn test_start_detection_if_idle() {
        let mut h = harness();
        h.detector.enable(false);
        h.detector.on_network_changed(Some(wifi("wifi-A")));
        // The network change itself starts detection once enabled
        assert!(!h.detector.start_detection_if_idle());

        h.detector.disable();
        h.detector.enable(false);
        assert_eq!(h.detector.state(), DetectionState::Idle);
        assert!(h.detector.start_detection_if_idle());
        assert_eq!(h.detector.state(), DetectionState::AttemptPending);
        assert_eq!(
            h.metrics.count(&metrics::transition(
                DetectionState::Idle,
                DetectionState::AttemptPending
            )),
            2
        );
    }
}
