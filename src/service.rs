//! Sequential driver for the detector
//!
//! The detector lives inside a single tokio task. Every call reaches it
//! through a [`DetectorHandle`] channel, so nothing ever touches its fields
//! concurrently and calls made from inside an observer are simply queued.

use crate::detector::{Command, ObserverId, PortalDetector, PortalObserver, ResultCache, StrategyId};
use crate::error::{DetectorError, Result};
use crate::models::{AttemptResult, CaptivePortalStatus, NetworkIdentity};
use crate::probe::ProbeClient;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};

enum Request {
    NetworkChanged(Option<NetworkIdentity>),
    NetworkRemoved(String),
    ProxyChanged,
    Enable(bool),
    Disable,
    SetStrategy(StrategyId),
    StartDetectionIfIdle(oneshot::Sender<bool>),
    AddObserver {
        observer: Arc<dyn PortalObserver>,
        notify_current: bool,
        reply: oneshot::Sender<ObserverId>,
    },
    RemoveObserver(ObserverId),
    Shutdown,
}

/// Cloneable entry point into a running detector
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::UnboundedSender<Request>,
    cache: ResultCache,
}

impl DetectorHandle {
    fn send(&self, request: Request) -> Result<()> {
        self.tx.send(request).map_err(|_| DetectorError::ServiceClosed)
    }

    pub fn network_changed(&self, network: Option<NetworkIdentity>) -> Result<()> {
        self.send(Request::NetworkChanged(network))
    }

    pub fn network_removed(&self, network_id: impl Into<String>) -> Result<()> {
        self.send(Request::NetworkRemoved(network_id.into()))
    }

    pub fn proxy_changed(&self) -> Result<()> {
        self.send(Request::ProxyChanged)
    }

    pub fn enable(&self, start_detection: bool) -> Result<()> {
        self.send(Request::Enable(start_detection))
    }

    pub fn disable(&self) -> Result<()> {
        self.send(Request::Disable)
    }

    pub fn set_strategy(&self, id: StrategyId) -> Result<()> {
        self.send(Request::SetStrategy(id))
    }

    pub async fn start_detection_if_idle(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::StartDetectionIfIdle(reply))?;
        rx.await.map_err(|_| DetectorError::ServiceClosed)
    }

    pub async fn add_observer(&self, observer: Arc<dyn PortalObserver>) -> Result<ObserverId> {
        self.register(observer, false).await
    }

    pub async fn add_and_notify_current(&self, observer: Arc<dyn PortalObserver>) -> Result<ObserverId> {
        self.register(observer, true).await
    }

    async fn register(&self, observer: Arc<dyn PortalObserver>, notify_current: bool) -> Result<ObserverId> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::AddObserver {
            observer,
            notify_current,
            reply,
        })?;
        rx.await.map_err(|_| DetectorError::ServiceClosed)
    }

    pub fn remove_observer(&self, id: ObserverId) -> Result<()> {
        self.send(Request::RemoveObserver(id))
    }

    /// Read straight from the shared cache, no round trip through the task
    pub fn status(&self, network_id: &str) -> CaptivePortalStatus {
        self.cache.get(network_id)
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown);
    }
}

/// Run `detector` on its own task
pub fn spawn(detector: PortalDetector, probe: Arc<dyn ProbeClient>) -> (DetectorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let handle = DetectorHandle {
        tx,
        cache: detector.cache().clone(),
    };

    let driver = Driver {
        detector,
        probe,
        requests: rx,
        results_tx,
        results_rx,
        attempt_timer: None,
        attempt_timeout: None,
        in_flight: None,
    };

    (handle, tokio::spawn(driver.run()))
}

type Timer = Option<(u64, Pin<Box<Sleep>>)>;

struct Driver {
    detector: PortalDetector,
    probe: Arc<dyn ProbeClient>,
    requests: mpsc::UnboundedReceiver<Request>,
    results_tx: mpsc::UnboundedSender<(u64, AttemptResult)>,
    results_rx: mpsc::UnboundedReceiver<(u64, AttemptResult)>,
    attempt_timer: Timer,
    attempt_timeout: Timer,
    in_flight: Option<(u64, JoinHandle<()>)>,
}

impl Driver {
    async fn run(mut self) {
        tracing::debug!("Detector task started");

        loop {
            self.apply_commands();

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle(request),
                },
                Some((generation, result)) = self.results_rx.recv() => {
                    self.finish_probe(generation);
                    self.detector.on_attempt_completed(generation, result);
                }
                generation = wait(&mut self.attempt_timer) => {
                    self.attempt_timer = None;
                    self.detector.on_attempt_timer_fired(generation);
                }
                generation = wait(&mut self.attempt_timeout) => {
                    self.attempt_timeout = None;
                    self.detector.on_attempt_timeout(generation);
                }
            }
        }

        self.detector.disable();
        self.apply_commands();
        tracing::debug!("Detector task stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::NetworkChanged(network) => self.detector.on_network_changed(network),
            Request::NetworkRemoved(id) => self.detector.on_network_removed(&id),
            Request::ProxyChanged => self.detector.on_proxy_changed(),
            Request::Enable(start) => self.detector.enable(start),
            Request::Disable => self.detector.disable(),
            Request::SetStrategy(id) => self.detector.set_strategy(id),
            Request::StartDetectionIfIdle(reply) => {
                let _ = reply.send(self.detector.start_detection_if_idle());
            }
            Request::AddObserver {
                observer,
                notify_current,
                reply,
            } => {
                let id = if notify_current {
                    self.detector.add_and_notify_current(observer)
                } else {
                    self.detector.add_observer(observer)
                };
                let _ = reply.send(id);
            }
            Request::RemoveObserver(id) => {
                self.detector.remove_observer(id);
            }
            Request::Shutdown => {}
        }
    }

    fn apply_commands(&mut self) {
        for command in self.detector.take_commands() {
            match command {
                Command::ScheduleAttempt { generation, delay } => {
                    self.attempt_timer = Some((generation, Box::pin(sleep(delay))));
                }
                Command::StartProbe {
                    generation,
                    url,
                    timeout,
                } => {
                    let probe = Arc::clone(&self.probe);
                    let results = self.results_tx.clone();
                    let task = tokio::spawn(async move {
                        let result = probe.probe(&url, timeout).await;
                        let _ = results.send((generation, result));
                    });
                    self.in_flight = Some((generation, task));
                    self.attempt_timeout = Some((generation, Box::pin(sleep(timeout))));
                }
                Command::CancelAttempt { generation } => self.cancel(generation),
            }
        }
    }

    fn cancel(&mut self, generation: u64) {
        if matches!(self.attempt_timer, Some((g, _)) if g == generation) {
            self.attempt_timer = None;
        }
        if matches!(self.attempt_timeout, Some((g, _)) if g == generation) {
            self.attempt_timeout = None;
        }
        if let Some((g, task)) = self.in_flight.take() {
            if g == generation {
                task.abort();
                tracing::debug!("Cancelled in-flight probe (generation {})", generation);
            } else {
                self.in_flight = Some((g, task));
            }
        }
    }

    fn finish_probe(&mut self, generation: u64) {
        if matches!(self.in_flight, Some((g, _)) if g == generation) {
            self.in_flight = None;
        }
        if matches!(self.attempt_timeout, Some((g, _)) if g == generation) {
            self.attempt_timeout = None;
        }
    }
}

async fn wait(timer: &mut Timer) -> u64 {
    match timer {
        Some((generation, sleep)) => {
            sleep.as_mut().await;
            *generation
        }
        None => std::future::pending().await,
    }
}
