//! Observer fan-out for completed detections

use crate::models::{CaptivePortalState, CaptivePortalStatus, NetworkIdentity};
use std::sync::Arc;

/// Receives the state of the default network after every detection attempt
///
/// Notifications are delivered on every attempt, including repeats of the
/// same status, so an observer can tell the detection loop is alive.
pub trait PortalObserver: Send + Sync {
    /// `network` is `None` when there is no default network
    fn on_portal_detection_completed(
        &self,
        network: Option<&NetworkIdentity>,
        state: &CaptivePortalState,
    );
}

impl<F> PortalObserver for F
where
    F: Fn(Option<&NetworkIdentity>, &CaptivePortalState) + Send + Sync,
{
    fn on_portal_detection_completed(
        &self,
        network: Option<&NetworkIdentity>,
        state: &CaptivePortalState,
    ) {
        self(network, state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registered observers, notified in insertion order
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<(ObserverId, Arc<dyn PortalObserver>)>,
    next_id: u64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Arc<dyn PortalObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        tracing::debug!("Registered observer {:?} ({} total)", id, self.observers.len());
        id
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        before != self.observers.len()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&self, network: Option<&NetworkIdentity>, state: &CaptivePortalState) {
        // Iterate a snapshot so observers touching the registry cannot skip or repeat a peer
        let snapshot: Vec<Arc<dyn PortalObserver>> = self
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in snapshot {
            observer.on_portal_detection_completed(network, state);
        }
    }
}

/// Logs every completed detection, louder when a portal is in the way
pub struct LogObserver;

impl PortalObserver for LogObserver {
    fn on_portal_detection_completed(
        &self,
        network: Option<&NetworkIdentity>,
        state: &CaptivePortalState,
    ) {
        let Some(network) = network else {
            tracing::info!("No default network ({})", state.status);
            return;
        };

        match state.status {
            CaptivePortalStatus::Portal | CaptivePortalStatus::ProxyAuthRequired => {
                tracing::warn!(
                    "'{}' is behind a captive portal: {} (http {:?})",
                    network.name,
                    state.status,
                    state.response_code
                );
            }
            status => {
                tracing::info!("'{}' -> {}", network.name, status);
            }
        }
    }
}
