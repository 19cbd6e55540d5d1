//! Per-network cache of the last detection result
//!
//! Writes only happen on the detector's own task. Readers on other threads get
//! copies, never references into the map.

use crate::models::{CaptivePortalState, CaptivePortalStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    inner: Arc<RwLock<HashMap<String, CaptivePortalState>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, network_id: &str, state: CaptivePortalState) {
        self.inner.write().insert(network_id.to_string(), state);
    }

    /// Status for a network, `Unknown` if it was never probed
    pub fn get(&self, network_id: &str) -> CaptivePortalStatus {
        self.state(network_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn state(&self, network_id: &str) -> Option<CaptivePortalState> {
        self.inner.read().get(network_id).copied()
    }

    /// Drop the entry of a network that disappeared from the system
    pub fn remove(&self, network_id: &str) -> Option<CaptivePortalState> {
        self.inner.write().remove(network_id)
    }

    pub fn snapshot(&self) -> HashMap<String, CaptivePortalState> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
