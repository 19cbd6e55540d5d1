//! Default network discovery and change notification
//!
//! NetworkManager is queried through `nmcli` terse output. Its device and
//! connectivity states are folded into the connection-state labels the
//! detector understands.

use crate::error::{DetectorError, Result};
use crate::models::NetworkIdentity;
use crate::service::DetectorHandle;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::process::Command;

/// Something that can tell which network is the default right now
#[async_trait]
pub trait NetworkSource: Send + Sync {
    async fn default_network(&self) -> Result<Option<NetworkIdentity>>;

    /// Ids of every network the system still knows about, `None` if the source can't tell
    async fn known_networks(&self) -> Result<Option<HashSet<String>>> {
        Ok(None)
    }

    /// Opaque rendering of the proxy settings in effect for `network_id`
    async fn proxy_settings(&self, _network_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// One row of `nmcli -t -f NAME,UUID,TYPE,DEVICE,STATE connection show --active`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
    pub name: String,
    pub uuid: String,
    pub kind: String,
    pub device: String,
    pub state: String,
}

pub struct NmcliSource;

impl NmcliSource {
    async fn run(args: &[&str]) -> Result<String> {
        let output = Command::new("nmcli").args(args).output().await?;
        if !output.status.success() {
            return Err(DetectorError::NetworkQuery(format!(
                "nmcli {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl NetworkSource for NmcliSource {
    async fn default_network(&self) -> Result<Option<NetworkIdentity>> {
        let active = Self::run(&[
            "-t",
            "-f",
            "NAME,UUID,TYPE,DEVICE,STATE",
            "connection",
            "show",
            "--active",
        ])
        .await?;

        let connections = parse_active_connections(&active);
        let Some(connection) = pick_default(&connections) else {
            return Ok(None);
        };

        let connectivity = Self::run(&["-t", "-f", "CONNECTIVITY", "general"]).await?;
        let label = connection_label(&connection.state, connectivity.trim());

        Ok(Some(NetworkIdentity::new(
            connection.name.clone(),
            connection.uuid.clone(),
            label,
        )))
    }

    async fn known_networks(&self) -> Result<Option<HashSet<String>>> {
        let profiles = Self::run(&["-t", "-f", "UUID", "connection", "show"]).await?;
        Ok(Some(parse_uuids(&profiles)))
    }

    async fn proxy_settings(&self, network_id: &str) -> Result<Option<String>> {
        let proxy = Self::run(&["-t", "-f", "proxy", "connection", "show", network_id]).await?;
        Ok(Some(proxy.trim().to_string()))
    }
}

pub fn parse_uuids(output: &str) -> HashSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split one line of nmcli terse output, honouring `\:` and `\\` escapes
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

pub fn parse_active_connections(output: &str) -> Vec<ActiveConnection> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = split_terse(line).into_iter();
            Some(ActiveConnection {
                name: fields.next()?,
                uuid: fields.next()?,
                kind: fields.next()?,
                device: fields.next()?,
                state: fields.next()?,
            })
        })
        .collect()
}

/// nmcli lists the default connection first; skip interfaces that never carry it
pub fn pick_default(connections: &[ActiveConnection]) -> Option<&ActiveConnection> {
    connections
        .iter()
        .find(|c| !matches!(c.kind.as_str(), "loopback" | "bridge" | "tun") && c.device != "lo")
}

/// Fold NetworkManager's connection state and connectivity into one label
pub fn connection_label(nm_state: &str, connectivity: &str) -> &'static str {
    match (nm_state, connectivity) {
        ("activated", "full") => "online",
        ("activated", "portal") => "portal",
        ("activated", _) => "ready",
        ("activating", _) => "configuration",
        ("deactivating", _) => "disconnect",
        _ => "idle",
    }
}

/// What the watcher saw on its previous poll
#[derive(Default)]
struct Watcher {
    default: Option<Option<NetworkIdentity>>,
    known: Option<HashSet<String>>,
    proxy: Option<(String, String)>,
}

impl Watcher {
    async fn poll<S: NetworkSource>(&mut self, source: &S, handle: &DetectorHandle) -> Result<()> {
        match source.default_network().await {
            Ok(current) => {
                if self.default.as_ref() != Some(&current) {
                    match &current {
                        Some(n) => tracing::debug!("Default network: {} [{}]", n.name, n.connection_state),
                        None => tracing::debug!("No default network"),
                    }
                    handle.network_changed(current.clone())?;
                    self.default = Some(current);
                }
            }
            Err(e) => tracing::warn!("Failed to query default network: {}", e),
        }

        match source.known_networks().await {
            Ok(Some(current)) => {
                if let Some(previous) = &self.known {
                    for id in previous.difference(&current) {
                        tracing::debug!("Network {} was removed", id);
                        handle.network_removed(id.clone())?;
                    }
                }
                self.known = Some(current);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to list known networks: {}", e),
        }

        let Some(Some(network)) = &self.default else {
            self.proxy = None;
            return Ok(());
        };
        let network_id = network.id.clone();
        match source.proxy_settings(&network_id).await {
            Ok(Some(settings)) => {
                if let Some((id, previous)) = &self.proxy {
                    if *id == network_id && *previous != settings {
                        tracing::debug!("Proxy settings of {} changed", network_id);
                        handle.proxy_changed()?;
                    }
                }
                self.proxy = Some((network_id, settings));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read proxy settings: {}", e),
        }
        Ok(())
    }
}

/// Poll `source` and forward every change of the default network, removed
/// networks and proxy changes to the detector
pub async fn watch<S: NetworkSource>(source: S, handle: DetectorHandle, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut watcher = Watcher::default();

    loop {
        ticker.tick().await;
        watcher.poll(&source, &handle).await?;
    }
}
