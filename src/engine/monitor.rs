//! Fleet-wide reachability monitor.
//!
//! Every sweep interval the monitor loads all devices that have an address,
//! probes them concurrently and compares each result with the cached status.
//! Only transitions are published, on a broadcast channel of
//! [`DeviceStatusUpdate`].
//!
//! | Probe result | Status |
//! |--------------|--------|
//! | reachable | `online` |
//! | no reply / probe timed out | `offline` |
//! | probe could not run, or its task died | `error` |
//!
//! One device's failure never affects another's result. A failed sweep (the
//! inventory did not answer) is logged and retried after a short backoff.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::parse_address;
use super::config::MonitorSettings;
use super::error::EngineError;
use super::types::{DeviceId, DeviceStatus, DeviceStatusUpdate};

const EVENT_CAPACITY: usize = 1024;

/// A device as the inventory knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// Owning group (datacenter).
    #[serde(alias = "datacenter_id")]
    pub group: String,
    #[serde(default, alias = "ip_address")]
    pub address: Option<String>,
}

/// Source of devices to sweep.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Devices that have a non-empty address.
    async fn addressable_devices(&self) -> Result<Vec<DeviceRecord>, EngineError>;
}

/// Inventory held in memory, typically loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: Vec<DeviceRecord>,
}

impl StaticInventory {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { devices }
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let devices = serde_json::from_str(json)
            .map_err(|e| EngineError::Inventory(format!("bad inventory JSON: {}", e)))?;
        Ok(Self { devices })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Inventory(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn addressable_devices(&self) -> Result<Vec<DeviceRecord>, EngineError> {
        Ok(self
            .devices
            .iter()
            .filter(|d| d.address.as_deref().is_some_and(|a| !a.trim().is_empty()))
            .cloned()
            .collect())
    }
}

/// Single reachability check against one address.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// `Ok(true)` if reachable, `Ok(false)` if not, `Err` if the check
    /// itself could not be performed.
    async fn probe(&self, address: &str, timeout: Duration) -> Result<bool, EngineError>;
}

/// One ICMP echo via the system `ping`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingProber;

fn probe_host(address: &str) -> String {
    parse_address(address)
        .map(|(host, _)| host)
        .unwrap_or_else(|_| address.to_string())
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<bool, EngineError> {
        let host = probe_host(address);
        let wait_secs = timeout.as_secs().max(1);

        let mut child = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W"])
            .arg(wait_secs.to_string())
            .arg(&host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Probe(format!("cannot run ping: {}", e)))?;

        // ping enforces -W itself; the outer bound only guards a stuck process.
        match tokio::time::timeout(timeout + Duration::from_secs(1), child.wait()).await {
            Ok(Ok(status)) => Ok(status.success()),
            Ok(Err(e)) => Err(EngineError::Probe(format!("ping failed: {}", e))),
            Err(_) => {
                debug!("ping {} exceeded {:?}", host, timeout);
                Ok(false)
            }
        }
    }
}

/// Cached reachability of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMonitorState {
    pub device: DeviceId,
    pub last_status: DeviceStatus,
    pub last_checked_at: DateTime<Utc>,
}

pub struct ReachabilityMonitor<P: Prober = PingProber> {
    inventory: Arc<dyn Inventory>,
    prober: Arc<P>,
    settings: MonitorSettings,
    cache: DashMap<DeviceId, DeviceMonitorState>,
    events: broadcast::Sender<DeviceStatusUpdate>,
}

impl<P: Prober> ReachabilityMonitor<P> {
    pub fn new(inventory: Arc<dyn Inventory>, prober: P, settings: MonitorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inventory,
            prober: Arc::new(prober),
            settings,
            cache: DashMap::new(),
            events,
        }
    }

    /// Receive every status transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceStatusUpdate> {
        self.events.subscribe()
    }

    /// Cached status without probing; `Unknown` until the first sweep.
    pub fn status_of(&self, device: &str) -> DeviceStatus {
        self.cache
            .get(device)
            .map(|s| s.last_status)
            .unwrap_or_default()
    }

    pub fn state_of(&self, device: &str) -> Option<DeviceMonitorState> {
        self.cache.get(device).map(|s| s.clone())
    }

    /// Probe every addressable device once and publish transitions.
    pub async fn sweep_once(&self) -> Result<Vec<DeviceStatusUpdate>, EngineError> {
        let devices = self.inventory.addressable_devices().await?;
        if devices.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Sweeping {} device(s)", devices.len());

        let probes = devices.iter().map(|device| {
            let prober = self.prober.clone();
            let address = device.address.clone().unwrap_or_default();
            let timeout = self.settings.probe_timeout;
            tokio::spawn(async move { prober.probe(&address, timeout).await })
        });
        let results = join_all(probes).await;

        let mut updates = Vec::new();
        for (device, result) in devices.iter().zip(results) {
            let status = match result {
                Ok(Ok(true)) => DeviceStatus::Online,
                Ok(Ok(false)) => DeviceStatus::Offline,
                Ok(Err(e)) => {
                    warn!("Probe of {} failed: {}", device.id, e);
                    DeviceStatus::Error
                }
                Err(e) => {
                    error!("Probe task for {} died: {}", device.id, e);
                    DeviceStatus::Error
                }
            };
            if let Some(update) = self.record(device, status) {
                updates.push(update);
            }
        }

        for update in &updates {
            // No subscribers is fine.
            let _ = self.events.send(update.clone());
        }
        Ok(updates)
    }

    fn record(&self, device: &DeviceRecord, status: DeviceStatus) -> Option<DeviceStatusUpdate> {
        let now = Utc::now();
        let previous = self.cache.insert(
            device.id.clone(),
            DeviceMonitorState {
                device: device.id.clone(),
                last_status: status,
                last_checked_at: now,
            },
        );
        let previous = previous.map(|s| s.last_status).unwrap_or_default();
        if previous == status {
            return None;
        }

        info!("Device {} status {} -> {}", device.id, previous, status);
        Some(DeviceStatusUpdate {
            device: device.id.clone(),
            group: device.group.clone(),
            status,
            timestamp: now.to_rfc3339(),
        })
    }

    /// Sweep until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Reachability monitor started (every {:?})",
            self.settings.sweep_interval
        );
        loop {
            let wait = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.sweep_once() => match result {
                    Ok(_) => self.settings.sweep_interval,
                    Err(e) => {
                        error!("Sweep failed: {}", e);
                        self.settings.failure_backoff
                    }
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Reachability monitor stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    }
}
