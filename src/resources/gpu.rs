use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

/// One record from the host GPU inventory probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub id: String,
    #[serde(default)]
    pub render_node_path: String,
    #[serde(default)]
    pub vram_mb: u64,
    #[serde(default)]
    pub name: String,
}

/// Process-wide pool arbitrating exclusive access to physical GPUs.
///
/// The resource identifier is vendor-specific: the stable device ID for
/// Nvidia, the render-node path for Amd. A single lock instance supports
/// exactly one vendor; heterogeneous inventories are rejected at
/// construction.
pub struct GpuLock {
    vendor: Option<GpuVendor>,
    devices: Mutex<HashMap<String, bool>>,
}

impl GpuLock {
    pub fn new(inventory: &[GpuInfo]) -> Result<Self> {
        let mut vendor = None;
        let mut devices = HashMap::new();
        for gpu in inventory {
            match vendor {
                None => vendor = Some(gpu.vendor),
                Some(v) if v != gpu.vendor => {
                    return Err(Error::Internal(format!(
                        "heterogeneous gpu inventory: found both {:?} and {:?}",
                        v, gpu.vendor
                    )));
                }
                Some(_) => {}
            }
            let resource_id = match gpu.vendor {
                GpuVendor::Nvidia => gpu.id.clone(),
                GpuVendor::Amd => gpu.render_node_path.clone(),
            };
            devices.insert(resource_id, false);
        }
        Ok(GpuLock {
            vendor,
            devices: Mutex::new(devices),
        })
    }

    pub fn vendor(&self) -> Option<GpuVendor> {
        self.vendor
    }

    /// Reserves `count` currently-free resources. `count == -1` reserves all
    /// free resources and always succeeds, even with an empty result on a
    /// GPU-less host. On `NoCapacity` nothing is mutated.
    pub async fn acquire(&self, count: i64) -> Result<Vec<String>> {
        let mut devices = self.devices.lock().await;
        let mut free: Vec<String> = devices
            .iter()
            .filter(|(_, locked)| !**locked)
            .map(|(id, _)| id.clone())
            .collect();
        free.sort();

        let take = match count {
            -1 => free.len(),
            n if n > 0 => {
                let n = n as usize;
                if n > free.len() {
                    return Err(Error::NoCapacity {
                        requested: n,
                        available: free.len(),
                    });
                }
                n
            }
            _ => {
                return Err(Error::Request(format!(
                    "gpu count must be positive or -1, got {count}"
                )));
            }
        };

        let acquired: Vec<String> = free.drain(..take).collect();
        for id in &acquired {
            devices.insert(id.clone(), true);
        }
        Ok(acquired)
    }

    /// Locks the explicitly named resources, used when the control plane
    /// dictates exact device assignment. Unknown or already-locked ids are
    /// skipped; the returned set is the subset actually transitioned.
    pub async fn lock(&self, ids: &[String]) -> Vec<String> {
        let mut devices = self.devices.lock().await;
        let mut locked = Vec::new();
        for id in ids {
            match devices.get_mut(id) {
                None => warn!(gpu = %id, "lock skipped unknown gpu"),
                Some(true) => {}
                Some(flag) => {
                    *flag = true;
                    locked.push(id.clone());
                }
            }
        }
        locked
    }

    /// Idempotent release. Unknown ids are logged and skipped,
    /// already-unlocked ids are skipped.
    pub async fn release(&self, ids: &[String]) -> Vec<String> {
        let mut devices = self.devices.lock().await;
        let mut released = Vec::new();
        for id in ids {
            match devices.get_mut(id) {
                None => warn!(gpu = %id, "release skipped unknown gpu"),
                Some(false) => {}
                Some(flag) => {
                    *flag = false;
                    released.push(id.clone());
                }
            }
        }
        released
    }

    pub async fn available(&self) -> usize {
        self.devices
            .lock()
            .await
            .values()
            .filter(|locked| !**locked)
            .count()
    }
}
