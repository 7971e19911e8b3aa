//! Persisted state: service trees and bond records
//!
//! One JSON file per peripheral, keyed by hex-formatted address. Service
//! cache entries expire after 30 days; bond records never expire on their
//! own and are removed only by an unpair request.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use bleproxy_core::types::{DeviceAddress, GattService};

use crate::error::BleError;

/// Service cache entry lifetime in seconds
const CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// Service Cache
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CachedServices {
    created_unix: u64,
    services: Vec<GattService>,
}

/// On-disk cache of discovered service trees
pub struct ServiceCache {
    dir: PathBuf,
}

impl ServiceCache {
    pub fn open(dir: PathBuf) -> Result<Self, BleError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, address: &DeviceAddress) -> PathBuf {
        self.dir.join(format!("{}.json", address.hex_key()))
    }

    /// Load a fresh entry; expired or unreadable entries are treated as absent
    pub fn load(&self, address: &DeviceAddress) -> Option<Vec<GattService>> {
        let path = self.path_for(address);
        let raw = fs::read(&path).ok()?;
        let entry: CachedServices = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%address, error = %e, "discarding unreadable cache entry");
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        if unix_now().saturating_sub(entry.created_unix) > CACHE_TTL_SECS {
            debug!(%address, "cache entry expired");
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(entry.services)
    }

    pub fn store(
        &self,
        address: &DeviceAddress,
        services: &[GattService],
    ) -> Result<(), BleError> {
        let entry = CachedServices {
            created_unix: unix_now(),
            services: services.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&entry)
            .map_err(|e| BleError::OperationFailed(e.to_string()))?;
        fs::write(self.path_for(address), data)?;
        Ok(())
    }

    /// Remove the entry. Returns whether one existed.
    pub fn clear(&self, address: &DeviceAddress) -> Result<bool, BleError> {
        let path = self.path_for(address);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ----------------------------------------------------------------------------
// Bond Store
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct BondRecord {
    created_unix: u64,
}

/// Persisted pairing records
pub struct BondStore {
    dir: PathBuf,
}

impl BondStore {
    pub fn open(dir: PathBuf) -> Result<Self, BleError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, address: &DeviceAddress) -> PathBuf {
        self.dir.join(format!("{}.json", address.hex_key()))
    }

    pub fn record(&self, address: &DeviceAddress) -> Result<(), BleError> {
        let record = BondRecord {
            created_unix: unix_now(),
        };
        let data = serde_json::to_vec(&record)
            .map_err(|e| BleError::OperationFailed(e.to_string()))?;
        fs::write(self.path_for(address), data)?;
        Ok(())
    }

    pub fn remove(&self, address: &DeviceAddress) -> Result<bool, BleError> {
        let path = self.path_for(address);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.path_for(address).exists()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
