//! IPv4 address management.
//!
//! Each subnet owns a bitmap where bit `i` marks host `network + i + 1` as
//! taken. The whole map is rewritten to disk after every change so that
//! separate runtime invocations see the same allocations. A change is only
//! kept in memory once it has been written.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use capsule_common::error::{CapsuleError, Result};
use serde::{Deserialize, Serialize};

use super::Subnet;

/// Fixed-size allocation bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bitmap {
    bits: Vec<u64>,
}

impl Bitmap {
    const fn word(index: u32) -> (usize, u64) {
        ((index / 64) as usize, 1_u64 << (index % 64))
    }

    /// Marks `index` as taken.
    pub fn set(&mut self, index: u32) {
        let (word, mask) = Self::word(index);
        if self.bits.len() <= word {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= mask;
    }

    /// Marks `index` as free.
    pub fn clear(&mut self, index: u32) {
        let (word, mask) = Self::word(index);
        if let Some(bits) = self.bits.get_mut(word) {
            *bits &= !mask;
        }
    }

    /// Returns whether `index` is taken.
    #[must_use]
    pub fn test(&self, index: u32) -> bool {
        let (word, mask) = Self::word(index);
        self.bits.get(word).is_some_and(|bits| bits & mask != 0)
    }

    /// Lowest free index below `limit`.
    #[must_use]
    pub fn next_clear(&self, limit: u32) -> Option<u32> {
        (0..limit).find(|&i| !self.test(i))
    }

    /// Number of taken indices.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }
}

/// Subnet allocator persisted as one JSON file keyed by CIDR.
#[derive(Debug)]
pub struct Ipam {
    path: PathBuf,
    subnets: Mutex<BTreeMap<String, Bitmap>>,
}

impl Ipam {
    /// Loads the allocator state from `path`. A missing file is an empty
    /// map.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read or `Serialization` if it is
    /// malformed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let subnets = match std::fs::read_to_string(&path) {
            Ok(data) if data.trim().is_empty() => BTreeMap::new(),
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(CapsuleError::io(&path, e)),
        };
        Ok(Self {
            path,
            subnets: Mutex::new(subnets),
        })
    }

    /// Location of the persisted map.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Bitmap>>> {
        self.subnets.lock().map_err(|_| CapsuleError::Ipam {
            message: "allocator lock poisoned".into(),
        })
    }

    fn persist(&self, subnets: &BTreeMap<String, Bitmap>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CapsuleError::io(parent, e))?;
        }
        let json = serde_json::to_string(subnets)?;
        std::fs::write(&self.path, json).map_err(|e| CapsuleError::io(&self.path, e))
    }

    /// Takes the lowest free host address of `subnet`.
    ///
    /// # Errors
    ///
    /// Returns `Ipam` when the subnet is exhausted, or `Io` if the map
    /// cannot be written.
    pub fn allocate(&self, subnet: &Subnet) -> Result<Ipv4Addr> {
        let mut subnets = self.lock()?;
        let mut updated = subnets.clone();
        let bitmap = updated.entry(subnet.to_string()).or_default();
        let index = bitmap
            .next_clear(subnet.host_capacity())
            .ok_or_else(|| CapsuleError::Ipam {
                message: format!("no free address left in {subnet}"),
            })?;
        let ip = subnet.nth_host(index).ok_or_else(|| CapsuleError::Ipam {
            message: format!("index {index} outside {subnet}"),
        })?;
        bitmap.set(index);
        self.persist(&updated)?;
        *subnets = updated;
        tracing::debug!(%subnet, %ip, "address allocated");
        Ok(ip)
    }

    /// Returns `ip` to the pool of `subnet`.
    ///
    /// # Errors
    ///
    /// Returns `Ipam` if the subnet is unknown or `ip` is not one of its
    /// hosts, or `Io` if the map cannot be written.
    pub fn release(&self, subnet: &Subnet, ip: Ipv4Addr) -> Result<()> {
        let mut subnets = self.lock()?;
        let mut updated = subnets.clone();
        let index = subnet.host_index(ip).ok_or_else(|| CapsuleError::Ipam {
            message: format!("{ip} is not a host address of {subnet}"),
        })?;
        let bitmap = updated
            .get_mut(&subnet.to_string())
            .ok_or_else(|| CapsuleError::Ipam {
                message: format!("subnet {subnet} has no allocations"),
            })?;
        bitmap.clear(index);
        self.persist(&updated)?;
        *subnets = updated;
        tracing::debug!(%subnet, %ip, "address released");
        Ok(())
    }

    /// Number of addresses still free in `subnet`.
    ///
    /// # Errors
    ///
    /// Returns `Ipam` if the allocator lock is poisoned.
    pub fn allocatable(&self, subnet: &Subnet) -> Result<u32> {
        let subnets = self.lock()?;
        let used = subnets
            .get(&subnet.to_string())
            .map_or(0, Bitmap::count);
        Ok(subnet.host_capacity().saturating_sub(used))
    }
}
