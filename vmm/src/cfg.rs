//! The module containing the machine description consumed at VM creation.
//!
//! The control plane hands the core a JSON document describing the guest:
//! memory size and NUMA placement, core count and pinning, the paging
//! engine, and the device list with per-device parameter subtrees. Parsing
//! and validation happen entirely before a VM exists; a bad description is
//! a creation-time error and never surfaces at runtime.

use crate::error::{Result, VmmError};
use alloc::{string::String, vec::Vec};
use serde::Deserialize;

/// Which page-table engine the VM uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagingCfg {
    Shadow,
    Nested,
}

/// One NUMA-placed slice of guest memory.
#[derive(Debug, Clone, Deserialize)]
pub struct NumaRegion {
    pub size_mb: u64,
    pub node: u32,
}

/// Guest memory description.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    pub size_mb: u64,
    /// NUMA placement, consumed front to back. Memory beyond the listed
    /// regions may come from any node.
    #[serde(default)]
    pub regions: Vec<NumaRegion>,
    /// Base-block size override; testing knob, defaults to the compile-time
    /// block size.
    #[serde(default)]
    pub block_size: Option<u64>,
}

/// vCPU description.
#[derive(Debug, Clone, Deserialize)]
pub struct CoresConfig {
    pub count: u32,
    /// Physical CPU to pin each vCPU to; defaults to vcpu_id.
    #[serde(default)]
    pub pinning: Vec<u32>,
}

/// One device instantiation request.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// The factory name, e.g. "FW_CFG".
    pub class: String,
    /// The instance id, unique per VM.
    pub id: String,
    /// Opaque parameter subtree handed to the factory.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The full machine description.
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub memory: MemoryConfig,
    pub cores: CoresConfig,
    pub paging: PagingCfg,
    #[serde(default)]
    pub large_pages: bool,
    #[serde(default)]
    pub giant_pages: bool,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl VmConfig {
    #[must_use]
    pub fn mem_bytes(&self) -> u64 {
        self.memory.size_mb * 1024 * 1024
    }

    /// The NUMA node the block starting at `gpa` should come from.
    #[must_use]
    pub fn numa_node_of(&self, gpa: u64) -> Option<u32> {
        let mut iter = 0u64;
        for region in &self.memory.regions {
            let end = iter + region.size_mb * 1024 * 1024;
            if (iter..end).contains(&gpa) {
                return Some(region.node);
            }
            iter = end;
        }
        None
    }

    /// The physical CPU a vCPU is pinned to.
    #[must_use]
    pub fn pcpu_of(&self, vcpu_id: u32) -> u32 {
        self.cores
            .pinning
            .get(vcpu_id as usize)
            .copied()
            .unwrap_or(vcpu_id)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 128 {
            return Err(VmmError::Config("VM name length invalid"));
        }
        if self.memory.size_mb == 0 {
            return Err(VmmError::Config("guest memory size is zero"));
        }
        if self.cores.count == 0 || self.cores.count > 64 {
            return Err(VmmError::Config("core count out of range"));
        }
        if !self.cores.pinning.is_empty() && self.cores.pinning.len() != self.cores.count as usize
        {
            return Err(VmmError::Config("pinning list does not match core count"));
        }
        let numa_total: u64 = self.memory.regions.iter().map(|r| r.size_mb).sum();
        if numa_total > self.memory.size_mb {
            return Err(VmmError::Config("NUMA regions exceed guest memory"));
        }
        let mut ids: Vec<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.devices.len() {
            return Err(VmmError::Config("duplicate device ids"));
        }
        Ok(())
    }
}

/// Parses and validates a machine description.
pub fn parse_config(json: &str) -> Result<VmConfig> {
    let cfg: VmConfig = serde_json::from_str(json).map_err(|_| {
        VmmError::Config("machine description is not valid JSON")
    })?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        "name": "guest0",
        "memory": { "size_mb": 512, "regions": [ { "size_mb": 256, "node": 0 },
                                                 { "size_mb": 256, "node": 1 } ] },
        "cores": { "count": 2, "pinning": [0, 2] },
        "paging": "nested",
        "large_pages": true,
        "devices": [ { "class": "FW_CFG", "id": "fw_cfg" } ]
    }"#;

    #[test]
    fn parses_a_full_description() {
        let cfg = parse_config(EXAMPLE).unwrap();
        assert_eq!(cfg.name, "guest0");
        assert_eq!(cfg.mem_bytes(), 512 << 20);
        assert_eq!(cfg.paging, PagingCfg::Nested);
        assert_eq!(cfg.numa_node_of(0), Some(0));
        assert_eq!(cfg.numa_node_of(300 << 20), Some(1));
        assert_eq!(cfg.pcpu_of(1), 2);
        assert_eq!(cfg.devices.len(), 1);
    }

    #[test]
    fn rejects_zero_memory_and_bad_pinning() {
        let bad = r#"{"name":"g","memory":{"size_mb":0},
                      "cores":{"count":1},"paging":"shadow"}"#;
        assert!(parse_config(bad).is_err());

        let bad = r#"{"name":"g","memory":{"size_mb":64},
                      "cores":{"count":2,"pinning":[0]},"paging":"shadow"}"#;
        assert!(parse_config(bad).is_err());
    }

    #[test]
    fn rejects_duplicate_devices() {
        let bad = r#"{"name":"g","memory":{"size_mb":64},"cores":{"count":1},
                      "paging":"nested",
                      "devices":[{"class":"FW_CFG","id":"a"},
                                 {"class":"FW_CFG","id":"a"}]}"#;
        assert!(parse_config(bad).is_err());
    }
}
