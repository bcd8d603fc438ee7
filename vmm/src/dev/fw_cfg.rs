//! The fw-cfg paravirtual configuration device.
//!
//! A selector/data port pair through which early guest firmware pulls named
//! configuration blobs: RAM size, CPU counts, boot options, the NUMA map
//! and the E820 table. Writing a key to the selector port rewinds the
//! entry; byte reads from the data port then stream it out.

use super::DeviceOps;
use crate::{
    cfg::DeviceConfig,
    cpu::Vcpu,
    error::{Result, VmmError},
    io::IoHandler,
    vm::Vm,
};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use log::trace;
use spin::Mutex;

pub const FW_CFG_CTL_PORT: u16 = 0x510;
pub const FW_CFG_DATA_PORT: u16 = 0x511;

const FW_CFG_SIGNATURE: u16 = 0x00;
const FW_CFG_ID: u16 = 0x01;
const FW_CFG_RAM_SIZE: u16 = 0x03;
const FW_CFG_NB_CPUS: u16 = 0x05;
const FW_CFG_NUMA: u16 = 0x0d;
const FW_CFG_BOOT_MENU: u16 = 0x0e;
const FW_CFG_MAX_CPUS: u16 = 0x0f;

const FW_CFG_WRITE_CHANNEL: u16 = 0x4000;
const FW_CFG_ARCH_LOCAL: u16 = 0x8000;
const FW_CFG_ENTRY_MASK: u16 = !(FW_CFG_WRITE_CHANNEL | FW_CFG_ARCH_LOCAL);

const FW_CFG_E820_TABLE: u16 = FW_CFG_ARCH_LOCAL + 3;

const E820_TYPE_FREE: u32 = 1;

struct FwCfgState {
    cur_key: u16,
    cur_offset: usize,
    /// Entry tables, indexed by the arch-local flag.
    entries: [BTreeMap<u16, Vec<u8>>; 2],
}

impl FwCfgState {
    fn add_bytes(&mut self, key: u16, data: Vec<u8>) {
        let arch = usize::from(key & FW_CFG_ARCH_LOCAL != 0);
        let _ = self.entries[arch].insert(key & FW_CFG_ENTRY_MASK, data);
    }

    fn add_u16(&mut self, key: u16, value: u16) {
        self.add_bytes(key, value.to_le_bytes().to_vec());
    }

    fn add_u64(&mut self, key: u16, value: u64) {
        self.add_bytes(key, value.to_le_bytes().to_vec());
    }

    fn select(&mut self, key: u16) {
        self.cur_key = key;
        self.cur_offset = 0;
    }

    fn read_byte(&mut self) -> u8 {
        let arch = usize::from(self.cur_key & FW_CFG_ARCH_LOCAL != 0);
        let entry = self.entries[arch].get(&(self.cur_key & FW_CFG_ENTRY_MASK));
        let byte = entry
            .and_then(|data| data.get(self.cur_offset))
            .copied()
            .unwrap_or(0);
        self.cur_offset += 1;
        byte
    }
}

/// The fw-cfg device instance.
pub struct FwCfg {
    id: String,
    state: Mutex<FwCfgState>,
}

/// Builds the device and hooks its two ports.
pub fn create(vm: &Vm, cfg: &DeviceConfig) -> Result<Arc<dyn DeviceOps>> {
    let boot_menu = cfg
        .params
        .get("boot_menu")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let mut state = FwCfgState {
        cur_key: 0,
        cur_offset: 0,
        entries: [BTreeMap::new(), BTreeMap::new()],
    };

    let mem_size = vm.mem_map().read().mem_size();
    let cores = vm.num_cores();

    state.add_bytes(FW_CFG_SIGNATURE, b"QEMU".to_vec());
    state.add_bytes(FW_CFG_ID, 1u32.to_le_bytes().to_vec());
    state.add_u64(FW_CFG_RAM_SIZE, mem_size);
    state.add_u16(FW_CFG_NB_CPUS, cores as u16);
    state.add_u16(FW_CFG_MAX_CPUS, cores as u16);
    state.add_u16(FW_CFG_BOOT_MENU, u16::from(boot_menu));

    // NUMA map: node count, then a node id per core, then per-node sizes.
    // Without explicit placement everything lands on node 0.
    let mut numa = Vec::new();
    numa.extend_from_slice(&1u64.to_le_bytes());
    for _ in 0..cores {
        numa.extend_from_slice(&0u64.to_le_bytes());
    }
    numa.extend_from_slice(&mem_size.to_le_bytes());
    state.add_bytes(FW_CFG_NUMA, numa);

    // E820: one free range covering guest memory.
    let mut e820 = Vec::new();
    e820.extend_from_slice(&1u32.to_le_bytes());
    e820.extend_from_slice(&0u64.to_le_bytes());
    e820.extend_from_slice(&mem_size.to_le_bytes());
    e820.extend_from_slice(&E820_TYPE_FREE.to_le_bytes());
    state.add_bytes(FW_CFG_E820_TABLE, e820);

    let dev = Arc::new(FwCfg {
        id: String::from(cfg.id.as_str()),
        state: Mutex::new(state),
    });

    vm.io_map().hook(FW_CFG_CTL_PORT, dev.clone())?;
    vm.io_map().hook(FW_CFG_DATA_PORT, dev.clone())?;
    Ok(dev)
}

impl IoHandler for FwCfg {
    fn io_read(&self, _vm: &Vm, _core: &mut Vcpu, port: u16, data: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        match port {
            // Reading the selector is allowed and returns the key.
            FW_CFG_CTL_PORT => {
                let key = state.cur_key.to_le_bytes();
                let len = data.len().min(2);
                data[..len].copy_from_slice(&key[..len]);
            }
            FW_CFG_DATA_PORT => {
                for byte in data.iter_mut() {
                    *byte = state.read_byte();
                }
            }
            _ => return Err(VmmError::Device("fw_cfg bound to unexpected port")),
        }
        Ok(())
    }

    fn io_write(&self, _vm: &Vm, _core: &mut Vcpu, port: u16, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        match port {
            FW_CFG_CTL_PORT => {
                let mut raw = [0u8; 2];
                let len = data.len().min(2);
                raw[..len].copy_from_slice(&data[..len]);
                let key = u16::from_le_bytes(raw);
                trace!("fw_cfg: selected key {key:#x}");
                state.select(key);
            }
            FW_CFG_DATA_PORT => {
                // The write channel is not implemented; firmware that
                // probes it reads back zeros.
                trace!("fw_cfg: ignoring data write");
            }
            _ => return Err(VmmError::Device("fw_cfg bound to unexpected port")),
        }
        Ok(())
    }
}

impl DeviceOps for FwCfg {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::DeviceConfig;
    use crate::io::handle_io_exit;
    use crate::vm::testing::nested_test_vm;

    fn attach(vm: &Vm) {
        let cfg = DeviceConfig {
            class: String::from("FW_CFG"),
            id: String::from("fw_cfg"),
            params: serde_json::Value::Null,
        };
        vm.dev_mgr().create_device(vm, &cfg).unwrap();
    }

    fn io_out16(port: u16) -> u64 {
        (u64::from(port) << 16) | (1 << 5)
    }

    fn io_in8(port: u16) -> u64 {
        (u64::from(port) << 16) | 1 | (1 << 4)
    }

    #[test]
    fn signature_streams_through_data_port() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        attach(&vm);

        // Select key 0 (signature) and read four bytes.
        core.regs.rax = u64::from(FW_CFG_SIGNATURE);
        handle_io_exit(&vm, &mut core, io_out16(FW_CFG_CTL_PORT), 0).unwrap();

        let mut sig = [0u8; 4];
        for b in &mut sig {
            handle_io_exit(&vm, &mut core, io_in8(FW_CFG_DATA_PORT), 0).unwrap();
            *b = core.regs.rax as u8;
        }
        assert_eq!(&sig, b"QEMU");
    }

    #[test]
    fn ram_size_matches_memory_map() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        attach(&vm);

        core.regs.rax = u64::from(FW_CFG_RAM_SIZE);
        handle_io_exit(&vm, &mut core, io_out16(FW_CFG_CTL_PORT), 0).unwrap();

        let mut raw = [0u8; 8];
        for b in &mut raw {
            handle_io_exit(&vm, &mut core, io_in8(FW_CFG_DATA_PORT), 0).unwrap();
            *b = core.regs.rax as u8;
        }
        assert_eq!(u64::from_le_bytes(raw), vm.mem_map().read().mem_size());
    }

    #[test]
    fn unselected_entries_read_zero() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x10000);
        attach(&vm);

        core.regs.rax = 0x7f; // nonexistent key
        handle_io_exit(&vm, &mut core, io_out16(FW_CFG_CTL_PORT), 0).unwrap();
        handle_io_exit(&vm, &mut core, io_in8(FW_CFG_DATA_PORT), 0).unwrap();
        assert_eq!(core.regs.rax & 0xff, 0);
    }
}
