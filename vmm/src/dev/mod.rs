//! The module containing the device manager.
//!
//! Device models are plug-ins: a registry maps class names to factories,
//! and instantiation consumes one entry of the machine description's device
//! list. A factory wires its instance into the VM through the hook maps
//! (IO ports, MSRs, memory regions) and hands back a [`DeviceOps`] object
//! for lifecycle management. The hook maps are append-only while the VM is
//! stopped; devices are never attached to a running machine.

pub mod fw_cfg;

use crate::{
    cfg::DeviceConfig,
    error::{Result, VmmError},
    vm::Vm,
};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use log::info;
use spin::Mutex;

/// Lifecycle interface of an instantiated device.
pub trait DeviceOps: Send + Sync {
    /// The instance id from the machine description.
    fn id(&self) -> &str;

    /// Contributes the device's state to a checkpoint.
    fn save(&self, vm: &Vm, buf: &mut Vec<u8>) -> Result<()> {
        let _ = (vm, buf);
        Ok(())
    }

    /// Restores the device's state from a checkpoint record.
    fn load(&self, vm: &Vm, buf: &[u8]) -> Result<()> {
        let _ = (vm, buf);
        Ok(())
    }

    /// Releases device resources at VM teardown.
    fn free(&self, vm: &Vm) {
        let _ = vm;
    }
}

/// Creates one device instance and registers its hooks on the VM.
pub type DeviceFactory = fn(&Vm, &DeviceConfig) -> Result<Arc<dyn DeviceOps>>;

/// The per-VM device registry.
pub struct DevMgr {
    factories: BTreeMap<String, DeviceFactory>,
    devices: Mutex<Vec<Arc<dyn DeviceOps>>>,
}

impl DevMgr {
    pub(crate) fn new() -> Self {
        let mut mgr = Self {
            factories: BTreeMap::new(),
            devices: Mutex::new(Vec::new()),
        };
        mgr.register_factory("FW_CFG", fw_cfg::create);
        mgr
    }

    /// Adds a device class. Embedders may extend the registry before any
    /// device is created.
    pub fn register_factory(&mut self, class: &str, factory: DeviceFactory) {
        let _ = self.factories.insert(String::from(class), factory);
    }

    /// Instantiates one device from its description.
    pub fn create_device(&self, vm: &Vm, cfg: &DeviceConfig) -> Result<()> {
        let factory = self
            .factories
            .get(cfg.class.as_str())
            .ok_or(VmmError::Config("unknown device class"))?;
        let dev = factory(vm, cfg)?;
        info!("attached device {} (class {})", cfg.id, cfg.class);
        self.devices.lock().push(dev);
        Ok(())
    }

    /// Looks up an attached device by instance id.
    #[must_use]
    pub fn device(&self, id: &str) -> Option<Arc<dyn DeviceOps>> {
        self.devices.lock().iter().find(|d| d.id() == id).cloned()
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.devices.lock().len()
    }

    /// Tears every device down.
    pub(crate) fn free_all(&self, vm: &Vm) {
        for dev in self.devices.lock().drain(..) {
            dev.free(vm);
        }
    }
}

impl core::fmt::Debug for DevMgr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DevMgr")
            .field("factories", &self.factories.len())
            .field("devices", &self.devices.lock().len())
            .finish()
    }
}
