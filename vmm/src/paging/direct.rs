//! The module containing the passthrough and nested page-table engines.
//!
//! Both engines build identity GPA -> HPA translations on demand from
//! faults; they differ only in which hardware root consults the tree
//! (CR3 while the guest has paging off under shadow mode, N_CR3 under
//! nested paging) and in the table shape used.

use super::{
    pde32_index, pde64_index, pdpe_index, pdpe_pae_index, pml4_index, pte32_index, pte64_index,
    table32, table64, TableShape,
};
use crate::{
    cpu::{CpuMode, Vcpu},
    error::{Result, VmmError},
    mem::{dispatch_unhandled, MemRegion, PfError, PAGE_SIZE_1GB, PAGE_SIZE_2MB, PAGE_SIZE_4KB,
          PAGE_SIZE_4MB},
    vm::Vm,
};
use log::debug;

/// The table shape the passthrough tree uses for a guest CPU mode. Long
/// mode is reached only after the guest enables paging, so passthrough
/// never needs more than the PAE shape.
#[must_use]
pub fn passthrough_shape(mode: CpuMode) -> TableShape {
    match mode {
        CpuMode::Real | CpuMode::Protected => TableShape::Bits32,
        _ => TableShape::Pae32,
    }
}

/// Creates the passthrough root for the core's current mode.
pub fn init_passthrough(vm: &Vm, core: &mut Vcpu) -> Result<()> {
    let shape = passthrough_shape(core.cpu_mode());
    let _ = core.direct_map.ensure_root(vm.host(), shape)?;
    Ok(())
}

/// Points hardware CR3 at the passthrough tree (shadow mode with guest
/// paging off).
pub fn activate_passthrough(core: &mut Vcpu) -> Result<()> {
    if core.direct_map.root() == 0 {
        return Err(VmmError::Contract("passthrough root not initialized"));
    }
    core.ctrl_regs.cr3 = core.direct_map.root();
    Ok(())
}

/// Rebuilds the passthrough tree from scratch, e.g. across a PAE toggle.
pub fn reset_passthrough(vm: &Vm, core: &mut Vcpu) -> Result<()> {
    core.direct_map.free_all(vm.host());
    init_passthrough(vm, core)
}

/// Creates the nested-paging root (always the 4-level host shape).
pub fn init_nested(vm: &Vm, core: &mut Vcpu) -> Result<()> {
    let _ = core.direct_map.ensure_root(vm.host(), TableShape::Long4)?;
    Ok(())
}

/// Handles a fault against the direct-mapped tree, passthrough or nested.
///
/// For a backed, readable region the missing translation is installed at
/// the largest page size the memory map allows; anything else lands in the
/// region's fault handler.
pub fn handle_direct_pagefault(
    vm: &Vm,
    core: &mut Vcpu,
    fault_addr: u64,
    error_code: PfError,
) -> Result<()> {
    let shape = match core.direct_map.shape() {
        Some(shape) => shape,
        None => {
            // First fault after a mode transition; build the root lazily.
            let shape = match core.paging_mode {
                crate::cpu::PagingMode::Nested => TableShape::Long4,
                crate::cpu::PagingMode::Shadow => passthrough_shape(core.cpu_mode()),
            };
            let _ = core.direct_map.ensure_root(vm.host(), shape)?;
            shape
        }
    };

    let core_id = core.vcpu_id as u16;
    let (region, translation) = {
        let map = vm.mem_map().read();
        let Some(region) = map.get_region(core_id, fault_addr).cloned() else {
            return Err(VmmError::NotMapped(fault_addr));
        };

        if region.flags.alloced() && region.flags.read() {
            let size_mode = match shape {
                TableShape::Bits32 => CpuMode::Protected,
                TableShape::Pae32 => CpuMode::ProtectedPae,
                TableShape::Long4 => CpuMode::Long,
            };
            let pg_size = map.max_page_size(
                core_id,
                fault_addr,
                size_mode,
                core.use_large_pages,
                core.use_giant_pages,
            );
            let pg_base = fault_addr & !(pg_size - 1);
            let hpa = map.gpa_to_hpa(core_id, pg_base)?;
            (region, Some((pg_base, hpa, pg_size)))
        } else {
            (region, None)
        }
    };

    let Some((gpa, hpa, pg_size)) = translation else {
        return dispatch_unhandled(vm, core, &region, fault_addr, fault_addr, error_code);
    };

    debug!(
        "core {}: direct fault at {fault_addr:#x} -> {hpa:#x} ({pg_size:#x} page)",
        core.vcpu_id
    );
    match plant_direct(vm, core, &region, gpa, hpa, pg_size, shape) {
        Ok(()) => Ok(()),
        // A leaf already present means the access violated its permissions.
        Err(VmmError::Contract("translation already present")) => {
            dispatch_unhandled(vm, core, &region, fault_addr, fault_addr, error_code)
        }
        Err(e) => Err(e),
    }
}

fn plant_direct(
    vm: &Vm,
    core: &mut Vcpu,
    region: &MemRegion,
    gpa: u64,
    hpa: u64,
    pg_size: u64,
    shape: TableShape,
) -> Result<()> {
    let host = vm.host();
    let root = core.direct_map.ensure_root(host, shape)?;
    let dm = &mut core.direct_map;

    match shape {
        TableShape::Bits32 => {
            if hpa & 0xffff_ffff_0000_0000 != 0 {
                return Err(VmmError::Above4G(hpa));
            }
            // Safety: `root` and all table pages below are VMM-owned.
            let pd = unsafe { table32(host, root) };
            let pde = &mut pd[pde32_index(gpa)];

            if pg_size == PAGE_SIZE_4MB {
                if pde.present() {
                    return Err(VmmError::Contract("translation already present"));
                }
                pde.set_present(true);
                pde.set_user(true);
                pde.set_writable(region.flags.write());
                pde.set_large_page(true);
                pde.set_large_addr(hpa);
                apply_cache_bits32(pde, region);
                return Ok(());
            }

            let pt_hpa = if pde.present() {
                pde.addr()
            } else {
                let page = dm.alloc_table(host)?;
                pde.set_present(true);
                pde.set_writable(true);
                pde.set_user(true);
                pde.set_addr(page);
                page
            };

            let pt = unsafe { table32(host, pt_hpa) };
            let pte = &mut pt[pte32_index(gpa)];
            if pte.present() {
                return Err(VmmError::Contract("translation already present"));
            }
            pte.set_present(true);
            pte.set_user(true);
            pte.set_writable(region.flags.write());
            pte.set_addr(hpa);
            apply_cache_bits32(pte, region);
        }

        TableShape::Pae32 | TableShape::Long4 => {
            // Walk down to the level that holds the leaf.
            let mut table_hpa = root;
            let mut level = match shape {
                TableShape::Long4 => 4,
                _ => 3,
            };
            loop {
                // Safety: every page in this walk is VMM-owned.
                let table = unsafe { table64(host, table_hpa) };
                let index = match (shape, level) {
                    (TableShape::Pae32, 3) => pdpe_pae_index(gpa),
                    (_, 4) => pml4_index(gpa),
                    (_, 3) => pdpe_index(gpa),
                    (_, 2) => pde64_index(gpa),
                    _ => pte64_index(gpa),
                };
                let entry = &mut table[index];

                let leaf_level = match pg_size {
                    PAGE_SIZE_1GB => 3,
                    PAGE_SIZE_2MB => 2,
                    _ => 1,
                };

                if level == leaf_level {
                    if entry.present() {
                        return Err(VmmError::Contract("translation already present"));
                    }
                    entry.set_present(true);
                    entry.set_user(true);
                    entry.set_writable(region.flags.write());
                    if pg_size != PAGE_SIZE_4KB {
                        entry.set_large_page(true);
                    }
                    entry.set_addr(hpa);
                    if region.flags.uncached() {
                        entry.set_write_through(true);
                        entry.set_cache_disable(true);
                    }
                    return Ok(());
                }

                table_hpa = if entry.present() {
                    entry.addr()
                } else {
                    let page = dm.alloc_table(host)?;
                    entry.set_present(true);
                    entry.set_writable(true);
                    entry.set_user(true);
                    entry.set_addr(page);
                    page
                };
                level -= 1;
            }
        }
    }
    Ok(())
}

fn apply_cache_bits32(entry: &mut super::Entry32, region: &MemRegion) {
    if region.flags.uncached() {
        entry.set_write_through(true);
        entry.set_cache_disable(true);
    }
}

/// Drops the cached translation covering `gpa`, including any large-page
/// entry above it. A subsequent access faults and rebuilds.
pub fn invalidate_direct_addr(vm: &Vm, core: &mut Vcpu, gpa: u64) -> Result<()> {
    let host = vm.host();
    let root = core.direct_map.root();
    let Some(shape) = core.direct_map.shape() else {
        return Ok(());
    };
    if root == 0 {
        return Ok(());
    }

    match shape {
        TableShape::Bits32 => {
            // Safety: VMM-owned table pages.
            let pd = unsafe { table32(host, root) };
            let pde = &mut pd[pde32_index(gpa)];
            if !pde.present() {
                return Ok(());
            }
            if pde.large_page() {
                *pde = super::Entry32::default();
                return Ok(());
            }
            let pt = unsafe { table32(host, pde.addr()) };
            pt[pte32_index(gpa)] = super::Entry32::default();
        }
        TableShape::Pae32 | TableShape::Long4 => {
            let mut table_hpa = root;
            let mut level = match shape {
                TableShape::Long4 => 4,
                _ => 3,
            };
            loop {
                // Safety: VMM-owned table pages.
                let table = unsafe { table64(host, table_hpa) };
                let index = match (shape, level) {
                    (TableShape::Pae32, 3) => pdpe_pae_index(gpa),
                    (_, 4) => pml4_index(gpa),
                    (_, 3) => pdpe_index(gpa),
                    (_, 2) => pde64_index(gpa),
                    _ => pte64_index(gpa),
                };
                let entry = &mut table[index];
                if !entry.present() {
                    return Ok(());
                }
                if level == 1 || entry.large_page() {
                    *entry = super::Entry64::default();
                    return Ok(());
                }
                table_hpa = entry.addr();
                level -= 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::PagingMode;
    use crate::vm::testing::nested_test_vm;

    #[test]
    fn nested_fault_installs_4k_leaf() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x8000);

        let err = PfError(0);
        handle_direct_pagefault(&vm, &mut core, 0x3000, err).unwrap();

        let root = core.direct_map.root();
        assert_ne!(root, 0);
        assert_eq!(core.direct_map.shape(), Some(TableShape::Long4));

        // Walk what hardware would walk.
        let host = vm.host();
        let pml4 = unsafe { table64(host, root) };
        assert!(pml4[0].present());
        let pdpt = unsafe { table64(host, pml4[0].addr()) };
        assert!(pdpt[0].present());
        let pd = unsafe { table64(host, pdpt[0].addr()) };
        assert!(pd[0].present());
        let pt = unsafe { table64(host, pd[0].addr()) };
        let leaf = pt[3];
        assert!(leaf.present());
        assert!(leaf.writable());
        assert!(leaf.user());

        let expect = vm.mem_map().read().gpa_to_hpa(0, 0x3000).unwrap();
        assert_eq!(leaf.addr(), expect);
    }

    #[test]
    fn second_fault_on_same_page_reports_violation() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x8000);
        handle_direct_pagefault(&vm, &mut core, 0x3000, PfError(0)).unwrap();
        // The translation exists now; another fault there means permissions,
        // and with no handler attached it surfaces as an unmapped error.
        assert!(handle_direct_pagefault(&vm, &mut core, 0x3000, PfError(0b10)).is_err());
    }

    #[test]
    fn invalidate_clears_the_leaf() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x8000);
        handle_direct_pagefault(&vm, &mut core, 0x3000, PfError(0)).unwrap();
        invalidate_direct_addr(&vm, &mut core, 0x3000).unwrap();

        let host = vm.host();
        let pml4 = unsafe { table64(host, core.direct_map.root()) };
        let pdpt = unsafe { table64(host, pml4[0].addr()) };
        let pd = unsafe { table64(host, pdpt[0].addr()) };
        let pt = unsafe { table64(host, pd[0].addr()) };
        assert!(!pt[3].present());

        // Faulting again reinstalls it.
        handle_direct_pagefault(&vm, &mut core, 0x3000, PfError(0)).unwrap();
        let pt = unsafe { table64(host, pd[0].addr()) };
        assert!(pt[3].present());
    }

    #[test]
    fn passthrough_uses_32bit_shape_in_real_mode() {
        let (vm, mut core) = nested_test_vm(0x10000, 0x8000);
        core.paging_mode = PagingMode::Shadow;
        core.ctrl_regs.cr0 = 0; // real mode
        core.update_modes();

        handle_direct_pagefault(&vm, &mut core, 0x2000, PfError(0)).unwrap();
        assert_eq!(core.direct_map.shape(), Some(TableShape::Bits32));

        let host = vm.host();
        let pd = unsafe { table32(host, core.direct_map.root()) };
        assert!(pd[0].present());
        let pt = unsafe { table32(host, pd[0].addr()) };
        assert!(pt[2].present());
    }
}
