//! The module containing the shadow page-table engine and guest-table walks.
//!
//! Under shadow paging the guest's CR3 never reaches hardware. The guest's
//! tables are read only to learn what the guest intends (and to maintain its
//! accessed/dirty bits); hardware consults a parallel shadow tree that maps
//! guest-virtual addresses straight to host-physical frames. Shadow entries
//! are planted lazily from #PF and the whole tree is dropped whenever the
//! guest re-roots (CR3 write) or performs a TLB-flushing control-register
//! change. Dropping and rebuilding is the simplest design that is correct;
//! no stale entry can survive a flush.

use super::{
    pde32_index, pde64_index, pdpe_index, pdpe_pae_index, pml4_index, pte32_index, pte64_index,
    table32, table64, Entry32, Entry64, TableShape,
};
use crate::{
    cpu::{CpuMode, MemMode, Vcpu},
    error::{Result, VmmError},
    excp::PF_EXCEPTION,
    mem::{dispatch_unhandled, PfError, PAGE_SIZE_1GB, PAGE_SIZE_2MB, PAGE_SIZE_4KB, PAGE_SIZE_4MB},
    paging::direct,
    vm::Vm,
};
use log::{debug, trace};

/// What a guest-table walk found for one virtual address.
#[derive(Debug, Clone, Copy)]
pub struct GuestMapping {
    pub gpa: u64,
    pub writable: bool,
    pub user: bool,
    /// Whether the guest leaf already had its dirty bit set.
    pub dirty: bool,
    pub page_size: u64,
}

/// The outcome of walking the guest's own tables.
#[derive(Debug, Clone, Copy)]
pub enum GuestWalk {
    /// Some level was not present; the fault belongs to the guest.
    NotPresent,
    Mapped(GuestMapping),
}

/// The shadow tree shape for a guest CPU mode with paging enabled.
fn shadow_shape(mode: CpuMode) -> Result<TableShape> {
    match mode {
        CpuMode::Protected => Ok(TableShape::Bits32),
        CpuMode::ProtectedPae => Ok(TableShape::Pae32),
        CpuMode::Long | CpuMode::Long32Compat | CpuMode::Long16Compat => Ok(TableShape::Long4),
        CpuMode::Real => Err(VmmError::Contract("paging enabled in real mode")),
    }
}

/// Re-roots the shadow tree: the old tree is freed wholesale and hardware
/// CR3 moves to a fresh empty root. Subsequent faults repopulate it.
pub fn activate_shadow_pt(vm: &Vm, core: &mut Vcpu) -> Result<()> {
    let shape = shadow_shape(core.cpu_mode())?;
    core.shdw_pg_state.shadow.free_all(vm.host());
    let root = core.shdw_pg_state.shadow.ensure_root(vm.host(), shape)?;
    core.ctrl_regs.cr3 = root;
    trace!(
        "core {}: shadow root {root:#x} for guest cr3 {:#x}",
        core.vcpu_id,
        core.shdw_pg_state.guest_cr3
    );
    Ok(())
}

/// Invalidates every cached shadow translation.
pub fn invalidate_shadow_pts(vm: &Vm, core: &mut Vcpu) -> Result<()> {
    if core.mem_mode == MemMode::Virtual {
        activate_shadow_pt(vm, core)
    } else {
        Ok(())
    }
}

/// Invalidates the shadow translation for one guest-virtual address.
pub fn invalidate_shadow_addr(vm: &Vm, core: &mut Vcpu, gva: u64) -> Result<()> {
    let host = vm.host();
    let root = core.shdw_pg_state.shadow.root();
    let Some(shape) = core.shdw_pg_state.shadow.shape() else {
        return Ok(());
    };
    if root == 0 {
        return Ok(());
    }
    clear_leaf(host, root, shape, gva);
    Ok(())
}

fn clear_leaf(host: &dyn crate::host::VmmHost, root: u64, shape: TableShape, va: u64) {
    match shape {
        TableShape::Bits32 => {
            // Safety: shadow table pages are VMM-owned.
            let pd = unsafe { table32(host, root) };
            let pde = &mut pd[pde32_index(va)];
            if !pde.present() {
                return;
            }
            if pde.large_page() {
                *pde = Entry32::default();
                return;
            }
            let pt = unsafe { table32(host, pde.addr()) };
            pt[pte32_index(va)] = Entry32::default();
        }
        TableShape::Pae32 | TableShape::Long4 => {
            let mut table_hpa = root;
            let mut level = if shape == TableShape::Long4 { 4 } else { 3 };
            loop {
                // Safety: shadow table pages are VMM-owned.
                let table = unsafe { table64(host, table_hpa) };
                let index = match (shape, level) {
                    (TableShape::Pae32, 3) => pdpe_pae_index(va),
                    (_, 4) => pml4_index(va),
                    (_, 3) => pdpe_index(va),
                    (_, 2) => pde64_index(va),
                    _ => pte64_index(va),
                };
                let entry = &mut table[index];
                if !entry.present() {
                    return;
                }
                if level == 1 || entry.large_page() {
                    *entry = Entry64::default();
                    return;
                }
                table_hpa = entry.addr();
                level -= 1;
            }
        }
    }
}

/// Handles a #PF VM exit under shadow paging.
///
/// While the guest runs untranslated this is simply a passthrough miss.
/// Otherwise the guest tree decides: a miss or permission clash there is
/// the guest's own fault and is injected back; a valid guest mapping whose
/// shadow entry is missing gets one planted.
pub fn handle_shadow_pagefault(
    vm: &Vm,
    core: &mut Vcpu,
    fault_addr: u64,
    error_code: PfError,
) -> Result<()> {
    if core.mem_mode == MemMode::Physical {
        return direct::handle_direct_pagefault(vm, core, fault_addr, error_code);
    }

    let is_write = error_code.write();
    let is_user = error_code.user();

    let mapping = match walk_guest_tables(vm, core, fault_addr, true, is_write)? {
        GuestWalk::NotPresent => {
            trace!(
                "core {}: guest #PF (not present) at {fault_addr:#x}",
                core.vcpu_id
            );
            return inject_guest_pf(core, fault_addr, error_code, false);
        }
        GuestWalk::Mapped(m) => m,
    };

    // The mapping exists; check the guest's own permissions before ours.
    let cr0_wp = core.shdw_pg_state.guest_cr0 & (1 << 16) != 0;
    if (is_write && !mapping.writable && (is_user || cr0_wp))
        || (is_user && !mapping.user)
    {
        trace!(
            "core {}: guest #PF (protection) at {fault_addr:#x}",
            core.vcpu_id
        );
        return inject_guest_pf(core, fault_addr, error_code, true);
    }

    let core_id = core.vcpu_id as u16;
    let (region, hpa) = {
        let map = vm.mem_map().read();
        let Some(region) = map.get_region(core_id, mapping.gpa).cloned() else {
            return Err(VmmError::NotMapped(mapping.gpa));
        };
        if !region.flags.alloced() || !region.flags.read() {
            (region, None)
        } else if is_write && !region.flags.write() {
            // Writable per the guest, but the region is hooked read-only.
            (region, None)
        } else {
            let hpa = map.gpa_to_hpa(core_id, mapping.gpa)?;
            (region, Some(hpa))
        }
    };

    let Some(hpa) = hpa else {
        return dispatch_unhandled(vm, core, &region, fault_addr, mapping.gpa, error_code);
    };

    // Dirty tracking: plant read-only until the guest actually writes, so
    // the write re-faults here and we can set the guest dirty bit (the walk
    // above already did for this access).
    let writable =
        mapping.writable && region.flags.write() && (is_write || mapping.dirty);

    debug!(
        "core {}: shadow plant {fault_addr:#x} -> {hpa:#x} (w={writable})",
        core.vcpu_id
    );
    plant_shadow_leaf(vm, core, fault_addr, hpa, writable, mapping.user)
}

fn inject_guest_pf(core: &mut Vcpu, fault_addr: u64, error_code: PfError, present: bool) -> Result<()> {
    let mut code = error_code;
    code.set_present(present);
    core.ctrl_regs.cr2 = fault_addr;
    core.shared
        .excp
        .raise_exception_with_error(PF_EXCEPTION, code.0)
}

fn plant_shadow_leaf(
    vm: &Vm,
    core: &mut Vcpu,
    gva: u64,
    hpa: u64,
    writable: bool,
    user: bool,
) -> Result<()> {
    let host = vm.host();
    let shape = shadow_shape(core.cpu_mode())?;
    let root = core.shdw_pg_state.shadow.ensure_root(host, shape)?;
    let dm = &mut core.shdw_pg_state.shadow;

    match shape {
        TableShape::Bits32 => {
            if hpa & 0xffff_ffff_0000_0000 != 0 {
                return Err(VmmError::Above4G(hpa));
            }
            // Safety: shadow table pages are VMM-owned.
            let pd = unsafe { table32(host, root) };
            let pde = &mut pd[pde32_index(gva)];
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
            let pte = &mut pt[pte32_index(gva)];
            *pte = Entry32::default();
            pte.set_present(true);
            pte.set_user(user);
            pte.set_writable(writable);
            pte.set_addr(hpa);
        }
        TableShape::Pae32 | TableShape::Long4 => {
            let mut table_hpa = root;
            let mut level = if shape == TableShape::Long4 { 4 } else { 3 };
            while level > 1 {
                // Safety: shadow table pages are VMM-owned.
                let table = unsafe { table64(host, table_hpa) };
                let index = match (shape, level) {
                    (TableShape::Pae32, 3) => pdpe_pae_index(gva),
                    (_, 4) => pml4_index(gva),
                    (_, 3) => pdpe_index(gva),
                    _ => pde64_index(gva),
                };
                let entry = &mut table[index];
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
            let pt = unsafe { table64(host, table_hpa) };
            let pte = &mut pt[pte64_index(gva)];
            *pte = Entry64::default();
            pte.set_present(true);
            pte.set_user(user);
            pte.set_writable(writable);
            pte.set_addr(hpa);
        }
    }
    Ok(())
}

/// Walks the guest's own page tables for `gva`.
///
/// With `update_ad` set, accessed bits are written back along the walk and
/// the dirty bit is set on the leaf when `for_write` is set, so the walk
/// reflects the architectural side effects of the access being resolved.
pub fn walk_guest_tables(
    vm: &Vm,
    core: &Vcpu,
    gva: u64,
    update_ad: bool,
    for_write: bool,
) -> Result<GuestWalk> {
    let cr3 = core.shdw_pg_state.guest_cr3;
    match core.cpu_mode {
        CpuMode::Protected => walk_guest_32(vm, core, cr3, gva, update_ad, for_write),
        CpuMode::ProtectedPae => walk_guest_pae(vm, core, cr3, gva, update_ad, for_write),
        CpuMode::Long | CpuMode::Long32Compat | CpuMode::Long16Compat => {
            walk_guest_long(vm, core, cr3, gva, update_ad, for_write)
        }
        CpuMode::Real => Err(VmmError::Contract("guest walk in real mode")),
    }
}

fn read_guest_entry32(vm: &Vm, core: &Vcpu, gpa: u64) -> Result<Entry32> {
    let mut raw = [0u8; 4];
    vm.mem_map().read().read_gpa(core.vcpu_id as u16, gpa, &mut raw)?;
    Ok(Entry32(u32::from_le_bytes(raw)))
}

fn write_guest_entry32(vm: &Vm, core: &Vcpu, gpa: u64, entry: Entry32) -> Result<()> {
    vm.mem_map()
        .read()
        .write_gpa(core.vcpu_id as u16, gpa, &entry.0.to_le_bytes())
}

fn read_guest_entry64(vm: &Vm, core: &Vcpu, gpa: u64) -> Result<Entry64> {
    let mut raw = [0u8; 8];
    vm.mem_map().read().read_gpa(core.vcpu_id as u16, gpa, &mut raw)?;
    Ok(Entry64(u64::from_le_bytes(raw)))
}

fn write_guest_entry64(vm: &Vm, core: &Vcpu, gpa: u64, entry: Entry64) -> Result<()> {
    vm.mem_map()
        .read()
        .write_gpa(core.vcpu_id as u16, gpa, &entry.0.to_le_bytes())
}

fn walk_guest_32(
    vm: &Vm,
    core: &Vcpu,
    cr3: u64,
    gva: u64,
    update_ad: bool,
    for_write: bool,
) -> Result<GuestWalk> {
    let pde_gpa = (cr3 & !0xfff) + pde32_index(gva) as u64 * 4;
    let mut pde = read_guest_entry32(vm, core, pde_gpa)?;
    if !pde.present() {
        return Ok(GuestWalk::NotPresent);
    }

    if pde.large_page() {
        let dirty = pde.dirty();
        if update_ad {
            pde.set_accessed(true);
            if for_write {
                pde.set_dirty(true);
            }
            write_guest_entry32(vm, core, pde_gpa, pde)?;
        }
        return Ok(GuestWalk::Mapped(GuestMapping {
            gpa: pde.large_addr() + (gva & (PAGE_SIZE_4MB - 1)),
            writable: pde.writable(),
            user: pde.user(),
            dirty,
            page_size: PAGE_SIZE_4MB,
        }));
    }

    let pte_gpa = pde.addr() + pte32_index(gva) as u64 * 4;
    let mut pte = read_guest_entry32(vm, core, pte_gpa)?;
    if !pte.present() {
        return Ok(GuestWalk::NotPresent);
    }

    let dirty = pte.dirty();
    if update_ad {
        pde.set_accessed(true);
        write_guest_entry32(vm, core, pde_gpa, pde)?;
        pte.set_accessed(true);
        if for_write {
            pte.set_dirty(true);
        }
        write_guest_entry32(vm, core, pte_gpa, pte)?;
    }

    Ok(GuestWalk::Mapped(GuestMapping {
        gpa: pte.addr() + (gva & (PAGE_SIZE_4KB - 1)),
        writable: pde.writable() && pte.writable(),
        user: pde.user() && pte.user(),
        dirty,
        page_size: PAGE_SIZE_4KB,
    }))
}

fn walk_guest_pae(
    vm: &Vm,
    core: &Vcpu,
    cr3: u64,
    gva: u64,
    update_ad: bool,
    for_write: bool,
) -> Result<GuestWalk> {
    // The PAE PDPT is 32-byte aligned and its entries carry no permission
    // bits, only present.
    let pdpe_gpa = (cr3 & !0x1f) + pdpe_pae_index(gva) as u64 * 8;
    let pdpe = read_guest_entry64(vm, core, pdpe_gpa)?;
    if !pdpe.present() {
        return Ok(GuestWalk::NotPresent);
    }
    walk_guest_dir64(vm, core, pdpe.addr(), gva, update_ad, for_write, true, true)
}

fn walk_guest_long(
    vm: &Vm,
    core: &Vcpu,
    cr3: u64,
    gva: u64,
    update_ad: bool,
    for_write: bool,
) -> Result<GuestWalk> {
    let pml4e_gpa = (cr3 & 0x000f_ffff_ffff_f000) + pml4_index(gva) as u64 * 8;
    let mut pml4e = read_guest_entry64(vm, core, pml4e_gpa)?;
    if !pml4e.present() {
        return Ok(GuestWalk::NotPresent);
    }
    if update_ad {
        pml4e.set_accessed(true);
        write_guest_entry64(vm, core, pml4e_gpa, pml4e)?;
    }

    let pdpe_gpa = pml4e.addr() + pdpe_index(gva) as u64 * 8;
    let mut pdpe = read_guest_entry64(vm, core, pdpe_gpa)?;
    if !pdpe.present() {
        return Ok(GuestWalk::NotPresent);
    }

    if pdpe.large_page() {
        let dirty = pdpe.dirty();
        if update_ad {
            pdpe.set_accessed(true);
            if for_write {
                pdpe.set_dirty(true);
            }
            write_guest_entry64(vm, core, pdpe_gpa, pdpe)?;
        }
        return Ok(GuestWalk::Mapped(GuestMapping {
            gpa: pdpe.leaf_addr(PAGE_SIZE_1GB) + (gva & (PAGE_SIZE_1GB - 1)),
            writable: pml4e.writable() && pdpe.writable(),
            user: pml4e.user() && pdpe.user(),
            dirty,
            page_size: PAGE_SIZE_1GB,
        }));
    }
    if update_ad {
        pdpe.set_accessed(true);
        write_guest_entry64(vm, core, pdpe_gpa, pdpe)?;
    }

    let upper_w = pml4e.writable() && pdpe.writable();
    let upper_u = pml4e.user() && pdpe.user();
    walk_guest_dir64(vm, core, pdpe.addr(), gva, update_ad, for_write, upper_w, upper_u)
}

/// The common PD/PT tail of the PAE and long-mode walks.
#[allow(clippy::too_many_arguments)]
fn walk_guest_dir64(
    vm: &Vm,
    core: &Vcpu,
    pd_base: u64,
    gva: u64,
    update_ad: bool,
    for_write: bool,
    upper_writable: bool,
    upper_user: bool,
) -> Result<GuestWalk> {
    let pde_gpa = pd_base + pde64_index(gva) as u64 * 8;
    let mut pde = read_guest_entry64(vm, core, pde_gpa)?;
    if !pde.present() {
        return Ok(GuestWalk::NotPresent);
    }

    if pde.large_page() {
        let dirty = pde.dirty();
        if update_ad {
            pde.set_accessed(true);
            if for_write {
                pde.set_dirty(true);
            }
            write_guest_entry64(vm, core, pde_gpa, pde)?;
        }
        return Ok(GuestWalk::Mapped(GuestMapping {
            gpa: pde.leaf_addr(PAGE_SIZE_2MB) + (gva & (PAGE_SIZE_2MB - 1)),
            writable: upper_writable && pde.writable(),
            user: upper_user && pde.user(),
            dirty,
            page_size: PAGE_SIZE_2MB,
        }));
    }
    if update_ad {
        pde.set_accessed(true);
        write_guest_entry64(vm, core, pde_gpa, pde)?;
    }

    let pte_gpa = pde.addr() + pte64_index(gva) as u64 * 8;
    let mut pte = read_guest_entry64(vm, core, pte_gpa)?;
    if !pte.present() {
        return Ok(GuestWalk::NotPresent);
    }

    let dirty = pte.dirty();
    if update_ad {
        pte.set_accessed(true);
        if for_write {
            pte.set_dirty(true);
        }
        write_guest_entry64(vm, core, pte_gpa, pte)?;
    }

    Ok(GuestWalk::Mapped(GuestMapping {
        gpa: pte.addr() + (gva & (PAGE_SIZE_4KB - 1)),
        writable: upper_writable && pde.writable() && pte.writable(),
        user: upper_user && pde.user() && pte.user(),
        dirty,
        page_size: PAGE_SIZE_4KB,
    }))
}

/// Translates a guest virtual address to guest physical.
pub fn gva_to_gpa(vm: &Vm, core: &Vcpu, gva: u64) -> Result<u64> {
    if core.mem_mode == MemMode::Physical {
        return Ok(gva);
    }
    match walk_guest_tables(vm, core, gva, false, false)? {
        GuestWalk::NotPresent => Err(VmmError::NotMapped(gva)),
        GuestWalk::Mapped(m) => Ok(m.gpa),
    }
}

/// Reads guest memory through the guest's virtual address space.
pub fn read_gva(vm: &Vm, core: &Vcpu, gva: u64, buf: &mut [u8]) -> Result<()> {
    let mut off = 0usize;
    while off < buf.len() {
        let cur = gva + off as u64;
        let gpa = gva_to_gpa(vm, core, cur)?;
        let in_page = (PAGE_SIZE_4KB - (cur & (PAGE_SIZE_4KB - 1))) as usize;
        let chunk = in_page.min(buf.len() - off);
        vm.mem_map()
            .read()
            .read_gpa(core.vcpu_id as u16, gpa, &mut buf[off..off + chunk])?;
        off += chunk;
    }
    Ok(())
}

/// Writes guest memory through the guest's virtual address space.
pub fn write_gva(vm: &Vm, core: &Vcpu, gva: u64, buf: &[u8]) -> Result<()> {
    let mut off = 0usize;
    while off < buf.len() {
        let cur = gva + off as u64;
        let gpa = gva_to_gpa(vm, core, cur)?;
        let in_page = (PAGE_SIZE_4KB - (cur & (PAGE_SIZE_4KB - 1))) as usize;
        let chunk = in_page.min(buf.len() - off);
        vm.mem_map()
            .read()
            .write_gpa(core.vcpu_id as u16, gpa, &buf[off..off + chunk])?;
        off += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::PagingMode;
    use crate::vm::testing::shadow_test_vm;

    const CR0_PE: u64 = 1;
    const CR0_PG: u64 = 1 << 31;

    /// Builds 32-bit guest tables in guest memory: PDE[0] at cr3 points to
    /// a PT; PT[1] maps gva 0x1000 to `page_gpa`.
    fn build_guest_tables_32(vm: &Vm, writable: bool, page_gpa: u64) {
        let cr3 = 0x7000_u64;
        let pt = 0x8000_u64;

        let mut pde = Entry32::default();
        pde.set_present(true);
        pde.set_writable(true);
        pde.set_user(true);
        pde.set_addr(pt);
        vm.mem_map().read().write_gpa(0, cr3, &pde.0.to_le_bytes()).unwrap();

        let mut pte = Entry32::default();
        pte.set_present(true);
        pte.set_writable(writable);
        pte.set_user(true);
        pte.set_addr(page_gpa);
        vm.mem_map().read().write_gpa(0, pt + 4, &pte.0.to_le_bytes()).unwrap();
    }

    fn protected_paged_core(vm: &Vm) -> crate::cpu::Vcpu {
        let mut core = crate::vm::testing::detached_vcpu(vm, PagingMode::Shadow);
        core.shdw_pg_state.guest_cr0 = CR0_PE | CR0_PG;
        core.shdw_pg_state.guest_cr3 = 0x7000;
        core.ctrl_regs.cr0 = CR0_PE | CR0_PG;
        core.update_modes();
        core
    }

    #[test]
    fn shadow_fault_plants_translation_from_guest_intent() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        build_guest_tables_32(&vm, true, 0xa000);
        let mut core = protected_paged_core(&vm);

        // Read access to gva 0x1000 (PDE 0, PTE 1).
        let mut err = PfError(0);
        err.set_user(true);
        handle_shadow_pagefault(&vm, &mut core, 0x1000, err).unwrap();

        let host = vm.host();
        let root = core.shdw_pg_state.shadow.root();
        assert_ne!(root, 0);
        assert_eq!(core.ctrl_regs.cr3, root);
        assert_ne!(core.ctrl_regs.cr3, core.shdw_pg_state.guest_cr3);

        let pd = unsafe { table32(host, root) };
        assert!(pd[0].present());
        let pt = unsafe { table32(host, pd[0].addr()) };
        let leaf = pt[1];
        assert!(leaf.present());
        assert!(leaf.user());
        // Guest PTE is writable and not yet dirty: planted read-only so the
        // first write can set the dirty bit.
        assert!(!leaf.writable());

        let expect_hpa = vm.mem_map().read().gpa_to_hpa(0, 0xa000).unwrap();
        assert_eq!(leaf.addr(), expect_hpa);

        // The guest PDE/PTE picked up their accessed bits.
        let pde = read_guest_entry32(&vm, &core, 0x7000).unwrap();
        assert!(pde.accessed());
        let pte = read_guest_entry32(&vm, &core, 0x8004).unwrap();
        assert!(pte.accessed());
        assert!(!pte.dirty());
    }

    #[test]
    fn write_fault_sets_guest_dirty_and_plants_writable() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        build_guest_tables_32(&vm, true, 0xa000);
        let mut core = protected_paged_core(&vm);

        let mut err = PfError(0);
        err.set_write(true);
        handle_shadow_pagefault(&vm, &mut core, 0x1000, err).unwrap();

        let host = vm.host();
        let pd = unsafe { table32(host, core.shdw_pg_state.shadow.root()) };
        let pt = unsafe { table32(host, pd[0].addr()) };
        assert!(pt[1].writable());

        let pte = read_guest_entry32(&vm, &core, 0x8004).unwrap();
        assert!(pte.dirty());
    }

    #[test]
    fn guest_not_present_injects_pf() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        build_guest_tables_32(&vm, true, 0xa000);
        let mut core = protected_paged_core(&vm);

        // gva 0x400000 hits PDE[1], which is empty.
        let err = PfError(0);
        handle_shadow_pagefault(&vm, &mut core, 0x0040_0123, err).unwrap();

        assert_eq!(core.shared.excp.next_pending(), Some(PF_EXCEPTION));
        assert_eq!(core.ctrl_regs.cr2, 0x0040_0123);
        // Injected error code reports not-present.
        assert_eq!(core.shared.excp.error_code(PF_EXCEPTION) & 1, 0);
    }

    #[test]
    fn guest_write_protection_is_injected_back() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        build_guest_tables_32(&vm, false, 0xa000);
        let mut core = protected_paged_core(&vm);
        // Supervisor write with WP set must fault.
        core.shdw_pg_state.guest_cr0 |= 1 << 16;

        let mut err = PfError(0);
        err.set_write(true);
        handle_shadow_pagefault(&vm, &mut core, 0x1000, err).unwrap();

        assert_eq!(core.shared.excp.next_pending(), Some(PF_EXCEPTION));
        assert_eq!(core.shared.excp.error_code(PF_EXCEPTION) & 1, 1);
    }

    #[test]
    fn gva_translation_and_memory_access() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        build_guest_tables_32(&vm, true, 0xa000);
        let core = protected_paged_core(&vm);

        assert_eq!(gva_to_gpa(&vm, &core, 0x1234).unwrap(), 0xa234);

        let data = [1u8, 2, 3, 4];
        write_gva(&vm, &core, 0x1100, &data).unwrap();
        let mut back = [0u8; 4];
        read_gva(&vm, &core, 0x1100, &mut back).unwrap();
        assert_eq!(back, data);

        // The same bytes must be visible at the physical alias.
        let mut phys = [0u8; 4];
        vm.mem_map().read().read_gpa(0, 0xa100, &mut phys).unwrap();
        assert_eq!(phys, data);
    }

    #[test]
    fn reroot_flushes_shadow_tree() {
        let (vm, _) = shadow_test_vm(0x20000, 0x20000);
        build_guest_tables_32(&vm, true, 0xa000);
        let mut core = protected_paged_core(&vm);

        handle_shadow_pagefault(&vm, &mut core, 0x1000, PfError(0)).unwrap();
        let old_root = core.shdw_pg_state.shadow.root();

        activate_shadow_pt(&vm, &mut core).unwrap();
        let new_root = core.shdw_pg_state.shadow.root();
        let host = vm.host();
        let pd = unsafe { table32(host, new_root) };
        assert!(!pd[0].present(), "fresh root must be empty");
        let _ = old_root;
    }
}
