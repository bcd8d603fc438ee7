//! The module containing the page-table engines.
//!
//! Three engines cover the three ways hardware can reach guest memory:
//!
//! - **Passthrough**: identity GPA -> HPA tables consulted while the guest
//!   has paging disabled (shadow mode only). Built on demand from #PF.
//! - **Shadow**: the guest's own tables are walked purely for intent; what
//!   hardware reads is a parallel tree this engine plants, translating GVA
//!   directly to HPA. Built on demand from #PF, re-rooted on CR3 writes.
//! - **Nested**: hardware walks the guest's tree itself; this engine owns
//!   the second-level GPA -> HPA tree and fills it from nested page faults,
//!   using the largest page size the memory map permits.
//!
//! Table shapes follow the guest CPU mode: 32-bit non-PAE (two levels of
//! 1024 4-byte entries), 32-bit PAE (4-entry PDPT above 512-entry tables)
//! and 4-level long mode. Entries are modeled as explicit bitfields; the
//! VMM never relies on language-level struct bit layout.

pub mod direct;
pub mod shadow;

use crate::{
    error::{Result, VmmError},
    host::{zero_pages, AllocZone, VmmHost},
};
use alloc::vec::Vec;
use bitfield::bitfield;

bitfield! {
    /// A 32-bit non-PAE directory or table entry.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry32(u32);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub write_through, set_write_through: 3;
    pub cache_disable, set_cache_disable: 4;
    pub accessed, set_accessed: 5;
    pub dirty, set_dirty: 6;
    /// PS in a PDE, PAT in a PTE.
    pub large_page, set_large_page: 7;
    pub global, set_global: 8;
    pub u32, pfn, set_pfn: 31, 12;
}

impl Entry32 {
    #[must_use]
    pub fn addr(&self) -> u64 {
        u64::from(self.pfn()) << 12
    }

    pub fn set_addr(&mut self, addr: u64) {
        self.set_pfn((addr >> 12) as u32);
    }

    /// The 4 MiB frame base of a large PDE (bits 31:22).
    #[must_use]
    pub fn large_addr(&self) -> u64 {
        u64::from(self.0 & 0xffc0_0000)
    }

    pub fn set_large_addr(&mut self, addr: u64) {
        self.0 = (self.0 & 0x003f_ffff) | ((addr as u32) & 0xffc0_0000);
    }
}

bitfield! {
    /// A PAE or long-mode entry, any level. The same layout serves PML4Es,
    /// PDPEs, PDEs and PTEs; PS (bit 7) marks 1 GiB / 2 MiB leaves.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry64(u64);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub write_through, set_write_through: 3;
    pub cache_disable, set_cache_disable: 4;
    pub accessed, set_accessed: 5;
    pub dirty, set_dirty: 6;
    pub large_page, set_large_page: 7;
    pub global, set_global: 8;
    pub u64, pfn, set_pfn: 51, 12;
    pub no_execute, set_no_execute: 63;
}

impl Entry64 {
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.pfn() << 12
    }

    pub fn set_addr(&mut self, addr: u64) {
        self.set_pfn(addr >> 12);
    }

    /// The leaf frame base for a `size`-byte leaf (masks the PAT and
    /// sub-frame bits a large entry carries low).
    #[must_use]
    pub fn leaf_addr(&self, size: u64) -> u64 {
        self.addr() & !(size - 1)
    }
}

/// Page-table indices for the 32-bit non-PAE shape.
#[must_use]
pub fn pde32_index(addr: u64) -> usize {
    ((addr >> 22) & 0x3ff) as usize
}

#[must_use]
pub fn pte32_index(addr: u64) -> usize {
    ((addr >> 12) & 0x3ff) as usize
}

/// Page-table indices for the PAE and long-mode shapes.
#[must_use]
pub fn pml4_index(addr: u64) -> usize {
    ((addr >> 39) & 0x1ff) as usize
}

#[must_use]
pub fn pdpe_index(addr: u64) -> usize {
    ((addr >> 30) & 0x1ff) as usize
}

#[must_use]
pub fn pdpe_pae_index(addr: u64) -> usize {
    ((addr >> 30) & 0x3) as usize
}

#[must_use]
pub fn pde64_index(addr: u64) -> usize {
    ((addr >> 21) & 0x1ff) as usize
}

#[must_use]
pub fn pte64_index(addr: u64) -> usize {
    ((addr >> 12) & 0x1ff) as usize
}

/// The shape of a VMM-built table tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableShape {
    /// Two-level 32-bit non-PAE. All table pages must live below 4 GiB.
    Bits32,
    /// 32-bit PAE: 4-entry PDPT over 512-entry PD/PT.
    Pae32,
    /// Four-level long mode.
    Long4,
}

/// A tree of VMM-owned table pages: the passthrough/nested direct map.
///
/// Tracks every page it allocates so teardown and re-rooting return them to
/// the host.
#[derive(Debug, Default)]
pub struct DirectMap {
    root: u64,
    shape: Option<TableShape>,
    pages: Vec<u64>,
}

impl DirectMap {
    /// The root table's host physical address, or 0 before first use.
    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    #[must_use]
    pub fn shape(&self) -> Option<TableShape> {
        self.shape
    }

    /// Returns the root, creating it for `shape` on first use.
    pub fn ensure_root(&mut self, host: &dyn VmmHost, shape: TableShape) -> Result<u64> {
        if let Some(cur) = self.shape {
            if cur == shape && self.root != 0 {
                return Ok(self.root);
            }
            if self.root != 0 {
                // Shape change; the old tree is useless.
                self.free_all(host);
            }
        }
        let root = alloc_table_page(host, shape)?;
        self.root = root;
        self.shape = Some(shape);
        self.pages.push(root);
        Ok(root)
    }

    /// Allocates one zeroed table page of the right kind and remembers it.
    pub fn alloc_table(&mut self, host: &dyn VmmHost) -> Result<u64> {
        let shape = self.shape.ok_or(VmmError::Contract("table tree has no shape"))?;
        let page = alloc_table_page(host, shape)?;
        self.pages.push(page);
        Ok(page)
    }

    /// Frees the whole tree. The next fault rebuilds from scratch.
    pub fn free_all(&mut self, host: &dyn VmmHost) {
        for page in self.pages.drain(..) {
            host.free_pages(page, 1);
        }
        self.root = 0;
        self.shape = None;
    }
}

fn alloc_table_page(host: &dyn VmmHost, shape: TableShape) -> Result<u64> {
    let zone = match shape {
        TableShape::Bits32 => AllocZone::Below4G,
        TableShape::Pae32 | TableShape::Long4 => AllocZone::Any,
    };
    let hpa = host.alloc_pages(1, zone, None).ok_or(VmmError::OutOfHostMemory)?;
    if shape == TableShape::Bits32 && hpa & 0xffff_ffff_0000_0000 != 0 {
        host.free_pages(hpa, 1);
        return Err(VmmError::Above4G(hpa));
    }
    zero_pages(host, hpa, 1);
    Ok(hpa)
}

/// The shadow-paging state of one vCPU: the guest's idea of CR0/CR3/EFER
/// and the shadow tree hardware actually consults.
#[derive(Debug, Default)]
pub struct ShadowPgState {
    pub guest_cr0: u64,
    pub guest_cr3: u64,
    pub guest_efer: u64,
    /// The shadow tree. Distinct from the guest's tables; hardware CR3
    /// points here while the guest believes CR3 holds `guest_cr3`.
    pub shadow: DirectMap,
}

/// Borrows a 512-entry 64-bit table living in host memory.
///
/// # Safety
/// `hpa` must be a table page this VMM allocated (page-aligned, mapped,
/// exclusively owned by the caller's vCPU while borrowed).
pub(crate) unsafe fn table64<'a>(host: &dyn VmmHost, hpa: u64) -> &'a mut [Entry64; 512] {
    unsafe { &mut *host.hpa_to_hva(hpa).cast::<[Entry64; 512]>() }
}

/// Borrows a 1024-entry 32-bit table living in host memory.
///
/// # Safety
/// Same contract as [`table64`].
pub(crate) unsafe fn table32<'a>(host: &dyn VmmHost, hpa: u64) -> &'a mut [Entry32; 1024] {
    unsafe { &mut *host.hpa_to_hva(hpa).cast::<[Entry32; 1024]>() }
}
