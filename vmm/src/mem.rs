//! The module containing the guest physical memory map.
//!
//! Guest physical memory has two layers. The bottom layer is an array of
//! fixed-size base blocks covering `[0, mem_size)`, each backed by host
//! pages allocated at VM creation (honoring NUMA placement when requested).
//! Above it, overlay regions (VM-wide or per-core) shadow the base blocks
//! wherever they overlap: device MMIO windows, remapped frames, read-only
//! hooks. A region that is not `alloced` has no backing memory; guest access
//! to it lands in the region's fault handler, which may emulate the access,
//! inject #PF, or fail the VM.

use crate::{
    config::MEM_BLOCK_SIZE_BYTES,
    cpu::{CpuMode, Vcpu, CORE_ANY},
    error::{Result, VmmError},
    host::{zero_pages, AllocZone, VmmHost},
    vm::Vm,
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use bitfield::bitfield;
use log::{error, info};

pub const PAGE_SIZE_4KB: u64 = 0x1000;
pub const PAGE_SIZE_2MB: u64 = 0x20_0000;
pub const PAGE_SIZE_4MB: u64 = 0x40_0000;
pub const PAGE_SIZE_1GB: u64 = 0x4000_0000;

bitfield! {
    /// Access permissions and kind of a memory region.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct RegionFlags(u16);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub exec, set_exec: 2;
    /// Set only on the base blocks created at VM init.
    pub base, set_base: 3;
    /// The region is backed by host memory at `host_addr`.
    pub alloced, set_alloced: 4;
    pub uncached, set_uncached: 5;
}

impl RegionFlags {
    /// Read+write+exec, backed.
    #[must_use]
    pub fn rwx_alloced() -> Self {
        let mut f = Self::default();
        f.set_read(true);
        f.set_write(true);
        f.set_exec(true);
        f.set_alloced(true);
        f
    }

    /// A full hook: no backing, every access faults into the handler.
    #[must_use]
    pub fn hook() -> Self {
        Self::default()
    }
}

bitfield! {
    /// The x86 page-fault error code, also used for nested fault reporting.
    #[derive(Clone, Copy, Default)]
    pub struct PfError(u32);
    impl Debug;
    pub present, set_present: 0;
    pub write, set_write: 1;
    pub user, set_user: 2;
    pub rsvd_access, set_rsvd_access: 3;
    pub ifetch, set_ifetch: 4;
}

/// Receiver for guest accesses a region cannot satisfy by mapping.
pub trait RegionHandler: Send + Sync {
    /// Called when a guest access violates the region's flags or the region
    /// has no backing. `gva` is the faulting virtual address where known
    /// (equal to `gpa` when the guest runs untranslated).
    fn unhandled(
        &self,
        vm: &Vm,
        core: &mut Vcpu,
        gva: u64,
        gpa: u64,
        region: &MemRegion,
        error_code: PfError,
    ) -> Result<()>;
}

/// Region-private translation override: given a GPA inside the region,
/// produce the backing HPA. Regions without one use the linear
/// `host_addr + offset` rule.
pub type TranslateFn = Arc<dyn Fn(u64) -> Option<u64> + Send + Sync>;

/// One mapping of guest physical space, either a base block or an overlay.
#[derive(Clone)]
pub struct MemRegion {
    pub guest_start: u64,
    pub guest_end: u64,
    pub host_addr: u64,
    pub flags: RegionFlags,
    /// The core this region is visible to, or [`CORE_ANY`].
    pub core_id: u16,
    pub numa_id: Option<u32>,
    pub handler: Option<Arc<dyn RegionHandler>>,
    pub translate: Option<TranslateFn>,
}

impl core::fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemRegion")
            .field("guest_start", &format_args!("{:#x}", self.guest_start))
            .field("guest_end", &format_args!("{:#x}", self.guest_end))
            .field("host_addr", &format_args!("{:#x}", self.host_addr))
            .field("flags", &self.flags)
            .field("core_id", &self.core_id)
            .finish_non_exhaustive()
    }
}

impl MemRegion {
    /// Builds an overlay region. Base regions cannot be created this way.
    pub fn new(
        core_id: u16,
        flags: RegionFlags,
        guest_start: u64,
        guest_end: u64,
        host_addr: u64,
    ) -> Result<Self> {
        if guest_start >= guest_end {
            error!("region start {guest_start:#x} is not below end {guest_end:#x}");
            return Err(VmmError::InvalidRegion);
        }
        if flags.base() {
            error!("base regions cannot be created dynamically");
            return Err(VmmError::InvalidRegion);
        }
        Ok(Self {
            guest_start,
            guest_end,
            host_addr,
            flags,
            core_id,
            numa_id: None,
            handler: None,
            translate: None,
        })
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn RegionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn contains(&self, gpa: u64) -> bool {
        (self.guest_start..self.guest_end).contains(&gpa)
    }

    fn visible_to(&self, core_id: u16) -> bool {
        self.core_id == CORE_ANY || self.core_id == core_id
    }
}

/// Identifies an overlay region for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionId {
    pub guest_end: u64,
    pub core_id: u16,
}

/// The two-level guest physical address map.
pub struct MemMap {
    host: Arc<dyn VmmHost>,
    block_size: u64,
    mem_size: u64,
    base_regions: Vec<MemRegion>,
    /// Overlays, ordered by (guest_end, core_id). Exactly-equal ranges may
    /// coexist for different core ids; any other overlap is rejected.
    regions: BTreeMap<(u64, u16), MemRegion>,
}

impl MemMap {
    /// Carves `mem_size` bytes of guest memory into base blocks and
    /// allocates host backing for each, from the NUMA zone `numa_of`
    /// assigns (keyed by block start address).
    pub fn init(
        host: &Arc<dyn VmmHost>,
        mem_size: u64,
        block_size: Option<u64>,
        numa_of: impl Fn(u64) -> Option<u32>,
    ) -> Result<Self> {
        let block_size = block_size.unwrap_or(MEM_BLOCK_SIZE_BYTES);
        if mem_size == 0 || mem_size % PAGE_SIZE_4KB != 0 || block_size % PAGE_SIZE_4KB != 0 {
            return Err(VmmError::Config("guest memory size must be page aligned"));
        }

        let num_blocks = mem_size.div_ceil(block_size);
        let block_pages = (block_size / PAGE_SIZE_4KB) as usize;
        let mut base_regions: Vec<MemRegion> = Vec::with_capacity(num_blocks as usize);

        info!("initializing memory map with {num_blocks} base blocks");

        for i in 0..num_blocks {
            let guest_start = i * block_size;
            let numa_id = numa_of(guest_start);
            let Some(host_addr) = host.alloc_pages(block_pages, AllocZone::Any, numa_id) else {
                error!("could not allocate base block {i} (node {numa_id:?})");
                for reg in &base_regions {
                    host.free_pages(reg.host_addr, block_pages);
                }
                return Err(VmmError::OutOfHostMemory);
            };

            zero_pages(host.as_ref(), host_addr, block_pages);

            let mut flags = RegionFlags::rwx_alloced();
            flags.set_base(true);

            base_regions.push(MemRegion {
                guest_start,
                guest_end: guest_start + block_size,
                host_addr,
                flags,
                core_id: CORE_ANY,
                numa_id,
                handler: None,
                translate: None,
            });
        }

        Ok(Self {
            host: Arc::clone(host),
            block_size,
            mem_size: num_blocks * block_size,
            base_regions,
            regions: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    #[must_use]
    pub fn base_regions(&self) -> &[MemRegion] {
        &self.base_regions
    }

    /// The base block containing `gpa`.
    #[must_use]
    pub fn get_base_region(&self, gpa: u64) -> Option<&MemRegion> {
        self.base_regions.get((gpa / self.block_size) as usize)
    }

    /// The region governing `gpa` for `core_id`: the most specific visible
    /// overlay if any, else the base block.
    #[must_use]
    pub fn get_region(&self, core_id: u16, gpa: u64) -> Option<&MemRegion> {
        let mut any_match = None;
        for reg in self.regions.range((gpa + 1, 0)..).map(|(_, r)| r) {
            if reg.guest_start > gpa {
                break;
            }
            debug_assert!(reg.contains(gpa));
            if reg.core_id == core_id {
                return Some(reg);
            }
            if reg.core_id == CORE_ANY {
                any_match = Some(reg);
            }
        }
        any_match.or_else(|| self.get_base_region(gpa))
    }

    /// The first overlay visible to `core_id` that contains `gpa` or starts
    /// at or above it.
    #[must_use]
    pub fn get_next_region(&self, core_id: u16, gpa: u64) -> Option<&MemRegion> {
        self.regions
            .range((gpa + 1, 0)..)
            .map(|(_, r)| r)
            .find(|r| r.visible_to(core_id) && (r.contains(gpa) || r.guest_start >= gpa))
    }

    /// Inserts an overlay. Exact-duplicate ranges are allowed for distinct
    /// core ids; any partial overlap with a region of overlapping visibility
    /// is rejected. Callers invalidate cached translations afterwards.
    pub fn insert_region(&mut self, region: MemRegion) -> Result<RegionId> {
        if region.guest_start >= region.guest_end || region.flags.base() {
            return Err(VmmError::InvalidRegion);
        }

        for (_, existing) in self.regions.range((region.guest_start + 1, 0)..) {
            if existing.guest_start >= region.guest_end {
                break;
            }
            // Ranges intersect; only an exact-range, different-core overlay
            // is tolerable.
            let exact = existing.guest_start == region.guest_start
                && existing.guest_end == region.guest_end;
            if !exact || existing.core_id == region.core_id {
                error!(
                    "region [{:#x}, {:#x}) core {} overlaps [{:#x}, {:#x}) core {}",
                    region.guest_start,
                    region.guest_end,
                    region.core_id,
                    existing.guest_start,
                    existing.guest_end,
                    existing.core_id
                );
                return Err(VmmError::RegionOverlap);
            }
        }

        let id = RegionId {
            guest_end: region.guest_end,
            core_id: region.core_id,
        };
        let _ = self.regions.insert((region.guest_end, region.core_id), region);
        Ok(id)
    }

    /// Removes an overlay. Callers invalidate cached translations afterwards.
    pub fn remove_region(&mut self, id: RegionId) -> Option<MemRegion> {
        self.regions.remove(&(id.guest_end, id.core_id))
    }

    /// Looks up the overlay with the given id.
    #[must_use]
    pub fn region_by_id(&self, id: RegionId) -> Option<&MemRegion> {
        self.regions.get(&(id.guest_end, id.core_id))
    }

    /// Translates a guest physical address to host physical.
    pub fn gpa_to_hpa(&self, core_id: u16, gpa: u64) -> Result<u64> {
        let reg = self.get_region(core_id, gpa).ok_or(VmmError::NotMapped(gpa))?;
        if let Some(translate) = &reg.translate {
            return translate(gpa).ok_or(VmmError::NotMapped(gpa));
        }
        if !reg.flags.alloced() {
            return Err(VmmError::NotMapped(gpa));
        }
        Ok(reg.host_addr + (gpa - reg.guest_start))
    }

    /// Translates a host physical address back to guest physical by scanning
    /// the base blocks. Overlays are excluded; they shadow base mappings and
    /// the reverse mapping is only injective over the base layer.
    pub fn hpa_to_gpa(&self, hpa: u64) -> Result<u64> {
        for reg in &self.base_regions {
            let size = reg.guest_end - reg.guest_start;
            if (reg.host_addr..reg.host_addr + size).contains(&hpa) {
                return Ok(reg.guest_start + (hpa - reg.host_addr));
            }
        }
        Err(VmmError::NotMapped(hpa))
    }

    /// The largest natural page size usable for a mapping covering `gpa`,
    /// given the CPU mode and the core's large-page settings.
    ///
    /// A size qualifies when the whole aligned guest range is backed by
    /// host memory that is contiguous and whose base carries the same
    /// alignment, with no overlay shadowing any part of it.
    #[must_use]
    pub fn max_page_size(
        &self,
        core_id: u16,
        gpa: u64,
        mode: CpuMode,
        use_large: bool,
        use_giant: bool,
    ) -> u64 {
        match mode {
            CpuMode::Protected => {
                if use_large && self.range_promotable(core_id, gpa, PAGE_SIZE_4MB) {
                    return PAGE_SIZE_4MB;
                }
            }
            CpuMode::ProtectedPae => {
                if use_large && self.range_promotable(core_id, gpa, PAGE_SIZE_2MB) {
                    return PAGE_SIZE_2MB;
                }
            }
            CpuMode::Long | CpuMode::Long32Compat | CpuMode::Long16Compat => {
                if use_giant && self.range_promotable(core_id, gpa, PAGE_SIZE_1GB) {
                    return PAGE_SIZE_1GB;
                }
                if use_large && self.range_promotable(core_id, gpa, PAGE_SIZE_2MB) {
                    return PAGE_SIZE_2MB;
                }
            }
            CpuMode::Real => {}
        }
        PAGE_SIZE_4KB
    }

    /// Whether the `size`-aligned range around `gpa` maps to host memory
    /// contiguous and aligned enough for a `size` leaf.
    fn range_promotable(&self, core_id: u16, gpa: u64, size: u64) -> bool {
        let pg_start = gpa & !(size - 1);
        let pg_end = pg_start + size;

        if pg_end > self.mem_size {
            return false;
        }
        // Any overlay within the range defeats promotion: the overlay's
        // translation differs from the base blocks'.
        if let Some(next) = self.get_next_region(core_id, pg_start) {
            if next.guest_start < pg_end {
                return false;
            }
        }

        // The range may span several base blocks; they must chain
        // contiguously in host memory from an aligned start.
        let first = match self.get_base_region(pg_start) {
            Some(reg) => reg,
            None => return false,
        };
        let expect_base = first.host_addr + (pg_start - first.guest_start);
        if expect_base % size != 0 {
            return false;
        }

        let mut gpa_iter = pg_start;
        while gpa_iter < pg_end {
            let Some(reg) = self.get_base_region(gpa_iter) else {
                return false;
            };
            if reg.host_addr + (gpa_iter - reg.guest_start) != expect_base + (gpa_iter - pg_start) {
                return false;
            }
            gpa_iter = reg.guest_end.min(pg_end);
        }
        true
    }

    /// Copies bytes out of guest physical memory, crossing region boundaries
    /// as needed.
    pub fn read_gpa(&self, core_id: u16, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.for_each_chunk(core_id, gpa, buf.len(), |hpa, off, len, host| {
            let src = host.hpa_to_hva(hpa);
            // Safety: `hpa` lies within an alloced region of at least `len`
            // remaining bytes; the host mapping is readable.
            unsafe {
                core::ptr::copy_nonoverlapping(src, buf[off..off + len].as_mut_ptr(), len);
            }
        })
    }

    /// Copies bytes into guest physical memory.
    pub fn write_gpa(&self, core_id: u16, gpa: u64, buf: &[u8]) -> Result<()> {
        self.for_each_chunk(core_id, gpa, buf.len(), |hpa, off, len, host| {
            let dst = host.hpa_to_hva(hpa);
            // Safety: as in `read_gpa`, plus the region was checked alloced.
            unsafe {
                core::ptr::copy_nonoverlapping(buf[off..off + len].as_ptr(), dst, len);
            }
        })
    }

    fn for_each_chunk(
        &self,
        core_id: u16,
        gpa: u64,
        len: usize,
        mut f: impl FnMut(u64, usize, usize, &dyn VmmHost),
    ) -> Result<()> {
        let mut off = 0usize;
        while off < len {
            let cur = gpa + off as u64;
            let reg = self.get_region(core_id, cur).ok_or(VmmError::NotMapped(cur))?;
            if !reg.flags.alloced() {
                return Err(VmmError::NotMapped(cur));
            }
            let chunk = ((reg.guest_end - cur) as usize).min(len - off);
            let hpa = reg.host_addr + (cur - reg.guest_start);
            f(hpa, off, chunk, self.host.as_ref());
            off += chunk;
        }
        Ok(())
    }

    /// Direct byte access to a backed guest frame, for emulation helpers.
    pub fn gpa_to_hva(&self, core_id: u16, gpa: u64) -> Result<*mut u8> {
        let hpa = self.gpa_to_hpa(core_id, gpa)?;
        Ok(self.host.hpa_to_hva(hpa))
    }
}

#[cfg(test)]
impl MemMap {
    /// Builds a map over fabricated base blocks, for promotion tests that
    /// never dereference the host addresses.
    pub(crate) fn testing_with_blocks(
        host: &Arc<dyn VmmHost>,
        block_size: u64,
        host_addrs: &[u64],
    ) -> Self {
        let mut flags = RegionFlags::rwx_alloced();
        flags.set_base(true);
        let base_regions = host_addrs
            .iter()
            .enumerate()
            .map(|(i, &host_addr)| MemRegion {
                guest_start: i as u64 * block_size,
                guest_end: (i as u64 + 1) * block_size,
                host_addr,
                flags,
                core_id: CORE_ANY,
                numa_id: None,
                handler: None,
                translate: None,
            })
            .collect::<Vec<_>>();
        Self {
            host: Arc::clone(host),
            block_size,
            mem_size: host_addrs.len() as u64 * block_size,
            base_regions,
            regions: BTreeMap::new(),
        }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        let block_pages = (self.block_size / PAGE_SIZE_4KB) as usize;
        for reg in &self.base_regions {
            self.host.free_pages(reg.host_addr, block_pages);
        }
    }
}

impl core::fmt::Debug for MemMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemMap")
            .field("mem_size", &format_args!("{:#x}", self.mem_size))
            .field("base_blocks", &self.base_regions.len())
            .field("overlays", &self.regions.len())
            .finish()
    }
}

/// Routes a faulting access to the region's handler, or reports it if the
/// region has none. Callers must not hold the memory-map lock; handlers may
/// take it themselves (e.g. to re-hook a relocated MMIO window).
pub(crate) fn dispatch_unhandled(
    vm: &Vm,
    core: &mut Vcpu,
    region: &MemRegion,
    gva: u64,
    gpa: u64,
    error_code: PfError,
) -> Result<()> {
    if let Some(handler) = &region.handler {
        handler.unhandled(vm, core, gva, gpa, region, error_code)
    } else {
        error!(
            "core {}: unhandled memory access (gpa={gpa:#x}, gva={gva:#x}, error={:#x})",
            core.vcpu_id, error_code.0
        );
        Err(VmmError::NotMapped(gpa))
    }
}

/// A device interface for fully hooked (unbacked) regions: every guest
/// access is emulated through these callbacks.
pub trait MmioHook: Send + Sync {
    fn mmio_read(&self, vm: &Vm, core: &mut Vcpu, gpa: u64, data: &mut [u8]) -> Result<()>;
    fn mmio_write(&self, vm: &Vm, core: &mut Vcpu, gpa: u64, data: &[u8]) -> Result<()>;
}

/// Adapts an [`MmioHook`] into a region fault handler by emulating the
/// faulting MOV: decode at RIP, move the data through the hook, advance RIP.
pub struct FullHookRegion {
    hook: Arc<dyn MmioHook>,
}

impl FullHookRegion {
    #[must_use]
    pub fn new(hook: Arc<dyn MmioHook>) -> Self {
        Self { hook }
    }
}

impl RegionHandler for FullHookRegion {
    fn unhandled(
        &self,
        vm: &Vm,
        core: &mut Vcpu,
        _gva: u64,
        gpa: u64,
        _region: &MemRegion,
        _error_code: PfError,
    ) -> Result<()> {
        use crate::cpu::CpuMode;
        use crate::decode::{decode_mem_mov, fetch_instr};

        let bytes = fetch_instr(vm, core)?;
        let long_mode = core.cpu_mode == CpuMode::Long;
        let default_addr32 = core.segments.cs.db;
        let mov = decode_mem_mov(&bytes, long_mode, default_addr32)?;

        let width = mov.width as usize;
        if mov.write {
            let value = match (mov.imm, mov.gpr) {
                (Some(imm), _) => imm,
                (None, Some(gpr)) => core.regs.gpr(gpr),
                (None, None) => return Err(VmmError::DecodeFailed),
            };
            self.hook.mmio_write(vm, core, gpa, &value.to_le_bytes()[..width])?;
        } else {
            let mut data = [0u8; 8];
            self.hook.mmio_read(vm, core, gpa, &mut data[..width])?;
            let value = u64::from_le_bytes(data);
            let gpr = mov.gpr.ok_or(VmmError::DecodeFailed)?;
            let merged = match width {
                // A 32-bit destination zeroes the upper half; narrower
                // widths merge into the existing register value.
                8 | 4 => value,
                2 => (core.regs.gpr(gpr) & !0xffff) | value,
                _ => (core.regs.gpr(gpr) & !0xff) | value,
            };
            core.regs.set_gpr(gpr, merged);
        }

        core.rip += u64::from(mov.len);
        Ok(())
    }
}
