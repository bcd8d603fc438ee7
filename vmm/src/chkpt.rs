//! The module containing the checkpoint registry and stream codec.
//!
//! Every subsystem that owns guest-visible state registers a tagged
//! contributor at VM init: a fixed-size record with save/load callbacks, or
//! a zero-copy raw range for page-granular bulk data (guest RAM blocks,
//! framebuffers). A checkpoint is the concatenation of all contributions as
//! a little-endian sequence of (tag, length, bytes) records; loading one
//! matches records back to contributors by tag.
//!
//! Saving a running VM is refused; the control plane stops or pauses the
//! machine first, so the state the records describe is quiescent.

use crate::{
    config::MAX_CHKPT_TAG_LEN,
    error::{Result, VmmError},
    vm::Vm,
};
use alloc::{string::String, sync::Arc, vec, vec::Vec};
use bit_vec::BitVec;
use log::{error, warn};
use spin::Mutex;

/// Save/load callbacks for one fixed-size record.
pub trait ChkptOps: Send + Sync {
    fn save(&self, vm: &Vm, buf: &mut Vec<u8>) -> Result<()>;
    fn load(&self, vm: &Vm, buf: &[u8]) -> Result<()>;
}

enum ChkptKind {
    Fixed(Arc<dyn ChkptOps>),
    /// Raw page-granular host range, copied without a callback.
    Raw { hpa: u64, len: usize },
}

struct ChkptEntry {
    tag: String,
    kind: ChkptKind,
}

/// The per-VM registry of checkpoint contributors.
#[derive(Default)]
pub struct ChkptRegistry {
    entries: Mutex<Vec<ChkptEntry>>,
}

impl ChkptRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a callback-backed record under `tag`.
    pub fn register(&self, tag: &str, ops: Arc<dyn ChkptOps>) -> Result<()> {
        self.insert(tag, ChkptKind::Fixed(ops))
    }

    /// Registers a zero-copy raw range under `tag`.
    pub fn register_nocopy(&self, tag: &str, hpa: u64, len: usize) -> Result<()> {
        self.insert(tag, ChkptKind::Raw { hpa, len })
    }

    fn insert(&self, tag: &str, kind: ChkptKind) -> Result<()> {
        if tag.is_empty() || tag.len() > MAX_CHKPT_TAG_LEN {
            return Err(VmmError::Config("checkpoint tag length invalid"));
        }
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.tag == tag) {
            return Err(VmmError::Config("checkpoint tag already registered"));
        }
        entries.push(ChkptEntry {
            tag: String::from(tag),
            kind,
        });
        Ok(())
    }

    /// Serializes every contribution into one stream.
    pub(crate) fn save(&self, vm: &Vm) -> Result<Vec<u8>> {
        let entries = self.entries.lock();
        let mut out = Vec::new();

        for entry in entries.iter() {
            let data = match &entry.kind {
                ChkptKind::Fixed(ops) => {
                    let mut buf = Vec::new();
                    ops.save(vm, &mut buf)?;
                    buf
                }
                ChkptKind::Raw { hpa, len } => {
                    let mut buf = vec![0u8; *len];
                    let src = vm.host().hpa_to_hva(*hpa);
                    // Safety: raw entries are registered over VMM-owned
                    // ranges (base blocks) that outlive the VM.
                    unsafe {
                        core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), *len);
                    }
                    buf
                }
            };

            out.extend_from_slice(&(entry.tag.len() as u16).to_le_bytes());
            out.extend_from_slice(entry.tag.as_bytes());
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Applies a stream produced by [`ChkptRegistry::save`].
    ///
    /// Records are matched by tag; a record no contributor claims fails the
    /// load, a missing record leaves that subsystem's state alone (with a
    /// warning, since that usually means a version mismatch).
    pub(crate) fn load(&self, vm: &Vm, data: &[u8]) -> Result<()> {
        let entries = self.entries.lock();
        let mut seen = BitVec::from_elem(entries.len(), false);
        let mut pos = 0usize;

        while pos < data.len() {
            let tag_len =
                u16::from_le_bytes(read_array(data, pos)?) as usize;
            pos += 2;
            if tag_len > MAX_CHKPT_TAG_LEN {
                return Err(VmmError::BadCheckpoint);
            }
            let tag = data.get(pos..pos + tag_len).ok_or(VmmError::BadCheckpoint)?;
            let tag = core::str::from_utf8(tag).map_err(|_| VmmError::BadCheckpoint)?;
            pos += tag_len;

            let len = u64::from_le_bytes(read_array(data, pos)?) as usize;
            pos += 8;
            let payload = data.get(pos..pos + len).ok_or(VmmError::BadCheckpoint)?;
            pos += len;

            let Some(index) = entries.iter().position(|e| e.tag == tag) else {
                error!("checkpoint stream names unknown subsystem {tag:?}");
                return Err(VmmError::BadCheckpoint);
            };
            seen.set(index, true);

            match &entries[index].kind {
                ChkptKind::Fixed(ops) => ops.load(vm, payload)?,
                ChkptKind::Raw { hpa, len } => {
                    if payload.len() != *len {
                        return Err(VmmError::BadCheckpoint);
                    }
                    let dst = vm.host().hpa_to_hva(*hpa);
                    // Safety: as in `save`.
                    unsafe {
                        core::ptr::copy_nonoverlapping(payload.as_ptr(), dst, *len);
                    }
                }
            }
        }

        for (index, entry) in entries.iter().enumerate() {
            if !seen[index] {
                warn!("checkpoint stream is missing subsystem {:?}", entry.tag);
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for ChkptRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChkptRegistry")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

fn read_array<const N: usize>(data: &[u8], pos: usize) -> Result<[u8; N]> {
    let slice = data.get(pos..pos + N).ok_or(VmmError::BadCheckpoint)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

/// A little-endian record writer for fixed checkpoint records.
#[derive(Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// The matching reader.
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn u8(&mut self) -> Result<u8> {
        let v = *self.data.get(self.pos).ok_or(VmmError::BadCheckpoint)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let v = u16::from_le_bytes(read_array(self.data, self.pos)?);
        self.pos += 2;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let v = u32::from_le_bytes(read_array(self.data, self.pos)?);
        self.pos += 4;
        Ok(v)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let v = u64::from_le_bytes(read_array(self.data, self.pos)?);
        self.pos += 8;
        Ok(v)
    }

    pub fn bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let slice = self
            .data
            .get(self.pos..self.pos + out.len())
            .ok_or(VmmError::BadCheckpoint)?;
        out.copy_from_slice(slice);
        self.pos += out.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::nested_test_vm;
    use core::sync::atomic::{AtomicU64, Ordering};

    struct Word(AtomicU64);

    impl ChkptOps for Word {
        fn save(&self, _vm: &Vm, buf: &mut Vec<u8>) -> Result<()> {
            buf.extend_from_slice(&self.0.load(Ordering::SeqCst).to_le_bytes());
            Ok(())
        }
        fn load(&self, _vm: &Vm, buf: &[u8]) -> Result<()> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(buf);
            self.0.store(u64::from_le_bytes(raw), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        let word = Arc::new(Word(AtomicU64::new(0x1122_3344_5566_7788)));
        vm.chkpt().register("test-word", word.clone()).unwrap();

        let stream = vm.chkpt().save(&vm).unwrap();

        word.0.store(0, Ordering::SeqCst);
        vm.chkpt().load(&vm, &stream).unwrap();
        assert_eq!(word.0.load(Ordering::SeqCst), 0x1122_3344_5566_7788);
    }

    #[test]
    fn raw_ranges_copy_guest_memory() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        let hpa = vm.mem_map().read().base_regions()[0].host_addr;
        vm.chkpt().register_nocopy("ram-0", hpa, 0x1000).unwrap();

        vm.mem_map().read().write_gpa(0, 0x10, &[0xde, 0xad]).unwrap();
        let stream = vm.chkpt().save(&vm).unwrap();

        vm.mem_map().read().write_gpa(0, 0x10, &[0, 0]).unwrap();
        vm.chkpt().load(&vm, &stream).unwrap();

        let mut back = [0u8; 2];
        vm.mem_map().read().read_gpa(0, 0x10, &mut back).unwrap();
        assert_eq!(back, [0xde, 0xad]);
    }

    #[test]
    fn unknown_tags_fail_the_load() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        let mut stream = Vec::new();
        stream.extend_from_slice(&4u16.to_le_bytes());
        stream.extend_from_slice(b"bogu");
        stream.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(vm.chkpt().load(&vm, &stream), Err(VmmError::BadCheckpoint));
    }

    #[test]
    fn oversized_tags_are_rejected() {
        let (vm, _) = nested_test_vm(0x10000, 0x10000);
        let long = "x".repeat(65);
        assert!(vm
            .chkpt()
            .register(&long, Arc::new(Word(AtomicU64::new(0))))
            .is_err());
    }
}
