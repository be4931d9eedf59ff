//! Guest physical memory map.
//!
//! A small table of GPA → HVA slots. Each slot owns a zeroed,
//! mmap-backed [`GuestMemoryMmap`] region and is installed with the
//! backend at [`add_region`](MemoryMap::add_region) time; any guest
//! address not covered by a slot traps out of the guest as MMIO.
//!
//! Within a slot the mapping is a plain offset: for a GPA `g` inside slot
//! `S`, the host address is `S.host_base + (g - S.gpa_base)`. Accesses
//! must lie wholly within one slot; nothing here is atomic across a slot
//! boundary (such accesses fail instead). Slots are added only while the
//! VM is being built and never shrink or move afterwards, which is what
//! lets vCPU threads share the map read-only.

use crate::hv::{HvError, MemSlot, VmHandle, SLOT_EXEC, SLOT_READ, SLOT_WRITE};
use log::{debug, info, warn};
use thiserror::Error;
use vm_memory::{Bytes, ByteValued, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Guest page size; slot bases are aligned down to this.
pub const PAGE_SIZE: u64 = 4096;

/// Maximum number of memory slots per VM.
pub const MAX_SLOTS: usize = 32;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no free memory slot (max {MAX_SLOTS})")]
    NoSlot,

    #[error("region {gpa:#x}+{size:#x} overlaps slot {slot}")]
    Overlap { gpa: u64, size: u64, slot: u32 },

    #[error("failed to allocate guest memory: {0}")]
    OutOfMemory(String),

    #[error("backend rejected memory slot")]
    BackendMap(#[source] HvError),

    #[error("GPA range {gpa:#x}+{size:#x} is not mapped")]
    OutOfBounds { gpa: u64, size: u64 },

    #[error("guest memory access failed: {0}")]
    Access(#[source] vm_memory::GuestMemoryError),
}

/// One installed slot and its backing store.
struct MemRegion {
    slot: u32,
    gpa: u64,
    size: u64,
    mem: GuestMemoryMmap,
}

/// The guest physical memory map.
#[derive(Default)]
pub struct MemoryMap {
    regions: Vec<MemRegion>,
    total_size: u64,
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap::default()
    }

    /// Allocate a zeroed host buffer of `size` bytes, install it with the
    /// backend under the lowest free slot index, and record the slot.
    ///
    /// The base is aligned down to a page and the size up; the resulting
    /// range must not overlap any existing slot.
    pub fn add_region(
        &mut self,
        vm: &dyn VmHandle,
        gpa: u64,
        size: u64,
    ) -> Result<u32, MemoryError> {
        if size == 0 {
            return Err(MemoryError::OutOfMemory("zero-sized region".to_string()));
        }
        let gpa = gpa & !(PAGE_SIZE - 1);
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        for region in &self.regions {
            if gpa < region.gpa + region.size && region.gpa < gpa + size {
                return Err(MemoryError::Overlap {
                    gpa,
                    size,
                    slot: region.slot,
                });
            }
        }

        let slot = self.lowest_free_slot().ok_or(MemoryError::NoSlot)?;

        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(gpa), size as usize)])
            .map_err(|e| MemoryError::OutOfMemory(e.to_string()))?;
        let host_addr = mem
            .get_host_address(GuestAddress(gpa))
            .map_err(MemoryError::Access)? as u64;

        vm.map_region(&MemSlot {
            slot,
            gpa,
            size,
            host_addr,
            flags: SLOT_READ | SLOT_WRITE | SLOT_EXEC,
        })
        .map_err(MemoryError::BackendMap)?;

        self.regions.push(MemRegion {
            slot,
            gpa,
            size,
            mem,
        });
        self.total_size += size;

        info!(
            "added memory region: slot {} GPA {:#x} ({} MiB)",
            slot,
            gpa,
            size / (1024 * 1024)
        );
        Ok(slot)
    }

    fn lowest_free_slot(&self) -> Option<u32> {
        (0..MAX_SLOTS as u32).find(|id| !self.regions.iter().any(|r| r.slot == *id))
    }

    /// The slot wholly containing `[gpa, gpa + size)`, if any.
    fn region_for(&self, gpa: u64, size: u64) -> Option<&MemRegion> {
        let end = gpa.checked_add(size)?;
        self.regions
            .iter()
            .find(|r| gpa >= r.gpa && end <= r.gpa + r.size)
    }

    /// Translate a GPA to a host virtual address for an access of `size`
    /// bytes. Fails unless the whole range lies within one slot.
    pub fn translate(&self, gpa: u64, size: u64) -> Result<u64, MemoryError> {
        let region = self
            .region_for(gpa, size)
            .ok_or(MemoryError::OutOfBounds { gpa, size })?;
        let host = region
            .mem
            .get_host_address(GuestAddress(gpa))
            .map_err(MemoryError::Access)?;
        Ok(host as u64)
    }

    /// Copy guest memory at `gpa` into `buf`.
    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let region = self
            .region_for(gpa, buf.len() as u64)
            .ok_or(MemoryError::OutOfBounds {
                gpa,
                size: buf.len() as u64,
            })?;
        region
            .mem
            .read_slice(buf, GuestAddress(gpa))
            .map_err(MemoryError::Access)
    }

    /// Copy `buf` into guest memory at `gpa`.
    pub fn write(&self, gpa: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let region = self
            .region_for(gpa, buf.len() as u64)
            .ok_or(MemoryError::OutOfBounds {
                gpa,
                size: buf.len() as u64,
            })?;
        region
            .mem
            .write_slice(buf, GuestAddress(gpa))
            .map_err(MemoryError::Access)
    }

    /// Read a plain-bytes value from guest memory.
    pub fn read_obj<T: ByteValued>(&self, gpa: u64) -> Result<T, MemoryError> {
        let region = self
            .region_for(gpa, std::mem::size_of::<T>() as u64)
            .ok_or(MemoryError::OutOfBounds {
                gpa,
                size: std::mem::size_of::<T>() as u64,
            })?;
        region
            .mem
            .read_obj(GuestAddress(gpa))
            .map_err(MemoryError::Access)
    }

    /// Write a plain-bytes value into guest memory.
    pub fn write_obj<T: ByteValued>(&self, val: T, gpa: u64) -> Result<(), MemoryError> {
        let region = self
            .region_for(gpa, std::mem::size_of::<T>() as u64)
            .ok_or(MemoryError::OutOfBounds {
                gpa,
                size: std::mem::size_of::<T>() as u64,
            })?;
        region
            .mem
            .write_obj(val, GuestAddress(gpa))
            .map_err(MemoryError::Access)
    }

    /// The `vm-memory` view of the slot containing `gpa`, for collaborators
    /// (the kernel loader) that write images straight into RAM.
    pub fn region_at(&self, gpa: u64) -> Option<&GuestMemoryMmap> {
        self.region_for(gpa, 1).map(|r| &r.mem)
    }

    /// Total bytes of guest RAM across all slots.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of installed slots.
    pub fn num_slots(&self) -> usize {
        self.regions.len()
    }

    /// Uninstall every slot from the backend, newest first. Host buffers
    /// are released when the map drops.
    pub fn destroy(&mut self, vm: &dyn VmHandle) {
        for region in self.regions.drain(..).rev() {
            if let Err(e) = vm.unmap_region(region.slot) {
                warn!("failed to unmap slot {}: {e}", region.slot);
            } else {
                debug!("unmapped slot {}", region.slot);
            }
        }
        self.total_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::testing::FakeVm;

    #[test]
    fn translation_is_a_slot_offset() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        map.add_region(&vm, 0x1_0000, 0x4000).unwrap();

        let base = map.translate(0x1_0000, 1).unwrap();
        assert_eq!(map.translate(0x1_0400, 4).unwrap(), base + 0x400);
        assert_eq!(map.translate(0x1_3fff, 1).unwrap(), base + 0x3fff);

        // Outside any slot.
        assert!(map.translate(0x0, 1).is_err());
        assert!(map.translate(0x1_4000, 1).is_err());
    }

    #[test]
    fn access_must_fit_within_one_slot() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        map.add_region(&vm, 0x1_0000, 0x1000).unwrap();

        // 4-byte access starting 2 bytes before the end of the slot.
        assert!(matches!(
            map.translate(0x1_0ffe, 4),
            Err(MemoryError::OutOfBounds { .. })
        ));
        let mut buf = [0u8; 4];
        assert!(map.read(0x1_0ffe, &mut buf).is_err());
    }

    #[test]
    fn adjacent_slots_do_not_merge() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        map.add_region(&vm, 0x0, 0x1000).unwrap();
        map.add_region(&vm, 0x1000, 0x1000).unwrap();

        // A straddling access fails even though both sides are mapped.
        assert!(map.translate(0xffe, 4).is_err());
        assert!(map.translate(0xffc, 4).is_ok());
        assert!(map.translate(0x1000, 4).is_ok());
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        map.add_region(&vm, 0x1_0000, 0x4000).unwrap();

        assert!(matches!(
            map.add_region(&vm, 0x1_2000, 0x4000),
            Err(MemoryError::Overlap { .. })
        ));
        assert!(matches!(
            map.add_region(&vm, 0x0_f000, 0x2000),
            Err(MemoryError::Overlap { .. })
        ));
        // Exactly adjacent is fine.
        assert!(map.add_region(&vm, 0x1_4000, 0x1000).is_ok());
    }

    #[test]
    fn base_is_page_aligned_down() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        map.add_region(&vm, 0x1234, 0x1000).unwrap();
        assert!(map.translate(0x1000, 1).is_ok());

        let mapped = vm.mapped.lock().unwrap();
        assert_eq!(mapped[0].gpa, 0x1000);
        assert_eq!(mapped[0].size % PAGE_SIZE, 0);
        assert_ne!(mapped[0].host_addr, 0);
    }

    #[test]
    fn slot_indices_are_lowest_free() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        let a = map.add_region(&vm, 0x0, 0x1000).unwrap();
        let b = map.add_region(&vm, 0x10_0000, 0x1000).unwrap();
        assert_eq!((a, b), (0, 1));
    }

    #[test]
    fn slot_table_is_bounded() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        for i in 0..MAX_SLOTS as u64 {
            map.add_region(&vm, i * 0x10_0000, 0x1000).unwrap();
        }
        assert!(matches!(
            map.add_region(&vm, 0x4000_0000, 0x1000),
            Err(MemoryError::NoSlot)
        ));
    }

    #[test]
    fn read_write_roundtrip() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        map.add_region(&vm, 0x0, 0x2000).unwrap();

        map.write(0x100, b"roost").unwrap();
        let mut buf = [0u8; 5];
        map.read(0x100, &mut buf).unwrap();
        assert_eq!(&buf, b"roost");

        map.write_obj(0xdead_beef_u32, 0x200).unwrap();
        assert_eq!(map.read_obj::<u32>(0x200).unwrap(), 0xdead_beef);

        // Fresh memory reads back zeroed.
        assert_eq!(map.read_obj::<u64>(0x1000).unwrap(), 0);
    }

    #[test]
    fn destroy_unmaps_newest_first() {
        let vm = FakeVm::default();
        let mut map = MemoryMap::new();
        map.add_region(&vm, 0x0, 0x1000).unwrap();
        map.add_region(&vm, 0x10_0000, 0x1000).unwrap();
        map.add_region(&vm, 0x20_0000, 0x1000).unwrap();

        map.destroy(&vm);
        assert_eq!(*vm.unmapped.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(map.num_slots(), 0);
    }
}
