// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest memory management.
//!
//! Allocates anonymous host memory, registers it with KVM as guest
//! physical slots and offers bounds-checked access to guest bytes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{
    Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap, GuestMemoryRegion, GuestRegionMmap,
    MemoryRegionAddress, MmapRegion,
};

const PAGE_SIZE: u64 = 4096;

/// Memory manager errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// An address or size is not page aligned.
    #[error("0x{0:x} is not a multiple of the 4 KiB page size")]
    Alignment(u64),
    /// Zero-sized slots cannot be registered.
    #[error("guest memory slots must have a non-zero size")]
    Size,
    /// The new slot intersects an existing one.
    #[error("range [0x{gpa:x}, +0x{size:x}) overlaps slot {slot}")]
    Overlap { gpa: u64, size: u64, slot: u32 },
    /// Host memory allocation failed.
    #[error("failed to mmap {0} bytes of guest memory: {1}")]
    Mmap(u64, vm_memory::mmap::MmapRegionError),
    /// The mmap region could not be turned into a guest region.
    #[error("bad guest region: {0}")]
    Region(#[from] vm_memory::Error),
    /// KVM refused the slot.
    #[error("KVM_SET_USER_MEMORY_REGION failed: {0}")]
    Registration(kvm_ioctls::Error),
    /// An access touched memory outside every registered slot.
    #[error("guest address range [0x{gpa:x}, +0x{len:x}) is not mapped")]
    Unmapped { gpa: u64, len: u64 },
    /// Backend access failure.
    #[error("guest memory access failed: {0}")]
    Access(#[from] GuestMemoryError),
    /// A boot blob could not be read from disk.
    #[error("failed to load {}: {1}", .0.display())]
    LoadFile(PathBuf, std::io::Error),
}

type Result<T> = std::result::Result<T, MemoryError>;

/// A guest physical range backed by a host mapping and registered with KVM.
#[derive(Clone, Copy, Debug)]
pub struct MemorySlot {
    pub slot_id: u32,
    pub gpa: u64,
    pub size: u64,
    pub hva: u64,
    pub flags: u32,
}

impl MemorySlot {
    fn contains(&self, gpa: u64, len: u64) -> bool {
        gpa >= self.gpa && len <= self.size && gpa - self.gpa <= self.size - len
    }
}

/// Owns the guest RAM slots of a VM.
///
/// Slot ids are handed out sequentially and stay fixed for the VM's
/// lifetime; a slot is removed by re-registering it with size 0, which
/// is what [`MemoryManager::cleanup`] does for every slot at teardown.
pub struct MemoryManager {
    vm: Arc<VmFd>,
    slots: Vec<MemorySlot>,
    regions: Vec<Arc<GuestRegionMmap>>,
    next_slot_id: u32,
}

impl MemoryManager {
    pub fn new(vm: Arc<VmFd>) -> Self {
        MemoryManager {
            vm,
            slots: Vec::new(),
            regions: Vec::new(),
            next_slot_id: 0,
        }
    }

    /// Allocate anonymous host memory and register it as guest RAM.
    pub fn add_ram(&mut self, gpa: u64, size: u64) -> Result<MemorySlot> {
        if gpa % PAGE_SIZE != 0 {
            return Err(MemoryError::Alignment(gpa));
        }
        if size % PAGE_SIZE != 0 {
            return Err(MemoryError::Alignment(size));
        }
        if size == 0 {
            return Err(MemoryError::Size);
        }
        for slot in &self.slots {
            if gpa < slot.gpa + slot.size && slot.gpa < gpa + size {
                return Err(MemoryError::Overlap {
                    gpa,
                    size,
                    slot: slot.slot_id,
                });
            }
        }

        let mapping = MmapRegion::new(size as usize).map_err(|e| MemoryError::Mmap(size, e))?;
        let region = GuestRegionMmap::new(mapping, GuestAddress(gpa))?;
        let hva = region.get_host_address(MemoryRegionAddress(0))? as u64;

        let slot = MemorySlot {
            slot_id: self.next_slot_id,
            gpa,
            size,
            hva,
            flags: 0,
        };
        let kvm_region = kvm_userspace_memory_region {
            slot: slot.slot_id,
            flags: slot.flags,
            guest_phys_addr: slot.gpa,
            memory_size: slot.size,
            userspace_addr: slot.hva,
        };
        // SAFETY: the mapping is owned by `region`, which lives in
        // `self.regions` until cleanup() has unregistered the slot.
        // If registration fails, `region` is dropped (and unmapped) here.
        unsafe { self.vm.set_user_memory_region(kvm_region) }
            .map_err(MemoryError::Registration)?;

        log::debug!(
            "memory slot {}: GPA 0x{:08x} + 0x{:x} -> HVA 0x{:x}",
            slot.slot_id,
            slot.gpa,
            slot.size,
            slot.hva
        );
        self.next_slot_id += 1;
        self.regions.push(Arc::new(region));
        self.slots.push(slot);
        Ok(slot)
    }

    /// Find the slot fully containing `[gpa, gpa + len)`.
    ///
    /// An access straddling the end of a slot is unmapped even when an
    /// adjacent slot continues the range.
    fn slot_index(&self, gpa: u64, len: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.contains(gpa, len))
    }

    /// Translate a guest physical address to a host virtual address.
    pub fn gpa_to_hva(&self, gpa: u64) -> Option<u64> {
        self.slots
            .iter()
            .find(|s| gpa >= s.gpa && gpa < s.gpa + s.size)
            .map(|s| s.hva + (gpa - s.gpa))
    }

    /// Read `len` bytes of guest memory.
    pub fn read(&self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        let idx = self
            .slot_index(gpa, len as u64)
            .ok_or(MemoryError::Unmapped {
                gpa,
                len: len as u64,
            })?;
        let mut buf = vec![0u8; len];
        self.regions[idx].read_slice(&mut buf, MemoryRegionAddress(gpa - self.slots[idx].gpa))?;
        Ok(buf)
    }

    /// Write bytes to guest memory.
    pub fn write(&self, gpa: u64, data: &[u8]) -> Result<()> {
        let idx = self
            .slot_index(gpa, data.len() as u64)
            .ok_or(MemoryError::Unmapped {
                gpa,
                len: data.len() as u64,
            })?;
        self.regions[idx].write_slice(data, MemoryRegionAddress(gpa - self.slots[idx].gpa))?;
        Ok(())
    }

    /// Load a file into guest memory, returning the number of bytes written.
    pub fn load_file(&self, gpa: u64, path: &Path) -> Result<usize> {
        let data = fs::read(path).map_err(|e| MemoryError::LoadFile(path.to_path_buf(), e))?;
        self.write(gpa, &data)?;
        Ok(data.len())
    }

    /// A `vm-memory` view over all slots, for virtqueue users.
    pub fn guest_memory(&self) -> Result<GuestMemoryMmap> {
        Ok(GuestMemoryMmap::from_arc_regions(self.regions.clone())?)
    }

    pub fn slots(&self) -> &[MemorySlot] {
        &self.slots
    }

    /// Unregister every slot from KVM. The host mappings are released
    /// when the manager (and any outstanding guest-memory views) drop.
    pub fn cleanup(&mut self) {
        for slot in &self.slots {
            let region = kvm_userspace_memory_region {
                slot: slot.slot_id,
                flags: 0,
                guest_phys_addr: slot.gpa,
                memory_size: 0,
                userspace_addr: 0,
            };
            // SAFETY: a zero-sized region removes the slot; no host
            // memory is handed to the kernel.
            if let Err(e) = unsafe { self.vm.set_user_memory_region(region) } {
                log::warn!("failed to unregister memory slot {}: {}", slot.slot_id, e);
            }
        }
        self.slots.clear();
        self.regions.clear();
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_ioctls::Kvm;

    // These tests register real slots, so they need /dev/kvm; hosts
    // without it skip them.
    fn test_manager() -> Option<MemoryManager> {
        let kvm = Kvm::new().ok()?;
        let vm = kvm.create_vm().ok()?;
        Some(MemoryManager::new(Arc::new(vm)))
    }

    #[test]
    fn test_add_ram_rejects_unaligned() {
        let Some(mut mm) = test_manager() else { return };
        assert!(matches!(
            mm.add_ram(0x4000_0100, 0x1000),
            Err(MemoryError::Alignment(0x4000_0100))
        ));
        assert!(matches!(
            mm.add_ram(0x4000_0000, 0x800),
            Err(MemoryError::Alignment(0x800))
        ));
    }

    #[test]
    fn test_add_ram_rejects_empty() {
        let Some(mut mm) = test_manager() else { return };
        assert!(matches!(mm.add_ram(0x4000_0000, 0), Err(MemoryError::Size)));
    }

    #[test]
    fn test_add_ram_rejects_overlap() {
        let Some(mut mm) = test_manager() else { return };
        mm.add_ram(0x4000_0000, 0x10_0000).unwrap();
        assert!(matches!(
            mm.add_ram(0x4008_0000, 0x10_0000),
            Err(MemoryError::Overlap { .. })
        ));
    }

    #[test]
    fn test_read_write_round_trip() {
        let Some(mut mm) = test_manager() else { return };
        mm.add_ram(0x4000_0000, 0x10_0000).unwrap();
        let data = b"kestrel round trip";
        mm.write(0x4000_2000, data).unwrap();
        assert_eq!(mm.read(0x4000_2000, data.len()).unwrap(), data);
    }

    #[test]
    fn test_access_must_not_straddle_slot_end() {
        let Some(mut mm) = test_manager() else { return };
        mm.add_ram(0x4000_0000, 0x1000).unwrap();
        // Adjacent second slot: the range is backed, but not by one slot.
        mm.add_ram(0x4000_1000, 0x1000).unwrap();
        assert!(matches!(
            mm.read(0x4000_0ff8, 16),
            Err(MemoryError::Unmapped { .. })
        ));
        assert!(matches!(
            mm.write(0x4000_0ff8, &[0u8; 16]),
            Err(MemoryError::Unmapped { .. })
        ));
    }

    #[test]
    fn test_load_file() {
        use std::io::Write;
        let Some(mut mm) = test_manager() else { return };
        mm.add_ram(0x4000_0000, 0x1000).unwrap();

        let temp = vmm_sys_util::tempfile::TempFile::new().unwrap();
        temp.as_file().write_all(b"boot blob").unwrap();
        let loaded = mm.load_file(0x4000_0000, temp.as_path()).unwrap();
        assert_eq!(loaded, 9);
        assert_eq!(mm.read(0x4000_0000, 9).unwrap(), b"boot blob");
    }

    #[test]
    fn test_unmapped_access_fails() {
        let Some(mut mm) = test_manager() else { return };
        mm.add_ram(0x4000_0000, 0x1000).unwrap();
        assert!(mm.read(0x5000_0000, 4).is_err());
        assert!(mm.gpa_to_hva(0x5000_0000).is_none());
    }

    #[test]
    fn test_gpa_to_hva_offsets() {
        let Some(mut mm) = test_manager() else { return };
        let slot = mm.add_ram(0x4000_0000, 0x2000).unwrap();
        assert_eq!(mm.gpa_to_hva(0x4000_0000), Some(slot.hva));
        assert_eq!(mm.gpa_to_hva(0x4000_1234), Some(slot.hva + 0x1234));
        assert_eq!(mm.gpa_to_hva(0x4000_2000), None);
    }

    #[test]
    fn test_slot_ids_sequential() {
        let Some(mut mm) = test_manager() else { return };
        assert_eq!(mm.add_ram(0x4000_0000, 0x1000).unwrap().slot_id, 0);
        assert_eq!(mm.add_ram(0x5000_0000, 0x1000).unwrap().slot_id, 1);
    }
}
