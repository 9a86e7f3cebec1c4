// SPDX-License-Identifier: Apache-2.0

//! Split-ring virtqueue engine.
//!
//! Implements the virtio 1.x split-ring layout: a descriptor table, an
//! available ring written by the guest driver and a used ring written
//! by the device. All ring structures live in guest memory and are
//! little endian.
//!
//! The guest controls every index and address in the rings, so each
//! descriptor index is bounds checked against the queue size and chain
//! walks detect cycles before touching memory.

use vm_memory::{Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

/// Descriptor chains to another descriptor through `next`.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Buffer is written by the device (read by the driver).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
/// Buffer holds an indirect descriptor table (not offered).
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Largest queue size offered through QUEUE_NUM_MAX.
pub const VIRTQ_MAX_SIZE: u16 = 256;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A chain walk revisited a descriptor.
    #[error("descriptor chain cycle at index {0}")]
    Cycle(u16),
    /// A chain references more descriptors than the queue holds.
    #[error("descriptor chain longer than the queue size ({0})")]
    ChainTooLong(u16),
    /// An index at or past the queue size was referenced.
    #[error("descriptor index {index} out of range (queue size {num})")]
    BadDescriptorIndex { index: u16, num: u16 },
    /// A ring address computation wrapped the guest address space.
    #[error("ring address overflow")]
    AddressOverflow,
    /// The ring points at unmapped guest memory.
    #[error("guest memory access failed: {0}")]
    Memory(#[from] GuestMemoryError),
}

type Result<T> = std::result::Result<T, QueueError>;

/// One entry of the descriptor table (16 bytes in guest memory).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    /// Whether the device writes this buffer (RX) or reads it (TX).
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// Device-side state of one virtqueue.
#[derive(Debug, Default)]
pub struct Virtqueue {
    pub index: u16,
    pub num: u16,
    pub ready: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    last_avail_idx: u16,
}

impl Virtqueue {
    pub fn new(index: u16) -> Self {
        Virtqueue {
            index,
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        let index = self.index;
        *self = Virtqueue::new(index);
    }

    fn checked_addr(base: u64, offset: u64) -> Result<GuestAddress> {
        base.checked_add(offset)
            .map(GuestAddress)
            .ok_or(QueueError::AddressOverflow)
    }

    /// Read descriptor `index` from the descriptor table.
    pub fn read_descriptor(&self, mem: &GuestMemoryMmap, index: u16) -> Result<Descriptor> {
        if index >= self.num {
            return Err(QueueError::BadDescriptorIndex {
                index,
                num: self.num,
            });
        }
        let base = Self::checked_addr(self.desc_addr, u64::from(index) * 16)?;
        Ok(Descriptor {
            addr: mem.read_obj::<u64>(base)?,
            len: mem.read_obj::<u32>(Self::checked_addr(base.0, 8)?)?,
            flags: mem.read_obj::<u16>(Self::checked_addr(base.0, 12)?)?,
            next: mem.read_obj::<u16>(Self::checked_addr(base.0, 14)?)?,
        })
    }

    /// Walk the chain starting at `head`, in order.
    pub fn follow_chain(&self, mem: &GuestMemoryMmap, head: u16) -> Result<Vec<Descriptor>> {
        let mut chain = Vec::new();
        let mut visited = vec![false; self.num as usize];
        let mut index = head;
        loop {
            if index >= self.num {
                return Err(QueueError::BadDescriptorIndex {
                    index,
                    num: self.num,
                });
            }
            if chain.len() >= self.num as usize {
                return Err(QueueError::ChainTooLong(self.num));
            }
            if visited[index as usize] {
                return Err(QueueError::Cycle(index));
            }
            visited[index as usize] = true;
            let desc = self.read_descriptor(mem, index)?;
            chain.push(desc);
            if desc.has_next() {
                index = desc.next;
            } else {
                return Ok(chain);
            }
        }
    }

    fn avail_idx(&self, mem: &GuestMemoryMmap) -> Result<u16> {
        Ok(mem.read_obj::<u16>(Self::checked_addr(self.avail_addr, 2)?)?)
    }

    /// Pop the next descriptor-chain head from the available ring, if
    /// the driver has published one past our consumption point.
    pub fn get_next_request(&mut self, mem: &GuestMemoryMmap) -> Result<Option<u16>> {
        if self.num == 0 {
            return Ok(None);
        }
        if self.avail_idx(mem)? == self.last_avail_idx {
            return Ok(None);
        }
        let slot = u64::from(self.last_avail_idx % self.num);
        let head = mem.read_obj::<u16>(Self::checked_addr(self.avail_addr, 4 + slot * 2)?)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    /// Publish a completed chain in the used ring.
    pub fn put_used(&mut self, mem: &GuestMemoryMmap, head: u16, len: u32) -> Result<()> {
        if self.num == 0 {
            return Ok(());
        }
        let used_idx = mem.read_obj::<u16>(Self::checked_addr(self.used_addr, 2)?)?;
        let slot = u64::from(used_idx % self.num);
        let entry = Self::checked_addr(self.used_addr, 4 + slot * 8)?;
        mem.write_obj::<u32>(u32::from(head), entry)?;
        mem.write_obj::<u32>(len, Self::checked_addr(entry.0, 4)?)?;
        // The idx store is the commit: it must land after the entry.
        mem.write_obj::<u16>(
            used_idx.wrapping_add(1),
            Self::checked_addr(self.used_addr, 2)?,
        )?;
        Ok(())
    }
}
