// SPDX-License-Identifier: Apache-2.0

//! Virtio console device type.
//!
//! Queue 0 receives (host to guest), queue 1 transmits (guest to
//! host). TX chains are drained to the output sink as soon as the
//! guest kicks the queue; host input is buffered until the guest has
//! posted RX buffers.

use std::collections::VecDeque;
use std::io::Write;

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::mmio::{VirtioDevice, INT_USED_RING, VIRTIO_ID_CONSOLE};
use super::queue::{QueueError, Virtqueue};

const QUEUE_RX: u16 = 0;
const QUEUE_TX: u16 = 1;

/// Feature bit numbers.
const VIRTIO_F_VERSION_1: u64 = 32;
const VIRTIO_CONSOLE_F_EMERG_WRITE: u64 = 2;

pub struct Console {
    out: Box<dyn Write + Send>,
    input: VecDeque<u8>,
}

impl Console {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Console {
            out,
            input: VecDeque::new(),
        }
    }

    /// Drain guest transmissions to the output sink.
    fn process_tx(
        &mut self,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<u32, QueueError> {
        let queue = &mut queues[QUEUE_TX as usize];
        if !queue.ready {
            log::warn!("virtio-console: TX kick before queue is ready");
            return Ok(0);
        }

        let mut processed = false;
        while let Some(head) = queue.get_next_request(mem)? {
            let mut data = Vec::new();
            for desc in queue.follow_chain(mem, head)? {
                // The device only reads TX buffers.
                if desc.is_write_only() {
                    log::warn!("virtio-console: write-only descriptor in TX chain");
                    continue;
                }
                let mut buf = vec![0u8; desc.len as usize];
                mem.read_slice(&mut buf, GuestAddress(desc.addr))?;
                data.extend_from_slice(&buf);
            }
            if !data.is_empty() && (self.out.write_all(&data).is_err() || self.out.flush().is_err())
            {
                log::warn!("virtio-console: dropped {} output bytes", data.len());
            }
            queue.put_used(mem, head, 0)?;
            processed = true;
        }
        Ok(if processed { INT_USED_RING } else { 0 })
    }

    /// Copy buffered host input into guest RX buffers.
    fn process_rx(
        &mut self,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<u32, QueueError> {
        let queue = &mut queues[QUEUE_RX as usize];
        if !queue.ready || self.input.is_empty() {
            return Ok(0);
        }

        let mut processed = false;
        while !self.input.is_empty() {
            let head = match queue.get_next_request(mem)? {
                Some(head) => head,
                None => break,
            };
            let mut written = 0u32;
            for desc in queue.follow_chain(mem, head)? {
                // The device only writes RX buffers.
                if !desc.is_write_only() {
                    log::warn!("virtio-console: read-only descriptor in RX chain");
                    continue;
                }
                let count = self.input.len().min(desc.len as usize);
                if count == 0 {
                    break;
                }
                let chunk: Vec<u8> = self.input.drain(..count).collect();
                mem.write_slice(&chunk, GuestAddress(desc.addr))?;
                written += count as u32;
            }
            queue.put_used(mem, head, written)?;
            processed = true;
        }
        Ok(if processed { INT_USED_RING } else { 0 })
    }
}

impl VirtioDevice for Console {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_CONSOLE
    }

    fn device_features(&self) -> u64 {
        (1 << VIRTIO_F_VERSION_1) | (1 << VIRTIO_CONSOLE_F_EMERG_WRITE)
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn queue_notify(
        &mut self,
        queue: u16,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<u32, QueueError> {
        match queue {
            QUEUE_TX => self.process_tx(queues, mem),
            // An RX kick means fresh buffers: flush pending input.
            QUEUE_RX => self.process_rx(queues, mem),
            other => {
                log::warn!("virtio-console: notify for unknown queue {}", other);
                Ok(0)
            }
        }
    }

    fn deliver_input(
        &mut self,
        data: &[u8],
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<u32, QueueError> {
        self.input.extend(data);
        self.process_rx(queues, mem)
    }

    fn reset(&mut self) {
        self.input.clear();
    }
}
