// SPDX-License-Identifier: Apache-2.0

//! Virtio-MMIO transport, device version 2.
//!
//! The transport owns the virtqueues and the guest memory handle;
//! device types plug in through [`VirtioDevice`] and get handed the
//! queues on every notification. Queue-integrity failures are not
//! fatal to the VM: they are logged and surfaced to the guest through
//! the DEVICE_NEEDS_RESET status bit.

use vm_memory::GuestMemoryMmap;

use super::queue::{QueueError, Virtqueue, VIRTQ_MAX_SIZE};
use crate::devices::{Device, IrqLine};

// Register offsets.
const MAGIC_VALUE: u64 = 0x000;
const VERSION: u64 = 0x004;
const DEVICE_ID: u64 = 0x008;
const VENDOR_ID: u64 = 0x00c;
const DEVICE_FEATURES: u64 = 0x010;
const DEVICE_FEATURES_SEL: u64 = 0x014;
const DRIVER_FEATURES: u64 = 0x020;
const DRIVER_FEATURES_SEL: u64 = 0x024;
const QUEUE_SEL: u64 = 0x030;
const QUEUE_NUM_MAX: u64 = 0x034;
const QUEUE_NUM: u64 = 0x038;
const QUEUE_READY: u64 = 0x044;
const QUEUE_NOTIFY: u64 = 0x050;
const INTERRUPT_STATUS: u64 = 0x060;
const INTERRUPT_ACK: u64 = 0x064;
const STATUS: u64 = 0x070;
const QUEUE_DESC_LOW: u64 = 0x100;
const QUEUE_DESC_HIGH: u64 = 0x104;
const QUEUE_DRIVER_LOW: u64 = 0x110;
const QUEUE_DRIVER_HIGH: u64 = 0x114;
const QUEUE_DEVICE_LOW: u64 = 0x120;
const QUEUE_DEVICE_HIGH: u64 = 0x124;
const CONFIG_GENERATION: u64 = 0x0fc;
const CONFIG: u64 = 0x200;

/// "virt" in little-endian ASCII.
const VIRTIO_MAGIC: u32 = 0x7472_6976;
/// "QEMU" in little-endian ASCII, the conventional vendor id.
const VIRTIO_VENDOR: u32 = 0x554d_4551;
const VIRTIO_VERSION: u32 = 2;

/// Device type ids.
pub const VIRTIO_ID_CONSOLE: u32 = 3;

// Device status bits.
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;
pub const STATUS_NEEDS_RESET: u32 = 0x40;
pub const STATUS_FAILED: u32 = 0x80;

// Interrupt status bits.
pub const INT_USED_RING: u32 = 1;
pub const INT_CONFIG_CHANGE: u32 = 2;

/// A virtio device type behind the MMIO transport.
///
/// `queue_notify` and `deliver_input` return the interrupt-status bits
/// to raise; the transport owns the status register and the line.
pub trait VirtioDevice: Send {
    fn device_id(&self) -> u32;
    fn device_features(&self) -> u64;
    fn num_queues(&self) -> u16;
    fn queue_notify(
        &mut self,
        queue: u16,
        queues: &mut [Virtqueue],
        mem: &GuestMemoryMmap,
    ) -> Result<u32, QueueError>;
    /// Host-originated input (e.g. console RX bytes).
    fn deliver_input(
        &mut self,
        _data: &[u8],
        _queues: &mut [Virtqueue],
        _mem: &GuestMemoryMmap,
    ) -> Result<u32, QueueError> {
        Ok(0)
    }
    fn read_config(&self, _offset: u64, _size: u8) -> u64 {
        0
    }
    fn write_config(&mut self, _offset: u64, _size: u8, _value: u64) {}
    fn reset(&mut self) {}
}

/// The virtio-mmio register interface wrapped around a device type.
pub struct VirtioMmio<D: VirtioDevice> {
    base: u64,
    device: D,
    mem: GuestMemoryMmap,
    line: Box<dyn IrqLine>,
    queues: Vec<Virtqueue>,

    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    queue_sel: u32,
    status: u32,
    interrupt_status: u32,
    config_generation: u32,
    irq_asserted: bool,
}

impl<D: VirtioDevice> VirtioMmio<D> {
    pub fn new(base: u64, device: D, mem: GuestMemoryMmap, line: Box<dyn IrqLine>) -> Self {
        let queues = (0..device.num_queues()).map(Virtqueue::new).collect();
        VirtioMmio {
            base,
            device,
            mem,
            line,
            queues,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            queue_sel: 0,
            status: 0,
            interrupt_status: 0,
            config_generation: 0,
            irq_asserted: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Forward host input to the device (console RX path).
    pub fn send_input(&mut self, data: &[u8]) {
        let outcome = self
            .device
            .deliver_input(data, &mut self.queues, &self.mem);
        self.apply_notify_outcome(outcome);
    }

    fn selected_queue(&mut self) -> Option<&mut Virtqueue> {
        let sel = self.queue_sel as usize;
        if sel >= self.queues.len() {
            log::warn!("virtio-mmio: invalid queue selector {}", sel);
            return None;
        }
        Some(&mut self.queues[sel])
    }

    fn notify(&mut self, queue: u64) {
        if queue >= self.queues.len() as u64 {
            log::warn!("virtio-mmio: notify for unknown queue {}", queue);
            return;
        }
        let outcome = self
            .device
            .queue_notify(queue as u16, &mut self.queues, &self.mem);
        self.apply_notify_outcome(outcome);
    }

    fn apply_notify_outcome(&mut self, outcome: Result<u32, QueueError>) {
        match outcome {
            Ok(bits) => self.interrupt_status |= bits,
            Err(e) => {
                // A corrupt ring poisons this device, not the VM.
                log::error!("virtio-mmio: queue failure: {}", e);
                self.status |= STATUS_NEEDS_RESET;
            }
        }
        self.update_irq_line();
    }

    fn update_irq_line(&mut self) {
        let pending = self.interrupt_status != 0;
        if pending && !self.irq_asserted {
            self.line.set_level(true);
            self.irq_asserted = true;
        } else if !pending && self.irq_asserted {
            self.line.set_level(false);
            self.irq_asserted = false;
        }
    }

    fn reset_device(&mut self) {
        log::debug!("virtio-mmio: device reset");
        self.status = 0;
        self.interrupt_status = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.driver_features = 0;
        self.queue_sel = 0;
        for queue in &mut self.queues {
            queue.reset();
        }
        self.device.reset();
        self.update_irq_line();
    }

    fn set_low32(value: u64, low: u32) -> u64 {
        (value & !0xffff_ffff) | u64::from(low)
    }

    fn set_high32(value: u64, high: u32) -> u64 {
        (value & 0xffff_ffff) | (u64::from(high) << 32)
    }
}

impl<D: VirtioDevice> Device for VirtioMmio<D> {
    fn name(&self) -> &str {
        "virtio-mmio"
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        crate::layout::VIRTIO_STRIDE
    }

    fn read(&mut self, offset: u64, size: u8) -> u64 {
        match offset {
            MAGIC_VALUE => u64::from(VIRTIO_MAGIC),
            VERSION => u64::from(VIRTIO_VERSION),
            DEVICE_ID => u64::from(self.device.device_id()),
            VENDOR_ID => u64::from(VIRTIO_VENDOR),
            DEVICE_FEATURES => {
                let features = self.device.device_features();
                // Selector values past the two defined words read as 0.
                match self.device_features_sel {
                    0 => features & 0xffff_ffff,
                    1 => features >> 32,
                    _ => 0,
                }
            }
            QUEUE_NUM_MAX => u64::from(VIRTQ_MAX_SIZE),
            QUEUE_READY => match self.selected_queue() {
                Some(q) => u64::from(q.ready),
                None => 0,
            },
            INTERRUPT_STATUS => u64::from(self.interrupt_status),
            STATUS => u64::from(self.status),
            CONFIG_GENERATION => u64::from(self.config_generation),
            _ if offset >= CONFIG => self.device.read_config(offset - CONFIG, size),
            _ => {
                log::debug!("virtio-mmio: unhandled read at 0x{:03x}", offset);
                0
            }
        }
    }

    fn write(&mut self, offset: u64, size: u8, value: u64) {
        let value32 = value as u32;
        match offset {
            DEVICE_FEATURES_SEL => self.device_features_sel = value32,
            DRIVER_FEATURES => match self.driver_features_sel {
                0 => self.driver_features = Self::set_low32(self.driver_features, value32),
                1 => self.driver_features = Self::set_high32(self.driver_features, value32),
                _ => {}
            },
            DRIVER_FEATURES_SEL => self.driver_features_sel = value32,
            QUEUE_SEL => self.queue_sel = value32,
            QUEUE_NUM => {
                if let Some(queue) = self.selected_queue() {
                    if value32 > u32::from(VIRTQ_MAX_SIZE) {
                        log::warn!("virtio-mmio: queue size {} capped", value32);
                        queue.num = VIRTQ_MAX_SIZE;
                    } else {
                        queue.num = value32 as u16;
                    }
                }
            }
            QUEUE_READY => {
                if let Some(queue) = self.selected_queue() {
                    queue.ready = value32 != 0;
                    if queue.ready {
                        log::debug!(
                            "virtio-mmio: queue {} ready: num={} desc=0x{:x} avail=0x{:x} used=0x{:x}",
                            queue.index,
                            queue.num,
                            queue.desc_addr,
                            queue.avail_addr,
                            queue.used_addr
                        );
                    }
                }
            }
            QUEUE_NOTIFY => self.notify(value),
            INTERRUPT_ACK => {
                self.interrupt_status &= !value32;
                self.update_irq_line();
            }
            STATUS => {
                if value32 == 0 {
                    self.reset_device();
                } else {
                    self.status = value32;
                }
            }
            QUEUE_DESC_LOW => {
                if let Some(q) = self.selected_queue() {
                    q.desc_addr = Self::set_low32(q.desc_addr, value32);
                }
            }
            QUEUE_DESC_HIGH => {
                if let Some(q) = self.selected_queue() {
                    q.desc_addr = Self::set_high32(q.desc_addr, value32);
                }
            }
            QUEUE_DRIVER_LOW => {
                if let Some(q) = self.selected_queue() {
                    q.avail_addr = Self::set_low32(q.avail_addr, value32);
                }
            }
            QUEUE_DRIVER_HIGH => {
                if let Some(q) = self.selected_queue() {
                    q.avail_addr = Self::set_high32(q.avail_addr, value32);
                }
            }
            QUEUE_DEVICE_LOW => {
                if let Some(q) = self.selected_queue() {
                    q.used_addr = Self::set_low32(q.used_addr, value32);
                }
            }
            QUEUE_DEVICE_HIGH => {
                if let Some(q) = self.selected_queue() {
                    q.used_addr = Self::set_high32(q.used_addr, value32);
                }
            }
            _ if offset >= CONFIG => self.device.write_config(offset - CONFIG, size, value),
            _ => {
                log::debug!(
                    "virtio-mmio: unhandled write at 0x{:03x}: 0x{:x}",
                    offset,
                    value
                );
            }
        }
    }

    fn reset(&mut self) {
        self.reset_device();
    }
}
