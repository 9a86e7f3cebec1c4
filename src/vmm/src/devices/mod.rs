// SPDX-License-Identifier: Apache-2.0

//! Emulated device infrastructure: the MMIO device trait and the
//! address-dispatching registry.

pub mod uart;
pub mod virtio;

use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The new device's MMIO region intersects a registered one.
    #[error("{name} at [0x{base:x}, +0x{size:x}) overlaps {other}")]
    Overlap {
        name: String,
        base: u64,
        size: u64,
        other: String,
    },
}

/// A level-triggered interrupt line into the guest's interrupt
/// controller.
///
/// Devices hold a line handle, never the controller itself; the handle
/// stays valid for as long as the device may fire. Delivery failures
/// are reported by the implementation, not the caller.
pub trait IrqLine: Send {
    fn set_level(&self, level: bool);
}

/// An MMIO access decoded from a vCPU exit.
///
/// `data` carries the written value for writes; values narrower than 8
/// bytes occupy the low-order bytes (little-endian).
#[derive(Clone, Copy, Debug)]
pub struct MmioAccess {
    pub address: u64,
    pub size: u8,
    pub is_write: bool,
    pub data: u64,
}

/// Outcome of dispatching an MMIO access.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmioResult {
    /// Value to return to the guest for reads.
    pub data: u64,
    /// Whether any device claimed the access. Unhandled accesses read
    /// as zero; callers may promote them to errors in strict mode.
    pub handled: bool,
}

/// An emulated memory-mapped device.
pub trait Device: Send {
    fn name(&self) -> &str;
    /// Base guest physical address of the MMIO region.
    fn base(&self) -> u64;
    /// Size of the MMIO region in bytes.
    fn size(&self) -> u64;
    /// Handle a read of `size` bytes at `offset` from the base.
    fn read(&mut self, offset: u64, size: u8) -> u64;
    /// Handle a write of `size` bytes at `offset` from the base.
    fn write(&mut self, offset: u64, size: u8, value: u64);
    fn reset(&mut self) {}
}

/// Owns all registered devices and routes MMIO accesses to them.
///
/// The device list is small, so dispatch is a linear scan.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<Mutex<dyn Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Register a device, refusing address-range overlaps.
    pub fn register(&mut self, device: Arc<Mutex<dyn Device>>) -> Result<(), DeviceError> {
        let (name, base, size) = {
            let d = device.lock().unwrap();
            (d.name().to_string(), d.base(), d.size())
        };
        for existing in &self.devices {
            let e = existing.lock().unwrap();
            if base < e.base() + e.size() && e.base() < base + size {
                return Err(DeviceError::Overlap {
                    name,
                    base,
                    size,
                    other: e.name().to_string(),
                });
            }
        }
        log::info!("registered device {} at 0x{:08x}", name, base);
        self.devices.push(device);
        Ok(())
    }

    fn find(&self, address: u64) -> Option<&Arc<Mutex<dyn Device>>> {
        self.devices.iter().find(|d| {
            let d = d.lock().unwrap();
            address >= d.base() && address < d.base() + d.size()
        })
    }

    /// Dispatch an MMIO access to the device containing its address.
    pub fn handle_mmio(&self, access: MmioAccess) -> MmioResult {
        let device = match self.find(access.address) {
            Some(d) => d,
            None => {
                log::warn!(
                    "unhandled MMIO {} at 0x{:08x} (size {})",
                    if access.is_write { "write" } else { "read" },
                    access.address,
                    access.size
                );
                return MmioResult {
                    data: 0,
                    handled: false,
                };
            }
        };
        let mut d = device.lock().unwrap();
        let offset = access.address - d.base();
        if access.is_write {
            d.write(offset, access.size, access.data);
            MmioResult {
                data: 0,
                handled: true,
            }
        } else {
            MmioResult {
                data: d.read(offset, access.size),
                handled: true,
            }
        }
    }

    /// Reset every registered device to its initial state.
    pub fn reset_all(&self) {
        for device in &self.devices {
            device.lock().unwrap().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch {
        base: u64,
        size: u64,
        last: u64,
    }

    impl Device for Scratch {
        fn name(&self) -> &str {
            "scratch"
        }
        fn base(&self) -> u64 {
            self.base
        }
        fn size(&self) -> u64 {
            self.size
        }
        fn read(&mut self, offset: u64, _size: u8) -> u64 {
            self.last.wrapping_add(offset)
        }
        fn write(&mut self, _offset: u64, _size: u8, value: u64) {
            self.last = value;
        }
    }

    fn scratch(base: u64, size: u64) -> Arc<Mutex<Scratch>> {
        Arc::new(Mutex::new(Scratch {
            base,
            size,
            last: 0,
        }))
    }

    #[test]
    fn test_register_rejects_overlap() {
        let mut registry = DeviceRegistry::new();
        registry.register(scratch(0x1000, 0x1000)).unwrap();
        assert!(matches!(
            registry.register(scratch(0x1800, 0x1000)),
            Err(DeviceError::Overlap { .. })
        ));
        // Touching ranges are fine.
        registry.register(scratch(0x2000, 0x1000)).unwrap();
    }

    #[test]
    fn test_dispatch_routes_by_address() {
        let mut registry = DeviceRegistry::new();
        let dev = scratch(0x1000, 0x1000);
        registry.register(dev.clone()).unwrap();

        let result = registry.handle_mmio(MmioAccess {
            address: 0x1010,
            size: 4,
            is_write: true,
            data: 0xabcd,
        });
        assert!(result.handled);
        assert_eq!(dev.lock().unwrap().last, 0xabcd);

        let result = registry.handle_mmio(MmioAccess {
            address: 0x1004,
            size: 4,
            is_write: false,
            data: 0,
        });
        assert!(result.handled);
        assert_eq!(result.data, 0xabcd + 4);
    }

    #[test]
    fn test_unhandled_access_reads_zero() {
        let registry = DeviceRegistry::new();
        let result = registry.handle_mmio(MmioAccess {
            address: 0xdead_0000,
            size: 4,
            is_write: false,
            data: 0,
        });
        assert!(!result.handled);
        assert_eq!(result.data, 0);
    }
}
