// SPDX-License-Identifier: Apache-2.0

//! Paravirtual devices: the split-ring virtqueue engine, the
//! virtio-mmio transport and the console device type.

pub mod console;
pub mod mmio;
pub mod queue;

pub use console::Console;
pub use mmio::VirtioMmio;
pub use queue::{Descriptor, QueueError, Virtqueue};
