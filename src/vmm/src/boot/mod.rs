// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Linux/ARM64 boot protocol: image header parsing, device-tree
//! generation and blob placement.

use std::path::PathBuf;

pub mod dtb;
pub mod image;
pub mod loader;

pub use image::KernelImage;
pub use loader::{BootInfo, BootLoader};

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// The image is smaller than the 64-byte ARM64 header.
    #[error("kernel image is truncated ({0} bytes, need at least 64)")]
    TruncatedHeader(usize),
    /// The header magic is not "ARM\x64".
    #[error("bad kernel magic 0x{0:08x} (expected 0x644d5241)")]
    BadMagic(u32),
    #[error("failed to read {}: {1}", .0.display())]
    Io(PathBuf, std::io::Error),
    #[error("initrd at 0x{initrd:08x} would overlap the kernel ending at 0x{kernel_end:08x}")]
    InitrdOverlapsKernel { initrd: u64, kernel_end: u64 },
    #[error("generated DTB is {0} bytes, over the 2 MiB limit")]
    DtbTooLarge(u64),
    #[error("device tree generation failed: {0}")]
    Fdt(#[from] vm_fdt::Error),
    #[error(transparent)]
    Memory(#[from] crate::memory::MemoryError),
}
