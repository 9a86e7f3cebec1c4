// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Boot blob placement and initial vCPU state.
//!
//! The kernel goes at `RAM_BASE + text_offset`. The initrd is parked
//! 128 MiB into RAM, clear of the kernel's early allocations, and the
//! DTB follows the last blob, page aligned. The DTB is generated with
//! the same initrd window that is then written, so the two passes in
//! here must agree.

use std::fs;
use std::path::Path;

use super::dtb::{create_dtb, DtbConfig};
use super::image::KernelImage;
use super::BootError;
use crate::layout::RAM_BASE;
use crate::memory::MemoryManager;

#[cfg(target_arch = "aarch64")]
use crate::vcpu::{regs, Vcpu, VcpuError};

/// Offset of the initrd area from the base of RAM.
pub const INITRD_OFFSET: u64 = 128 << 20;
const DTB_MAX_SIZE: u64 = 2 << 20;
const PAGE_SIZE: u64 = 4096;

pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Addresses and sizes of everything placed in guest RAM for boot.
#[derive(Clone, Copy, Debug, Default)]
pub struct BootInfo {
    pub kernel_addr: u64,
    pub kernel_size: u64,
    /// Zero when no initrd is loaded.
    pub initrd_addr: u64,
    pub initrd_size: u64,
    pub dtb_addr: u64,
    pub dtb_size: u64,
}

impl BootInfo {
    pub fn initrd_end(&self) -> u64 {
        self.initrd_addr + self.initrd_size
    }
}

/// Compute the load plan without touching guest memory.
pub fn plan_layout(
    text_offset: u64,
    kernel_size: u64,
    initrd_size: Option<u64>,
    dtb_size: u64,
) -> Result<BootInfo, BootError> {
    if dtb_size > DTB_MAX_SIZE {
        return Err(BootError::DtbTooLarge(dtb_size));
    }
    let kernel_addr = RAM_BASE + text_offset;
    let kernel_end = kernel_addr + kernel_size;

    let (initrd_addr, initrd_size, after_blobs) = match initrd_size {
        Some(size) => {
            let addr = align_up(RAM_BASE + INITRD_OFFSET, PAGE_SIZE);
            if kernel_end > addr {
                return Err(BootError::InitrdOverlapsKernel {
                    initrd: addr,
                    kernel_end,
                });
            }
            (addr, size, addr + size)
        }
        None => (0, 0, kernel_end),
    };

    Ok(BootInfo {
        kernel_addr,
        kernel_size,
        initrd_addr,
        initrd_size,
        dtb_addr: align_up(after_blobs, PAGE_SIZE),
        dtb_size,
    })
}

/// Writes kernel, initrd and DTB into guest memory.
pub struct BootLoader<'a> {
    memory: &'a MemoryManager,
    ram_size: u64,
}

impl<'a> BootLoader<'a> {
    pub fn new(memory: &'a MemoryManager, ram_size: u64) -> Self {
        BootLoader { memory, ram_size }
    }

    pub fn load(
        &self,
        kernel: &KernelImage,
        initrd: Option<&Path>,
        cmdline: &str,
        num_cpus: u8,
    ) -> Result<BootInfo, BootError> {
        let initrd_data = match initrd {
            Some(path) => {
                Some(fs::read(path).map_err(|e| BootError::Io(path.to_path_buf(), e))?)
            }
            None => None,
        };

        // First pass: the initrd window is position independent, so
        // the DTB can name it before the DTB's own address is known.
        let initrd_addr = align_up(RAM_BASE + INITRD_OFFSET, PAGE_SIZE);
        let (initrd_start, initrd_end) = match &initrd_data {
            Some(data) => (initrd_addr, initrd_addr + data.len() as u64),
            None => (0, 0),
        };
        let dtb = create_dtb(&DtbConfig {
            ram_size: self.ram_size,
            cmdline: cmdline.to_string(),
            initrd_start,
            initrd_end,
            num_cpus,
        })?;

        let info = plan_layout(
            kernel.text_offset,
            kernel.data.len() as u64,
            initrd_data.as_ref().map(|d| d.len() as u64),
            dtb.len() as u64,
        )?;

        self.memory.write(info.kernel_addr, &kernel.data)?;
        log::info!(
            "loaded kernel at 0x{:08x} ({} bytes, text_offset 0x{:x})",
            info.kernel_addr,
            info.kernel_size,
            kernel.text_offset
        );
        if let Some(data) = &initrd_data {
            self.memory.write(info.initrd_addr, data)?;
            log::info!(
                "loaded initrd at 0x{:08x} ({} bytes)",
                info.initrd_addr,
                info.initrd_size
            );
        }
        self.memory.write(info.dtb_addr, &dtb)?;
        log::info!(
            "loaded DTB at 0x{:08x} ({} bytes)",
            info.dtb_addr,
            info.dtb_size
        );
        Ok(info)
    }
}

/// Program the boot protocol register state: `x0` carries the DTB,
/// `x1`-`x3` are reserved as zero, the PC is the kernel entry and
/// PSTATE masks all asynchronous exceptions at EL1h. VBAR_EL1 and SP
/// are also seeded so a fault before the kernel installs its own
/// vectors lands somewhere survivable.
#[cfg(target_arch = "aarch64")]
pub fn setup_boot_regs(vcpu: &Vcpu, info: &BootInfo) -> Result<(), VcpuError> {
    vcpu.set_reg(regs::xreg(0), info.dtb_addr)?;
    vcpu.set_reg(regs::xreg(1), 0)?;
    vcpu.set_reg(regs::xreg(2), 0)?;
    vcpu.set_reg(regs::xreg(3), 0)?;
    vcpu.set_reg(regs::pc(), info.kernel_addr)?;
    vcpu.set_reg(regs::pstate(), regs::PSTATE_FAULT_BITS_64)?;

    let vectors = info.kernel_addr + 0x10800;
    vcpu.set_reg(regs::VBAR_EL1, vectors)?;
    let stack = align_up(info.dtb_addr + info.dtb_size, PAGE_SIZE) + 0x10000;
    vcpu.set_reg(regs::sp(), stack)?;

    log::debug!(
        "vCPU {} boot state: pc=0x{:08x} x0=0x{:08x} vbar=0x{:08x} sp=0x{:08x}",
        vcpu.index,
        info.kernel_addr,
        info.dtb_addr,
        vectors,
        stack
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_at_text_offset() {
        let info = plan_layout(0x80000, 0x10_0000, None, 0x1000).unwrap();
        assert_eq!(info.kernel_addr, RAM_BASE + 0x80000);
        assert_eq!(info.kernel_size, 0x10_0000);
        assert_eq!(info.initrd_addr, 0);
        assert_eq!(info.initrd_size, 0);
    }

    #[test]
    fn test_initrd_parked_at_128m() {
        let info = plan_layout(0x80000, 0x10_0000, Some(0x4_0000), 0x1000).unwrap();
        assert_eq!(info.initrd_addr, RAM_BASE + (128 << 20));
        assert_eq!(info.initrd_size, 0x4_0000);
        assert_eq!(info.initrd_end(), info.initrd_addr + 0x4_0000);
    }

    #[test]
    fn test_dtb_follows_initrd_page_aligned() {
        let info = plan_layout(0x80000, 0x10_0000, Some(0x4_0001), 0x1000).unwrap();
        assert_eq!(info.dtb_addr, align_up(info.initrd_end(), 4096));
        assert_eq!(info.dtb_addr % 4096, 0);
    }

    #[test]
    fn test_dtb_follows_kernel_without_initrd() {
        let info = plan_layout(0x80000, 0x10_0001, None, 0x1000).unwrap();
        assert_eq!(
            info.dtb_addr,
            align_up(RAM_BASE + 0x80000 + 0x10_0001, 4096)
        );
    }

    #[test]
    fn test_huge_kernel_collides_with_initrd() {
        let result = plan_layout(0x80000, 129 << 20, Some(0x1000), 0x1000);
        assert!(matches!(
            result,
            Err(BootError::InitrdOverlapsKernel { .. })
        ));
    }

    #[test]
    fn test_oversized_dtb_rejected() {
        assert!(matches!(
            plan_layout(0x80000, 0x1000, None, (2 << 20) + 1),
            Err(BootError::DtbTooLarge(_))
        ));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
