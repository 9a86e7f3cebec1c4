// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtual CPU handling: creation, ARM init, register access and the
//! decoding of one `KVM_RUN` step into a run-loop action.

use kvm_bindings::{kvm_vcpu_init, KVM_ARM_VCPU_PSCI_0_2};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};

use crate::devices::{DeviceRegistry, MmioAccess};

pub mod regs;

/// Errors encountered during vCPU operation.
#[derive(Debug, thiserror::Error)]
pub enum VcpuError {
    #[error("failed to create vCPU {0}: {1}")]
    Create(u64, kvm_ioctls::Error),
    #[error("failed to query the preferred CPU target: {0}")]
    PreferredTarget(kvm_ioctls::Error),
    #[error("failed to init vCPU {0}: {1}")]
    Init(u64, kvm_ioctls::Error),
    #[error("failed to access register 0x{id:016x}: {err}")]
    Register { id: u64, err: kvm_ioctls::Error },
    #[error("KVM_RUN failed: {0}")]
    Run(kvm_ioctls::Error),
    /// The vCPU reported a fatal condition; the caller should dump
    /// registers before tearing down.
    #[error("guest fault: {0}")]
    GuestFault(&'static str),
    #[error("unexpected vCPU exit: {0}")]
    UnexpectedExit(String),
    /// Strict mode promotes unclaimed MMIO to an error.
    #[error("unhandled guest MMIO at 0x{address:08x} (write: {is_write})")]
    UnhandledMmio { address: u64, is_write: bool },
}

type Result<T> = std::result::Result<T, VcpuError>;

/// What the run loop should do after one `KVM_RUN` step.
#[derive(Debug, PartialEq, Eq)]
pub enum VcpuAction {
    /// Exit handled, re-enter the guest.
    Continue,
    /// `KVM_RUN` was interrupted by a signal (or the immediate-exit
    /// flag); not a guest exit.
    Interrupted,
    /// The guest halted.
    Halt,
    /// The guest asked for shutdown or reset.
    Shutdown,
}

pub struct Vcpu {
    pub index: u64,
    fd: VcpuFd,
}

impl Vcpu {
    /// Create vCPU `index` and initialize it with the host-preferred
    /// target, PSCI 0.2 enabled.
    pub fn new(vm: &VmFd, index: u64) -> Result<Self> {
        let fd = vm
            .create_vcpu(index)
            .map_err(|e| VcpuError::Create(index, e))?;

        let mut kvi = kvm_vcpu_init::default();
        vm.get_preferred_target(&mut kvi)
            .map_err(VcpuError::PreferredTarget)?;
        kvi.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;
        fd.vcpu_init(&kvi).map_err(|e| VcpuError::Init(index, e))?;

        Ok(Vcpu { index, fd })
    }

    pub fn set_reg(&self, id: u64, value: u64) -> Result<()> {
        self.fd
            .set_one_reg(id, value)
            .map_err(|err| VcpuError::Register { id, err })
    }

    pub fn get_reg(&self, id: u64) -> Result<u64> {
        self.fd
            .get_one_reg(id)
            .map_err(|err| VcpuError::Register { id, err })
    }

    /// Set or clear the immediate-exit flag in the shared exit region.
    pub fn set_immediate_exit(&self, enabled: bool) {
        self.fd.set_kvm_immediate_exit(u8::from(enabled));
    }

    pub(crate) fn raw_fd(&self) -> &VcpuFd {
        &self.fd
    }

    /// Enter the guest once and handle whatever stopped it.
    ///
    /// MMIO exits are dispatched to `devices`; for reads the result is
    /// written back into the exit region before the next entry. A
    /// signal during `KVM_RUN` surfaces as EINTR and maps to
    /// [`VcpuAction::Interrupted`].
    pub fn run(&mut self, devices: &DeviceRegistry, strict_mmio: bool) -> Result<VcpuAction> {
        match self.fd.run() {
            Ok(VcpuExit::MmioRead(address, data)) => {
                let size = data.len().min(8);
                let result = devices.handle_mmio(MmioAccess {
                    address,
                    size: size as u8,
                    is_write: false,
                    data: 0,
                });
                if strict_mmio && !result.handled {
                    return Err(VcpuError::UnhandledMmio {
                        address,
                        is_write: false,
                    });
                }
                data[..size].copy_from_slice(&result.data.to_le_bytes()[..size]);
                Ok(VcpuAction::Continue)
            }
            Ok(VcpuExit::MmioWrite(address, data)) => {
                let size = data.len().min(8);
                let mut bytes = [0u8; 8];
                bytes[..size].copy_from_slice(&data[..size]);
                let result = devices.handle_mmio(MmioAccess {
                    address,
                    size: size as u8,
                    is_write: true,
                    data: u64::from_le_bytes(bytes),
                });
                if strict_mmio && !result.handled {
                    return Err(VcpuError::UnhandledMmio {
                        address,
                        is_write: true,
                    });
                }
                Ok(VcpuAction::Continue)
            }
            Ok(VcpuExit::Hlt) => Ok(VcpuAction::Halt),
            Ok(VcpuExit::Shutdown) => Ok(VcpuAction::Shutdown),
            Ok(VcpuExit::SystemEvent(event, _flags)) => {
                log::info!("guest requested system event {}", event);
                Ok(VcpuAction::Shutdown)
            }
            Ok(VcpuExit::InternalError) => Err(VcpuError::GuestFault("KVM_EXIT_INTERNAL_ERROR")),
            Ok(VcpuExit::FailEntry) => Err(VcpuError::GuestFault("KVM_EXIT_FAIL_ENTRY")),
            Ok(other) => Err(VcpuError::UnexpectedExit(format!("{:?}", other))),
            Err(e) if e.errno() == libc::EINTR => Ok(VcpuAction::Interrupted),
            Err(e) => Err(VcpuError::Run(e)),
        }
    }

    /// Render x0-x30, SP, PC, PSTATE and the fault-related system
    /// registers, decoding the ESR_EL1 exception class.
    pub fn dump_registers(&self) -> String {
        use std::fmt::Write;

        fn fmt_reg(vcpu: &Vcpu, id: u64) -> String {
            match vcpu.get_reg(id) {
                Ok(value) => format!("0x{:016x}", value),
                Err(_) => "<unreadable>".to_string(),
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "vCPU {} registers:", self.index);
        for row in (0..31).step_by(4) {
            let mut line = String::from(" ");
            for n in row..(row + 4).min(31) {
                let _ = write!(line, " x{:<2}={}", n, fmt_reg(self, regs::xreg(n)));
            }
            let _ = writeln!(out, "{}", line);
        }
        let _ = writeln!(out, "  sp    ={}", fmt_reg(self, regs::sp()));
        let _ = writeln!(out, "  pc    ={}", fmt_reg(self, regs::pc()));
        let _ = writeln!(out, "  pstate={}", fmt_reg(self, regs::pstate()));
        let _ = writeln!(out, "  VBAR_EL1 ={}", fmt_reg(self, regs::VBAR_EL1));
        let _ = writeln!(out, "  FAR_EL1  ={}", fmt_reg(self, regs::FAR_EL1));
        let _ = writeln!(out, "  SCTLR_EL1={}", fmt_reg(self, regs::SCTLR_EL1));
        match self.get_reg(regs::ESR_EL1) {
            Ok(esr) => {
                let ec = (esr >> 26) & 0x3f;
                let _ = writeln!(
                    out,
                    "  ESR_EL1  =0x{:016x} (EC 0x{:02x}: {})",
                    esr,
                    ec,
                    regs::exception_class_name(ec)
                );
            }
            Err(_) => {
                let _ = writeln!(out, "  ESR_EL1  =<unreadable>");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_ioctls::Kvm;

    // Needs /dev/kvm on an ARM64 host; skipped elsewhere.
    fn test_vcpu() -> Option<Vcpu> {
        let kvm = Kvm::new().ok()?;
        let vm = kvm.create_vm().ok()?;
        Vcpu::new(&vm, 0).ok()
    }

    #[test]
    fn test_register_round_trip() {
        let Some(vcpu) = test_vcpu() else { return };
        vcpu.set_reg(regs::xreg(0), 0x1122_3344_5566_7788).unwrap();
        assert_eq!(vcpu.get_reg(regs::xreg(0)).unwrap(), 0x1122_3344_5566_7788);

        vcpu.set_reg(regs::pc(), 0x4008_0000).unwrap();
        assert_eq!(vcpu.get_reg(regs::pc()).unwrap(), 0x4008_0000);
    }

    #[test]
    fn test_dump_contains_core_registers() {
        let Some(vcpu) = test_vcpu() else { return };
        let dump = vcpu.dump_registers();
        assert!(dump.contains("x0 "));
        assert!(dump.contains("pc"));
        assert!(dump.contains("ESR_EL1"));
    }
}
