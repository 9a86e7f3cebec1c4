// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! In-kernel GICv3 driver.
//!
//! The interrupt controller lives in the kernel; this module only
//! configures it and drives interrupt lines. The lifecycle ordering is
//! strict and enforced here:
//!
//! 1. [`Gic::new`] creates the device and programs the distributor and
//!    redistributor base addresses. No vCPU may exist yet.
//! 2. The caller creates its vCPUs, reporting each one through
//!    [`Gic::notify_vcpu_created`].
//! 3. [`Gic::finalize`] issues the init control attribute. After this
//!    no further vCPUs may be created.

use std::sync::Arc;

use kvm_bindings::{
    kvm_create_device, kvm_device_attr, kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V3,
    KVM_ARM_IRQ_TYPE_PPI, KVM_ARM_IRQ_TYPE_SHIFT, KVM_ARM_IRQ_TYPE_SPI,
    KVM_DEV_ARM_VGIC_CTRL_INIT, KVM_DEV_ARM_VGIC_GRP_ADDR, KVM_DEV_ARM_VGIC_GRP_CTRL,
    KVM_VGIC_V3_ADDR_TYPE_DIST, KVM_VGIC_V3_ADDR_TYPE_REDIST,
};
use kvm_ioctls::{DeviceFd, VmFd};

use crate::devices::IrqLine;
use crate::layout::{GIC_DIST_BASE, GIC_REDIST_BASE};

#[derive(Debug, thiserror::Error)]
pub enum GicError {
    /// GICv3 emulation is missing (not an ARM64 host, or no KVM vgic).
    #[error("failed to create the GICv3 device: {0}")]
    Create(kvm_ioctls::Error),
    #[error("failed to set the GIC {0} address: {1}")]
    SetAddress(&'static str, kvm_ioctls::Error),
    #[error("failed to initialize the GIC: {0}")]
    Init(kvm_ioctls::Error),
    /// A lifecycle rule was violated.
    #[error("GIC ordering violation: {0}")]
    BadOrdering(&'static str),
    #[error("failed to drive IRQ line {irq}: {err}")]
    Inject { irq: u32, err: kvm_ioctls::Error },
}

type Result<T> = std::result::Result<T, GicError>;

pub struct Gic {
    vm: Arc<VmFd>,
    device: DeviceFd,
    vcpu_count: usize,
    finalized: bool,
}

impl Gic {
    /// Create the in-kernel GICv3 and program its base addresses.
    pub fn new(vm: Arc<VmFd>) -> Result<Self> {
        let mut device = kvm_create_device {
            type_: kvm_device_type_KVM_DEV_TYPE_ARM_VGIC_V3,
            fd: 0,
            flags: 0,
        };
        let device = vm.create_device(&mut device).map_err(GicError::Create)?;

        let gic = Gic {
            vm,
            device,
            vcpu_count: 0,
            finalized: false,
        };
        gic.set_address("distributor", KVM_VGIC_V3_ADDR_TYPE_DIST, GIC_DIST_BASE)?;
        gic.set_address("redistributor", KVM_VGIC_V3_ADDR_TYPE_REDIST, GIC_REDIST_BASE)?;
        log::debug!(
            "GICv3 created: distributor @ 0x{:08x}, redistributor @ 0x{:08x}",
            GIC_DIST_BASE,
            GIC_REDIST_BASE
        );
        Ok(gic)
    }

    fn set_address(&self, name: &'static str, kind: u32, address: u64) -> Result<()> {
        let attr = kvm_device_attr {
            flags: 0,
            group: KVM_DEV_ARM_VGIC_GRP_ADDR,
            attr: u64::from(kind),
            addr: &address as *const u64 as u64,
        };
        self.device
            .set_device_attr(&attr)
            .map_err(|e| GicError::SetAddress(name, e))
    }

    /// Record a vCPU creation. Refused once the GIC is finalized.
    pub fn notify_vcpu_created(&mut self) -> Result<()> {
        if self.finalized {
            return Err(GicError::BadOrdering(
                "vCPUs cannot be created after the GIC is finalized",
            ));
        }
        self.vcpu_count += 1;
        Ok(())
    }

    /// Complete GIC initialization. All vCPUs must already exist, since
    /// the kernel sizes the per-CPU redistributors here.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if self.vcpu_count == 0 {
            return Err(GicError::BadOrdering(
                "the GIC cannot be finalized before any vCPU exists",
            ));
        }
        let attr = kvm_device_attr {
            flags: 0,
            group: KVM_DEV_ARM_VGIC_GRP_CTRL,
            attr: u64::from(KVM_DEV_ARM_VGIC_CTRL_INIT),
            addr: 0,
        };
        self.device.set_device_attr(&attr).map_err(GicError::Init)?;
        self.finalized = true;
        log::debug!("GICv3 finalized with {} vCPU(s)", self.vcpu_count);
        Ok(())
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Assert (`level` true) or deassert an interrupt line.
    ///
    /// `irq` is the GIC interrupt id: SPIs are 32 and up, PPIs 16-31.
    /// KVM_IRQ_LINE wants the id tagged with the interrupt type in
    /// bits 31-24.
    pub fn inject_irq(&self, irq: u32, level: bool) -> Result<()> {
        if !self.finalized {
            return Err(GicError::BadOrdering(
                "interrupts cannot be injected before the GIC is finalized",
            ));
        }
        let irq_type = if irq >= 32 {
            KVM_ARM_IRQ_TYPE_SPI
        } else {
            KVM_ARM_IRQ_TYPE_PPI
        } as u32;
        let encoded = (irq_type << KVM_ARM_IRQ_TYPE_SHIFT) | irq;
        self.vm
            .set_irq_line(encoded, level)
            .map_err(|err| GicError::Inject { irq, err })
    }

    /// A line handle for one interrupt id, for wiring into devices.
    pub fn irq_line(self: &Arc<Self>, irq: u32) -> GicIrqLine {
        GicIrqLine {
            gic: Arc::clone(self),
            irq,
        }
    }
}

/// Device-side handle to one GIC interrupt line.
pub struct GicIrqLine {
    gic: Arc<Gic>,
    irq: u32,
}

impl IrqLine for GicIrqLine {
    fn set_level(&self, level: bool) {
        if let Err(e) = self.gic.inject_irq(self.irq, level) {
            log::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_ioctls::Kvm;

    // Needs /dev/kvm with GICv3 support; skipped elsewhere.
    fn test_gic() -> Option<Gic> {
        let kvm = Kvm::new().ok()?;
        let vm = Arc::new(kvm.create_vm().ok()?);
        Gic::new(vm).ok()
    }

    #[test]
    fn test_finalize_requires_a_vcpu() {
        let Some(mut gic) = test_gic() else { return };
        assert!(matches!(gic.finalize(), Err(GicError::BadOrdering(_))));
    }

    #[test]
    fn test_no_vcpus_after_finalize() {
        let kvm = match Kvm::new() {
            Ok(kvm) => kvm,
            Err(_) => return,
        };
        let vm = match kvm.create_vm() {
            Ok(vm) => Arc::new(vm),
            Err(_) => return,
        };
        let Ok(mut gic) = Gic::new(Arc::clone(&vm)) else { return };
        gic.notify_vcpu_created().unwrap();
        if vm.create_vcpu(0).is_err() {
            return;
        }
        gic.finalize().unwrap();
        assert!(matches!(
            gic.notify_vcpu_created(),
            Err(GicError::BadOrdering(_))
        ));
    }

    #[test]
    fn test_inject_requires_finalize() {
        let Some(gic) = test_gic() else { return };
        assert!(matches!(
            gic.inject_irq(crate::layout::UART_IRQ, true),
            Err(GicError::BadOrdering(_))
        ));
    }
}
