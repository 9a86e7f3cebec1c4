// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! ARM64 register-id encoding for KVM_GET_ONE_REG / KVM_SET_ONE_REG.
//!
//! Core registers are addressed by their 32-bit-word offset inside
//! `struct kvm_regs`; system registers by their op0/op1/CRn/CRm/op2
//! encoding. Both carry the architecture and size tags in the high
//! bits of the 64-bit id.

use std::mem::offset_of;

use kvm_bindings::{
    kvm_regs, user_pt_regs, KVM_REG_ARM64, KVM_REG_ARM64_SYSREG, KVM_REG_ARM64_SYSREG_CRM_MASK,
    KVM_REG_ARM64_SYSREG_CRM_SHIFT, KVM_REG_ARM64_SYSREG_CRN_MASK, KVM_REG_ARM64_SYSREG_CRN_SHIFT,
    KVM_REG_ARM64_SYSREG_OP0_MASK, KVM_REG_ARM64_SYSREG_OP0_SHIFT, KVM_REG_ARM64_SYSREG_OP1_MASK,
    KVM_REG_ARM64_SYSREG_OP1_SHIFT, KVM_REG_ARM64_SYSREG_OP2_MASK, KVM_REG_ARM64_SYSREG_OP2_SHIFT,
    KVM_REG_ARM_CORE, KVM_REG_SIZE_U64,
};

// PSTATE bits, from the kernel's asm/ptrace.h.
const PSR_MODE_EL1H: u64 = 0x0000_0005;
const PSR_F_BIT: u64 = 0x0000_0040;
const PSR_I_BIT: u64 = 0x0000_0080;
const PSR_A_BIT: u64 = 0x0000_0100;
const PSR_D_BIT: u64 = 0x0000_0200;

/// EL1h with debug, SError, IRQ and FIQ masked: the state the Linux
/// boot protocol requires at kernel entry.
pub const PSTATE_FAULT_BITS_64: u64 =
    PSR_MODE_EL1H | PSR_A_BIT | PSR_F_BIT | PSR_I_BIT | PSR_D_BIT;

fn core_reg(offset: usize) -> u64 {
    KVM_REG_ARM64 as u64 | KVM_REG_SIZE_U64 as u64 | KVM_REG_ARM_CORE as u64 | (offset / 4) as u64
}

/// General-purpose register `x0`..`x30`.
pub fn xreg(n: usize) -> u64 {
    debug_assert!(n < 31);
    core_reg(offset_of!(kvm_regs, regs) + offset_of!(user_pt_regs, regs) + n * 8)
}

pub fn sp() -> u64 {
    core_reg(offset_of!(kvm_regs, regs) + offset_of!(user_pt_regs, sp))
}

pub fn pc() -> u64 {
    core_reg(offset_of!(kvm_regs, regs) + offset_of!(user_pt_regs, pc))
}

pub fn pstate() -> u64 {
    core_reg(offset_of!(kvm_regs, regs) + offset_of!(user_pt_regs, pstate))
}

const fn sys_reg(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64) -> u64 {
    KVM_REG_ARM64 as u64
        | KVM_REG_SIZE_U64 as u64
        | KVM_REG_ARM64_SYSREG as u64
        | ((op0 << KVM_REG_ARM64_SYSREG_OP0_SHIFT) & KVM_REG_ARM64_SYSREG_OP0_MASK as u64)
        | ((op1 << KVM_REG_ARM64_SYSREG_OP1_SHIFT) & KVM_REG_ARM64_SYSREG_OP1_MASK as u64)
        | ((crn << KVM_REG_ARM64_SYSREG_CRN_SHIFT) & KVM_REG_ARM64_SYSREG_CRN_MASK as u64)
        | ((crm << KVM_REG_ARM64_SYSREG_CRM_SHIFT) & KVM_REG_ARM64_SYSREG_CRM_MASK as u64)
        | ((op2 << KVM_REG_ARM64_SYSREG_OP2_SHIFT) & KVM_REG_ARM64_SYSREG_OP2_MASK as u64)
}

/// Exception vector base; seeded before boot so a pre-kernel fault has
/// a landing pad.
pub const VBAR_EL1: u64 = sys_reg(3, 0, 12, 0, 0);
/// Exception syndrome, for fault dumps.
pub const ESR_EL1: u64 = sys_reg(3, 0, 5, 2, 0);
/// Fault address.
pub const FAR_EL1: u64 = sys_reg(3, 0, 6, 0, 0);
/// System control.
pub const SCTLR_EL1: u64 = sys_reg(3, 0, 1, 0, 0);

/// Human name for the ESR_EL1 exception-class field.
pub fn exception_class_name(ec: u64) -> &'static str {
    match ec {
        0x00 => "Unknown",
        0x01 => "WFI/WFE",
        0x15 => "SVC in AArch64",
        0x16 => "HVC in AArch64",
        0x17 => "SMC in AArch64",
        0x20 => "Instruction Abort (lower EL)",
        0x21 => "Instruction Abort (same EL)",
        0x22 => "PC alignment",
        0x24 => "Data Abort (lower EL)",
        0x25 => "Data Abort (same EL)",
        0x26 => "SP alignment",
        _ => "unrecognized",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_reg_word_offsets() {
        // Offsets inside kvm_regs, in 32-bit words: x0 at 0, sp at 62,
        // pc at 64, pstate at 66.
        assert_eq!(xreg(0) & 0xffff, 0);
        assert_eq!(xreg(1) & 0xffff, 2);
        assert_eq!(sp() & 0xffff, 62);
        assert_eq!(pc() & 0xffff, 64);
        assert_eq!(pstate() & 0xffff, 66);
    }

    #[test]
    fn test_reg_id_tags() {
        let id = pc();
        assert_eq!(id & KVM_REG_ARM64 as u64, KVM_REG_ARM64 as u64);
        assert_eq!(id & KVM_REG_SIZE_U64 as u64, KVM_REG_SIZE_U64 as u64);
    }

    #[test]
    fn test_boot_pstate() {
        assert_eq!(PSTATE_FAULT_BITS_64, 0x3c5);
    }

    #[test]
    fn test_sysreg_encoding() {
        // Known one-reg ids: VBAR_EL1 (3,0,12,0,0) and, as a cross
        // check against the widely quoted value, MPIDR_EL1 (3,0,0,0,5)
        // which encodes to 0x6030_0000_0013_c005.
        assert_eq!(VBAR_EL1, 0x6030_0000_0013_c600);
        assert_eq!(sys_reg(3, 0, 0, 0, 5), 0x6030_0000_0013_c005);
    }
}
