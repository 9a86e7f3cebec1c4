// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A minimal ARM64 virtual machine monitor on top of KVM.
//!
//! The crate creates a VM, backs it with anonymous host memory,
//! attaches the in-kernel GICv3, boots a Linux `Image` with a
//! generated device tree and drives a single vCPU through an
//! exit-driven run loop that emulates a PL011 UART and a virtio-mmio
//! console.
//!
//! Device emulation, the virtqueue engine, boot-image parsing and the
//! DTB generator are host-architecture independent; everything that
//! talks to ARM-specific KVM interfaces (vCPU init, the GIC, the
//! coordinator itself) only builds on aarch64.

pub mod boot;
pub mod config;
pub mod devices;
pub mod kick;
pub mod layout;
pub mod memory;
pub mod terminal;

#[cfg(target_arch = "aarch64")]
pub mod gic;
#[cfg(target_arch = "aarch64")]
mod machine;
#[cfg(target_arch = "aarch64")]
pub mod vcpu;

#[cfg(target_arch = "aarch64")]
pub use machine::{Error, ExitCounts, Result, RunStats, VMM};
