// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The VMM coordinator: owns the KVM handles, guest memory, interrupt
//! controller, devices and vCPUs, and drives the exit loop.

use std::io::stdout;
use std::sync::{Arc, Mutex};

use kvm_bindings::KVM_API_VERSION;
use kvm_ioctls::{Kvm, VmFd};

use crate::boot::{BootError, BootInfo, BootLoader, KernelImage};
use crate::config::{ConfigError, VmConfig};
use crate::devices::uart::Pl011;
use crate::devices::virtio::{Console, VirtioMmio};
use crate::devices::{DeviceError, DeviceRegistry};
use crate::gic::{Gic, GicError};
use crate::kick::{KickError, KickTimer};
use crate::layout;
use crate::memory::{MemoryError, MemoryManager};
use crate::terminal::{self, RawTerminal};
use crate::vcpu::{Vcpu, VcpuAction, VcpuError};
use crate::{boot, layout::RAM_BASE};

/// VMM errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open /dev/kvm: {0}")]
    KvmOpen(kvm_ioctls::Error),
    #[error("KVM API version {0} (need {KVM_API_VERSION})")]
    ApiVersion(i32),
    #[error("failed to create a VM: {0}")]
    CreateVm(kvm_ioctls::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Gic(#[from] GicError),
    #[error(transparent)]
    Vcpu(#[from] VcpuError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error(transparent)]
    Kick(#[from] KickError),
    #[error("terminal setup failed: {0}")]
    Terminal(std::io::Error),
    #[error("no vCPUs configured")]
    NoVcpus,
}

/// Dedicated [`std::result::Result`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Run-loop statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunStats {
    /// Guest exits handled (signal wakeups excluded).
    pub exits: u64,
    /// Whether the guest halted rather than requesting shutdown.
    pub hlt: bool,
    /// Exits broken down by kind.
    pub exit_counts: ExitCounts,
}

/// Per-exit-kind counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExitCounts {
    /// MMIO exits dispatched to the device registry.
    pub mmio: u64,
    pub hlt: u64,
    pub shutdown: u64,
    /// Kick-timer wakeups; not guest exits.
    pub wakeups: u64,
}

/// A configured virtual machine.
///
/// Field order is teardown order: vCPUs close before devices, devices
/// before the GIC, the GIC before memory and the VM itself.
pub struct VMM {
    config: VmConfig,
    vcpus: Vec<Vcpu>,
    devices: DeviceRegistry,
    uart: Option<Arc<Mutex<Pl011>>>,
    console: Option<Arc<Mutex<VirtioMmio<Console>>>>,
    gic: Option<Arc<Gic>>,
    memory: MemoryManager,
    boot_info: Option<BootInfo>,
    vm_fd: Arc<VmFd>,
    _kvm: Kvm,
}

impl VMM {
    /// Open KVM, create the VM and back it with RAM.
    pub fn new(config: VmConfig) -> Result<VMM> {
        config.validate()?;

        let kvm = Kvm::new().map_err(Error::KvmOpen)?;
        let api = kvm.get_api_version();
        if api != KVM_API_VERSION as i32 {
            return Err(Error::ApiVersion(api));
        }
        log::debug!(
            "KVM api version {}, vCPU exit region {} bytes",
            api,
            kvm.get_vcpu_mmap_size().map_err(Error::KvmOpen)?
        );

        let vm_fd = Arc::new(kvm.create_vm().map_err(Error::CreateVm)?);
        let mut memory = MemoryManager::new(Arc::clone(&vm_fd));
        memory.add_ram(RAM_BASE, config.ram_size())?;

        Ok(VMM {
            config,
            vcpus: Vec::new(),
            devices: DeviceRegistry::new(),
            uart: None,
            console: None,
            gic: None,
            memory,
            boot_info: None,
            vm_fd,
            _kvm: kvm,
        })
    }

    /// Build the machine: GIC, vCPUs, devices, boot blobs, registers.
    ///
    /// The ordering here is load bearing: the GIC device must exist
    /// before any vCPU, and every vCPU must exist before the GIC is
    /// finalized.
    pub fn configure(&mut self) -> Result<()> {
        let mut gic = Gic::new(Arc::clone(&self.vm_fd))?;

        for index in 0..u64::from(self.config.vcpus) {
            gic.notify_vcpu_created()?;
            self.vcpus.push(Vcpu::new(&self.vm_fd, index)?);
        }
        gic.finalize()?;
        let gic = Arc::new(gic);

        let uart = Arc::new(Mutex::new(Pl011::new(
            layout::UART_BASE,
            Box::new(stdout()),
            Box::new(gic.irq_line(layout::UART_IRQ)),
        )));
        self.devices.register(uart.clone())?;

        let console = Arc::new(Mutex::new(VirtioMmio::new(
            layout::VIRTIO_BASE,
            Console::new(Box::new(stdout())),
            self.memory.guest_memory()?,
            Box::new(gic.irq_line(layout::VIRTIO_IRQ_BASE)),
        )));
        self.devices.register(console.clone())?;

        let kernel = KernelImage::load(&self.config.kernel)?;
        let loader = BootLoader::new(&self.memory, self.config.ram_size());
        let info = loader.load(
            &kernel,
            self.config.initramfs.as_deref(),
            &self.config.cmdline,
            self.config.vcpus,
        )?;
        boot::loader::setup_boot_regs(&self.vcpus[0], &info)?;

        self.uart = Some(uart);
        self.console = Some(console);
        self.gic = Some(gic);
        self.boot_info = Some(info);
        Ok(())
    }

    pub fn boot_info(&self) -> Option<&BootInfo> {
        self.boot_info.as_ref()
    }

    pub fn gic(&self) -> Option<&Arc<Gic>> {
        self.gic.as_ref()
    }

    /// The virtio console transport, e.g. for feeding it input.
    pub fn console(&self) -> Option<&Arc<Mutex<VirtioMmio<Console>>>> {
        self.console.as_ref()
    }

    /// Run the first vCPU until the guest halts or asks to stop.
    ///
    /// While the loop runs, the terminal is in raw mode and a 100 ms
    /// kick timer keeps pulling the vCPU out of the guest so stdin can
    /// be polled and fed to the UART.
    pub fn run(&mut self) -> Result<RunStats> {
        if self.vcpus.is_empty() {
            return Err(Error::NoVcpus);
        }
        let uart = self.uart.clone();
        let strict = self.config.strict_mmio;

        let _terminal = RawTerminal::enter(libc::STDIN_FILENO).map_err(Error::Terminal)?;
        let _kick = KickTimer::arm(self.vcpus[0].raw_fd())?;

        let mut stats = RunStats::default();
        let outcome = loop {
            let vcpu = &mut self.vcpus[0];
            match vcpu.run(&self.devices, strict) {
                Ok(VcpuAction::Continue) => {
                    stats.exits += 1;
                    stats.exit_counts.mmio += 1;
                }
                Ok(VcpuAction::Interrupted) => {
                    // Timer tick: feed pending stdin to the UART, drop
                    // the exit flag and go back in.
                    stats.exit_counts.wakeups += 1;
                    let input =
                        terminal::read_available(libc::STDIN_FILENO).map_err(Error::Terminal)?;
                    if !input.is_empty() {
                        if let Some(uart) = &uart {
                            uart.lock().unwrap().inject_input(&input);
                        }
                    }
                    vcpu.set_immediate_exit(false);
                }
                Ok(VcpuAction::Halt) => {
                    stats.exits += 1;
                    stats.exit_counts.hlt += 1;
                    stats.hlt = true;
                    log::info!("guest halted");
                    break Ok(());
                }
                Ok(VcpuAction::Shutdown) => {
                    stats.exits += 1;
                    stats.exit_counts.shutdown += 1;
                    log::info!("guest requested shutdown");
                    break Ok(());
                }
                Err(err) => {
                    if matches!(err, VcpuError::GuestFault(_)) {
                        log::error!("{}", self.vcpus[0].dump_registers());
                    }
                    break Err(Error::Vcpu(err));
                }
            }
        };

        log::debug!(
            "run loop finished after {} guest exits (mmio {}, hlt {}, shutdown {}, wakeups {})",
            stats.exits,
            stats.exit_counts.mmio,
            stats.exit_counts.hlt,
            stats.exit_counts.shutdown,
            stats.exit_counts.wakeups
        );
        outcome.map(|_| stats)
    }
}
