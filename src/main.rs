use clap::Parser;

#[derive(Parser)]
#[clap(version, about = "A minimal ARM64 virtual machine monitor")]
struct VMMOpts {
    /// Linux kernel Image path
    #[clap(short, long)]
    kernel: String,

    /// Initramfs path
    #[clap(short, long)]
    initramfs: Option<String>,

    /// Kernel command line
    #[clap(long)]
    cmdline: Option<String>,

    /// Number of virtual CPUs assigned to the guest
    #[clap(short, long, default_value = "1")]
    cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    #[clap(short, long, default_value = "1024")]
    memory: u32,

    /// Treat MMIO accesses outside any device as fatal
    #[clap(long)]
    strict: bool,

    /// A level of verbosity, and can be used multiple times
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

#[cfg(target_arch = "aarch64")]
fn run(opts: VMMOpts) -> Result<(), vmm::Error> {
    use vmm::config::VmConfig;

    let mut config = VmConfig::new(opts.kernel);
    config.initramfs = opts.initramfs.map(Into::into);
    if let Some(cmdline) = opts.cmdline {
        config.cmdline = cmdline;
    }
    config.vcpus = opts.cpus;
    config.memory_mib = opts.memory;
    config.strict_mmio = opts.strict;

    let mut vmm = vmm::VMM::new(config)?;
    vmm.configure()?;
    let stats = vmm.run()?;
    log::info!(
        "guest finished after {} exits ({})",
        stats.exits,
        if stats.hlt { "halt" } else { "shutdown" }
    );
    Ok(())
}

#[cfg(target_arch = "aarch64")]
fn main() {
    let opts = VMMOpts::parse();
    init_logger(opts.verbose);
    if let Err(e) = run(opts) {
        eprintln!("kestrel: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {
    let opts = VMMOpts::parse();
    init_logger(opts.verbose);
    eprintln!("kestrel: ARM64 hosts only (this build target cannot run guests)");
    std::process::exit(1);
}
