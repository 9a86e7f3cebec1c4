// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Flat device-tree generation.
//!
//! Describes the machine to the guest kernel: RAM, CPUs (PSCI
//! enable-method), the GICv3, the architected timer, the PL011 and its
//! fixed clock. The layout mirrors a QEMU-virt style platform, which
//! stock distribution kernels boot without out-of-tree drivers.

use vm_fdt::{Error, FdtWriter};

use crate::layout::{
    GIC_DIST_BASE, GIC_DIST_SIZE, GIC_REDIST_BASE, GIC_REDIST_SIZE, RAM_BASE,
    TIMER_PPI_HYPERVISOR, TIMER_PPI_NONSECURE_PHYS, TIMER_PPI_SECURE_PHYS, TIMER_PPI_VIRTUAL,
    UART_BASE, UART_IRQ, UART_SIZE,
};

const GIC_PHANDLE: u32 = 1;
const CLOCK_PHANDLE: u32 = 2;

// Interrupt-specifier cells: type, number, flags.
const IRQ_TYPE_SPI: u32 = 0;
const IRQ_TYPE_PPI: u32 = 1;
const IRQ_LEVEL_HI: u32 = 4;
/// Device-tree PPI numbers are relative to the start of the PPI range.
const PPI_BASE: u32 = 16;

#[derive(Clone, Debug)]
pub struct DtbConfig {
    pub ram_size: u64,
    pub cmdline: String,
    /// Zero when no initrd is loaded.
    pub initrd_start: u64,
    pub initrd_end: u64,
    pub num_cpus: u8,
}

fn pair(value: u64) -> [u32; 2] {
    [(value >> 32) as u32, value as u32]
}

/// Generate the device-tree blob for one machine configuration.
pub fn create_dtb(config: &DtbConfig) -> Result<Vec<u8>, Error> {
    let uart_path = format!("/soc/pl011@{:x}", UART_BASE);

    let mut fdt = FdtWriter::new()?;
    let root = fdt.begin_node("")?;
    fdt.property_string("compatible", "linux,dummy-virt")?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;

    let aliases = fdt.begin_node("aliases")?;
    fdt.property_string("serial0", &uart_path)?;
    fdt.end_node(aliases)?;

    let chosen = fdt.begin_node("chosen")?;
    fdt.property_string("bootargs", &config.cmdline)?;
    fdt.property_string("stdout-path", &uart_path)?;
    if config.initrd_start != 0 && config.initrd_end != 0 {
        fdt.property_array_u32("linux,initrd-start", &pair(config.initrd_start))?;
        fdt.property_array_u32("linux,initrd-end", &pair(config.initrd_end))?;
    }
    fdt.end_node(chosen)?;

    let memory = fdt.begin_node(&format!("memory@{:x}", RAM_BASE))?;
    fdt.property_string("device_type", "memory")?;
    let mut reg = Vec::new();
    reg.extend_from_slice(&pair(RAM_BASE));
    reg.extend_from_slice(&pair(config.ram_size));
    fdt.property_array_u32("reg", &reg)?;
    fdt.end_node(memory)?;

    let cpus = fdt.begin_node("cpus")?;
    fdt.property_u32("#address-cells", 1)?;
    fdt.property_u32("#size-cells", 0)?;
    for i in 0..u32::from(config.num_cpus) {
        let cpu = fdt.begin_node(&format!("cpu@{}", i))?;
        fdt.property_string("device_type", "cpu")?;
        fdt.property_string("compatible", "arm,cortex-a57")?;
        fdt.property_u32("reg", i)?;
        fdt.property_string("enable-method", "psci")?;
        fdt.end_node(cpu)?;
    }
    fdt.end_node(cpus)?;

    let psci = fdt.begin_node("psci")?;
    fdt.property_string_list(
        "compatible",
        vec!["arm,psci-1.0".to_string(), "arm,psci-0.2".to_string()],
    )?;
    fdt.property_string("method", "hvc")?;
    fdt.end_node(psci)?;

    let gic = fdt.begin_node(&format!("interrupt-controller@{:x}", GIC_DIST_BASE))?;
    fdt.property_string("compatible", "arm,gic-v3")?;
    fdt.property_u32("#interrupt-cells", 3)?;
    fdt.property_null("interrupt-controller")?;
    let mut reg = Vec::new();
    reg.extend_from_slice(&pair(GIC_DIST_BASE));
    reg.extend_from_slice(&pair(GIC_DIST_SIZE));
    reg.extend_from_slice(&pair(GIC_REDIST_BASE));
    reg.extend_from_slice(&pair(GIC_REDIST_SIZE));
    fdt.property_array_u32("reg", &reg)?;
    fdt.property_u32("phandle", GIC_PHANDLE)?;
    fdt.end_node(gic)?;

    let timer = fdt.begin_node("timer")?;
    fdt.property_string("compatible", "arm,armv8-timer")?;
    fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
    let mut interrupts = Vec::new();
    for ppi in [
        TIMER_PPI_SECURE_PHYS,
        TIMER_PPI_NONSECURE_PHYS,
        TIMER_PPI_VIRTUAL,
        TIMER_PPI_HYPERVISOR,
    ] {
        interrupts.extend_from_slice(&[IRQ_TYPE_PPI, ppi - PPI_BASE, IRQ_LEVEL_HI]);
    }
    fdt.property_array_u32("interrupts", &interrupts)?;
    fdt.property_null("always-on")?;
    fdt.end_node(timer)?;

    let clock = fdt.begin_node("apb-pclk")?;
    fdt.property_string("compatible", "fixed-clock")?;
    fdt.property_u32("#clock-cells", 0)?;
    fdt.property_u32("clock-frequency", 24_000_000)?;
    fdt.property_u32("phandle", CLOCK_PHANDLE)?;
    fdt.end_node(clock)?;

    let soc = fdt.begin_node("soc")?;
    fdt.property_string("compatible", "simple-bus")?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;
    fdt.property_null("ranges")?;

    let uart = fdt.begin_node(&format!("pl011@{:x}", UART_BASE))?;
    fdt.property_string_list(
        "compatible",
        vec!["arm,pl011".to_string(), "arm,primecell".to_string()],
    )?;
    fdt.property_string("status", "okay")?;
    fdt.property_u32("arm,primecell-periphid", 0x0024_1011)?;
    let mut reg = Vec::new();
    reg.extend_from_slice(&pair(UART_BASE));
    reg.extend_from_slice(&pair(UART_SIZE));
    fdt.property_array_u32("reg", &reg)?;
    fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
    fdt.property_array_u32("interrupts", &[IRQ_TYPE_SPI, UART_IRQ - 32, IRQ_LEVEL_HI])?;
    fdt.property_string_list(
        "clock-names",
        vec!["uartclk".to_string(), "apb_pclk".to_string()],
    )?;
    fdt.property_array_u32("clocks", &[CLOCK_PHANDLE, CLOCK_PHANDLE])?;
    fdt.end_node(uart)?;
    fdt.end_node(soc)?;

    fdt.end_node(root)?;
    fdt.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal flat-tree reader: walks the structure block and
    // returns the raw bytes of `prop` under the node at `path`
    // ("chosen", "soc/pl011@9000000", ...).
    fn be32(data: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    fn cstr(data: &[u8], offset: usize) -> &str {
        let end = data[offset..].iter().position(|&b| b == 0).unwrap() + offset;
        std::str::from_utf8(&data[offset..end]).unwrap()
    }

    fn find_prop(dtb: &[u8], path: &str, prop: &str) -> Option<Vec<u8>> {
        const BEGIN_NODE: u32 = 1;
        const END_NODE: u32 = 2;
        const PROP: u32 = 3;
        const NOP: u32 = 4;
        const END: u32 = 9;

        let off_struct = be32(dtb, 8) as usize;
        let off_strings = be32(dtb, 12) as usize;
        let mut pos = off_struct;
        let mut stack: Vec<String> = Vec::new();
        loop {
            let token = be32(dtb, pos);
            pos += 4;
            match token {
                BEGIN_NODE => {
                    let name = cstr(dtb, pos).to_string();
                    pos = (pos + name.len() + 1 + 3) & !3;
                    stack.push(name);
                }
                END_NODE => {
                    stack.pop();
                }
                PROP => {
                    let len = be32(dtb, pos) as usize;
                    let nameoff = be32(dtb, pos + 4) as usize;
                    let value = dtb[pos + 8..pos + 8 + len].to_vec();
                    pos = (pos + 8 + len + 3) & !3;
                    if stack[1..].join("/") == path && cstr(dtb, off_strings + nameoff) == prop {
                        return Some(value);
                    }
                }
                NOP => {}
                END => return None,
                other => panic!("bad FDT token {}", other),
            }
        }
    }

    fn u64_prop(value: &[u8]) -> u64 {
        u64::from_be_bytes(value.try_into().unwrap())
    }

    fn config() -> DtbConfig {
        DtbConfig {
            ram_size: 1 << 30,
            cmdline: "console=ttyAMA0".to_string(),
            initrd_start: 0x4800_0000,
            initrd_end: 0x4810_0000,
            num_cpus: 1,
        }
    }

    #[test]
    fn test_header_is_v17() {
        let dtb = create_dtb(&config()).unwrap();
        assert_eq!(be32(&dtb, 0), 0xd00d_feed);
        assert_eq!(be32(&dtb, 20), 17);
    }

    #[test]
    fn test_chosen_initrd_parse_back() {
        let dtb = create_dtb(&config()).unwrap();
        let start = find_prop(&dtb, "chosen", "linux,initrd-start").unwrap();
        let end = find_prop(&dtb, "chosen", "linux,initrd-end").unwrap();
        assert_eq!(u64_prop(&start), 0x4800_0000);
        assert_eq!(u64_prop(&end), 0x4810_0000);

        let bootargs = find_prop(&dtb, "chosen", "bootargs").unwrap();
        assert_eq!(bootargs, b"console=ttyAMA0\0");
    }

    #[test]
    fn test_no_initrd_props_without_initrd() {
        let mut cfg = config();
        cfg.initrd_start = 0;
        cfg.initrd_end = 0;
        let dtb = create_dtb(&cfg).unwrap();
        assert!(find_prop(&dtb, "chosen", "linux,initrd-start").is_none());
        assert!(find_prop(&dtb, "chosen", "stdout-path").is_some());
    }

    #[test]
    fn test_memory_node() {
        let dtb = create_dtb(&config()).unwrap();
        let reg = find_prop(&dtb, "memory@40000000", "reg").unwrap();
        assert_eq!(u64_prop(&reg[..8]), RAM_BASE);
        assert_eq!(u64_prop(&reg[8..]), 1 << 30);
        let device_type = find_prop(&dtb, "memory@40000000", "device_type").unwrap();
        assert_eq!(device_type, b"memory\0");
    }

    #[test]
    fn test_cpu_nodes_follow_count() {
        let mut cfg = config();
        cfg.num_cpus = 2;
        let dtb = create_dtb(&cfg).unwrap();
        let reg = find_prop(&dtb, "cpus/cpu@1", "reg").unwrap();
        assert_eq!(be32(&reg, 0), 1);
        let method = find_prop(&dtb, "cpus/cpu@1", "enable-method").unwrap();
        assert_eq!(method, b"psci\0");
        assert!(find_prop(&dtb, "cpus/cpu@2", "reg").is_none());
    }

    #[test]
    fn test_gic_node() {
        let dtb = create_dtb(&config()).unwrap();
        let path = "interrupt-controller@8000000";
        assert!(find_prop(&dtb, path, "interrupt-controller").is_some());
        let reg = find_prop(&dtb, path, "reg").unwrap();
        assert_eq!(u64_prop(&reg[..8]), GIC_DIST_BASE);
        assert_eq!(u64_prop(&reg[8..16]), GIC_DIST_SIZE);
        assert_eq!(u64_prop(&reg[16..24]), GIC_REDIST_BASE);
        assert_eq!(u64_prop(&reg[24..]), GIC_REDIST_SIZE);
        let phandle = find_prop(&dtb, path, "phandle").unwrap();
        assert_eq!(be32(&phandle, 0), 1);
    }

    #[test]
    fn test_timer_interrupt_triples() {
        let dtb = create_dtb(&config()).unwrap();
        let irqs = find_prop(&dtb, "timer", "interrupts").unwrap();
        let cells: Vec<u32> = irqs.chunks(4).map(|c| be32(c, 0)).collect();
        // Secure phys 29, non-secure phys 30, virtual 27, hyp 26, each
        // as <PPI, ppi - 16, level>.
        assert_eq!(
            cells,
            vec![1, 13, 4, 1, 14, 4, 1, 11, 4, 1, 10, 4]
        );
    }

    #[test]
    fn test_uart_node() {
        let dtb = create_dtb(&config()).unwrap();
        let path = "soc/pl011@9000000";
        let irqs = find_prop(&dtb, path, "interrupts").unwrap();
        let cells: Vec<u32> = irqs.chunks(4).map(|c| be32(c, 0)).collect();
        // SPI 1, level triggered.
        assert_eq!(cells, vec![0, 1, 4]);
        let clocks = find_prop(&dtb, path, "clocks").unwrap();
        assert_eq!(be32(&clocks, 0), 2);
        let alias = find_prop(&dtb, "aliases", "serial0").unwrap();
        assert_eq!(alias, b"/soc/pl011@9000000\0");
        let stdout = find_prop(&dtb, "chosen", "stdout-path").unwrap();
        assert_eq!(stdout, b"/soc/pl011@9000000\0");
    }

    #[test]
    fn test_psci_node() {
        let dtb = create_dtb(&config()).unwrap();
        let compatible = find_prop(&dtb, "psci", "compatible").unwrap();
        assert_eq!(compatible, b"arm,psci-1.0\0arm,psci-0.2\0");
        let method = find_prop(&dtb, "psci", "method").unwrap();
        assert_eq!(method, b"hvc\0");
    }
}
