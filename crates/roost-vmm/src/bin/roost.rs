//! roost — a minimal virtual machine monitor.
//!
//! Boots a Linux-style kernel or a raw binary on the host's hardware
//! virtualization facility, with an MMIO debug console and virtio
//! console/block/network devices.
//!
//! ```bash
//! roost --kernel vmlinux --mem 1G --cpus 2 --console
//! roost --binary guest.bin --entry 0x10000 --console
//! ```

use clap::Parser;
use log::{info, warn, LevelFilter};
use roost_vmm::hv;
use roost_vmm::vm::{Vm, VmConfig, MAX_VCPUS};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

/// Raised by SIGINT/SIGTERM; the main wait loop polls it.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "roost")]
#[command(about = "A minimal virtual machine monitor")]
#[command(version)]
struct Cli {
    /// Guest kernel image (vmlinux ELF / aarch64 Image).
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Initial RAM disk, loaded after the kernel.
    #[arg(long)]
    initrd: Option<PathBuf>,

    /// Kernel command line.
    #[arg(long)]
    cmdline: Option<String>,

    /// Guest RAM size, with K/M/G suffix (default 512M).
    #[arg(long, default_value = "512M", value_parser = parse_size)]
    mem: u64,

    /// Number of vCPUs.
    #[arg(long, default_value_t = 1)]
    cpus: usize,

    /// Disk image for the virtio block device.
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Network device: tap=<ifname>.
    #[arg(long, value_name = "tap=<ifname>")]
    net: Option<String>,

    /// PCI device to pass through (BDF), Linux only.
    #[arg(long, value_name = "BDF")]
    vfio: Option<String>,

    /// Enable the MMIO debug console.
    #[arg(long)]
    console: bool,

    /// Raw binary image, loaded at --entry.
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Entry point for the raw binary (hex).
    #[arg(long, default_value = "0", value_parser = parse_hex)]
    entry: u64,

    /// Log level: 0=none, 1=error, 2=warn, 3=info, 4=debug.
    #[arg(long, default_value_t = 3)]
    log: u8,
}

/// Parse a size with an optional K/M/G suffix.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    value
        .checked_mul(multiplier)
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("invalid size '{s}'"))
}

/// Parse a hex address, with or without a 0x prefix.
fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|_| format!("invalid address '{s}'"))
}

fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

fn setup_signals() {
    // Safety: installs an async-signal-safe handler that only stores an
    // atomic flag; SIGPIPE is ignored so stdio sinks cannot kill us.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_shutdown_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_RESTART;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(level_filter(cli.log))
        .init();

    if cli.kernel.is_none() && cli.binary.is_none() {
        eprintln!("error: no kernel or binary specified (use --kernel or --binary)");
        return ExitCode::FAILURE;
    }
    if cli.binary.is_some() && cli.entry == 0 {
        eprintln!("error: --binary requires an entry point (--entry)");
        return ExitCode::FAILURE;
    }
    if cli.cpus == 0 || cli.cpus > MAX_VCPUS {
        eprintln!("error: invalid vCPU count {} (max {MAX_VCPUS})", cli.cpus);
        return ExitCode::FAILURE;
    }
    let tap = match &cli.net {
        Some(net) => match net.strip_prefix("tap=") {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => {
                eprintln!("error: invalid --net value '{net}' (use tap=<ifname>)");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    match run(cli, tap) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, tap: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    setup_signals();

    let backend = hv::detect()?;
    info!("hypervisor backend: {}", backend.name());

    let cmdline = cli.cmdline.clone().or_else(|| {
        cli.kernel
            .is_some()
            .then(|| "console=hvc0 earlyprintk=serial panic=1".to_string())
    });
    let config = VmConfig {
        mem_size: cli.mem,
        num_vcpus: cli.cpus,
        kernel: cli.kernel,
        initrd: cli.initrd,
        cmdline,
        disk: cli.disk.clone(),
        tap: tap.clone(),
        console: cli.console,
        binary: cli.binary,
        entry: cli.entry,
    };

    let mut vm = Vm::new(&*backend, config)?;

    info!("allocating {} MiB of guest RAM", cli.mem / (1024 * 1024));
    vm.add_memory_region(0, cli.mem)?;
    vm.create_vcpus(cli.cpus)?;

    if cli.console {
        vm.attach_mmio_console()?;
    }
    vm.attach_virtio_console()?;
    if let Some(disk) = &cli.disk {
        vm.attach_virtio_block(disk)?;
    }
    if let Some(ifname) = &tap {
        vm.attach_virtio_net(ifname)?;
    }
    if let Some(bdf) = &cli.vfio {
        warn!("--vfio {bdf} ignored: PCI passthrough is not part of this build");
    }

    vm.load_boot_images()?;
    vm.start()?;
    info!("VM is running; press Ctrl+C to stop");

    vm.wait(&SHUTDOWN);
    vm.stop();
    vm.log_stats();

    if vm.had_vcpu_error() {
        return Err("a vCPU stopped with an error".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("0").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn entry_addresses_parse_as_hex() {
        assert_eq!(parse_hex("0x10000").unwrap(), 0x1_0000);
        assert_eq!(parse_hex("10000").unwrap(), 0x1_0000);
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn log_levels_map_onto_filters() {
        assert_eq!(level_filter(0), LevelFilter::Off);
        assert_eq!(level_filter(1), LevelFilter::Error);
        assert_eq!(level_filter(3), LevelFilter::Info);
        assert_eq!(level_filter(4), LevelFilter::Debug);
        assert_eq!(level_filter(9), LevelFilter::Debug);
    }
}
