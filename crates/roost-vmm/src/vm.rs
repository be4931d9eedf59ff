//! VM controller.
//!
//! [`Vm`] is the top-level aggregate: it owns the backend VM handle, the
//! guest memory map, the device table, and the vCPU set, and provides the
//! build-out and lifecycle entry points. A VM is created stopped, becomes
//! running when its vCPUs start, and returns to stopped when the last of
//! them exits or a stop is requested; teardown happens in reverse order
//! of construction (vCPUs, devices, memory slots, backend VM).
//!
//! The memory map and device table are frozen once the VM starts: slots
//! and devices are registered only while stopped, which is what makes
//! them safely shareable with the vCPU threads.

use crate::devices::mmio_console::{MmioConsole, MMIO_CONSOLE_SIZE};
use crate::devices::virtio::block::VirtioBlock;
use crate::devices::virtio::console::VirtioConsole;
use crate::devices::virtio::{VirtioMmio, VIRTIO_MMIO_SIZE};
use crate::devices::{DeviceError, DeviceTable, MmioDevice};
use crate::hv::{HvError, Hypervisor, VmHandle};
use crate::loader;
use crate::memory::{MemoryError, MemoryMap};
use crate::vcpu::{Vcpu, VcpuState};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Maximum number of vCPUs per VM.
pub const MAX_VCPUS: usize = 8;

/// Default guest RAM size (512 MiB).
pub const DEFAULT_MEM_SIZE: u64 = 512 * 1024 * 1024;

// Fixed guest physical layout. RAM occupies [0, mem_size); the device
// windows below sit above the low-RAM area used by small test guests.
pub const MMIO_CONSOLE_BASE: u64 = 0x0090_0000;
pub const VIRTIO_CONSOLE_BASE: u64 = 0x00a0_0000;
pub const VIRTIO_BLOCK_BASE: u64 = 0x00a0_1000;
pub const VIRTIO_NET_BASE: u64 = 0x00a0_2000;

/// How often the idle main thread re-checks vCPU stop flags.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Hv(#[from] HvError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Loader(#[from] loader::LoaderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("too many vCPUs: {0} (max {MAX_VCPUS})")]
    TooManyVcpus(usize),

    #[error("operation requires a stopped VM")]
    NotStopped,
}

/// VM configuration, normally filled from the command line.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub mem_size: u64,
    pub num_vcpus: usize,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub cmdline: Option<String>,
    pub disk: Option<PathBuf>,
    pub tap: Option<String>,
    pub console: bool,
    pub binary: Option<PathBuf>,
    pub entry: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            mem_size: DEFAULT_MEM_SIZE,
            num_vcpus: 1,
            kernel: None,
            initrd: None,
            cmdline: None,
            disk: None,
            tap: None,
            console: false,
            binary: None,
            entry: 0,
        }
    }
}

/// VM lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Running,
}

/// The top-level virtual machine.
pub struct Vm {
    hv: Arc<dyn VmHandle>,
    memory: Arc<MemoryMap>,
    devices: Arc<Mutex<DeviceTable>>,
    vcpus: Vec<Vcpu>,
    state: VmState,
    config: VmConfig,
}

impl Vm {
    /// Create a stopped VM on the given backend.
    pub fn new(backend: &dyn Hypervisor, config: VmConfig) -> Result<Self, VmError> {
        let hv = backend.create_vm()?;
        info!("VM created on {} backend", backend.name());
        Ok(Vm {
            hv,
            memory: Arc::new(MemoryMap::new()),
            devices: Arc::new(Mutex::new(DeviceTable::new())),
            vcpus: Vec::new(),
            state: VmState::Stopped,
            config,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    // ─── Build-out (stopped VM only) ─────────────────────────────────

    /// Allocate and install a guest RAM region.
    pub fn add_memory_region(&mut self, gpa: u64, size: u64) -> Result<u32, VmError> {
        if self.state != VmState::Stopped {
            return Err(VmError::NotStopped);
        }
        let memory = Arc::get_mut(&mut self.memory).ok_or(VmError::NotStopped)?;
        Ok(memory.add_region(&*self.hv, gpa, size)?)
    }

    /// Register an MMIO device over `[base, base + len)`.
    pub fn register_device(
        &mut self,
        name: &str,
        base: u64,
        len: u64,
        dev: Box<dyn MmioDevice>,
    ) -> Result<u32, VmError> {
        if self.state != VmState::Stopped {
            return Err(VmError::NotStopped);
        }
        Ok(self.devices.lock().unwrap().register(name, base, len, dev)?)
    }

    /// Attach the UART debug console at its fixed window.
    pub fn attach_mmio_console(&mut self) -> Result<(), VmError> {
        if self.state != VmState::Stopped {
            return Err(VmError::NotStopped);
        }
        let console = MmioConsole::stdout()?;
        let signal = console.irq_signal()?;
        self.devices.lock().unwrap().register_with_signal(
            "mmio-console",
            MMIO_CONSOLE_BASE,
            MMIO_CONSOLE_SIZE,
            Box::new(console),
            signal,
        )?;
        Ok(())
    }

    /// Attach the virtio console at its fixed window.
    pub fn attach_virtio_console(&mut self) -> Result<(), VmError> {
        let dev = VirtioMmio::new(Box::new(VirtioConsole::stdout()));
        self.register_device(
            "virtio-console",
            VIRTIO_CONSOLE_BASE,
            VIRTIO_MMIO_SIZE,
            Box::new(dev),
        )?;
        Ok(())
    }

    /// Attach a virtio block device backed by `path`.
    pub fn attach_virtio_block(&mut self, path: &std::path::Path) -> Result<(), VmError> {
        let dev = VirtioMmio::new(Box::new(VirtioBlock::open(path)?));
        self.register_device(
            "virtio-block",
            VIRTIO_BLOCK_BASE,
            VIRTIO_MMIO_SIZE,
            Box::new(dev),
        )?;
        Ok(())
    }

    /// Attach a virtio network device bridged to the TAP interface.
    #[cfg(target_os = "linux")]
    pub fn attach_virtio_net(&mut self, ifname: &str) -> Result<(), VmError> {
        use crate::devices::virtio::net::VirtioNet;
        let dev = VirtioMmio::new(Box::new(VirtioNet::open(ifname)?));
        self.register_device(
            "virtio-net",
            VIRTIO_NET_BASE,
            VIRTIO_MMIO_SIZE,
            Box::new(dev),
        )?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn attach_virtio_net(&mut self, _ifname: &str) -> Result<(), VmError> {
        Err(VmError::Hv(HvError::Unsupported(
            "TAP networking requires Linux",
        )))
    }

    /// Create the vCPU set.
    pub fn create_vcpus(&mut self, count: usize) -> Result<(), VmError> {
        if self.state != VmState::Stopped {
            return Err(VmError::NotStopped);
        }
        if count == 0 || count > MAX_VCPUS {
            return Err(VmError::TooManyVcpus(count));
        }
        self.vcpus = (0..count as u32).map(Vcpu::new).collect();
        info!("created {count} vCPU(s)");
        Ok(())
    }

    /// Record the initial program counter for every vCPU; it is applied
    /// inside each vCPU's own thread before its first run.
    pub fn set_entry(&mut self, pc: u64) {
        for vcpu in &mut self.vcpus {
            vcpu.set_entry(pc);
        }
    }

    /// Load the configured kernel or raw binary (plus initrd and command
    /// line) into guest RAM and point the vCPUs at the entry.
    pub fn load_boot_images(&mut self) -> Result<(), VmError> {
        if let Some(binary) = self.config.binary.clone() {
            let image = loader::load_raw(&self.memory, &binary, self.config.entry)?;
            self.set_entry(image.entry);
            return Ok(());
        }
        if let Some(kernel) = self.config.kernel.clone() {
            let image = loader::load_kernel(&self.memory, &kernel)?;
            if let Some(initrd) = self.config.initrd.clone() {
                loader::load_initrd(&self.memory, &initrd, image.end)?;
            }
            if let Some(cmdline) = self.config.cmdline.clone() {
                loader::write_cmdline(&self.memory, &cmdline)?;
            }
            self.set_entry(image.entry);
        }
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Start every vCPU. On backends that bind vCPUs to their creating
    /// thread, backend construction is deferred into each vCPU thread;
    /// elsewhere the handles are created here and moved in.
    pub fn start(&mut self) -> Result<(), VmError> {
        if self.state == VmState::Running {
            return Ok(());
        }
        info!("starting VM");
        let thread_affine = self.hv.vcpu_thread_affine();
        for i in 0..self.vcpus.len() {
            let precreated = if thread_affine {
                None
            } else {
                match self.hv.create_vcpu(self.vcpus[i].index()) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        self.stop_first(i);
                        return Err(e.into());
                    }
                }
            };
            let started = self.vcpus[i].start(
                Arc::clone(&self.hv),
                Arc::clone(&self.memory),
                Arc::clone(&self.devices),
                precreated,
            );
            if let Err(e) = started {
                self.stop_first(i);
                return Err(e.into());
            }
        }
        self.state = VmState::Running;
        info!("VM running");
        Ok(())
    }

    fn stop_first(&mut self, count: usize) {
        for vcpu in &mut self.vcpus[..count] {
            vcpu.stop();
        }
    }

    /// Cooperatively stop every vCPU: flags first, then kicks, then join.
    pub fn stop(&mut self) {
        if self.state == VmState::Stopped {
            return;
        }
        info!("stopping VM");
        for vcpu in &self.vcpus {
            vcpu.request_stop();
        }
        for vcpu in &mut self.vcpus {
            vcpu.join();
        }
        self.state = VmState::Stopped;
        info!("VM stopped");
    }

    /// True once every vCPU thread has exited.
    pub fn all_vcpus_finished(&self) -> bool {
        self.vcpus.iter().all(|v| v.is_finished())
    }

    /// True if any vCPU ended in the error state.
    pub fn had_vcpu_error(&self) -> bool {
        self.vcpus.iter().any(|v| v.state() == VcpuState::Error)
    }

    /// Block until every vCPU has stopped or `shutdown` is raised,
    /// polling at a coarse cadence.
    pub fn wait(&mut self, shutdown: &AtomicBool) {
        while self.state == VmState::Running {
            if shutdown.load(Ordering::Acquire) {
                info!("shutdown requested");
                break;
            }
            if self.all_vcpus_finished() {
                break;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Log the per-vCPU exit counters.
    pub fn log_stats(&self) {
        for vcpu in &self.vcpus {
            let s = vcpu.stats();
            info!(
                "vCPU {}: exits={} io={} mmio={} halt={} shutdown={} exception={} \
                 canceled={} vtimer={} unknown={} unmapped={} run_time={}us",
                vcpu.index(),
                s.total,
                s.io,
                s.mmio,
                s.halt,
                s.shutdown,
                s.exception,
                s.canceled,
                s.vtimer,
                s.unknown,
                s.unmapped_mmio,
                s.run_time_us,
            );
        }
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.stop();
        // vCPU threads are joined; devices drop with the table. Unmap
        // the memory slots from the backend before the VM handle goes.
        if let Some(memory) = Arc::get_mut(&mut self.memory) {
            memory.destroy(&*self.hv);
        } else {
            warn!("guest memory still shared at teardown; skipping unmap");
        }
    }
}
