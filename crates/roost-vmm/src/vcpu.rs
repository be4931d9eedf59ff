//! vCPU execution loop.
//!
//! One host thread per vCPU. Each iteration enters guest mode, classifies
//! the exit, and dispatches it: MMIO goes through the device table,
//! well-known I/O ports get minimal emulation, lifecycle exits flip the
//! stop flag. A fatal condition stops only this vCPU; the VM keeps
//! running until every vCPU has stopped.
//!
//! On backends that bind vCPU objects to their creating thread, both the
//! backend vCPU and its initial program counter are established at the
//! top of the vCPU thread, before the first run. On other backends the
//! handle may be created earlier and is simply moved into the thread.

use crate::devices::{DeviceTable, RouteResult};
use crate::hv::{Exit, HvError, IoDirection, VcpuHandle, VcpuKick, VmHandle};
use crate::memory::MemoryMap;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// COM1 register range, emulated just enough for guest printk output.
const SERIAL_PORT_BASE: u16 = 0x3f8;
const SERIAL_PORT_END: u16 = 0x3ff;

/// Consecutive identical exits tolerated before the PC is sampled for
/// forward progress. Guards against a backend bug spinning forever on
/// one unhandled access; a correct guest hits this only if it truly
/// makes no progress.
const NO_PROGRESS_EXIT_LIMIT: u64 = 10_000_000;

/// vCPU run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Stopped,
    Running,
    Waiting,
    Error,
}

impl VcpuState {
    fn from_u8(v: u8) -> VcpuState {
        match v {
            1 => VcpuState::Running,
            2 => VcpuState::Waiting,
            3 => VcpuState::Error,
            _ => VcpuState::Stopped,
        }
    }
}

/// Per-vCPU exit counters and timing.
///
/// Owned by the vCPU thread while it runs; published to the controller
/// at join time, so no atomics are needed.
#[derive(Debug, Default, Clone)]
pub struct ExitStats {
    pub total: u64,
    pub io: u64,
    pub mmio: u64,
    pub halt: u64,
    pub external: u64,
    pub shutdown: u64,
    pub fail_entry: u64,
    pub internal_error: u64,
    pub exception: u64,
    pub canceled: u64,
    pub vtimer: u64,
    /// Architectural trap classes that are acknowledged and continued.
    pub trap: u64,
    pub unknown: u64,
    /// Accesses routed to no device (each is also counted under `mmio`).
    pub unmapped_mmio: u64,
    /// Wall-clock time spent inside the backend's run call.
    pub run_time_us: u64,
}

impl ExitStats {
    /// Sum of the per-kind counters; equals `total` at all times.
    pub fn per_kind_sum(&self) -> u64 {
        self.io
            + self.mmio
            + self.halt
            + self.external
            + self.shutdown
            + self.fail_entry
            + self.internal_error
            + self.exception
            + self.canceled
            + self.vtimer
            + self.trap
            + self.unknown
    }
}

/// Control block shared between the controller and the vCPU thread.
struct VcpuShared {
    stop: AtomicBool,
    state: AtomicU8,
    kick: Mutex<Option<Box<dyn VcpuKick>>>,
}

/// One virtual CPU and its thread.
pub struct Vcpu {
    index: u32,
    shared: Arc<VcpuShared>,
    thread: Option<thread::JoinHandle<ExitStats>>,
    entry: Option<u64>,
    stats: ExitStats,
}

impl Vcpu {
    pub fn new(index: u32) -> Self {
        Vcpu {
            index,
            shared: Arc::new(VcpuShared {
                stop: AtomicBool::new(false),
                state: AtomicU8::new(VcpuState::Stopped as u8),
                kick: Mutex::new(None),
            }),
            thread: None,
            entry: None,
            stats: ExitStats::default(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Record the initial program counter; applied inside the vCPU's own
    /// thread before the first run.
    pub fn set_entry(&mut self, pc: u64) {
        self.entry = Some(pc);
    }

    pub fn state(&self) -> VcpuState {
        VcpuState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Counters as of the last join; zeros while the thread still runs.
    pub fn stats(&self) -> &ExitStats {
        &self.stats
    }

    /// True once the thread has finished (or never started).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Spawn the vCPU thread.
    ///
    /// `precreated` carries a backend handle made on the caller's thread;
    /// pass `None` on thread-affine backends so creation happens inside
    /// the new thread.
    pub fn start(
        &mut self,
        vm: Arc<dyn VmHandle>,
        memory: Arc<MemoryMap>,
        devices: Arc<Mutex<DeviceTable>>,
        precreated: Option<Box<dyn VcpuHandle>>,
    ) -> std::io::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::Release);

        let index = self.index;
        let entry = self.entry;
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("vcpu{index}"))
            .spawn(move || vcpu_thread(index, entry, shared, vm, memory, devices, precreated))?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Ask the vCPU to stop: set the flag, then kick it out of guest
    /// mode if the backend cannot otherwise unblock.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(kick) = self.shared.kick.lock().unwrap().as_ref() {
            kick.request_exit();
        }
    }

    /// Wait for the thread to exit and absorb its counters.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(stats) => self.stats = stats,
                Err(_) => {
                    error!("vCPU {} thread panicked", self.index);
                    self.shared
                        .state
                        .store(VcpuState::Error as u8, Ordering::Release);
                }
            }
        }
    }

    /// Stop and join.
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Thread body ─────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn vcpu_thread(
    index: u32,
    entry: Option<u64>,
    shared: Arc<VcpuShared>,
    vm: Arc<dyn VmHandle>,
    memory: Arc<MemoryMap>,
    devices: Arc<Mutex<DeviceTable>>,
    precreated: Option<Box<dyn VcpuHandle>>,
) -> ExitStats {
    debug!("vCPU {index} thread started");

    let mut hv = match precreated {
        Some(hv) => hv,
        None => match vm.create_vcpu(index) {
            Ok(hv) => hv,
            Err(e) => {
                error!("vCPU {index}: backend creation failed: {e}");
                shared
                    .state
                    .store(VcpuState::Error as u8, Ordering::Release);
                return ExitStats::default();
            }
        },
    };

    if let Some(pc) = entry {
        debug!("vCPU {index}: applying initial PC {pc:#x}");
        if let Err(e) = hv.set_regs(&crate::hv::Regs::at_entry(pc)) {
            error!("vCPU {index}: failed to set initial registers: {e}");
            shared
                .state
                .store(VcpuState::Error as u8, Ordering::Release);
            return ExitStats::default();
        }
    }

    *shared.kick.lock().unwrap() = Some(hv.kick_handle());

    let mut runner = Runner {
        index,
        vm: &*vm,
        memory: &memory,
        devices: &devices,
        stats: ExitStats::default(),
        logged_unmapped: HashSet::new(),
    };
    let final_state = runner.run(&mut *hv, &shared);
    shared.state.store(final_state as u8, Ordering::Release);

    info!(
        "vCPU {index} stopped: {} exits ({} mmio, {} halt, {} unknown)",
        runner.stats.total, runner.stats.mmio, runner.stats.halt, runner.stats.unknown
    );
    runner.stats
}

/// What one dispatched exit means for the loop.
enum Flow {
    Continue,
    /// Clean stop (shutdown, cancel, stop flag).
    Stop,
    /// Stop with the vCPU in the error state.
    Fatal,
}

struct Runner<'a> {
    index: u32,
    vm: &'a dyn VmHandle,
    memory: &'a MemoryMap,
    devices: &'a Mutex<DeviceTable>,
    stats: ExitStats,
    logged_unmapped: HashSet<u64>,
}

impl Runner<'_> {
    fn run(&mut self, hv: &mut dyn VcpuHandle, shared: &VcpuShared) -> VcpuState {
        let mut guard = StallGuard::default();
        while !shared.stop.load(Ordering::Acquire) {
            shared
                .state
                .store(VcpuState::Running as u8, Ordering::Release);

            let started = Instant::now();
            let exit = match hv.run() {
                Ok(exit) => {
                    self.stats.run_time_us += started.elapsed().as_micros() as u64;
                    exit
                }
                Err(HvError::Interrupted) => continue,
                Err(e) => {
                    error!("vCPU {}: run failed: {e}", self.index);
                    return VcpuState::Error;
                }
            };

            self.stats.total += 1;
            match self.dispatch(hv, exit, shared) {
                Flow::Continue => {}
                Flow::Stop => return VcpuState::Stopped,
                Flow::Fatal => return VcpuState::Error,
            }
            if guard.observe(&exit, hv) {
                error!(
                    "vCPU {}: no forward progress after {NO_PROGRESS_EXIT_LIMIT} identical exits, stopping",
                    self.index
                );
                return VcpuState::Error;
            }
        }
        VcpuState::Stopped
    }

    fn dispatch(&mut self, hv: &mut dyn VcpuHandle, exit: Exit, shared: &VcpuShared) -> Flow {
        match exit {
            Exit::Halt => {
                self.stats.halt += 1;
                shared
                    .state
                    .store(VcpuState::Waiting as u8, Ordering::Release);
                Flow::Continue
            }
            Exit::PortIo {
                port,
                size,
                dir,
                data,
            } => {
                self.stats.io += 1;
                self.handle_port_io(hv, port, size, dir, data);
                Flow::Continue
            }
            Exit::Mmio {
                addr,
                size,
                dir,
                data,
            } => {
                self.stats.mmio += 1;
                self.handle_mmio(hv, addr, size, dir, data);
                Flow::Continue
            }
            Exit::External => {
                self.stats.external += 1;
                Flow::Continue
            }
            Exit::Shutdown => {
                info!("vCPU {}: guest shutdown", self.index);
                self.stats.shutdown += 1;
                shared.stop.store(true, Ordering::Release);
                Flow::Stop
            }
            Exit::SystemEvent => {
                info!("vCPU {}: system event, stopping", self.index);
                self.stats.shutdown += 1;
                shared.stop.store(true, Ordering::Release);
                Flow::Stop
            }
            Exit::FailEntry { code } => {
                error!("vCPU {}: failed guest entry (code {code:#x})", self.index);
                self.stats.fail_entry += 1;
                shared.stop.store(true, Ordering::Release);
                Flow::Fatal
            }
            Exit::InternalError { code } => {
                error!("vCPU {}: backend internal error ({code:#x})", self.index);
                self.stats.internal_error += 1;
                shared.stop.store(true, Ordering::Release);
                Flow::Fatal
            }
            Exit::Exception {
                syndrome,
                fault_addr,
            } => {
                // Recoverable traps were already consumed by the backend's
                // classification; anything that reaches here is fatal for
                // this vCPU.
                warn!(
                    "vCPU {}: unhandled guest exception (syndrome {syndrome:#x}, addr {fault_addr:#x})",
                    self.index
                );
                self.stats.exception += 1;
                shared.stop.store(true, Ordering::Release);
                Flow::Stop
            }
            Exit::Canceled => {
                debug!("vCPU {}: canceled", self.index);
                self.stats.canceled += 1;
                shared.stop.store(true, Ordering::Release);
                Flow::Stop
            }
            Exit::VirtualTimer => {
                // Recorded only; a full implementation would inject the
                // timer interrupt.
                self.stats.vtimer += 1;
                Flow::Continue
            }
            Exit::IrqWindow
            | Exit::TprAccess
            | Exit::Nmi
            | Exit::MsrRead
            | Exit::MsrWrite
            | Exit::Hypercall
            | Exit::DirtyLogFull
            | Exit::BusLock
            | Exit::Debug => {
                debug!("vCPU {}: architectural trap {exit:?}", self.index);
                self.stats.trap += 1;
                Flow::Continue
            }
            Exit::Unknown { reason } => {
                warn!("vCPU {}: unknown exit reason {reason:#x}", self.index);
                self.stats.unknown += 1;
                shared.stop.store(true, Ordering::Release);
                Flow::Fatal
            }
        }
    }

    fn handle_port_io(
        &mut self,
        hv: &mut dyn VcpuHandle,
        port: u16,
        size: u8,
        dir: IoDirection,
        data: u32,
    ) {
        if (SERIAL_PORT_BASE..=SERIAL_PORT_END).contains(&port) {
            match dir {
                IoDirection::Write => {
                    if port == SERIAL_PORT_BASE {
                        let bytes = data.to_le_bytes();
                        let out = &bytes[..(size as usize).min(4)];
                        let mut stdout = std::io::stdout();
                        let _ = stdout.write_all(out);
                        let _ = stdout.flush();
                    }
                }
                IoDirection::Read => {
                    let _ = hv.complete_read(0);
                }
            }
            return;
        }
        debug!(
            "vCPU {}: unhandled I/O port {port:#x} ({dir:?}, {size} bytes)",
            self.index
        );
        if dir == IoDirection::Read {
            let _ = hv.complete_read(0);
        }
    }

    fn handle_mmio(
        &mut self,
        hv: &mut dyn VcpuHandle,
        addr: u64,
        size: u8,
        dir: IoDirection,
        data: u64,
    ) {
        let size = (size as usize).clamp(1, 8);
        match dir {
            IoDirection::Read => {
                let mut buf = [0u8; 8];
                let routed = self
                    .devices
                    .lock()
                    .unwrap()
                    .handle_read(self.memory, addr, &mut buf[..size]);
                if routed == RouteResult::Unmapped {
                    self.note_unmapped(addr);
                    buf = [0u8; 8];
                }
                let _ = hv.complete_read(u64::from_le_bytes(buf));
            }
            IoDirection::Write => {
                let bytes = data.to_le_bytes();
                let routed = self
                    .devices
                    .lock()
                    .unwrap()
                    .handle_write(self.memory, addr, &bytes[..size]);
                match routed {
                    RouteResult::Handled(Some((irq, level))) => {
                        if let Err(e) = self.vm.irq_line(irq, level) {
                            debug!("irq_line({irq}, {level}) failed: {e}");
                        }
                    }
                    RouteResult::Handled(None) => {}
                    RouteResult::Unmapped => self.note_unmapped(addr),
                }
            }
        }
    }

    /// Count an unmapped access; diagnose each faulting address once.
    fn note_unmapped(&mut self, addr: u64) {
        self.stats.unmapped_mmio += 1;
        if self.logged_unmapped.insert(addr) {
            warn!("MMIO to unmapped address: {addr:#010x}");
        }
    }
}

// ─── Forward-progress guard ──────────────────────────────────────────

/// Detects a vCPU stuck producing the same exit at the same PC.
///
/// The hot path only compares the exit descriptor; the PC (one register
/// read) is sampled when the identical-exit streak crosses the limit, so
/// a healthy guest never pays for it.
#[derive(Default)]
struct StallGuard {
    key: Option<(u8, u64)>,
    count: u64,
    sampled_pc: Option<u64>,
}

impl StallGuard {
    /// Returns true when the vCPU should be declared stuck.
    fn observe(&mut self, exit: &Exit, hv: &dyn VcpuHandle) -> bool {
        let key = match exit {
            Exit::Mmio { addr, .. } => Some((0u8, *addr)),
            Exit::PortIo { port, .. } => Some((1u8, *port as u64)),
            Exit::Halt => Some((2u8, 0)),
            _ => None,
        };
        let Some(key) = key else {
            self.key = None;
            self.count = 0;
            self.sampled_pc = None;
            return false;
        };
        if self.key == Some(key) {
            self.count += 1;
        } else {
            self.key = Some(key);
            self.count = 1;
            self.sampled_pc = None;
        }
        if self.count % NO_PROGRESS_EXIT_LIMIT == 0 {
            let pc = hv.get_regs().map(|r| r.instruction_pointer()).unwrap_or(0);
            if self.sampled_pc == Some(pc) {
                return true;
            }
            self.sampled_pc = Some(pc);
        }
        false
    }
}
