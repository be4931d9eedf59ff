//! Hypervisor backend abstraction.
//!
//! The rest of the VMM talks to the host virtualization facility through
//! three object-safe traits: [`Hypervisor`] (process-wide facility),
//! [`VmHandle`] (one guest), and [`VcpuHandle`] (one virtual CPU). A
//! concrete backend is selected once at startup by [`detect`] based on the
//! host OS and architecture.
//!
//! Each backend converts its platform-native exit data into the portable
//! [`Exit`] descriptor. Register state crosses the boundary in the
//! union-shaped [`Regs`]/[`Sregs`] bundles: both supported architectures
//! share one struct, and fields that are meaningless for the current host
//! are simply left untouched.

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub mod hvf_aarch64;
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub mod hvf_x86_64;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod kvm;

use std::sync::Arc;
use thiserror::Error;

// ─── Memory slots ────────────────────────────────────────────────────

/// Slot flag: guest may read through this mapping.
pub const SLOT_READ: u32 = 1 << 0;
/// Slot flag: guest may write through this mapping.
pub const SLOT_WRITE: u32 = 1 << 1;
/// Slot flag: guest may execute from this mapping.
pub const SLOT_EXEC: u32 = 1 << 2;
/// Slot flag: backend should track dirty pages for this mapping.
pub const SLOT_DIRTY_LOG: u32 = 1 << 3;

/// One contiguous GPA → HVA mapping as handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct MemSlot {
    /// Backend slot index.
    pub slot: u32,
    /// Guest physical base address (page aligned).
    pub gpa: u64,
    /// Size in bytes.
    pub size: u64,
    /// Host virtual address backing the region.
    pub host_addr: u64,
    /// `SLOT_*` flag bits.
    pub flags: u32,
}

// ─── Exit descriptors ────────────────────────────────────────────────

/// Direction of an I/O or MMIO access, from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// Guest load: the VMM supplies the data via
    /// [`VcpuHandle::complete_read`].
    Read,
    /// Guest store: the data travelled with the exit.
    Write,
}

/// Portable VM-exit descriptor.
///
/// Produced by [`VcpuHandle::run`] after the guest leaves execution. The
/// variants cover both supported platforms; a backend that cannot map a
/// native reason reports [`Exit::Unknown`] with the native code preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// x86 port I/O access.
    PortIo {
        port: u16,
        size: u8,
        dir: IoDirection,
        data: u32,
    },
    /// Access to a guest physical address not covered by any memory slot.
    Mmio {
        addr: u64,
        size: u8,
        dir: IoDirection,
        data: u64,
    },
    /// Guest executed HLT / WFI.
    Halt,
    /// External event (interrupt); reschedulable, no payload.
    External,
    /// The backend failed to enter guest mode.
    FailEntry { code: u64 },
    /// Guest reached a fatal state (triple fault equivalent).
    Shutdown,
    /// Backend internal error.
    InternalError { code: u64 },
    /// Guest exception the backend did not consume.
    Exception { syndrome: u64, fault_addr: u64 },
    /// Asynchronous host request took the vCPU out of guest mode.
    Canceled,
    /// Virtual timer fired.
    VirtualTimer,
    /// Interrupt window opened (x86).
    IrqWindow,
    /// Task-priority register access (x86).
    TprAccess,
    /// NMI window opened (x86).
    Nmi,
    /// System event such as a reset or shutdown request.
    SystemEvent,
    /// MSR read trapped (x86).
    MsrRead,
    /// MSR write trapped (x86).
    MsrWrite,
    /// Guest hypercall.
    Hypercall,
    /// Dirty-page log is full.
    DirtyLogFull,
    /// Bus lock detected (x86).
    BusLock,
    /// Debug trap.
    Debug,
    /// Anything the backend could not classify.
    Unknown { reason: u64 },
}

// ─── Register bundles ────────────────────────────────────────────────

/// General-purpose register bundle covering both host architectures.
///
/// Backends read and write only the fields that exist on their
/// architecture; callers must not assume the other half is meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    // x86_64
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    // aarch64
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl Regs {
    /// A register bundle positioned at `entry`, with the architectural
    /// minimum of other state set (RFLAGS reserved bit on x86).
    pub fn at_entry(entry: u64) -> Self {
        Regs {
            rip: entry,
            rflags: 0x2,
            pc: entry,
            ..Default::default()
        }
    }

    /// The instruction pointer for the host architecture.
    pub fn instruction_pointer(&self) -> u64 {
        if cfg!(target_arch = "x86_64") {
            self.rip
        } else {
            self.pc
        }
    }
}

/// One segment register (x86).
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
}

/// GDT/IDT descriptor table register (x86).
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// System/control register bundle.
///
/// Shaped after the x86 state; ARM backends ignore it, matching the
/// behaviour of the platforms themselves (there is nothing to apply).
#[derive(Debug, Clone, Copy, Default)]
pub struct Sregs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub ldt: Segment,
    pub tr: Segment,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
}

// ─── Errors ──────────────────────────────────────────────────────────

/// Typed failures from the backend layer.
#[derive(Debug, Error)]
pub enum HvError {
    /// The hypervisor facility is not present or not accessible.
    #[error("hypervisor unavailable: {reason}\n  hint: {advice}")]
    Unavailable { reason: String, advice: &'static str },

    /// Privilege or entitlement missing.
    #[error("hypervisor access denied: {reason}\n  hint: {advice}")]
    PermissionDenied { reason: String, advice: &'static str },

    /// Caller misuse (bad size, unaligned address, out-of-range index).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A fixed backend resource limit was reached.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// The platform returned an error we cannot reinterpret.
    #[error("{op} failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Benign interruption (signal); the caller should retry.
    #[error("interrupted")]
    Interrupted,

    /// The operation is not modelled by this backend.
    #[error("not supported by this backend: {0}")]
    Unsupported(&'static str),
}

impl HvError {
    /// Wrap a raw OS error from a backend call.
    pub fn backend(op: &'static str, errno: i32) -> Self {
        HvError::Backend {
            op,
            source: std::io::Error::from_raw_os_error(errno),
        }
    }
}

// ─── Capability traits ───────────────────────────────────────────────

/// The process-wide hypervisor facility.
///
/// Constructing an implementation performs the one-shot bring-up probe and
/// reports a typed [`HvError::Unavailable`] / [`HvError::PermissionDenied`]
/// with remediation advice when the host cannot run guests.
pub trait Hypervisor: Send + Sync {
    /// Human-readable backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Construct a backend VM object.
    fn create_vm(&self) -> Result<Arc<dyn VmHandle>, HvError>;
}

/// One guest machine as seen by the backend.
pub trait VmHandle: Send + Sync {
    /// Install a contiguous GPA → HVA mapping. Ranges not covered by any
    /// slot trap out of the guest as MMIO.
    fn map_region(&self, slot: &MemSlot) -> Result<(), HvError>;

    /// Remove the mapping installed under `slot`.
    fn unmap_region(&self, slot: u32) -> Result<(), HvError>;

    /// Construct a backend vCPU.
    ///
    /// When [`vcpu_thread_affine`](Self::vcpu_thread_affine) is true the
    /// returned handle is bound to the calling thread and must be created,
    /// configured, and run there.
    fn create_vcpu(&self, index: u32) -> Result<Box<dyn VcpuHandle>, HvError>;

    /// Whether vCPU objects are bound to the thread that creates them.
    fn vcpu_thread_affine(&self) -> bool {
        false
    }

    /// Assert or deassert a level-triggered interrupt line. A no-op on
    /// backends that do not model a line-based interrupt controller.
    fn irq_line(&self, irq: u32, level: bool) -> Result<(), HvError>;
}

/// One virtual CPU.
pub trait VcpuHandle: Send {
    /// Enter guest mode until an exit condition or an asynchronous exit
    /// request, then classify the exit. Returns
    /// [`HvError::Interrupted`] for benign signal wakeups; the caller
    /// treats that as a loop continuation.
    fn run(&mut self) -> Result<Exit, HvError>;

    /// Supply the value of a pending MMIO or port-I/O read before the
    /// next [`run`](Self::run). A no-op when no read is pending.
    fn complete_read(&mut self, data: u64) -> Result<(), HvError>;

    fn get_regs(&self) -> Result<Regs, HvError>;
    fn set_regs(&self, regs: &Regs) -> Result<(), HvError>;
    fn get_sregs(&self) -> Result<Sregs, HvError>;
    fn set_sregs(&self, sregs: &Sregs) -> Result<(), HvError>;

    /// A handle other threads can use to kick this vCPU out of guest
    /// mode. Must be called on the thread that runs the vCPU.
    fn kick_handle(&self) -> Box<dyn VcpuKick>;
}

/// Asynchronous request that a vCPU leave guest mode as soon as possible.
pub trait VcpuKick: Send + Sync {
    fn request_exit(&self);
}

// ─── Backend selection ───────────────────────────────────────────────

/// Probe and return the hypervisor backend for this host.
#[allow(unreachable_code)]
pub fn detect() -> Result<Arc<dyn Hypervisor>, HvError> {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        return Ok(Arc::new(kvm::KvmHypervisor::new()?));
    }
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        return Ok(Arc::new(hvf_aarch64::HvfHypervisor::new()?));
    }
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        return Ok(Arc::new(hvf_x86_64::HvfHypervisor::new()?));
    }
    Err(HvError::Unavailable {
        reason: "no backend for this host OS/architecture".to_string(),
        advice: "supported hosts: Linux x86_64 (KVM), macOS (Hypervisor.framework)",
    })
}

// ─── Test doubles ────────────────────────────────────────────────────

/// Crate-internal fake backend used by the memory, vCPU, and VM tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Condvar, Mutex};

    /// A backend facility that hands out one pre-built [`FakeVm`].
    pub struct FakeHypervisor {
        pub vm: Arc<FakeVm>,
    }

    impl FakeHypervisor {
        pub fn new(vm: FakeVm) -> Self {
            FakeHypervisor { vm: Arc::new(vm) }
        }
    }

    impl Hypervisor for FakeHypervisor {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn create_vm(&self) -> Result<Arc<dyn VmHandle>, HvError> {
            Ok(Arc::clone(&self.vm) as Arc<dyn VmHandle>)
        }
    }

    /// Records every backend interaction instead of touching a hypervisor.
    #[derive(Default)]
    pub struct FakeVm {
        pub mapped: Mutex<Vec<MemSlot>>,
        pub unmapped: Mutex<Vec<u32>>,
        pub irq_events: Mutex<Vec<(u32, bool)>>,
        pub thread_affine: bool,
        pub vcpus: Mutex<VecDeque<ScriptedVcpu>>,
    }

    impl FakeVm {
        pub fn with_vcpus(vcpus: Vec<ScriptedVcpu>) -> Self {
            FakeVm {
                vcpus: Mutex::new(vcpus.into()),
                ..Default::default()
            }
        }
    }

    impl VmHandle for FakeVm {
        fn map_region(&self, slot: &MemSlot) -> Result<(), HvError> {
            self.mapped.lock().unwrap().push(*slot);
            Ok(())
        }

        fn unmap_region(&self, slot: u32) -> Result<(), HvError> {
            self.unmapped.lock().unwrap().push(slot);
            Ok(())
        }

        fn create_vcpu(&self, index: u32) -> Result<Box<dyn VcpuHandle>, HvError> {
            match self.vcpus.lock().unwrap().pop_front() {
                Some(v) => Ok(Box::new(v)),
                None => Err(HvError::OutOfResources(format!(
                    "no scripted vCPU for index {index}"
                ))),
            }
        }

        fn vcpu_thread_affine(&self) -> bool {
            self.thread_affine
        }

        fn irq_line(&self, irq: u32, level: bool) -> Result<(), HvError> {
            self.irq_events.lock().unwrap().push((irq, level));
            Ok(())
        }
    }

    /// What a [`ScriptedVcpu`] does once its script runs out.
    pub enum OnEmpty {
        /// Report a guest shutdown.
        Shutdown,
        /// Block until kicked, then report [`Exit::Canceled`].
        BlockUntilKick,
    }

    #[derive(Default)]
    pub struct KickState {
        kicked: Mutex<bool>,
        cv: Condvar,
    }

    impl KickState {
        fn wait(&self) {
            let mut kicked = self.kicked.lock().unwrap();
            while !*kicked {
                kicked = self.cv.wait(kicked).unwrap();
            }
        }

        fn fire(&self) {
            *self.kicked.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    /// A vCPU that replays a fixed exit script.
    pub struct ScriptedVcpu {
        script: Vec<Exit>,
        pos: usize,
        on_empty: OnEmpty,
        kick: Arc<KickState>,
        completed_reads: Arc<Mutex<Vec<u64>>>,
        pub regs: Regs,
    }

    impl ScriptedVcpu {
        pub fn new(script: Vec<Exit>, on_empty: OnEmpty) -> Self {
            ScriptedVcpu {
                script,
                pos: 0,
                on_empty,
                kick: Arc::new(KickState::default()),
                completed_reads: Arc::new(Mutex::new(Vec::new())),
                regs: Regs::default(),
            }
        }

        /// Shared view of the values passed to `complete_read`, usable
        /// after the vCPU thread has consumed the handle.
        pub fn reads(&self) -> Arc<Mutex<Vec<u64>>> {
            Arc::clone(&self.completed_reads)
        }
    }

    impl VcpuHandle for ScriptedVcpu {
        fn run(&mut self) -> Result<Exit, HvError> {
            if self.pos < self.script.len() {
                self.pos += 1;
                return Ok(self.script[self.pos - 1]);
            }
            match self.on_empty {
                OnEmpty::Shutdown => Ok(Exit::Shutdown),
                OnEmpty::BlockUntilKick => {
                    self.kick.wait();
                    Ok(Exit::Canceled)
                }
            }
        }

        fn complete_read(&mut self, data: u64) -> Result<(), HvError> {
            self.completed_reads.lock().unwrap().push(data);
            Ok(())
        }

        fn get_regs(&self) -> Result<Regs, HvError> {
            Ok(self.regs)
        }

        fn set_regs(&self, _regs: &Regs) -> Result<(), HvError> {
            Ok(())
        }

        fn get_sregs(&self) -> Result<Sregs, HvError> {
            Ok(Sregs::default())
        }

        fn set_sregs(&self, _sregs: &Sregs) -> Result<(), HvError> {
            Ok(())
        }

        fn kick_handle(&self) -> Box<dyn VcpuKick> {
            struct FakeKick(Arc<KickState>);
            impl VcpuKick for FakeKick {
                fn request_exit(&self) {
                    self.0.fire();
                }
            }
            Box::new(FakeKick(Arc::clone(&self.kick)))
        }
    }
}
