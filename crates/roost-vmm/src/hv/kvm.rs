//! Linux KVM backend.
//!
//! Talks to `/dev/kvm` through `kvm-ioctls`. The VM carries an in-kernel
//! irqchip so [`VmHandle::irq_line`] maps straight onto `KVM_IRQ_LINE`;
//! the TSS address must be set before the irqchip and the irqchip must
//! exist before the first vCPU, in that order.
//!
//! KVM vCPUs are not bound to their creating thread, but a blocking
//! `KVM_RUN` can only be interrupted by a signal. Kicking therefore sends
//! a registered no-op real-time signal to the vCPU thread, which surfaces
//! as a benign [`HvError::Interrupted`] in the run loop.

use super::{
    DescriptorTable, Exit, HvError, Hypervisor, IoDirection, MemSlot, Regs, Segment, Sregs,
    VcpuHandle, VcpuKick, VmHandle, SLOT_DIRTY_LOG, SLOT_WRITE,
};

use kvm_bindings::{
    kvm_dtable, kvm_regs, kvm_segment, kvm_sregs, kvm_userspace_memory_region,
    KVM_MEM_LOG_DIRTY_PAGES, KVM_MEM_READONLY,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::{debug, warn};
use std::sync::{Arc, Once};

/// KVM API version this backend understands.
const KVM_API_VERSION: i32 = 12;

/// KVM TSS address, placed at the top of the 32-bit address space.
/// Must be set before `create_irq_chip`.
const KVM_TSS_ADDRESS: usize = 0xfffb_d000;

/// Signal used to interrupt a blocking `KVM_RUN`.
fn kick_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

static KICK_HANDLER: Once = Once::new();

extern "C" fn kick_handler(
    _num: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // Nothing to do: delivery alone makes KVM_RUN return EINTR.
}

fn errno_of(err: kvm_ioctls::Error) -> i32 {
    err.errno()
}

// ─── Hypervisor ──────────────────────────────────────────────────────

/// The process-wide KVM facility.
pub struct KvmHypervisor {
    kvm: Kvm,
}

impl KvmHypervisor {
    /// Open `/dev/kvm`, verify the API version, and register the vCPU
    /// kick signal handler.
    pub fn new() -> Result<Self, HvError> {
        let kvm = Kvm::new().map_err(|e| match e.errno() {
            libc::EPERM | libc::EACCES => HvError::PermissionDenied {
                reason: "cannot open /dev/kvm".to_string(),
                advice: "add your user to the kvm group, or run with elevated privileges",
            },
            errno => HvError::Unavailable {
                reason: format!(
                    "cannot open /dev/kvm: {}",
                    std::io::Error::from_raw_os_error(errno)
                ),
                advice: "verify that KVM is enabled (kvm_intel/kvm_amd loaded) and /dev/kvm exists",
            },
        })?;

        let version = kvm.get_api_version();
        if version != KVM_API_VERSION {
            return Err(HvError::Unavailable {
                reason: format!("KVM API version mismatch: got {version}, expected {KVM_API_VERSION}"),
                advice: "this kernel's KVM interface is not supported",
            });
        }

        let mut register_failed = false;
        KICK_HANDLER.call_once(|| {
            // Safety: the handler is async-signal-safe (it does nothing).
            if vmm_sys_util::signal::register_signal_handler(kick_signal(), kick_handler).is_err() {
                register_failed = true;
            }
        });
        if register_failed {
            return Err(HvError::backend("register vCPU kick handler", libc::EINVAL));
        }

        debug!("KVM initialized (API version {version})");
        Ok(KvmHypervisor { kvm })
    }
}

impl Hypervisor for KvmHypervisor {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn create_vm(&self) -> Result<Arc<dyn VmHandle>, HvError> {
        let vm = self
            .kvm
            .create_vm()
            .map_err(|e| HvError::backend("KVM_CREATE_VM", errno_of(e)))?;

        // TSS before irqchip, irqchip before the first vCPU.
        vm.set_tss_address(KVM_TSS_ADDRESS)
            .map_err(|e| HvError::backend("KVM_SET_TSS_ADDR", errno_of(e)))?;
        vm.create_irq_chip()
            .map_err(|e| HvError::backend("KVM_CREATE_IRQCHIP", errno_of(e)))?;

        debug!("KVM VM created");
        Ok(Arc::new(KvmVm { vm }))
    }
}

// ─── VM ──────────────────────────────────────────────────────────────

/// One KVM guest, wrapping the VM file descriptor.
pub struct KvmVm {
    vm: VmFd,
}

impl VmHandle for KvmVm {
    fn map_region(&self, slot: &MemSlot) -> Result<(), HvError> {
        let mut flags = 0;
        if slot.flags & SLOT_DIRTY_LOG != 0 {
            flags |= KVM_MEM_LOG_DIRTY_PAGES;
        }
        if slot.flags & SLOT_WRITE == 0 {
            flags |= KVM_MEM_READONLY;
        }
        let region = kvm_userspace_memory_region {
            slot: slot.slot,
            flags,
            guest_phys_addr: slot.gpa,
            memory_size: slot.size,
            userspace_addr: slot.host_addr,
        };
        // Safety: the caller guarantees [host_addr, host_addr + size) is a
        // valid mapping owned by the memory map for the VM's lifetime.
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(|e| HvError::backend("KVM_SET_USER_MEMORY_REGION", errno_of(e)))?;
        debug!(
            "mapped slot {}: GPA {:#x} -> HVA {:#x} ({} bytes)",
            slot.slot, slot.gpa, slot.host_addr, slot.size
        );
        Ok(())
    }

    fn unmap_region(&self, slot: u32) -> Result<(), HvError> {
        let region = kvm_userspace_memory_region {
            slot,
            ..Default::default()
        };
        // Safety: a zero-sized region removes the slot; no memory is
        // referenced.
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(|e| HvError::backend("KVM_SET_USER_MEMORY_REGION", errno_of(e)))?;
        debug!("unmapped slot {slot}");
        Ok(())
    }

    fn create_vcpu(&self, index: u32) -> Result<Box<dyn VcpuHandle>, HvError> {
        let fd = self
            .vm
            .create_vcpu(index as u64)
            .map_err(|e| HvError::backend("KVM_CREATE_VCPU", errno_of(e)))?;
        debug!("KVM vCPU {index} created");
        Ok(Box::new(KvmVcpu {
            fd,
            pending_read: None,
        }))
    }

    fn irq_line(&self, irq: u32, level: bool) -> Result<(), HvError> {
        self.vm
            .set_irq_line(irq, level)
            .map_err(|e| HvError::backend("KVM_IRQ_LINE", errno_of(e)))
    }
}

// ─── vCPU ────────────────────────────────────────────────────────────

/// A pending MMIO/PIO read whose data slot lives in the mmapped run page.
struct PendingRead {
    ptr: *mut u8,
    len: usize,
}

/// One KVM vCPU.
pub struct KvmVcpu {
    fd: VcpuFd,
    pending_read: Option<PendingRead>,
}

// Safety: `pending_read` points into this vCPU's own mmapped run page,
// which lives as long as `fd` and is only touched from the owning thread.
unsafe impl Send for KvmVcpu {}

/// Convert a `kvm-ioctls` exit into the portable descriptor.
///
/// Free function rather than a method: the `VcpuExit` borrows the run
/// page through `fd`, so only the disjoint `pending_read` field may be
/// touched while classifying.
fn classify(pending_read: &mut Option<PendingRead>, exit: VcpuExit) -> Exit {
    match exit {
        VcpuExit::IoIn(port, data) => {
            *pending_read = Some(PendingRead {
                ptr: data.as_mut_ptr(),
                len: data.len(),
            });
            Exit::PortIo {
                port,
                size: data.len() as u8,
                dir: IoDirection::Read,
                data: 0,
            }
        }
        VcpuExit::IoOut(port, data) => {
            let mut buf = [0u8; 4];
            let len = data.len().min(4);
            buf[..len].copy_from_slice(&data[..len]);
            Exit::PortIo {
                port,
                size: data.len() as u8,
                dir: IoDirection::Write,
                data: u32::from_le_bytes(buf),
            }
        }
        VcpuExit::MmioRead(addr, data) => {
            *pending_read = Some(PendingRead {
                ptr: data.as_mut_ptr(),
                len: data.len(),
            });
            Exit::Mmio {
                addr,
                size: data.len() as u8,
                dir: IoDirection::Read,
                data: 0,
            }
        }
        VcpuExit::MmioWrite(addr, data) => {
            let mut buf = [0u8; 8];
            let len = data.len().min(8);
            buf[..len].copy_from_slice(&data[..len]);
            Exit::Mmio {
                addr,
                size: data.len() as u8,
                dir: IoDirection::Write,
                data: u64::from_le_bytes(buf),
            }
        }
        VcpuExit::Hlt => Exit::Halt,
        VcpuExit::Shutdown => Exit::Shutdown,
        VcpuExit::FailEntry(reason, _cpu) => Exit::FailEntry { code: reason },
        VcpuExit::InternalError => Exit::InternalError { code: 0 },
        VcpuExit::Intr => Exit::External,
        VcpuExit::IrqWindowOpen => Exit::IrqWindow,
        VcpuExit::SystemEvent(_, _) => Exit::SystemEvent,
        VcpuExit::Debug(_) => Exit::Debug,
        other => {
            warn!("unhandled KVM exit: {other:?}");
            Exit::Unknown { reason: 0 }
        }
    }
}

impl VcpuHandle for KvmVcpu {
    fn run(&mut self) -> Result<Exit, HvError> {
        // A read the dispatcher never completed must not leak stale run
        // page contents into the guest.
        if self.pending_read.is_some() {
            self.complete_read(0)?;
        }
        match self.fd.run() {
            Ok(exit) => Ok(classify(&mut self.pending_read, exit)),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                Err(HvError::Interrupted)
            }
            Err(e) => Err(HvError::backend("KVM_RUN", errno_of(e))),
        }
    }

    fn complete_read(&mut self, data: u64) -> Result<(), HvError> {
        if let Some(pending) = self.pending_read.take() {
            let bytes = data.to_le_bytes();
            let len = pending.len.min(8);
            // Safety: see the Send impl; the pointer targets the live run
            // page and `len` was taken from the exit's data slice.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), pending.ptr, len);
            }
        }
        Ok(())
    }

    fn get_regs(&self) -> Result<Regs, HvError> {
        let k = self
            .fd
            .get_regs()
            .map_err(|e| HvError::backend("KVM_GET_REGS", errno_of(e)))?;
        let mut regs = Regs {
            rax: k.rax,
            rbx: k.rbx,
            rcx: k.rcx,
            rdx: k.rdx,
            rsi: k.rsi,
            rdi: k.rdi,
            rsp: k.rsp,
            rbp: k.rbp,
            r8: k.r8,
            r9: k.r9,
            r10: k.r10,
            r11: k.r11,
            r12: k.r12,
            r13: k.r13,
            r14: k.r14,
            r15: k.r15,
            rip: k.rip,
            rflags: k.rflags,
            ..Default::default()
        };
        regs.pc = k.rip;
        Ok(regs)
    }

    fn set_regs(&self, regs: &Regs) -> Result<(), HvError> {
        let k = kvm_regs {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.rflags,
        };
        self.fd
            .set_regs(&k)
            .map_err(|e| HvError::backend("KVM_SET_REGS", errno_of(e)))
    }

    fn get_sregs(&self) -> Result<Sregs, HvError> {
        let k = self
            .fd
            .get_sregs()
            .map_err(|e| HvError::backend("KVM_GET_SREGS", errno_of(e)))?;
        Ok(Sregs {
            cs: segment_from_kvm(&k.cs),
            ds: segment_from_kvm(&k.ds),
            es: segment_from_kvm(&k.es),
            fs: segment_from_kvm(&k.fs),
            gs: segment_from_kvm(&k.gs),
            ss: segment_from_kvm(&k.ss),
            ldt: segment_from_kvm(&k.ldt),
            tr: segment_from_kvm(&k.tr),
            gdt: dtable_from_kvm(&k.gdt),
            idt: dtable_from_kvm(&k.idt),
            cr0: k.cr0,
            cr2: k.cr2,
            cr3: k.cr3,
            cr4: k.cr4,
            cr8: k.cr8,
            efer: k.efer,
            apic_base: k.apic_base,
        })
    }

    fn set_sregs(&self, sregs: &Sregs) -> Result<(), HvError> {
        let mut k = self
            .fd
            .get_sregs()
            .map_err(|e| HvError::backend("KVM_GET_SREGS", errno_of(e)))?;
        k.cs = segment_to_kvm(&sregs.cs);
        k.ds = segment_to_kvm(&sregs.ds);
        k.es = segment_to_kvm(&sregs.es);
        k.fs = segment_to_kvm(&sregs.fs);
        k.gs = segment_to_kvm(&sregs.gs);
        k.ss = segment_to_kvm(&sregs.ss);
        k.ldt = segment_to_kvm(&sregs.ldt);
        k.tr = segment_to_kvm(&sregs.tr);
        k.gdt = dtable_to_kvm(&sregs.gdt);
        k.idt = dtable_to_kvm(&sregs.idt);
        k.cr0 = sregs.cr0;
        k.cr2 = sregs.cr2;
        k.cr3 = sregs.cr3;
        k.cr4 = sregs.cr4;
        k.cr8 = sregs.cr8;
        k.efer = sregs.efer;
        k.apic_base = sregs.apic_base;
        self.fd
            .set_sregs(&k)
            .map_err(|e| HvError::backend("KVM_SET_SREGS", errno_of(e)))
    }

    fn kick_handle(&self) -> Box<dyn VcpuKick> {
        // Safety: pthread_self never fails.
        let thread = unsafe { libc::pthread_self() };
        Box::new(KvmKick { thread })
    }
}

/// Kicks a vCPU by signalling its thread out of `KVM_RUN`.
struct KvmKick {
    thread: libc::pthread_t,
}

// Safety: pthread_t is a plain thread identifier; pthread_kill is
// thread-safe and tolerates the target having already exited only for as
// long as the thread is joinable, which the vCPU controller guarantees.
unsafe impl Send for KvmKick {}
unsafe impl Sync for KvmKick {}

impl VcpuKick for KvmKick {
    fn request_exit(&self) {
        // Safety: see above.
        unsafe {
            libc::pthread_kill(self.thread, kick_signal());
        }
    }
}

// ─── Register conversions ────────────────────────────────────────────

fn segment_from_kvm(seg: &kvm_segment) -> Segment {
    Segment {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        type_: seg.type_,
        present: seg.present,
        dpl: seg.dpl,
        db: seg.db,
        s: seg.s,
        l: seg.l,
        g: seg.g,
        avl: seg.avl,
    }
}

fn segment_to_kvm(seg: &Segment) -> kvm_segment {
    kvm_segment {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        type_: seg.type_,
        present: seg.present,
        dpl: seg.dpl,
        db: seg.db,
        s: seg.s,
        l: seg.l,
        g: seg.g,
        avl: seg.avl,
        ..Default::default()
    }
}

fn dtable_from_kvm(dt: &kvm_dtable) -> DescriptorTable {
    DescriptorTable {
        base: dt.base,
        limit: dt.limit,
    }
}

fn dtable_to_kvm(dt: &DescriptorTable) -> kvm_dtable {
    kvm_dtable {
        base: dt.base,
        limit: dt.limit,
        ..Default::default()
    }
}
