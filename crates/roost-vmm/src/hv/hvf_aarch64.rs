//! Apple Hypervisor.framework backend for Apple Silicon.
//!
//! Uses the framework directly through FFI. Two properties shape this
//! backend:
//!
//! - The framework's VM is process-global (`hv_vm_create` takes no
//!   handle), so one [`HvfVm`] may exist at a time.
//! - `hv_vcpu_create` binds the vCPU to the calling thread. The backend
//!   reports [`VmHandle::vcpu_thread_affine`] so the vCPU controller
//!   defers creation and the initial register write into the vCPU's own
//!   thread.
//!
//! A data abort on an unmapped GPA arrives as an exception exit; this
//! backend lifts it to a portable MMIO exit by decoding the syndrome
//! (ISV/SAS/SRT/WnR) when the hardware provides valid instruction info,
//! and falls back to a conservative 4-byte write when it does not.

use super::{
    Exit, HvError, Hypervisor, IoDirection, MemSlot, Regs, Sregs, VcpuHandle, VcpuKick, VmHandle,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

// ─── Hypervisor.framework FFI ────────────────────────────────────────

#[allow(non_camel_case_types)]
type hv_return_t = i32;
#[allow(non_camel_case_types)]
type hv_vcpu_t = u64;

const HV_SUCCESS: hv_return_t = 0;
const HV_DENIED: hv_return_t = 0xfae9_4007_u32 as i32;

/// Guest memory permissions for `hv_vm_map`.
const HV_MEMORY_READ: u64 = 1 << 0;
const HV_MEMORY_WRITE: u64 = 1 << 1;
const HV_MEMORY_EXEC: u64 = 1 << 2;

/// Exit reasons reported in `hv_vcpu_exit_t`.
const HV_EXIT_REASON_CANCELED: u32 = 0;
const HV_EXIT_REASON_EXCEPTION: u32 = 1;
const HV_EXIT_REASON_VTIMER_ACTIVATED: u32 = 2;

/// Register IDs for `hv_vcpu_get_reg`/`hv_vcpu_set_reg`.
const HV_REG_X0: u32 = 0;
const HV_REG_PC: u32 = 31;
const HV_REG_CPSR: u32 = 34;

#[repr(C)]
#[derive(Clone, Copy)]
struct hv_vcpu_exit_exception_t {
    syndrome: u64,
    virtual_address: u64,
    physical_address: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct hv_vcpu_exit_t {
    reason: u32,
    exception: hv_vcpu_exit_exception_t,
}

#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    fn hv_vm_create(config: *mut std::ffi::c_void) -> hv_return_t;
    fn hv_vm_destroy() -> hv_return_t;
    fn hv_vm_map(uva: *mut std::ffi::c_void, gpa: u64, size: usize, flags: u64) -> hv_return_t;
    fn hv_vm_unmap(gpa: u64, size: usize) -> hv_return_t;
    fn hv_vcpu_create(
        vcpu: *mut hv_vcpu_t,
        exit: *mut *const hv_vcpu_exit_t,
        config: *mut std::ffi::c_void,
    ) -> hv_return_t;
    fn hv_vcpu_destroy(vcpu: hv_vcpu_t) -> hv_return_t;
    fn hv_vcpu_run(vcpu: hv_vcpu_t) -> hv_return_t;
    fn hv_vcpus_exit(vcpus: *const hv_vcpu_t, count: u32) -> hv_return_t;
    fn hv_vcpu_get_reg(vcpu: hv_vcpu_t, reg: u32, value: *mut u64) -> hv_return_t;
    fn hv_vcpu_set_reg(vcpu: hv_vcpu_t, reg: u32, value: u64) -> hv_return_t;
}

fn hv_err(op: &'static str, ret: hv_return_t) -> HvError {
    HvError::Backend {
        op,
        source: std::io::Error::other(format!("hv_return {ret:#x}")),
    }
}

// ─── Syndrome decoding ───────────────────────────────────────────────

/// Exception classes (ESR_EL2.EC).
const EC_WFX: u64 = 0x01;
const EC_HVC64: u64 = 0x16;
const EC_DATA_ABORT_LOWER: u64 = 0x24;

fn esr_ec(syndrome: u64) -> u64 {
    (syndrome >> 26) & 0x3f
}

/// Length in bytes of the trapping instruction (ESR_EL2.IL).
fn esr_instr_len(syndrome: u64) -> u64 {
    if syndrome & (1 << 25) != 0 {
        4
    } else {
        2
    }
}

/// Decoded data-abort instruction syndrome, valid when ISV is set.
struct DataAbortInfo {
    size: u8,
    write: bool,
    /// Transfer register index; 31 is the zero register.
    srt: u32,
}

fn decode_data_abort(syndrome: u64) -> Option<DataAbortInfo> {
    if syndrome & (1 << 24) == 0 {
        return None; // ISV clear: no instruction info
    }
    Some(DataAbortInfo {
        size: 1 << ((syndrome >> 22) & 0x3),
        write: syndrome & (1 << 6) != 0,
        srt: ((syndrome >> 16) & 0x1f) as u32,
    })
}

/// Default PSTATE for a fresh vCPU: EL1h with DAIF masked.
const PSTATE_EL1H_MASKED: u64 = 0x3c5;

// ─── Hypervisor ──────────────────────────────────────────────────────

/// The process-wide Hypervisor.framework facility.
pub struct HvfHypervisor;

impl HvfHypervisor {
    /// Probe the framework by creating and destroying a throwaway VM.
    pub fn new() -> Result<Self, HvError> {
        // Safety: plain FFI probe; destroyed again immediately.
        let ret = unsafe { hv_vm_create(std::ptr::null_mut()) };
        if ret != HV_SUCCESS {
            if ret == HV_DENIED {
                return Err(HvError::PermissionDenied {
                    reason: "Hypervisor.framework denied VM creation".to_string(),
                    advice: "sign the binary with the com.apple.security.hypervisor \
                             entitlement, or run with sudo",
                });
            }
            return Err(HvError::Unavailable {
                reason: format!("hv_vm_create returned {ret:#x}"),
                advice: "Hypervisor.framework requires macOS 11+ on Apple Silicon",
            });
        }
        // Safety: tears down the probe VM created above.
        unsafe { hv_vm_destroy() };
        debug!("HVF (aarch64) initialized");
        Ok(HvfHypervisor)
    }
}

impl Hypervisor for HvfHypervisor {
    fn name(&self) -> &'static str {
        "hvf-aarch64"
    }

    fn create_vm(&self) -> Result<Arc<dyn VmHandle>, HvError> {
        // Safety: create the (single) process-wide VM.
        let ret = unsafe { hv_vm_create(std::ptr::null_mut()) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vm_create", ret));
        }
        Ok(Arc::new(HvfVm {
            slots: Mutex::new(HashMap::new()),
        }))
    }
}

// ─── VM ──────────────────────────────────────────────────────────────

/// The process-global HVF guest.
pub struct HvfVm {
    /// slot id → (gpa, size), because `hv_vm_unmap` is addressed by GPA.
    slots: Mutex<HashMap<u32, (u64, u64)>>,
}

impl VmHandle for HvfVm {
    fn map_region(&self, slot: &MemSlot) -> Result<(), HvError> {
        let flags = HV_MEMORY_READ | HV_MEMORY_WRITE | HV_MEMORY_EXEC;
        // Safety: the caller guarantees the host range is valid for the
        // VM's lifetime.
        let ret = unsafe {
            hv_vm_map(
                slot.host_addr as *mut std::ffi::c_void,
                slot.gpa,
                slot.size as usize,
                flags,
            )
        };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vm_map", ret));
        }
        self.slots
            .lock()
            .unwrap()
            .insert(slot.slot, (slot.gpa, slot.size));
        debug!(
            "mapped slot {}: GPA {:#x} ({} bytes)",
            slot.slot, slot.gpa, slot.size
        );
        Ok(())
    }

    fn unmap_region(&self, slot: u32) -> Result<(), HvError> {
        let Some((gpa, size)) = self.slots.lock().unwrap().remove(&slot) else {
            return Err(HvError::InvalidArgument(format!("unknown slot {slot}")));
        };
        // Safety: unmaps a range this VM mapped.
        let ret = unsafe { hv_vm_unmap(gpa, size as usize) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vm_unmap", ret));
        }
        Ok(())
    }

    fn create_vcpu(&self, index: u32) -> Result<Box<dyn VcpuHandle>, HvError> {
        let mut id: hv_vcpu_t = 0;
        let mut exit: *const hv_vcpu_exit_t = std::ptr::null();
        // Safety: out-pointers are valid; the framework fills them. The
        // vCPU is bound to this thread from here on.
        let ret = unsafe { hv_vcpu_create(&mut id, &mut exit, std::ptr::null_mut()) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_create", ret));
        }
        debug!("HVF vCPU {index} created (id {id})");
        Ok(Box::new(HvfVcpu {
            id,
            exit,
            pending_read: None,
        }))
    }

    fn vcpu_thread_affine(&self) -> bool {
        true
    }

    fn irq_line(&self, irq: u32, _level: bool) -> Result<(), HvError> {
        // No line-based interrupt controller is modelled on this backend;
        // guest interrupt delivery does not happen here.
        static WARNED: Once = Once::new();
        WARNED.call_once(|| {
            warn!("irq_line({irq}) ignored: HVF aarch64 backend does not inject interrupts");
        });
        Ok(())
    }
}

impl Drop for HvfVm {
    fn drop(&mut self) {
        // Safety: destroys the VM this handle created.
        unsafe { hv_vm_destroy() };
    }
}

// ─── vCPU ────────────────────────────────────────────────────────────

/// A read whose destination register is known from the abort syndrome.
struct PendingRead {
    /// Target register; `None` for the zero register or when the
    /// syndrome carried no instruction info.
    srt: Option<u32>,
    /// PC increment to apply once the read completes.
    pc_step: u64,
}

/// One HVF vCPU. Bound to the thread that created it.
pub struct HvfVcpu {
    id: hv_vcpu_t,
    exit: *const hv_vcpu_exit_t,
    pending_read: Option<PendingRead>,
}

// Safety: the framework binds the vCPU to its creating thread; the vCPU
// controller only ever moves the boxed handle into that thread before
// first use and never shares it.
unsafe impl Send for HvfVcpu {}

impl HvfVcpu {
    fn get_reg(&self, reg: u32) -> Result<u64, HvError> {
        let mut value = 0;
        // Safety: register access on the owning thread.
        let ret = unsafe { hv_vcpu_get_reg(self.id, reg, &mut value) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_get_reg", ret));
        }
        Ok(value)
    }

    fn set_reg(&self, reg: u32, value: u64) -> Result<(), HvError> {
        // Safety: register access on the owning thread.
        let ret = unsafe { hv_vcpu_set_reg(self.id, reg, value) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_set_reg", ret));
        }
        Ok(())
    }

    fn advance_pc(&self, step: u64) -> Result<(), HvError> {
        let pc = self.get_reg(HV_REG_PC)?;
        self.set_reg(HV_REG_PC, pc.wrapping_add(step))
    }

    /// Lift an exception exit into a portable descriptor.
    fn classify_exception(&mut self, syndrome: u64, gpa: u64) -> Result<Exit, HvError> {
        match esr_ec(syndrome) {
            EC_WFX => {
                self.advance_pc(esr_instr_len(syndrome))?;
                Ok(Exit::Halt)
            }
            EC_HVC64 => Ok(Exit::Hypercall),
            EC_DATA_ABORT_LOWER => {
                let step = esr_instr_len(syndrome);
                match decode_data_abort(syndrome) {
                    Some(info) if info.write => {
                        let data = if info.srt == 31 {
                            0
                        } else {
                            self.get_reg(HV_REG_X0 + info.srt)?
                        };
                        self.advance_pc(step)?;
                        Ok(Exit::Mmio {
                            addr: gpa,
                            size: info.size,
                            dir: IoDirection::Write,
                            data,
                        })
                    }
                    Some(info) => {
                        self.pending_read = Some(PendingRead {
                            srt: (info.srt != 31).then_some(info.srt),
                            pc_step: step,
                        });
                        Ok(Exit::Mmio {
                            addr: gpa,
                            size: info.size,
                            dir: IoDirection::Read,
                            data: 0,
                        })
                    }
                    None => {
                        // No instruction info; the original system treats
                        // these as 4-byte writes of unknown data and the
                        // router tolerates the conservative width.
                        self.advance_pc(step)?;
                        Ok(Exit::Mmio {
                            addr: gpa,
                            size: 4,
                            dir: IoDirection::Write,
                            data: 0,
                        })
                    }
                }
            }
            _ => Ok(Exit::Exception {
                syndrome,
                fault_addr: gpa,
            }),
        }
    }
}

impl VcpuHandle for HvfVcpu {
    fn run(&mut self) -> Result<Exit, HvError> {
        if self.pending_read.is_some() {
            self.complete_read(0)?;
        }
        // Safety: run on the owning thread; blocks until exit.
        let ret = unsafe { hv_vcpu_run(self.id) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_run", ret));
        }
        // Safety: the exit pointer was produced by hv_vcpu_create and is
        // valid until hv_vcpu_destroy.
        let exit = unsafe { *self.exit };
        match exit.reason {
            HV_EXIT_REASON_CANCELED => Ok(Exit::Canceled),
            HV_EXIT_REASON_VTIMER_ACTIVATED => Ok(Exit::VirtualTimer),
            HV_EXIT_REASON_EXCEPTION => {
                self.classify_exception(exit.exception.syndrome, exit.exception.physical_address)
            }
            reason => Ok(Exit::Unknown {
                reason: reason as u64,
            }),
        }
    }

    fn complete_read(&mut self, data: u64) -> Result<(), HvError> {
        if let Some(pending) = self.pending_read.take() {
            if let Some(srt) = pending.srt {
                self.set_reg(HV_REG_X0 + srt, data)?;
            }
            self.advance_pc(pending.pc_step)?;
        }
        Ok(())
    }

    fn get_regs(&self) -> Result<Regs, HvError> {
        let mut regs = Regs::default();
        for (i, x) in regs.x.iter_mut().enumerate() {
            *x = self.get_reg(HV_REG_X0 + i as u32)?;
        }
        regs.pc = self.get_reg(HV_REG_PC)?;
        regs.pstate = self.get_reg(HV_REG_CPSR)?;
        Ok(regs)
    }

    fn set_regs(&self, regs: &Regs) -> Result<(), HvError> {
        for (i, x) in regs.x.iter().enumerate() {
            self.set_reg(HV_REG_X0 + i as u32, *x)?;
        }
        self.set_reg(HV_REG_PC, regs.pc)?;
        let pstate = if regs.pstate != 0 {
            regs.pstate
        } else {
            PSTATE_EL1H_MASKED
        };
        self.set_reg(HV_REG_CPSR, pstate)
    }

    fn get_sregs(&self) -> Result<Sregs, HvError> {
        // x86-shaped system state has no meaning here.
        Ok(Sregs::default())
    }

    fn set_sregs(&self, _sregs: &Sregs) -> Result<(), HvError> {
        Ok(())
    }

    fn kick_handle(&self) -> Box<dyn VcpuKick> {
        Box::new(HvfKick { id: self.id })
    }
}

impl Drop for HvfVcpu {
    fn drop(&mut self) {
        // Safety: destroys the vCPU on its owning thread; the controller
        // drops the handle at the bottom of the vCPU thread.
        unsafe { hv_vcpu_destroy(self.id) };
    }
}

/// Kicks a vCPU via the framework's asynchronous exit request.
struct HvfKick {
    id: hv_vcpu_t,
}

impl VcpuKick for HvfKick {
    fn request_exit(&self) {
        // Safety: hv_vcpus_exit is documented as callable from any thread.
        unsafe { hv_vcpus_exit(&self.id, 1) };
    }
}
