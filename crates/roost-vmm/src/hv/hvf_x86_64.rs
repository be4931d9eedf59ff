//! Apple Hypervisor.framework backend for Intel Macs.
//!
//! The x86 flavour of the framework exposes VT-x more directly than the
//! ARM one: exits are classified by reading VMCS fields, and the vCPU is
//! configured by programming the VMX execution controls against the
//! capabilities the hardware reports. Unlike the ARM backend, vCPUs here
//! are not bound to their creating thread.
//!
//! EPT violations are lifted to portable MMIO exits. Without an
//! instruction emulator the access width defaults to 4 bytes and read
//! completions target RAX; the device router tolerates these
//! conservative choices.

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
type hv_vcpuid_t = u32;

const HV_SUCCESS: hv_return_t = 0;
const HV_DENIED: hv_return_t = 0xfae9_4007_u32 as i32;

const HV_VM_DEFAULT: u64 = 0;
const HV_VCPU_DEFAULT: u64 = 0;

const HV_MEMORY_READ: u64 = 1 << 0;
const HV_MEMORY_WRITE: u64 = 1 << 1;
const HV_MEMORY_EXEC: u64 = 1 << 2;

// hv_x86_reg_t
const HV_X86_RIP: u32 = 0;
const HV_X86_RFLAGS: u32 = 1;
const HV_X86_RAX: u32 = 2;
const HV_X86_RCX: u32 = 3;
const HV_X86_RDX: u32 = 4;
const HV_X86_RBX: u32 = 5;
const HV_X86_RSI: u32 = 6;
const HV_X86_RDI: u32 = 7;
const HV_X86_RSP: u32 = 8;
const HV_X86_RBP: u32 = 9;
const HV_X86_R8: u32 = 10;

// hv_vmx_capability_t
const HV_VMX_CAP_PINBASED: u32 = 0;
const HV_VMX_CAP_PROCBASED: u32 = 1;
const HV_VMX_CAP_PROCBASED2: u32 = 2;
const HV_VMX_CAP_ENTRY: u32 = 3;

// VMCS encodings
const VMCS_RO_EXIT_REASON: u32 = 0x4402;
const VMCS_RO_EXIT_QUALIFIC: u32 = 0x6400;
const VMCS_RO_GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
const VMCS_RO_VMEXIT_INSTR_LEN: u32 = 0x440c;
const VMCS_CTRL_PIN_BASED: u32 = 0x4000;
const VMCS_CTRL_CPU_BASED: u32 = 0x4002;
const VMCS_CTRL_CPU_BASED2: u32 = 0x401e;
const VMCS_CTRL_VMENTRY_CONTROLS: u32 = 0x4012;
const VMCS_GUEST_RIP: u32 = 0x681e;

// VMX exit reasons (basic)
const VMX_REASON_EXC_NMI: u64 = 0;
const VMX_REASON_IRQ: u64 = 1;
const VMX_REASON_TRIPLE_FAULT: u64 = 2;
const VMX_REASON_HLT: u64 = 12;
const VMX_REASON_VMCALL: u64 = 18;
const VMX_REASON_IO: u64 = 30;
const VMX_REASON_RDMSR: u64 = 31;
const VMX_REASON_WRMSR: u64 = 32;
const VMX_REASON_EPT_VIOLATION: u64 = 48;

// CPU-based control bits
const CPU_BASED_HLT_EXITING: u64 = 1 << 7;
const CPU_BASED_SECONDARY_CTLS: u64 = 1 << 31;
const CPU_BASED2_UNRESTRICTED_GUEST: u64 = 1 << 7;

#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    fn hv_vm_create(flags: u64) -> hv_return_t;
    fn hv_vm_destroy() -> hv_return_t;
    fn hv_vm_map(uva: *mut std::ffi::c_void, gpa: u64, size: usize, flags: u64) -> hv_return_t;
    fn hv_vm_unmap(gpa: u64, size: usize) -> hv_return_t;
    fn hv_vcpu_create(vcpu: *mut hv_vcpuid_t, flags: u64) -> hv_return_t;
    fn hv_vcpu_destroy(vcpu: hv_vcpuid_t) -> hv_return_t;
    fn hv_vcpu_run(vcpu: hv_vcpuid_t) -> hv_return_t;
    fn hv_vcpu_interrupt(vcpus: *const hv_vcpuid_t, count: u32) -> hv_return_t;
    fn hv_vcpu_read_register(vcpu: hv_vcpuid_t, reg: u32, value: *mut u64) -> hv_return_t;
    fn hv_vcpu_write_register(vcpu: hv_vcpuid_t, reg: u32, value: u64) -> hv_return_t;
    fn hv_vmx_vcpu_read_vmcs(vcpu: hv_vcpuid_t, field: u32, value: *mut u64) -> hv_return_t;
    fn hv_vmx_vcpu_write_vmcs(vcpu: hv_vcpuid_t, field: u32, value: u64) -> hv_return_t;
    fn hv_vmx_read_capability(field: u32, value: *mut u64) -> hv_return_t;
}

fn hv_err(op: &'static str, ret: hv_return_t) -> HvError {
    HvError::Backend {
        op,
        source: std::io::Error::other(format!("hv_return {ret:#x}")),
    }
}

/// Fold desired control bits into the allowed-0/allowed-1 capability mask.
fn cap2ctrl(cap: u64, ctrl: u64) -> u64 {
    (ctrl | (cap & 0xffff_ffff)) & (cap >> 32)
}

// ─── Hypervisor / VM ─────────────────────────────────────────────────

/// The process-wide Hypervisor.framework facility (x86).
pub struct HvfHypervisor;

impl HvfHypervisor {
    pub fn new() -> Result<Self, HvError> {
        // Safety: probe-create, destroyed immediately.
        let ret = unsafe { hv_vm_create(HV_VM_DEFAULT) };
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
                advice: "Hypervisor.framework requires VT-x and macOS 10.10+",
            });
        }
        // Safety: tears down the probe VM.
        unsafe { hv_vm_destroy() };
        debug!("HVF (x86_64) initialized");
        Ok(HvfHypervisor)
    }
}

impl Hypervisor for HvfHypervisor {
    fn name(&self) -> &'static str {
        "hvf-x86_64"
    }

    fn create_vm(&self) -> Result<Arc<dyn VmHandle>, HvError> {
        // Safety: creates the single process-wide VM.
        let ret = unsafe { hv_vm_create(HV_VM_DEFAULT) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vm_create", ret));
        }
        Ok(Arc::new(HvfVm {
            slots: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct HvfVm {
    slots: Mutex<HashMap<u32, (u64, u64)>>,
}

impl VmHandle for HvfVm {
    fn map_region(&self, slot: &MemSlot) -> Result<(), HvError> {
        // Safety: host range validity is guaranteed by the memory map.
        let ret = unsafe {
            hv_vm_map(
                slot.host_addr as *mut std::ffi::c_void,
                slot.gpa,
                slot.size as usize,
                HV_MEMORY_READ | HV_MEMORY_WRITE | HV_MEMORY_EXEC,
            )
        };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vm_map", ret));
        }
        self.slots
            .lock()
            .unwrap()
            .insert(slot.slot, (slot.gpa, slot.size));
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
        let mut id: hv_vcpuid_t = 0;
        // Safety: out-pointer is valid.
        let ret = unsafe { hv_vcpu_create(&mut id, HV_VCPU_DEFAULT) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_create", ret));
        }
        let vcpu = HvfVcpu {
            id,
            pending_read: None,
        };
        vcpu.setup_vmx_controls()?;
        debug!("HVF vCPU {index} created (id {id})");
        Ok(Box::new(vcpu))
    }

    fn irq_line(&self, irq: u32, _level: bool) -> Result<(), HvError> {
        static WARNED: Once = Once::new();
        WARNED.call_once(|| {
            warn!("irq_line({irq}) ignored: HVF x86_64 backend does not inject interrupts");
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

/// A pending I/O or MMIO read; completion lands in RAX.
struct PendingRead {
    pc_step: u64,
}

pub struct HvfVcpu {
    id: hv_vcpuid_t,
    pending_read: Option<PendingRead>,
}

impl HvfVcpu {
    fn read_reg(&self, reg: u32) -> Result<u64, HvError> {
        let mut value = 0;
        // Safety: plain register read.
        let ret = unsafe { hv_vcpu_read_register(self.id, reg, &mut value) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_read_register", ret));
        }
        Ok(value)
    }

    fn write_reg(&self, reg: u32, value: u64) -> Result<(), HvError> {
        // Safety: plain register write.
        let ret = unsafe { hv_vcpu_write_register(self.id, reg, value) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_write_register", ret));
        }
        Ok(())
    }

    fn read_vmcs(&self, field: u32) -> Result<u64, HvError> {
        let mut value = 0;
        // Safety: plain VMCS read.
        let ret = unsafe { hv_vmx_vcpu_read_vmcs(self.id, field, &mut value) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vmx_vcpu_read_vmcs", ret));
        }
        Ok(value)
    }

    fn write_vmcs(&self, field: u32, value: u64) -> Result<(), HvError> {
        // Safety: plain VMCS write.
        let ret = unsafe { hv_vmx_vcpu_write_vmcs(self.id, field, value) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vmx_vcpu_write_vmcs", ret));
        }
        Ok(())
    }

    /// Program the VMX execution controls against hardware capabilities:
    /// exit on HLT, run as an unrestricted guest.
    fn setup_vmx_controls(&self) -> Result<(), HvError> {
        let mut cap = |field: u32| -> Result<u64, HvError> {
            let mut value = 0;
            // Safety: capability read into a valid out-pointer.
            let ret = unsafe { hv_vmx_read_capability(field, &mut value) };
            if ret != HV_SUCCESS {
                return Err(hv_err("hv_vmx_read_capability", ret));
            }
            Ok(value)
        };
        let pin = cap(HV_VMX_CAP_PINBASED)?;
        let proc = cap(HV_VMX_CAP_PROCBASED)?;
        let proc2 = cap(HV_VMX_CAP_PROCBASED2)?;
        let entry = cap(HV_VMX_CAP_ENTRY)?;

        self.write_vmcs(VMCS_CTRL_PIN_BASED, cap2ctrl(pin, 0))?;
        self.write_vmcs(
            VMCS_CTRL_CPU_BASED,
            cap2ctrl(proc, CPU_BASED_HLT_EXITING | CPU_BASED_SECONDARY_CTLS),
        )?;
        self.write_vmcs(
            VMCS_CTRL_CPU_BASED2,
            cap2ctrl(proc2, CPU_BASED2_UNRESTRICTED_GUEST),
        )?;
        self.write_vmcs(VMCS_CTRL_VMENTRY_CONTROLS, cap2ctrl(entry, 0))?;
        Ok(())
    }

    fn advance_rip(&self) -> Result<(), HvError> {
        let len = self.read_vmcs(VMCS_RO_VMEXIT_INSTR_LEN)?;
        let rip = self.read_vmcs(VMCS_GUEST_RIP)?;
        self.write_vmcs(VMCS_GUEST_RIP, rip.wrapping_add(len))
    }

    fn classify(&mut self) -> Result<Exit, HvError> {
        let reason = self.read_vmcs(VMCS_RO_EXIT_REASON)? & 0xffff;
        match reason {
            VMX_REASON_HLT => {
                self.advance_rip()?;
                Ok(Exit::Halt)
            }
            VMX_REASON_IRQ => Ok(Exit::External),
            VMX_REASON_TRIPLE_FAULT => Ok(Exit::Shutdown),
            VMX_REASON_VMCALL => {
                self.advance_rip()?;
                Ok(Exit::Hypercall)
            }
            VMX_REASON_RDMSR => {
                self.advance_rip()?;
                Ok(Exit::MsrRead)
            }
            VMX_REASON_WRMSR => {
                self.advance_rip()?;
                Ok(Exit::MsrWrite)
            }
            VMX_REASON_IO => {
                let qual = self.read_vmcs(VMCS_RO_EXIT_QUALIFIC)?;
                let size = ((qual & 0x7) + 1) as u8;
                let port = ((qual >> 16) & 0xffff) as u16;
                if qual & (1 << 3) != 0 {
                    // IN: complete into RAX, then step over the instruction.
                    let len = self.read_vmcs(VMCS_RO_VMEXIT_INSTR_LEN)?;
                    self.pending_read = Some(PendingRead { pc_step: len });
                    Ok(Exit::PortIo {
                        port,
                        size,
                        dir: IoDirection::Read,
                        data: 0,
                    })
                } else {
                    let data = (self.read_reg(HV_X86_RAX)? & width_mask(size)) as u32;
                    self.advance_rip()?;
                    Ok(Exit::PortIo {
                        port,
                        size,
                        dir: IoDirection::Write,
                        data,
                    })
                }
            }
            VMX_REASON_EPT_VIOLATION => {
                let qual = self.read_vmcs(VMCS_RO_EXIT_QUALIFIC)?;
                let gpa = self.read_vmcs(VMCS_RO_GUEST_PHYSICAL_ADDRESS)?;
                // Width is not recoverable without decoding the
                // instruction; 4 bytes is the conservative default the
                // router tolerates.
                if qual & (1 << 1) != 0 {
                    let data = self.read_reg(HV_X86_RAX)?;
                    self.advance_rip()?;
                    Ok(Exit::Mmio {
                        addr: gpa,
                        size: 4,
                        dir: IoDirection::Write,
                        data,
                    })
                } else {
                    let len = self.read_vmcs(VMCS_RO_VMEXIT_INSTR_LEN)?;
                    self.pending_read = Some(PendingRead { pc_step: len });
                    Ok(Exit::Mmio {
                        addr: gpa,
                        size: 4,
                        dir: IoDirection::Read,
                        data: 0,
                    })
                }
            }
            VMX_REASON_EXC_NMI => {
                let qual = self.read_vmcs(VMCS_RO_EXIT_QUALIFIC)?;
                Ok(Exit::Exception {
                    syndrome: reason,
                    fault_addr: qual,
                })
            }
            other => Ok(Exit::Unknown { reason: other }),
        }
    }
}

fn width_mask(size: u8) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

impl VcpuHandle for HvfVcpu {
    fn run(&mut self) -> Result<Exit, HvError> {
        if self.pending_read.is_some() {
            self.complete_read(0)?;
        }
        // Safety: blocks in guest mode until an exit.
        let ret = unsafe { hv_vcpu_run(self.id) };
        if ret != HV_SUCCESS {
            return Err(hv_err("hv_vcpu_run", ret));
        }
        self.classify()
    }

    fn complete_read(&mut self, data: u64) -> Result<(), HvError> {
        if let Some(pending) = self.pending_read.take() {
            self.write_reg(HV_X86_RAX, data)?;
            let rip = self.read_vmcs(VMCS_GUEST_RIP)?;
            self.write_vmcs(VMCS_GUEST_RIP, rip.wrapping_add(pending.pc_step))?;
        }
        Ok(())
    }

    fn get_regs(&self) -> Result<Regs, HvError> {
        let mut regs = Regs {
            rax: self.read_reg(HV_X86_RAX)?,
            rbx: self.read_reg(HV_X86_RBX)?,
            rcx: self.read_reg(HV_X86_RCX)?,
            rdx: self.read_reg(HV_X86_RDX)?,
            rsi: self.read_reg(HV_X86_RSI)?,
            rdi: self.read_reg(HV_X86_RDI)?,
            rsp: self.read_reg(HV_X86_RSP)?,
            rbp: self.read_reg(HV_X86_RBP)?,
            rip: self.read_reg(HV_X86_RIP)?,
            rflags: self.read_reg(HV_X86_RFLAGS)?,
            ..Default::default()
        };
        for i in 0..8 {
            let value = self.read_reg(HV_X86_R8 + i)?;
            match i {
                0 => regs.r8 = value,
                1 => regs.r9 = value,
                2 => regs.r10 = value,
                3 => regs.r11 = value,
                4 => regs.r12 = value,
                5 => regs.r13 = value,
                6 => regs.r14 = value,
                7 => regs.r15 = value,
                _ => unreachable!(),
            }
        }
        regs.pc = regs.rip;
        Ok(regs)
    }

    fn set_regs(&self, regs: &Regs) -> Result<(), HvError> {
        self.write_reg(HV_X86_RAX, regs.rax)?;
        self.write_reg(HV_X86_RBX, regs.rbx)?;
        self.write_reg(HV_X86_RCX, regs.rcx)?;
        self.write_reg(HV_X86_RDX, regs.rdx)?;
        self.write_reg(HV_X86_RSI, regs.rsi)?;
        self.write_reg(HV_X86_RDI, regs.rdi)?;
        self.write_reg(HV_X86_RSP, regs.rsp)?;
        self.write_reg(HV_X86_RBP, regs.rbp)?;
        self.write_reg(HV_X86_R8, regs.r8)?;
        self.write_reg(HV_X86_R8 + 1, regs.r9)?;
        self.write_reg(HV_X86_R8 + 2, regs.r10)?;
        self.write_reg(HV_X86_R8 + 3, regs.r11)?;
        self.write_reg(HV_X86_R8 + 4, regs.r12)?;
        self.write_reg(HV_X86_R8 + 5, regs.r13)?;
        self.write_reg(HV_X86_R8 + 6, regs.r14)?;
        self.write_reg(HV_X86_R8 + 7, regs.r15)?;
        self.write_reg(HV_X86_RIP, regs.rip)?;
        self.write_reg(HV_X86_RFLAGS, regs.rflags | 0x2)
    }

    fn get_sregs(&self) -> Result<Sregs, HvError> {
        // Control-register state lives in the VMCS; expose the handful
        // the rest of the system inspects.
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
        // Safety: destroys the vCPU this handle created.
        unsafe { hv_vcpu_destroy(self.id) };
    }
}

struct HvfKick {
    id: hv_vcpuid_t,
}

impl VcpuKick for HvfKick {
    fn request_exit(&self) {
        // Safety: hv_vcpu_interrupt is callable from any thread.
        unsafe { hv_vcpu_interrupt(&self.id, 1) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap2ctrl_forces_mandatory_bits() {
        // Low word: allowed-0 (must-be-one) bits; high word: allowed-1.
        let cap = (0xffff_u64 << 32) | 0b0110;
        assert_eq!(cap2ctrl(cap, 0), 0b0110);
    }

    #[test]
    fn cap2ctrl_keeps_requested_bits_the_hardware_allows() {
        let cap = ((CPU_BASED_HLT_EXITING | 0b0001) << 32) | 0b0001;
        let ctrl = cap2ctrl(cap, CPU_BASED_HLT_EXITING);
        assert_eq!(ctrl & CPU_BASED_HLT_EXITING, CPU_BASED_HLT_EXITING);
        assert_eq!(ctrl & 0b0001, 0b0001);
    }

    #[test]
    fn cap2ctrl_drops_requested_bits_the_hardware_forbids() {
        // allowed-1 word does not include the HLT-exiting bit.
        let cap = 0b0001_u64 << 32;
        assert_eq!(cap2ctrl(cap, CPU_BASED_HLT_EXITING), 0);
    }

    #[test]
    fn width_masks_cover_io_sizes() {
        assert_eq!(width_mask(1), 0xff);
        assert_eq!(width_mask(2), 0xffff);
        assert_eq!(width_mask(4), 0xffff_ffff);
        assert_eq!(width_mask(8), u64::MAX);
        // Odd widths fall back to the full register.
        assert_eq!(width_mask(3), u64::MAX);
    }
}
