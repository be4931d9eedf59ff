//! Device framework and MMIO routing.
//!
//! Devices are named GPA ranges with a read/write handler pair. The
//! [`DeviceTable`] is an ordered, append-only list built while the VM is
//! stopped; at run time the vCPU loop resolves a faulting GPA to the
//! first entry whose range contains it and dispatches with the offset
//! into that range. An access that hits no entry is reported as
//! unmapped so the caller can log it and let the guest continue.
//!
//! Interrupts: every entry carries an IRQ number (allocated from
//! [`IRQ_BASE`] at registration, fixed for the device's lifetime) and a
//! one-shot [`IrqSignal`]. A device asks for a level change by returning
//! an [`IrqRequest`] from its write handler; the router writes the
//! signal and reports the line change for the backend.

pub mod mmio_console;
pub mod virtio;

use crate::memory::MemoryMap;
use log::{debug, info, warn};
use thiserror::Error;

/// Maximum number of devices per VM.
pub const MAX_DEVICES: usize = 16;

/// First IRQ number handed to registering devices.
pub const IRQ_BASE: u32 = 5;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device '{name}' range {start:#x}-{end:#x} overlaps '{other}'")]
    Overlap {
        name: String,
        start: u64,
        end: u64,
        other: String,
    },

    #[error("too many devices (max {MAX_DEVICES})")]
    TooMany,

    #[error("device '{name}' has an empty range")]
    EmptyRange { name: String },
}

// ─── Interrupt signalling ────────────────────────────────────────────

/// One-shot interrupt signal channel.
///
/// Backed by an eventfd on Linux; on hosts without one this is a
/// recorded no-op and interrupt delivery to the guest does not happen
/// through it. Asserting writes a non-zero value, deasserting drains.
pub struct IrqSignal {
    #[cfg(target_os = "linux")]
    fd: Option<vmm_sys_util::eventfd::EventFd>,
}

impl IrqSignal {
    pub fn new() -> Result<Self, std::io::Error> {
        #[cfg(target_os = "linux")]
        {
            let fd = vmm_sys_util::eventfd::EventFd::new(libc::EFD_NONBLOCK)?;
            Ok(IrqSignal { fd: Some(fd) })
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(IrqSignal {})
        }
    }

    /// A handle that records no signal at all.
    pub fn noop() -> Self {
        #[cfg(target_os = "linux")]
        {
            IrqSignal { fd: None }
        }
        #[cfg(not(target_os = "linux"))]
        {
            IrqSignal {}
        }
    }

    pub fn try_clone(&self) -> Result<Self, std::io::Error> {
        #[cfg(target_os = "linux")]
        {
            Ok(IrqSignal {
                fd: self.fd.as_ref().map(|fd| fd.try_clone()).transpose()?,
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(IrqSignal {})
        }
    }

    /// Write a non-zero value into the channel. Idempotent in effect:
    /// repeated asserts accumulate into one pending signal.
    pub fn assert(&self) {
        #[cfg(target_os = "linux")]
        if let Some(fd) = &self.fd {
            let _ = fd.write(1);
        }
    }

    /// Drain the channel.
    pub fn clear(&self) {
        #[cfg(target_os = "linux")]
        if let Some(fd) = &self.fd {
            let _ = fd.read();
        }
    }

    /// True when a signal is pending.
    pub fn is_pending(&self) -> bool {
        #[cfg(target_os = "linux")]
        if let Some(fd) = &self.fd {
            match fd.read() {
                Ok(n) => {
                    // Reading drained it; put it back.
                    if n > 0 {
                        let _ = fd.write(n);
                    }
                    return n > 0;
                }
                Err(_) => return false,
            }
        }
        false
    }
}

/// Interrupt-line change a device asks for from its write handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqRequest {
    None,
    Assert,
    Deassert,
}

// ─── Device trait ────────────────────────────────────────────────────

/// An MMIO-addressable device.
///
/// Offsets are relative to the device's range base. Widths of 1, 2, 4,
/// and 8 bytes arrive; handlers must not assume ordering or atomicity
/// with respect to other MMIO accesses. Cleanup happens in `Drop`.
pub trait MmioDevice: Send {
    /// Guest load from `offset`; fill `data` (little-endian).
    fn read(&mut self, mem: &MemoryMap, offset: u64, data: &mut [u8]);

    /// Guest store to `offset`. Returns the IRQ change the device wants.
    fn write(&mut self, mem: &MemoryMap, offset: u64, data: &[u8]) -> IrqRequest;
}

/// Table entry: a named range with its handler and interrupt channel.
pub struct DeviceEntry {
    name: String,
    start: u64,
    /// Inclusive end of the range.
    end: u64,
    irq: u32,
    signal: IrqSignal,
    dev: Box<dyn MmioDevice>,
}

impl DeviceEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    pub fn signal(&self) -> &IrqSignal {
        &self.signal
    }
}

/// Result of routing one MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    /// A device handled the access; `Some((irq, level))` if it asked for
    /// an interrupt-line change.
    Handled(Option<(u32, bool)>),
    /// No device covers the address.
    Unmapped,
}

// ─── Device table ────────────────────────────────────────────────────

/// Ordered, append-only table of MMIO devices.
#[derive(Default)]
pub struct DeviceTable {
    entries: Vec<DeviceEntry>,
    next_irq: u32,
}

impl DeviceTable {
    pub fn new() -> Self {
        DeviceTable {
            entries: Vec::new(),
            next_irq: IRQ_BASE,
        }
    }

    /// Register a device over `[base, base + len)`, allocating its IRQ
    /// number and interrupt signal. Returns the assigned IRQ.
    pub fn register(
        &mut self,
        name: &str,
        base: u64,
        len: u64,
        dev: Box<dyn MmioDevice>,
    ) -> Result<u32, DeviceError> {
        let signal = IrqSignal::new().unwrap_or_else(|e| {
            warn!("no interrupt signal for '{name}': {e}; recording a no-op handle");
            IrqSignal::noop()
        });
        self.register_with_signal(name, base, len, dev, signal)
    }

    /// Like [`register`](Self::register), but with a signal the device
    /// already shares (a console that triggers its own channel).
    pub fn register_with_signal(
        &mut self,
        name: &str,
        base: u64,
        len: u64,
        dev: Box<dyn MmioDevice>,
        signal: IrqSignal,
    ) -> Result<u32, DeviceError> {
        if len == 0 {
            return Err(DeviceError::EmptyRange {
                name: name.to_string(),
            });
        }
        if self.entries.len() >= MAX_DEVICES {
            return Err(DeviceError::TooMany);
        }
        let end = base + len - 1;
        for entry in &self.entries {
            if base <= entry.end && entry.start <= end {
                return Err(DeviceError::Overlap {
                    name: name.to_string(),
                    start: base,
                    end,
                    other: entry.name.clone(),
                });
            }
        }

        let irq = self.next_irq;
        self.next_irq += 1;
        self.entries.push(DeviceEntry {
            name: name.to_string(),
            start: base,
            end,
            irq,
            signal,
            dev,
        });
        info!("registered device '{name}' at GPA {base:#x}-{end:#x} (irq {irq})");
        Ok(irq)
    }

    /// First entry whose range contains `gpa`.
    pub fn lookup(&self, gpa: u64) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| gpa >= e.start && gpa <= e.end)
    }

    /// Route a guest load.
    pub fn handle_read(&mut self, mem: &MemoryMap, gpa: u64, data: &mut [u8]) -> RouteResult {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| gpa >= e.start && gpa <= e.end)
        else {
            return RouteResult::Unmapped;
        };
        let offset = gpa - entry.start;
        debug!("MMIO read  {:#x} -> '{}'+{offset:#x}", gpa, entry.name);
        entry.dev.read(mem, offset, data);
        RouteResult::Handled(None)
    }

    /// Route a guest store, applying any requested signal change.
    pub fn handle_write(&mut self, mem: &MemoryMap, gpa: u64, data: &[u8]) -> RouteResult {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| gpa >= e.start && gpa <= e.end)
        else {
            return RouteResult::Unmapped;
        };
        let offset = gpa - entry.start;
        debug!("MMIO write {:#x} -> '{}'+{offset:#x}", gpa, entry.name);
        match entry.dev.write(mem, offset, data) {
            IrqRequest::None => RouteResult::Handled(None),
            IrqRequest::Assert => {
                entry.signal.assert();
                RouteResult::Handled(Some((entry.irq, true)))
            }
            IrqRequest::Deassert => {
                entry.signal.clear();
                RouteResult::Handled(Some((entry.irq, false)))
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every access for inspection.
    struct ProbeDevice {
        log: Arc<Mutex<Vec<(char, u64, usize)>>>,
        fill: u8,
        request: IrqRequest,
    }

    impl ProbeDevice {
        fn new(log: Arc<Mutex<Vec<(char, u64, usize)>>>) -> Self {
            ProbeDevice {
                log,
                fill: 0xab,
                request: IrqRequest::None,
            }
        }
    }

    impl MmioDevice for ProbeDevice {
        fn read(&mut self, _mem: &MemoryMap, offset: u64, data: &mut [u8]) {
            self.log.lock().unwrap().push(('r', offset, data.len()));
            data.fill(self.fill);
        }

        fn write(&mut self, _mem: &MemoryMap, offset: u64, data: &[u8]) -> IrqRequest {
            self.log.lock().unwrap().push(('w', offset, data.len()));
            self.request
        }
    }

    fn probe(log: &Arc<Mutex<Vec<(char, u64, usize)>>>) -> Box<ProbeDevice> {
        Box::new(ProbeDevice::new(Arc::clone(log)))
    }

    #[test]
    fn irq_numbers_start_at_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = DeviceTable::new();
        let a = table.register("a", 0x1000, 0x1000, probe(&log)).unwrap();
        let b = table.register("b", 0x2000, 0x1000, probe(&log)).unwrap();
        let c = table.register("c", 0x3000, 0x1000, probe(&log)).unwrap();
        assert_eq!((a, b, c), (IRQ_BASE, IRQ_BASE + 1, IRQ_BASE + 2));
    }

    #[test]
    fn ranges_must_not_overlap() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = DeviceTable::new();
        table.register("a", 0x1000, 0x1000, probe(&log)).unwrap();

        assert!(matches!(
            table.register("b", 0x1800, 0x1000, probe(&log)),
            Err(DeviceError::Overlap { .. })
        ));
        // The inclusive end makes 0x1fff the last covered byte.
        assert!(table.register("c", 0x2000, 0x1000, probe(&log)).is_ok());
    }

    #[test]
    fn table_is_bounded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = DeviceTable::new();
        for i in 0..MAX_DEVICES as u64 {
            table
                .register(&format!("d{i}"), i * 0x1000, 0x1000, probe(&log))
                .unwrap();
        }
        assert!(matches!(
            table.register("extra", 0x100_0000, 0x1000, probe(&log)),
            Err(DeviceError::TooMany)
        ));
    }

    #[test]
    fn dispatch_passes_range_relative_offsets() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = DeviceTable::new();
        table.register("a", 0x9000_0000, 0x1000, probe(&log)).unwrap();
        let mem = MemoryMap::new();

        let mut buf = [0u8; 4];
        assert_eq!(
            table.handle_read(&mem, 0x9000_0010, &mut buf),
            RouteResult::Handled(None)
        );
        assert_eq!(buf, [0xab; 4]);
        assert_eq!(
            table.handle_write(&mem, 0x9000_0ff8, &buf),
            RouteResult::Handled(None)
        );

        let log = log.lock().unwrap();
        assert_eq!(*log, vec![('r', 0x10, 4), ('w', 0xff8, 4)]);
    }

    #[test]
    fn unmapped_addresses_are_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = DeviceTable::new();
        table.register("a", 0x1000, 0x1000, probe(&log)).unwrap();
        let mem = MemoryMap::new();

        let mut buf = [0u8; 4];
        assert_eq!(
            table.handle_read(&mem, 0x80_0000, &mut buf),
            RouteResult::Unmapped
        );
        assert_eq!(table.handle_write(&mem, 0x80_0000, &buf), RouteResult::Unmapped);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn write_irq_request_raises_line() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dev = ProbeDevice::new(Arc::clone(&log));
        dev.request = IrqRequest::Assert;
        let mut table = DeviceTable::new();
        let irq = table.register("a", 0x1000, 0x1000, Box::new(dev)).unwrap();
        let mem = MemoryMap::new();

        let outcome = table.handle_write(&mem, 0x1000, &[0u8; 4]);
        assert_eq!(outcome, RouteResult::Handled(Some((irq, true))));
        #[cfg(target_os = "linux")]
        assert!(table.lookup(0x1000).unwrap().signal().is_pending());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn irq_signal_assert_and_drain() {
        let signal = IrqSignal::new().unwrap();
        assert!(!signal.is_pending());
        signal.assert();
        assert!(signal.is_pending());
        signal.clear();
        assert!(!signal.is_pending());
    }
}
