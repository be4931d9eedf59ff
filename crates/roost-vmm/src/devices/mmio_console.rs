//! MMIO debug console.
//!
//! A UART16550-style serial port mapped into guest physical memory
//! (0x0090_0000 in the default layout) so early guest code can print with
//! plain byte stores before any virtio driver is up. The register model
//! comes from [`vm_superio::Serial`]; this module only adapts it to the
//! MMIO device trait and wires its interrupt trigger to the portable IRQ
//! signal.

use super::{IrqRequest, IrqSignal, MmioDevice};
use crate::memory::MemoryMap;
use log::debug;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};

/// Size of the console's MMIO window.
pub const MMIO_CONSOLE_SIZE: u64 = 0x1000;

/// Adapts the portable IRQ signal to `vm_superio`'s trigger interface.
pub struct SerialTrigger(IrqSignal);

impl Trigger for SerialTrigger {
    type E = io::Error;

    fn trigger(&self) -> Result<(), io::Error> {
        self.0.assert();
        Ok(())
    }
}

/// A writer that forwards to stdout and keeps a copy for inspection.
#[derive(Clone, Default)]
pub struct CapturingWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturingWriter {
    pub fn new() -> Self {
        CapturingWriter::default()
    }

    /// Take the captured output, clearing the internal buffer.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    /// The captured output so far (lossy UTF-8).
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

impl Write for CapturingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        io::stdout().flush()?;
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// The MMIO console device.
pub struct MmioConsole {
    serial: Serial<SerialTrigger, NoEvents, Box<dyn Write + Send>>,
    signal: IrqSignal,
}

impl MmioConsole {
    /// Build a console writing to `out`.
    pub fn new(out: Box<dyn Write + Send>) -> Result<Self, io::Error> {
        let signal = IrqSignal::new()?;
        let trigger = SerialTrigger(signal.try_clone()?);
        Ok(MmioConsole {
            serial: Serial::new(trigger, out),
            signal,
        })
    }

    /// A console writing to the process stdout.
    pub fn stdout() -> Result<Self, io::Error> {
        Self::new(Box::new(CapturingWriter::new()))
    }

    /// A clone of the interrupt signal this console triggers, for the
    /// device table entry.
    pub fn irq_signal(&self) -> Result<IrqSignal, io::Error> {
        self.signal.try_clone()
    }

    /// Feed host input into the guest-visible receive buffer.
    pub fn queue_input(&mut self, bytes: &[u8]) {
        if let Err(e) = self.serial.enqueue_raw_bytes(bytes) {
            debug!("console input dropped: {e:?}");
        }
    }
}

impl MmioDevice for MmioConsole {
    fn read(&mut self, _mem: &MemoryMap, offset: u64, data: &mut [u8]) {
        data.fill(0);
        if offset < 8 {
            data[0] = self.serial.read(offset as u8);
        } else {
            debug!("console: read from unknown offset {offset:#x}");
        }
    }

    fn write(&mut self, _mem: &MemoryMap, offset: u64, data: &[u8]) -> IrqRequest {
        if offset < 8 && !data.is_empty() {
            // Wider stores land their low byte; backends that cannot
            // decode the access width report a conservative 4.
            if let Err(e) = self.serial.write(offset as u8, data[0]) {
                debug!("console write failed: {e:?}");
            }
        } else {
            debug!("console: write to unknown offset {offset:#x}");
        }
        IrqRequest::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Offset of the line-status register.
    const LSR: u64 = 5;
    /// Offset of the scratch register.
    const SCRATCH: u64 = 7;

    fn console_with_capture() -> (MmioConsole, CapturingWriter) {
        let capture = CapturingWriter::new();
        let console = MmioConsole::new(Box::new(capture.clone())).unwrap();
        (console, capture)
    }

    #[test]
    fn tx_bytes_reach_the_sink() {
        let (mut console, capture) = console_with_capture();
        let mem = MemoryMap::new();

        console.write(&mem, 0, b"H");
        console.write(&mem, 0, b"i");
        assert_eq!(capture.as_string(), "Hi");
    }

    #[test]
    fn wide_store_writes_low_byte() {
        let (mut console, capture) = console_with_capture();
        let mem = MemoryMap::new();

        console.write(&mem, 0, &(b'X' as u32).to_le_bytes());
        assert_eq!(capture.as_string(), "X");
    }

    #[test]
    fn line_status_reports_empty_transmitter() {
        let (mut console, _capture) = console_with_capture();
        let mem = MemoryMap::new();

        let mut buf = [0u8; 1];
        console.read(&mem, LSR, &mut buf);
        // THR empty + transmitter idle.
        assert_eq!(buf[0] & 0x60, 0x60);
    }

    #[test]
    fn scratch_register_round_trips() {
        let (mut console, _capture) = console_with_capture();
        let mem = MemoryMap::new();

        console.write(&mem, SCRATCH, &[0x5a]);
        let mut buf = [0u8; 1];
        console.read(&mem, SCRATCH, &mut buf);
        assert_eq!(buf[0], 0x5a);
    }

    #[test]
    fn out_of_window_offsets_are_ignored() {
        let (mut console, capture) = console_with_capture();
        let mem = MemoryMap::new();

        assert_eq!(console.write(&mem, 0x100, b"x"), IrqRequest::None);
        let mut buf = [0xffu8; 4];
        console.read(&mem, 0x100, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
        assert!(capture.as_string().is_empty());
    }

    #[test]
    fn queued_input_is_readable() {
        let (mut console, _capture) = console_with_capture();
        let mem = MemoryMap::new();

        console.queue_input(b"y");
        let mut lsr = [0u8; 1];
        console.read(&mem, LSR, &mut lsr);
        assert_eq!(lsr[0] & 0x01, 0x01, "data-ready should be set");

        let mut buf = [0u8; 1];
        console.read(&mem, 0, &mut buf);
        assert_eq!(buf[0], b'y');
    }
}
