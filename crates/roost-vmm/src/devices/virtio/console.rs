//! Virtio console device class.
//!
//! Streams guest transmit buffers to a host output sink. Like the system
//! this models, any notified queue is treated as transmit: descriptors
//! the device may read are written to the sink in chain order. Host →
//! guest input is an external collaborator and is not wired up here.

use super::{walk_chain, VirtQueue, VirtioBackend, VIRTIO_ID_CONSOLE};
use crate::memory::MemoryMap;
use log::{debug, warn};
use std::io::Write;

/// Configuration space layout: cols, rows, max_nr_ports, emerg_wr.
const CONFIG_SIZE: usize = 20;

/// The virtio console backend.
pub struct VirtioConsole {
    out: Box<dyn Write + Send>,
    cols: u16,
    rows: u16,
}

impl VirtioConsole {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        VirtioConsole {
            out,
            cols: 80,
            rows: 25,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn config_bytes(&self) -> [u8; CONFIG_SIZE] {
        let mut cfg = [0u8; CONFIG_SIZE];
        cfg[0..2].copy_from_slice(&self.cols.to_le_bytes());
        cfg[2..4].copy_from_slice(&self.rows.to_le_bytes());
        cfg[4..8].copy_from_slice(&1u32.to_le_bytes()); // max_nr_ports
        cfg
    }
}

impl VirtioBackend for VirtioConsole {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_CONSOLE
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn num_queues(&self) -> usize {
        2 // receive, transmit
    }

    fn process_queue(&mut self, _queue_idx: usize, queue: &mut VirtQueue, mem: &MemoryMap) -> bool {
        let mut work = false;
        while let Some(head) = queue.pop_avail(mem) {
            let Some(chain) = walk_chain(queue, mem, head) else {
                warn!("console: malformed descriptor chain, dropped");
                continue;
            };
            let mut consumed = 0u32;
            for buf in chain.iter().filter(|b| !b.device_writes) {
                let mut data = vec![0u8; buf.len as usize];
                if mem.read(buf.gpa, &mut data).is_err() {
                    warn!("console: unreadable TX buffer at GPA {:#x}", buf.gpa);
                    continue;
                }
                if self.out.write_all(&data).is_err() {
                    debug!("console: sink write failed, {} bytes dropped", data.len());
                } else {
                    consumed += buf.len;
                }
            }
            let _ = self.out.flush();
            queue.add_used(mem, head, consumed);
            work = true;
        }
        work
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        let cfg = self.config_bytes();
        let start = offset as usize;
        if start < cfg.len() {
            let end = (start + data.len()).min(cfg.len());
            data[..end - start].copy_from_slice(&cfg[start..end]);
        }
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        match (offset, data.len()) {
            (0, 2..) => self.cols = u16::from_le_bytes([data[0], data[1]]),
            (2, 2..) => self.rows = u16::from_le_bytes([data[0], data[1]]),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_ring::*;
    use super::super::*;
    use super::*;
    use crate::devices::mmio_console::CapturingWriter;
    use crate::hv::testing::FakeVm;

    fn console_device() -> (VirtioMmio, CapturingWriter, MemoryMap) {
        let capture = CapturingWriter::new();
        let dev = VirtioMmio::new(Box::new(VirtioConsole::new(Box::new(capture.clone()))));
        let vm = FakeVm::default();
        let mut mem = MemoryMap::new();
        mem.add_region(&vm, 0, 0x10_0000).unwrap();
        (dev, capture, mem)
    }

    #[test]
    fn identifies_as_a_console() {
        let (mut dev, _capture, mem) = console_device();
        assert_eq!(read_reg(&mut dev, &mem, 0x00), 0x7472_6976); // "virt"
        assert_eq!(read_reg(&mut dev, &mem, 0x04), 1);
        assert_eq!(read_reg(&mut dev, &mem, 0x08), VIRTIO_ID_CONSOLE);
    }

    #[test]
    fn single_descriptor_reaches_the_sink() {
        let (mut dev, capture, mem) = console_device();
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);

        mem.write(0x8000, b"hello\n").unwrap();
        ring.write_desc(&mem, 0, VirtqDesc {
            addr: 0x8000,
            len: 6,
            flags: 0,
            next: 0,
        });
        ring.publish(&mem, 0);
        let irq = notify(&mut dev, &mem, 0);

        assert_eq!(capture.as_string(), "hello\n");
        assert_eq!(irq, crate::devices::IrqRequest::Assert);
        assert_eq!(ring.used_idx(&mem), 1);
        assert_eq!(ring.used_elem(&mem, 0), (0, 6));
    }

    #[test]
    fn chained_descriptors_stream_in_order() {
        let (mut dev, capture, mem) = console_device();
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 1);

        mem.write(0x8000, b"foo").unwrap();
        mem.write(0x9000, b"bar").unwrap();
        ring.write_desc(&mem, 0, VirtqDesc {
            addr: 0x8000,
            len: 3,
            flags: VIRTQ_DESC_F_NEXT,
            next: 1,
        });
        ring.write_desc(&mem, 1, VirtqDesc {
            addr: 0x9000,
            len: 3,
            flags: 0,
            next: 0,
        });
        ring.publish(&mem, 0);
        notify(&mut dev, &mem, 1);

        assert_eq!(capture.as_string(), "foobar");
        assert_eq!(ring.used_elem(&mem, 0), (0, 6));
    }

    #[test]
    fn config_space_reports_geometry() {
        let (mut dev, _capture, mem) = console_device();
        let mut buf = [0u8; 2];
        dev.read(&mem, 0x100, &mut buf);
        assert_eq!(u16::from_le_bytes(buf), 80);
        dev.read(&mem, 0x102, &mut buf);
        assert_eq!(u16::from_le_bytes(buf), 25);

        dev.write(&mem, 0x100, &132u16.to_le_bytes());
        dev.read(&mem, 0x100, &mut buf);
        assert_eq!(u16::from_le_bytes(buf), 132);
    }
}
