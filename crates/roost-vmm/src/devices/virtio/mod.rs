//! Virtio MMIO transport (legacy-compatible, version 1).
//!
//! A virtio device occupies one 4 KiB MMIO window. The transport owns the
//! register interface and the virtqueues; device-class behaviour (console,
//! block, net) lives behind the [`VirtioBackend`] trait and is invoked
//! when the guest writes the queue-notify register.
//!
//! Registers are accessed in 32-bit units:
//!
//! | Offset | R/W | Meaning |
//! |--------|-----|---------------------------------------------|
//! | 0x00   | R   | Magic ("virt")                              |
//! | 0x04   | R   | Version (1)                                 |
//! | 0x08   | R   | Device class ID                             |
//! | 0x0C   | R   | Vendor ID (0)                               |
//! | 0x10   | R   | Device features (selected window)           |
//! | 0x14   | W   | Device-feature selector                     |
//! | 0x18   | W   | Driver features (selected window)           |
//! | 0x1C   | W   | Driver-feature selector                     |
//! | 0x20   | R/W | Max queue size (R) / guest page size (W)    |
//! | 0x24   | R/W | Current queue size (R) / queue selector (W) |
//! | 0x28   | W   | Queue size                                  |
//! | 0x30   | R/W | Queue ready                                 |
//! | 0x34   | W   | Queue notify                                |
//! | 0x38   | R/W | Interrupt status (R) / interrupt ack (W)    |
//! | 0x40   | R/W | Device status                               |
//! | 0x80+  | W   | Queue ring base addresses (low/high pairs)  |
//! | 0x100+ | R/W | Device-class configuration space            |
//!
//! Queue notifications are processed synchronously in the notifying
//! vCPU's MMIO-exit handler, so each queue has exactly one host-side
//! writer at a time and needs no lock.

pub mod block;
pub mod console;
#[cfg(target_os = "linux")]
pub mod net;

use super::{IrqRequest, MmioDevice};
use crate::memory::MemoryMap;
use log::{debug, info, warn};
use vm_memory::ByteValued;

/// Size of a virtio MMIO device window.
pub const VIRTIO_MMIO_SIZE: u64 = 0x1000;

/// Largest virtqueue size the transport offers.
pub const MAX_QUEUE_SIZE: u16 = 256;

// Device class IDs.
pub const VIRTIO_ID_NET: u32 = 1;
pub const VIRTIO_ID_BLOCK: u32 = 2;
pub const VIRTIO_ID_CONSOLE: u32 = 3;
pub const VIRTIO_ID_RNG: u32 = 4;

/// Feature bit every device offers: the device speaks virtio 1.x.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

// Device status bits.
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;
pub const STATUS_FAILED: u32 = 0x80;

/// Interrupt-status bit: the device used a buffer.
const INT_VRING: u32 = 1;

// Register offsets.
const REG_MAGIC: u64 = 0x00;
const REG_VERSION: u64 = 0x04;
const REG_DEVICE_ID: u64 = 0x08;
const REG_VENDOR_ID: u64 = 0x0c;
const REG_DEVICE_FEATURES: u64 = 0x10;
const REG_DEVICE_FEATURES_SEL: u64 = 0x14;
const REG_DRIVER_FEATURES: u64 = 0x18;
const REG_DRIVER_FEATURES_SEL: u64 = 0x1c;
const REG_QUEUE_NUM_MAX: u64 = 0x20;
const REG_QUEUE_SEL: u64 = 0x24;
const REG_QUEUE_NUM: u64 = 0x28;
const REG_QUEUE_READY: u64 = 0x30;
const REG_QUEUE_NOTIFY: u64 = 0x34;
const REG_INTERRUPT: u64 = 0x38;
const REG_STATUS: u64 = 0x40;
const REG_QUEUE_DESC_LOW: u64 = 0x80;
const REG_QUEUE_DESC_HIGH: u64 = 0x84;
const REG_QUEUE_DRIVER_LOW: u64 = 0x90;
const REG_QUEUE_DRIVER_HIGH: u64 = 0x94;
const REG_QUEUE_DEVICE_LOW: u64 = 0xa0;
const REG_QUEUE_DEVICE_HIGH: u64 = 0xa4;
const REG_CONFIG: u64 = 0x100;

/// Magic constant, "virt" in little-endian ASCII.
const MAGIC: u32 = 0x7472_6976;

/// Transport version: legacy-compatible.
const VERSION: u32 = 1;

// Descriptor flags.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

// ─── Virtqueue structures ────────────────────────────────────────────

/// A guest-resident virtqueue descriptor (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtqDesc {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// NEXT / WRITE flags.
    pub flags: u16,
    /// Next descriptor index when NEXT is set.
    pub next: u16,
}

// Safety: plain #[repr(C)] integers, no padding (8 + 4 + 2 + 2).
unsafe impl ByteValued for VirtqDesc {}

/// One split virtqueue.
///
/// Shadow indices live host-side: `last_avail` tracks how far into the
/// available ring the device has consumed, `used_idx` is the next used
/// slot to publish. Both advance monotonically modulo 2^16.
#[derive(Debug, Clone)]
pub struct VirtQueue {
    index: u16,
    max_size: u16,
    size: u16,
    ready: bool,
    desc_gpa: u64,
    avail_gpa: u64,
    used_gpa: u64,
    last_avail: u16,
    used_idx: u16,
}

impl VirtQueue {
    pub fn new(index: u16, max_size: u16) -> Self {
        VirtQueue {
            index,
            max_size,
            size: 0,
            ready: false,
            desc_gpa: 0,
            avail_gpa: 0,
            used_gpa: 0,
            last_avail: 0,
            used_idx: 0,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn set_size(&mut self, size: u16) {
        self.size = size.min(self.max_size);
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn last_avail(&self) -> u16 {
        self.last_avail
    }

    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    fn set_addr_low(addr: &mut u64, val: u32) {
        *addr = (*addr & 0xffff_ffff_0000_0000) | val as u64;
    }

    fn set_addr_high(addr: &mut u64, val: u32) {
        *addr = (*addr & 0x0000_0000_ffff_ffff) | ((val as u64) << 32);
    }

    /// Read descriptor `idx` from the guest's descriptor table.
    pub fn read_desc(&self, mem: &MemoryMap, idx: u16) -> Option<VirtqDesc> {
        if idx >= self.size {
            return None;
        }
        mem.read_obj(self.desc_gpa + idx as u64 * 16).ok()
    }

    /// The driver's current `avail.idx`.
    pub fn avail_idx(&self, mem: &MemoryMap) -> Option<u16> {
        mem.read_obj(self.avail_gpa + 2).ok()
    }

    /// Pop the next available descriptor-chain head, if the driver has
    /// published one past our shadow index.
    pub fn pop_avail(&mut self, mem: &MemoryMap) -> Option<u16> {
        if !self.ready || self.size == 0 {
            return None;
        }
        let avail = self.avail_idx(mem)?;
        if avail == self.last_avail {
            return None;
        }
        let slot = (self.last_avail % self.size) as u64;
        let head: u16 = mem.read_obj(self.avail_gpa + 4 + slot * 2).ok()?;
        self.last_avail = self.last_avail.wrapping_add(1);
        Some(head)
    }

    /// Publish a completed chain: write `(head, len)` into the used ring
    /// and advance `used.idx`.
    pub fn add_used(&mut self, mem: &MemoryMap, head: u16, len: u32) -> bool {
        if !self.ready || self.size == 0 {
            return false;
        }
        let slot = (self.used_idx % self.size) as u64;
        let elem = self.used_gpa + 4 + slot * 8;
        if mem.write_obj(head as u32, elem).is_err() {
            return false;
        }
        if mem.write_obj(len, elem + 4).is_err() {
            return false;
        }
        self.used_idx = self.used_idx.wrapping_add(1);
        mem.write_obj(self.used_idx, self.used_gpa + 2).is_ok()
    }
}

/// One resolved buffer of a descriptor chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainBuffer {
    pub gpa: u64,
    pub len: u32,
    /// True for write-only (device → guest) buffers.
    pub device_writes: bool,
}

/// Resolve the descriptor chain rooted at `head`.
///
/// Follows `next` while the NEXT flag is set; a chain longer than the
/// queue size (which also covers cycles) is malformed and yields `None`.
pub fn walk_chain(queue: &VirtQueue, mem: &MemoryMap, head: u16) -> Option<Vec<ChainBuffer>> {
    let mut buffers = Vec::new();
    let mut idx = head;
    let mut links = 0u16;
    loop {
        links = links.checked_add(1)?;
        if links > queue.size() {
            warn!("descriptor chain exceeds queue size, dropping");
            return None;
        }
        let desc = queue.read_desc(mem, idx)?;
        if desc.len > 0 {
            buffers.push(ChainBuffer {
                gpa: desc.addr,
                len: desc.len,
                device_writes: desc.flags & VIRTQ_DESC_F_WRITE != 0,
            });
        }
        if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
            break;
        }
        idx = desc.next;
    }
    Some(buffers)
}

// ─── Device-class backend ────────────────────────────────────────────

/// Device-class behaviour behind the transport.
pub trait VirtioBackend: Send {
    /// Device class ID (net=1, block=2, console=3, rng=4).
    fn device_id(&self) -> u32;

    /// Feature bits beyond VERSION_1, which the transport always offers.
    fn device_features(&self) -> u64;

    /// Number of virtqueues.
    fn num_queues(&self) -> usize;

    /// Drain available descriptors from `queue`, placing responses in the
    /// used ring. Returns true if work was done and the device interrupt
    /// should be asserted.
    fn process_queue(&mut self, queue_idx: usize, queue: &mut VirtQueue, mem: &MemoryMap) -> bool;

    /// Device-class configuration space read (offset relative to 0x100).
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Device-class configuration space write.
    fn write_config(&mut self, offset: u64, data: &[u8]);
}

// ─── Transport ───────────────────────────────────────────────────────

/// The virtio MMIO transport: register window + virtqueues + backend.
pub struct VirtioMmio {
    device_features: u64,
    device_features_sel: u32,
    driver_features: u64,
    driver_features_sel: u32,
    queue_sel: u32,
    status: u32,
    interrupt_status: u32,
    queues: Vec<VirtQueue>,
    backend: Box<dyn VirtioBackend>,
}

impl VirtioMmio {
    pub fn new(backend: Box<dyn VirtioBackend>) -> Self {
        let device_features = backend.device_features() | VIRTIO_F_VERSION_1;
        let queues = (0..backend.num_queues())
            .map(|i| VirtQueue::new(i as u16, MAX_QUEUE_SIZE))
            .collect();
        VirtioMmio {
            device_features,
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            status: 0,
            interrupt_status: 0,
            queues,
            backend,
        }
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn queue(&self, idx: usize) -> Option<&VirtQueue> {
        self.queues.get(idx)
    }

    pub fn backend(&self) -> &dyn VirtioBackend {
        &*self.backend
    }

    pub fn backend_mut(&mut self) -> &mut dyn VirtioBackend {
        &mut *self.backend
    }

    fn selected(&mut self) -> Option<&mut VirtQueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn reg_read(&mut self, offset: u64) -> u32 {
        match offset {
            REG_MAGIC => MAGIC,
            REG_VERSION => VERSION,
            REG_DEVICE_ID => self.backend.device_id(),
            REG_VENDOR_ID => 0,
            REG_DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features as u32,
                1 => (self.device_features >> 32) as u32,
                _ => 0,
            },
            REG_QUEUE_NUM_MAX => self
                .selected()
                .map(|q| q.max_size() as u32)
                .unwrap_or(0),
            REG_QUEUE_SEL => self.selected().map(|q| q.size() as u32).unwrap_or(0),
            REG_QUEUE_READY => self.selected().map(|q| q.is_ready() as u32).unwrap_or(0),
            REG_INTERRUPT => self.interrupt_status,
            REG_STATUS => self.status,
            _ => {
                debug!("virtio: read from unknown offset {offset:#x}");
                0
            }
        }
    }

    /// Handle a register write. Returns the IRQ change to apply.
    fn reg_write(&mut self, mem: &MemoryMap, offset: u64, val: u32) -> IrqRequest {
        match offset {
            REG_DEVICE_FEATURES_SEL => self.device_features_sel = val,
            REG_DRIVER_FEATURES => match self.driver_features_sel {
                0 => {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff_0000_0000) | val as u64;
                }
                1 => {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff) | ((val as u64) << 32);
                }
                sel => debug!("virtio: driver features window {sel} ignored"),
            },
            REG_DRIVER_FEATURES_SEL => self.driver_features_sel = val,
            REG_QUEUE_NUM_MAX => {
                debug!("virtio: guest page size {val:#x} (legacy, ignored)");
            }
            REG_QUEUE_SEL => self.queue_sel = val,
            REG_QUEUE_NUM => {
                if let Some(q) = self.selected() {
                    q.set_size(val as u16);
                }
            }
            REG_QUEUE_READY => {
                if let Some(q) = self.selected() {
                    q.set_ready(val != 0);
                }
            }
            REG_QUEUE_DESC_LOW => {
                if let Some(q) = self.selected() {
                    VirtQueue::set_addr_low(&mut q.desc_gpa, val);
                }
            }
            REG_QUEUE_DESC_HIGH => {
                if let Some(q) = self.selected() {
                    VirtQueue::set_addr_high(&mut q.desc_gpa, val);
                }
            }
            REG_QUEUE_DRIVER_LOW => {
                if let Some(q) = self.selected() {
                    VirtQueue::set_addr_low(&mut q.avail_gpa, val);
                }
            }
            REG_QUEUE_DRIVER_HIGH => {
                if let Some(q) = self.selected() {
                    VirtQueue::set_addr_high(&mut q.avail_gpa, val);
                }
            }
            REG_QUEUE_DEVICE_LOW => {
                if let Some(q) = self.selected() {
                    VirtQueue::set_addr_low(&mut q.used_gpa, val);
                }
            }
            REG_QUEUE_DEVICE_HIGH => {
                if let Some(q) = self.selected() {
                    VirtQueue::set_addr_high(&mut q.used_gpa, val);
                }
            }
            REG_QUEUE_NOTIFY => return self.notify(mem, val),
            REG_INTERRUPT => {
                self.interrupt_status &= !val;
                if self.interrupt_status == 0 {
                    return IrqRequest::Deassert;
                }
            }
            REG_STATUS => {
                self.status = val;
                if val == 0 {
                    self.reset();
                } else if val & STATUS_DRIVER_OK != 0 {
                    info!(
                        "virtio device {}: driver ready",
                        self.backend.device_id()
                    );
                }
            }
            _ => debug!("virtio: write to unknown offset {offset:#x}"),
        }
        IrqRequest::None
    }

    /// Queue notification: the value written is a queue index.
    ///
    /// Nothing is processed before the guest has signalled DRIVER_OK and
    /// marked the queue ready.
    fn notify(&mut self, mem: &MemoryMap, queue_idx: u32) -> IrqRequest {
        if self.status & STATUS_DRIVER_OK == 0 {
            debug!("virtio: notify for queue {queue_idx} before DRIVER_OK, ignored");
            return IrqRequest::None;
        }
        let idx = queue_idx as usize;
        if idx >= self.queues.len() {
            warn!("virtio: notify for nonexistent queue {queue_idx}");
            return IrqRequest::None;
        }
        if !self.queues[idx].is_ready() {
            debug!("virtio: notify for queue {queue_idx} before ready, ignored");
            return IrqRequest::None;
        }
        if self.backend.process_queue(idx, &mut self.queues[idx], mem) {
            self.interrupt_status |= INT_VRING;
            IrqRequest::Assert
        } else {
            IrqRequest::None
        }
    }

    /// Driver wrote 0 to the status register: device reset.
    fn reset(&mut self) {
        self.driver_features = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.queue_sel = 0;
        self.interrupt_status = 0;
        for q in &mut self.queues {
            *q = VirtQueue::new(q.index(), q.max_size());
        }
        debug!("virtio device {} reset", self.backend.device_id());
    }
}

impl MmioDevice for VirtioMmio {
    fn read(&mut self, _mem: &MemoryMap, offset: u64, data: &mut [u8]) {
        if offset >= REG_CONFIG {
            self.backend.read_config(offset - REG_CONFIG, data);
            return;
        }
        let val = self.reg_read(offset);
        let bytes = val.to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
        if data.len() > 4 {
            data[4..].fill(0);
        }
    }

    fn write(&mut self, mem: &MemoryMap, offset: u64, data: &[u8]) -> IrqRequest {
        if offset >= REG_CONFIG {
            self.backend.write_config(offset - REG_CONFIG, data);
            return IrqRequest::None;
        }
        let mut buf = [0u8; 4];
        let len = data.len().min(4);
        buf[..len].copy_from_slice(&data[..len]);
        self.reg_write(mem, offset, u32::from_le_bytes(buf))
    }
}

// ─── Test harness: a guest-side view of one virtqueue ────────────────


#[cfg(test)]
mod tests {
    use super::test_ring::*;
    use super::*;
    use crate::hv::testing::FakeVm;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts queue processing invocations.
    struct CountingBackend {
        device_id: u32,
        features: u64,
        num_queues: usize,
        processed: Arc<AtomicUsize>,
    }

    impl VirtioBackend for CountingBackend {
        fn device_id(&self) -> u32 {
            self.device_id
        }
        fn device_features(&self) -> u64 {
            self.features
        }
        fn num_queues(&self) -> usize {
            self.num_queues
        }
        fn process_queue(
            &mut self,
            _queue_idx: usize,
            queue: &mut VirtQueue,
            mem: &MemoryMap,
        ) -> bool {
            let mut work = false;
            while let Some(head) = queue.pop_avail(mem) {
                queue.add_used(mem, head, 0);
                work = true;
            }
            if work {
                self.processed.fetch_add(1, Ordering::SeqCst);
            }
            work
        }
        fn read_config(&self, _offset: u64, data: &mut [u8]) {
            data.fill(0xcf);
        }
        fn write_config(&mut self, _offset: u64, _data: &[u8]) {}
    }

    fn counting_device(num_queues: usize) -> (VirtioMmio, Arc<AtomicUsize>) {
        let processed = Arc::new(AtomicUsize::new(0));
        let dev = VirtioMmio::new(Box::new(CountingBackend {
            device_id: VIRTIO_ID_RNG,
            features: 0,
            num_queues,
            processed: Arc::clone(&processed),
        }));
        (dev, processed)
    }

    fn guest_mem() -> MemoryMap {
        let vm = FakeVm::default();
        let mut mem = MemoryMap::new();
        mem.add_region(&vm, 0, 0x10_0000).unwrap();
        mem
    }

    #[test]
    fn identity_registers() {
        let (mut dev, _) = counting_device(1);
        let mem = guest_mem();

        assert_eq!(read_reg(&mut dev, &mem, REG_MAGIC), MAGIC);
        assert_eq!(read_reg(&mut dev, &mem, REG_VERSION), 1);
        assert_eq!(read_reg(&mut dev, &mem, REG_DEVICE_ID), VIRTIO_ID_RNG);
        assert_eq!(read_reg(&mut dev, &mem, REG_VENDOR_ID), 0);
        assert_eq!(read_reg(&mut dev, &mem, REG_QUEUE_NUM_MAX), MAX_QUEUE_SIZE as u32);
    }

    #[test]
    fn version_1_feature_is_always_offered() {
        let (mut dev, _) = counting_device(1);
        let mem = guest_mem();

        // Window 0: nothing set by this backend.
        assert_eq!(read_reg(&mut dev, &mem, REG_DEVICE_FEATURES), 0);
        // Window 1 carries VERSION_1 (bit 32).
        dev.write(&mem, REG_DEVICE_FEATURES_SEL, &1u32.to_le_bytes());
        assert_eq!(read_reg(&mut dev, &mem, REG_DEVICE_FEATURES), 1);
    }

    #[test]
    fn notifications_are_gated_on_driver_ok() {
        let (mut dev, processed) = counting_device(1);
        let mem = guest_mem();
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);
        ring.write_desc(&mem, 0, VirtqDesc {
            addr: 0x8000,
            len: 4,
            flags: 0,
            next: 0,
        });
        ring.publish(&mem, 0);

        // Ready but no DRIVER_OK: the class handler must not run.
        assert_eq!(notify(&mut dev, &mem, 0), IrqRequest::None);
        assert_eq!(processed.load(Ordering::SeqCst), 0);

        driver_ok(&mut dev, &mem);
        assert_eq!(notify(&mut dev, &mem, 0), IrqRequest::Assert);
        assert_eq!(processed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifications_are_gated_on_queue_ready() {
        let (mut dev, processed) = counting_device(1);
        let mem = guest_mem();
        driver_ok(&mut dev, &mem);

        assert_eq!(notify(&mut dev, &mem, 0), IrqRequest::None);
        assert_eq!(processed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn used_and_avail_indices_advance_monotonically() {
        let (mut dev, _) = counting_device(1);
        let mem = guest_mem();
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);

        for i in 0..5 {
            ring.write_desc(&mem, i, VirtqDesc {
                addr: 0x8000 + i as u64 * 16,
                len: 4,
                flags: 0,
                next: 0,
            });
            ring.publish(&mem, i);
            notify(&mut dev, &mem, 0);
            assert_eq!(ring.used_idx(&mem), i + 1);
            assert_eq!(dev.queue(0).unwrap().last_avail(), i + 1);
        }
    }

    #[test]
    fn interrupt_ack_clears_and_deasserts() {
        let (mut dev, _) = counting_device(1);
        let mem = guest_mem();
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);
        ring.write_desc(&mem, 0, VirtqDesc {
            addr: 0x8000,
            len: 4,
            flags: 0,
            next: 0,
        });
        ring.publish(&mem, 0);

        assert_eq!(notify(&mut dev, &mem, 0), IrqRequest::Assert);
        let status = read_reg(&mut dev, &mem, REG_INTERRUPT);
        assert_eq!(status & INT_VRING, INT_VRING);

        let ack = dev.write(&mem, REG_INTERRUPT, &status.to_le_bytes());
        assert_eq!(ack, IrqRequest::Deassert);
        assert_eq!(read_reg(&mut dev, &mem, REG_INTERRUPT), 0);
    }

    #[test]
    fn status_zero_resets_the_device() {
        let (mut dev, _) = counting_device(2);
        let mem = guest_mem();
        driver_ok(&mut dev, &mem);
        let ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 1);
        assert!(dev.queue(1).unwrap().is_ready());

        dev.write(&mem, REG_STATUS, &0u32.to_le_bytes());
        assert_eq!(dev.status(), 0);
        assert!(!dev.queue(1).unwrap().is_ready());
        assert_eq!(dev.queue(1).unwrap().size(), 0);
    }

    #[test]
    fn queue_size_reads_back_through_selector() {
        let (mut dev, _) = counting_device(2);
        let mem = guest_mem();

        dev.write(&mem, REG_QUEUE_SEL, &1u32.to_le_bytes());
        dev.write(&mem, REG_QUEUE_NUM, &64u32.to_le_bytes());
        assert_eq!(read_reg(&mut dev, &mem, REG_QUEUE_SEL), 64);

        // Sizes clamp to the offered maximum.
        dev.write(&mem, REG_QUEUE_NUM, &1024u32.to_le_bytes());
        assert_eq!(read_reg(&mut dev, &mem, REG_QUEUE_SEL), MAX_QUEUE_SIZE as u32);
    }

    #[test]
    fn chain_walk_respects_roles_and_bounds() {
        let (mut dev, _) = counting_device(1);
        let mem = guest_mem();
        driver_ok(&mut dev, &mem);
        let ring = GuestRing::new(0x4000, 4);
        ring.install(&mut dev, &mem, 0);

        ring.write_desc(&mem, 0, VirtqDesc {
            addr: 0x8000,
            len: 16,
            flags: VIRTQ_DESC_F_NEXT,
            next: 1,
        });
        ring.write_desc(&mem, 1, VirtqDesc {
            addr: 0x9000,
            len: 512,
            flags: VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
            next: 2,
        });
        ring.write_desc(&mem, 2, VirtqDesc {
            addr: 0xa000,
            len: 1,
            flags: VIRTQ_DESC_F_WRITE,
            next: 0,
        });

        let queue = dev.queue(0).unwrap().clone();
        let chain = walk_chain(&queue, &mem, 0).unwrap();
        assert_eq!(chain.len(), 3);
        assert!(!chain[0].device_writes);
        assert!(chain[1].device_writes && chain[1].len == 512);
        assert!(chain[2].device_writes && chain[2].len == 1);

        // A self-loop exceeds the queue-size bound and is rejected.
        ring.write_desc(&mem, 3, VirtqDesc {
            addr: 0xb000,
            len: 4,
            flags: VIRTQ_DESC_F_NEXT,
            next: 3,
        });
        assert!(walk_chain(&queue, &mem, 3).is_none());
    }

    #[test]
    fn avail_index_wraps_modulo_2_16() {
        let mut q = VirtQueue::new(0, 8);
        q.set_size(8);
        q.set_ready(true);
        q.last_avail = u16::MAX;
        q.used_idx = u16::MAX;

        let vm = FakeVm::default();
        let mut mem = MemoryMap::new();
        mem.add_region(&vm, 0, 0x10_0000).unwrap();
        q.desc_gpa = 0x4000;
        q.avail_gpa = 0x5000;
        q.used_gpa = 0x6000;

        // Driver publishes entry number 0x10000 (idx wraps to 0).
        mem.write_obj(0u16, 0x5000 + 2).unwrap();
        mem.write_obj(5u16, 0x5000 + 4 + (u16::MAX % 8) as u64 * 2)
            .unwrap();
        assert_eq!(q.pop_avail(&mem), Some(5));
        assert_eq!(q.last_avail(), 0);

        assert!(q.add_used(&mem, 5, 1));
        assert_eq!(q.used_idx(), 0);
        assert_eq!(mem.read_obj::<u16>(0x6000 + 2).unwrap(), 0);
    }
}
