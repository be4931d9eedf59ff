//! Virtio block device class.
//!
//! Requests arrive as descriptor chains: a 16-byte header the device
//! reads, data segments, and a trailing status byte the device writes.
//! I/O goes to a backing file at `sector × 512` via positioned reads and
//! writes, so concurrent queues would not clobber a shared file offset.

use super::{walk_chain, ChainBuffer, VirtQueue, VirtioBackend, VIRTIO_ID_BLOCK};
use crate::memory::MemoryMap;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use vm_memory::ByteValued;

/// Virtio block sector size.
pub const SECTOR_SIZE: u64 = 512;

// Request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

// Status codes.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Feature: device is read-only.
const VIRTIO_BLK_F_RO: u64 = 1 << 5;

/// Request header (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct VirtioBlkReq {
    type_: u32,
    _reserved: u32,
    sector: u64,
}

// Safety: plain #[repr(C)] integers, no padding.
unsafe impl ByteValued for VirtioBlkReq {}

/// The virtio block backend over a host file.
pub struct VirtioBlock {
    file: File,
    num_sectors: u64,
    read_only: bool,
}

impl VirtioBlock {
    /// Open `path` read-write, falling back to read-only.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (file, read_only) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => (f, false),
            Err(_) => {
                let f = File::open(path)?;
                info!("disk image {} opened read-only", path.display());
                (f, true)
            }
        };
        let num_sectors = file.metadata()?.len() / SECTOR_SIZE;
        info!(
            "disk image {}: {} sectors ({} MiB)",
            path.display(),
            num_sectors,
            num_sectors * SECTOR_SIZE / (1024 * 1024)
        );
        Ok(VirtioBlock {
            file,
            num_sectors,
            read_only,
        })
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn read_into(&self, mem: &MemoryMap, sector: u64, buffers: &[ChainBuffer]) -> u8 {
        let mut offset = sector * SECTOR_SIZE;
        for buf in buffers {
            if !buf.device_writes {
                return VIRTIO_BLK_S_IOERR;
            }
            let mut data = vec![0u8; buf.len as usize];
            if self.file.read_exact_at(&mut data, offset).is_err() {
                return VIRTIO_BLK_S_IOERR;
            }
            if mem.write(buf.gpa, &data).is_err() {
                return VIRTIO_BLK_S_IOERR;
            }
            offset += buf.len as u64;
        }
        VIRTIO_BLK_S_OK
    }

    fn write_from(&self, mem: &MemoryMap, sector: u64, buffers: &[ChainBuffer]) -> u8 {
        if self.read_only {
            return VIRTIO_BLK_S_IOERR;
        }
        let mut offset = sector * SECTOR_SIZE;
        for buf in buffers {
            if buf.device_writes {
                return VIRTIO_BLK_S_IOERR;
            }
            let mut data = vec![0u8; buf.len as usize];
            if mem.read(buf.gpa, &mut data).is_err() {
                return VIRTIO_BLK_S_IOERR;
            }
            if self.file.write_all_at(&data, offset).is_err() {
                return VIRTIO_BLK_S_IOERR;
            }
            offset += buf.len as u64;
        }
        VIRTIO_BLK_S_OK
    }

    /// Handle one request chain; returns bytes written for the used ring.
    fn process_request(&mut self, queue: &VirtQueue, mem: &MemoryMap, head: u16) -> u32 {
        let Some(chain) = walk_chain(queue, mem, head) else {
            warn!("block: malformed descriptor chain");
            return 0;
        };
        if chain.len() < 2 {
            warn!("block: request needs header and status descriptors");
            return 0;
        }

        let hdr = &chain[0];
        if hdr.device_writes || (hdr.len as usize) < std::mem::size_of::<VirtioBlkReq>() {
            return 0;
        }
        let Ok(req) = mem.read_obj::<VirtioBlkReq>(hdr.gpa) else {
            return 0;
        };

        let status_buf = &chain[chain.len() - 1];
        if !status_buf.device_writes || status_buf.len < 1 {
            return 0;
        }
        let data = &chain[1..chain.len() - 1];

        let status = match req.type_ {
            VIRTIO_BLK_T_IN => self.read_into(mem, req.sector, data),
            VIRTIO_BLK_T_OUT => self.write_from(mem, req.sector, data),
            VIRTIO_BLK_T_FLUSH => {
                if self.file.sync_all().is_ok() {
                    VIRTIO_BLK_S_OK
                } else {
                    VIRTIO_BLK_S_IOERR
                }
            }
            other => {
                warn!("block: unsupported request type {other}");
                VIRTIO_BLK_S_UNSUPP
            }
        };

        let _ = mem.write(status_buf.gpa, &[status]);
        1
    }
}

impl VirtioBackend for VirtioBlock {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_BLOCK
    }

    fn device_features(&self) -> u64 {
        if self.read_only {
            VIRTIO_BLK_F_RO
        } else {
            0
        }
    }

    fn num_queues(&self) -> usize {
        1
    }

    fn process_queue(&mut self, _queue_idx: usize, queue: &mut VirtQueue, mem: &MemoryMap) -> bool {
        let mut work = false;
        while let Some(head) = queue.pop_avail(mem) {
            let written = self.process_request(queue, mem, head);
            queue.add_used(mem, head, written);
            work = true;
        }
        work
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        // Config space starts with the capacity in 512-byte sectors (u64).
        data.fill(0);
        let capacity = self.num_sectors.to_le_bytes();
        let start = offset as usize;
        if start < capacity.len() {
            let end = (start + data.len()).min(capacity.len());
            data[..end - start].copy_from_slice(&capacity[start..end]);
        }
    }

    fn write_config(&mut self, _offset: u64, _data: &[u8]) {
        // Read-only for virtio-blk.
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_ring::*;
    use super::super::*;
    use super::*;
    use crate::hv::testing::FakeVm;
    use std::io::Write;

    struct TempImage(std::path::PathBuf);

    impl TempImage {
        fn zeroed(name: &str, len: usize) -> Self {
            let path = std::env::temp_dir().join(format!(
                "roost-blk-{name}-{}",
                std::process::id()
            ));
            let mut f = File::create(&path).unwrap();
            f.write_all(&vec![0u8; len]).unwrap();
            TempImage(path)
        }
    }

    impl Drop for TempImage {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn block_device(image: &TempImage) -> (VirtioMmio, MemoryMap) {
        let dev = VirtioMmio::new(Box::new(VirtioBlock::open(&image.0).unwrap()));
        let vm = FakeVm::default();
        let mut mem = MemoryMap::new();
        mem.add_region(&vm, 0, 0x10_0000).unwrap();
        (dev, mem)
    }

    const HDR_GPA: u64 = 0x8000;
    const DATA_GPA: u64 = 0x9000;
    const STATUS_GPA: u64 = 0xa000;

    fn push_request(ring: &mut GuestRing, mem: &MemoryMap, type_: u32, sector: u64, len: u32) {
        let req = VirtioBlkReq {
            type_,
            _reserved: 0,
            sector,
        };
        mem.write_obj(req, HDR_GPA).unwrap();
        ring.write_desc(mem, 0, VirtqDesc {
            addr: HDR_GPA,
            len: 16,
            flags: VIRTQ_DESC_F_NEXT,
            next: 1,
        });
        let data_flags = if type_ == VIRTIO_BLK_T_IN {
            VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
        } else {
            VIRTQ_DESC_F_NEXT
        };
        ring.write_desc(mem, 1, VirtqDesc {
            addr: DATA_GPA,
            len,
            flags: data_flags,
            next: 2,
        });
        ring.write_desc(mem, 2, VirtqDesc {
            addr: STATUS_GPA,
            len: 1,
            flags: VIRTQ_DESC_F_WRITE,
            next: 0,
        });
        ring.publish(mem, 0);
    }

    #[test]
    fn read_request_fills_buffer_from_zeroed_image() {
        let image = TempImage::zeroed("read", 1024 * 1024);
        let (mut dev, mem) = block_device(&image);
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);

        // Dirty the destination so zeros must come from the device.
        mem.write(DATA_GPA, &[0xffu8; 512]).unwrap();
        mem.write(STATUS_GPA, &[0xff]).unwrap();

        push_request(&mut ring, &mem, VIRTIO_BLK_T_IN, 0, 512);
        notify(&mut dev, &mem, 0);

        let mut data = [0xffu8; 512];
        mem.read(DATA_GPA, &mut data).unwrap();
        assert!(data.iter().all(|b| *b == 0));

        let mut status = [0xffu8; 1];
        mem.read(STATUS_GPA, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);

        assert_eq!(ring.used_idx(&mem), 1);
        assert_eq!(ring.used_elem(&mem, 0), (0, 1));
    }

    #[test]
    fn write_request_lands_in_the_image() {
        let image = TempImage::zeroed("write", 1024 * 1024);
        let (mut dev, mem) = block_device(&image);
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);

        let pattern: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        mem.write(DATA_GPA, &pattern).unwrap();
        push_request(&mut ring, &mem, VIRTIO_BLK_T_OUT, 2, 512);
        notify(&mut dev, &mem, 0);

        let mut status = [0xffu8; 1];
        mem.read(STATUS_GPA, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);

        let mut on_disk = vec![0u8; 512];
        let file = File::open(&image.0).unwrap();
        file.read_exact_at(&mut on_disk, 2 * SECTOR_SIZE).unwrap();
        assert_eq!(on_disk, pattern);
    }

    #[test]
    fn unsupported_request_type_reports_unsupp() {
        let image = TempImage::zeroed("unsupp", 64 * 1024);
        let (mut dev, mem) = block_device(&image);
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);

        push_request(&mut ring, &mem, 99, 0, 16);
        notify(&mut dev, &mem, 0);

        let mut status = [0u8; 1];
        mem.read(STATUS_GPA, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn out_of_range_read_reports_ioerr() {
        let image = TempImage::zeroed("range", 4096);
        let (mut dev, mem) = block_device(&image);
        driver_ok(&mut dev, &mem);
        let mut ring = GuestRing::new(0x4000, 8);
        ring.install(&mut dev, &mem, 0);

        // Sector far past the 8-sector image.
        push_request(&mut ring, &mem, VIRTIO_BLK_T_IN, 1000, 512);
        notify(&mut dev, &mem, 0);

        let mut status = [0u8; 1];
        mem.read(STATUS_GPA, &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_IOERR);
    }

    #[test]
    fn capacity_is_reported_in_config_space() {
        let image = TempImage::zeroed("cap", 8 * 1024 * 1024);
        let (mut dev, mem) = block_device(&image);

        let mut buf = [0u8; 8];
        dev.read(&mem, 0x100, &mut buf);
        assert_eq!(u64::from_le_bytes(buf), 8 * 1024 * 1024 / SECTOR_SIZE);
    }
}
