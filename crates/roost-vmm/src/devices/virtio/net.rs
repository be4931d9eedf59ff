//! Virtio network device class (Linux TAP bridge).
//!
//! Queue 0 receives (host → guest), queue 1 transmits (guest → host).
//! Frames cross the TAP file descriptor without the packet-info prefix;
//! the 10-byte virtio-net header is stripped on transmit and a zeroed one
//! is prepended on receive. The TAP fd is non-blocking and the receive
//! queue is drained opportunistically whenever the guest notifies, which
//! keeps the transport single-writer per queue.

use super::{walk_chain, VirtQueue, VirtioBackend, VIRTIO_ID_NET};
use crate::memory::MemoryMap;
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

/// Legacy virtio-net header length (no mergeable receive buffers).
pub const VIRTIO_NET_HDR_LEN: usize = 10;

/// Feature: the device reports a MAC address in config space.
const VIRTIO_NET_F_MAC: u64 = 1 << 5;

/// Largest frame we move in one step (Ethernet + headroom).
const FRAME_BUF_SIZE: usize = 65536;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Open and configure a TAP interface.
fn open_tap(ifname: &str) -> io::Result<File> {
    if ifname.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name '{ifname}' too long"),
        ));
    }
    let tap = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    // Safety: ifreq is plain-old-data; the name is NUL-padded by zeroing.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.bytes()) {
        *dst = src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

    // Safety: TUNSETIFF reads the ifreq we just initialised.
    if unsafe { libc::ioctl(tap.as_raw_fd(), TUNSETIFF, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: plain fcntl on a fd we own.
    unsafe {
        let flags = libc::fcntl(tap.as_raw_fd(), libc::F_GETFL);
        libc::fcntl(tap.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    info!("opened TAP interface {ifname}");
    Ok(tap)
}

/// The virtio network backend.
pub struct VirtioNet {
    tap: File,
    mac: [u8; 6],
}

impl VirtioNet {
    /// Attach to the TAP interface `ifname`.
    pub fn open(ifname: &str) -> io::Result<Self> {
        Ok(VirtioNet {
            tap: open_tap(ifname)?,
            // Locally administered address, QEMU-style prefix.
            mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
        })
    }

    /// Drain guest transmit chains into the TAP.
    fn process_tx(&mut self, queue: &mut VirtQueue, mem: &MemoryMap) -> bool {
        let mut work = false;
        while let Some(head) = queue.pop_avail(mem) {
            if let Some(chain) = walk_chain(queue, mem, head) {
                let mut frame = Vec::new();
                for buf in chain.iter().filter(|b| !b.device_writes) {
                    let start = frame.len();
                    frame.resize(start + buf.len as usize, 0);
                    if mem.read(buf.gpa, &mut frame[start..]).is_err() {
                        warn!("net: unreadable TX buffer at GPA {:#x}", buf.gpa);
                        frame.truncate(start);
                    }
                }
                if frame.len() > VIRTIO_NET_HDR_LEN {
                    if let Err(e) = self.tap.write_all(&frame[VIRTIO_NET_HDR_LEN..]) {
                        debug!("net: TX frame dropped: {e}");
                    }
                }
            }
            queue.add_used(mem, head, 0);
            work = true;
        }
        work
    }

    /// Move pending TAP frames into guest receive buffers.
    fn process_rx(&mut self, queue: &mut VirtQueue, mem: &MemoryMap) -> bool {
        let mut work = false;
        let mut frame = [0u8; FRAME_BUF_SIZE];
        loop {
            let len = match self.tap.read(&mut frame) {
                Ok(0) => break,
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("net: TAP read failed: {e}");
                    break;
                }
            };
            let Some(head) = queue.pop_avail(mem) else {
                debug!("net: no guest RX buffer, {len}-byte frame dropped");
                break;
            };
            let Some(chain) = walk_chain(queue, mem, head) else {
                queue.add_used(mem, head, 0);
                continue;
            };

            // Header first, then the frame, across the writable buffers.
            let mut payload = vec![0u8; VIRTIO_NET_HDR_LEN + len];
            payload[VIRTIO_NET_HDR_LEN..].copy_from_slice(&frame[..len]);
            let mut written = 0usize;
            for buf in chain.iter().filter(|b| b.device_writes) {
                if written >= payload.len() {
                    break;
                }
                let chunk = (buf.len as usize).min(payload.len() - written);
                if mem.write(buf.gpa, &payload[written..written + chunk]).is_err() {
                    break;
                }
                written += chunk;
            }
            queue.add_used(mem, head, written as u32);
            work = true;
        }
        work
    }
}

impl VirtioBackend for VirtioNet {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_NET
    }

    fn device_features(&self) -> u64 {
        VIRTIO_NET_F_MAC
    }

    fn num_queues(&self) -> usize {
        2 // receive, transmit
    }

    fn process_queue(&mut self, queue_idx: usize, queue: &mut VirtQueue, mem: &MemoryMap) -> bool {
        match queue_idx {
            0 => self.process_rx(queue, mem),
            1 => self.process_tx(queue, mem),
            other => {
                warn!("net: notify for unexpected queue {other}");
                false
            }
        }
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        // Config space: mac[6], status u16, max_virtqueue_pairs u16.
        data.fill(0);
        let mut cfg = [0u8; 10];
        cfg[0..6].copy_from_slice(&self.mac);
        cfg[6..8].copy_from_slice(&1u16.to_le_bytes()); // link up
        cfg[8..10].copy_from_slice(&1u16.to_le_bytes());
        let start = offset as usize;
        if start < cfg.len() {
            let end = (start + data.len()).min(cfg.len());
            data[..end - start].copy_from_slice(&cfg[start..end]);
        }
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        // The driver may program the MAC.
        let start = offset as usize;
        if start < 6 {
            let end = (start + data.len()).min(6);
            self.mac[start..end].copy_from_slice(&data[..end - start]);
        }
    }
}
