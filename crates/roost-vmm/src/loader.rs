//! Guest image loading.
//!
//! The loader's contract is deliberately thin: place image bytes at a
//! guest physical address and report the entry PC. Kernel images go
//! through `linux-loader` (ELF on x86_64, PE/Image on aarch64) into the
//! RAM region at [`HIMEM_START`]; raw binaries land wherever the caller
//! says. The optional initrd is placed page-aligned after the kernel and
//! the command line is written NUL-terminated at [`CMDLINE_GPA`].

use crate::memory::{MemoryError, MemoryMap, PAGE_SIZE};
use log::info;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[cfg(target_arch = "aarch64")]
use linux_loader::loader::pe::PE;
#[cfg(target_arch = "x86_64")]
use linux_loader::loader::elf::Elf;
use linux_loader::loader::KernelLoader;
use vm_memory::{Address, GuestAddress};

/// Where kernel images are loaded (1 MiB).
pub const HIMEM_START: u64 = 0x10_0000;

/// Where the kernel command line is written.
pub const CMDLINE_GPA: u64 = 0x2_0000;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to read image '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel image rejected: {0}")]
    Kernel(#[source] linux_loader::loader::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Result of placing one image.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Initial program counter.
    pub entry: u64,
    /// First guest physical address past the image.
    pub end: u64,
}

fn read_file(path: &Path) -> Result<Vec<u8>, LoaderError> {
    fs::read(path).map_err(|source| LoaderError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Place a raw binary at `entry` and use that address as the PC.
pub fn load_raw(mem: &MemoryMap, path: &Path, entry: u64) -> Result<LoadedImage, LoaderError> {
    let data = read_file(path)?;
    mem.write(entry, &data)?;
    info!(
        "loaded raw binary {} at {:#x} ({} bytes)",
        path.display(),
        entry,
        data.len()
    );
    Ok(LoadedImage {
        entry,
        end: entry + data.len() as u64,
    })
}

/// Load a kernel image into RAM and report its entry point.
pub fn load_kernel(mem: &MemoryMap, path: &Path) -> Result<LoadedImage, LoaderError> {
    let ram = mem
        .region_at(HIMEM_START)
        .ok_or(MemoryError::OutOfBounds {
            gpa: HIMEM_START,
            size: 1,
        })?;
    let mut file = fs::File::open(path).map_err(|source| LoaderError::Io {
        path: path.display().to_string(),
        source,
    })?;

    #[cfg(target_arch = "x86_64")]
    let result = Elf::load(ram, None, &mut file, Some(GuestAddress(HIMEM_START)))
        .map_err(LoaderError::Kernel)?;
    #[cfg(target_arch = "aarch64")]
    let result = PE::load(ram, None, &mut file, Some(GuestAddress(HIMEM_START)))
        .map_err(LoaderError::Kernel)?;

    let entry = result.kernel_load.raw_value();
    info!(
        "loaded kernel {}: entry {:#x}, end {:#x}",
        path.display(),
        entry,
        result.kernel_end
    );
    Ok(LoadedImage {
        entry,
        end: result.kernel_end,
    })
}

/// Place the initrd page-aligned after the kernel.
pub fn load_initrd(mem: &MemoryMap, path: &Path, kernel_end: u64) -> Result<LoadedImage, LoaderError> {
    let data = read_file(path)?;
    let addr = (kernel_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    mem.write(addr, &data)?;
    info!(
        "loaded initrd {} at {:#x} ({} bytes)",
        path.display(),
        addr,
        data.len()
    );
    Ok(LoadedImage {
        entry: addr,
        end: addr + data.len() as u64,
    })
}

/// Write the NUL-terminated kernel command line; returns its GPA.
pub fn write_cmdline(mem: &MemoryMap, cmdline: &str) -> Result<u64, LoaderError> {
    let mut bytes = cmdline.as_bytes().to_vec();
    bytes.push(0);
    mem.write(CMDLINE_GPA, &bytes)?;
    Ok(CMDLINE_GPA)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::testing::FakeVm;
    use std::io::Write;

    struct TempFile(std::path::PathBuf);

    impl TempFile {
        fn with_bytes(name: &str, data: &[u8]) -> Self {
            let path = std::env::temp_dir().join(format!(
                "roost-loader-{name}-{}",
                std::process::id()
            ));
            let mut f = fs::File::create(&path).unwrap();
            f.write_all(data).unwrap();
            TempFile(path)
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    fn ram() -> MemoryMap {
        let vm = FakeVm::default();
        let mut mem = MemoryMap::new();
        mem.add_region(&vm, 0, 2 * 1024 * 1024).unwrap();
        mem
    }

    #[test]
    fn raw_binary_lands_at_its_entry() {
        let mem = ram();
        let image = TempFile::with_bytes("raw", &[0xde, 0xad, 0xbe, 0xef]);

        let loaded = load_raw(&mem, &image.0, 0x1_0000).unwrap();
        assert_eq!(loaded.entry, 0x1_0000);
        assert_eq!(loaded.end, 0x1_0004);

        let mut buf = [0u8; 4];
        mem.read(0x1_0000, &mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn raw_binary_outside_ram_fails() {
        let mem = ram();
        let image = TempFile::with_bytes("oob", &[0u8; 16]);
        assert!(matches!(
            load_raw(&mem, &image.0, 0x4000_0000),
            Err(LoaderError::Memory(MemoryError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn missing_image_is_an_io_error() {
        let mem = ram();
        let path = std::env::temp_dir().join("roost-loader-definitely-missing");
        assert!(matches!(
            load_raw(&mem, &path, 0x1000),
            Err(LoaderError::Io { .. })
        ));
    }

    #[test]
    fn initrd_is_page_aligned_after_kernel() {
        let mem = ram();
        let image = TempFile::with_bytes("initrd", b"ramdisk!");

        let loaded = load_initrd(&mem, &image.0, 0x10_0123).unwrap();
        assert_eq!(loaded.entry, 0x10_1000);

        let mut buf = [0u8; 8];
        mem.read(0x10_1000, &mut buf).unwrap();
        assert_eq!(&buf, b"ramdisk!");
    }

    #[test]
    fn cmdline_is_nul_terminated() {
        let mem = ram();
        let gpa = write_cmdline(&mem, "console=hvc0 panic=1").unwrap();
        assert_eq!(gpa, CMDLINE_GPA);

        let mut buf = [0u8; 21];
        mem.read(CMDLINE_GPA, &mut buf).unwrap();
        assert_eq!(&buf[..20], b"console=hvc0 panic=1");
        assert_eq!(buf[20], 0);
    }

    #[test]
    fn kernel_load_requires_ram_at_himem() {
        let mem = MemoryMap::new();
        let image = TempFile::with_bytes("noram", &[0u8; 64]);
        assert!(matches!(
            load_kernel(&mem, &image.0),
            Err(LoaderError::Memory(MemoryError::OutOfBounds { .. }))
        ));
    }
}
