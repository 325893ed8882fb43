//! Platform facts for the cler runtime: cache line size, page size, and a
//! one-time probe for doubly-mapped (virtual-memory alias) buffer support.
//!
//! All three are process-wide, lazily computed, and cached for the
//! process lifetime.

use std::sync::OnceLock;

/// Best-known cache line size for the target architecture, selected at
/// compile time. 64 bytes for x86/x86_64, ARM64, and RISC-V; 32 bytes for
/// ARM Cortex-M and generic 32-bit ARM; 64 bytes as the safe default for
/// anything else.
#[cfg(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv32",
    target_arch = "riscv64"
))]
pub const CACHE_LINE_SIZE: usize = 64;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub const CACHE_LINE_SIZE: usize = 32;

#[cfg(all(target_arch = "arm", not(target_os = "none")))]
pub const CACHE_LINE_SIZE: usize = 64;

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv32",
    target_arch = "riscv64",
    target_arch = "arm"
)))]
pub const CACHE_LINE_SIZE: usize = 64;

const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
static DBF_SUPPORT: OnceLock<bool> = OnceLock::new();

/// Process-wide page size, queried once from the OS and cached thereafter.
/// Falls back to 4096 if the OS query fails or isn't available.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    use windows::Win32::System::SystemInformation::GetSystemInfo;
    // SAFETY: GetSystemInfo fills a plain-old-data struct we own.
    let mut info = Default::default();
    unsafe {
        GetSystemInfo(&mut info);
    }
    if info.dwPageSize > 0 {
        info.dwPageSize as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(not(any(unix, windows)))]
fn query_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Runs a one-time probe that actually creates a small doubly-mapped
/// region, writes a sentinel through one alias, and reads it back through
/// the other. Returns true only if the sentinel round-trips. The result is
/// cached for the process lifetime.
pub fn supports_doubly_mapped_buffers() -> bool {
    *DBF_SUPPORT.get_or_init(|| {
        let supported = probe_doubly_mapped();
        tracing::debug!(target: "platform", supported, "doubly-mapped buffer probe");
        supported
    })
}

#[cfg(unix)]
fn probe_doubly_mapped() -> bool {
    cler_vmem_probe::probe(page_size())
}

#[cfg(windows)]
fn probe_doubly_mapped() -> bool {
    windows_probe::probe(page_size())
}

#[cfg(not(any(unix, windows)))]
fn probe_doubly_mapped() -> bool {
    false
}

/// The POSIX probe lives in its own tiny module so it can be unit tested
/// independently of the `OnceLock` caching above.
#[cfg(unix)]
mod cler_vmem_probe {
    use std::ffi::CString;

    pub(crate) fn probe(page_size: usize) -> bool {
        let fd = open_anonymous_shared_memory();
        let Some(fd) = fd else { return false };
        let ok = unsafe { probe_with_fd(fd, page_size) };
        unsafe {
            libc::close(fd);
        }
        ok
    }

    fn open_anonymous_shared_memory() -> Option<i32> {
        #[cfg(target_os = "linux")]
        {
            // memfd_create is available on Linux 3.17+; the libc wrapper
            // returns -1/ENOSYS on kernels without it, so we fall back.
            let name = CString::new("cler_dbuf_probe").unwrap();
            let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
            if fd != -1 {
                return Some(fd);
            }
        }
        for attempt in 0..8 {
            let name = CString::new(format!(
                "/cler_dbuf_probe_{}_{}",
                std::process::id(),
                attempt
            ))
            .unwrap();
            let fd = unsafe {
                libc::shm_open(
                    name.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                    0o600,
                )
            };
            if fd != -1 {
                unsafe {
                    libc::shm_unlink(name.as_ptr());
                }
                return Some(fd);
            }
        }
        None
    }

    unsafe fn probe_with_fd(fd: i32, page_size: usize) -> bool {
        if unsafe { libc::ftruncate(fd, page_size as libc::off_t) } != 0 {
            return false;
        }
        let total = page_size * 2;
        let reservation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            return false;
        }
        let first = unsafe {
            libc::mmap(
                reservation,
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if first == libc::MAP_FAILED {
            unsafe { libc::munmap(reservation, total) };
            return false;
        }
        let second = unsafe {
            libc::mmap(
                (reservation as usize + page_size) as *mut libc::c_void,
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if second == libc::MAP_FAILED {
            unsafe { libc::munmap(reservation, total) };
            return false;
        }
        let sentinel: i32 = 0x1234_5678;
        unsafe {
            std::ptr::write_volatile(first as *mut i32, sentinel);
        }
        let round_tripped = unsafe { std::ptr::read_volatile(second as *const i32) } == sentinel;
        unsafe {
            libc::munmap(reservation, total);
        }
        round_tripped
    }
}

/// The Windows probe mirrors the POSIX one: reserve address space, release
/// it, then map the same file-mapping object twice into the freed range.
/// This is inherently racy (another thread could claim the freed range
/// before the second `MapViewOfFileEx` call); a failed second mapping is
/// treated as "unsupported" rather than retried, matching the
/// `DoublyMappedAllocation` fallback behavior in `cler-vmem`.
#[cfg(windows)]
mod windows_probe {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFileEx, UnmapViewOfFile, VirtualAlloc, VirtualFree,
        FILE_MAP_ALL_ACCESS, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };

    pub(crate) fn probe(page_size: usize) -> bool {
        unsafe { probe_inner(page_size) }.unwrap_or(false)
    }

    unsafe fn probe_inner(page_size: usize) -> Option<bool> {
        let mapping = unsafe {
            CreateFileMappingW(
                windows::Win32::Foundation::INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                page_size as u32,
                None,
            )
        }
        .ok()?;

        let result = unsafe { probe_with_mapping(mapping, page_size) };

        unsafe {
            let _ = CloseHandle(mapping);
        }
        result
    }

    unsafe fn probe_with_mapping(mapping: HANDLE, page_size: usize) -> Option<bool> {
        let total = page_size * 2;
        let reservation = unsafe { VirtualAlloc(None, total, MEM_RESERVE, PAGE_READWRITE) };
        if reservation.is_null() {
            return None;
        }
        unsafe {
            VirtualFree(reservation, 0, MEM_RELEASE).ok()?;
        }

        let first = unsafe {
            MapViewOfFileEx(
                mapping,
                FILE_MAP_ALL_ACCESS,
                0,
                0,
                page_size,
                Some(reservation),
            )
        };
        if first.Value.is_null() {
            return Some(false);
        }

        let second_addr = (reservation as usize + page_size) as *mut core::ffi::c_void;
        let second = unsafe {
            MapViewOfFileEx(
                mapping,
                FILE_MAP_ALL_ACCESS,
                0,
                0,
                page_size,
                Some(second_addr),
            )
        };
        if second.Value.is_null() {
            unsafe {
                let _ = UnmapViewOfFile(first);
            }
            return Some(false);
        }

        let sentinel: i32 = 0x1234_5678;
        unsafe {
            std::ptr::write_volatile(first.Value as *mut i32, sentinel);
        }
        let round_tripped =
            unsafe { std::ptr::read_volatile(second.Value as *const i32) } == sentinel;

        unsafe {
            let _ = UnmapViewOfFile(first);
            let _ = UnmapViewOfFile(second);
        }
        Some(round_tripped)
    }
}

/// Spins the CPU for `iterations` pause/yield cycles. Used by blocking
/// channel operations and scheduler tight-retry loops.
#[inline]
pub fn spin_wait(iterations: usize) {
    for _ in 0..iterations {
        std::hint::spin_loop();
    }
}
