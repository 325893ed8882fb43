//! Doubly-mapped (aka "magic ring buffer") virtual memory regions.
//!
//! A [`DoublyMappedAllocation`] maps one physical region twice into
//! contiguous virtual address space, so any window up to the region's
//! capacity is readable as one contiguous span with no wraparound copy.
//! `cler-channel` builds the SPSC ring on top of this when the platform
//! supports it, and falls back to a padded standard buffer otherwise.

use std::fmt;

/// Errors returned while constructing a [`DoublyMappedAllocation`].
#[derive(Debug, thiserror::Error)]
pub enum VmemError {
    #[error("requested size must be non-zero")]
    ZeroSize,
    #[error("failed to create anonymous shared memory backing")]
    BackingFailed,
    #[error("failed to reserve address space for the double mapping")]
    ReservationFailed,
    #[error("failed to map the backing object into reserved address space")]
    MappingFailed,
    #[error("double mapping did not alias correctly (sentinel mismatch)")]
    VerificationFailed,
}

/// A region of memory mapped twice back to back, so reads/writes that
/// cross the physical end of the buffer land transparently in the start
/// of the next logical copy.
///
/// Non-copyable. Movable: ordinary Rust move semantics already give the
/// "other instance is left inert" behavior the original C++ move
/// constructor implements by hand, since `Drop::drop` only runs once, on
/// the value that ends up owning the mapping.
pub struct DoublyMappedAllocation {
    base: *mut u8,
    alias_size: usize,
    platform: PlatformHandle,
}

// SAFETY: the mapping is backed by shared memory with no thread affinity;
// the caller is responsible for synchronizing access to the data itself,
// exactly as with any other shared buffer (cler-channel does this).
unsafe impl Send for DoublyMappedAllocation {}
unsafe impl Sync for DoublyMappedAllocation {}

impl fmt::Debug for DoublyMappedAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoublyMappedAllocation")
            .field("base", &self.base)
            .field("alias_size", &self.alias_size)
            .finish()
    }
}

impl DoublyMappedAllocation {
    /// Creates a doubly-mapped region of at least `size` bytes, rounded
    /// up to a page (and, where available, huge-page) boundary.
    pub fn create(size: usize) -> Result<Self, VmemError> {
        if size == 0 {
            return Err(VmemError::ZeroSize);
        }
        platform::create(size)
    }

    /// Pointer to the first alias of the mapping.
    pub fn data(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to the second alias, immediately following the first in
    /// virtual address space.
    pub fn second_mapping(&self) -> *mut u8 {
        // SAFETY: base + alias_size stays within the reserved 2*alias_size range.
        unsafe { self.base.add(self.alias_size) }
    }

    /// Size in bytes of a single alias (i.e. the logical buffer capacity,
    /// rounded up to the allocation granularity).
    pub fn size(&self) -> usize {
        self.alias_size
    }
}

impl Drop for DoublyMappedAllocation {
    fn drop(&mut self) {
        platform::destroy(self);
    }
}

#[cfg(unix)]
type PlatformHandle = i32; // shared-memory fd

#[cfg(windows)]
type PlatformHandle = windows::Win32::Foundation::HANDLE;

#[cfg(not(any(unix, windows)))]
type PlatformHandle = ();

fn aligned_size(requested: usize, granularity: usize) -> usize {
    requested.div_ceil(granularity) * granularity
}

#[cfg(unix)]
mod platform {
    use super::{aligned_size, DoublyMappedAllocation, VmemError};
    use cler_platform::page_size;
    use std::ffi::CString;

    pub(crate) fn create(size: usize) -> Result<DoublyMappedAllocation, VmemError> {
        let page = page_size();
        let huge_page = huge_page_size();
        let use_huge_pages = huge_page > 0 && aligned_size(size, page) >= huge_page;

        let fd = create_shared_memory().ok_or(VmemError::BackingFailed)?;

        let first_attempt = try_create(fd, size, if use_huge_pages { huge_page } else { page }, use_huge_pages);
        let result = match first_attempt {
            Ok(alloc) => Ok(alloc),
            Err(_) if use_huge_pages => try_create(fd, size, page, false),
            Err(e) => Err(e),
        };
        if result.is_err() {
            unsafe { libc::close(fd) };
        }
        result
    }

    fn try_create(
        fd: i32,
        size: usize,
        align_to: usize,
        use_huge_pages: bool,
    ) -> Result<DoublyMappedAllocation, VmemError> {
        let aligned = aligned_size(size, align_to);
        if unsafe { libc::ftruncate(fd, aligned as libc::off_t) } != 0 {
            return Err(VmemError::BackingFailed);
        }
        let (base, actual_size) = map_twice(fd, aligned, use_huge_pages)?;
        Ok(DoublyMappedAllocation {
            base,
            alias_size: actual_size,
            platform: fd,
        })
    }

    fn map_twice(fd: i32, aligned: usize, use_huge_pages: bool) -> Result<(*mut u8, usize), VmemError> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(target_os = "linux")]
        if use_huge_pages {
            flags |= libc::MAP_HUGETLB;
        }
        let _ = use_huge_pages;

        let reservation = unsafe {
            libc::mmap(std::ptr::null_mut(), aligned * 2, libc::PROT_NONE, flags, -1, 0)
        };
        if reservation == libc::MAP_FAILED {
            return Err(VmemError::ReservationFailed);
        }

        let first = unsafe {
            libc::mmap(
                reservation,
                aligned,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if first == libc::MAP_FAILED {
            unsafe { libc::munmap(reservation, aligned * 2) };
            return Err(VmemError::MappingFailed);
        }

        let second = unsafe {
            libc::mmap(
                (reservation as usize + aligned) as *mut libc::c_void,
                aligned,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if second == libc::MAP_FAILED {
            unsafe { libc::munmap(reservation, aligned * 2) };
            return Err(VmemError::MappingFailed);
        }

        if !verify_alias(first as *mut u8, second as *mut u8) {
            unsafe { libc::munmap(reservation, aligned * 2) };
            return Err(VmemError::VerificationFailed);
        }

        Ok((reservation as *mut u8, aligned))
    }

    fn verify_alias(first: *mut u8, second: *mut u8) -> bool {
        const SENTINEL: u8 = 0x42;
        unsafe {
            std::ptr::write_volatile(first, SENTINEL);
            let matched = std::ptr::read_volatile(second) == SENTINEL;
            std::ptr::write_volatile(first, 0);
            matched
        }
    }

    fn create_shared_memory() -> Option<i32> {
        #[cfg(target_os = "linux")]
        {
            let name = CString::new("cler_buffer").unwrap();
            let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
            if fd != -1 {
                return Some(fd);
            }
        }
        let name = CString::new(format!(
            "/cler_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ))
        .unwrap();
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600) };
        if fd != -1 {
            unsafe { libc::shm_unlink(name.as_ptr()) };
            Some(fd)
        } else {
            None
        }
    }

    #[cfg(target_os = "linux")]
    fn huge_page_size() -> usize {
        if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
            for line in contents.lines() {
                if let Some(rest) = line.strip_prefix("Hugepagesize:") {
                    let kb: usize = rest
                        .trim()
                        .trim_end_matches(" kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kb * 1024;
                }
            }
        }
        0
    }

    #[cfg(not(target_os = "linux"))]
    fn huge_page_size() -> usize {
        0
    }

    pub(crate) fn destroy(allocation: &mut DoublyMappedAllocation) {
        if !allocation.base.is_null() {
            unsafe {
                libc::munmap(allocation.base as *mut libc::c_void, allocation.alias_size * 2);
            }
        }
        if allocation.platform != -1 {
            unsafe {
                libc::close(allocation.platform);
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::{aligned_size, DoublyMappedAllocation, VmemError};
    use cler_platform::page_size;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFileEx, UnmapViewOfFile, VirtualAlloc, VirtualFree,
        FILE_MAP_ALL_ACCESS, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };

    pub(crate) fn create(size: usize) -> Result<DoublyMappedAllocation, VmemError> {
        let page = page_size();
        let aligned = aligned_size(size, page);

        let mapping = unsafe {
            CreateFileMappingW(INVALID_HANDLE_VALUE, None, PAGE_READWRITE, 0, aligned as u32, None)
        }
        .map_err(|_| VmemError::BackingFailed)?;

        match map_twice(mapping, aligned) {
            Ok(base) => Ok(DoublyMappedAllocation {
                base,
                alias_size: aligned,
                platform: mapping,
            }),
            Err(e) => {
                unsafe {
                    let _ = CloseHandle(mapping);
                }
                Err(e)
            }
        }
    }

    // The placeholder-splitting fast path (`VirtualAlloc2` +
    // `MapViewOfFile3`) needs a newer `windows` API surface than is wired
    // up here; this crate uses the reserve-release-remap fallback instead.
    // The race window between `VirtualFree` and the two `MapViewOfFileEx`
    // calls is closed by the sentinel verification below: a losing race
    // simply fails verification and the allocation errors out.
    fn map_twice(mapping: HANDLE, aligned: usize) -> Result<*mut u8, VmemError> {
        let total = aligned * 2;
        let reserved = unsafe { VirtualAlloc(None, total, MEM_RESERVE, PAGE_READWRITE) };
        if reserved.is_null() {
            return Err(VmemError::ReservationFailed);
        }
        unsafe {
            VirtualFree(reserved, 0, MEM_RELEASE).map_err(|_| VmemError::ReservationFailed)?;
        }

        let first = unsafe { MapViewOfFileEx(mapping, FILE_MAP_ALL_ACCESS, 0, 0, aligned, Some(reserved)) };
        if first.Value.is_null() {
            return Err(VmemError::MappingFailed);
        }

        let second_addr = (reserved as usize + aligned) as *mut core::ffi::c_void;
        let second =
            unsafe { MapViewOfFileEx(mapping, FILE_MAP_ALL_ACCESS, 0, 0, aligned, Some(second_addr)) };
        if second.Value.is_null() {
            unsafe {
                let _ = UnmapViewOfFile(first);
            }
            return Err(VmemError::MappingFailed);
        }

        if !verify_alias(first.Value as *mut u8, second.Value as *mut u8) {
            unsafe {
                let _ = UnmapViewOfFile(first);
                let _ = UnmapViewOfFile(second);
            }
            return Err(VmemError::VerificationFailed);
        }

        Ok(first.Value as *mut u8)
    }

    fn verify_alias(first: *mut u8, second: *mut u8) -> bool {
        const SENTINEL: u8 = 0x42;
        unsafe {
            std::ptr::write_volatile(first, SENTINEL);
            let matched = std::ptr::read_volatile(second) == SENTINEL;
            std::ptr::write_volatile(first, 0);
            matched
        }
    }

    pub(crate) fn destroy(allocation: &mut DoublyMappedAllocation) {
        if !allocation.base.is_null() {
            unsafe {
                let first = windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: allocation.base as *mut core::ffi::c_void,
                };
                let second = windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: allocation.second_mapping() as *mut core::ffi::c_void,
                };
                let _ = UnmapViewOfFile(first);
                let _ = UnmapViewOfFile(second);
            }
        }
        if allocation.platform != INVALID_HANDLE_VALUE {
            unsafe {
                let _ = CloseHandle(allocation.platform);
            }
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::{DoublyMappedAllocation, VmemError};

    pub(crate) fn create(_size: usize) -> Result<DoublyMappedAllocation, VmemError> {
        Err(VmemError::ReservationFailed)
    }

    pub(crate) fn destroy(_allocation: &mut DoublyMappedAllocation) {}
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_zero_size() {
        assert!(matches!(DoublyMappedAllocation::create(0), Err(VmemError::ZeroSize)));
    }

    #[test]
    fn aliases_write_through() {
        let alloc = DoublyMappedAllocation::create(page_size()).expect("vmem available in test sandbox");
        unsafe {
            std::ptr::write_volatile(alloc.data(), 0xABu8);
            assert_eq!(std::ptr::read_volatile(alloc.second_mapping()), 0xAB);
        }
    }

    #[test]
    fn second_mapping_wraps_writes_back_to_first() {
        let alloc = DoublyMappedAllocation::create(page_size()).expect("vmem available in test sandbox");
        unsafe {
            std::ptr::write_volatile(alloc.second_mapping(), 0xCDu8);
            assert_eq!(std::ptr::read_volatile(alloc.data()), 0xCD);
        }
    }

    #[test]
    fn size_is_page_aligned() {
        let requested = page_size() / 2 + 1;
        let alloc = DoublyMappedAllocation::create(requested).expect("vmem available in test sandbox");
        assert_eq!(alloc.size() % page_size(), 0);
        assert!(alloc.size() >= requested);
    }
}
