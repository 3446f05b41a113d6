//! Page protection and executable memory.
//!
//! # Key Components
//!
//! - [`Protection`] - Portable read/write/execute flags
//! - [`ProtectionGuard`] - Makes a code range writable and restores the previous protection on drop
//! - [`ExecutableRegion`] - Page(s) allocated close to a target address for relays and trampolines
//! - [`write_code`] - Overwrites live code under a [`ProtectionGuard`]
//!
//! On Linux the protection in effect before a change is read from `/proc/self/maps`. Other unix
//! targets assume code pages are read-execute. Windows reports it from `VirtualProtect`.

use bitflags::bitflags;

use crate::{Error, Result};

bitflags! {
    /// Access rights of a memory page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        /// Readable
        const READ = 0x1;
        /// Writable
        const WRITE = 0x2;
        /// Executable
        const EXECUTE = 0x4;
    }
}

impl Protection {
    /// Protection of ordinary code pages.
    pub const CODE: Protection = Protection::READ.union(Protection::EXECUTE);

    /// Protection used while code is being patched.
    pub const PATCHING: Protection = Protection::READ
        .union(Protection::WRITE)
        .union(Protection::EXECUTE);

    /// Parses the permission column of `/proc/<pid>/maps`, e.g. `r-xp`.
    pub fn from_maps_perms(perms: &str) -> Option<Protection> {
        let perms = perms.as_bytes();
        if perms.len() < 3 {
            return None;
        }

        let mut protection = Protection::empty();
        for (flag, expected, value) in [
            (perms[0], b'r', Protection::READ),
            (perms[1], b'w', Protection::WRITE),
            (perms[2], b'x', Protection::EXECUTE),
        ] {
            if flag == expected {
                protection |= value;
            } else if flag != b'-' {
                return None;
            }
        }
        Some(protection)
    }
}

/// Finds the protection of the mapping containing `address` in a `/proc/<pid>/maps` listing.
pub fn protection_from_maps(maps: &str, address: usize) -> Option<Protection> {
    maps.lines().find_map(|line| {
        let mut columns = line.split_whitespace();
        let range = columns.next()?;
        let perms = columns.next()?;

        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;

        if (start..end).contains(&address) {
            Protection::from_maps_perms(perms)
        } else {
            None
        }
    })
}

/// Yields allocation hints around `target`, nearest first, alternating below and above.
///
/// Every hint is aligned to `granularity` and lies within `max_distance` of `target`.
pub fn near_candidates(
    target: usize,
    granularity: usize,
    max_distance: usize,
) -> impl Iterator<Item = usize> {
    let base = target & !(granularity - 1);
    let steps = max_distance / granularity;

    (1..=steps).flat_map(move |step| {
        let offset = step * granularity;
        let below = base.checked_sub(offset).filter(|hint| *hint != 0);
        let above = base.checked_add(offset);
        below.into_iter().chain(above)
    })
}

/// Rounds `[address, address + len)` out to whole pages.
fn page_span(address: usize, len: usize) -> (usize, usize) {
    let page = platform::page_size();
    let start = address & !(page - 1);
    let end = (address + len + page - 1) & !(page - 1);
    (start, end - start)
}

/// Makes a code range writable for as long as the guard lives.
///
/// Dropping the guard restores the protection that was in effect when it was acquired, on
/// every exit path.
#[derive(Debug)]
pub struct ProtectionGuard {
    start: usize,
    len: usize,
    previous: platform::Saved,
}

impl ProtectionGuard {
    /// Switches the pages covering `[address, address + len)` to read-write-execute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryProtection`] if the operating system rejects the change.
    ///
    /// # Safety
    ///
    /// The range must be mapped in this process.
    pub unsafe fn acquire(address: usize, len: usize) -> Result<Self> {
        let (start, len) = page_span(address, len);
        let previous = platform::protect(start, len, Protection::PATCHING)?;
        Ok(ProtectionGuard {
            start,
            len,
            previous,
        })
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        // SAFETY: the same range was successfully re-protected in acquire
        if let Err(e) = unsafe { platform::restore(self.start, self.len, self.previous) } {
            tracing::error!(
                start = self.start,
                len = self.len,
                "Failed to restore protection: {e}"
            );
        }
    }
}

/// Overwrites live code at `address` with `bytes`.
///
/// # Errors
///
/// Returns [`Error::MemoryProtection`] if the pages cannot be made writable.
///
/// # Safety
///
/// `address` must point to mapped code, and no thread may be executing the overwritten bytes.
pub unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<()> {
    let guard = ProtectionGuard::acquire(address, bytes.len())?;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    platform::flush_instruction_cache(address, bytes.len());
    drop(guard);
    Ok(())
}

/// Copies `len` bytes of code starting at `address`.
///
/// # Safety
///
/// `[address, address + len)` must be mapped and readable.
pub unsafe fn read_code(address: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(address as *const u8, len).to_vec()
}

/// Writable memory allocated near a target, later sealed as read-execute.
///
/// The region is released on drop unless it has been [leaked](ExecutableRegion::leak).
#[derive(Debug)]
pub struct ExecutableRegion {
    base: usize,
    len: usize,
}

impl ExecutableRegion {
    /// Furthest distance from the target that allocation is attempted at.
    pub const MAX_DISTANCE: usize = 1 << 30;

    /// Allocates `len` bytes of read-write memory within [`Self::MAX_DISTANCE`] of `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryProtection`] if no candidate address could be allocated.
    pub fn allocate_near(target: usize, len: usize) -> Result<Self> {
        let (_, len) = page_span(0, len);
        let granularity = platform::allocation_granularity();

        for hint in near_candidates(target, granularity, Self::MAX_DISTANCE) {
            // SAFETY: allocation only, nothing is mapped over existing memory
            if let Some(base) = unsafe { platform::allocate_at(hint, len) } {
                if base.abs_diff(target) <= Self::MAX_DISTANCE {
                    return Ok(ExecutableRegion { base, len });
                }
                // SAFETY: base was just allocated with len
                unsafe { platform::release(base, len) };
            }
        }

        Err(Error::MemoryProtection {
            address: target,
            message: format!(
                "No free region within {:#x} bytes",
                Self::MAX_DISTANCE
            ),
        })
    }

    /// Start of the region.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Copies `bytes` into the region at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Patch`] if the bytes do not fit.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= self.len)
            .ok_or_else(|| {
                patch_error!(
                    "{} bytes at offset {} exceed region of {}",
                    bytes.len(),
                    offset,
                    self.len
                )
            })?;

        // SAFETY: [base + offset, base + end) lies inside the writable allocation
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.base + offset) as *mut u8,
                end - offset,
            );
        }
        Ok(())
    }

    /// Switches the region to read-execute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryProtection`] if the operating system rejects the change.
    pub fn seal(&mut self) -> Result<()> {
        // SAFETY: the region is our own allocation
        unsafe { platform::protect(self.base, self.len, Protection::CODE)? };
        platform::flush_instruction_cache(self.base, self.len);
        Ok(())
    }

    /// Gives up ownership; the memory stays mapped for the rest of the process.
    pub fn leak(self) -> usize {
        let base = self.base;
        std::mem::forget(self);
        base
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // SAFETY: base/len describe our own allocation, which nothing references yet
        unsafe { platform::release(self.base, self.len) };
    }
}

#[cfg(unix)]
mod platform {
    use super::Protection;
    use crate::{Error, Result};

    pub type Saved = Protection;

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => 0x1000,
        }
    }

    pub fn allocation_granularity() -> usize {
        page_size()
    }

    fn native(protection: Protection) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if protection.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if protection.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if protection.contains(Protection::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    #[cfg(target_os = "linux")]
    fn current(start: usize) -> Protection {
        std::fs::read_to_string("/proc/self/maps")
            .ok()
            .and_then(|maps| super::protection_from_maps(&maps, start))
            .unwrap_or(Protection::CODE)
    }

    #[cfg(not(target_os = "linux"))]
    fn current(_start: usize) -> Protection {
        Protection::CODE
    }

    pub unsafe fn protect(start: usize, len: usize, protection: Protection) -> Result<Saved> {
        let previous = current(start);
        if libc::mprotect(start as *mut libc::c_void, len, native(protection)) != 0 {
            return Err(Error::MemoryProtection {
                address: start,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(previous)
    }

    pub unsafe fn restore(start: usize, len: usize, previous: Saved) -> Result<()> {
        protect(start, len, previous).map(|_| ())
    }

    #[cfg(target_os = "linux")]
    const NEAR_FLAGS: libc::c_int =
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;

    #[cfg(not(target_os = "linux"))]
    const NEAR_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    pub unsafe fn allocate_at(hint: usize, len: usize) -> Option<usize> {
        let base = libc::mmap(
            hint as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            NEAR_FLAGS,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            None
        } else {
            Some(base as usize)
        }
    }

    pub unsafe fn release(base: usize, len: usize) {
        libc::munmap(base as *mut libc::c_void, len);
    }

    pub fn flush_instruction_cache(_address: usize, _len: usize) {
        // x86_64 keeps instruction and data caches coherent
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;

    use windows::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache,
        Memory::{
            VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
            PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
        },
        Threading::GetCurrentProcess,
    };

    use super::Protection;
    use crate::{Error, Result};

    pub type Saved = PAGE_PROTECTION_FLAGS;

    pub fn page_size() -> usize {
        0x1000
    }

    pub fn allocation_granularity() -> usize {
        0x10000
    }

    fn native(protection: Protection) -> PAGE_PROTECTION_FLAGS {
        if protection == Protection::PATCHING {
            PAGE_EXECUTE_READWRITE
        } else if protection == Protection::CODE {
            PAGE_EXECUTE_READ
        } else {
            PAGE_READWRITE
        }
    }

    unsafe fn virtual_protect(
        start: usize,
        len: usize,
        flags: PAGE_PROTECTION_FLAGS,
    ) -> Result<Saved> {
        let mut previous = PAGE_PROTECTION_FLAGS(0);
        VirtualProtect(start as *const c_void, len, flags, &mut previous).map_err(|e| {
            Error::MemoryProtection {
                address: start,
                message: format!("VirtualProtect failed: {e}"),
            }
        })?;
        Ok(previous)
    }

    pub unsafe fn protect(start: usize, len: usize, protection: Protection) -> Result<Saved> {
        virtual_protect(start, len, native(protection))
    }

    pub unsafe fn restore(start: usize, len: usize, previous: Saved) -> Result<()> {
        virtual_protect(start, len, previous).map(|_| ())
    }

    pub unsafe fn allocate_at(hint: usize, len: usize) -> Option<usize> {
        let base = VirtualAlloc(
            Some(hint as *const c_void),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        );
        if base.is_null() {
            None
        } else {
            Some(base as usize)
        }
    }

    pub unsafe fn release(base: usize, _len: usize) {
        let _ = VirtualFree(base as *mut c_void, 0, MEM_RELEASE);
    }

    pub fn flush_instruction_cache(address: usize, len: usize) {
        // SAFETY: flushing is valid for any address range of the current process
        unsafe {
            let _ = FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), len);
        }
    }
}
