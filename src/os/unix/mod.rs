extern crate libc;

use crate::{Flush, Protect};

use std::fs::File;
use std::io::{Error, Result};
use std::os::unix::io::AsRawFd;
use std::ptr;

use self::libc::{
    c_void, mlock, mmap, mprotect, msync, munlock, munmap, off_t, sysconf, MAP_ANON, MAP_FAILED,
    MAP_PRIVATE, MAP_SHARED, MS_ASYNC, MS_SYNC, PROT_READ, PROT_WRITE, _SC_PAGESIZE,
};

// For macOS and iOS we use the mach vm system for rings. The posix module
// does work correctly on these targets, but it necessitates an otherwise
// unneeded file descriptor.
#[cfg(any(target_os = "macos", target_os = "ios"))]
mod mach;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use self::mach::{map_ring, unmap_ring};

// For non-mach targets load the POSIX version of the ring mapping functions.
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
mod posix;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub use self::posix::{map_ring, unmap_ring};

pub fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

fn to_prot(prot: Protect) -> libc::c_int {
    match prot {
        Protect::ReadOnly => PROT_READ,
        Protect::ReadWrite => PROT_READ | PROT_WRITE,
    }
}

pub unsafe fn map_file(file: &File, off: usize, len: usize, prot: Protect) -> Result<*mut u8> {
    let pg = mmap(
        ptr::null_mut(),
        len,
        to_prot(prot),
        MAP_SHARED,
        file.as_raw_fd(),
        off as off_t,
    );
    if pg == MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(pg as *mut u8)
    }
}

/// Maps an anonymous, non-file-backed region. Used for plain (non-ring)
/// host and host-pinned allocations made through the [`crate::space`]
/// allocator.
pub unsafe fn map_anon(len: usize, prot: Protect) -> Result<*mut u8> {
    let pg = mmap(ptr::null_mut(), len, to_prot(prot), MAP_PRIVATE | MAP_ANON, -1, 0);
    if pg == MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(pg as *mut u8)
    }
}

pub unsafe fn unmap(pg: *mut u8, len: usize) -> Result<()> {
    if munmap(pg as *mut c_void, len) < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub unsafe fn protect(pg: *mut u8, len: usize, prot: Protect) -> Result<()> {
    if mprotect(pg as *mut c_void, len, to_prot(prot)) != 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub unsafe fn flush(pg: *mut u8, len: usize, mode: Flush) -> Result<()> {
    let flags = match mode {
        Flush::Sync => MS_SYNC,
        Flush::Async => MS_ASYNC,
    };
    if msync(pg as *mut c_void, len, flags) < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Locks the physical pages backing `[pg, pg+len)` into memory. Used to
/// back `Space::HostPinned` allocations.
pub unsafe fn lock(pg: *mut u8, len: usize) -> Result<()> {
    if mlock(pg as *const c_void, len) != 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub unsafe fn unlock(pg: *mut u8, len: usize) -> Result<()> {
    if munlock(pg as *const c_void, len) != 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Pins the calling thread to a single CPU core. A no-op returning `Ok(())`
/// on targets without `sched_setaffinity` (the capture engine logs a
/// warning and continues unpinned rather than failing to start).
#[cfg(target_os = "linux")]
pub fn pin_to_core(core: usize) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_core(_core: usize) -> Result<()> {
    log::warn!("core affinity is not supported on this platform");
    Ok(())
}
