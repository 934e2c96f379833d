extern crate winapi;

use crate::{Flush, Protect};

use std::fs::File;
use std::io::{Error, Result};
use std::mem;
use std::os::windows::io::AsRawHandle;
use std::ptr;

use winapi::shared::basetsd::SIZE_T;
use winapi::shared::minwindef::DWORD;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{
    CreateFileMappingW, FlushViewOfFile, MapViewOfFile, MapViewOfFileEx, UnmapViewOfFile,
    VirtualAlloc, VirtualFree, VirtualProtect, FILE_MAP_READ, FILE_MAP_WRITE,
};
use winapi::um::sysinfoapi::GetSystemInfo;
use winapi::um::winnt::{
    MEM_RELEASE, MEM_RESERVE, PAGE_READONLY, PAGE_READWRITE, PAGE_NOACCESS,
};

pub fn page_size() -> usize {
    unsafe {
        let mut info = mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

fn to_prot(prot: Protect) -> DWORD {
    match prot {
        Protect::ReadOnly => PAGE_READONLY,
        Protect::ReadWrite => PAGE_READWRITE,
    }
}

fn to_access(prot: Protect) -> DWORD {
    match prot {
        Protect::ReadOnly => FILE_MAP_READ,
        Protect::ReadWrite => FILE_MAP_READ | FILE_MAP_WRITE,
    }
}

/// Memory maps a given range of a file.
pub unsafe fn map_file(file: &File, off: usize, len: usize, prot: Protect) -> Result<*mut u8> {
    let map = CreateFileMappingW(
        file.as_raw_handle(),
        ptr::null_mut(),
        to_prot(prot),
        0,
        0,
        ptr::null(),
    );
    if map.is_null() {
        return Err(Error::last_os_error());
    }

    let pg = MapViewOfFile(
        map,
        to_access(prot),
        (off >> 32) as DWORD,
        (off & 0xffff_ffff) as DWORD,
        len as SIZE_T,
    );
    CloseHandle(map);

    if pg.is_null() {
        Err(Error::last_os_error())
    } else {
        Ok(pg as *mut u8)
    }
}

/// Maps an anonymous, non-file-backed region.
pub unsafe fn map_anon(len: usize, prot: Protect) -> Result<*mut u8> {
    let pg = VirtualAlloc(ptr::null_mut(), len as SIZE_T, MEM_RESERVE, to_prot(prot));
    if pg.is_null() {
        Err(Error::last_os_error())
    } else {
        Ok(pg as *mut u8)
    }
}

/// Creates an anonymous circular allocation backed by a pagefile-backed
/// section object mapped twice into adjacent addresses, mirroring the
/// memfd double-mapping used on POSIX.
pub unsafe fn map_ring(len: usize) -> Result<*mut u8> {
    let full = (len as u64) * 2;
    let map = CreateFileMappingW(
        INVALID_HANDLE_VALUE,
        ptr::null_mut(),
        PAGE_READWRITE,
        (full >> 32) as DWORD,
        (full & 0xffff_ffff) as DWORD,
        ptr::null(),
    );
    if map.is_null() {
        return Err(Error::last_os_error());
    }

    // Reserve a contiguous address range large enough for both halves,
    // then release it immediately so the two MapViewOfFileEx calls below
    // can claim adjacent fixed addresses inside it without racing another
    // allocation into the gap.
    let probe = VirtualAlloc(ptr::null_mut(), (len * 2) as SIZE_T, MEM_RESERVE, PAGE_NOACCESS);
    if probe.is_null() {
        let err = Error::last_os_error();
        CloseHandle(map);
        return Err(err);
    }
    VirtualFree(probe, 0, MEM_RELEASE);

    let a = MapViewOfFileEx(
        map,
        FILE_MAP_READ | FILE_MAP_WRITE,
        0,
        0,
        len as SIZE_T,
        probe as *mut _,
    );
    if a.is_null() {
        let err = Error::last_os_error();
        CloseHandle(map);
        return Err(err);
    }

    let b = MapViewOfFileEx(
        map,
        FILE_MAP_READ | FILE_MAP_WRITE,
        0,
        0,
        len as SIZE_T,
        (a as *mut u8).add(len) as *mut _,
    );
    if b.is_null() {
        let err = Error::last_os_error();
        UnmapViewOfFile(a);
        CloseHandle(map);
        return Err(err);
    }

    CloseHandle(map);
    Ok(a as *mut u8)
}

/// Unmaps a page range from a previous mapping.
pub unsafe fn unmap(pg: *mut u8, _len: usize) -> Result<()> {
    if UnmapViewOfFile(pg as *mut _) != 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Unmaps a ring mapping created by `map_ring`.
pub unsafe fn unmap_ring(pg: *mut u8, len: usize) -> Result<()> {
    unmap(pg, len)?;
    unmap(pg.add(len), len)
}

/// Changes the protection for a page range.
pub unsafe fn protect(pg: *mut u8, len: usize, prot: Protect) -> Result<()> {
    let mut old: DWORD = 0;
    if VirtualProtect(pg as *mut _, len as SIZE_T, to_prot(prot), &mut old) != 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Writes modified whole pages back to the mapped view (and, for `Sync`,
/// blocks until the OS has flushed them to the backing file).
pub unsafe fn flush(pg: *mut u8, _len: usize, mode: Flush) -> Result<()> {
    if FlushViewOfFile(pg as *mut _, 0) == 0 {
        return Err(Error::last_os_error());
    }
    if let Flush::Sync = mode {
        // FlushViewOfFile is asynchronous with respect to the backing file;
        // Windows has no equivalent of msync(MS_SYNC) for a single view, so
        // synchronous durability isn't available for anonymous/ring maps.
    }
    Ok(())
}

/// Locking pages into the working set isn't wired up on Windows yet; no
/// `Space::HostPinned` caller currently targets this platform in tests.
pub unsafe fn lock(_pg: *mut u8, _len: usize) -> Result<()> {
    Err(Error::new(
        std::io::ErrorKind::Other,
        "page locking is not implemented on this platform",
    ))
}

pub unsafe fn unlock(_pg: *mut u8, _len: usize) -> Result<()> {
    Ok(())
}

pub fn pin_to_core(_core: usize) -> Result<()> {
    log::warn!("core affinity is not supported on this platform");
    Ok(())
}
