//! Memory-space-aware allocation, copy, and fill primitives.
//!
//! A [`Ring`](crate::ring::Ring) or capture buffer can live in host memory,
//! host memory pinned for fast device transfer, or on a CUDA device (plain
//! or unified/managed). [`Allocator`] is the single dispatch point that
//! switches on [`Space`] the way [`crate::os::unix`] switches on
//! `cfg(target_os)` — one function, one match, no space-specific call sites
//! scattered through the ring and capture code.

use std::collections::HashMap;
use std::ptr;
use std::sync::{Mutex, Once};

use crate::error::{Error, Operation};
use crate::os::{map_anon, unmap};
use crate::{Alloc, Protect, Result};

#[cfg(feature = "cuda")]
mod cuda;

/// Where a buffer's bytes physically live.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Space {
    /// Ordinary process (CPU) memory.
    Host,
    /// Host memory locked into physical RAM (`mlock`), suitable as the
    /// source/destination of an asynchronous device transfer.
    HostPinned,
    /// Memory resident on CUDA device `ordinal`, not host-accessible.
    Device(u32),
    /// CUDA unified ("managed") memory on device `ordinal`, accessible from
    /// both host and device.
    DeviceManaged(u32),
}

impl Space {
    fn is_host(self) -> bool {
        matches!(self, Space::Host | Space::HostPinned)
    }
}

/// An allocation handle returned by [`Allocator::allocate`].
///
/// For `Host`/`HostPinned` spaces, `ptr` is a real, dereferenceable address.
/// For `Device`/`DeviceManaged` spaces it is an opaque handle token (not a
/// pointer a caller may dereference) used to look the allocation back up in
/// the `cuda` feature's device-buffer table; see [`cuda`].
pub struct RawBuf {
    ptr: *mut u8,
    len: usize,
    space: Space,
}

// SAFETY: a `RawBuf` is a unique owning handle to either a host mapping or
// a registry-tracked device allocation; neither aliases the pointer, so
// moving ownership across threads is sound even though it wraps a raw
// pointer.
unsafe impl Send for RawBuf {}
// SAFETY: the only mutation any `&RawBuf` method performs goes through the
// registry's internal `Mutex`/`cuda`'s own handle table, never through the
// raw field directly, so sharing a `&RawBuf` across threads is sound.
unsafe impl Sync for RawBuf {}

impl RawBuf {
    /// The space this allocation lives in.
    pub fn space(&self) -> Space {
        self.space
    }

    /// The size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the host-accessible pointer for a `Host`/`HostPinned`
    /// allocation.
    ///
    /// Returns `None` for `Device`/`DeviceManaged` allocations, which are
    /// not host-dereferenceable.
    pub fn as_host_ptr(&self) -> Option<*mut u8> {
        if self.space.is_host() {
            Some(self.ptr)
        } else {
            None
        }
    }

    fn handle(&self) -> usize {
        self.ptr as usize
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        match self.space {
            Space::Host | Space::HostPinned => {
                untrack(self.ptr as usize);
                if self.space == Space::HostPinned {
                    let _ = unsafe { crate::os::unlock(self.ptr, self.len) };
                }
                unsafe { unmap(self.ptr, self.len) }.unwrap_or_default();
            }
            #[cfg(feature = "cuda")]
            Space::Device(_) | Space::DeviceManaged(_) => cuda::free(self.handle()),
            #[cfg(not(feature = "cuda"))]
            Space::Device(_) | Space::DeviceManaged(_) => {}
        }
    }
}

static INIT: Once = Once::new();
static mut REGISTRY: Option<Mutex<HashMap<usize, (usize, Space)>>> = None;

fn registry() -> &'static Mutex<HashMap<usize, (usize, Space)>> {
    INIT.call_once(|| unsafe {
        REGISTRY = Some(Mutex::new(HashMap::new()));
    });
    unsafe { REGISTRY.as_ref().unwrap() }
}

fn track(ptr: *mut u8, len: usize, space: Space) {
    registry().lock().unwrap().insert(ptr as usize, (len, space));
}

fn untrack(ptr: usize) {
    registry().lock().unwrap().remove(&ptr);
}

/// The memory-space dispatch table: allocate, free, copy, and fill buffers
/// without the caller needing to know which space they're in.
///
/// Zero-sized; methods take `Space`/`RawBuf` arguments directly, mirroring
/// the way [`crate::Alloc`] is a stateless page-math helper rather than a
/// live handle.
#[derive(Copy, Clone, Default)]
pub struct Allocator;

impl Allocator {
    pub fn new() -> Self {
        Allocator
    }

    /// Allocates `size` bytes in `space`.
    ///
    /// Host allocations are rounded up to a whole page, matching the
    /// granularity of the ring's virtual mirror mapping. Device allocations
    /// require the `cuda` feature; without it this returns
    /// [`Error::unsupported`].
    pub fn allocate(&self, space: Space, size: usize) -> Result<RawBuf> {
        match space {
            Space::Host => {
                let len = Alloc::new().page_round(size.max(1));
                let ptr = unsafe { map_anon(len, Protect::ReadWrite) }
                    .map_err(|e| Error::io(Operation::SpaceAllocate, e))?;
                track(ptr, len, space);
                Ok(RawBuf { ptr, len, space })
            }
            Space::HostPinned => {
                let len = Alloc::new().page_round(size.max(1));
                let ptr = unsafe { map_anon(len, Protect::ReadWrite) }
                    .map_err(|e| Error::io(Operation::SpaceAllocate, e))?;
                if let Err(err) = unsafe { crate::os::lock(ptr, len) } {
                    unsafe { unmap(ptr, len) }.unwrap_or_default();
                    return Err(Error::io(Operation::SpaceAllocate, err));
                }
                track(ptr, len, space);
                Ok(RawBuf { ptr, len, space })
            }
            #[cfg(feature = "cuda")]
            Space::Device(ordinal) => {
                let (handle, len) = cuda::allocate(ordinal, size, false)?;
                Ok(RawBuf { ptr: handle as *mut u8, len, space })
            }
            #[cfg(feature = "cuda")]
            Space::DeviceManaged(ordinal) => {
                let (handle, len) = cuda::allocate(ordinal, size, true)?;
                Ok(RawBuf { ptr: handle as *mut u8, len, space })
            }
            #[cfg(not(feature = "cuda"))]
            Space::Device(_) | Space::DeviceManaged(_) => {
                Err(Error::unsupported(Operation::SpaceAllocate))
            }
        }
    }

    /// Frees a buffer previously returned by [`Allocator::allocate`].
    ///
    /// Equivalent to `drop(buf)`; kept as an explicit method so call sites
    /// read the same way as `allocate`.
    pub fn free(&self, buf: RawBuf) {
        drop(buf)
    }

    /// Copies `n` bytes from `src` into `dst`, dispatching on both spaces.
    ///
    /// Host-to-host copies are a plain `memcpy`. Any path touching
    /// `Device`/`DeviceManaged` requires the `cuda` feature; without it this
    /// returns [`Error::unsupported`].
    pub fn copy(&self, dst: &mut RawBuf, src: &RawBuf, n: usize) -> Result<()> {
        if n > dst.len || n > src.len {
            return Err(Error::invalid_argument(Operation::SpaceCopy));
        }
        match (src.space, dst.space) {
            (a, b) if a.is_host() && b.is_host() => {
                unsafe { ptr::copy_nonoverlapping(src.ptr, dst.ptr, n) };
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (a, b) if a.is_host() && !b.is_host() => {
                let bytes = unsafe { std::slice::from_raw_parts(src.ptr, n) };
                cuda::copy_from_host(dst.handle(), bytes)
            }
            #[cfg(feature = "cuda")]
            (a, b) if !a.is_host() && b.is_host() => {
                let bytes = unsafe { std::slice::from_raw_parts_mut(dst.ptr, n) };
                cuda::copy_to_host(src.handle(), &mut bytes[..n])
            }
            #[cfg(feature = "cuda")]
            (a, b) if !a.is_host() && !b.is_host() => {
                cuda::copy_device_to_device(dst.handle(), src.handle(), n)
            }
            _ => Err(Error::unsupported(Operation::SpaceCopy)),
        }
    }

    /// Copies a `height`-row, `width`-byte-wide rectangle from `src` into
    /// `dst`, each laid out with the given row pitch.
    ///
    /// There is no specialized pitched-copy path for device memory; this
    /// is implemented as `height` row copies through [`Allocator::copy`],
    /// which is correct but not the fastest possible transfer for large
    /// rectangles.
    pub fn copy_2d(
        &self,
        dst: &mut RawBuf,
        dst_pitch: usize,
        src: &RawBuf,
        src_pitch: usize,
        width: usize,
        height: usize,
    ) -> Result<()> {
        if width > dst_pitch || width > src_pitch {
            return Err(Error::invalid_argument(Operation::SpaceCopy));
        }
        for row in 0..height {
            let src_off = row * src_pitch;
            let dst_off = row * dst_pitch;
            if src_off + width > src.len || dst_off + width > dst.len {
                return Err(Error::invalid_argument(Operation::SpaceCopy));
            }
            match (src.space.is_host(), dst.space.is_host()) {
                (true, true) => unsafe {
                    ptr::copy_nonoverlapping(src.ptr.add(src_off), dst.ptr.add(dst_off), width)
                },
                #[cfg(not(feature = "cuda"))]
                _ => return Err(Error::unsupported(Operation::SpaceCopy)),
                #[cfg(feature = "cuda")]
                _ => self.copy_2d_row(dst, dst_off, src, src_off, width)?,
            }
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn copy_2d_row(
        &self,
        dst: &mut RawBuf,
        dst_off: usize,
        src: &RawBuf,
        src_off: usize,
        width: usize,
    ) -> Result<()> {
        match (src.space.is_host(), dst.space.is_host()) {
            (true, false) => {
                let bytes = unsafe { std::slice::from_raw_parts(src.ptr.add(src_off), width) };
                cuda::copy_from_host_at(dst.handle(), dst_off, bytes)
            }
            (false, true) => {
                let bytes =
                    unsafe { std::slice::from_raw_parts_mut(dst.ptr.add(dst_off), width) };
                cuda::copy_to_host_at(src.handle(), src_off, bytes)
            }
            (false, false) => {
                cuda::copy_device_to_device_at(dst.handle(), dst_off, src.handle(), src_off, width)
            }
            (true, true) => unreachable!(),
        }
    }

    /// Fills `n` bytes of `buf` with `value`.
    pub fn memset(&self, buf: &mut RawBuf, value: u8, n: usize) -> Result<()> {
        if n > buf.len {
            return Err(Error::invalid_argument(Operation::SpaceCopy));
        }
        if buf.space.is_host() {
            unsafe { ptr::write_bytes(buf.ptr, value, n) };
            Ok(())
        } else {
            #[cfg(feature = "cuda")]
            {
                cuda::memset(buf.handle(), value, n)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(Error::unsupported(Operation::SpaceCopy))
            }
        }
    }

    /// Writes `src` into `buf` at byte `offset`, dispatching on `buf`'s space.
    pub fn write_at(&self, buf: &mut RawBuf, offset: usize, src: &[u8]) -> Result<()> {
        if offset + src.len() > buf.len {
            return Err(Error::invalid_argument(Operation::SpaceCopy));
        }
        if buf.space.is_host() {
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), buf.ptr.add(offset), src.len()) };
            Ok(())
        } else {
            #[cfg(feature = "cuda")]
            {
                cuda::copy_from_host_at(buf.handle(), offset, src)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(Error::unsupported(Operation::SpaceCopy))
            }
        }
    }

    /// Reads `dst.len()` bytes out of `buf` starting at byte `offset`,
    /// dispatching on `buf`'s space.
    pub fn read_at(&self, buf: &RawBuf, offset: usize, dst: &mut [u8]) -> Result<()> {
        if offset + dst.len() > buf.len {
            return Err(Error::invalid_argument(Operation::SpaceCopy));
        }
        if buf.space.is_host() {
            unsafe { ptr::copy_nonoverlapping(buf.ptr.add(offset), dst.as_mut_ptr(), dst.len()) };
            Ok(())
        } else {
            #[cfg(feature = "cuda")]
            {
                cuda::copy_to_host_at(buf.handle(), offset, dst)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(Error::unsupported(Operation::SpaceCopy))
            }
        }
    }

    /// Best-effort lookup of which space a raw host pointer was allocated
    /// in. Only pointers obtained via [`Allocator::allocate`] with a
    /// `Host`/`HostPinned` space are found; there is no portable way to
    /// classify an arbitrary pointer otherwise.
    pub fn query_space(&self, ptr: *const u8) -> Option<Space> {
        registry().lock().unwrap().get(&(ptr as usize)).map(|(_, space)| *space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_roundtrip() {
        let a = Allocator::new();
        let mut dst = a.allocate(Space::Host, 64).unwrap();
        let mut src = a.allocate(Space::Host, 64).unwrap();
        a.memset(&mut src, 0xab, 64).unwrap();
        a.copy(&mut dst, &src, 64).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(dst.as_host_ptr().unwrap(), 64) };
        assert!(slice.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn query_space_tracks_host_allocations() {
        let a = Allocator::new();
        let buf = a.allocate(Space::Host, 32).unwrap();
        let ptr = buf.as_host_ptr().unwrap();
        assert_eq!(a.query_space(ptr), Some(Space::Host));
        drop(buf);
        assert_eq!(a.query_space(ptr), None);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn device_space_is_unsupported_without_cuda_feature() {
        let a = Allocator::new();
        let err = a.allocate(Space::Device(0), 1024).unwrap_err();
        assert_eq!(err.spec_kind(), Some(crate::error::Kind::Unsupported));
    }
}
