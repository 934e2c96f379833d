//! The ring's backing allocation and its doubled virtual mapping.
//!
//! For `Host`/`HostPinned` rings this is the same trick the teacher's
//! `os::unix::posix::map_ring` uses: one physical allocation, mapped twice
//! at adjacent virtual addresses, so any span of up to `contiguous_span`
//! bytes starting anywhere in `[0, capacity)` reads and writes as a single
//! contiguous slice even when it straddles the physical wraparound.
//!
//! Device and device-managed rings can't get that trick for free (CUDA has
//! no portable double-mapping primitive), so `contiguous_span` is capped at
//! half the capacity there and a wrap-straddling span is instead bounced
//! through a host-side staging buffer.

use crate::error::{Error, Operation};
use crate::ring::span::{ReadBody, ReadSpan, WriteBody, WriteSpan};
use crate::space::{Allocator, RawBuf, Space};
use crate::{Alloc, Result};

struct HostMapping {
    ptr: *mut u8,
    len: usize,
    pinned: bool,
}

// SAFETY: `ptr` addresses a doubled mmap owned exclusively by this mapping;
// all concurrent access to the bytes themselves is serialized by the
// `Ring`'s mutex/condvar protocol one level up, not by this type.
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl Drop for HostMapping {
    fn drop(&mut self) {
        if self.pinned {
            let _ = unsafe { crate::os::unlock(self.ptr, self.len * 2) };
        }
        unsafe { crate::os::unmap_ring(self.ptr, self.len) }.unwrap_or_default();
    }
}

pub struct RingStorage {
    space: Space,
    capacity: usize,
    contiguous_span: usize,
    host: Option<HostMapping>,
    device: Option<RawBuf>,
    allocator: Allocator,
}

impl RingStorage {
    pub fn new(space: Space, capacity: usize, contiguous_span: usize) -> Result<Self> {
        if contiguous_span == 0 || capacity < contiguous_span * 2 {
            return Err(Error::invalid_argument(Operation::RingAllocate));
        }
        match space {
            Space::Host | Space::HostPinned => {
                let len = Alloc::new().page_round(capacity);
                let ptr = unsafe { crate::os::map_ring(len) }
                    .map_err(|e| Error::io(Operation::RingAllocate, e))?;
                let pinned = space == Space::HostPinned;
                if pinned {
                    if let Err(err) = unsafe { crate::os::lock(ptr, len * 2) } {
                        unsafe { crate::os::unmap_ring(ptr, len) }.unwrap_or_default();
                        return Err(Error::io(Operation::RingAllocate, err));
                    }
                }
                Ok(Self {
                    space,
                    capacity: len,
                    contiguous_span,
                    host: Some(HostMapping { ptr, len, pinned }),
                    device: None,
                    allocator: Allocator::new(),
                })
            }
            Space::Device(_) | Space::DeviceManaged(_) => {
                if contiguous_span > capacity / 2 {
                    return Err(Error::invalid_argument(Operation::RingAllocate));
                }
                let allocator = Allocator::new();
                let buf = allocator.allocate(space, capacity)?;
                let capacity = buf.len();
                Ok(Self { space, capacity, contiguous_span, host: None, device: Some(buf), allocator })
            }
        }
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contiguous_span(&self) -> usize {
        self.contiguous_span
    }

    fn physical(&self, offset: u64) -> usize {
        (offset % self.capacity as u64) as usize
    }

    /// Returns a contiguous view of `len` bytes starting at the absolute
    /// byte offset `offset`.
    pub fn read_span(&self, offset: u64, len: usize) -> Result<ReadSpan> {
        if len > self.contiguous_span {
            return Err(Error::invalid_argument(Operation::RingAcquire));
        }
        let pos = self.physical(offset);
        if let Some(host) = &self.host {
            let ptr = unsafe { host.ptr.add(pos) };
            return Ok(ReadSpan::at(offset, ReadBody::Borrowed { ptr, len }));
        }
        let buf = self.device.as_ref().expect("device storage missing");
        let mut data = vec![0u8; len];
        if pos + len <= self.capacity {
            self.allocator.read_at(buf, pos, &mut data)?;
        } else {
            let first = self.capacity - pos;
            self.allocator.read_at(buf, pos, &mut data[..first])?;
            self.allocator.read_at(buf, 0, &mut data[first..])?;
        }
        Ok(ReadSpan::at(offset, ReadBody::Staged(data)))
    }

    /// Returns a writable contiguous view of `len` bytes starting at the
    /// absolute byte offset `offset`.
    ///
    /// For device storage the returned span is a staging buffer; the
    /// caller must pass it to [`RingStorage::commit_write`] to flush it
    /// into the ring.
    pub fn write_span(&mut self, offset: u64, len: usize) -> Result<WriteSpan> {
        if len > self.contiguous_span {
            return Err(Error::invalid_argument(Operation::RingReserve));
        }
        let pos = self.physical(offset);
        if let Some(host) = &mut self.host {
            let ptr = unsafe { host.ptr.add(pos) };
            return Ok(WriteSpan::at(offset, WriteBody::Borrowed { ptr, len }));
        }
        Ok(WriteSpan::at(offset, WriteBody::Staged(vec![0u8; len])))
    }

    /// Flushes a staged write span into device storage. A no-op for host
    /// storage, whose write spans borrow the mapping directly.
    pub fn commit_write(&mut self, offset: u64, span: WriteSpan) -> Result<()> {
        let data = match span {
            WriteSpan::Staged { data, .. } => data,
            WriteSpan::Borrowed { .. } => return Ok(()),
        };
        let pos = self.physical(offset);
        let buf = self.device.as_mut().expect("device storage missing");
        if pos + data.len() <= self.capacity {
            self.allocator.write_at(buf, pos, &data)?;
        } else {
            let first = self.capacity - pos;
            self.allocator.write_at(buf, pos, &data[..first])?;
            self.allocator.write_at(buf, 0, &data[first..])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_write_then_read_roundtrip() {
        let mut storage = RingStorage::new(Space::Host, 64 * 1024, 4096).unwrap();
        {
            let mut span = storage.write_span(0, 8).unwrap();
            span.copy_from_slice(b"ABCDEFGH");
            storage.commit_write(0, span).unwrap();
        }
        let span = storage.read_span(0, 8).unwrap();
        assert_eq!(&*span, b"ABCDEFGH");
    }

    #[test]
    fn wraparound_span_is_contiguous() {
        let capacity = Alloc::new().page_round(1);
        let mut storage = RingStorage::new(Space::Host, capacity, capacity / 2).unwrap();
        let offset = capacity as u64 - 4;
        {
            let mut span = storage.write_span(offset, 8).unwrap();
            span.copy_from_slice(b"WRAPPING");
            storage.commit_write(offset, span).unwrap();
        }
        let span = storage.read_span(offset, 8).unwrap();
        assert_eq!(&*span, b"WRAPPING");
    }

    #[test]
    fn contiguous_span_over_half_capacity_is_rejected() {
        assert!(RingStorage::new(Space::Host, 4096, 4096).is_err());
    }
}
