//! A streaming ring-buffer substrate for multi-producer/multi-consumer
//! signal-processing pipelines.
//!
//! A [`ring::Ring`] is a fixed-capacity circular byte buffer backed by a
//! doubled virtual memory mapping: the same physical pages are mapped twice,
//! back to back, so a span of bytes that straddles the physical wraparound
//! still appears contiguous to the caller. Producers and consumers exchange
//! data through *sequences* (named streams within the ring, each spanning a
//! contiguous absolute byte range) and *spans* (a reserved or acquired
//! window of bytes within a sequence). A [`capture::Capture`] engine drives
//! a ring from one of several packet ingest paths.
//!
//! Platform-specific unsafe code lives entirely in [`os`]; everything built
//! on top of it is safe.

use std::sync::Once;

/// Low-level cross-platform virtual memory functions.
pub mod os {
    #[cfg(unix)]
    mod unix;
    #[cfg(unix)]
    pub use self::unix::*;

    #[cfg(windows)]
    mod windows;
    #[cfg(windows)]
    pub use self::windows::*;
}

mod page;
pub use self::page::{Page, PageMut};

pub mod error;
pub use self::error::{Error, Kind, Operation, Result};

pub mod space;
pub use self::space::{Allocator, RawBuf, Space};

pub mod ring;
pub use self::ring::{Anchor, Ring, RingParams};

pub mod capture;
pub use self::capture::{Capture, CaptureParams, RecvStatus};

/// Type to represent whole page offsets and counts.
pub type Pgno = u32;

/// Protection level for a page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protect {
    /// The page(s) may only be read from.
    ReadOnly,
    /// The page(s) may be read from and written to.
    ReadWrite,
}

/// Desired behavior when flushing write changes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Flush {
    /// Request dirty pages to be written immediately and block until completed.
    ///
    /// This is not supported on Windows. The flush is always performed asynchronously.
    Sync,
    /// Request dirty pages to be written but do not wait for completion.
    Async,
}

static mut SIZE: usize = 0;
static INIT: Once = Once::new();

/// Gets a cached version of the system page size.
///
/// ```
/// let size = bifrost_ring::page_size();
/// println!("the system page size is {} bytes", size);
/// ```
pub fn page_size() -> usize {
    unsafe {
        INIT.call_once(|| {
            SIZE = self::os::page_size();
        });
        SIZE
    }
}

/// Type for converting between byte sizes and whole-page counts.
///
/// The construction of this object is very cheap, as it does not track any
/// allocations itself — it is a pure arithmetic helper reused by [`space`]
/// and [`ring::storage`] whenever a requested size must be rounded up to a
/// page or allocation-granularity boundary.
#[derive(Copy, Clone)]
pub struct Alloc {
    sizem: usize,
    shift: u32,
}

impl Default for Alloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Alloc {
    /// Creates a type for calculating page numbers and byte offsets.
    ///
    /// The size is determined from the system's configured page size. While
    /// the call to get this value is cached, it is preferable to reuse the
    /// `Alloc` instance when possible.
    #[inline]
    pub fn new() -> Self {
        unsafe { Self::new_size(page_size()) }
    }

    /// Creates a type for calculating page numbers and byte offsets using a
    /// known page size.
    ///
    /// # Safety
    ///
    /// The size *must* be a power-of-2. To successfully map pages, the size
    /// must also be a multiple of the actual system page size.
    #[inline]
    pub unsafe fn new_size(size: usize) -> Self {
        Self {
            sizem: size - 1,
            shift: size.trailing_zeros(),
        }
    }

    /// Round a byte size up to the nearest page size.
    #[inline]
    pub fn page_round(&self, len: usize) -> usize {
        self.page_truncate(len + self.sizem)
    }

    /// Round a byte size down to the nearest page size.
    #[inline]
    pub fn page_truncate(&self, len: usize) -> usize {
        len & !self.sizem
    }

    /// Convert a page count into a byte size.
    #[inline]
    pub fn page_size(&self, count: Pgno) -> usize {
        (count as usize) << self.shift
    }

    /// Convert a byte size into the number of pages necessary to contain it.
    #[inline]
    pub fn page_count(&self, len: usize) -> Pgno {
        (self.page_round(len) >> self.shift) as Pgno
    }
}

#[cfg(test)]
mod test {
    use super::Alloc;

    #[test]
    fn page_math() {
        let info = unsafe { Alloc::new_size(4096) };
        assert_eq!(info.page_round(0), 0);
        assert_eq!(info.page_round(1), 4096);
        assert_eq!(info.page_round(4095), 4096);
        assert_eq!(info.page_round(4096), 4096);
        assert_eq!(info.page_round(4097), 8192);
        assert_eq!(info.page_truncate(0), 0);
        assert_eq!(info.page_truncate(1), 0);
        assert_eq!(info.page_truncate(4095), 0);
        assert_eq!(info.page_truncate(4096), 4096);
        assert_eq!(info.page_truncate(4097), 4096);
        assert_eq!(info.page_size(0), 0);
        assert_eq!(info.page_size(1), 4096);
        assert_eq!(info.page_size(2), 8192);
        assert_eq!(info.page_count(0), 0);
        assert_eq!(info.page_count(1), 1);
        assert_eq!(info.page_count(4095), 1);
        assert_eq!(info.page_count(4096), 1);
        assert_eq!(info.page_count(4097), 2);
        assert_eq!(info.page_count(8192), 2);
    }
}
