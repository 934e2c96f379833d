//! Contiguous byte windows into ring storage.
//!
//! Generalizes the teacher's `Span`/`SpanMut` pair (a sealed trait over
//! `&[u8]`/`&mut [u8]`) to cover a view that may borrow directly from the
//! ring's doubled virtual mapping, or own a host-side staging buffer
//! bounce-copied from device memory. Either way the caller sees a single
//! contiguous slice — the physical wraparound is never visible.
//!
//! Like the teacher's [`crate::Page`]/[`crate::PageMut`], the borrowed
//! variants hold a raw pointer rather than a lifetime-checked `&[u8]`: the
//! ring's mapping is stable for as long as the `Ring` itself lives, and
//! tying a `Span`'s lifetime to the `&mut RingStorage` that produced it
//! would make it impossible to pass the span back into `commit`/`release`
//! on the same ring. Callers only ever see spans while the ring that
//! produced them is open, per the reserve/commit and acquire/release
//! protocols in [`crate::ring::writer`] and [`crate::ring::reader`].
//!
//! Each span remembers the absolute ring offset it was reserved/acquired
//! at, so `commit`/`release` don't need a second out-of-band parameter to
//! know which cursor to advance.

use std::ops::{Deref, DerefMut};
use std::slice;

mod sealed {
    pub trait Sealed {}
}

/// A read-only contiguous view into ring storage.
pub trait Span: sealed::Sealed {
    fn len(&self) -> usize;
    fn as_ptr(&self) -> *const u8;
    /// Absolute byte offset into the ring's logical stream this span
    /// starts at.
    fn offset(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A read-write contiguous view into ring storage.
pub trait SpanMut: Span + DerefMut {
    fn as_mut_ptr(&mut self) -> *mut u8;
}

/// A span returned by [`crate::ring::reader::ReaderHandle::acquire`].
pub enum ReadSpan {
    /// Borrows directly from the ring's doubled mapping.
    Borrowed { offset: u64, ptr: *const u8, len: usize },
    /// Bounce-copied out of device storage.
    Staged { offset: u64, data: Vec<u8> },
}

impl ReadSpan {
    pub(crate) fn at(offset: u64, body: ReadBody) -> Self {
        match body {
            ReadBody::Borrowed { ptr, len } => ReadSpan::Borrowed { offset, ptr, len },
            ReadBody::Staged(data) => ReadSpan::Staged { offset, data },
        }
    }
}

/// Offset-free payload returned by [`crate::ring::storage::RingStorage`];
/// [`ReadSpan::at`]/[`WriteSpan::at`] attach the absolute offset the
/// higher-level protocol is tracking.
pub enum ReadBody {
    Borrowed { ptr: *const u8, len: usize },
    Staged(Vec<u8>),
}

pub enum WriteBody {
    Borrowed { ptr: *mut u8, len: usize },
    Staged(Vec<u8>),
}

impl sealed::Sealed for ReadSpan {}

impl Span for ReadSpan {
    fn len(&self) -> usize {
        self.deref().len()
    }

    fn as_ptr(&self) -> *const u8 {
        self.deref().as_ptr()
    }

    fn offset(&self) -> u64 {
        match self {
            ReadSpan::Borrowed { offset, .. } => *offset,
            ReadSpan::Staged { offset, .. } => *offset,
        }
    }
}

impl Deref for ReadSpan {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ReadSpan::Borrowed { ptr, len, .. } => unsafe { slice::from_raw_parts(*ptr, *len) },
            ReadSpan::Staged { data, .. } => data.as_slice(),
        }
    }
}

/// A span returned by [`crate::ring::writer::WriterHandle::reserve`].
///
/// Bytes written into a `Staged` span are copied into ring storage by
/// [`crate::ring::writer::WriterHandle::commit`].
pub enum WriteSpan {
    /// Borrows directly from the ring's doubled mapping.
    Borrowed { offset: u64, ptr: *mut u8, len: usize },
    /// Held host-side until committed into device storage.
    Staged { offset: u64, data: Vec<u8> },
}

impl WriteSpan {
    pub(crate) fn at(offset: u64, body: WriteBody) -> Self {
        match body {
            WriteBody::Borrowed { ptr, len } => WriteSpan::Borrowed { offset, ptr, len },
            WriteBody::Staged(data) => WriteSpan::Staged { offset, data },
        }
    }
}

impl sealed::Sealed for WriteSpan {}

impl Span for WriteSpan {
    fn len(&self) -> usize {
        self.deref().len()
    }

    fn as_ptr(&self) -> *const u8 {
        self.deref().as_ptr()
    }

    fn offset(&self) -> u64 {
        match self {
            WriteSpan::Borrowed { offset, .. } => *offset,
            WriteSpan::Staged { offset, .. } => *offset,
        }
    }
}

impl SpanMut for WriteSpan {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.deref_mut().as_mut_ptr()
    }
}

impl Deref for WriteSpan {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            WriteSpan::Borrowed { ptr, len, .. } => unsafe { slice::from_raw_parts(*ptr, *len) },
            WriteSpan::Staged { data, .. } => data.as_slice(),
        }
    }
}

impl DerefMut for WriteSpan {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            WriteSpan::Borrowed { ptr, len, .. } => unsafe { slice::from_raw_parts_mut(*ptr, *len) },
            WriteSpan::Staged { data, .. } => data.as_mut_slice(),
        }
    }
}
