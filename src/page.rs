use std::fmt;
use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::ops::{Deref, DerefMut};
use std::slice;

use crate::os::{flush, map_file, protect, unmap};
use crate::{Alloc, Flush, Pgno, Protect};

/// Maps a whole-page range of `file` read-only.
///
/// Used by [`crate::capture::source::DiskSource`] to walk a packet-stream
/// file directly off the page cache instead of issuing repeated `read`
/// calls.
pub fn file_page(alloc: &Alloc, file: &File, no: Pgno, count: Pgno) -> Result<Page> {
    let off = alloc.page_size(no);
    let len = alloc.page_size(count);
    if file.metadata()?.len() < (off + len) as u64 {
        Err(Error::new(ErrorKind::InvalidInput, "page range not in file"))
    } else {
        unsafe {
            let ptr = map_file(file, off, len, Protect::ReadOnly)?;
            Ok(Page::new(ptr, len))
        }
    }
}

/// Maps a whole-page range of `file` read-write.
pub fn file_page_mut(alloc: &Alloc, file: &File, no: Pgno, count: Pgno) -> Result<PageMut> {
    let off = alloc.page_size(no);
    let len = alloc.page_size(count);
    if file.metadata()?.len() < (off + len) as u64 {
        Err(Error::new(ErrorKind::InvalidInput, "page range not in file"))
    } else {
        unsafe {
            let ptr = map_file(file, off, len, Protect::ReadWrite)?;
            Ok(PageMut::new(ptr, len))
        }
    }
}



/// Allocation of one or more read-only sequential pages.
///
/// Typically you will not want to construct this directly. Instead use
/// [`file_page`] to get a full page range from a file.
pub struct Page {
    base: PageMut,
}

impl Page {
    /// Constructs a new page sequence from an existing mapping.
    ///
    /// # Safety
    ///
    /// This does not know or care if `ptr` or `len` are valid. That is,
    /// it may be null, not at a proper page boundary, point to a size
    /// different from `len`, or worse yet, point to properly mapped pointer
    /// from some other allocation system.
    ///
    /// Generally don't use this unless you are entirely sure you are
    /// doing so correctly.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { base: PageMut::new(ptr, len) }
    }

    pub fn make_mut(self) -> Result<PageMut> {
        unsafe { protect(self.base.ptr, self.base.len, Protect::ReadWrite) }?;
        Ok(self.base)
    }
}

impl Deref for Page {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.base.deref()
    }
}

impl AsRef<[u8]> for Page {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.deref()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Page")
            .field("ptr", &self.base.ptr)
            .field("len", &self.base.len)
            .finish()
    }
}



/// Allocation of one or more read-write sequential pages.
#[derive(Debug)]
pub struct PageMut {
    ptr: *mut u8,
    len: usize,
}

impl PageMut {
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr: ptr, len: len }
    }

    pub fn make_const(self) -> Result<Page> {
        unsafe { protect(self.ptr, self.len, Protect::ReadOnly) }?;
        Ok(Page { base: self })
    }

    pub fn flush(&self, mode: Flush) -> Result<()> {
        unsafe { flush(self.ptr, self.len, mode) }
    }
}

impl Drop for PageMut {
    fn drop(&mut self) {
        unsafe { unmap(self.ptr, self.len) }.unwrap_or_default();
    }
}

impl Deref for PageMut {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl DerefMut for PageMut {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl AsRef<[u8]> for PageMut {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.deref()
    }
}

impl AsMut<[u8]> for PageMut {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.deref_mut()
    }
}

