//! The single writer token and its reserve/commit/sequence protocol.

use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::error::{Error, Kind, Operation};
use crate::Result;

use super::sequence::SequenceHandle;
use super::span::WriteSpan;
use super::Ring;

/// The exclusive writer handle for a [`Ring`].
///
/// Obtained from [`Ring::open_writing`]; at most one `WriterHandle` may
/// exist for a ring at a time (spec.md §4.3, §9 "per-ring singleton
/// writer"). Dropping the handle ends any open sequence and releases the
/// writer token, matching `close_writing`.
pub struct WriterHandle {
    ring: Arc<Ring>,
    sequence: Option<SequenceHandle>,
    closed: bool,
}

impl WriterHandle {
    pub(super) fn new(ring: Arc<Ring>) -> Self {
        Self { ring, sequence: None, closed: false }
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    /// Begins a new sequence at the current reservation cursor.
    ///
    /// If a sequence is already open it is implicitly ended first, exactly
    /// as `close_writing`/the next `begin_sequence` would (spec.md §4.3:
    /// "ends when writer begins a new sequence or closes the ring").
    pub fn begin_sequence(
        &mut self,
        time_tag: i64,
        name: impl Into<String>,
        header: Vec<u8>,
    ) -> Result<SequenceHandle> {
        let mut inner = self.ring.inner.lock().unwrap();
        if let Some(prev) = self.sequence.take() {
            inner.registry.end(prev, inner.reservation_cursor)?;
        }
        let handle = inner.registry.begin(name.into(), time_tag, header, inner.reservation_cursor);
        inner.current_sequence = Some(handle);
        inner.reclaim();
        self.sequence = Some(handle);
        drop(inner);
        self.ring.data_cv.notify_all();
        Ok(handle)
    }

    /// Reserves `n` contiguous bytes at the reservation cursor, blocking if
    /// doing so would overrun the slowest guaranteed reader.
    ///
    /// `n` must not exceed the ring's `contiguous_span`.
    pub fn reserve(&mut self, n: usize) -> Result<WriteSpan> {
        self.reserve_timeout(n, None)
    }

    /// Non-blocking reserve: returns `Kind::WouldBlock` instead of parking.
    pub fn try_reserve(&mut self, n: usize) -> Result<WriteSpan> {
        if self.sequence.is_none() {
            return Err(Error::invalid_state(Operation::RingReserve));
        }
        if n > self.ring.contiguous_span {
            return Err(Error::invalid_argument(Operation::RingReserve));
        }
        let mut inner = self.ring.inner.lock().unwrap();
        if inner.interrupted {
            return Err(Error::kind(Operation::RingReserve, Kind::Interrupted));
        }
        if !self.has_space(&inner, n) {
            return Err(Error::kind(Operation::RingReserve, Kind::WouldBlock));
        }
        let offset = inner.reservation_cursor;
        let span = inner.storage.write_span(offset, n)?;
        inner.reservation_cursor += n as u64;
        Ok(span)
    }

    /// Reserve with an explicit timeout; `None` blocks indefinitely.
    pub fn reserve_timeout(&mut self, n: usize, timeout: Option<Duration>) -> Result<WriteSpan> {
        if self.sequence.is_none() {
            return Err(Error::invalid_state(Operation::RingReserve));
        }
        if n > self.ring.contiguous_span {
            return Err(Error::invalid_argument(Operation::RingReserve));
        }
        let deadline = Ring::deadline(timeout);
        let mut inner = self.ring.inner.lock().unwrap();
        loop {
            if inner.interrupted {
                return Err(Error::kind(Operation::RingReserve, Kind::Interrupted));
            }
            if self.has_space(&inner, n) {
                break;
            }
            trace!(
                "ring {:?}: writer blocked on reserve({}), {} guaranteed readers",
                self.ring.name,
                n,
                inner.guaranteed_readers
            );
            inner = self.ring.wait_timeout(&self.ring.space_cv, inner, deadline)?;
        }
        let offset = inner.reservation_cursor;
        let span = inner.storage.write_span(offset, n)?;
        inner.reservation_cursor += n as u64;
        Ok(span)
    }

    fn has_space(&self, inner: &super::Inner, n: usize) -> bool {
        let floor = inner.guarantee.min_guaranteed();
        if floor == u64::MAX {
            return true;
        }
        (inner.reservation_cursor + n as u64).saturating_sub(floor) <= inner.storage.capacity() as u64
    }

    /// Commits a span previously returned by `reserve`, advancing the
    /// commit cursor and waking any reader blocked in `acquire`.
    pub fn commit(&mut self, span: WriteSpan) -> Result<()> {
        let mut inner = self.ring.inner.lock().unwrap();
        let offset = span.offset();
        let len = span.len() as u64;
        if offset != inner.commit_cursor {
            return Err(Error::invalid_state(Operation::RingCommit));
        }
        inner.storage.commit_write(offset, span)?;
        inner.commit_cursor += len;
        inner.reclaim();
        drop(inner);
        self.ring.data_cv.notify_all();
        Ok(())
    }

    /// Ends the currently open sequence, if any.
    pub fn end_sequence(&mut self) -> Result<()> {
        if let Some(handle) = self.sequence.take() {
            let mut inner = self.ring.inner.lock().unwrap();
            inner.registry.end(handle, inner.commit_cursor)?;
            if inner.current_sequence == Some(handle) {
                inner.current_sequence = None;
            }
            inner.reclaim();
            drop(inner);
            self.ring.data_cv.notify_all();
        }
        Ok(())
    }

    /// Ends any open sequence and releases the writer token. Equivalent to
    /// dropping the handle; kept as an explicit method so call sites read
    /// the same as the C API's `close_writing`.
    pub fn close_writing(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.end_sequence()?;
        let mut inner = self.ring.inner.lock().unwrap();
        inner.writing = false;
        Ok(())
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
