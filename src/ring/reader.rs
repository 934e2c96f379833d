//! Reader cursors: sequence iteration and the acquire/release protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::error::{Error, Kind, Operation};
use crate::Result;

use super::sequence::SequenceHandle;
use super::span::ReadSpan;
use super::Ring;

/// A reader handle obtained from [`Ring::open_reading`]/`open_reading_from`.
///
/// A *guaranteed* reader participates in the writer's backpressure
/// calculation: the writer blocks in `reserve` rather than lap this
/// reader's cursor. An *opportunistic* reader never blocks the writer;
/// instead, if the writer laps it, the next `acquire` reports
/// [`Kind::Overrun`] and silently snaps the cursor forward to
/// `writer_commit - capacity + 1` (spec.md §4.4).
pub struct ReaderHandle {
    ring: Arc<Ring>,
    guaranteed: bool,
    cursor: u64,
    guarantee_cursor: Option<Arc<AtomicU64>>,
    current: Option<SequenceHandle>,
}

impl ReaderHandle {
    pub(super) fn new(
        ring: Arc<Ring>,
        guaranteed: bool,
        start: u64,
        guarantee_cursor: Option<Arc<AtomicU64>>,
    ) -> Self {
        Self { ring, guaranteed, cursor: start, guarantee_cursor, current: None }
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    pub fn is_guaranteed(&self) -> bool {
        self.guaranteed
    }

    /// This reader's current absolute byte cursor.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Blocks until a sequence whose `begin_offset >= self.cursor()`
    /// appears, or `timeout` elapses.
    pub fn next_sequence(&mut self, timeout: Option<Duration>) -> Result<SequenceHandle> {
        let deadline = Ring::deadline(timeout);
        let mut inner = self.ring.inner.lock().unwrap();
        loop {
            if inner.interrupted {
                return Err(Error::kind(Operation::RingAcquire, Kind::Interrupted));
            }
            if let Some((handle, seq)) = inner.registry.next_from(self.cursor) {
                if self.cursor < seq.begin_offset {
                    self.cursor = seq.begin_offset;
                }
                inner.registry.acquire_ref(handle)?;
                if let Some(prev) = self.current.replace(handle) {
                    inner.registry.release_ref(prev);
                    inner.reclaim();
                }
                return Ok(handle);
            }
            inner = self.ring.wait_timeout(&self.ring.data_cv, inner, deadline)?;
        }
    }

    /// Acquires up to `n` contiguous bytes from `seq` at this reader's
    /// cursor, blocking until enough bytes are committed or the sequence
    /// ends (in which case a short span covering the remainder is
    /// returned). Does not advance the cursor — call [`ReaderHandle::release`]
    /// for that.
    pub fn acquire(&mut self, n: usize, seq: SequenceHandle) -> Result<ReadSpan> {
        self.acquire_timeout(n, seq, None)
    }

    /// Non-blocking acquire: returns `Kind::WouldBlock` instead of parking.
    pub fn try_acquire(&mut self, n: usize, seq: SequenceHandle) -> Result<ReadSpan> {
        let mut inner = self.ring.inner.lock().unwrap();
        match self.try_once(&mut inner, n, seq)? {
            Some(span) => Ok(span),
            None => Err(Error::kind(Operation::RingAcquire, Kind::WouldBlock)),
        }
    }

    /// Acquire with an explicit timeout; `None` blocks indefinitely.
    pub fn acquire_timeout(
        &mut self,
        n: usize,
        seq: SequenceHandle,
        timeout: Option<Duration>,
    ) -> Result<ReadSpan> {
        let deadline = Ring::deadline(timeout);
        let mut inner = self.ring.inner.lock().unwrap();
        loop {
            if let Some(span) = self.try_once(&mut inner, n, seq)? {
                return Ok(span);
            }
            trace!("ring {:?}: reader blocked on acquire({})", self.ring.name, n);
            inner = self.ring.wait_timeout(&self.ring.data_cv, inner, deadline)?;
        }
    }

    /// One non-blocking attempt at `acquire`. `Ok(None)` means the caller
    /// should wait for more data; any other outcome is final.
    fn try_once(&mut self, inner: &mut super::Inner, n: usize, seq: SequenceHandle) -> Result<Option<ReadSpan>> {
        if inner.interrupted {
            return Err(Error::kind(Operation::RingAcquire, Kind::Interrupted));
        }
        let sequence = inner.registry.get(seq)?.clone();

        if !self.guaranteed {
            let capacity = inner.storage.capacity() as u64;
            if inner.commit_cursor.saturating_sub(self.cursor) > capacity {
                self.cursor = (inner.commit_cursor - capacity + 1).max(sequence.begin_offset);
                return Err(Error::overrun(Operation::RingAcquire));
            }
        }

        let available = inner.commit_cursor.saturating_sub(self.cursor);
        let want = n as u64;
        let bound = sequence.remaining_from(self.cursor);

        let ready = if let Some(bound) = bound {
            // Sequence has an end: we can satisfy the request once either
            // `n` bytes are committed or the sequence end is reached.
            available >= want.min(bound) && (available >= want || sequence.end_offset.is_some())
        } else {
            available >= want
        };

        if !ready {
            return Ok(None);
        }

        let len = bound.map(|b| b.min(want)).unwrap_or(want);
        if len == 0 {
            return Err(Error::kind(Operation::RingAcquire, Kind::EndOfData));
        }
        let offset = self.cursor;
        let span = inner.storage.read_span(offset, len as usize)?;
        Ok(Some(span))
    }

    /// Releases a span acquired from this reader, advancing its cursor and
    /// waking the writer if it was blocked on this reader's backpressure.
    pub fn release(&mut self, span: ReadSpan) -> Result<()> {
        use super::span::Span;
        if span.offset() != self.cursor {
            return Err(Error::invalid_state(Operation::RingRelease));
        }
        self.cursor += span.len() as u64;
        if let Some(cursor) = &self.guarantee_cursor {
            cursor.store(self.cursor, Ordering::Release);
            self.ring.space_cv.notify_all();
        }
        let mut inner = self.ring.inner.lock().unwrap();
        inner.reclaim();
        Ok(())
    }

    /// Switches this reader between guaranteed and opportunistic.
    ///
    /// Becoming opportunistic immediately stops participating in the
    /// writer's backpressure floor. Becoming guaranteed snaps the cursor
    /// forward to `writer_commit - capacity` if it had fallen further
    /// behind than that while opportunistic, so the writer isn't
    /// retroactively stalled for laps that already happened (spec.md §4.4).
    pub fn set_guaranteed(&mut self, guaranteed: bool) {
        let mut inner = self.ring.inner.lock().unwrap();
        if guaranteed == self.guaranteed {
            return;
        }
        if guaranteed {
            let capacity = inner.storage.capacity() as u64;
            let floor = inner.commit_cursor.saturating_sub(capacity);
            if self.cursor < floor {
                self.cursor = floor;
            }
            let cursor = inner.guarantee.register(self.cursor);
            self.guarantee_cursor = Some(cursor);
            inner.opportunistic_readers -= 1;
            inner.guaranteed_readers += 1;
        } else if let Some(cursor) = self.guarantee_cursor.take() {
            inner.guarantee.unregister(&cursor);
            inner.guaranteed_readers -= 1;
            inner.opportunistic_readers += 1;
        }
        self.guaranteed = guaranteed;
        drop(inner);
        self.ring.space_cv.notify_all();
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        let mut inner = self.ring.inner.lock().unwrap();
        if let Some(cursor) = self.guarantee_cursor.take() {
            inner.guarantee.unregister(&cursor);
            inner.guaranteed_readers = inner.guaranteed_readers.saturating_sub(1);
        } else {
            inner.opportunistic_readers = inner.opportunistic_readers.saturating_sub(1);
        }
        if let Some(current) = self.current.take() {
            inner.registry.release_ref(current);
        }
        inner.reclaim();
        drop(inner);
        self.ring.space_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{Ring, RingParams};
    use crate::space::Space;

    fn ring(contiguous: usize, total: usize) -> Arc<Ring> {
        Ring::new(RingParams::new("t", Space::Host, contiguous).with_total_capacity(total)).unwrap()
    }

    #[test]
    fn guaranteed_reader_reads_back_exact_bytes() {
        let r = ring(1024, 4096);
        let mut w = r.open_writing().unwrap();
        let mut reader = r.open_reading(true).unwrap();
        w.begin_sequence(0, "s", Vec::new()).unwrap();
        let bytes: Vec<u8> = (0..1024u32).map(|i| (i * 31 % 256) as u8).collect();
        let mut span = w.reserve(1024).unwrap();
        span.copy_from_slice(&bytes);
        w.commit(span).unwrap();

        let seq = reader.next_sequence(None).unwrap();
        let rspan = reader.acquire(1024, seq).unwrap();
        assert_eq!(&*rspan, &bytes[..]);
        reader.release(rspan).unwrap();
    }

    #[test]
    fn two_guaranteed_readers_see_same_bytes_independent_of_speed() {
        let r = ring(1024, 8192);
        let mut w = r.open_writing().unwrap();
        let mut fast = r.open_reading(true).unwrap();
        let mut slow = r.open_reading(true).unwrap();
        w.begin_sequence(0, "s", Vec::new()).unwrap();
        for i in 0..4u8 {
            let mut span = w.reserve(1024).unwrap();
            span.copy_from_slice(&[i; 1024]);
            w.commit(span).unwrap();
        }
        let seq = fast.next_sequence(None).unwrap();
        let mut fast_bytes = Vec::new();
        for _ in 0..4 {
            let s = fast.acquire(1024, seq).unwrap();
            fast_bytes.extend_from_slice(&s);
            fast.release(s).unwrap();
        }
        let seq2 = slow.next_sequence(None).unwrap();
        let mut slow_bytes = Vec::new();
        for _ in 0..4 {
            let s = slow.acquire(1024, seq2).unwrap();
            slow_bytes.extend_from_slice(&s);
            slow.release(s).unwrap();
        }
        assert_eq!(fast_bytes, slow_bytes);
    }

    #[test]
    fn writer_blocks_until_guaranteed_reader_releases() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;
        use std::time::Duration;

        // Capacity holds exactly two 1024-byte spans; a guaranteed reader
        // registered at cursor 0 lets the writer fill both before a third
        // `reserve` must block on `space_cv` until the reader releases.
        let r = ring(1024, 2048);
        let mut reader = r.open_reading(true).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let ring2 = r.clone();
        let writer_thread = thread::spawn(move || {
            let mut w = ring2.open_writing().unwrap();
            w.begin_sequence(0, "s", Vec::new()).unwrap();
            for i in 0..3u8 {
                let mut span = w.reserve(1024).unwrap();
                span.copy_from_slice(&[i; 1024]);
                w.commit(span).unwrap();
            }
            done2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst), "writer should be blocked on the third reserve");

        let seq = reader.next_sequence(None).unwrap();
        let span = reader.acquire(1024, seq).unwrap();
        reader.release(span).unwrap();

        writer_thread.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn opportunistic_reader_lapped_returns_overrun() {
        let r = ring(1024, 2048);
        let mut w = r.open_writing().unwrap();
        let mut reader = r.open_reading(false).unwrap();
        w.begin_sequence(0, "s", Vec::new()).unwrap();
        for i in 0..4u8 {
            let mut span = w.reserve(1024).unwrap();
            span.copy_from_slice(&[i; 1024]);
            w.commit(span).unwrap();
        }
        let seq = reader.next_sequence(None).unwrap();
        let err = reader.acquire(1024, seq).unwrap_err();
        assert_eq!(err.spec_kind(), Some(crate::error::Kind::Overrun));
        assert_eq!(reader.cursor(), r.commit_cursor() - 2048 + 1);
    }

    #[test]
    fn end_sequence_mid_span_truncates_then_end_of_data() {
        let r = ring(1024, 4096);
        let mut w = r.open_writing().unwrap();
        let mut reader = r.open_reading(true).unwrap();
        w.begin_sequence(0, "s", Vec::new()).unwrap();
        let mut span = w.reserve(512).unwrap();
        span.copy_from_slice(&[7u8; 512]);
        w.commit(span).unwrap();
        w.end_sequence().unwrap();

        let seq = reader.next_sequence(None).unwrap();
        let short = reader.acquire(1024, seq).unwrap();
        assert_eq!(short.len(), 512);
        reader.release(short).unwrap();
        let err = reader.acquire(1024, seq).unwrap_err();
        assert_eq!(err.spec_kind(), Some(crate::error::Kind::EndOfData));
    }
}
