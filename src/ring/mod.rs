//! The memory-space-aware, multi-producer*-visible/multi-consumer ring.
//!
//! *Exactly one producer may hold the writer token at a time (§4.3); many
//! independent readers, guaranteed or opportunistic, observe the same
//! stream concurrently.
//!
//! A [`Ring`] is shared by one writer thread and zero or more reader
//! threads via an [`Arc`]. All metadata — the reservation/commit cursors,
//! the sequence registry, and the set of guaranteed readers' cursors —
//! lives behind a single [`Mutex`], matching spec.md §5's "single per-ring
//! mutex plus two condition variables" shared-resource policy: `space_cv`
//! wakes a writer blocked in `reserve`, `data_cv` wakes a reader blocked in
//! `acquire`/`next_sequence`. The span payload itself is never touched
//! while the lock is held — [`storage::RingStorage::write_span`]/
//! `read_span` return a pointer or staged buffer computed in a few
//! instructions, and the memcpy into/out of it happens after the guard is
//! dropped.

pub mod guarantee;
pub mod reader;
pub mod sequence;
pub mod span;
pub mod storage;
pub mod writer;

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Kind, Operation};
use crate::space::Space;
use crate::Result;

use self::guarantee::GuaranteeManager;
use self::sequence::{Sequence, SequenceHandle, SequenceRegistry};
use self::span::{ReadSpan, WriteSpan};
use self::storage::RingStorage;

pub use self::reader::ReaderHandle;
pub use self::sequence::Sequence as SequenceInfo;
pub use self::writer::WriterHandle;

/// Where a newly opened reader's cursor should start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Anchor {
    /// Start at the writer's current commit cursor (the default): the
    /// reader sees only data written from this point forward.
    Latest,
    /// Start at the oldest sequence still live in the registry, replaying
    /// everything the ring still has.
    OldestSequence,
}

/// Construction parameters for [`Ring::new`].
#[derive(Clone, Debug)]
pub struct RingParams {
    pub name: String,
    pub space: Space,
    /// Largest single span any writer will ever `reserve`; guaranteed to
    /// always be contiguous to the caller, including across the physical
    /// wraparound.
    pub contiguous_span: usize,
    /// Requested total capacity; rounded up internally to at least
    /// `2 * contiguous_span` and to the platform's allocation granularity.
    pub total_capacity: usize,
    /// Number of ringlets (parallel sub-streams sharing one sequence
    /// registry, e.g. one per polarization). The array-descriptor layer
    /// that would interpret this split is out of scope here (spec.md §1);
    /// this crate stores it as opaque capacity-accounting metadata only.
    pub nringlets: usize,
}

impl RingParams {
    pub fn new(name: impl Into<String>, space: Space, contiguous_span: usize) -> Self {
        Self {
            name: name.into(),
            space,
            contiguous_span,
            total_capacity: contiguous_span * 2,
            nringlets: 1,
        }
    }

    pub fn with_total_capacity(mut self, total_capacity: usize) -> Self {
        self.total_capacity = total_capacity;
        self
    }

    pub fn with_nringlets(mut self, nringlets: usize) -> Self {
        self.nringlets = nringlets;
        self
    }
}

struct Inner {
    storage: RingStorage,
    registry: SequenceRegistry,
    guarantee: GuaranteeManager,
    reservation_cursor: u64,
    commit_cursor: u64,
    writing: bool,
    current_sequence: Option<SequenceHandle>,
    opportunistic_readers: usize,
    guaranteed_readers: usize,
    interrupted: bool,
}

impl Inner {
    fn reclaim(&mut self) {
        self.registry.reclaim_dead(self.commit_cursor);
    }
}

/// A bounded circular byte buffer with sequence metadata: one writer,
/// many readers.
///
/// See the module documentation for the concurrency model.
pub struct Ring {
    name: String,
    contiguous_span: usize,
    inner: Mutex<Inner>,
    space_cv: Condvar,
    data_cv: Condvar,
}

impl Ring {
    /// Creates a new ring, allocating its storage immediately.
    ///
    /// Equivalent to the C API's `ring_create` followed by one
    /// `ring_resize` call — this crate has no reason to split allocation
    /// from sizing, since `RingParams` already carries every size input.
    pub fn new(params: RingParams) -> Result<Arc<Self>> {
        if params.contiguous_span == 0 {
            return Err(Error::invalid_argument(Operation::RingAllocate));
        }
        let total = params.total_capacity.max(params.contiguous_span * 2);
        let storage = RingStorage::new(params.space, total, params.contiguous_span)?;
        Ok(Arc::new(Self {
            name: params.name,
            contiguous_span: params.contiguous_span,
            inner: Mutex::new(Inner {
                storage,
                registry: SequenceRegistry::new(),
                guarantee: GuaranteeManager::new(),
                reservation_cursor: 0,
                commit_cursor: 0,
                writing: false,
                current_sequence: None,
                opportunistic_readers: 0,
                guaranteed_readers: 0,
                interrupted: false,
            }),
            space_cv: Condvar::new(),
            data_cv: Condvar::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> Space {
        self.inner.lock().unwrap().storage.space()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().storage.capacity()
    }

    pub fn contiguous_span(&self) -> usize {
        self.contiguous_span
    }

    /// The writer's current commit cursor (absolute byte offset).
    pub fn commit_cursor(&self) -> u64 {
        self.inner.lock().unwrap().commit_cursor
    }

    /// Number of open reader handles, guaranteed and opportunistic.
    pub fn reader_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.guaranteed_readers + inner.opportunistic_readers
    }

    /// Snapshots a sequence's immutable metadata (name, time tag, header,
    /// begin/end offsets) by handle.
    ///
    /// This is the Rust rendition of the C API's `with_header_out`
    /// parameter on `sequence_open_*` (spec.md §6): rather than writing
    /// through an out-pointer, the caller gets an owned copy. Fails with
    /// `InvalidState` if the handle has been reclaimed.
    pub fn sequence_info(&self, handle: SequenceHandle) -> Result<SequenceInfo> {
        let inner = self.inner.lock().unwrap();
        inner.registry.get(handle).map(|s| s.clone())
    }

    /// Resizes the ring's storage.
    ///
    /// Data-safe only when the ring has never been opened for writing or
    /// currently holds no committed bytes (spec.md §4.2); otherwise fails
    /// with `InvalidState`.
    pub fn resize(&self, contiguous_span: usize, total_capacity: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.writing && inner.commit_cursor > 0 {
            return Err(Error::invalid_state(Operation::RingResize));
        }
        let space = inner.storage.space();
        let total = total_capacity.max(contiguous_span * 2);
        inner.storage = RingStorage::new(space, total, contiguous_span)?;
        inner.reservation_cursor = 0;
        inner.commit_cursor = 0;
        Ok(())
    }

    /// Wakes every thread parked on this ring's condition variables with a
    /// distinguished `Interrupted` result. The ring's state is unaffected
    /// and blocking calls may be retried once interruption is cleared with
    /// [`Ring::resume`].
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.interrupted = true;
        drop(inner);
        self.space_cv.notify_all();
        self.data_cv.notify_all();
    }

    /// Clears a prior `interrupt`, allowing blocking calls to wait again.
    pub fn resume(&self) {
        self.inner.lock().unwrap().interrupted = false;
    }

    /// Opens this ring for writing. Fails with `InvalidState` if another
    /// writer token is already outstanding.
    pub fn open_writing(self: &Arc<Self>) -> Result<WriterHandle> {
        let mut inner = self.inner.lock().unwrap();
        if inner.writing {
            return Err(Error::invalid_state(Operation::RingOpenWriting));
        }
        inner.writing = true;
        drop(inner);
        Ok(WriterHandle::new(self.clone()))
    }

    /// Opens a reader against this ring.
    ///
    /// A guaranteed reader (`guaranteed = true`) participates in
    /// backpressure: the writer blocks in `reserve` rather than overwrite
    /// data this reader hasn't released. An opportunistic reader never
    /// blocks the writer and instead observes `Overrun` if lapped.
    pub fn open_reading(self: &Arc<Self>, guaranteed: bool) -> Result<ReaderHandle> {
        self.open_reading_from(guaranteed, Anchor::Latest)
    }

    /// Like [`Ring::open_reading`] but with an explicit starting anchor.
    pub fn open_reading_from(
        self: &Arc<Self>,
        guaranteed: bool,
        anchor: Anchor,
    ) -> Result<ReaderHandle> {
        let mut inner = self.inner.lock().unwrap();
        let start = match anchor {
            Anchor::Latest => inner.commit_cursor,
            Anchor::OldestSequence => {
                inner.registry.oldest().map(|(_, seq)| seq.begin_offset).unwrap_or(inner.commit_cursor)
            }
        };
        let cursor = if guaranteed {
            inner.guaranteed_readers += 1;
            Some(inner.guarantee.register(start))
        } else {
            inner.opportunistic_readers += 1;
            None
        };
        drop(inner);
        Ok(ReaderHandle::new(self.clone(), guaranteed, start, cursor))
    }

    fn deadline(timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|d| Instant::now() + d)
    }

    fn wait_timeout<'a>(
        &self,
        cv: &Condvar,
        mut guard: std::sync::MutexGuard<'a, Inner>,
        deadline: Option<Instant>,
    ) -> Result<std::sync::MutexGuard<'a, Inner>> {
        match deadline {
            None => Ok(cv.wait(guard).unwrap()),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::kind(Operation::None, Kind::Timeout));
                }
                let (g, result) = cv.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
                if result.timed_out() {
                    Err(Error::kind(Operation::None, Kind::Timeout))
                } else {
                    Ok(guard)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Space;

    fn ring(contiguous: usize, total: usize) -> Arc<Ring> {
        Ring::new(RingParams::new("t", Space::Host, contiguous).with_total_capacity(total)).unwrap()
    }

    #[test]
    fn new_rejects_zero_span() {
        let params = RingParams::new("t", Space::Host, 0);
        assert!(Ring::new(params).is_err());
    }

    #[test]
    fn resize_rejected_while_writing_with_data() {
        let r = ring(4096, 16384);
        let mut w = r.open_writing().unwrap();
        w.begin_sequence(0, "s", Vec::new()).unwrap();
        w.commit(w.reserve(16).unwrap()).unwrap();
        assert!(r.resize(4096, 16384).is_err());
    }

    #[test]
    fn interrupt_then_resume_preserves_cursors() {
        let r = ring(1024, 4096);
        let mut w = r.open_writing().unwrap();
        w.begin_sequence(0, "s", Vec::new()).unwrap();
        w.commit(w.reserve(16).unwrap()).unwrap();
        let before = r.commit_cursor();
        r.interrupt();
        r.resume();
        assert_eq!(r.commit_cursor(), before);
    }
}
