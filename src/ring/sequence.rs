//! The registry of live sequences within a ring.
//!
//! A sequence is a named, contiguous run of the ring's logical (unwrapped)
//! byte stream — one UDP burst, one on-disk capture run, one observation.
//! [`SequenceHandle`] is a weak `(index, generation)` pair rather than a
//! direct reference: once a sequence is reclaimed (every reader has
//! released past its end and the writer has moved on), a handle obtained
//! before that point must fail cleanly instead of reading stale or reused
//! slot data.

use crate::error::{Error, Operation};
use crate::Result;

/// Opaque reference to a sequence registered in a [`SequenceRegistry`].
///
/// Two handles compare equal only if they name the same registry slot *and*
/// the same generation of that slot, so a handle outliving the sequence it
/// named can never alias a newer occupant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SequenceHandle {
    index: usize,
    generation: u32,
}

/// Metadata for one registered sequence.
///
/// `time_tag` and `header` are the opaque, immutable values the writer
/// passed to `begin_sequence`; the core never interprets them. `refcount`
/// is the number of reader cursors currently positioned within
/// `[begin_offset, end_offset)` — a sequence isn't reclaimed while any
/// reader could still reach it, even after the writer's tail has moved on.
#[derive(Clone, Debug)]
pub struct Sequence {
    pub name: String,
    pub time_tag: i64,
    pub header: Vec<u8>,
    pub begin_offset: u64,
    pub end_offset: Option<u64>,
    refcount: u32,
}

impl Sequence {
    /// Whether `offset` falls within `[begin_offset, end_offset)`, or
    /// `begin_offset..` if the sequence is still open.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.begin_offset && self.end_offset.map_or(true, |end| offset < end)
    }

    /// Bytes remaining before the sequence end, or `None` if still open.
    pub fn remaining_from(&self, offset: u64) -> Option<u64> {
        self.end_offset.map(|end| end.saturating_sub(offset))
    }

    /// Whether the writer's commit cursor has moved entirely past this
    /// sequence, i.e. it can no longer grow or be read from fresh.
    pub fn is_closed_before(&self, commit_cursor: u64) -> bool {
        self.end_offset.map_or(false, |end| end <= commit_cursor)
    }
}

enum Slot {
    Occupied(u32, Sequence),
    Free(u32),
}

/// Arena-backed registry of sequences live within one ring.
///
/// Entries are appended in writer order, so `oldest()` is always the
/// lowest-index occupied slot.
#[derive(Default)]
pub struct SequenceRegistry {
    slots: Vec<Slot>,
    free_list: Vec<usize>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free_list: Vec::new() }
    }

    /// Registers a newly begun sequence and returns a handle to it.
    pub fn begin(
        &mut self,
        name: String,
        time_tag: i64,
        header: Vec<u8>,
        begin_offset: u64,
    ) -> SequenceHandle {
        let seq = Sequence { name, time_tag, header, begin_offset, end_offset: None, refcount: 0 };
        if let Some(index) = self.free_list.pop() {
            let generation = match self.slots[index] {
                Slot::Free(generation) => generation,
                Slot::Occupied(..) => unreachable!("free list pointed at occupied slot"),
            };
            self.slots[index] = Slot::Occupied(generation, seq);
            SequenceHandle { index, generation }
        } else {
            let index = self.slots.len();
            self.slots.push(Slot::Occupied(0, seq));
            SequenceHandle { index, generation: 0 }
        }
    }

    /// Marks a live sequence as ended at `end_offset`.
    pub fn end(&mut self, handle: SequenceHandle, end_offset: u64) -> Result<()> {
        let seq = self.get_mut(handle)?;
        seq.end_offset = Some(end_offset);
        Ok(())
    }

    /// Increments the reader refcount for a live sequence.
    pub fn acquire_ref(&mut self, handle: SequenceHandle) -> Result<()> {
        self.get_mut(handle)?.refcount += 1;
        Ok(())
    }

    /// Decrements the reader refcount for a live sequence. Does nothing if
    /// the handle has already been reclaimed (the sequence outlived the
    /// reader that held it, which is the common case).
    pub fn release_ref(&mut self, handle: SequenceHandle) {
        if let Ok(seq) = self.get_mut(handle) {
            seq.refcount = seq.refcount.saturating_sub(1);
        }
    }

    /// Reclaims every sequence that has ended before `commit_cursor` and
    /// has no remaining reader references. Called by the writer after
    /// `end_sequence`/`begin_sequence` and by a reader after `release`.
    pub fn reclaim_dead(&mut self, commit_cursor: u64) {
        for index in 0..self.slots.len() {
            if let Slot::Occupied(generation, seq) = &self.slots[index] {
                if seq.refcount == 0 && seq.is_closed_before(commit_cursor) {
                    let generation = *generation;
                    self.slots[index] = Slot::Free(generation.wrapping_add(1));
                    self.free_list.push(index);
                }
            }
        }
    }

    pub fn get(&self, handle: SequenceHandle) -> Result<&Sequence> {
        match self.slots.get(handle.index) {
            Some(Slot::Occupied(generation, seq)) if *generation == handle.generation => Ok(seq),
            _ => Err(Error::invalid_state(Operation::SequenceBegin)),
        }
    }

    fn get_mut(&mut self, handle: SequenceHandle) -> Result<&mut Sequence> {
        match self.slots.get_mut(handle.index) {
            Some(Slot::Occupied(generation, seq)) if *generation == handle.generation => Ok(seq),
            _ => Err(Error::invalid_state(Operation::SequenceEnd)),
        }
    }

    /// The oldest live (lowest-index occupied) sequence, if any.
    pub fn oldest(&self) -> Option<(SequenceHandle, &Sequence)> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match slot {
            Slot::Occupied(generation, seq) => {
                Some((SequenceHandle { index, generation: *generation }, seq))
            }
            Slot::Free(_) => None,
        })
    }

    /// The sequence containing `offset`, scanning from the oldest.
    pub fn containing(&self, offset: u64) -> Option<(SequenceHandle, &Sequence)> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match slot {
            Slot::Occupied(generation, seq) if seq.contains(offset) => {
                Some((SequenceHandle { index, generation: *generation }, seq))
            }
            _ => None,
        })
    }

    /// The earliest-begun sequence whose `begin_offset` is `>= offset`,
    /// used by `next_sequence` to find the next sequence a reader hasn't
    /// seen yet.
    pub fn next_from(&self, offset: u64) -> Option<(SequenceHandle, &Sequence)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(generation, seq) if seq.begin_offset >= offset => {
                    Some((SequenceHandle { index, generation: *generation }, seq))
                }
                _ => None,
            })
            .min_by_key(|(_, seq)| seq.begin_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_end_roundtrip() {
        let mut reg = SequenceRegistry::new();
        let h = reg.begin("a".into(), 0, Vec::new(), 0);
        assert_eq!(reg.get(h).unwrap().begin_offset, 0);
        reg.end(h, 128).unwrap();
        assert_eq!(reg.get(h).unwrap().end_offset, Some(128));
    }

    #[test]
    fn reclaimed_handle_is_invalid() {
        let mut reg = SequenceRegistry::new();
        let h = reg.begin("a".into(), 0, Vec::new(), 0);
        reg.end(h, 64).unwrap();
        reg.reclaim_dead(64);
        assert!(reg.get(h).is_err());
    }

    #[test]
    fn referenced_sequence_is_not_reclaimed() {
        let mut reg = SequenceRegistry::new();
        let h = reg.begin("a".into(), 0, Vec::new(), 0);
        reg.end(h, 64).unwrap();
        reg.acquire_ref(h).unwrap();
        reg.reclaim_dead(64);
        assert!(reg.get(h).is_ok());
        reg.release_ref(h);
        reg.reclaim_dead(64);
        assert!(reg.get(h).is_err());
    }

    #[test]
    fn reclaimed_slot_is_reused_with_new_generation() {
        let mut reg = SequenceRegistry::new();
        let h1 = reg.begin("a".into(), 0, Vec::new(), 0);
        reg.end(h1, 64).unwrap();
        reg.reclaim_dead(64);
        let h2 = reg.begin("b".into(), 1, Vec::new(), 64);
        assert_ne!(h1, h2);
        assert!(reg.get(h1).is_err());
        assert_eq!(reg.get(h2).unwrap().begin_offset, 64);
    }

    #[test]
    fn oldest_and_containing() {
        let mut reg = SequenceRegistry::new();
        let h1 = reg.begin("a".into(), 0, Vec::new(), 0);
        reg.end(h1, 64).unwrap();
        let h2 = reg.begin("b".into(), 1, Vec::new(), 64);
        assert_eq!(reg.oldest().unwrap().0, h1);
        assert_eq!(reg.containing(70).unwrap().0, h2);
    }

    #[test]
    fn next_from_finds_earliest_unseen() {
        let mut reg = SequenceRegistry::new();
        let h1 = reg.begin("a".into(), 0, Vec::new(), 0);
        reg.end(h1, 64).unwrap();
        let h2 = reg.begin("b".into(), 1, Vec::new(), 64);
        assert_eq!(reg.next_from(0).unwrap().0, h1);
        assert_eq!(reg.next_from(64).unwrap().0, h2);
        assert!(reg.next_from(128).is_none());
    }
}
