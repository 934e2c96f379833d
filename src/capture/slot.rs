//! A capture-engine scratch buffer for one `buffer_ntime`-wide time
//! interval, shared across all `nsrc` sources (spec.md §4.5's "Slot").
//!
//! The engine keeps exactly two of these — front and back — per ring,
//! not per source: a structural change or sample-rate change applies
//! uniformly to every source in one ring, so one front/back pair covers
//! the whole `nsrc * buffer_ntime * bytes_per_sample` byte region that
//! gets reserved as a single ring span on commit.

/// One `buffer_ntime`-wide scratch region plus its per-`(source, time)`
/// received bitmap.
pub struct Slot {
    time_slot: Option<u64>,
    data: Vec<u8>,
    received: Vec<bool>,
    nsrc: usize,
    buffer_ntime: usize,
    bytes_per_sample: usize,
}

impl Slot {
    pub fn new(nsrc: usize, buffer_ntime: usize, bytes_per_sample: usize) -> Self {
        Self {
            time_slot: None,
            data: vec![0u8; nsrc * buffer_ntime * bytes_per_sample],
            received: vec![false; nsrc * buffer_ntime],
            nsrc,
            buffer_ntime,
            bytes_per_sample,
        }
    }

    pub fn time_slot(&self) -> Option<u64> {
        self.time_slot
    }

    /// Zeroes the slot and assigns it a new time-slot index, ready for a
    /// fresh round of packet placement.
    pub fn reset(&mut self, time_slot: u64) {
        self.time_slot = Some(time_slot);
        self.data.iter_mut().for_each(|b| *b = 0);
        self.received.iter_mut().for_each(|b| *b = false);
    }

    /// Writes one packet's payload into this slot at `(source_index,
    /// time_in_slot)`. Payload is truncated to `bytes_per_sample` if
    /// oversized and zero-padded if undersized (neither should happen
    /// with a well-formed decoder, but a short last packet is tolerated).
    pub fn write(&mut self, source_index: usize, time_in_slot: usize, payload: &[u8]) {
        if source_index >= self.nsrc || time_in_slot >= self.buffer_ntime {
            return;
        }
        let row = (source_index * self.buffer_ntime + time_in_slot) * self.bytes_per_sample;
        let n = payload.len().min(self.bytes_per_sample);
        self.data[row..row + n].copy_from_slice(&payload[..n]);
        self.received[source_index * self.buffer_ntime + time_in_slot] = true;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Marks `(source_index, time_in_slot)` as received without touching
    /// the backing bytes, for callers (like [`super::Processor`]) that
    /// write directly into [`Slot::bytes_mut`].
    pub fn mark(&mut self, source_index: usize, time_in_slot: usize) {
        if source_index < self.nsrc && time_in_slot < self.buffer_ntime {
            self.received[source_index * self.buffer_ntime + time_in_slot] = true;
        }
    }

    /// Number of `(source, time)` cells never written — these are
    /// zero-filled gaps in the committed span.
    pub fn gap_count(&self) -> usize {
        self.received.iter().filter(|&&r| !r).count()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn sample_count(&self) -> usize {
        self.buffer_ntime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_data_and_bitmap() {
        let mut slot = Slot::new(2, 4, 1);
        slot.reset(0);
        slot.write(0, 0, &[7]);
        assert_eq!(slot.gap_count(), 7);
        slot.reset(1);
        assert_eq!(slot.time_slot(), Some(1));
        assert_eq!(slot.gap_count(), 8);
        assert!(slot.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn write_sets_bitmap_and_bytes() {
        let mut slot = Slot::new(2, 4, 2);
        slot.reset(0);
        slot.write(1, 2, &[9, 9]);
        assert_eq!(slot.gap_count(), 7);
        let row = (1 * 4 + 2) * 2;
        assert_eq!(&slot.bytes()[row..row + 2], &[9, 9]);
    }
}
