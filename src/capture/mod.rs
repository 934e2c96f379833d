//! Packet capture engine: drives a [`crate::ring::Ring`] writer from one or
//! more [`source::CaptureSource`]s through a [`decoder::Decoder`]/
//! [`decoder::Processor`] pair, per spec.md §4.5.
//!
//! Packets are scattered into one of two ring-wide [`slot::Slot`] buffers
//! (front/back) keyed by `time / buffer_ntime`; once the front slot's time
//! window closes it is reserved and committed as one ring span, zero-filled
//! wherever a packet never arrived, and the slots swap. A structural change
//! — reported by the decoder or detected when the configured granularity
//! elapses — ends the current sequence and starts a new one via the
//! embedder's [`callback::SequenceChangeCallback`].

pub mod callback;
pub mod decoder;
pub mod slot;
pub mod source;

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Kind, Operation};
use crate::ring::{Ring, WriterHandle};
use crate::Result;

pub use self::callback::{ChangeDescriptor, NewSequence, SequenceChangeCallback};
pub use self::decoder::{Decoder, PacketDescriptor, Processor};
pub use self::slot::Slot;
pub use self::source::CaptureSource;

/// Which ingest transport a [`Capture`] was configured with. Carried only
/// for logging/diagnostics; the actual I/O lives behind the
/// [`CaptureSource`] trait object supplied at construction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CaptureMethod {
    Udp,
    Sniffer,
    Verbs,
    Disk,
}

/// Construction parameters for a [`Capture`] engine.
#[derive(Clone, Debug)]
pub struct CaptureParams {
    pub method: CaptureMethod,
    /// Number of distinct source streams multiplexed through this capture.
    pub nsrc: usize,
    /// Samples per source held in one slot before it is committed.
    pub buffer_ntime: usize,
    /// Bytes per `(source, time)` sample cell.
    pub bytes_per_sample: usize,
    /// How many samples of steady operation elapse between unprompted
    /// re-checks of the sequence's structural descriptor (0 disables the
    /// periodic check; the decoder can still force a change at any time).
    pub slot_ntime: u64,
    /// Pin the capture thread to this CPU core on the first `recv` call.
    pub core: Option<usize>,
}

impl CaptureParams {
    pub fn new(method: CaptureMethod, nsrc: usize, buffer_ntime: usize, bytes_per_sample: usize) -> Self {
        Self { method, nsrc, buffer_ntime, bytes_per_sample, slot_ntime: 0, core: None }
    }

    pub fn with_slot_ntime(mut self, slot_ntime: u64) -> Self {
        self.slot_ntime = slot_ntime;
        self
    }

    pub fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    fn slot_bytes(&self) -> usize {
        self.nsrc * self.buffer_ntime * self.bytes_per_sample
    }
}

/// The outcome of one [`Capture::recv`] call, mirroring the C API's
/// `bifrost_status`-style return codes (spec.md §4.5/§6).
#[derive(Debug)]
pub enum RecvStatus {
    /// The first sequence was opened and its first slot committed.
    Started,
    /// A slot was committed within the current sequence.
    Continued,
    /// A structural change closed the previous sequence and opened a new
    /// one; the new sequence's first slot was committed.
    Changed,
    /// The source is exhausted (disk replay reached EOF).
    Ended,
    /// No packet arrived before the deadline; nothing was committed.
    NoData,
    /// The ring or capture was interrupted mid-call.
    Interrupted,
}

/// Running counters satisfying spec.md §8's invariant: `received ==
/// committed + rejected + dropped_late + dropped_overrun` once a capture
/// is drained (committed here counts placed samples, not cells; see
/// `committed_cells` for the gap-accounting view).
#[derive(Copy, Clone, Debug, Default)]
pub struct CaptureStats {
    pub packets_received: u64,
    pub packets_committed: u64,
    pub packets_rejected: u64,
    pub packets_dropped_late: u64,
    pub packets_dropped_overrun: u64,
    pub slots_committed: u64,
    pub sequences_started: u64,
}

/// Drives a ring writer from a packet source.
///
/// `D` validates and extracts packets; `P` scatters their payload into slot
/// memory. Most callers use [`decoder::NullDecoder`]/[`decoder::NullProcessor`]
/// only in tests; real instrument formats plug in their own pair.
pub struct Capture<D, P> {
    ring: Arc<Ring>,
    writer: WriterHandle,
    source: Box<dyn CaptureSource>,
    decoder: D,
    processor: P,
    callback: SequenceChangeCallback,
    params: CaptureParams,
    front: Slot,
    back: Slot,
    stats: CaptureStats,
    have_sequence: bool,
    samples_since_check: u64,
    last_change: ChangeDescriptor,
    pinned: bool,
    src0: u32,
}

impl<D: Decoder, P: Processor> Capture<D, P> {
    pub fn new(
        ring: Arc<Ring>,
        source: Box<dyn CaptureSource>,
        decoder: D,
        processor: P,
        callback: SequenceChangeCallback,
        params: CaptureParams,
    ) -> Result<Self> {
        if params.slot_bytes() > ring.contiguous_span() {
            return Err(Error::invalid_argument(Operation::CaptureCreate));
        }
        let writer = ring.open_writing()?;
        let front = Slot::new(params.nsrc, params.buffer_ntime, params.bytes_per_sample);
        let back = Slot::new(params.nsrc, params.buffer_ntime, params.bytes_per_sample);
        Ok(Self {
            ring,
            writer,
            source,
            decoder,
            processor,
            callback,
            params,
            front,
            back,
            stats: CaptureStats::default(),
            have_sequence: false,
            samples_since_check: 0,
            last_change: ChangeDescriptor::default(),
            pinned: false,
            src0: 0,
        })
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    fn ensure_pinned(&mut self) {
        if self.pinned {
            return;
        }
        self.pinned = true;
        if let Some(core) = self.params.core {
            if let Err(e) = crate::os::pin_to_core(core) {
                warn!("capture: failed to pin to core {}: {}", core, e);
            }
        }
    }

    fn time_slot_of(&self, time: u64) -> u64 {
        time / self.params.buffer_ntime as u64
    }

    /// Reserves and commits the front slot as one ring span, then swaps
    /// front/back and resets the new front for `next_time_slot`.
    fn advance_slot(&mut self, next_time_slot: u64) -> Result<()> {
        let len = self.front.byte_len();
        let gaps = self.front.gap_count();
        if gaps > 0 {
            debug!(
                "capture: committing slot {:?} with {} of {} cells missing",
                self.front.time_slot(),
                gaps,
                self.params.nsrc * self.params.buffer_ntime
            );
        }
        let mut span = self.writer.reserve(len)?;
        span.copy_from_slice(self.front.bytes());
        self.writer.commit(span)?;
        self.stats.slots_committed += 1;
        self.stats.packets_committed += (self.params.nsrc * self.params.buffer_ntime - gaps) as u64;

        std::mem::swap(&mut self.front, &mut self.back);
        self.front.reset(next_time_slot);
        Ok(())
    }

    fn begin_sequence(&mut self, time_tag: i64, change: &ChangeDescriptor) -> Result<()> {
        let approved = (self.callback)(change)?;
        self.writer.begin_sequence(approved.time_tag, format!("seq-{}", time_tag), approved.header)?;
        self.have_sequence = true;
        self.samples_since_check = 0;
        self.last_change = change.clone();
        self.stats.sequences_started += 1;
        Ok(())
    }

    /// Polls the source and advances the capture state machine. Blocks up
    /// to `timeout` waiting for the next packet; returns `NoData` rather
    /// than blocking indefinitely.
    pub fn recv(&mut self, timeout: Duration) -> Result<RecvStatus> {
        self.ensure_pinned();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && Instant::now() >= deadline {
                return Ok(RecvStatus::NoData);
            }
            let mut buf = vec![0u8; self.params.bytes_per_sample + 64];
            let n = match self.source.recv(&mut buf, remaining) {
                Ok(Some(n)) => n,
                Ok(None) => {
                    if self.source.at_end() {
                        return Ok(RecvStatus::Ended);
                    }
                    return Ok(RecvStatus::NoData);
                }
                Err(e) if e.spec_kind() == Some(Kind::Interrupted) => return Ok(RecvStatus::Interrupted),
                Err(e) => return Err(e),
            };

            self.stats.packets_received += 1;
            let descriptor = match self.decoder.decode(&buf[..n]) {
                Some(d) => d,
                None => {
                    self.stats.packets_rejected += 1;
                    continue;
                }
            };

            if !self.have_sequence {
                let change = descriptor.structural.clone().unwrap_or_default();
                let time_slot = self.time_slot_of(descriptor.time);
                self.begin_sequence(descriptor.time as i64, &change)?;
                self.front.reset(time_slot);
                self.back.reset(time_slot + 1);
                self.place(&descriptor, &buf[..n]);
                return Ok(RecvStatus::Started);
            }

            if let Some(change) = descriptor.structural.clone() {
                if self.front.gap_count() < self.params.nsrc * self.params.buffer_ntime {
                    self.advance_slot(self.time_slot_of(descriptor.time))?;
                }
                self.begin_sequence(descriptor.time as i64, &change)?;
                let time_slot = self.time_slot_of(descriptor.time);
                self.front.reset(time_slot);
                self.back.reset(time_slot + 1);
                self.place(&descriptor, &buf[..n]);
                return Ok(RecvStatus::Changed);
            }

            self.samples_since_check += 1;
            if self.params.slot_ntime > 0 && self.samples_since_check >= self.params.slot_ntime {
                trace!("capture: periodic structural re-check at {} samples", self.samples_since_check);
                if self.front.gap_count() < self.params.nsrc * self.params.buffer_ntime {
                    self.advance_slot(self.time_slot_of(descriptor.time))?;
                }
                let change = self.last_change.clone();
                self.begin_sequence(descriptor.time as i64, &change)?;
                let time_slot = self.time_slot_of(descriptor.time);
                self.front.reset(time_slot);
                self.back.reset(time_slot + 1);
                self.place(&descriptor, &buf[..n]);
                return Ok(RecvStatus::Changed);
            }

            let front_slot = self.front.time_slot().unwrap_or(0);
            let time_slot = self.time_slot_of(descriptor.time);

            if time_slot < front_slot {
                self.stats.packets_dropped_late += 1;
                continue;
            }
            if time_slot == front_slot {
                self.place(&descriptor, &buf[..n]);
                return Ok(RecvStatus::Continued);
            }

            let mut next = front_slot + 1;
            while next < time_slot {
                self.advance_slot(next + 1)?;
                next += 1;
            }
            self.advance_slot(time_slot + 1)?;
            self.place(&descriptor, &buf[..n]);
            return Ok(RecvStatus::Continued);
        }
    }

    fn place(&mut self, descriptor: &PacketDescriptor, packet: &[u8]) {
        let source_index = (descriptor.source_id - self.src0) as usize;
        let buffer_ntime = self.params.buffer_ntime as u64;
        let time_in_slot = (descriptor.time % buffer_ntime) as usize;
        let payload = &packet[descriptor.payload_offset..];
        let row = (source_index * self.params.buffer_ntime + time_in_slot) * self.params.bytes_per_sample;
        self.processor.scatter(descriptor, payload, self.front.bytes_mut(), row);
        self.front.mark(source_index, time_in_slot);
    }

    /// Flushes a partially filled front slot (with whatever gaps remain)
    /// and ends the current sequence. Called on shutdown; a capture
    /// dropped mid-recv loses only the in-flight front slot's unflushed
    /// bytes, matching the writer's own drop semantics.
    pub fn flush(&mut self) -> Result<()> {
        if self.have_sequence && self.front.gap_count() < self.params.nsrc * self.params.buffer_ntime {
            let next = self.front.time_slot().unwrap_or(0) + 1;
            self.advance_slot(next)?;
        }
        if self.have_sequence {
            self.writer.end_sequence()?;
            self.have_sequence = false;
        }
        Ok(())
    }
}

impl<D, P> Drop for Capture<D, P> {
    fn drop(&mut self) {
        if self.have_sequence {
            let _ = self.writer.end_sequence();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingParams;
    use crate::space::Space;
    use std::net::UdpSocket;

    fn ring(contiguous: usize, total: usize) -> Arc<Ring> {
        Ring::new(RingParams::new("cap", Space::Host, contiguous).with_total_capacity(total)).unwrap()
    }

    fn encode(source_id: u32, time: u64, changed: bool, payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&source_id.to_le_bytes());
        pkt.extend_from_slice(&time.to_le_bytes());
        pkt.push(changed as u8);
        pkt.extend_from_slice(payload);
        pkt
    }

    struct VecSource {
        packets: std::collections::VecDeque<Vec<u8>>,
    }

    impl CaptureSource for VecSource {
        fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<Option<usize>> {
            match self.packets.pop_front() {
                Some(p) => {
                    buf[..p.len()].copy_from_slice(&p);
                    Ok(Some(p.len()))
                }
                None => Ok(None),
            }
        }

        fn at_end(&self) -> bool {
            self.packets.is_empty()
        }
    }

    fn capture(packets: Vec<Vec<u8>>) -> Capture<decoder::NullDecoder, decoder::NullProcessor> {
        let r = ring(4096, 16384);
        let src = Box::new(VecSource { packets: packets.into() });
        let params = CaptureParams::new(CaptureMethod::Udp, 2, 4, 4);
        let cb: SequenceChangeCallback =
            Box::new(|_: &ChangeDescriptor| Ok(NewSequence { time_tag: 0, header: Vec::new() }));
        Capture::new(r, src, decoder::NullDecoder::new(2, 0), decoder::NullProcessor, cb, params).unwrap()
    }

    #[test]
    fn periodic_recheck_starts_new_sequence_without_structural_flag() {
        let r = ring(4096, 16384);
        let src = Box::new(VecSource {
            packets: vec![encode(0, 0, false, b"abcd"), encode(0, 1, false, b"efgh")].into(),
        });
        let params = CaptureParams::new(CaptureMethod::Udp, 1, 1, 4).with_slot_ntime(1);
        let cb: SequenceChangeCallback =
            Box::new(|_: &ChangeDescriptor| Ok(NewSequence { time_tag: 0, header: Vec::new() }));
        let mut cap =
            Capture::new(r, src, decoder::NullDecoder::new(1, 0), decoder::NullProcessor, cb, params).unwrap();

        assert!(matches!(cap.recv(Duration::from_millis(10)).unwrap(), RecvStatus::Started));
        assert!(matches!(cap.recv(Duration::from_millis(10)).unwrap(), RecvStatus::Changed));
        assert_eq!(cap.stats().sequences_started, 2);
    }

    #[test]
    fn first_packet_starts_sequence() {
        let mut cap = capture(vec![encode(0, 0, false, b"abcd")]);
        let status = cap.recv(Duration::from_millis(10)).unwrap();
        assert!(matches!(status, RecvStatus::Started));
        assert_eq!(cap.stats().sequences_started, 1);
    }

    #[test]
    fn no_packets_yields_no_data() {
        let mut cap = capture(vec![]);
        let status = cap.recv(Duration::from_millis(1)).unwrap();
        assert!(matches!(status, RecvStatus::Ended));
    }

    #[test]
    fn structural_change_yields_changed_and_new_sequence() {
        let mut cap = capture(vec![encode(0, 0, false, b"abcd"), encode(0, 4, true, b"efgh")]);
        assert!(matches!(cap.recv(Duration::from_millis(10)).unwrap(), RecvStatus::Started));
        assert!(matches!(cap.recv(Duration::from_millis(10)).unwrap(), RecvStatus::Changed));
        assert_eq!(cap.stats().sequences_started, 2);
    }

    #[test]
    fn late_packet_is_dropped() {
        let mut cap =
            capture(vec![encode(0, 8, false, b"abcd"), encode(0, 0, false, b"xxxx")]);
        cap.recv(Duration::from_millis(10)).unwrap();
        cap.recv(Duration::from_millis(10)).unwrap();
        assert_eq!(cap.stats().packets_dropped_late, 1);
    }

    #[test]
    fn rejects_out_of_range_source_and_counts_it() {
        let mut cap = capture(vec![encode(9, 0, false, b"abcd")]);
        let status = cap.recv(Duration::from_millis(10)).unwrap();
        assert!(matches!(status, RecvStatus::Ended));
        assert_eq!(cap.stats().packets_rejected, 1);
    }

    #[test]
    fn udp_source_round_trips_through_socket() {
        let recv_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = recv_sock.local_addr().unwrap();
        let send_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        send_sock.send_to(&encode(0, 0, false, b"abcd"), addr).unwrap();

        recv_sock.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 64];
        let n = recv_sock.recv(&mut buf).unwrap();
        let mut decoder = decoder::NullDecoder::new(2, 0);
        assert!(decoder.decode(&buf[..n]).is_some());
    }
}
