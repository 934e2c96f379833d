//! The format-plugin seam: `Decoder` validates and extracts a packet
//! descriptor, `Processor` scatters the payload into capture slot memory.
//!
//! Concrete instrument formats (CHIPS, DRX, VDIF, TBN, …) are explicitly
//! out of scope (spec.md §1); this module defines the trait contract plus
//! a `NullDecoder`/`NullProcessor` test double used by the integration
//! tests and available to any embedder that wants a synthetic format for
//! development.

use super::callback::ChangeDescriptor;

/// What a [`Decoder`] extracts from one raw packet.
#[derive(Clone, Debug)]
pub struct PacketDescriptor {
    /// Which source stream this packet belongs to (spec.md's `source_id`).
    pub source_id: u32,
    /// Sample-rate-relative time index of the first sample in this packet.
    pub time: u64,
    /// Byte offset within the packet where the payload begins.
    pub payload_offset: usize,
    /// Set when this packet signals a structural change (channel count,
    /// source count, sample-rate, bit-depth); `None` for an ordinary
    /// packet within the current epoch.
    pub structural: Option<ChangeDescriptor>,
}

/// Validates and extracts a [`PacketDescriptor`] from one raw packet.
///
/// Returns `None` to reject a malformed, wrong-format, or
/// unrecognized-source packet (spec.md §4.5 step 2); the capture engine
/// counts this and continues.
pub trait Decoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Option<PacketDescriptor>;
}

/// Scatters one packet's payload into the capture engine's slot memory.
///
/// `slot` is the destination slot's full backing buffer; `byte_offset` is
/// where this packet's payload belongs within it (already computed by the
/// engine from `source_id`/`time`).
pub trait Processor: Send {
    fn scatter(&mut self, descriptor: &PacketDescriptor, payload: &[u8], slot: &mut [u8], byte_offset: usize);
}

/// A trivial fixed-layout test format: `[source_id: u32 LE][time: u64
/// LE][change: u8 flag][payload...]`. Used by this crate's own
/// integration tests in place of a real instrument decoder.
pub struct NullDecoder {
    pub nsrc: u32,
    pub src0: u32,
}

impl NullDecoder {
    pub fn new(nsrc: u32, src0: u32) -> Self {
        Self { nsrc, src0 }
    }
}

const NULL_HEADER_LEN: usize = 4 + 8 + 1;

impl Decoder for NullDecoder {
    fn decode(&mut self, packet: &[u8]) -> Option<PacketDescriptor> {
        if packet.len() < NULL_HEADER_LEN {
            return None;
        }
        let source_id = u32::from_le_bytes(packet[0..4].try_into().ok()?);
        if source_id < self.src0 || source_id >= self.src0 + self.nsrc {
            return None;
        }
        let time = u64::from_le_bytes(packet[4..12].try_into().ok()?);
        let changed = packet[12] != 0;
        let structural = if changed {
            Some(ChangeDescriptor {
                time_offset: time,
                channel0: 0,
                nchan: 1,
                nsrc: self.nsrc,
                tuning: None,
                decimation: None,
                gain: None,
                nbit: Some(8),
                complex: Some(false),
            })
        } else {
            None
        };
        Some(PacketDescriptor { source_id, time, payload_offset: NULL_HEADER_LEN, structural })
    }
}

/// Copies the payload verbatim into the slot at `byte_offset`, truncating
/// to whatever room remains in the slot.
pub struct NullProcessor;

impl Processor for NullProcessor {
    fn scatter(&mut self, _descriptor: &PacketDescriptor, payload: &[u8], slot: &mut [u8], byte_offset: usize) {
        if byte_offset >= slot.len() {
            return;
        }
        let n = payload.len().min(slot.len() - byte_offset);
        slot[byte_offset..byte_offset + n].copy_from_slice(&payload[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(source_id: u32, time: u64, changed: bool, payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(NULL_HEADER_LEN + payload.len());
        pkt.extend_from_slice(&source_id.to_le_bytes());
        pkt.extend_from_slice(&time.to_le_bytes());
        pkt.push(changed as u8);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn decodes_well_formed_packet() {
        let mut decoder = NullDecoder::new(4, 0);
        let pkt = encode(2, 100, false, b"abcd");
        let desc = decoder.decode(&pkt).unwrap();
        assert_eq!(desc.source_id, 2);
        assert_eq!(desc.time, 100);
        assert!(desc.structural.is_none());
    }

    #[test]
    fn rejects_out_of_range_source() {
        let mut decoder = NullDecoder::new(4, 0);
        let pkt = encode(9, 100, false, b"abcd");
        assert!(decoder.decode(&pkt).is_none());
    }

    #[test]
    fn rejects_short_packet() {
        let mut decoder = NullDecoder::new(4, 0);
        assert!(decoder.decode(&[1, 2, 3]).is_none());
    }

    #[test]
    fn change_flag_produces_structural_descriptor() {
        let mut decoder = NullDecoder::new(4, 0);
        let pkt = encode(0, 0, true, b"x");
        let desc = decoder.decode(&pkt).unwrap();
        assert!(desc.structural.is_some());
    }
}
