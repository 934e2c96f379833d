//! The sequence-change callback capability object.
//!
//! Spec.md §9 calls this out as a "dynamic callback from capture to
//! caller" built on a C function pointer plus opaque context; the
//! idiomatic Rust rendition is a boxed `FnMut` trait object rather than a
//! raw pointer pair. The callback runs on the capture thread and must not
//! block on the ring it feeds (that would deadlock against the writer it
//! is itself driving) — this crate documents that contract but, like the
//! source material, cannot enforce it at the type level.

use crate::Result;

/// The structural descriptor passed to a [`SequenceChangeCallback`] when
/// the capture engine detects (or is told by the decoder) that a new
/// epoch has begun: a channel count, source count, sample-rate, tuning,
/// or bit-depth change.
#[derive(Clone, Debug, Default)]
pub struct ChangeDescriptor {
    pub time_offset: u64,
    pub channel0: u32,
    pub nchan: u32,
    pub nsrc: u32,
    pub tuning: Option<u32>,
    pub decimation: Option<u32>,
    pub gain: Option<f32>,
    pub nbit: Option<u32>,
    pub complex: Option<bool>,
}

/// What the callback hands back for the sequence it approved.
#[derive(Clone, Debug, Default)]
pub struct NewSequence {
    pub time_tag: i64,
    pub header: Vec<u8>,
}

/// A boxed callback invoked once per structural change, on the capture
/// thread, before any span of the new sequence becomes visible to
/// readers. Returning `Err` rejects the sequence and drops the packet
/// that triggered it.
pub type SequenceChangeCallback = Box<dyn FnMut(&ChangeDescriptor) -> Result<NewSequence> + Send>;
