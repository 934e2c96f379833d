//! End-to-end span/guarantee scenarios, spec.md §8 scenarios 1-4 plus the
//! cross-thread boundary behaviors that only show up once a writer and
//! readers run on separate threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bifrost_ring::error::Kind;
use bifrost_ring::ring::{Anchor, Ring, RingParams};
use bifrost_ring::space::Space;

fn ring(name: &str, contiguous: usize, total: usize) -> Arc<Ring> {
    Ring::new(RingParams::new(name, Space::Host, contiguous).with_total_capacity(total)).unwrap()
}

fn pattern(i: u8) -> [u8; 1024] {
    let mut buf = [0u8; 1024];
    for b in buf.iter_mut() {
        *b = i.wrapping_mul(31);
    }
    buf
}

/// Scenario 1: capacity=4096, contiguous=1024, 20 committed 1024-byte
/// spans of `(i*31) mod 256`, read back byte-identical by a guaranteed
/// reader. The reader releases between reserves so 20 spans fit through a
/// ring that only physically holds 4 at once.
#[test]
fn scenario1_guaranteed_reader_sees_byte_identical_stream() {
    let r = ring("s1", 1024, 4096);
    let mut writer = r.open_writing().unwrap();
    let mut reader = r.open_reading(true).unwrap();
    writer.begin_sequence(0, "s1", Vec::new()).unwrap();

    let mut expected = Vec::new();
    let mut seq = None;
    for i in 0..20u8 {
        let bytes = pattern(i);
        let mut span = writer.reserve(1024).unwrap();
        span.copy_from_slice(&bytes);
        writer.commit(span).unwrap();
        expected.extend_from_slice(&bytes);

        let s = seq.get_or_insert_with(|| reader.next_sequence(None).unwrap());
        let rspan = reader.acquire(1024, *s).unwrap();
        assert_eq!(&*rspan, &bytes[..]);
        reader.release(rspan).unwrap();
    }
    assert_eq!(expected.len(), 20 * 1024);
}

/// Scenario 2: a second `open_writing` call while one is outstanding fails
/// with `InvalidState`.
#[test]
fn scenario2_concurrent_open_writing_is_rejected() {
    let r = ring("s2", 1024, 4096);
    let _writer = r.open_writing().unwrap();
    let err = r.open_writing().unwrap_err();
    assert_eq!(err.spec_kind(), Some(Kind::InvalidState));
}

/// Scenario 3: capacity=8192, writer reserves and commits 1024 bytes; an
/// opportunistic reader that only looks after a short delay still sees
/// exactly those 1024 committed bytes.
#[test]
fn scenario3_opportunistic_reader_sees_committed_bytes_after_delay() {
    let r = ring("s3", 1024, 8192);
    let mut writer = r.open_writing().unwrap();
    let mut reader = r.open_reading(false).unwrap();
    writer.begin_sequence(0, "s3", Vec::new()).unwrap();

    let bytes = pattern(7);
    let mut span = writer.reserve(1024).unwrap();
    span.copy_from_slice(&bytes);
    writer.commit(span).unwrap();

    thread::sleep(Duration::from_millis(100));

    let seq = reader.next_sequence(None).unwrap();
    let rspan = reader.acquire(1024, seq).unwrap();
    assert_eq!(rspan.len(), 1024);
    assert_eq!(&*rspan, &bytes[..]);
}

/// Scenario 4: capacity=2048 (two 1024-byte slots), writer commits four
/// spans without the opportunistic reader ever releasing; its next
/// `acquire` reports `Overrun` with a cursor snapped to the newest
/// committed span.
#[test]
fn scenario4_opportunistic_reader_lapped_returns_overrun_at_newest_span() {
    let r = ring("s4", 1024, 2048);
    let mut writer = r.open_writing().unwrap();
    let mut reader = r.open_reading(false).unwrap();
    writer.begin_sequence(0, "s4", Vec::new()).unwrap();

    let mut last = [0u8; 1024];
    for i in 0..4u8 {
        last = pattern(i);
        let mut span = writer.reserve(1024).unwrap();
        span.copy_from_slice(&last);
        writer.commit(span).unwrap();
    }

    let seq = reader.next_sequence(None).unwrap();
    let err = reader.acquire(1024, seq).unwrap_err();
    assert_eq!(err.spec_kind(), Some(Kind::Overrun));
    assert_eq!(reader.cursor(), r.commit_cursor() - 2048);

    // The reader's cursor now lands exactly on the newest committed span.
    let rspan = reader.acquire(1024, seq).unwrap();
    assert_eq!(&*rspan, &last[..]);
}

/// The writer genuinely blocks on `reserve` when a guaranteed reader falls
/// capacity behind, and unblocks the instant that reader releases — not
/// merely timing-coincidentally, but driven by the condvar wakeup.
#[test]
fn writer_blocks_until_guaranteed_reader_releases_across_threads() {
    let r = ring("blocks", 1024, 2048);
    let mut reader = r.open_reading(true).unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    let writer_ring = r.clone();

    let handle = thread::spawn(move || {
        let mut writer = writer_ring.open_writing().unwrap();
        writer.begin_sequence(0, "blocks", Vec::new()).unwrap();
        for i in 0..3u8 {
            let mut span = writer.reserve(1024).unwrap();
            span.copy_from_slice(&pattern(i));
            writer.commit(span).unwrap();
        }
        done2.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(75));
    assert!(!done.load(Ordering::SeqCst), "writer should still be blocked on the third reserve");

    let seq = reader.next_sequence(None).unwrap();
    let span = reader.acquire(1024, seq).unwrap();
    reader.release(span).unwrap();

    handle.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
}

/// `interrupt` wakes every thread parked on the ring with a distinguished
/// result; cursors are unaffected and `resume` lets blocking calls proceed
/// normally again.
#[test]
fn interrupt_wakes_blocked_writer_and_preserves_state() {
    let r = ring("interrupt", 1024, 2048);
    let mut reader = r.open_reading(true).unwrap();
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted2 = interrupted.clone();
    let writer_ring = r.clone();

    let handle = thread::spawn(move || {
        let mut writer = writer_ring.open_writing().unwrap();
        writer.begin_sequence(0, "interrupt", Vec::new()).unwrap();
        for i in 0..2u8 {
            let mut span = writer.reserve(1024).unwrap();
            span.copy_from_slice(&pattern(i));
            writer.commit(span).unwrap();
        }
        // This third reserve has nowhere to go until the reader releases;
        // `interrupt` should wake it with `Interrupted` instead.
        let result = writer.reserve(1024);
        if matches!(result, Err(ref e) if e.spec_kind() == Some(Kind::Interrupted)) {
            interrupted2.store(true, Ordering::SeqCst);
        }
    });

    thread::sleep(Duration::from_millis(75));
    let before = r.commit_cursor();
    r.interrupt();
    handle.join().unwrap();
    assert!(interrupted.load(Ordering::SeqCst));
    assert_eq!(r.commit_cursor(), before);

    r.resume();
    let seq = reader.next_sequence(None).unwrap();
    let span = reader.acquire(1024, seq).unwrap();
    reader.release(span).unwrap();
}

/// `resize` on a ring that is open for writing and already holds committed
/// bytes fails with `InvalidState`; it succeeds on a fresh, never-written
/// ring.
#[test]
fn resize_rejects_non_empty_writing_ring_but_allows_fresh_one() {
    let r = ring("resize", 1024, 4096);
    assert!(r.resize(2048, 8192).is_ok());

    let mut writer = r.open_writing().unwrap();
    writer.begin_sequence(0, "resize", Vec::new()).unwrap();
    let span = writer.reserve(16).unwrap();
    writer.commit(span).unwrap();

    let err = r.resize(2048, 8192).unwrap_err();
    assert_eq!(err.spec_kind(), Some(Kind::InvalidState));
}

/// A reader opened with `Anchor::OldestSequence` replays from the first
/// still-live sequence rather than joining at the writer's current cursor.
#[test]
fn reader_joining_at_oldest_sequence_replays_from_the_start() {
    let r = ring("oldest", 1024, 8192);
    let mut writer = r.open_writing().unwrap();
    writer.begin_sequence(0, "first", Vec::new()).unwrap();
    let mut span = writer.reserve(1024).unwrap();
    span.copy_from_slice(&pattern(1));
    writer.commit(span).unwrap();
    writer.end_sequence().unwrap();

    writer.begin_sequence(1, "second", Vec::new()).unwrap();
    let mut latest = r.open_reading(true).unwrap();
    let mut span = writer.reserve(1024).unwrap();
    span.copy_from_slice(&pattern(2));
    writer.commit(span).unwrap();

    let latest_seq = latest.next_sequence(None).unwrap();
    let info = r.sequence_info(latest_seq).unwrap();
    assert_eq!(info.name, "second");

    let mut oldest = r.open_reading_from(true, Anchor::OldestSequence).unwrap();
    let oldest_seq = oldest.next_sequence(None).unwrap();
    let info = r.sequence_info(oldest_seq).unwrap();
    assert_eq!(info.name, "first");
}
