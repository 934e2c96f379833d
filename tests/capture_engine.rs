//! UDP and disk capture scenarios, spec.md §8 scenarios 5-6.

use std::io::Write as _;
use std::net::UdpSocket;
use std::time::Duration;

use bifrost_ring::capture::decoder::{NullDecoder, NullProcessor};
use bifrost_ring::capture::source::{DiskSource, UdpSource};
use bifrost_ring::capture::{Capture, CaptureMethod, CaptureParams, ChangeDescriptor, NewSequence, RecvStatus};
use bifrost_ring::ring::{Ring, RingParams};
use bifrost_ring::space::Space;

fn ring(contiguous: usize, total: usize) -> std::sync::Arc<Ring> {
    Ring::new(RingParams::new("cap-it", Space::Host, contiguous).with_total_capacity(total)).unwrap()
}

fn encode(source_id: u32, time: u64, changed: bool, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(13 + payload.len());
    pkt.extend_from_slice(&source_id.to_le_bytes());
    pkt.extend_from_slice(&time.to_le_bytes());
    pkt.push(changed as u8);
    pkt.extend_from_slice(payload);
    pkt
}

/// Scenario 5: a UDP source carrying one sequence of 4 sources × 13 time
/// samples (50 packets total, the last few crossing a `buffer_ntime`
/// boundary). The first `recv` reports `Started`, later ones report
/// `Continued`, and the ring's sequence header matches what the
/// structural-change callback handed back.
#[test]
fn scenario5_udp_capture_reports_started_then_continued_with_matching_header() {
    let r = ring(4096, 16384);
    let mut watcher = r.open_reading(true).unwrap();

    let source = UdpSource::bind("127.0.0.1:0").unwrap();
    let addr = source.local_addr().unwrap();

    let send_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut sent = 0;
    'outer: for time in 0..13u64 {
        for src in 0..4u32 {
            if sent == 50 {
                break 'outer;
            }
            let payload = [src as u8; 4];
            send_sock.send_to(&encode(src, time, false, &payload), addr).unwrap();
            sent += 1;
        }
    }
    assert_eq!(sent, 50);

    let expected_header = vec![0xAA, 0xBB, 0xCC];
    let header_for_cb = expected_header.clone();
    let callback = Box::new(move |_: &ChangeDescriptor| {
        Ok(NewSequence { time_tag: 0, header: header_for_cb.clone() })
    });
    let params = CaptureParams::new(CaptureMethod::Udp, 4, 10, 4);
    let mut capture = Capture::new(
        r.clone(),
        Box::new(source),
        NullDecoder::new(4, 0),
        NullProcessor,
        callback,
        params,
    )
    .unwrap();

    let first = capture.recv(Duration::from_millis(500)).unwrap();
    assert!(matches!(first, RecvStatus::Started));

    let mut continued = 0;
    for _ in 0..49 {
        match capture.recv(Duration::from_millis(500)).unwrap() {
            RecvStatus::Continued => continued += 1,
            RecvStatus::Started | RecvStatus::Changed => panic!("only one structural change was sent"),
            RecvStatus::Ended | RecvStatus::NoData => break,
            RecvStatus::Interrupted => panic!("capture was not interrupted"),
        }
    }
    assert!(continued >= 1, "expected at least one Continued status, saw {continued}");
    assert_eq!(capture.stats().packets_received, 50);

    let handle = watcher.next_sequence(None).unwrap();
    let info = r.sequence_info(handle).unwrap();
    assert_eq!(info.header, expected_header);
    assert_eq!(info.begin_offset, 0);
}

/// Scenario 6: a disk-replayed packet stream with two structural changes
/// yields exactly three sequences, each with a strictly increasing time
/// tag and the header its own structural-change callback returned.
#[test]
fn scenario6_disk_capture_splits_into_three_sequences_with_expected_headers() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let packets = [
        encode(0, 0, false, &[1; 4]),
        encode(0, 1, false, &[1; 4]),
        encode(0, 2, true, &[2; 4]),
        encode(0, 3, false, &[2; 4]),
        encode(0, 4, true, &[3; 4]),
    ];
    for p in &packets {
        file.write_all(&(p.len() as u32).to_le_bytes()).unwrap();
        file.write_all(p).unwrap();
    }
    file.flush().unwrap();

    let r = ring(4096, 16384);
    let mut oldest = r.open_reading_from(true, bifrost_ring::ring::Anchor::OldestSequence).unwrap();

    let source = DiskSource::open(file.path()).unwrap();
    // Deliberately unrelated to the packets' own `time` field, so the test
    // proves the ring sequence's `time_tag` comes from the callback's
    // `NewSequence::time_tag`, not from the packet that triggered it.
    let sequences = [(10, vec![0x10]), (20, vec![0x20]), (30, vec![0x30])];
    let sequences_for_cb = std::sync::Arc::new(std::sync::Mutex::new(sequences.to_vec().into_iter()));
    let callback = Box::new(move |_: &ChangeDescriptor| {
        let (time_tag, header) = sequences_for_cb.lock().unwrap().next().unwrap_or_default();
        Ok(NewSequence { time_tag, header })
    });
    let params = CaptureParams::new(CaptureMethod::Disk, 1, 1, 4);
    let mut capture = Capture::new(
        r.clone(),
        Box::new(source),
        NullDecoder::new(1, 0),
        NullProcessor,
        callback,
        params,
    )
    .unwrap();

    loop {
        match capture.recv(Duration::from_millis(10)).unwrap() {
            RecvStatus::Ended => break,
            RecvStatus::Started | RecvStatus::Continued | RecvStatus::Changed => {}
            other => panic!("unexpected status from a disk replay: {other:?}"),
        }
    }
    capture.flush().unwrap();
    assert_eq!(capture.stats().sequences_started, 3);

    let mut time_tags = Vec::new();
    let mut headers_seen = Vec::new();
    let mut handle = oldest.next_sequence(None).unwrap();
    loop {
        let info = r.sequence_info(handle).unwrap();
        time_tags.push(info.time_tag);
        headers_seen.push(info.header.clone());
        let Some(end) = info.end_offset else { break };
        let remaining = end - info.begin_offset;
        if remaining > 0 {
            let span = oldest.acquire(remaining as usize, handle).unwrap();
            oldest.release(span).unwrap();
        }
        match oldest.next_sequence(Some(Duration::from_millis(10))) {
            Ok(next) => handle = next,
            Err(_) => break,
        }
    }

    let (expected_tags, expected_headers): (Vec<_>, Vec<_>) = sequences.into_iter().unzip();
    assert_eq!(time_tags, expected_tags);
    assert_eq!(headers_seen, expected_headers);
    assert!(time_tags.windows(2).all(|w| w[0] < w[1]));
}
