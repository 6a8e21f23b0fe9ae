//! Performance benchmarks for the reliability hot paths

use shared::{Assertion, Body, Envelope, Message, MessageQueue, Received, MAX_PAYLOAD};
use std::io;
use std::time::Instant;

fn custom(len: usize) -> Body {
    Body::Custom {
        peer_id: 1,
        payload: vec![0x5a; len],
    }
}

fn discard(datagram: &[u8]) -> io::Result<usize> {
    Ok(datagram.len())
}

/// Benchmarks envelope encoding and decoding
#[test]
fn benchmark_envelope_codec() {
    let envelope = Envelope::reliable(42, custom(256));

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let datagram = envelope.encode().unwrap();
        let decoded = Envelope::decode(&datagram).unwrap();
        assert_eq!(decoded.sequence, 42);
    }

    let duration = start.elapsed();
    println!(
        "Envelope codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks a full send window cycle: submit, acknowledge, reopen
#[test]
fn benchmark_send_window_cycle() {
    let mut assertion = Assertion::new(256);

    let rounds = 1_000;
    let start = Instant::now();

    for _ in 0..rounds {
        for _ in 0..256 {
            assertion.submit_for_send(custom(64)).unwrap();
        }
        assert!(!assertion.on_assertion_request(assertion.next_sequence(), discard));
        assert!(!assertion.has_pending());
    }

    let duration = start.elapsed();
    let messages = rounds * 256;
    println!(
        "Send window: {} messages in {:?} ({:.2} ns/msg)",
        messages,
        duration,
        duration.as_nanos() as f64 / messages as f64
    );

    assert_eq!(assertion.stats().sent, messages as u64);
    // Should complete in under 3 seconds
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks reordered delivery through the receive window
#[test]
fn benchmark_reordered_receive() {
    let mut assertion = Assertion::new(256);
    let mut delivered = 0usize;

    let rounds = 1_000u32;
    let start = Instant::now();

    for round in 0..rounds {
        let base = round * 256;
        // Everything but the first message of the round arrives early.
        for offset in 1..256 {
            let received = assertion.accept_received(base + offset, custom(16)).unwrap();
            assert_eq!(received, Received::Buffered);
        }
        if let Received::Deliverable(_) = assertion.accept_received(base, custom(16)).unwrap() {
            delivered += 1 + assertion.drain_ready().count();
        }
    }

    let duration = start.elapsed();
    println!(
        "Reordered receive: {} messages in {:?} ({:.2} ns/msg)",
        delivered,
        duration,
        duration.as_nanos() as f64 / delivered as f64
    );

    assert_eq!(delivered, (rounds * 256) as usize);
    // Should complete in under 3 seconds
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks queue throughput with periodic compaction
#[test]
fn benchmark_message_queue() {
    let queue = MessageQueue::new();

    let iterations = 200_000;
    let start = Instant::now();

    for i in 0..iterations {
        queue.push(Message {
            peer_id: i,
            data: vec![0; 32],
        });
        if i % 2 == 1 {
            queue.pop();
            queue.pop();
        }
    }

    let duration = start.elapsed();
    println!(
        "Message queue: {} push/pop pairs in {:?} ({:.2} ns/pair)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(queue.is_empty());
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks encoding the largest payload that fits one datagram
#[test]
fn benchmark_max_payload_submit() {
    let mut assertion = Assertion::new(64);

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let datagram = assertion.submit_for_send(custom(MAX_PAYLOAD)).unwrap();
        assert!(datagram.len() <= shared::config::DEFAULT_BUFFER_CAPACITY);
        let next = assertion.next_sequence();
        assertion.on_assertion_request(next, discard);
    }

    let duration = start.elapsed();
    println!(
        "Max payload submit: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}
