//! Performance benchmarks for the hot paths of the relay server

use protocol::{pack, unpack, Body, Message};
use rand::Rng;
use server::action_queue::{ActionQueue, ReadOutcome};
use server::autofire;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Benchmarks packing and unpacking a full resend window of input messages
#[test]
fn benchmark_bundle_framing() {
    let mut window: VecDeque<Message> = VecDeque::new();
    let mut last_accepted = 0xFFFF;

    let iterations = 50_000u32;
    let start = Instant::now();

    for i in 0..iterations {
        let number = i as u16;
        let body = Body::GameData {
            data: vec![(i & 0xFF) as u8; 12],
        };
        window.push_front(Message::new(number, body).unwrap());
        window.truncate(6);

        let datagram = pack(window.make_contiguous(), 1024);
        let messages = unpack(&datagram, last_accepted).unwrap();
        assert_eq!(messages.len(), 1);
        last_accepted = messages[0].number;
    }

    let duration = start.elapsed();
    println!(
        "Bundle framing: {} datagrams in {:?} ({:.2} μs/datagram)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks decoding a datagram that must be walked entry by entry
#[test]
fn benchmark_stale_scan() {
    let messages: Vec<Message> = (0..6u16)
        .rev()
        .map(|n| {
            Message::new(
                n,
                Body::ChatRequest {
                    message: "benchmark line".to_string(),
                },
            )
            .unwrap()
        })
        .collect();
    let datagram = pack(&messages, 1024);

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        // Two messages were lost, so three entries must be decoded.
        let recovered = unpack(&datagram, 2).unwrap();
        assert_eq!(recovered.len(), 3);
    }

    let duration = start.elapsed();
    println!(
        "Stale scan: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the write and read path of an action queue with four readers
#[test]
fn benchmark_action_queue() {
    let consumers = 4;
    let queue = ActionQueue::new(1, 1, consumers, 4096, Duration::from_millis(100));
    queue.set_synched(true);

    let input = [0x12u8, 0x34, 0x56, 0x78];
    let mut dest = [0u8; 4];
    let iterations = 200_000;
    let start = Instant::now();

    for _ in 0..iterations {
        queue.write(&input);
        for consumer in 1..=consumers {
            assert_eq!(queue.read(consumer, &mut dest), Ok(ReadOutcome::Filled));
        }
    }

    let duration = start.elapsed();
    assert_eq!(dest, input);
    println!(
        "Action queue: {} writes × {} readers in {:?} ({:.2} ns/write)",
        iterations,
        consumers,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 3 seconds
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks autofire scanning of random input at the strictest level
#[test]
fn benchmark_autofire_scan() {
    let (max_delay, min_reps) = autofire::parameters(autofire::MAX_SENSITIVITY).unwrap();
    let bytes_per_action = 2;
    let actions = autofire::chunk_actions(max_delay, min_reps);

    let mut rng = rand::thread_rng();
    let chunks: Vec<Vec<u8>> = (0..64)
        .map(|_| {
            (0..actions * bytes_per_action)
                .map(|_| rng.gen_range(0..3u8))
                .collect()
        })
        .collect();

    let iterations = 20_000;
    let start = Instant::now();
    let mut detections = 0;

    for i in 0..iterations {
        if autofire::scan(&chunks[i % chunks.len()], bytes_per_action, max_delay, min_reps) {
            detections += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Autofire scan: {} chunks of {} actions in {:?} ({:.2} μs/chunk, {} detections)",
        iterations,
        actions,
        duration,
        duration.as_micros() as f64 / iterations as f64,
        detections
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}
