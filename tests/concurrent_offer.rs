// Multi-producer offers racing through term rotations on one shared publication.
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use termlog::api::{
    AtomicCounter, FrameHeader, FrameIter, FrameType, HEADER_LENGTH, LogBuffers, LogConfig,
    NoopConductor, OfferError, PARTITION_COUNT, Publication, TermStatus,
};
use termlog::core::atomic_buffer::AtomicBuffer;
use termlog::core::descriptor::{TERM_MIN_LENGTH, tail_term_id, tail_term_offset};
use termlog::core::frame::align_frame_length;
use termlog::core::position;

const THREADS: usize = 8;
const PER_THREAD: usize = 200;
const PAYLOAD: usize = 64;
const INITIAL_TERM_ID: i32 = 100;

fn payload(thread: usize, seq: usize) -> [u8; PAYLOAD] {
    let mut buf = [0xEEu8; PAYLOAD];
    buf[0..4].copy_from_slice(&(thread as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&(seq as u32).to_le_bytes());
    buf
}

fn offer_until_done(publication: &Publication, bytes: &[u8]) -> i64 {
    loop {
        match publication.offer(bytes) {
            Ok(position) => return position,
            Err(OfferError::AdminAction) => thread::yield_now(),
            Err(err) => panic!("unexpected offer failure: {err}"),
        }
    }
}

#[test]
fn racing_producers_get_disjoint_frames_across_rotations() {
    let config = LogConfig::new(TERM_MIN_LENGTH, 4096)
        .with_initial_term_id(INITIAL_TERM_ID)
        .with_session_id(5)
        .with_stream_id(6);
    let log = Arc::new(LogBuffers::in_memory(&config).expect("log"));
    let limit = AtomicCounter::new(i64::MAX);
    let publication = Arc::new(
        Publication::new(
            Arc::new(NoopConductor),
            "ipc",
            1,
            6,
            5,
            Arc::new(limit),
            log.clone(),
        )
        .expect("publication"),
    );

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let publication = publication.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..PER_THREAD)
                    .map(|seq| offer_until_done(&publication, &payload(thread_id, seq)))
                    .collect::<Vec<i64>>()
            })
        })
        .collect();

    let mut all_positions = HashSet::new();
    for handle in handles {
        let positions = handle.join().expect("producer thread");
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        for position in positions {
            assert!(all_positions.insert(position), "position {position} handed out twice");
        }
    }
    assert_eq!(all_positions.len(), THREADS * PER_THREAD);

    // 1600 frames of 96 bytes span three terms without reusing a partition.
    let metadata = log.log_metadata();
    assert_eq!(metadata.active_term_id(), INITIAL_TERM_ID + 2);

    let mut seen = HashSet::new();
    let mut next_seq = [0usize; THREADS];
    for term_id in INITIAL_TERM_ID..=INITIAL_TERM_ID + 2 {
        let partition = position::partition_index(term_id, INITIAL_TERM_ID);
        assert_eq!(tail_term_id(log.raw_tail_volatile(partition)), term_id);
        let term = log.term_buffer(partition);

        let mut expected_offset = 0usize;
        let mut padded = false;
        for item in FrameIter::new(&term, 0) {
            let (offset, header) = item.expect("valid frame");
            assert_eq!(offset, expected_offset, "gap or overlap in term {term_id}");
            assert_eq!(header.term_id, term_id);
            expected_offset += header.frame_length as usize;
            if header.frame_type == FrameType::Pad {
                padded = true;
                continue;
            }
            assert_eq!(header.payload_length(), PAYLOAD);

            let mut body = [0u8; 8];
            term.get_bytes(offset + HEADER_LENGTH, &mut body);
            let thread_id = u32::from_le_bytes(body[0..4].try_into().expect("4 bytes")) as usize;
            let seq = u32::from_le_bytes(body[4..8].try_into().expect("4 bytes")) as usize;
            assert_eq!(seq, next_seq[thread_id], "thread {thread_id} out of order");
            next_seq[thread_id] += 1;
            assert!(seen.insert((thread_id, seq)));
        }
        if term_id < INITIAL_TERM_ID + 2 {
            assert!(padded, "term {term_id} should end in padding");
            assert_eq!(expected_offset, TERM_MIN_LENGTH);
        }
    }
    assert_eq!(seen.len(), THREADS * PER_THREAD);
    assert!(next_seq.iter().all(|count| *count == PER_THREAD));
}

#[test]
fn racing_claims_commit_disjoint_frames() {
    let config = LogConfig::new(TERM_MIN_LENGTH, 4096)
        .with_initial_term_id(0)
        .with_session_id(1);
    let log = Arc::new(LogBuffers::in_memory(&config).expect("log"));
    let publication = Arc::new(
        Publication::new(
            Arc::new(NoopConductor),
            "ipc",
            2,
            1,
            1,
            Arc::new(AtomicCounter::new(i64::MAX)),
            log.clone(),
        )
        .expect("publication"),
    );

    let handles: Vec<_> = (0..4)
        .map(|thread_id| {
            let publication = publication.clone();
            thread::spawn(move || {
                for seq in 0..100usize {
                    loop {
                        match publication.try_claim(PAYLOAD) {
                            Ok(mut claim) => {
                                claim.put_bytes(0, &payload(thread_id, seq));
                                claim.commit();
                                break;
                            }
                            Err(OfferError::AdminAction) => thread::yield_now(),
                            Err(err) => panic!("unexpected claim failure: {err}"),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("claimer thread");
    }

    let term = log.term_buffer(0);
    let data_frames = FrameIter::new(&term, 0)
        .map(|item| item.expect("valid frame"))
        .filter(|(_, header)| header.frame_type == FrameType::Data)
        .count();
    assert_eq!(data_frames, 400);
    assert_eq!(publication.position(), Ok(400 * 96));
}

const WRAP_INITIAL_TERM_ID: i32 = -3;
const WRAP_PER_THREAD: usize = 700;
const FRAME: i64 = 96;
// Each in-flight writer may pass the gate on a stale tail and land one frame past the limit.
const LIMIT_SLACK: i64 = THREADS as i64 * FRAME;

/// Lets the driver's limit cover the active term and the one after it, whose partition the driver
/// has already cleaned.
fn limit_for(active_term_id: i32) -> i64 {
    position::compute_term_begin_position(
        active_term_id + 2,
        position::position_bits_to_shift(TERM_MIN_LENGTH),
        WRAP_INITIAL_TERM_ID,
    ) - LIMIT_SLACK
}

fn tail_term_ids(log: &LogBuffers) -> [i32; PARTITION_COUNT] {
    [0, 1, 2].map(|index| tail_term_id(log.raw_tail_volatile(index)))
}

/// Waits for the frame at `offset` to be committed; every reserved slot of a retired term is.
fn committed_frame(term: &AtomicBuffer, offset: usize) -> FrameHeader {
    loop {
        if let Some(header) = FrameHeader::read_committed(term, offset).expect("valid header") {
            return header;
        }
        thread::yield_now();
    }
}

/// Walks `term` from 0 to `end`, checking the frames tile it exactly and all belong to `term_id`.
fn drain_term(term: &AtomicBuffer, term_id: i32, end: usize) -> Vec<(usize, usize)> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset < end {
        let header = committed_frame(term, offset);
        header.validate(TERM_MIN_LENGTH).expect("frame fits");
        assert_eq!(header.term_id, term_id, "frame at {offset} of term {term_id}");
        assert_eq!(header.term_offset as usize, offset);
        if header.frame_type == FrameType::Pad {
            assert_eq!(offset + header.frame_length as usize, TERM_MIN_LENGTH);
        } else {
            assert_eq!(header.payload_length(), PAYLOAD);
            let mut body = [0u8; 8];
            term.get_bytes(offset + HEADER_LENGTH, &mut body);
            let thread_id = u32::from_le_bytes(body[0..4].try_into().expect("4 bytes")) as usize;
            let seq = u32::from_le_bytes(body[4..8].try_into().expect("4 bytes")) as usize;
            messages.push((thread_id, seq));
        }
        offset += align_frame_length(header.frame_length as usize);
    }
    assert_eq!(offset, end, "term {term_id} overruns its tail");
    messages
}

#[derive(Default)]
struct DriverReport {
    terms: BTreeMap<i32, Vec<(usize, usize)>>,
    tails: [i32; PARTITION_COUNT],
    resets: usize,
}

impl DriverReport {
    fn observe_tails(&mut self, tails: [i32; PARTITION_COUNT]) {
        for (index, (seen, now)) in self.tails.iter_mut().zip(tails).enumerate() {
            if now != *seen {
                assert_eq!(now, *seen + 3, "partition {index} tail skipped a term");
                *seen = now;
                self.resets += 1;
            }
        }
    }
}

/// Frees back-pressured writers if the driver thread fails an assertion.
struct OpenLimitOnPanic(AtomicCounter);

impl Drop for OpenLimitOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.set_ordered(i64::MAX);
        }
    }
}

/// Driver duty cycle: verify and clean retired partitions, then advance the limit.
fn run_driver(log: &LogBuffers, limit: &AtomicCounter, done: &AtomicBool) -> DriverReport {
    let _guard = OpenLimitOnPanic(limit.clone());
    let mut report = DriverReport {
        tails: tail_term_ids(log),
        ..DriverReport::default()
    };
    loop {
        let finished = done.load(Ordering::Acquire);
        report.observe_tails(tail_term_ids(log));
        let active = log.log_metadata().active_term_id();
        for index in 0..PARTITION_COUNT {
            if log.term_status(index).expect("status") != TermStatus::NeedsCleaning {
                continue;
            }
            let retired = tail_term_id(log.raw_tail_volatile(index));
            assert!(retired < active, "partition {index} retired while term {retired} is live");
            if retired >= WRAP_INITIAL_TERM_ID {
                let messages = drain_term(&log.term_buffer(index), retired, TERM_MIN_LENGTH);
                assert!(report.terms.insert(retired, messages).is_none());
            }
            log.clean_partition(index);
        }
        limit.advance_to(limit_for(active));
        if finished {
            return report;
        }
        thread::yield_now();
    }
}

#[test]
fn racing_producers_reuse_cleaned_partitions() {
    let config = LogConfig::new(TERM_MIN_LENGTH, 4096)
        .with_initial_term_id(WRAP_INITIAL_TERM_ID)
        .with_session_id(9)
        .with_stream_id(4);
    let log = Arc::new(LogBuffers::in_memory(&config).expect("log"));
    let limit = AtomicCounter::new(limit_for(WRAP_INITIAL_TERM_ID));
    let publication = Arc::new(
        Publication::new(
            Arc::new(NoopConductor),
            "ipc",
            3,
            4,
            9,
            Arc::new(limit.clone()),
            log.clone(),
        )
        .expect("publication"),
    );

    let done = Arc::new(AtomicBool::new(false));
    let driver = {
        let (log, limit, done) = (log.clone(), limit.clone(), done.clone());
        thread::spawn(move || run_driver(&log, &limit, &done))
    };

    let barrier = Arc::new(Barrier::new(THREADS));
    let writers: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let publication = publication.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut positions = Vec::with_capacity(WRAP_PER_THREAD);
                for seq in 0..WRAP_PER_THREAD {
                    let bytes = payload(thread_id, seq);
                    loop {
                        match publication.offer(&bytes) {
                            Ok(position) => {
                                positions.push(position);
                                break;
                            }
                            Err(OfferError::AdminAction | OfferError::BackPressured) => {
                                thread::yield_now()
                            }
                            Err(err) => panic!("unexpected offer failure: {err}"),
                        }
                    }
                }
                positions
            })
        })
        .collect();

    let mut all_positions = HashSet::new();
    let mut writer_panicked = false;
    for handle in writers {
        match handle.join() {
            Ok(positions) => {
                assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
                for position in positions {
                    assert!(all_positions.insert(position), "position {position} handed out twice");
                }
            }
            Err(_) => writer_panicked = true,
        }
    }
    done.store(true, Ordering::Release);
    let mut report = driver.join().expect("driver thread");
    assert!(!writer_panicked, "producer thread failed");
    assert_eq!(all_positions.len(), THREADS * WRAP_PER_THREAD);

    // 682 frames of 96 bytes fill a term ahead of a 64-byte pad; 5600 frames reach a ninth term.
    let active = log.log_metadata().active_term_id();
    assert_eq!(active, WRAP_INITIAL_TERM_ID + 8);
    let retired: Vec<i32> = report.terms.keys().copied().collect();
    assert_eq!(retired, (WRAP_INITIAL_TERM_ID..active - 1).collect::<Vec<_>>());

    let tails = tail_term_ids(&log);
    report.observe_tails(tails);
    assert_eq!(report.resets, (active - WRAP_INITIAL_TERM_ID) as usize);

    for term_id in [active - 1, active] {
        let partition = position::partition_index(term_id, WRAP_INITIAL_TERM_ID);
        assert_eq!(tails[partition], term_id);
        let end = if term_id == active {
            let offset = tail_term_offset(log.raw_tail_volatile(partition), TERM_MIN_LENGTH);
            assert_eq!(offset as i64, (THREADS * WRAP_PER_THREAD - 8 * 682) as i64 * FRAME);
            offset as usize
        } else {
            TERM_MIN_LENGTH
        };
        let term = log.term_buffer(partition);
        let messages = drain_term(&term, term_id, end);
        let walked = FrameIter::new(&term, 0).with_term_id(term_id).count();
        assert_eq!(walked, messages.len() + usize::from(term_id != active));
        report.terms.insert(term_id, messages);
    }

    let mut next_seq = [0usize; THREADS];
    for (thread_id, seq) in report.terms.into_values().flatten() {
        assert_eq!(seq, next_seq[thread_id], "thread {thread_id} out of order");
        next_seq[thread_id] += 1;
    }
    assert!(next_seq.iter().all(|count| *count == WRAP_PER_THREAD));
}
