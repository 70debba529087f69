//! Autofire detection.
//!
//! Each playing seat's inputs are staged per seat and, once enough actions
//! have accumulated, handed to a fixed pool of scan threads. A scan looks for a
//! strictly alternating pattern of two action values with short, identical run
//! lengths, which is what a turbo button produces and a human thumb does not.
//!
//! Chunks are submitted without blocking: if every worker is busy and the
//! queue is full the chunk is dropped. A scan stops at its first hit, so a
//! chunk produces at most one report; later chunks are scanned afresh.

use crate::error::RoomError;
use crate::events::{Events, ServerEvent};
use crate::{RoomId, UserId};
use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const MAX_SENSITIVITY: u8 = 5;

/// `(max_delay, min_reps)` per sensitivity level. Level 0 disables detection.
const SENSITIVITY_TABLE: [(usize, usize); 6] = [(0, 0), (2, 13), (3, 11), (4, 9), (5, 7), (6, 5)];

/// Detection parameters for `sensitivity`, or `None` when disabled.
pub fn parameters(sensitivity: u8) -> Option<(usize, usize)> {
    match SENSITIVITY_TABLE.get(sensitivity as usize) {
        Some(&(0, _)) | None => None,
        Some(&params) => Some(params),
    }
}

/// Number of actions staged before a chunk is scanned.
pub fn chunk_actions(max_delay: usize, min_reps: usize) -> usize {
    (max_delay + 1) * 4 * min_reps
}

#[derive(Debug, Clone, Copy)]
struct Run<'a> {
    action: &'a [u8],
    len: usize,
}

impl Run<'_> {
    fn matches(&self, other: &Run<'_>) -> bool {
        self.len == other.len && self.action == other.action
    }
}

#[derive(Default)]
struct Pattern<'a> {
    a: Option<Run<'a>>,
    b: Option<Run<'a>>,
    previous: Option<Run<'a>>,
    expect_a: bool,
    reps: usize,
}

impl<'a> Pattern<'a> {
    /// Feeds one completed run and returns the current repetition count.
    fn push(&mut self, run: Run<'a>, max_delay: usize) -> usize {
        if run.len > max_delay {
            *self = Self::default();
            return 0;
        }

        match (self.a, self.b) {
            (None, _) => self.a = Some(run),
            (Some(_), None) => self.start_pair(run),
            (Some(a), Some(b)) => {
                let expected = if self.expect_a { a } else { b };
                if run.matches(&expected) {
                    if !self.expect_a {
                        self.reps += 1;
                    }
                    self.expect_a = !self.expect_a;
                } else {
                    // Restart with the last two runs as the candidate pair.
                    self.a = self.previous;
                    self.start_pair(run);
                }
            }
        }

        self.previous = Some(run);
        self.reps
    }

    fn start_pair(&mut self, run: Run<'a>) {
        self.b = Some(run);
        self.reps = 1;
        self.expect_a = true;
    }
}

/// Scans `chunk` for an alternating pattern.
///
/// Actions are `bytes_per_action` wide. Only completed runs count, so the
/// final run of the chunk is ignored.
pub fn scan(chunk: &[u8], bytes_per_action: usize, max_delay: usize, min_reps: usize) -> bool {
    if bytes_per_action == 0 || max_delay == 0 || min_reps == 0 {
        return false;
    }

    let mut actions = chunk.chunks_exact(bytes_per_action);
    let Some(first) = actions.next() else {
        return false;
    };

    let mut pattern = Pattern::default();
    let mut current = Run {
        action: first,
        len: 1,
    };
    for action in actions {
        if action == current.action {
            current.len += 1;
            continue;
        }
        if pattern.push(current, max_delay) >= min_reps {
            return true;
        }
        current = Run { action, len: 1 };
    }
    false
}

/// One staged chunk waiting for a scan thread.
pub struct ScanTask {
    room_id: RoomId,
    user_id: UserId,
    player_number: usize,
    chunk: Vec<u8>,
    bytes_per_action: usize,
    max_delay: usize,
    min_reps: usize,
    events: Events,
}

impl ScanTask {
    fn run(self) {
        if !scan(&self.chunk, self.bytes_per_action, self.max_delay, self.min_reps) {
            return;
        }

        info!(
            "Autofire detected in room {} for player {} (user {})",
            self.room_id, self.player_number, self.user_id
        );
        self.events.emit(ServerEvent::AutofireDetected {
            room_id: self.room_id,
            user_id: self.user_id,
            player_number: self.player_number,
        });
    }
}

/// Fixed pool of scan threads shared by every room.
pub struct ScanPool {
    sender: Option<Sender<ScanTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl ScanPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = bounded::<ScanTask>(queue_depth.max(1));
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("autofire-scan-{id}"))
                .spawn(move || {
                    for task in receiver.iter() {
                        task.run();
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to spawn autofire scan thread: {}", e),
            }
        }

        Self {
            sender: Some(sender),
            workers: handles,
        }
    }

    /// Queues `task` if there is room. Never blocks.
    pub fn submit(&self, task: ScanTask) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                debug!(
                    "Scan queue full, dropping chunk for player {} in room {}",
                    task.player_number, task.room_id
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for ScanPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain what is queued and exit.
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Autofire scan thread panicked");
            }
        }
    }
}

struct SeatScan {
    user_id: UserId,
    staging: Vec<u8>,
    bytes_per_action: usize,
}

/// Per-room detector feeding the shared [`ScanPool`].
pub struct AutofireDetector {
    room_id: RoomId,
    sensitivity: AtomicU8,
    pool: Arc<ScanPool>,
    events: Events,
    seats: Mutex<Vec<Option<SeatScan>>>,
}

impl AutofireDetector {
    pub fn new(room_id: RoomId, sensitivity: u8, pool: Arc<ScanPool>, events: Events) -> Self {
        Self {
            room_id,
            sensitivity: AtomicU8::new(sensitivity.min(MAX_SENSITIVITY)),
            pool,
            events,
            seats: Mutex::new(Vec::new()),
        }
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity.load(Ordering::Relaxed)
    }

    /// Changes the level. Staged actions are discarded so the next chunk is
    /// sized for the new parameters.
    pub fn set_sensitivity(&self, level: u8) -> Result<(), RoomError> {
        if level > MAX_SENSITIVITY {
            return Err(RoomError::InvalidSensitivity(level));
        }
        self.sensitivity.store(level, Ordering::Relaxed);
        for seat in self.seats.lock().iter_mut().flatten() {
            seat.staging.clear();
        }
        Ok(())
    }

    /// Begins tracking a new game; `players[i]` is player number `i + 1`.
    pub fn start(&self, players: &[UserId]) {
        let mut seats = self.seats.lock();
        *seats = players
            .iter()
            .map(|&user_id| {
                Some(SeatScan {
                    user_id,
                    staging: Vec::new(),
                    bytes_per_action: 0,
                })
            })
            .collect();
    }

    pub fn stop(&self) {
        self.seats.lock().clear();
    }

    pub fn stop_seat(&self, player_number: usize) {
        if let Some(seat) = self.seats.lock().get_mut(player_number - 1) {
            *seat = None;
        }
    }

    /// Stages `actions` from `player_number`, submitting a chunk when full.
    pub fn add_actions(&self, player_number: usize, actions: &[u8], bytes_per_action: usize) {
        let Some((max_delay, min_reps)) = parameters(self.sensitivity()) else {
            return;
        };
        if bytes_per_action == 0 {
            return;
        }

        let task = {
            let mut seats = self.seats.lock();
            let Some(Some(seat)) = seats.get_mut(player_number - 1) else {
                return;
            };
            if seat.bytes_per_action != bytes_per_action {
                seat.staging.clear();
                seat.bytes_per_action = bytes_per_action;
            }

            seat.staging.extend_from_slice(actions);
            let threshold = chunk_actions(max_delay, min_reps) * bytes_per_action;
            if seat.staging.len() < threshold {
                return;
            }

            ScanTask {
                room_id: self.room_id,
                user_id: seat.user_id,
                player_number,
                chunk: std::mem::replace(&mut seat.staging, Vec::with_capacity(threshold)),
                bytes_per_action,
                max_delay,
                min_reps,
                events: self.events.clone(),
            }
        };

        self.pool.submit(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `cycles` repetitions of `a` x `run` then `b` x `run`, one byte per action.
    fn alternating(a: u8, b: u8, run: usize, cycles: usize) -> Vec<u8> {
        let mut actions = Vec::new();
        for _ in 0..cycles {
            actions.extend(std::iter::repeat(a).take(run));
            actions.extend(std::iter::repeat(b).take(run));
        }
        actions
    }

    #[test]
    fn test_parameters_table() {
        assert_eq!(parameters(0), None);
        assert_eq!(parameters(1), Some((2, 13)));
        assert_eq!(parameters(5), Some((6, 5)));
        assert_eq!(parameters(6), None);
        assert_eq!(chunk_actions(2, 13), 156);
    }

    #[test]
    fn test_detects_turbo_pattern() {
        let mut chunk = alternating(1, 2, 2, 13);
        chunk.push(0);
        assert!(scan(&chunk, 1, 2, 13));
    }

    #[test]
    fn test_one_cycle_short_is_not_detected() {
        let mut chunk = alternating(1, 2, 2, 12);
        chunk.push(0);
        assert!(!scan(&chunk, 1, 2, 13));
    }

    #[test]
    fn test_final_run_is_ignored() {
        // The last B run never completes, so only 12 full cycles count.
        let chunk = alternating(1, 2, 2, 13);
        assert!(!scan(&chunk, 1, 2, 13));
    }

    #[test]
    fn test_long_runs_reset() {
        let mut chunk = alternating(1, 2, 3, 20);
        chunk.push(0);
        assert!(!scan(&chunk, 1, 2, 5));
        assert!(scan(&chunk, 1, 3, 5));
    }

    #[test]
    fn test_irregular_runs_are_not_detected() {
        let mut chunk = Vec::new();
        for i in 0..40 {
            chunk.extend(std::iter::repeat(1).take(1 + i % 2));
            chunk.extend(std::iter::repeat(2).take(1 + (i / 2) % 2));
        }
        chunk.push(0);
        assert!(!scan(&chunk, 1, 2, 13));
    }

    #[test]
    fn test_pattern_after_noise() {
        let mut chunk = vec![5, 5, 7, 9, 9, 9, 9];
        chunk.extend(alternating(1, 2, 1, 6));
        chunk.push(0);
        assert!(scan(&chunk, 1, 4, 5));
    }

    #[test]
    fn test_multi_byte_actions() {
        let mut chunk = Vec::new();
        for _ in 0..8 {
            chunk.extend_from_slice(&[0x10, 0x00, 0x10, 0x00]);
            chunk.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        }
        chunk.extend_from_slice(&[0xFF, 0xFF]);
        assert!(scan(&chunk, 2, 6, 5));
        assert!(!scan(&chunk, 2, 6, 9));
    }

    fn detector(sensitivity: u8) -> (AutofireDetector, Arc<ScanPool>, crate::events::EventReceiver) {
        let (events, rx) = Events::channel();
        let pool = Arc::new(ScanPool::new(1, 16));
        (AutofireDetector::new(3, sensitivity, pool.clone(), events), pool, rx)
    }

    fn drain(rx: &mut crate::events::EventReceiver) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_detector_reports_each_turbo_chunk() {
        let (detector, pool, mut rx) = detector(1);
        detector.start(&[40, 41]);

        // Turbo, a clean chunk, then turbo again from player 2.
        let mut turbo = alternating(1, 2, 2, 13);
        turbo.resize(156, 0);
        detector.add_actions(2, &turbo, 1);
        detector.add_actions(2, &[0; 156], 1);
        detector.add_actions(2, &turbo, 1);
        drop(detector);
        drop(pool);

        let detected = ServerEvent::AutofireDetected {
            room_id: 3,
            user_id: 41,
            player_number: 2,
        };
        assert_eq!(drain(&mut rx), vec![detected.clone(), detected]);
    }

    #[test]
    fn test_one_report_per_chunk() {
        let (detector, pool, mut rx) = detector(1);
        detector.start(&[40]);

        // Two turbo bursts inside a single chunk still make one report.
        let mut actions = alternating(1, 2, 2, 13);
        actions.push(0);
        actions.extend(alternating(3, 4, 1, 13));
        actions.push(0);
        actions.resize(156, 0);
        detector.add_actions(1, &actions, 1);
        drop(detector);
        drop(pool);

        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_detector_disabled_at_zero() {
        let (detector, pool, mut rx) = detector(0);
        detector.start(&[40]);
        let mut actions = alternating(1, 2, 2, 30);
        actions.resize(400, 0);
        detector.add_actions(1, &actions, 1);
        drop(detector);
        drop(pool);

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_detector_waits_for_full_chunk() {
        let (detector, pool, mut rx) = detector(1);
        detector.start(&[40]);
        let mut actions = alternating(1, 2, 2, 13);
        actions.push(0);
        detector.add_actions(1, &actions, 1);
        drop(detector);
        drop(pool);

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_set_sensitivity_bounds() {
        let (detector, _pool, _rx) = detector(0);
        assert_eq!(detector.set_sensitivity(6), Err(RoomError::InvalidSensitivity(6)));
        assert!(detector.set_sensitivity(5).is_ok());
        assert_eq!(detector.sensitivity(), 5);
    }
}
