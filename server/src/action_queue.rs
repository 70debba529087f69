//! Per-seat action queue.
//!
//! Each seat owns one fixed-capacity byte ring. The seat's own session is the
//! only writer; every seat in the room (including the owner) is a consumer with
//! an independent read cursor. Reads block until the requested number of bytes
//! is available, the configured timeout elapses, or the queue is
//! desynchronized.
//!
//! Cursors are monotonic byte counts rather than positions inside the ring, so
//! a full ring is distinguishable from an empty one: writing exactly
//! `capacity` bytes leaves `capacity` bytes readable.

use crate::UserId;
use log::warn;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A read gave up waiting on a lagging seat.
///
/// `ordinal` is stamped by the reader with its own merge step so the room can
/// tell repeated reports of the same stall apart from a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerTimeout {
    pub player_number: usize,
    pub user_id: UserId,
    pub ordinal: u32,
}

impl PlayerTimeout {
    pub fn with_ordinal(self, ordinal: u32) -> Self {
        Self { ordinal, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The destination holds the next bytes from the queue.
    Filled,
    /// The queue is desynchronized and had too little data; the destination
    /// was left untouched.
    Desynced,
}

struct QueueState {
    data: Box<[u8]>,
    tail: u64,
    heads: Vec<u64>,
    synched: bool,
    last_timeout: Option<PlayerTimeout>,
}

impl QueueState {
    fn available(&self, consumer: usize) -> usize {
        (self.tail - self.heads[consumer]) as usize
    }

    fn copy_out(&mut self, consumer: usize, dest: &mut [u8]) {
        let capacity = self.data.len();
        let start = (self.heads[consumer] % capacity as u64) as usize;
        let first = dest.len().min(capacity - start);
        dest[..first].copy_from_slice(&self.data[start..start + first]);
        let rest = dest.len() - first;
        dest[first..].copy_from_slice(&self.data[..rest]);
        self.heads[consumer] += dest.len() as u64;
    }
}

pub struct ActionQueue {
    player_number: usize,
    user_id: UserId,
    capacity: usize,
    timeout: Duration,
    state: Mutex<QueueState>,
    readable: Condvar,
}

impl ActionQueue {
    /// Creates an unsynchronized queue with one read cursor per consumer.
    ///
    /// Consumers are addressed by player number, `1..=consumers`.
    pub fn new(
        player_number: usize,
        user_id: UserId,
        consumers: usize,
        capacity: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            player_number,
            user_id,
            capacity,
            timeout,
            state: Mutex::new(QueueState {
                data: vec![0; capacity].into_boxed_slice(),
                tail: 0,
                heads: vec![0; consumers],
                synched: false,
                last_timeout: None,
            }),
            readable: Condvar::new(),
        }
    }

    pub fn player_number(&self) -> usize {
        self.player_number
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_synched(&self) -> bool {
        self.state.lock().synched
    }

    /// Changes the synchronization flag.
    ///
    /// Desynchronizing wakes every blocked reader. Setting the current value
    /// again is a no-op.
    pub fn set_synched(&self, synched: bool) {
        let mut state = self.state.lock();
        if state.synched == synched {
            return;
        }
        state.synched = synched;
        if !synched {
            self.readable.notify_all();
        }
    }

    /// Bytes `consumer` could read right now.
    pub fn available(&self, consumer: usize) -> usize {
        self.state.lock().available(consumer - 1)
    }

    pub fn last_timeout(&self) -> Option<PlayerTimeout> {
        self.state.lock().last_timeout
    }

    pub fn set_last_timeout(&self, timeout: PlayerTimeout) {
        self.state.lock().last_timeout = Some(timeout);
    }

    /// Appends `actions` and wakes blocked readers.
    ///
    /// Writes to a desynchronized queue are discarded. A consumer that falls
    /// more than `capacity` bytes behind skips ahead to the oldest retained
    /// byte.
    pub fn write(&self, actions: &[u8]) {
        let mut state = self.state.lock();
        if !state.synched {
            return;
        }

        let capacity = self.capacity;
        // Only the newest `capacity` bytes of an oversized write survive.
        let skipped = actions.len().saturating_sub(capacity);
        state.tail += skipped as u64;
        for &byte in &actions[skipped..] {
            let index = (state.tail % capacity as u64) as usize;
            state.data[index] = byte;
            state.tail += 1;
        }

        let oldest = state.tail.saturating_sub(capacity as u64);
        let player_number = self.player_number;
        for (consumer, head) in state.heads.iter_mut().enumerate() {
            if *head < oldest {
                warn!(
                    "Player {} overran consumer {} by {} bytes",
                    player_number,
                    consumer + 1,
                    oldest - *head
                );
                *head = oldest;
            }
        }

        state.last_timeout = None;
        self.readable.notify_all();
    }

    /// Fills `dest` with `consumer`'s next bytes.
    ///
    /// Waits up to the queue's timeout for enough data. Returns
    /// [`ReadOutcome::Desynced`] without touching `dest` if the queue is (or
    /// becomes) desynchronized before enough data arrives, and a
    /// [`PlayerTimeout`] if the deadline passes first.
    ///
    /// # Panics
    ///
    /// If `consumer` is not a player number this queue was created for.
    pub fn read(&self, consumer: usize, dest: &mut [u8]) -> Result<ReadOutcome, PlayerTimeout> {
        let index = consumer - 1;
        let wanted = dest.len();
        let mut state = self.state.lock();

        if state.available(index) < wanted && state.synched {
            let deadline = Instant::now() + self.timeout;
            while state.available(index) < wanted && state.synched {
                if self.readable.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }

        if state.available(index) >= wanted {
            state.copy_out(index, dest);
            return Ok(ReadOutcome::Filled);
        }
        if !state.synched {
            return Ok(ReadOutcome::Desynced);
        }
        Err(PlayerTimeout {
            player_number: self.player_number,
            user_id: self.user_id,
            ordinal: 0,
        })
    }
}
