//! Notifications the synchronization core emits for outer layers.
//!
//! Rooms and autofire workers run on blocking threads, so events travel over an
//! unbounded tokio channel whose `send` never blocks or awaits. Whoever owns
//! the receiving end (the network layer's event pump, statistics, admin
//! tooling) decides what to do with them; the core never waits for a consumer.

use crate::room::RoomStatus;
use crate::{RoomId, UserId};
use log::{debug, trace};
use std::fmt;
use tokio::sync::mpsc;

/// Why a seat lost synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncReason {
    /// The seat reached the consecutive-timeout threshold.
    Lagging { timeouts: u32 },
    /// Too few synchronized seats remained to keep the room running.
    NotEnoughPlayers,
}

impl fmt::Display for DesyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesyncReason::Lagging { timeouts } => {
                write!(f, "{timeouts} consecutive input timeouts")
            }
            DesyncReason::NotEnoughPlayers => write!(f, "fewer than two synchronized players"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    RoomCreated {
        room_id: RoomId,
        owner: UserId,
    },
    RoomClosed {
        room_id: RoomId,
    },
    RoomStatusChanged {
        room_id: RoomId,
        status: RoomStatus,
    },
    GameStarted {
        room_id: RoomId,
        num_players: usize,
    },
    AllSeatsReady {
        room_id: RoomId,
    },
    PlayerDropped {
        room_id: RoomId,
        user_id: UserId,
        player_number: usize,
    },
    PlayerTimeout {
        room_id: RoomId,
        user_id: UserId,
        player_number: usize,
        ordinal: u32,
    },
    PlayerLagging {
        room_id: RoomId,
        user_id: UserId,
        player_number: usize,
        timeouts: u32,
    },
    PlayerDesynced {
        room_id: RoomId,
        user_id: UserId,
        player_number: usize,
        reason: DesyncReason,
    },
    RoomDesynced {
        room_id: RoomId,
    },
    AutofireDetected {
        room_id: RoomId,
        user_id: UserId,
        player_number: usize,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// Cloneable sending half handed to every room and scan worker.
#[derive(Debug, Clone)]
pub struct Events {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Events {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ServerEvent) {
        trace!("event: {:?}", event);
        if let Err(e) = self.tx.send(event) {
            debug!("No event consumer, dropped {:?}", e.0);
        }
    }
}
