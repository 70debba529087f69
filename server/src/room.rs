//! Room synchronization engine.
//!
//! A room owns an ordered list of seats, the game status, and while a game is
//! running one [`ActionQueue`] per playing seat. Its central job is the merge:
//! every seat submits one message of input per step and receives the inputs
//! of all seats for that step, in seat order.
//!
//! Room state sits behind a single mutex that is never held while a merge read
//! blocks on another seat's queue. Readers work on cloned queue handles, and
//! timeout accounting re-enters the lock for each report.
//!
//! ## Status
//!
//! ```text
//! Waiting --start--> Synchronizing --all ready--> Playing
//!    ^                     |                         |
//!    +-------- last playing seat drops -------------+
//! ```

use crate::action_queue::{ActionQueue, PlayerTimeout, ReadOutcome};
use crate::autofire::{AutofireDetector, ScanPool};
use crate::config::GameConfig;
use crate::error::RoomError;
use crate::events::{DesyncReason, Events, ServerEvent};
use crate::{RoomId, UserId};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// A lagging-player notice is emitted every this many timeouts.
pub const LAG_NOTICE_INTERVAL: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Waiting,
    Synchronizing,
    Playing,
}

impl RoomStatus {
    /// Status byte carried in game listings and status notifications.
    pub fn wire_value(self) -> u8 {
        match self {
            RoomStatus::Waiting => 0,
            RoomStatus::Playing => 1,
            RoomStatus::Synchronizing => 2,
        }
    }
}

/// What a room needs to know about a seated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatInfo {
    pub user_id: UserId,
    pub user_name: String,
    pub ping: u32,
    pub connection_type: u8,
    pub client_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedSeat {
    pub user_id: UserId,
    pub player_number: usize,
    pub frame_delay: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInfo {
    pub num_players: usize,
    pub room_delay: u16,
    pub seats: Vec<StartedSeat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The user left; `dropped` is their player number if they were playing.
    Left { dropped: Option<usize> },
    /// The owner left and the room closed; `members` were still seated.
    Closed { members: Vec<UserId> },
}

struct Seat {
    info: SeatInfo,
    player_number: Option<usize>,
    playing: bool,
    frame_delay: u16,
}

struct RoomState {
    status: RoomStatus,
    seats: Vec<Seat>,
    queues: Vec<Arc<ActionQueue>>,
    timeout_counts: Vec<u32>,
    synched: bool,
    actions_per_message: usize,
    same_delay: bool,
    closed: bool,
}

impl RoomState {
    fn seat_index(&self, user_id: UserId) -> Result<usize, RoomError> {
        self.seats
            .iter()
            .position(|s| s.info.user_id == user_id)
            .ok_or(RoomError::NotInRoom)
    }

    fn synched_queues(&self) -> usize {
        self.queues.iter().filter(|q| q.is_synched()).count()
    }

    fn desync_all(&mut self) {
        for queue in &self.queues {
            queue.set_synched(false);
        }
        self.synched = false;
    }
}

/// Frames of delay a seat needs to hide its round trip.
pub fn frame_delay(ping_ms: u32, connection_type: u8) -> u16 {
    let frames = connection_type.clamp(protocol::CONNECTION_LAN, protocol::CONNECTION_BAD);
    let frame_ms = 1000.0 / 60.0 * f64::from(frames);
    let delay = (f64::from(ping_ms) / frame_ms).ceil() as u16;
    delay.max(1)
}

pub struct Room {
    id: RoomId,
    rom_name: String,
    client_type: String,
    owner: UserId,
    config: GameConfig,
    events: Events,
    autofire: AutofireDetector,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(
        id: RoomId,
        owner: SeatInfo,
        rom_name: String,
        config: GameConfig,
        pool: Arc<ScanPool>,
        events: Events,
    ) -> Self {
        let autofire =
            AutofireDetector::new(id, config.autofire_sensitivity, pool, events.clone());
        Self {
            id,
            rom_name,
            client_type: owner.client_type.clone(),
            owner: owner.user_id,
            autofire,
            events,
            state: Mutex::new(RoomState {
                status: RoomStatus::Waiting,
                seats: vec![Seat {
                    info: owner,
                    player_number: None,
                    playing: false,
                    frame_delay: 1,
                }],
                queues: Vec::new(),
                timeout_counts: Vec::new(),
                synched: false,
                actions_per_message: 1,
                same_delay: config.same_delay,
                closed: false,
            }),
            config,
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn rom_name(&self) -> &str {
        &self.rom_name
    }

    pub fn client_type(&self) -> &str {
        &self.client_type
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn max_seats(&self) -> usize {
        self.config.max_seats
    }

    pub fn status(&self) -> RoomStatus {
        self.state.lock().status
    }

    pub fn is_synched(&self) -> bool {
        self.state.lock().synched
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn same_delay(&self) -> bool {
        self.state.lock().same_delay
    }

    pub fn autofire_sensitivity(&self) -> u8 {
        self.autofire.sensitivity()
    }

    /// Seats in order.
    pub fn seats(&self) -> Vec<SeatInfo> {
        self.state.lock().seats.iter().map(|s| s.info.clone()).collect()
    }

    pub fn members(&self) -> Vec<UserId> {
        self.state.lock().seats.iter().map(|s| s.info.user_id).collect()
    }

    pub fn num_seats(&self) -> usize {
        self.state.lock().seats.len()
    }

    pub fn player_number(&self, user_id: UserId) -> Option<usize> {
        let state = self.state.lock();
        let index = state.seat_index(user_id).ok()?;
        state.seats[index].player_number
    }

    pub fn is_playing(&self, user_id: UserId) -> bool {
        let state = self.state.lock();
        state
            .seat_index(user_id)
            .map(|i| state.seats[i].playing)
            .unwrap_or(false)
    }

    /// Whether player `player_number`'s queue is synchronized.
    pub fn is_seat_synched(&self, player_number: usize) -> bool {
        self.state
            .lock()
            .queues
            .get(player_number.wrapping_sub(1))
            .map(|q| q.is_synched())
            .unwrap_or(false)
    }

    fn set_status(&self, state: &mut RoomState, status: RoomStatus) {
        if state.status == status {
            return;
        }
        debug!("Room {} status {:?} -> {:?}", self.id, state.status, status);
        state.status = status;
        self.events.emit(ServerEvent::RoomStatusChanged {
            room_id: self.id,
            status,
        });
    }

    /// Seats `info` at the end of the seat list. Returns the seat number.
    pub fn join(&self, info: SeatInfo) -> Result<usize, RoomError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RoomError::NoSuchRoom(self.id));
        }
        if state.seat_index(info.user_id).is_ok() {
            return Err(RoomError::AlreadyInRoom);
        }
        if state.status != RoomStatus::Waiting {
            return Err(RoomError::AlreadyStarted);
        }
        if state.seats.len() >= self.config.max_seats {
            return Err(RoomError::RoomFull);
        }

        debug!("{} joined room {}", info.user_name, self.id);
        state.seats.push(Seat {
            info,
            player_number: None,
            playing: false,
            frame_delay: 1,
        });
        Ok(state.seats.len())
    }

    /// Starts a game with every seated user.
    ///
    /// Only the owner (or an elevated user) may start, only from `Waiting`,
    /// and every seat must share the owner's connection and client type.
    pub fn start(&self, requester: UserId, elevated: bool) -> Result<StartInfo, RoomError> {
        let mut state = self.state.lock();
        if requester != self.owner && !elevated {
            return Err(RoomError::NotOwner);
        }
        if state.status != RoomStatus::Waiting {
            return Err(RoomError::AlreadyStarted);
        }
        if state.seats.len() < 2 && !self.config.allow_single_player {
            return Err(RoomError::NotEnoughPlayers);
        }

        let owner_index = state.seat_index(self.owner)?;
        let connection_type = state.seats[owner_index].info.connection_type;
        for seat in &state.seats {
            if seat.info.connection_type != connection_type {
                return Err(RoomError::Mismatch {
                    user_name: seat.info.user_name.clone(),
                    what: "connection type",
                });
            }
            if seat.info.client_type != self.client_type {
                return Err(RoomError::Mismatch {
                    user_name: seat.info.user_name.clone(),
                    what: "emulator",
                });
            }
        }

        let num_players = state.seats.len();
        state.actions_per_message = usize::from(connection_type.max(protocol::CONNECTION_LAN));
        state.queues = state
            .seats
            .iter()
            .enumerate()
            .map(|(i, seat)| {
                Arc::new(ActionQueue::new(
                    i + 1,
                    seat.info.user_id,
                    num_players,
                    self.config.buffer_size,
                    self.config.read_timeout(),
                ))
            })
            .collect();
        state.timeout_counts = vec![0; num_players];
        state.synched = false;

        let room_delay = state
            .seats
            .iter()
            .map(|s| frame_delay(s.info.ping, s.info.connection_type))
            .max()
            .unwrap_or(1);
        let same_delay = state.same_delay;

        let mut seats = Vec::with_capacity(num_players);
        for (i, seat) in state.seats.iter_mut().enumerate() {
            seat.player_number = Some(i + 1);
            seat.playing = true;
            seat.frame_delay = if same_delay {
                room_delay
            } else {
                frame_delay(seat.info.ping, seat.info.connection_type)
            };
            seats.push(StartedSeat {
                user_id: seat.info.user_id,
                player_number: i + 1,
                frame_delay: seat.frame_delay,
            });
        }

        let players: Vec<UserId> = seats.iter().map(|s| s.user_id).collect();
        self.autofire.start(&players);

        info!(
            "Room {} starting {} with {} players, delay {}",
            self.id, self.rom_name, num_players, room_delay
        );
        self.events.emit(ServerEvent::GameStarted {
            room_id: self.id,
            num_players,
        });
        self.set_status(&mut state, RoomStatus::Synchronizing);

        Ok(StartInfo {
            num_players,
            room_delay,
            seats,
        })
    }

    /// Marks `user_id`'s seat ready. Returns true once every playing seat is
    /// ready and the game has begun.
    pub fn ready(&self, user_id: UserId) -> Result<bool, RoomError> {
        let mut state = self.state.lock();
        if state.status != RoomStatus::Synchronizing {
            return Err(RoomError::NotSynchronizing);
        }
        let index = state.seat_index(user_id)?;
        let seat = &state.seats[index];
        let player_number = match (seat.playing, seat.player_number) {
            (true, Some(n)) => n,
            _ => return Err(RoomError::SeatNotPlaying),
        };

        state.queues[player_number - 1].set_synched(true);
        Ok(self.check_all_ready(&mut state))
    }

    fn check_all_ready(&self, state: &mut RoomState) -> bool {
        if state.status != RoomStatus::Synchronizing {
            return false;
        }
        let mut playing = state
            .seats
            .iter()
            .filter(|s| s.playing)
            .filter_map(|s| s.player_number)
            .peekable();
        if playing.peek().is_none() {
            return false;
        }
        let queues = &state.queues;
        if !playing.all(|n| queues[n - 1].is_synched()) {
            return false;
        }

        state.synched = true;
        info!("Room {}: all players ready", self.id);
        self.events.emit(ServerEvent::AllSeatsReady { room_id: self.id });
        self.set_status(state, RoomStatus::Playing);
        true
    }

    /// Submits one message of input for `user_id` and returns the merged
    /// inputs of every seat for the same step.
    ///
    /// Blocks while other seats lag. Each read that times out is reported
    /// through [`Room::handle_timeout`] and retried until the lagging seat
    /// writes or is desynchronized.
    pub fn submit_input(&self, user_id: UserId, data: &[u8]) -> Result<Vec<u8>, RoomError> {
        let (player_number, queues, actions_per_message) = {
            let mut state = self.state.lock();
            if state.status != RoomStatus::Playing {
                return Err(RoomError::NotPlaying);
            }
            let index = state.seat_index(user_id)?;
            let seat = &state.seats[index];
            let player_number = match (seat.playing, seat.player_number) {
                (true, Some(n)) => n,
                _ => return Err(RoomError::SeatNotPlaying),
            };
            if !state.synched || !state.queues[player_number - 1].is_synched() {
                return Err(RoomError::Desynched);
            }
            let apm = state.actions_per_message;
            if data.is_empty() || data.len() % apm != 0 {
                return Err(RoomError::InvalidInput {
                    length: data.len(),
                    actions: apm,
                });
            }
            state.timeout_counts[player_number - 1] = 0;
            (player_number, state.queues.clone(), apm)
        };

        let bytes_per_action = data.len() / actions_per_message;
        queues[player_number - 1].write(data);
        self.autofire
            .add_actions(player_number, data, bytes_per_action);

        let mut merged = vec![0u8; queues.len() * data.len()];
        let mut ordinal = 0u32;
        for action in 0..actions_per_message {
            for (slot, queue) in queues.iter().enumerate() {
                let offset = (action * queues.len() + slot) * bytes_per_action;
                let dest = &mut merged[offset..offset + bytes_per_action];
                loop {
                    match queue.read(player_number, dest) {
                        Ok(ReadOutcome::Filled | ReadOutcome::Desynced) => break,
                        Err(timeout) => {
                            ordinal += 1;
                            if !self.handle_timeout(timeout.with_ordinal(ordinal)) {
                                return Err(RoomError::Desynched);
                            }
                        }
                    }
                }
            }
        }

        if !self.is_synched() {
            return Err(RoomError::Desynched);
        }
        Ok(merged)
    }

    /// Accounts for one timed-out read. Returns whether the room is still
    /// synchronized.
    ///
    /// A report identical to the queue's last one, or for a queue that is
    /// already desynchronized, is ignored.
    pub fn handle_timeout(&self, timeout: PlayerTimeout) -> bool {
        let mut state = self.state.lock();
        let index = timeout.player_number.wrapping_sub(1);
        let Some(queue) = state.queues.get(index).cloned() else {
            return state.synched;
        };
        if !queue.is_synched() || queue.last_timeout() == Some(timeout) {
            return state.synched;
        }

        queue.set_last_timeout(timeout);
        self.events.emit(ServerEvent::PlayerTimeout {
            room_id: self.id,
            user_id: timeout.user_id,
            player_number: timeout.player_number,
            ordinal: timeout.ordinal,
        });

        state.timeout_counts[index] += 1;
        let count = state.timeout_counts[index];
        if count % LAG_NOTICE_INTERVAL == 0 {
            debug!(
                "Room {}: player {} has {} consecutive timeouts",
                self.id, timeout.player_number, count
            );
            self.events.emit(ServerEvent::PlayerLagging {
                room_id: self.id,
                user_id: timeout.user_id,
                player_number: timeout.player_number,
                timeouts: count,
            });
        }

        if count >= self.config.desynch_timeouts {
            warn!(
                "Room {}: player {} desynched after {} timeouts",
                self.id, timeout.player_number, count
            );
            queue.set_synched(false);
            self.events.emit(ServerEvent::PlayerDesynced {
                room_id: self.id,
                user_id: timeout.user_id,
                player_number: timeout.player_number,
                reason: DesyncReason::Lagging { timeouts: count },
            });
            self.check_quorum(&mut state);
        }

        state.synched
    }

    /// Desynchronizes the whole room once fewer than two seats remain in sync.
    fn check_quorum(&self, state: &mut RoomState) {
        if !state.synched || state.synched_queues() >= 2 {
            return;
        }
        self.desync_room(state);
    }

    fn desync_room(&self, state: &mut RoomState) {
        warn!("Room {} desynched: not enough synchronized players", self.id);
        for seat in &state.seats {
            let Some(n) = seat.player_number else { continue };
            if state.queues[n - 1].is_synched() {
                self.events.emit(ServerEvent::PlayerDesynced {
                    room_id: self.id,
                    user_id: seat.info.user_id,
                    player_number: n,
                    reason: DesyncReason::NotEnoughPlayers,
                });
            }
        }
        state.desync_all();
        self.events.emit(ServerEvent::RoomDesynced { room_id: self.id });
    }

    /// Removes `user_id` from the running game. Returns their player number.
    pub fn drop_player(&self, user_id: UserId) -> Result<usize, RoomError> {
        let mut state = self.state.lock();
        if state.status == RoomStatus::Waiting {
            return Err(RoomError::NotPlaying);
        }
        let index = state.seat_index(user_id)?;
        self.drop_seat(&mut state, index)
    }

    fn drop_seat(&self, state: &mut RoomState, index: usize) -> Result<usize, RoomError> {
        let seat = &mut state.seats[index];
        let player_number = match (seat.playing, seat.player_number) {
            (true, Some(n)) => n,
            _ => return Err(RoomError::SeatNotPlaying),
        };
        seat.playing = false;
        let user_id = seat.info.user_id;

        state.queues[player_number - 1].set_synched(false);
        self.autofire.stop_seat(player_number);
        info!("Room {}: player {} dropped", self.id, player_number);
        self.events.emit(ServerEvent::PlayerDropped {
            room_id: self.id,
            user_id,
            player_number,
        });

        let playing = state.seats.iter().filter(|s| s.playing).count();
        if playing == 0 {
            self.finish_game(state);
        } else if state.status == RoomStatus::Synchronizing {
            // A multi-seat game cannot begin with a single seat left.
            if state.queues.len() >= 2 && playing < 2 {
                self.desync_room(state);
                self.finish_game(state);
            } else {
                self.check_all_ready(state);
            }
        } else {
            self.check_quorum(state);
        }
        Ok(player_number)
    }

    fn finish_game(&self, state: &mut RoomState) {
        state.desync_all();
        state.queues.clear();
        state.timeout_counts.clear();
        for seat in &mut state.seats {
            seat.player_number = None;
            seat.playing = false;
        }
        self.autofire.stop();
        self.set_status(state, RoomStatus::Waiting);
    }

    /// Removes `user_id` from the room, dropping them from any running game.
    ///
    /// The owner leaving closes the room.
    pub fn leave(&self, user_id: UserId) -> Result<LeaveOutcome, RoomError> {
        let mut state = self.state.lock();
        let index = state.seat_index(user_id)?;

        if user_id == self.owner {
            let members = self.close_locked(&mut state);
            return Ok(LeaveOutcome::Closed { members });
        }

        let dropped = if state.seats[index].playing {
            self.drop_seat(&mut state, index).ok()
        } else {
            None
        };
        state.seats.remove(index);
        Ok(LeaveOutcome::Left { dropped })
    }

    /// Owner-only removal of another seat.
    pub fn kick(&self, requester: UserId, target: UserId) -> Result<LeaveOutcome, RoomError> {
        if requester != self.owner {
            return Err(RoomError::NotOwner);
        }
        if target == self.owner {
            return Err(RoomError::CannotKickOwner);
        }
        self.leave(target)
    }

    /// Ends any running game and empties the room. Returns who was seated.
    pub fn close(&self) -> Vec<UserId> {
        let mut state = self.state.lock();
        self.close_locked(&mut state)
    }

    fn close_locked(&self, state: &mut RoomState) -> Vec<UserId> {
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        if state.status != RoomStatus::Waiting {
            self.finish_game(state);
        }
        info!("Room {} closed", self.id);
        state.seats.drain(..).map(|s| s.info.user_id).collect()
    }

    pub fn set_autofire_sensitivity(&self, requester: UserId, level: u8) -> Result<(), RoomError> {
        if requester != self.owner {
            return Err(RoomError::NotOwner);
        }
        self.autofire.set_sensitivity(level)
    }

    /// Takes effect at the next start.
    pub fn set_same_delay(&self, requester: UserId, enabled: bool) -> Result<(), RoomError> {
        if requester != self.owner {
            return Err(RoomError::NotOwner);
        }
        self.state.lock().same_delay = enabled;
        Ok(())
    }
}
