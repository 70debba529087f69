//! User and room registry for the relay server
//!
//! This module is the server's single source of truth for who is connected
//! and which rooms exist:
//! - User lifecycle (allocate on handshake, login, keepalive, removal)
//! - Room lifecycle (create, join, leave, close)
//! - Routing of game operations from a user to the room they sit in
//!
//! Everything here is safe to call from any thread. The registry locks are
//! never held while a room blocks on input, so a slow game cannot stall the
//! lobby.

use crate::autofire::ScanPool;
use crate::config::ServerConfig;
use crate::error::RoomError;
use crate::events::{Events, ServerEvent};
use crate::room::{LeaveOutcome, Room, SeatInfo, StartInfo};
use crate::{RoomId, UserId};
use log::info;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ids 0 and 0xFFFF are never handed out.
const RESERVED_ID: u16 = 0xFFFF;

/// A connected user
///
/// Users exist from the moment the handshake assigns them a session port.
/// Until login completes they have no name and do not appear in listings.
#[derive(Debug, Clone)]
pub struct User {
    /// Unique id assigned by the server
    pub id: UserId,
    /// Address the handshake came from
    pub addr: SocketAddr,
    pub name: String,
    /// Emulator name; seats in one room must all share it
    pub client_type: String,
    pub connection_type: u8,
    /// Average round trip measured during login, in milliseconds
    pub ping: u32,
    pub room: Option<RoomId>,
    pub logged_in: bool,
    /// Elevated users may start rooms they do not own
    pub elevated: bool,
    /// Last time any datagram arrived from this user
    pub last_seen: Instant,
}

impl User {
    pub fn new(id: UserId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            name: String::new(),
            client_type: String::new(),
            connection_type: protocol::CONNECTION_LAN,
            ping: 0,
            room: None,
            logged_in: false,
            elevated: false,
            last_seen: Instant::now(),
        }
    }

    /// Returns true if nothing has arrived from this user within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    fn seat_info(&self) -> SeatInfo {
        SeatInfo {
            user_id: self.id,
            user_name: self.name.clone(),
            ping: self.ping,
            connection_type: self.connection_type,
            client_type: self.client_type.clone(),
        }
    }
}

/// A user leaving a room, with what happened to the room as a result
#[derive(Clone)]
pub struct Departure {
    pub room: Arc<Room>,
    pub outcome: LeaveOutcome,
}

/// Hands out the next free id after `counter`, skipping reserved values.
fn next_free_id(counter: &mut u16, in_use: impl Fn(u16) -> bool) -> Option<u16> {
    for _ in 0..u16::MAX {
        *counter = counter.wrapping_add(1);
        if *counter == 0 || *counter == RESERVED_ID {
            continue;
        }
        if !in_use(*counter) {
            return Some(*counter);
        }
    }
    None
}

/// Tracks every user and room on the server
///
/// Rooms are shared as `Arc<Room>` so game traffic can run against a room
/// without holding any registry lock.
pub struct Registry {
    config: ServerConfig,
    events: Events,
    scan_pool: Arc<ScanPool>,
    users: RwLock<HashMap<UserId, User>>,
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    next_user_id: Mutex<u16>,
    next_room_id: Mutex<u16>,
}

impl Registry {
    /// Creates an empty registry and starts the autofire scan threads
    pub fn new(config: ServerConfig, events: Events) -> Self {
        let scan_pool = Arc::new(ScanPool::new(
            config.game.scan_worker_count(),
            config.game.scan_queue_depth,
        ));
        Self {
            config,
            events,
            scan_pool,
            users: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            next_user_id: Mutex::new(0),
            next_room_id: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registers a new connection
    ///
    /// Fails with [`RoomError::ServerFull`] when `max_users` are connected.
    pub fn add_user(&self, addr: SocketAddr) -> Result<UserId, RoomError> {
        let mut users = self.users.write();
        if users.len() >= self.config.max_users {
            return Err(RoomError::ServerFull);
        }
        let id = next_free_id(&mut self.next_user_id.lock(), |id| users.contains_key(&id))
            .ok_or(RoomError::ServerFull)?;
        users.insert(id, User::new(id, addr));
        info!("User {} connected from {}", id, addr);
        Ok(id)
    }

    /// Completes login with the client's details and measured ping
    pub fn login(
        &self,
        user_id: UserId,
        name: String,
        client_type: String,
        connection_type: u8,
        ping: u32,
    ) -> Result<User, RoomError> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id)
            .ok_or(RoomError::NoSuchUser(user_id))?;
        user.name = name;
        user.client_type = client_type;
        user.connection_type = connection_type;
        user.ping = ping;
        user.logged_in = true;
        info!(
            "User {} logged in as {} ({}, ping {}ms)",
            user_id, user.name, user.client_type, ping
        );
        Ok(user.clone())
    }

    /// Records activity from `user_id`
    pub fn touch(&self, user_id: UserId) {
        if let Some(user) = self.users.write().get_mut(&user_id) {
            user.last_seen = Instant::now();
        }
    }

    pub fn set_elevated(&self, user_id: UserId, elevated: bool) {
        if let Some(user) = self.users.write().get_mut(&user_id) {
            user.elevated = elevated;
        }
    }

    /// Removes a user, taking them out of their room first
    pub fn remove_user(&self, user_id: UserId) -> Option<(User, Option<Departure>)> {
        let departure = self.leave_room(user_id).ok();
        let user = self.users.write().remove(&user_id)?;
        info!("User {} disconnected", user_id);
        Some((user, departure))
    }

    /// Users that have been silent longer than the keepalive timeout
    pub fn check_timeouts(&self) -> Vec<UserId> {
        let timeout = self.config.keepalive_timeout();
        self.users
            .read()
            .values()
            .filter(|user| user.is_timed_out(timeout))
            .map(|user| user.id)
            .collect()
    }

    pub fn user(&self, user_id: UserId) -> Option<User> {
        self.users.read().get(&user_id).cloned()
    }

    /// Logged-in users, in id order
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .read()
            .values()
            .filter(|u| u.logged_in)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Number of connections, logged in or not
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    pub fn room(&self, room_id: RoomId) -> Option<Arc<Room>> {
        self.rooms.read().get(&room_id).cloned()
    }

    /// Open rooms, in id order
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        let mut rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        rooms.sort_by_key(|r| r.id());
        rooms
    }

    /// The room `user_id` is seated in
    pub fn room_of(&self, user_id: UserId) -> Result<Arc<Room>, RoomError> {
        let room_id = self
            .user(user_id)
            .ok_or(RoomError::NoSuchUser(user_id))?
            .room
            .ok_or(RoomError::NotInRoom)?;
        self.room(room_id).ok_or(RoomError::NoSuchRoom(room_id))
    }

    fn set_user_room(&self, user_id: UserId, room: Option<RoomId>) {
        if let Some(user) = self.users.write().get_mut(&user_id) {
            user.room = room;
        }
    }

    /// Opens a room owned by `user_id`
    pub fn create_room(&self, user_id: UserId, rom_name: String) -> Result<Arc<Room>, RoomError> {
        let owner = self.user(user_id).ok_or(RoomError::NoSuchUser(user_id))?;
        if owner.room.is_some() {
            return Err(RoomError::AlreadyInRoom);
        }

        let room = {
            let mut rooms = self.rooms.write();
            let room_id = next_free_id(&mut self.next_room_id.lock(), |id| rooms.contains_key(&id))
                .ok_or(RoomError::ServerFull)?;
            let room = Arc::new(Room::new(
                room_id,
                owner.seat_info(),
                rom_name,
                self.config.game.clone(),
                self.scan_pool.clone(),
                self.events.clone(),
            ));
            rooms.insert(room_id, room.clone());
            room
        };

        self.set_user_room(user_id, Some(room.id()));
        info!("{} created room {} for {}", owner.name, room.id(), room.rom_name());
        self.events.emit(ServerEvent::RoomCreated {
            room_id: room.id(),
            owner: user_id,
        });
        Ok(room)
    }

    /// Seats `user_id` in `room_id`. Returns the room and the seat number.
    pub fn join_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
        connection_type: u8,
    ) -> Result<(Arc<Room>, usize), RoomError> {
        let user = self.user(user_id).ok_or(RoomError::NoSuchUser(user_id))?;
        if user.room.is_some() {
            return Err(RoomError::AlreadyInRoom);
        }
        let room = self.room(room_id).ok_or(RoomError::NoSuchRoom(room_id))?;

        let info = SeatInfo {
            connection_type,
            ..user.seat_info()
        };
        let seat = room.join(info)?;
        if let Some(user) = self.users.write().get_mut(&user_id) {
            user.room = Some(room_id);
            user.connection_type = connection_type;
        }
        Ok((room, seat))
    }

    pub fn start_room(&self, user_id: UserId) -> Result<(Arc<Room>, StartInfo), RoomError> {
        let elevated = self.user(user_id).map(|u| u.elevated).unwrap_or(false);
        let room = self.room_of(user_id)?;
        let info = room.start(user_id, elevated)?;
        Ok((room, info))
    }

    /// Returns the room and whether every seat is now ready
    pub fn ready_seat(&self, user_id: UserId) -> Result<(Arc<Room>, bool), RoomError> {
        let room = self.room_of(user_id)?;
        let all_ready = room.ready(user_id)?;
        Ok((room, all_ready))
    }

    /// Submits input and blocks until the merged step is available
    pub fn submit_input(&self, user_id: UserId, data: &[u8]) -> Result<Vec<u8>, RoomError> {
        let room = self.room_of(user_id)?;
        room.submit_input(user_id, data)
    }

    /// Returns the room and the dropped player number
    pub fn drop_seat(&self, user_id: UserId) -> Result<(Arc<Room>, usize), RoomError> {
        let room = self.room_of(user_id)?;
        let player_number = room.drop_player(user_id)?;
        Ok((room, player_number))
    }

    /// Takes `user_id` out of their room, closing it if they own it
    pub fn leave_room(&self, user_id: UserId) -> Result<Departure, RoomError> {
        let room = self.room_of(user_id)?;
        let outcome = room.leave(user_id)?;
        self.settle_departure(&room, user_id, &outcome);
        Ok(Departure { room, outcome })
    }

    /// Owner-only removal of `target` from the owner's room
    pub fn kick_seat(&self, requester: UserId, target: UserId) -> Result<Departure, RoomError> {
        let room = self.room_of(requester)?;
        let outcome = room.kick(requester, target)?;
        self.settle_departure(&room, target, &outcome);
        Ok(Departure { room, outcome })
    }

    fn settle_departure(&self, room: &Room, user_id: UserId, outcome: &LeaveOutcome) {
        match outcome {
            LeaveOutcome::Left { .. } => self.set_user_room(user_id, None),
            LeaveOutcome::Closed { members } => {
                for &member in members {
                    self.set_user_room(member, None);
                }
                self.rooms.write().remove(&room.id());
                self.events.emit(ServerEvent::RoomClosed { room_id: room.id() });
            }
        }
    }

    pub fn set_sensitivity(&self, user_id: UserId, level: u8) -> Result<(), RoomError> {
        self.room_of(user_id)?.set_autofire_sensitivity(user_id, level)
    }

    pub fn set_same_delay(&self, user_id: UserId, enabled: bool) -> Result<(), RoomError> {
        self.room_of(user_id)?.set_same_delay(user_id, enabled)
    }
}

/// Tests for user and room bookkeeping
///
/// Game synchronization itself is covered in the room module; these focus on
/// ids, membership, and routing.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomStatus;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn registry(max_users: usize) -> Registry {
        let mut config = ServerConfig {
            max_users,
            ..ServerConfig::default()
        };
        config.game.scan_workers = 1;
        config.game.timeout_millis = 20;
        let (events, _rx) = Events::channel();
        Registry::new(config, events)
    }

    fn logged_in(registry: &Registry, name: &str) -> UserId {
        let id = registry.add_user(test_addr()).unwrap();
        registry
            .login(id, name.to_string(), "emu".to_string(), 1, 30)
            .unwrap();
        id
    }

    #[test]
    fn test_next_free_id_skips_reserved_and_used() {
        let mut counter = 0xFFFE;
        assert_eq!(next_free_id(&mut counter, |_| false), Some(1));

        let mut counter = 0;
        assert_eq!(next_free_id(&mut counter, |id| id < 3), Some(3));
        assert_eq!(next_free_id(&mut counter, |_| true), None);
    }

    #[test]
    fn test_capacity() {
        let registry = registry(2);
        registry.add_user(test_addr()).unwrap();
        registry.add_user(test_addr()).unwrap();
        assert_eq!(registry.add_user(test_addr()), Err(RoomError::ServerFull));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_listing_shows_only_logged_in() {
        let registry = registry(10);
        registry.add_user(test_addr()).unwrap();
        let bob = logged_in(&registry, "bob");

        let users = registry.users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, bob);
        assert_eq!(users[0].ping, 30);
    }

    #[test]
    fn test_create_and_join() {
        let registry = registry(10);
        let alice = logged_in(&registry, "alice");
        let bob = logged_in(&registry, "bob");

        let room = registry.create_room(alice, "Game".into()).unwrap();
        assert_eq!(
            registry.create_room(alice, "Other".into()).err(),
            Some(RoomError::AlreadyInRoom)
        );

        let (joined, seat) = registry.join_room(bob, room.id(), 1).unwrap();
        assert_eq!(joined.id(), room.id());
        assert_eq!(seat, 2);
        assert_eq!(registry.user(bob).unwrap().room, Some(room.id()));
        assert_eq!(
            registry.join_room(bob, 999, 1).err(),
            Some(RoomError::AlreadyInRoom)
        );
    }

    #[test]
    fn test_join_missing_room() {
        let registry = registry(10);
        let bob = logged_in(&registry, "bob");
        assert_eq!(
            registry.join_room(bob, 42, 1).err(),
            Some(RoomError::NoSuchRoom(42))
        );
    }

    #[test]
    fn test_owner_leaving_closes_room() {
        let registry = registry(10);
        let alice = logged_in(&registry, "alice");
        let bob = logged_in(&registry, "bob");
        let room = registry.create_room(alice, "Game".into()).unwrap();
        registry.join_room(bob, room.id(), 1).unwrap();

        let departure = registry.leave_room(alice).unwrap();
        assert_eq!(
            departure.outcome,
            LeaveOutcome::Closed {
                members: vec![alice, bob]
            }
        );
        assert!(registry.room(room.id()).is_none());
        assert_eq!(registry.user(bob).unwrap().room, None);
        assert_eq!(registry.room_of(bob).err(), Some(RoomError::NotInRoom));
    }

    #[test]
    fn test_remove_user_leaves_room() {
        let registry = registry(10);
        let alice = logged_in(&registry, "alice");
        let bob = logged_in(&registry, "bob");
        let room = registry.create_room(alice, "Game".into()).unwrap();
        registry.join_room(bob, room.id(), 1).unwrap();
        registry.start_room(alice).unwrap();

        let (user, departure) = registry.remove_user(bob).unwrap();
        assert_eq!(user.name, "bob");
        let departure = departure.unwrap();
        assert_eq!(departure.outcome, LeaveOutcome::Left { dropped: Some(2) });
        assert_eq!(room.members(), vec![alice]);
        assert_eq!(room.status(), RoomStatus::Synchronizing);
        assert!(registry.user(bob).is_none());
    }

    #[test]
    fn test_start_requires_owner_unless_elevated() {
        let registry = registry(10);
        let alice = logged_in(&registry, "alice");
        let bob = logged_in(&registry, "bob");
        let room = registry.create_room(alice, "Game".into()).unwrap();
        registry.join_room(bob, room.id(), 1).unwrap();

        assert_eq!(registry.start_room(bob).err(), Some(RoomError::NotOwner));
        registry.set_elevated(bob, true);
        let (_, info) = registry.start_room(bob).unwrap();
        assert_eq!(info.num_players, 2);
    }

    #[test]
    fn test_kick_clears_membership() {
        let registry = registry(10);
        let alice = logged_in(&registry, "alice");
        let bob = logged_in(&registry, "bob");
        let room = registry.create_room(alice, "Game".into()).unwrap();
        registry.join_room(bob, room.id(), 1).unwrap();

        assert_eq!(registry.kick_seat(bob, alice).err(), Some(RoomError::NotOwner));
        let departure = registry.kick_seat(alice, bob).unwrap();
        assert_eq!(departure.outcome, LeaveOutcome::Left { dropped: None });
        assert_eq!(registry.user(bob).unwrap().room, None);
    }

    #[test]
    fn test_sensitivity_routing() {
        let registry = registry(10);
        let alice = logged_in(&registry, "alice");
        let room = registry.create_room(alice, "Game".into()).unwrap();
        registry.set_sensitivity(alice, 3).unwrap();
        assert_eq!(room.autofire_sensitivity(), 3);
        assert_eq!(
            registry.set_sensitivity(alice, 9),
            Err(RoomError::InvalidSensitivity(9))
        );
    }

    #[test]
    fn test_timeouts() {
        let registry = registry(10);
        let alice = logged_in(&registry, "alice");
        assert!(registry.check_timeouts().is_empty());

        if let Some(user) = registry.users.write().get_mut(&alice) {
            user.last_seen = Instant::now()
                .checked_sub(Duration::from_secs(91))
                .expect("clock too young for test");
        }
        assert_eq!(registry.check_timeouts(), vec![alice]);
        registry.touch(alice);
        assert!(registry.check_timeouts().is_empty());
    }
}
