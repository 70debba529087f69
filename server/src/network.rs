//! Server network layer handling the connect port, per-user sessions, and
//! delivery of room events to clients

use crate::config::ServerConfig;
use crate::data_cache::SessionCaches;
use crate::error::{RoomError, ServerError};
use crate::events::{EventReceiver, Events, ServerEvent};
use crate::registry::{Departure, Registry, User};
use crate::room::{LeaveOutcome, Room, StartInfo};
use crate::{RoomId, UserId};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use protocol::handshake::PROTOCOL_VERSION;
use protocol::{
    pack, unpack, Body, ConnectMessage, FormatError, GameSummary, Message, PlayerSummary,
    UserStatus, USER_STATUS_IDLE, USER_STATUS_PLAYING,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};

/// Name used for server-originated chat and information lines.
const SERVER_NAME: &str = "Server";

const RECV_BUFFER_LEN: usize = 4096;

/// Messages sent from background tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    UserTimeout { user_id: UserId },
}

/// Owner commands typed into room chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomCommand {
    DetectAutofire(u8),
    SameDelay(bool),
}

impl RoomCommand {
    /// Parses `/detectautofire <0-5>` and `/samedelay <on|off>`.
    ///
    /// Returns `None` for anything else, including malformed arguments.
    pub fn parse(message: &str) -> Option<Self> {
        let mut words = message.split_whitespace();
        let command = words.next()?;
        let argument = words.next()?;
        if words.next().is_some() {
            return None;
        }
        match command.to_ascii_lowercase().as_str() {
            "/detectautofire" => argument.parse().ok().map(RoomCommand::DetectAutofire),
            "/samedelay" => match argument.to_ascii_lowercase().as_str() {
                "on" | "true" => Some(RoomCommand::SameDelay(true)),
                "off" | "false" => Some(RoomCommand::SameDelay(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Outgoing message numbering and resend window for one session
struct Outbound {
    next_number: u16,
    recent: VecDeque<Message>,
    window: usize,
    limit: usize,
}

impl Outbound {
    fn new(window: usize, limit: usize) -> Self {
        Self {
            next_number: 0,
            recent: VecDeque::with_capacity(window),
            window,
            limit,
        }
    }

    /// Numbers `body` and returns a datagram carrying it plus the window.
    fn push(&mut self, body: Body) -> Result<Vec<u8>, FormatError> {
        let message = Message::new(self.next_number, body)?;
        self.next_number = self.next_number.wrapping_add(1);
        self.recent.push_front(message);
        self.recent.truncate(self.window);
        Ok(pack(self.recent.make_contiguous(), self.limit))
    }
}

/// One user's dedicated socket and outgoing state
pub struct Session {
    user_id: UserId,
    socket: Arc<UdpSocket>,
    peer: Mutex<SocketAddr>,
    outbound: Mutex<Outbound>,
    caches: Mutex<SessionCaches>,
    /// Set once the user has been told their input was refused
    input_notice_sent: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Session {
    fn new(user_id: UserId, socket: UdpSocket, peer: SocketAddr, config: &ServerConfig) -> Self {
        Self {
            user_id,
            socket: Arc::new(socket),
            peer: Mutex::new(peer),
            outbound: Mutex::new(Outbound::new(config.resend_window, config.max_bundle_bytes)),
            caches: Mutex::new(SessionCaches::default()),
            input_notice_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub async fn send(&self, body: Body) {
        let kind = body.message_type();
        let (datagram, peer) = {
            let mut outbound = self.outbound.lock();
            match outbound.push(body) {
                Ok(datagram) => (datagram, *self.peer.lock()),
                Err(e) => {
                    error!("Refusing to send invalid {} to user {}: {}", kind.name(), self.user_id, e);
                    return;
                }
            }
        };

        trace!("-> user {}: {}", self.user_id, kind.name());
        if let Err(e) = self.socket.send_to(&datagram, peer).await {
            warn!("Failed to send {} to user {} at {}: {}", kind.name(), self.user_id, peer, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    fn reset_for_game(&self) {
        self.caches.lock().reset();
        self.input_notice_sent.store(false, Ordering::Relaxed);
    }
}

/// State shared by the connect loop, every session task, and the event pump
pub struct ServerContext {
    registry: Registry,
    sessions: RwLock<HashMap<UserId, Arc<Session>>>,
}

impl ServerContext {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn config(&self) -> &ServerConfig {
        self.registry.config()
    }

    fn session(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.read().get(&user_id).cloned()
    }

    fn user_name(&self, user_id: UserId) -> String {
        self.registry
            .user(user_id)
            .map(|u| u.name)
            .unwrap_or_else(|| format!("user {user_id}"))
    }

    async fn send_to(&self, user_id: UserId, body: Body) {
        if let Some(session) = self.session(user_id) {
            session.send(body).await;
        }
    }

    /// Sends `body` to every logged-in user
    async fn broadcast(&self, body: Body) {
        for user in self.registry.users() {
            self.send_to(user.id, body.clone()).await;
        }
    }

    async fn broadcast_room(&self, room: &Room, body: Body) {
        for member in room.members() {
            self.send_to(member, body.clone()).await;
        }
    }

    /// Server chat line to everyone in `room_id`
    async fn announce(&self, room_id: RoomId, message: String) {
        if let Some(room) = self.registry.room(room_id) {
            info!("Room {}: {}", room_id, message);
            self.broadcast_room(
                &room,
                Body::GameChatNotification {
                    user_name: SERVER_NAME.to_string(),
                    message,
                },
            )
            .await;
        }
    }

    async fn inform(&self, user_id: UserId, message: String) {
        self.send_to(
            user_id,
            Body::InformationMessage {
                source: SERVER_NAME.to_string(),
                message,
            },
        )
        .await;
    }

    fn game_status(room: &Room) -> Body {
        Body::GameStatus {
            game_id: room.id(),
            val1: 0,
            status: room.status().wire_value(),
            num_players: room.num_seats().min(0xFF) as u8,
            max_players: room.max_seats().min(0xFF) as u8,
        }
    }

    /// Lobby snapshot for a newly logged-in user, leaving them out
    fn server_status(&self, exclude: UserId) -> Body {
        let users = self
            .registry
            .users()
            .into_iter()
            .filter(|u| u.id != exclude)
            .map(|u| {
                let playing = u
                    .room
                    .and_then(|id| self.registry.room(id))
                    .map(|room| room.is_playing(u.id))
                    .unwrap_or(false);
                UserStatus {
                    name: u.name,
                    ping: u.ping,
                    status: if playing {
                        USER_STATUS_PLAYING
                    } else {
                        USER_STATUS_IDLE
                    },
                    user_id: u.id,
                    connection_type: u.connection_type,
                }
            })
            .collect();

        let games = self
            .registry
            .rooms()
            .iter()
            .map(|room| GameSummary {
                rom_name: room.rom_name().to_string(),
                game_id: u32::from(room.id()),
                client_type: room.client_type().to_string(),
                owner: self.user_name(room.owner()),
                players: format!("{}/{}", room.num_seats(), room.max_seats()),
                status: room.status().wire_value(),
            })
            .collect();

        Body::ServerStatus { users, games }
    }

    /// Tells a new seat who is already there and tells the room about them
    async fn announce_join(&self, user: &User, room: &Room, connection_type: u8) {
        let players = room
            .seats()
            .into_iter()
            .filter(|s| s.user_id != user.id)
            .map(|s| PlayerSummary {
                name: s.user_name,
                ping: s.ping,
                user_id: s.user_id,
                connection_type: s.connection_type,
            })
            .collect();
        self.send_to(user.id, Body::PlayerInformation { players })
            .await;

        self.broadcast_room(
            room,
            Body::JoinGameNotification {
                game_id: room.id(),
                val1: 0,
                user_name: user.name.clone(),
                ping: user.ping,
                user_id: user.id,
                connection_type,
            },
        )
        .await;
        self.broadcast(Self::game_status(room)).await;
    }

    async fn announce_departure(&self, user_name: &str, user_id: UserId, departure: Departure) {
        let room = departure.room;
        match departure.outcome {
            LeaveOutcome::Left { dropped } => {
                if let Some(player_number) = dropped {
                    self.broadcast_room(
                        &room,
                        Body::PlayerDropNotification {
                            user_name: user_name.to_string(),
                            player_number: player_number as u8,
                        },
                    )
                    .await;
                }
                let quit = Body::QuitGameNotification {
                    user_name: user_name.to_string(),
                    user_id,
                };
                self.broadcast_room(&room, quit.clone()).await;
                self.send_to(user_id, quit).await;
                self.broadcast(Self::game_status(&room)).await;
            }
            LeaveOutcome::Closed { members } => {
                let quit = Body::QuitGameNotification {
                    user_name: user_name.to_string(),
                    user_id,
                };
                for member in members {
                    self.send_to(member, quit.clone()).await;
                }
                self.broadcast(Body::CloseGame {
                    game_id: room.id(),
                    val1: 0,
                })
                .await;
            }
        }
    }

    async fn start_game(&self, info: StartInfo) {
        for seat in &info.seats {
            if let Some(session) = self.session(seat.user_id) {
                session.reset_for_game();
                session
                    .send(Body::StartGameNotification {
                        frame_delay: seat.frame_delay,
                        player_number: seat.player_number as u8,
                        num_players: info.num_players as u8,
                    })
                    .await;
            }
        }
    }

    /// Removes a user, leaving their room and telling the lobby
    pub async fn disconnect(&self, user_id: UserId, message: &str) {
        let session = self.sessions.write().remove(&user_id);
        if let Some(session) = session {
            session.close();
        }

        let Some((user, departure)) = self.registry.remove_user(user_id) else {
            return;
        };
        info!("{} (user {}) left: {}", user.name, user_id, message);
        if let Some(departure) = departure {
            self.announce_departure(&user.name, user_id, departure).await;
        }
        if user.logged_in {
            self.broadcast(Body::QuitNotification {
                user_name: user.name,
                user_id,
                message: message.to_string(),
            })
            .await;
        }
    }

    /// Turns one room event into client notifications
    async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::AllSeatsReady { room_id } => {
                if let Some(room) = self.registry.room(room_id) {
                    for member in room.members() {
                        if room.is_playing(member) {
                            self.send_to(member, Body::AllReady).await;
                        }
                    }
                }
            }
            ServerEvent::RoomStatusChanged { room_id, status } => {
                debug!("Room {} is now {:?}", room_id, status);
                if let Some(room) = self.registry.room(room_id) {
                    self.broadcast(Self::game_status(&room)).await;
                }
            }
            ServerEvent::PlayerLagging {
                room_id,
                user_id,
                player_number,
                timeouts,
            } => {
                let name = self.user_name(user_id);
                self.announce(
                    room_id,
                    format!("{name} (player {player_number}) is lagging: {timeouts} timeouts"),
                )
                .await;
            }
            ServerEvent::PlayerDesynced {
                room_id,
                user_id,
                player_number,
                reason,
            } => {
                let name = self.user_name(user_id);
                self.announce(
                    room_id,
                    format!("{name} (player {player_number}) desynched: {reason}"),
                )
                .await;
            }
            ServerEvent::RoomDesynced { room_id } => {
                self.announce(
                    room_id,
                    "Game desynched. Drop and restart the game to continue.".to_string(),
                )
                .await;
            }
            ServerEvent::AutofireDetected {
                room_id,
                user_id,
                player_number,
            } => {
                let name = self.user_name(user_id);
                self.announce(
                    room_id,
                    format!("{name} (player {player_number}) appears to be using autofire"),
                )
                .await;
            }
            ServerEvent::PlayerTimeout {
                room_id,
                player_number,
                ordinal,
                ..
            } => {
                trace!(
                    "Room {}: timeout #{} waiting on player {}",
                    room_id,
                    ordinal,
                    player_number
                );
            }
            ServerEvent::RoomCreated { room_id, owner } => {
                info!("Room {} created by user {}", room_id, owner);
            }
            ServerEvent::RoomClosed { room_id } => {
                info!("Room {} closed", room_id);
            }
            ServerEvent::GameStarted {
                room_id,
                num_players,
            } => {
                info!("Room {} started a game with {} players", room_id, num_players);
            }
            ServerEvent::PlayerDropped {
                room_id,
                user_id,
                player_number,
            } => {
                info!(
                    "Room {}: user {} dropped as player {}",
                    room_id, user_id, player_number
                );
            }
        }
    }
}

enum LoginState {
    AwaitingInformation,
    Measuring {
        user_name: String,
        client_type: String,
        connection_type: u8,
        sent_at: Instant,
        round_trips: Vec<Duration>,
    },
    LoggedIn,
}

/// Receive loop and message dispatch for one user
struct SessionTask {
    ctx: Arc<ServerContext>,
    session: Arc<Session>,
    last_accepted: u16,
    login: LoginState,
}

impl SessionTask {
    fn new(ctx: Arc<ServerContext>, session: Arc<Session>) -> Self {
        Self {
            ctx,
            session,
            last_accepted: 0xFFFF,
            login: LoginState::AwaitingInformation,
        }
    }

    fn user_id(&self) -> UserId {
        self.session.user_id
    }

    async fn run(mut self) {
        let socket = Arc::clone(&self.session.socket);
        let session = Arc::clone(&self.session);
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];

        while !session.is_closed() {
            tokio::select! {
                _ = session.shutdown.notified() => break,
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((len, addr)) => {
                        *session.peer.lock() = addr;
                        self.ctx.registry.touch(self.user_id());
                        self.handle_datagram(&buffer[..len]).await;
                    }
                    Err(e) => {
                        warn!("Receive error on session for user {}: {}", self.user_id(), e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
        debug!("Session for user {} ended", self.user_id());
    }

    async fn handle_datagram(&mut self, datagram: &[u8]) {
        let messages = match unpack(datagram, self.last_accepted) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Discarding datagram from user {}: {}", self.user_id(), e);
                return;
            }
        };

        for message in messages {
            self.last_accepted = message.number;
            trace!("<- user {}: {}", self.user_id(), message.message_type().name());
            self.handle_message(message.body).await;
            if self.session.is_closed() {
                break;
            }
        }
    }

    async fn handle_message(&mut self, body: Body) {
        match body {
            Body::UserInformation {
                user_name,
                client_type,
                connection_type,
            } => self.begin_login(user_name, client_type, connection_type).await,
            Body::ClientAck => self.record_ack().await,
            Body::KeepAlive { .. } => {}
            Body::QuitRequest { message } => {
                self.ctx.disconnect(self.user_id(), &message).await;
            }
            body if !matches!(self.login, LoginState::LoggedIn) => {
                warn!(
                    "User {} sent {} before logging in",
                    self.user_id(),
                    body.message_type().name()
                );
            }
            body => self.handle_logged_in(body).await,
        }
    }

    async fn begin_login(&mut self, user_name: String, client_type: String, connection_type: u8) {
        if !matches!(self.login, LoginState::AwaitingInformation) {
            debug!("User {} repeated login information", self.user_id());
            return;
        }
        self.login = LoginState::Measuring {
            user_name,
            client_type,
            connection_type,
            sent_at: Instant::now(),
            round_trips: Vec::new(),
        };
        self.session.send(Body::ServerAck).await;
    }

    async fn record_ack(&mut self) {
        let wanted = self.ctx.config().login_ack_count;
        let LoginState::Measuring {
            sent_at,
            round_trips,
            ..
        } = &mut self.login
        else {
            return;
        };

        round_trips.push(sent_at.elapsed());
        if round_trips.len() < wanted {
            *sent_at = Instant::now();
            self.session.send(Body::ServerAck).await;
            return;
        }

        let total: Duration = round_trips.iter().sum();
        let ping = (total / round_trips.len() as u32).as_millis() as u32;
        let state = std::mem::replace(&mut self.login, LoginState::LoggedIn);
        if let LoginState::Measuring {
            user_name,
            client_type,
            connection_type,
            ..
        } = state
        {
            self.complete_login(user_name, client_type, connection_type, ping)
                .await;
        }
    }

    async fn complete_login(
        &mut self,
        user_name: String,
        client_type: String,
        connection_type: u8,
        ping: u32,
    ) {
        let user_id = self.user_id();
        let user = match self
            .ctx
            .registry
            .login(user_id, user_name, client_type, connection_type, ping)
        {
            Ok(user) => user,
            Err(e) => {
                warn!("Login failed for user {}: {}", user_id, e);
                return;
            }
        };

        self.session.send(self.ctx.server_status(user_id)).await;
        self.ctx
            .broadcast(Body::UserJoined {
                user_name: user.name.clone(),
                user_id,
                ping,
                connection_type,
            })
            .await;
        for line in &self.ctx.config().welcome_messages {
            self.ctx.inform(user_id, line.clone()).await;
        }
    }

    async fn refuse(&self, action: &str, error: RoomError) {
        debug!("User {} could not {}: {}", self.user_id(), action, error);
        self.ctx
            .inform(self.user_id(), format!("Could not {action}: {error}"))
            .await;
    }

    async fn handle_logged_in(&mut self, body: Body) {
        let user_id = self.user_id();
        let registry = &self.ctx.registry;

        match body {
            Body::ChatRequest { message } => {
                let user_name = self.ctx.user_name(user_id);
                self.ctx
                    .broadcast(Body::ChatNotification { user_name, message })
                    .await;
            }
            Body::CreateGameRequest { rom_name } => {
                match registry.create_room(user_id, rom_name) {
                    Ok(room) => {
                        let Some(user) = registry.user(user_id) else { return };
                        self.ctx
                            .broadcast(Body::CreateGameNotification {
                                user_name: user.name.clone(),
                                rom_name: room.rom_name().to_string(),
                                client_type: room.client_type().to_string(),
                                game_id: room.id(),
                                val1: 0,
                            })
                            .await;
                        self.ctx
                            .announce_join(&user, &room, user.connection_type)
                            .await;
                    }
                    Err(e) => self.refuse("create a game", e).await,
                }
            }
            Body::JoinGameRequest {
                game_id,
                connection_type,
            } => match registry.join_room(user_id, game_id, connection_type) {
                Ok((room, _)) => {
                    if let Some(user) = registry.user(user_id) {
                        self.ctx.announce_join(&user, &room, connection_type).await;
                    }
                }
                Err(e) => self.refuse("join the game", e).await,
            },
            Body::QuitGameRequest => match registry.leave_room(user_id) {
                Ok(departure) => {
                    let user_name = self.ctx.user_name(user_id);
                    self.ctx
                        .announce_departure(&user_name, user_id, departure)
                        .await;
                }
                Err(e) => self.refuse("leave the game", e).await,
            },
            Body::StartGameRequest => match registry.start_room(user_id) {
                Ok((_, info)) => self.ctx.start_game(info).await,
                Err(e) => self.refuse("start the game", e).await,
            },
            Body::AllReady => {
                if let Err(e) = registry.ready_seat(user_id) {
                    debug!("Ignoring ready from user {}: {}", user_id, e);
                }
            }
            Body::GameData { data } => {
                self.session.caches.lock().inbound.insert(data.clone());
                self.submit_input(data).await;
            }
            Body::CachedGameData { key } => {
                let data = self.session.caches.lock().inbound.get(key).map(<[u8]>::to_vec);
                match data {
                    Some(data) => self.submit_input(data).await,
                    None => warn!("User {} referenced empty cache slot {}", user_id, key),
                }
            }
            Body::PlayerDropRequest => match registry.drop_seat(user_id) {
                Ok((room, player_number)) => {
                    let user_name = self.ctx.user_name(user_id);
                    self.ctx
                        .broadcast_room(
                            &room,
                            Body::PlayerDropNotification {
                                user_name,
                                player_number: player_number as u8,
                            },
                        )
                        .await;
                }
                Err(e) => debug!("Ignoring drop from user {}: {}", user_id, e),
            },
            Body::GameChatRequest { message } => self.game_chat(message).await,
            Body::GameKick { user_id: target } => match registry.kick_seat(user_id, target) {
                Ok(departure) => {
                    let target_name = self.ctx.user_name(target);
                    self.ctx
                        .announce_departure(&target_name, target, departure)
                        .await;
                }
                Err(e) => self.refuse("kick that player", e).await,
            },
            other => {
                warn!(
                    "Unexpected {} from user {}",
                    other.message_type().name(),
                    user_id
                );
            }
        }
    }

    async fn game_chat(&self, message: String) {
        let user_id = self.user_id();
        let room = match self.ctx.registry.room_of(user_id) {
            Ok(room) => room,
            Err(e) => {
                debug!("Ignoring room chat from user {}: {}", user_id, e);
                return;
            }
        };

        if let Some(command) = RoomCommand::parse(&message) {
            let result = match command {
                RoomCommand::DetectAutofire(level) => self
                    .ctx
                    .registry
                    .set_sensitivity(user_id, level)
                    .map(|_| format!("Autofire detection set to {level}")),
                RoomCommand::SameDelay(enabled) => self
                    .ctx
                    .registry
                    .set_same_delay(user_id, enabled)
                    .map(|_| {
                        format!("Same delay {}", if enabled { "enabled" } else { "disabled" })
                    }),
            };
            match result {
                Ok(notice) => self.ctx.announce(room.id(), notice).await,
                Err(e) => self.refuse("change room settings", e).await,
            }
            return;
        }

        let user_name = self.ctx.user_name(user_id);
        self.ctx
            .broadcast_room(&room, Body::GameChatNotification { user_name, message })
            .await;
    }

    /// Runs the blocking merge on the blocking pool and sends the result,
    /// by cache key when the client already holds it
    async fn submit_input(&self, data: Vec<u8>) {
        let user_id = self.user_id();
        let ctx = Arc::clone(&self.ctx);
        let result =
            tokio::task::spawn_blocking(move || ctx.registry.submit_input(user_id, &data)).await;

        match result {
            Ok(Ok(merged)) => {
                let body = {
                    let mut caches = self.session.caches.lock();
                    match caches.outbound.find(&merged) {
                        Some(key) => Body::CachedGameData { key },
                        None => {
                            caches.outbound.insert(merged.clone());
                            Body::GameData { data: merged }
                        }
                    }
                };
                self.session.send(body).await;
            }
            Ok(Err(e)) => {
                debug!("Input from user {} refused: {}", user_id, e);
                if !self.session.input_notice_sent.swap(true, Ordering::Relaxed) {
                    self.session
                        .send(Body::GameChatNotification {
                            user_name: SERVER_NAME.to_string(),
                            message: format!("Your input was refused: {e}"),
                        })
                        .await;
                }
            }
            Err(e) => error!("Input task for user {} failed: {}", user_id, e),
        }
    }
}

/// Relay server: answers the connect port and runs one task per user
pub struct Server {
    socket: Arc<UdpSocket>,
    ctx: Arc<ServerContext>,
    events_rx: Option<EventReceiver>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind((config.host.as_str(), config.connect_port)).await?;
        info!("Server listening on {}", socket.local_addr()?);

        let (events, events_rx) = Events::channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket: Arc::new(socket),
            ctx: Arc::new(ServerContext {
                registry: Registry::new(config, events),
                sessions: RwLock::new(HashMap::new()),
            }),
            events_rx: Some(events_rx),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Spawns task that forwards room events to clients
    fn spawn_event_pump(&mut self) {
        let Some(mut events_rx) = self.events_rx.take() else {
            return;
        };
        let ctx = Arc::clone(&self.ctx);

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                debug!("Event: {:?}", event);
                ctx.handle_event(event).await;
            }
        });
    }

    /// Spawns task that reports users silent past the keepalive timeout
    fn spawn_timeout_checker(&self) {
        let ctx = Arc::clone(&self.ctx);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                for user_id in ctx.registry.check_timeouts() {
                    if let Err(e) = server_tx.send(ServerMessage::UserTimeout { user_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Allocates a user and a dedicated socket for a client saying hello
    async fn open_session(&self, addr: SocketAddr) -> ConnectMessage {
        let user_id = match self.ctx.registry.add_user(addr) {
            Ok(id) => id,
            Err(e) => {
                info!("Rejecting {}: {}", addr, e);
                return ConnectMessage::TooManyUsers;
            }
        };

        let config = self.ctx.config();
        let bound = UdpSocket::bind((config.host.as_str(), 0)).await;
        let socket = match bound {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to bind session socket for {}: {}", addr, e);
                self.ctx.registry.remove_user(user_id);
                return ConnectMessage::TooManyUsers;
            }
        };
        let port = match socket.local_addr() {
            Ok(local) => local.port(),
            Err(e) => {
                error!("Session socket for {} has no address: {}", addr, e);
                self.ctx.registry.remove_user(user_id);
                return ConnectMessage::TooManyUsers;
            }
        };

        if config.elevated_hosts.contains(&addr.ip()) {
            self.ctx.registry.set_elevated(user_id, true);
        }

        let session = Arc::new(Session::new(user_id, socket, addr, config));
        self.ctx
            .sessions
            .write()
            .insert(user_id, Arc::clone(&session));
        tokio::spawn(SessionTask::new(Arc::clone(&self.ctx), session).run());

        debug!("User {} from {} assigned port {}", user_id, addr, port);
        ConnectMessage::HelloResponse { port }
    }

    async fn handle_connect(&self, datagram: &[u8], addr: SocketAddr) {
        let reply = match ConnectMessage::parse(datagram) {
            Ok(ConnectMessage::Hello { version }) => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        "{} speaks protocol {}, expected {}",
                        addr, version, PROTOCOL_VERSION
                    );
                }
                self.open_session(addr).await
            }
            Ok(ConnectMessage::Ping) => ConnectMessage::Pong,
            Ok(other) => {
                debug!("Ignoring {:?} from {}", other, addr);
                return;
            }
            Err(e) => {
                debug!("Ignoring connect datagram from {}: {}", addr, e);
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&reply.encode(), addr).await {
            warn!("Failed to reply to {}: {}", addr, e);
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.spawn_event_pump();
        self.spawn_timeout_checker();

        let socket = Arc::clone(&self.socket);
        let mut buffer = [0u8; 512];
        info!("Server started successfully");

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((len, addr)) => self.handle_connect(&buffer[..len], addr).await,
                    Err(e) => {
                        error!("Error receiving on connect port: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },

                message = self.server_rx.recv() => match message {
                    Some(ServerMessage::UserTimeout { user_id }) => {
                        info!("User {} timed out", user_id);
                        self.ctx.disconnect(user_id, "Ping timeout").await;
                    }
                    None => {
                        info!("Server shutting down");
                        break;
                    }
                },
            }
        }

        Ok(())
    }
}
