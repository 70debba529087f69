//! Message codec for the 0.83 session protocol.
//!
//! Every message is a [`Body`] variant tagged with a stable one-byte
//! [`MessageType`]. Requests and notifications that share a type tag also share
//! a body layout and are told apart structurally: an empty name field means the
//! client sent a request, a populated name means the server is notifying.
//! Both peers rely on that rule, so the decoder applies it before anything else.

use crate::error::{DecodeError, FormatError};
use crate::wire::{is_latin1, WireReader, WireWriter};
use log::debug;

/// Sentinel used by requests in 16-bit id fields.
pub const REQUEST_ID: u16 = 0xFFFF;

/// Largest player count a start notification can carry; 0xFF marks a request.
pub const MAX_PLAYERS: u8 = 0xFE;

/// Largest `GameData` payload that still fits a 16-bit entry length.
pub const MAX_GAME_DATA: usize = 0xFFFF - 4;

/// One-byte type tags. These values are a compatibility contract with
/// existing clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Quit = 0x01,
    UserJoined = 0x02,
    UserInformation = 0x03,
    ServerStatus = 0x04,
    ServerAck = 0x05,
    ClientAck = 0x06,
    Chat = 0x07,
    GameChat = 0x08,
    KeepAlive = 0x09,
    CreateGame = 0x0A,
    QuitGame = 0x0B,
    JoinGame = 0x0C,
    PlayerInformation = 0x0D,
    GameStatus = 0x0E,
    GameKick = 0x0F,
    CloseGame = 0x10,
    StartGame = 0x11,
    GameData = 0x12,
    CachedGameData = 0x13,
    PlayerDrop = 0x14,
    AllReady = 0x15,
    ConnectionRejected = 0x16,
    InformationMessage = 0x17,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Quit),
            0x02 => Some(Self::UserJoined),
            0x03 => Some(Self::UserInformation),
            0x04 => Some(Self::ServerStatus),
            0x05 => Some(Self::ServerAck),
            0x06 => Some(Self::ClientAck),
            0x07 => Some(Self::Chat),
            0x08 => Some(Self::GameChat),
            0x09 => Some(Self::KeepAlive),
            0x0A => Some(Self::CreateGame),
            0x0B => Some(Self::QuitGame),
            0x0C => Some(Self::JoinGame),
            0x0D => Some(Self::PlayerInformation),
            0x0E => Some(Self::GameStatus),
            0x0F => Some(Self::GameKick),
            0x10 => Some(Self::CloseGame),
            0x11 => Some(Self::StartGame),
            0x12 => Some(Self::GameData),
            0x13 => Some(Self::CachedGameData),
            0x14 => Some(Self::PlayerDrop),
            0x15 => Some(Self::AllReady),
            0x16 => Some(Self::ConnectionRejected),
            0x17 => Some(Self::InformationMessage),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Quit => "Quit",
            Self::UserJoined => "UserJoined",
            Self::UserInformation => "UserInformation",
            Self::ServerStatus => "ServerStatus",
            Self::ServerAck => "ServerAck",
            Self::ClientAck => "ClientAck",
            Self::Chat => "Chat",
            Self::GameChat => "GameChat",
            Self::KeepAlive => "KeepAlive",
            Self::CreateGame => "CreateGame",
            Self::QuitGame => "QuitGame",
            Self::JoinGame => "JoinGame",
            Self::PlayerInformation => "PlayerInformation",
            Self::GameStatus => "GameStatus",
            Self::GameKick => "GameKick",
            Self::CloseGame => "CloseGame",
            Self::StartGame => "StartGame",
            Self::GameData => "GameData",
            Self::CachedGameData => "CachedGameData",
            Self::PlayerDrop => "PlayerDrop",
            Self::AllReady => "AllReady",
            Self::ConnectionRejected => "ConnectionRejected",
            Self::InformationMessage => "InformationMessage",
        }
    }
}

/// A lobby user as listed in `ServerStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatus {
    pub name: String,
    pub ping: u32,
    pub status: u8,
    pub user_id: u16,
    pub connection_type: u8,
}

/// A room as listed in `ServerStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSummary {
    pub rom_name: String,
    pub game_id: u32,
    pub client_type: String,
    pub owner: String,
    /// Occupancy text such as `"2/8"`.
    pub players: String,
    pub status: u8,
}

/// A seated player as listed in `PlayerInformation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSummary {
    pub name: String,
    pub ping: u32,
    pub user_id: u16,
    pub connection_type: u8,
}

/// Message bodies. Request/notification pairs are separate variants so that
/// handlers match on intent rather than sentinel values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    QuitRequest {
        message: String,
    },
    QuitNotification {
        user_name: String,
        user_id: u16,
        message: String,
    },
    UserJoined {
        user_name: String,
        user_id: u16,
        ping: u32,
        connection_type: u8,
    },
    UserInformation {
        user_name: String,
        client_type: String,
        connection_type: u8,
    },
    ServerStatus {
        users: Vec<UserStatus>,
        games: Vec<GameSummary>,
    },
    ServerAck,
    ClientAck,
    ChatRequest {
        message: String,
    },
    ChatNotification {
        user_name: String,
        message: String,
    },
    GameChatRequest {
        message: String,
    },
    GameChatNotification {
        user_name: String,
        message: String,
    },
    KeepAlive {
        value: u8,
    },
    CreateGameRequest {
        rom_name: String,
    },
    CreateGameNotification {
        user_name: String,
        rom_name: String,
        client_type: String,
        game_id: u16,
        val1: u16,
    },
    QuitGameRequest,
    QuitGameNotification {
        user_name: String,
        user_id: u16,
    },
    JoinGameRequest {
        game_id: u16,
        connection_type: u8,
    },
    JoinGameNotification {
        game_id: u16,
        val1: u16,
        user_name: String,
        ping: u32,
        user_id: u16,
        connection_type: u8,
    },
    PlayerInformation {
        players: Vec<PlayerSummary>,
    },
    GameStatus {
        game_id: u16,
        val1: u16,
        status: u8,
        num_players: u8,
        max_players: u8,
    },
    GameKick {
        user_id: u16,
    },
    CloseGame {
        game_id: u16,
        val1: u16,
    },
    StartGameRequest,
    StartGameNotification {
        frame_delay: u16,
        player_number: u8,
        num_players: u8,
    },
    GameData {
        data: Vec<u8>,
    },
    CachedGameData {
        key: u8,
    },
    PlayerDropRequest,
    PlayerDropNotification {
        user_name: String,
        player_number: u8,
    },
    AllReady,
    ConnectionRejected {
        user_name: String,
        user_id: u16,
        message: String,
    },
    InformationMessage {
        source: String,
        message: String,
    },
}

fn check_text(kind: MessageType, field: &str, value: &str) -> Result<(), FormatError> {
    if value.contains('\0') {
        return Err(FormatError::new(
            kind.name(),
            format!("{field} contains a NUL byte"),
        ));
    }
    // Text travels as single bytes; anything wider would not read back.
    if !is_latin1(value) {
        return Err(FormatError::new(
            kind.name(),
            format!("{field} has characters outside Latin-1"),
        ));
    }
    Ok(())
}

fn check_name(kind: MessageType, field: &str, value: &str) -> Result<(), FormatError> {
    if value.is_empty() {
        return Err(FormatError::new(kind.name(), format!("{field} must not be empty")));
    }
    check_text(kind, field, value)
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::QuitRequest { .. } | Body::QuitNotification { .. } => MessageType::Quit,
            Body::UserJoined { .. } => MessageType::UserJoined,
            Body::UserInformation { .. } => MessageType::UserInformation,
            Body::ServerStatus { .. } => MessageType::ServerStatus,
            Body::ServerAck => MessageType::ServerAck,
            Body::ClientAck => MessageType::ClientAck,
            Body::ChatRequest { .. } | Body::ChatNotification { .. } => MessageType::Chat,
            Body::GameChatRequest { .. } | Body::GameChatNotification { .. } => {
                MessageType::GameChat
            }
            Body::KeepAlive { .. } => MessageType::KeepAlive,
            Body::CreateGameRequest { .. } | Body::CreateGameNotification { .. } => {
                MessageType::CreateGame
            }
            Body::QuitGameRequest | Body::QuitGameNotification { .. } => MessageType::QuitGame,
            Body::JoinGameRequest { .. } | Body::JoinGameNotification { .. } => {
                MessageType::JoinGame
            }
            Body::PlayerInformation { .. } => MessageType::PlayerInformation,
            Body::GameStatus { .. } => MessageType::GameStatus,
            Body::GameKick { .. } => MessageType::GameKick,
            Body::CloseGame { .. } => MessageType::CloseGame,
            Body::StartGameRequest | Body::StartGameNotification { .. } => MessageType::StartGame,
            Body::GameData { .. } => MessageType::GameData,
            Body::CachedGameData { .. } => MessageType::CachedGameData,
            Body::PlayerDropRequest | Body::PlayerDropNotification { .. } => {
                MessageType::PlayerDrop
            }
            Body::AllReady => MessageType::AllReady,
            Body::ConnectionRejected { .. } => MessageType::ConnectionRejected,
            Body::InformationMessage { .. } => MessageType::InformationMessage,
        }
    }

    /// Checks field constraints shared by construction and decoding.
    pub fn validate(&self) -> Result<(), FormatError> {
        let kind = self.message_type();
        match self {
            Body::QuitRequest { message }
            | Body::ChatRequest { message }
            | Body::GameChatRequest { message } => check_text(kind, "message", message),
            Body::QuitNotification {
                user_name, message, ..
            }
            | Body::ChatNotification { user_name, message }
            | Body::GameChatNotification { user_name, message } => {
                check_name(kind, "user name", user_name)?;
                check_text(kind, "message", message)
            }
            Body::UserJoined { user_name, .. }
            | Body::QuitGameNotification { user_name, .. }
            | Body::JoinGameNotification { user_name, .. } => {
                check_name(kind, "user name", user_name)
            }
            Body::UserInformation {
                user_name,
                client_type,
                ..
            } => {
                check_name(kind, "user name", user_name)?;
                check_text(kind, "client type", client_type)
            }
            Body::ServerStatus { users, games } => {
                if u32::try_from(users.len()).is_err() || u32::try_from(games.len()).is_err() {
                    return Err(FormatError::new(kind.name(), "list too long"));
                }
                for user in users {
                    check_name(kind, "user name", &user.name)?;
                }
                for game in games {
                    check_name(kind, "rom name", &game.rom_name)?;
                    check_text(kind, "client type", &game.client_type)?;
                    check_text(kind, "owner", &game.owner)?;
                    check_text(kind, "players", &game.players)?;
                }
                Ok(())
            }
            Body::CreateGameRequest { rom_name } => check_name(kind, "rom name", rom_name),
            Body::CreateGameNotification {
                user_name,
                rom_name,
                client_type,
                ..
            } => {
                check_name(kind, "user name", user_name)?;
                check_name(kind, "rom name", rom_name)?;
                check_text(kind, "client type", client_type)
            }
            Body::PlayerInformation { players } => {
                if u32::try_from(players.len()).is_err() {
                    return Err(FormatError::new(kind.name(), "list too long"));
                }
                for player in players {
                    check_name(kind, "user name", &player.name)?;
                }
                Ok(())
            }
            Body::StartGameNotification {
                player_number,
                num_players,
                ..
            } => {
                if *num_players > MAX_PLAYERS {
                    return Err(FormatError::new(
                        kind.name(),
                        format!("player count {num_players} exceeds {MAX_PLAYERS}"),
                    ));
                }
                if *player_number == 0 || player_number > num_players {
                    return Err(FormatError::new(
                        kind.name(),
                        format!("player number {player_number} out of range 1..={num_players}"),
                    ));
                }
                Ok(())
            }
            Body::GameData { data } => {
                if data.is_empty() {
                    return Err(FormatError::new(kind.name(), "game data must not be empty"));
                }
                if data.len() > MAX_GAME_DATA {
                    return Err(FormatError::new(
                        kind.name(),
                        format!("game data length {} exceeds {MAX_GAME_DATA}", data.len()),
                    ));
                }
                Ok(())
            }
            Body::PlayerDropNotification {
                user_name,
                player_number,
            } => {
                check_name(kind, "user name", user_name)?;
                if *player_number == 0 {
                    return Err(FormatError::new(kind.name(), "player number must be >= 1"));
                }
                Ok(())
            }
            Body::ConnectionRejected {
                user_name, message, ..
            } => {
                check_name(kind, "user name", user_name)?;
                check_text(kind, "message", message)
            }
            Body::InformationMessage { source, message } => {
                check_name(kind, "source", source)?;
                check_text(kind, "message", message)
            }
            Body::ServerAck
            | Body::ClientAck
            | Body::KeepAlive { .. }
            | Body::QuitGameRequest
            | Body::JoinGameRequest { .. }
            | Body::GameStatus { .. }
            | Body::GameKick { .. }
            | Body::CloseGame { .. }
            | Body::StartGameRequest
            | Body::CachedGameData { .. }
            | Body::PlayerDropRequest
            | Body::AllReady => Ok(()),
        }
    }

    /// Encodes the body bytes, excluding the type tag.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(32);
        self.write_to(&mut w);
        w.into_inner()
    }

    fn write_to(&self, w: &mut WireWriter) {
        match self {
            Body::QuitRequest { message } => {
                w.write_string("");
                w.write_u16(REQUEST_ID);
                w.write_string(message);
            }
            Body::QuitNotification {
                user_name,
                user_id,
                message,
            } => {
                w.write_string(user_name);
                w.write_u16(*user_id);
                w.write_string(message);
            }
            Body::UserJoined {
                user_name,
                user_id,
                ping,
                connection_type,
            } => {
                w.write_string(user_name);
                w.write_u16(*user_id);
                w.write_u32(*ping);
                w.write_u8(*connection_type);
            }
            Body::UserInformation {
                user_name,
                client_type,
                connection_type,
            } => {
                w.write_string(user_name);
                w.write_string(client_type);
                w.write_u8(*connection_type);
            }
            Body::ServerStatus { users, games } => {
                w.write_string("");
                w.write_u32(users.len() as u32);
                w.write_u32(games.len() as u32);
                for user in users {
                    w.write_string(&user.name);
                    w.write_u32(user.ping);
                    w.write_u8(user.status);
                    w.write_u16(user.user_id);
                    w.write_u8(user.connection_type);
                }
                for game in games {
                    w.write_string(&game.rom_name);
                    w.write_u32(game.game_id);
                    w.write_string(&game.client_type);
                    w.write_string(&game.owner);
                    w.write_string(&game.players);
                    w.write_u8(game.status);
                }
            }
            Body::ServerAck | Body::ClientAck => {
                w.write_string("");
                for value in 0..4u32 {
                    w.write_u32(value);
                }
            }
            Body::ChatRequest { message } | Body::GameChatRequest { message } => {
                w.write_string("");
                w.write_string(message);
            }
            Body::ChatNotification { user_name, message }
            | Body::GameChatNotification { user_name, message } => {
                w.write_string(user_name);
                w.write_string(message);
            }
            Body::KeepAlive { value } => w.write_u8(*value),
            Body::CreateGameRequest { rom_name } => {
                w.write_string("");
                w.write_string(rom_name);
                w.write_string("");
                w.write_u16(REQUEST_ID);
                w.write_u16(REQUEST_ID);
            }
            Body::CreateGameNotification {
                user_name,
                rom_name,
                client_type,
                game_id,
                val1,
            } => {
                w.write_string(user_name);
                w.write_string(rom_name);
                w.write_string(client_type);
                w.write_u16(*game_id);
                w.write_u16(*val1);
            }
            Body::QuitGameRequest => {
                w.write_string("");
                w.write_u16(REQUEST_ID);
            }
            Body::QuitGameNotification { user_name, user_id } => {
                w.write_string(user_name);
                w.write_u16(*user_id);
            }
            Body::JoinGameRequest {
                game_id,
                connection_type,
            } => {
                w.write_u8(0);
                w.write_u16(*game_id);
                w.write_u16(0);
                w.write_string("");
                w.write_u32(0);
                w.write_u16(REQUEST_ID);
                w.write_u8(*connection_type);
            }
            Body::JoinGameNotification {
                game_id,
                val1,
                user_name,
                ping,
                user_id,
                connection_type,
            } => {
                w.write_u8(0);
                w.write_u16(*game_id);
                w.write_u16(*val1);
                w.write_string(user_name);
                w.write_u32(*ping);
                w.write_u16(*user_id);
                w.write_u8(*connection_type);
            }
            Body::PlayerInformation { players } => {
                w.write_string("");
                w.write_u32(players.len() as u32);
                for player in players {
                    w.write_string(&player.name);
                    w.write_u32(player.ping);
                    w.write_u16(player.user_id);
                    w.write_u8(player.connection_type);
                }
            }
            Body::GameStatus {
                game_id,
                val1,
                status,
                num_players,
                max_players,
            } => {
                w.write_u8(0);
                w.write_u16(*game_id);
                w.write_u16(*val1);
                w.write_u8(*status);
                w.write_u8(*num_players);
                w.write_u8(*max_players);
            }
            Body::GameKick { user_id } => {
                w.write_u8(0);
                w.write_u16(*user_id);
            }
            Body::CloseGame { game_id, val1 } => {
                w.write_u8(0);
                w.write_u16(*game_id);
                w.write_u16(*val1);
            }
            Body::StartGameRequest => {
                w.write_u8(0);
                w.write_u16(REQUEST_ID);
                w.write_u8(0xFF);
                w.write_u8(0xFF);
            }
            Body::StartGameNotification {
                frame_delay,
                player_number,
                num_players,
            } => {
                w.write_u8(0);
                w.write_u16(*frame_delay);
                w.write_u8(*player_number);
                w.write_u8(*num_players);
            }
            Body::GameData { data } => {
                w.write_u8(0);
                w.write_u16(data.len() as u16);
                w.write_bytes(data);
            }
            Body::CachedGameData { key } => {
                w.write_u8(0);
                w.write_u8(*key);
            }
            Body::PlayerDropRequest => {
                w.write_string("");
                w.write_u8(0);
            }
            Body::PlayerDropNotification {
                user_name,
                player_number,
            } => {
                w.write_string(user_name);
                w.write_u8(*player_number);
            }
            Body::AllReady => w.write_u8(0),
            Body::ConnectionRejected {
                user_name,
                user_id,
                message,
            } => {
                w.write_string(user_name);
                w.write_u16(*user_id);
                w.write_string(message);
            }
            Body::InformationMessage { source, message } => {
                w.write_string(source);
                w.write_string(message);
            }
        }
    }

    /// Decodes a body for `tag`.
    ///
    /// Trailing bytes beyond what the layout consumes are logged and ignored;
    /// clients in the wild disagree on some body lengths.
    pub fn decode(tag: u8, bytes: &[u8]) -> Result<Body, DecodeError> {
        let kind = MessageType::from_u8(tag).ok_or(DecodeError::UnknownType(tag))?;
        let mut r = WireReader::new(kind.name(), bytes);

        let body = match kind {
            MessageType::Quit => {
                let user_name = r.read_string("user name")?;
                let user_id = r.read_u16("user id")?;
                let message = r.read_string("message")?;
                if user_name.is_empty() {
                    Body::QuitRequest { message }
                } else {
                    Body::QuitNotification {
                        user_name,
                        user_id,
                        message,
                    }
                }
            }
            MessageType::UserJoined => Body::UserJoined {
                user_name: r.read_string("user name")?,
                user_id: r.read_u16("user id")?,
                ping: r.read_u32("ping")?,
                connection_type: r.read_u8("connection type")?,
            },
            MessageType::UserInformation => Body::UserInformation {
                user_name: r.read_string("user name")?,
                client_type: r.read_string("client type")?,
                connection_type: r.read_u8("connection type")?,
            },
            MessageType::ServerStatus => {
                r.expect_zero("marker")?;
                let num_users = r.read_u32("user count")?;
                let num_games = r.read_u32("game count")?;
                let mut users = Vec::new();
                for _ in 0..num_users {
                    users.push(UserStatus {
                        name: r.read_string("user name")?,
                        ping: r.read_u32("ping")?,
                        status: r.read_u8("status")?,
                        user_id: r.read_u16("user id")?,
                        connection_type: r.read_u8("connection type")?,
                    });
                }
                let mut games = Vec::new();
                for _ in 0..num_games {
                    games.push(GameSummary {
                        rom_name: r.read_string("rom name")?,
                        game_id: r.read_u32("game id")?,
                        client_type: r.read_string("client type")?,
                        owner: r.read_string("owner")?,
                        players: r.read_string("players")?,
                        status: r.read_u8("status")?,
                    });
                }
                Body::ServerStatus { users, games }
            }
            MessageType::ServerAck | MessageType::ClientAck => {
                r.expect_zero("marker")?;
                for _ in 0..4 {
                    r.read_u32("ack value")?;
                }
                if kind == MessageType::ServerAck {
                    Body::ServerAck
                } else {
                    Body::ClientAck
                }
            }
            MessageType::Chat | MessageType::GameChat => {
                let user_name = r.read_string("user name")?;
                let message = r.read_string("message")?;
                match (kind, user_name.is_empty()) {
                    (MessageType::Chat, true) => Body::ChatRequest { message },
                    (MessageType::Chat, false) => Body::ChatNotification { user_name, message },
                    (_, true) => Body::GameChatRequest { message },
                    (_, false) => Body::GameChatNotification { user_name, message },
                }
            }
            MessageType::KeepAlive => Body::KeepAlive {
                value: r.read_u8("value")?,
            },
            MessageType::CreateGame => {
                let user_name = r.read_string("user name")?;
                let rom_name = r.read_string("rom name")?;
                let client_type = r.read_string("client type")?;
                let game_id = r.read_u16("game id")?;
                let val1 = r.read_u16("val1")?;
                if user_name.is_empty() {
                    Body::CreateGameRequest { rom_name }
                } else {
                    Body::CreateGameNotification {
                        user_name,
                        rom_name,
                        client_type,
                        game_id,
                        val1,
                    }
                }
            }
            MessageType::QuitGame => {
                let user_name = r.read_string("user name")?;
                let user_id = r.read_u16("user id")?;
                if user_name.is_empty() {
                    Body::QuitGameRequest
                } else {
                    Body::QuitGameNotification { user_name, user_id }
                }
            }
            MessageType::JoinGame => {
                r.expect_zero("marker")?;
                let game_id = r.read_u16("game id")?;
                let val1 = r.read_u16("val1")?;
                let user_name = r.read_string("user name")?;
                let ping = r.read_u32("ping")?;
                let user_id = r.read_u16("user id")?;
                let connection_type = r.read_u8("connection type")?;
                if user_name.is_empty() {
                    Body::JoinGameRequest {
                        game_id,
                        connection_type,
                    }
                } else {
                    Body::JoinGameNotification {
                        game_id,
                        val1,
                        user_name,
                        ping,
                        user_id,
                        connection_type,
                    }
                }
            }
            MessageType::PlayerInformation => {
                r.expect_zero("marker")?;
                let count = r.read_u32("player count")?;
                let mut players = Vec::new();
                for _ in 0..count {
                    players.push(PlayerSummary {
                        name: r.read_string("user name")?,
                        ping: r.read_u32("ping")?,
                        user_id: r.read_u16("user id")?,
                        connection_type: r.read_u8("connection type")?,
                    });
                }
                Body::PlayerInformation { players }
            }
            MessageType::GameStatus => {
                r.expect_zero("marker")?;
                Body::GameStatus {
                    game_id: r.read_u16("game id")?,
                    val1: r.read_u16("val1")?,
                    status: r.read_u8("status")?,
                    num_players: r.read_u8("player count")?,
                    max_players: r.read_u8("max players")?,
                }
            }
            MessageType::GameKick => {
                r.expect_zero("marker")?;
                Body::GameKick {
                    user_id: r.read_u16("user id")?,
                }
            }
            MessageType::CloseGame => {
                r.expect_zero("marker")?;
                Body::CloseGame {
                    game_id: r.read_u16("game id")?,
                    val1: r.read_u16("val1")?,
                }
            }
            MessageType::StartGame => {
                r.expect_zero("marker")?;
                let frame_delay = r.read_u16("val1")?;
                let player_number = r.read_u8("player number")?;
                let num_players = r.read_u8("player count")?;
                if frame_delay == REQUEST_ID && player_number == 0xFF && num_players == 0xFF {
                    Body::StartGameRequest
                } else {
                    Body::StartGameNotification {
                        frame_delay,
                        player_number,
                        num_players,
                    }
                }
            }
            MessageType::GameData => {
                r.expect_zero("marker")?;
                let length = r.read_u16("data length")?;
                Body::GameData {
                    data: r.read_bytes(length as usize, "data")?,
                }
            }
            MessageType::CachedGameData => {
                r.expect_zero("marker")?;
                Body::CachedGameData {
                    key: r.read_u8("cache key")?,
                }
            }
            MessageType::PlayerDrop => {
                let user_name = r.read_string("user name")?;
                let player_number = r.read_u8("player number")?;
                if user_name.is_empty() {
                    Body::PlayerDropRequest
                } else {
                    Body::PlayerDropNotification {
                        user_name,
                        player_number,
                    }
                }
            }
            MessageType::AllReady => {
                r.expect_zero("marker")?;
                Body::AllReady
            }
            MessageType::ConnectionRejected => Body::ConnectionRejected {
                user_name: r.read_string("user name")?,
                user_id: r.read_u16("user id")?,
                message: r.read_string("message")?,
            },
            MessageType::InformationMessage => Body::InformationMessage {
                source: r.read_string("source")?,
                message: r.read_string("message")?,
            },
        };

        if r.remaining() > 0 {
            debug!(
                "{} body length mismatch: declared {} bytes, decoded {}",
                kind.name(),
                bytes.len(),
                r.position()
            );
        }

        body.validate()?;
        Ok(body)
    }
}

/// A numbered message as carried inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub number: u16,
    pub body: Body,
}

impl Message {
    /// Builds a message, rejecting bodies whose fields are out of range.
    pub fn new(number: u16, body: Body) -> Result<Self, FormatError> {
        body.validate()?;
        Ok(Self { number, body })
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Encodes the bundle entry: number, length, type tag and body.
    pub fn encode_entry(&self) -> Vec<u8> {
        let body = self.body.encode();
        let mut w = WireWriter::with_capacity(body.len() + 5);
        w.write_u16(self.number);
        w.write_u16((body.len() + 1) as u16);
        w.write_u8(self.message_type() as u8);
        w.write_bytes(&body);
        w.into_inner()
    }
}
