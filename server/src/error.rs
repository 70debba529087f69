//! Error types for the relay server.

use crate::{RoomId, UserId};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Refusals from the room state machine and registry.
///
/// These always reach the caller: they mean a collaborator asked for
/// something the current state does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("server is full")]
    ServerFull,

    #[error("user {0} does not exist")]
    NoSuchUser(UserId),

    #[error("room {0} does not exist")]
    NoSuchRoom(RoomId),

    #[error("user is not in a room")]
    NotInRoom,

    #[error("user is already in a room")]
    AlreadyInRoom,

    #[error("only the room owner may do that")]
    NotOwner,

    #[error("room is full")]
    RoomFull,

    #[error("game is already in progress")]
    AlreadyStarted,

    #[error("game is not running")]
    NotPlaying,

    #[error("game is not synchronizing")]
    NotSynchronizing,

    #[error("at least two players are required")]
    NotEnoughPlayers,

    #[error("{user_name} does not match the owner's {what}")]
    Mismatch {
        user_name: String,
        what: &'static str,
    },

    #[error("player is not in the running game")]
    SeatNotPlaying,

    #[error("game is desynched")]
    Desynched,

    #[error("input of {length} bytes cannot be split into {actions} actions")]
    InvalidInput { length: usize, actions: usize },

    #[error("the room owner cannot be kicked")]
    CannotKickOwner,

    #[error("autofire sensitivity must be 0-5, got {0}")]
    InvalidSensitivity(u8),
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal server errors surfaced to `main`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
