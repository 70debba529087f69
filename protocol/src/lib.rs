//! Wire protocol shared by the relay server and its clients.
//!
//! - [`message`]: typed message bodies and their binary layouts
//! - [`bundle`]: packing messages into datagrams and recovering the unseen
//!   suffix from received ones
//! - [`handshake`]: the plain-text exchange on the connect port
//!
//! Everything here is pure encode/decode with no shared state, so it is safe
//! to use from any number of threads at once.

pub mod bundle;
pub mod error;
pub mod handshake;
pub mod message;
pub mod wire;

pub use bundle::{pack, unpack, MAX_MESSAGES};
pub use error::{DecodeError, FormatError, FrameError, HandshakeError};
pub use handshake::ConnectMessage;
pub use message::{Body, GameSummary, Message, MessageType, PlayerSummary, UserStatus};

/// Connection classes, LAN (1) through bad (6). The value doubles as the
/// number of emulator frames each input message carries.
pub const CONNECTION_LAN: u8 = 1;
pub const CONNECTION_BAD: u8 = 6;

/// Lobby status bytes carried in `ServerStatus`.
pub const USER_STATUS_PLAYING: u8 = 0;
pub const USER_STATUS_IDLE: u8 = 1;
