//! Server configuration, loaded from an optional TOML file.
//!
//! Every field has a default, so a file only needs the keys it changes:
//!
//! ```toml
//! connect_port = 27888
//! max_users = 100
//!
//! [game]
//! timeout_millis = 100
//! desynch_timeouts = 120
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Port that answers the plain-text handshake.
    pub connect_port: u16,
    pub max_users: usize,
    /// Sessions silent for this long are disconnected.
    pub keepalive_timeout_secs: u64,
    /// Upper bound on outgoing datagram size.
    pub max_bundle_bytes: usize,
    /// How many recent messages each outgoing datagram repeats.
    pub resend_window: usize,
    /// Round trips timed during login before the ping is averaged.
    pub login_ack_count: usize,
    /// Lines sent to each user right after login.
    pub welcome_messages: Vec<String>,
    /// Users connecting from these addresses may start rooms they do not own.
    pub elevated_hosts: Vec<IpAddr>,
    pub game: GameConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GameConfig {
    /// Capacity in bytes of each seat's action queue.
    pub buffer_size: usize,
    /// How long a merge read waits for a lagging seat.
    pub timeout_millis: u64,
    /// Consecutive timeouts after which a seat is desynchronized.
    pub desynch_timeouts: u32,
    /// Autofire detection level for new rooms, 0 disables it.
    pub autofire_sensitivity: u8,
    pub max_seats: usize,
    pub allow_single_player: bool,
    /// Give every seat the room-wide delay instead of its own.
    pub same_delay: bool,
    /// Autofire scan threads; 0 means one per available core.
    pub scan_workers: usize,
    /// Chunks allowed to wait for a scan thread before new ones are dropped.
    pub scan_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            connect_port: 27888,
            max_users: 100,
            keepalive_timeout_secs: 90,
            max_bundle_bytes: 1024,
            resend_window: 6,
            login_ack_count: 4,
            welcome_messages: vec!["Welcome to the relay server".to_string()],
            elevated_hosts: Vec::new(),
            game: GameConfig::default(),
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            timeout_millis: 100,
            desynch_timeouts: 120,
            autofire_sensitivity: 0,
            max_seats: 8,
            allow_single_player: true,
            same_delay: false,
            scan_workers: 0,
            scan_queue_depth: 256,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_users == 0 || self.max_users > 0xFFFE {
            return Err(ConfigError::Invalid(format!(
                "max_users must be between 1 and 65534, got {}",
                self.max_users
            )));
        }
        if self.resend_window == 0 || self.resend_window > protocol::MAX_MESSAGES {
            return Err(ConfigError::Invalid(format!(
                "resend_window must be between 1 and {}, got {}",
                protocol::MAX_MESSAGES,
                self.resend_window
            )));
        }
        if self.max_bundle_bytes < 64 {
            return Err(ConfigError::Invalid("max_bundle_bytes must be at least 64".into()));
        }
        if let Some(line) = self
            .welcome_messages
            .iter()
            .find(|line| !protocol::wire::is_latin1(line) || line.contains('\0'))
        {
            return Err(ConfigError::Invalid(format!(
                "welcome message {line:?} must be NUL-free Latin-1 text"
            )));
        }
        if self.login_ack_count == 0 {
            return Err(ConfigError::Invalid("login_ack_count must be positive".into()));
        }
        self.game.validate()
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }
}

impl GameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("game.buffer_size must be positive".into()));
        }
        if self.timeout_millis == 0 {
            return Err(ConfigError::Invalid("game.timeout_millis must be positive".into()));
        }
        if self.desynch_timeouts == 0 {
            return Err(ConfigError::Invalid("game.desynch_timeouts must be positive".into()));
        }
        if self.autofire_sensitivity > crate::autofire::MAX_SENSITIVITY {
            return Err(ConfigError::Invalid(format!(
                "game.autofire_sensitivity must be 0-{}, got {}",
                crate::autofire::MAX_SENSITIVITY,
                self.autofire_sensitivity
            )));
        }
        let seat_limit = usize::from(protocol::message::MAX_PLAYERS);
        if self.max_seats == 0 || self.max_seats > seat_limit {
            return Err(ConfigError::Invalid(format!(
                "game.max_seats must be between 1 and {seat_limit}, got {}",
                self.max_seats
            )));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    pub fn scan_worker_count(&self) -> usize {
        if self.scan_workers > 0 {
            return self.scan_workers;
        }
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.connect_port, 27888);
        assert_eq!(config.game.desynch_timeouts, 120);
        assert_eq!(config.game.read_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_override() {
        let config = ServerConfig::from_toml(
            r#"
            max_users = 10
            welcome_messages = ["hi", "there"]
            elevated_hosts = ["127.0.0.1"]

            [game]
            timeout_millis = 50
            same_delay = true
            "#,
        )
        .unwrap();

        assert_eq!(config.max_users, 10);
        assert_eq!(config.welcome_messages.len(), 2);
        assert_eq!(config.elevated_hosts, vec![IpAddr::from([127, 0, 0, 1])]);
        assert_eq!(config.game.timeout_millis, 50);
        assert!(config.game.same_delay);
        assert_eq!(config.game.buffer_size, 4096);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            ServerConfig::from_toml("max_users = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("[game]\nautofire_sensitivity = 6"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("welcome_messages = [\"5€ entry\"]"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("[game]\nmax_seats = 255"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("resend_window = 40"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            ServerConfig::from_toml("max_users = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_scan_worker_count() {
        let mut game = GameConfig::default();
        assert!(game.scan_worker_count() >= 1);
        game.scan_workers = 3;
        assert_eq!(game.scan_worker_count(), 3);
    }
}
