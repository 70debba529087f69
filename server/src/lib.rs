//! # Relay Server Library
//!
//! This library implements a netplay relay server for lockstep emulator
//! sessions. Clients run the emulation themselves; the server only collects
//! each player's controller input for a frame, merges the inputs of every
//! player in a room, and hands the merged step back to all of them.
//!
//! ## Core Responsibilities
//!
//! ### Input Synchronization
//! Each playing seat writes its input into its own action queue. When a seat
//! submits a message of input it blocks until every other seat has provided
//! input for the same step, then receives all seats' input in seat order.
//! Seats that fall behind are detected through read timeouts and eventually
//! desynchronized so the rest of the room is not held hostage.
//!
//! ### Session Management
//! Handles the complete lifecycle of a user:
//! - Plain-text handshake on the connect port and a dedicated session port
//! - Login with round-trip measurement to estimate ping
//! - Lobby chat, room creation, joining, and leaving
//! - Keepalive tracking and disconnection of silent users
//!
//! ### Fair Play
//! An optional autofire detector scans each seat's input for the strictly
//! regular alternation a turbo button produces and reports offenders to the
//! room.
//!
//! ## Architecture Design
//!
//! ### Blocking Core, Async Edge
//! Rooms and action queues are plain synchronous code built on
//! `parking_lot` locks and condition variables. The network layer runs on
//! tokio and hands each merge to the blocking pool, so a waiting room never
//! stalls the async runtime.
//!
//! ### Event Driven Notifications
//! The core never talks to sockets. It emits [`events::ServerEvent`]s on an
//! unbounded channel, and the network layer's event pump turns them into
//! client notifications and log lines.
//!
//! ## Module Organization
//!
//! ### Action Queue Module (`action_queue`)
//! Fixed-capacity byte ring per seat with one read cursor per consumer,
//! blocking reads with timeouts, and desynchronization wakeups.
//!
//! ### Room Module (`room`)
//! The room state machine: seats, start and ready handshakes, the merge loop,
//! timeout accounting, and drop handling.
//!
//! ### Autofire Module (`autofire`)
//! Pattern scanning and the shared pool of scan threads.
//!
//! ### Registry Module (`registry`)
//! Users and rooms, id allocation, and routing a user's request to their room.
//!
//! ### Network Module (`network`)
//! UDP sockets, message bundling, per-session caches, and the event pump.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         connect_port: 27888,
//!         ..ServerConfig::default()
//!     };
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod action_queue;
pub mod autofire;
pub mod config;
pub mod data_cache;
pub mod error;
pub mod events;
pub mod network;
pub mod registry;
pub mod room;

/// Server-assigned user id. 0 and 0xFFFF are never used.
pub type UserId = u16;

/// Server-assigned room id. 0 and 0xFFFF are never used.
pub type RoomId = u16;
