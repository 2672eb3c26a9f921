//! # Snake Game Server Library
//!
//! Authoritative server for the multiplayer snake game. It keeps the state
//! of every room and pushes a fresh world snapshot to each room member after
//! every state-changing message.
//!
//! ## Module Organization
//!
//! ### Registry (`registry`, `room`)
//! Rooms are pre-allocated at startup and each sits behind its own lock.
//! A room owns its sessions, its top score and the apples on its board.
//!
//! ### Broadcast (`broadcast`)
//! Applies a join, move, score or leave and fans the resulting snapshot out
//! to every member while still holding the room lock, so peers observe
//! changes in the order the server received them. Each connection has a
//! bounded outbound queue; a member whose queue is full is disconnected
//! rather than allowed to stall the room.
//!
//! ### Connections (`connection`, `probe`, `network`)
//! One task per TCP connection. A connection that opens with `PING` is a
//! liveness probe and gets `PONG`; anything else goes through the room
//! handshake and becomes an active session.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new("127.0.0.1:5555", ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod network;
pub mod probe;
pub mod registry;
pub mod room;
