//! # Headless Snake Client Library
//!
//! Network client for the snake game without any rendering. It speaks the
//! room handshake, reports its own snake and score, and keeps the latest
//! world snapshot the server pushed.
//!
//! ## Client-Side Prediction
//! The server trusts client-reported positions, so the local snake is
//! advanced entirely on the client (`game::LocalSnake`). Opponents are known
//! only through the server's snapshots, which never include our own snake.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::game::ClientGameState;
//! use client::network::GameClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = GameClient::connect("127.0.0.1:8080").await?;
//!     let info = client.join(None).await?;
//!     let mut state = ClientGameState::new(info.session_id, info.room_id, info.grid, &info.spawn);
//!
//!     state.local.advance(&[]);
//!     client.send_move(&state.local.state()).await?;
//!
//!     while let Some(packet) = client.next_packet().await? {
//!         state.apply_server_packet(packet);
//!     }
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod network;
