//! # Snake Load Balancer Library
//!
//! TCP front door for a pool of game servers. Each accepted client is
//! spliced onto a healthy backend with spare capacity; when every backend is
//! full the client waits in a FIFO overflow queue instead of being refused.
//!
//! ## Module Organization
//!
//! - `backend`: per-backend health, capacity and attached clients
//! - `policy`: round-robin and least-loaded backend selection
//! - `router`: assignment, the overflow queue drainer, eviction
//! - `pipe`: the two-way byte relay for one client
//! - `health`: `PING`/`PONG` liveness probes and health transitions
//! - `eviction`: countdown notices for clients of a failed backend
//! - `network`: listener and background task startup
//!
//! The balancer never decodes game traffic. The only frames it produces
//! itself are the eviction notices.

pub mod backend;
pub mod config;
pub mod eviction;
pub mod health;
pub mod network;
pub mod pipe;
pub mod policy;
pub mod router;
