//! # Game Server Library
//!
//! Realtime multiplayer backend serving two interchangeable transports over
//! a shared persistence layer.
//!
//! ## Architecture
//!
//! The supervisor ([`config`] + the binary's `main`) starts exactly one
//! listener:
//!
//! - **Stream transport** ([`ws_server`] + [`game`]): WebSocket connections,
//!   each with a reader task feeding the shared [`game::GameState`] and a
//!   writer task draining a bounded outbound queue. Ordered and reliable by
//!   construction; a peer that cannot keep up is disconnected rather than
//!   allowed to stall broadcasts.
//!
//! - **Datagram transport** ([`udp_server`] + [`udp_clients`]): a single UDP
//!   socket with per-endpoint client records. Reliability is layered on top:
//!   reliable packets are tracked per client and re-sent on a 50 ms sweep
//!   until acked; heartbeats drive both admission and liveness, and silent
//!   clients are evicted.
//!
//! Both transports record players, sessions, events, chat, and high scores
//! through the [`database`] gateway. Persistence is strictly best-effort
//! from the realtime path's point of view: failures are logged, never
//! propagated.
//!
//! ## Shared protocol
//!
//! Message shapes and the JSON wire codec live in the `shared` crate so that
//! native test clients can speak the same protocol.

pub mod client;
pub mod config;
pub mod database;
pub mod game;
pub mod transport;
pub mod udp_clients;
pub mod udp_server;
pub mod ws_server;
