//! Authoritative state synchronization for a multiplayer arena shooter
//!
//! A fixed-tick simulation owned by one loop task, delta-compressed world
//! broadcasts over WebSocket, client-side prediction with reconciliation,
//! input gating and the match/intermission session lifecycle.

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod session;
pub mod util;
pub mod ws;
