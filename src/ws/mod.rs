//! WebSocket transport: wire protocol, connection handling, liveness

pub mod handler;
pub mod protocol;
pub mod supervisor;
