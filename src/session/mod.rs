pub mod manager;

pub use manager::{JoinError, PhaseKind, SessionEvent, SessionManager};
