//! Application state shared across routes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::game::authority::{AuthoritativeLoop, LoopHandle};
use crate::game::input::ConnectionId;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub game: LoopHandle,
    next_connection: Arc<AtomicU64>,
}

impl AppState {
    /// Build the state and the loop it talks to. The caller spawns the loop.
    pub fn new(config: Config) -> (Self, AuthoritativeLoop) {
        let config = Arc::new(config);
        let (game_loop, game) = AuthoritativeLoop::new(config.clone());

        let state = Self {
            config,
            game,
            next_connection: Arc::new(AtomicU64::new(1)),
        };
        (state, game_loop)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }
}
