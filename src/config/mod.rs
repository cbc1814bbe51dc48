//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const MAX_TICK_RATE: u32 = 1_000_000;

/// Server configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format
    pub log_json: bool,
    /// Allowed CORS origins, comma-separated, or `*`
    pub client_origin: String,

    /// Physics ticks per second
    pub tick_rate: u32,
    /// Network broadcasts per second
    pub broadcast_rate: u32,
    /// Seconds between forced full snapshots
    pub full_sync_interval_secs: u64,
    /// Seed for spawn points and obstacle layout
    pub world_seed: u64,

    /// Interval between heartbeat pings
    pub heartbeat_interval_ms: u64,
    /// Consecutive unanswered pings before a connection is dropped
    pub heartbeat_miss_limit: u32,
    /// Grace window for reconnecting after a disconnect
    pub retention_window_secs: u64,

    /// Steady-state input messages per second per connection
    pub max_input_rate: u32,
    /// Extra input messages tolerated inside the 1 s window
    pub input_burst: u32,
    /// Capacity of the input queue between handlers and the tick loop
    pub input_queue_capacity: usize,
    /// Raw frames per second a connection may send before frames are dropped
    pub max_frame_rate: u32,
    /// Capacity of each connection's outbound buffer
    pub outbox_capacity: usize,

    /// ACTIVE phase length
    pub match_duration_secs: u64,
    /// INTERMISSION phase length
    pub intermission_duration_secs: u64,
    /// Consecutive bottom-tier placements that trigger relegation
    pub relegation_lookback: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = Self::default();
        let config = Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: parse_var("LOG_JSON", defaults.log_json)?,
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            tick_rate: parse_var("TICK_RATE", defaults.tick_rate)?,
            broadcast_rate: parse_var("BROADCAST_RATE", defaults.broadcast_rate)?,
            full_sync_interval_secs: parse_var(
                "FULL_SYNC_INTERVAL_SECS",
                defaults.full_sync_interval_secs,
            )?,
            world_seed: parse_var("WORLD_SEED", defaults.world_seed)?,

            heartbeat_interval_ms: parse_var("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval_ms)?,
            heartbeat_miss_limit: parse_var("HEARTBEAT_MISS_LIMIT", defaults.heartbeat_miss_limit)?,
            retention_window_secs: parse_var("RETENTION_WINDOW_SECS", defaults.retention_window_secs)?,

            max_input_rate: parse_var("MAX_INPUT_RATE", defaults.max_input_rate)?,
            input_burst: parse_var("INPUT_BURST", defaults.input_burst)?,
            input_queue_capacity: parse_var("INPUT_QUEUE_CAPACITY", defaults.input_queue_capacity)?,
            max_frame_rate: parse_var("MAX_FRAME_RATE", defaults.max_frame_rate)?,
            outbox_capacity: parse_var("OUTBOX_CAPACITY", defaults.outbox_capacity)?,

            match_duration_secs: parse_var("MATCH_DURATION_SECS", defaults.match_duration_secs)?,
            intermission_duration_secs: parse_var(
                "INTERMISSION_DURATION_SECS",
                defaults.intermission_duration_secs,
            )?,
            relegation_lookback: parse_var("RELEGATION_LOOKBACK", defaults.relegation_lookback)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the tick loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        // a tick must last at least one microsecond
        if self.tick_rate == 0 || self.tick_rate > MAX_TICK_RATE {
            return Err(ConfigError::Invalid("TICK_RATE"));
        }
        if self.broadcast_rate == 0 || self.broadcast_rate > self.tick_rate {
            return Err(ConfigError::Invalid("BROADCAST_RATE"));
        }
        if self.max_input_rate == 0 {
            return Err(ConfigError::Invalid("MAX_INPUT_RATE"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("HEARTBEAT_INTERVAL_MS"));
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(ConfigError::Invalid("HEARTBEAT_MISS_LIMIT"));
        }
        if self.match_duration_secs == 0 {
            return Err(ConfigError::Invalid("MATCH_DURATION_SECS"));
        }
        if self.intermission_duration_secs == 0 {
            return Err(ConfigError::Invalid("INTERMISSION_DURATION_SECS"));
        }
        if self.relegation_lookback == 0 {
            return Err(ConfigError::Invalid("RELEGATION_LOOKBACK"));
        }
        if self.input_queue_capacity == 0 || self.outbox_capacity == 0 {
            return Err(ConfigError::Invalid("QUEUE_CAPACITY"));
        }
        Ok(())
    }

    /// Physics ticks between two broadcasts (nominally 3)
    pub fn ticks_per_broadcast(&self) -> u32 {
        (self.tick_rate / self.broadcast_rate).max(1)
    }

    /// Physics ticks between two forced full snapshots
    pub fn ticks_per_full_sync(&self) -> u64 {
        (self.full_sync_interval_secs * self.tick_rate as u64).max(1)
    }

    /// Wall-clock length of one tick
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate as u64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Inputs accepted per sliding second: steady cap plus burst
    pub fn input_window_limit(&self) -> u32 {
        self.max_input_rate + self.input_burst
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_json: false,
            client_origin: "*".to_string(),
            tick_rate: 60,
            broadcast_rate: 20,
            full_sync_interval_secs: 5,
            world_seed: 0x5eed_a7e4a,
            heartbeat_interval_ms: 1_000,
            heartbeat_miss_limit: 3,
            retention_window_secs: 30,
            max_input_rate: 60,
            input_burst: 10,
            input_queue_capacity: 4_096,
            max_frame_rate: 120,
            outbox_capacity: 128,
            match_duration_secs: 300,
            intermission_duration_secs: 120,
            relegation_lookback: 3,
        }
    }
}

/// Read an optional variable, falling back to `default` when unset
fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
