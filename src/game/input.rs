//! Player input commands and the per-connection input gate
//!
//! Connection handlers submit decoded `PLAYER_INPUT` payloads here. The gate
//! rejects stale or replayed sequence numbers, enforces the per-connection
//! message ceiling over a sliding one-second window, and enqueues accepted
//! commands on a bounded queue that the tick loop drains once per tick.

use std::collections::VecDeque;
use std::ops::BitOr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::Config;

use super::world::ShipId;

/// Transport connection identifier, assigned by the WebSocket layer
pub type ConnectionId = u64;

/// Control keys held during one input sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputKeys(u8);

impl InputKeys {
    pub const NONE: InputKeys = InputKeys(0);
    pub const THRUST: InputKeys = InputKeys(1);
    pub const ROTATE_LEFT: InputKeys = InputKeys(1 << 1);
    pub const ROTATE_RIGHT: InputKeys = InputKeys(1 << 2);
    pub const FIRE: InputKeys = InputKeys(1 << 3);
    /// Hold to charge a mine, release to drop it
    pub const MINE: InputKeys = InputKeys(1 << 4);

    const VALID_MASK: u8 = 0b1_1111;

    /// Build from raw bits, rejecting bits outside the known key set
    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits & !Self::VALID_MASK == 0).then_some(Self(bits))
    }

    pub fn contains(self, other: InputKeys) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_valid(self) -> bool {
        self.0 & !Self::VALID_MASK == 0
    }
}

impl BitOr for InputKeys {
    type Output = InputKeys;

    fn bitor(self, rhs: InputKeys) -> InputKeys {
        InputKeys(self.0 | rhs.0)
    }
}

/// One client control sample (`PLAYER_INPUT` payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCommand {
    pub keys: InputKeys,
    /// Client wall clock in milliseconds
    pub timestamp: u64,
    /// Strictly increasing per connection
    pub sequence: u64,
}

impl InputCommand {
    pub fn new(keys: InputKeys, sequence: u64, timestamp: u64) -> Self {
        Self {
            keys,
            timestamp,
            sequence,
        }
    }
}

/// Accepted command waiting for the next tick
#[derive(Debug, Clone, Copy)]
pub struct QueuedInput {
    pub connection: ConnectionId,
    /// Ship bound to the connection when the command was accepted
    pub ship: ShipId,
    pub command: InputCommand,
}

/// Why a command did not reach the tick loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateRejection {
    #[error("input payload failed validation")]
    Malformed,
    #[error("sequence {sequence} is not newer than {last_accepted}")]
    StaleSequence { sequence: u64, last_accepted: u64 },
    #[error("input rate exceeded ({limit} per second)")]
    RateLimited { limit: u32 },
    #[error("connection is not bound to a ship")]
    UnknownConnection,
    #[error("input queue is full")]
    QueueFull,
}

#[derive(Debug)]
struct GateState {
    ship: ShipId,
    last_sequence: Option<u64>,
    /// Arrival times of accepted commands inside the current window
    window: VecDeque<Instant>,
    /// Set when a command was dropped for rate; the loop resyncs the client
    rate_dropped: bool,
}

/// Validates, deduplicates and rate-limits input per connection
pub struct InputGate {
    connections: DashMap<ConnectionId, GateState>,
    sender: mpsc::Sender<QueuedInput>,
    window_limit: u32,
    window: Duration,
}

/// Consumer side of the gate, owned by the tick loop
pub struct InputQueue {
    receiver: mpsc::Receiver<QueuedInput>,
}

impl InputGate {
    /// Create a gate and the queue it feeds
    pub fn new(config: &Config) -> (Self, InputQueue) {
        let (sender, receiver) = mpsc::channel(config.input_queue_capacity);
        let gate = Self {
            connections: DashMap::new(),
            sender,
            window_limit: config.input_window_limit(),
            window: Duration::from_secs(1),
        };
        (gate, InputQueue { receiver })
    }

    /// Bind a connection to the ship it may control. Rebinding resets the
    /// sequence space.
    pub fn bind(&self, connection: ConnectionId, ship: ShipId) {
        self.connections.insert(
            connection,
            GateState {
                ship,
                last_sequence: None,
                window: VecDeque::new(),
                rate_dropped: false,
            },
        );
    }

    /// Forget a connection. Commands it already queued are discarded by the loop.
    pub fn release(&self, connection: ConnectionId) {
        self.connections.remove(&connection);
    }

    pub fn is_bound(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    /// Submit a command received now
    pub fn submit(&self, connection: ConnectionId, command: InputCommand) -> Result<(), GateRejection> {
        self.submit_at(connection, command, Instant::now())
    }

    /// Submit a command with an explicit arrival time
    pub fn submit_at(
        &self,
        connection: ConnectionId,
        command: InputCommand,
        now: Instant,
    ) -> Result<(), GateRejection> {
        if !command.keys.is_valid() {
            return Err(GateRejection::Malformed);
        }

        let mut state = self
            .connections
            .get_mut(&connection)
            .ok_or(GateRejection::UnknownConnection)?;

        if let Some(last_accepted) = state.last_sequence {
            if command.sequence <= last_accepted {
                return Err(GateRejection::StaleSequence {
                    sequence: command.sequence,
                    last_accepted,
                });
            }
        }

        while let Some(&oldest) = state.window.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                state.window.pop_front();
            } else {
                break;
            }
        }

        if state.window.len() as u32 >= self.window_limit {
            state.rate_dropped = true;
            return Err(GateRejection::RateLimited {
                limit: self.window_limit,
            });
        }

        let queued = QueuedInput {
            connection,
            ship: state.ship,
            command,
        };
        match self.sender.try_send(queued) {
            Ok(()) => {
                state.last_sequence = Some(command.sequence);
                state.window.push_back(now);
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => Err(GateRejection::QueueFull),
        }
    }

    /// Highest accepted sequence for a connection
    pub fn last_sequence(&self, connection: ConnectionId) -> Option<u64> {
        self.connections
            .get(&connection)
            .and_then(|state| state.last_sequence)
    }

    /// Connections that had input dropped for rate since the last call
    pub fn take_rate_flags(&self) -> Vec<(ConnectionId, ShipId)> {
        let mut flagged = Vec::new();
        for mut entry in self.connections.iter_mut() {
            if entry.rate_dropped {
                entry.rate_dropped = false;
                flagged.push((*entry.key(), entry.ship));
            }
        }
        flagged
    }
}

impl InputQueue {
    /// Drain everything queued since the previous tick, in arrival order
    pub fn drain(&mut self) -> Vec<QueuedInput> {
        let mut drained = Vec::new();
        while let Ok(input) = self.receiver.try_recv() {
            drained.push(input);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn gate() -> (InputGate, InputQueue) {
        InputGate::new(&Config::default())
    }

    fn cmd(sequence: u64) -> InputCommand {
        InputCommand::new(InputKeys::THRUST, sequence, sequence * 16)
    }

    #[test]
    fn keys_reject_unknown_bits() {
        assert!(InputKeys::from_bits(0b1_1111).is_some());
        assert!(InputKeys::from_bits(0b10_0000).is_none());
        let keys = InputKeys::THRUST | InputKeys::FIRE;
        assert!(keys.contains(InputKeys::FIRE));
        assert!(!keys.contains(InputKeys::MINE));
    }

    #[test]
    fn accepted_sequences_strictly_increase() {
        let (gate, mut queue) = gate();
        gate.bind(1, 7);
        let start = Instant::now();

        assert_ok!(gate.submit_at(1, cmd(1), start));
        assert_ok!(gate.submit_at(1, cmd(5), start));
        assert_eq!(
            gate.submit_at(1, cmd(5), start),
            Err(GateRejection::StaleSequence {
                sequence: 5,
                last_accepted: 5
            })
        );
        assert_err!(gate.submit_at(1, cmd(3), start));
        assert_ok!(gate.submit_at(1, cmd(6), start));

        let sequences: Vec<u64> = queue.drain().iter().map(|q| q.command.sequence).collect();
        assert_eq!(sequences, vec![1, 5, 6]);
        assert_eq!(gate.last_sequence(1), Some(6));
    }

    #[test]
    fn hundred_commands_in_one_second_accept_at_most_seventy() {
        let (gate, mut queue) = gate();
        gate.bind(9, 1);
        let start = Instant::now();

        let accepted = (0..100u64)
            .filter(|i| {
                let at = start + Duration::from_millis(i * 9);
                gate.submit_at(9, cmd(i + 1), at).is_ok()
            })
            .count();

        assert_eq!(accepted, 70);
        assert_eq!(queue.drain().len(), 70);
        assert_eq!(gate.take_rate_flags(), vec![(9, 1)]);
        assert!(gate.take_rate_flags().is_empty());
    }

    #[test]
    fn window_slides_after_one_second() {
        let (gate, _queue) = gate();
        gate.bind(2, 2);
        let start = Instant::now();
        for i in 0..70u64 {
            assert_ok!(gate.submit_at(2, cmd(i + 1), start));
        }
        assert_err!(gate.submit_at(2, cmd(71), start + Duration::from_millis(500)));
        assert_ok!(gate.submit_at(2, cmd(72), start + Duration::from_secs(1)));
    }

    #[test]
    fn commands_are_scoped_to_the_bound_ship() {
        let (gate, mut queue) = gate();
        gate.bind(1, 10);
        gate.bind(2, 20);
        assert_ok!(gate.submit(1, cmd(1)));
        assert_ok!(gate.submit(2, cmd(1)));

        let drained = queue.drain();
        assert_eq!(drained[0].ship, 10);
        assert_eq!(drained[1].ship, 20);
    }

    #[test]
    fn unbound_and_malformed_input_is_rejected() {
        let (gate, _queue) = gate();
        assert_eq!(gate.submit(3, cmd(1)), Err(GateRejection::UnknownConnection));

        gate.bind(3, 1);
        let bad = InputCommand::new(InputKeys(0b100_0000), 1, 0);
        assert_eq!(gate.submit(3, bad), Err(GateRejection::Malformed));

        gate.release(3);
        assert!(!gate.is_bound(3));
    }

    #[test]
    fn full_queue_drops_without_advancing_sequence() {
        let config = Config {
            input_queue_capacity: 1,
            ..Config::default()
        };
        let (gate, _queue) = InputGate::new(&config);
        gate.bind(1, 1);
        assert_ok!(gate.submit(1, cmd(1)));
        assert_eq!(gate.submit(1, cmd(2)), Err(GateRejection::QueueFull));
        assert_eq!(gate.last_sequence(1), Some(1));
    }
}
