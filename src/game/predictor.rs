//! Client-side prediction and server reconciliation
//!
//! The predictor runs the same `advance_ship` as the server for the local
//! ship, one step per local command, and keeps each unacknowledged command
//! with the state it predicted. When authoritative state arrives it is
//! compared against the prediction for the acknowledged sequence; a mismatch
//! rolls back to the server state and replays the remaining commands.
//! Remote ships are interpolated between the last two world states.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use super::input::InputCommand;
use super::physics::{ArenaLayout, Tuning};
use super::snapshot::{self, WorldDelta, WorldSnapshot};
use super::world::{advance_ship, Ship, ShipId};
use crate::session::PhaseKind;
use crate::ws::protocol::{Envelope, ServerMsg, Welcome};

/// Reconciliation tolerances. Server-side jitter below these is absorbed.
const POSITION_EPSILON: f32 = 1.0;
const VELOCITY_EPSILON: f32 = 1.0;
const ROTATION_EPSILON: f32 = 0.01;
const HEAT_EPSILON: f32 = 1.0;

/// Unacknowledged commands kept before the oldest are discarded
const MAX_PENDING: usize = 256;

/// What a server message did to the predicted state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// State applied, prediction still within tolerance
    Current,
    /// Prediction was replaced by server state and replayed
    RolledBack,
    /// Waiting for a full snapshot; deltas are dropped until it arrives
    NeedsFull,
    /// Message has no bearing on world state
    Ignored,
}

#[derive(Debug, Clone)]
struct Pending {
    command: InputCommand,
    predicted: Ship,
}

pub struct ClientPredictor {
    ship_id: ShipId,
    layout: ArenaLayout,
    tuning: Tuning,
    armed: bool,
    /// Last authoritative world state
    confirmed: Option<WorldSnapshot>,
    /// Locally predicted own ship
    ship: Option<Ship>,
    pending: VecDeque<Pending>,
    last_ack: u64,
    last_envelope: Option<u64>,
    awaiting_full: bool,
    /// Last two (timestamp, ships) pairs for remote interpolation
    history: VecDeque<(u64, BTreeMap<ShipId, Ship>)>,
    rollbacks: u64,
}

impl ClientPredictor {
    pub fn new(ship_id: ShipId, layout: ArenaLayout, tick_rate: u32) -> Self {
        Self {
            ship_id,
            layout,
            tuning: Tuning::new(tick_rate),
            armed: true,
            confirmed: None,
            ship: None,
            pending: VecDeque::new(),
            last_ack: 0,
            last_envelope: None,
            awaiting_full: true,
            history: VecDeque::with_capacity(2),
            rollbacks: 0,
        }
    }

    pub fn from_welcome(welcome: &Welcome) -> Self {
        let mut predictor = Self::new(welcome.ship_id, welcome.arena.clone(), welcome.tick_rate);
        predictor.armed = welcome.phase == PhaseKind::Active;
        predictor
    }

    pub fn ship_id(&self) -> ShipId {
        self.ship_id
    }

    /// Predicted state of the local ship
    pub fn ship(&self) -> Option<&Ship> {
        self.ship.as_ref()
    }

    pub fn confirmed(&self) -> Option<&WorldSnapshot> {
        self.confirmed.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks
    }

    pub fn awaiting_full(&self) -> bool {
        self.awaiting_full
    }

    /// Predict one tick for a command that is also being sent to the server
    pub fn apply_local(&mut self, command: InputCommand) {
        let Some(ship) = self.ship.as_ref() else {
            return;
        };
        let predicted = self.step(ship, &command);
        self.ship = Some(predicted.clone());
        self.pending.push_back(Pending { command, predicted });
        if self.pending.len() > MAX_PENDING {
            self.pending.pop_front();
        }
    }

    fn step(&self, from: &Ship, command: &InputCommand) -> Ship {
        let mut ship = from.clone();
        ship.keys = command.keys;
        ship.ack_sequence = command.sequence;
        advance_ship(&ship, &self.layout, &self.tuning, self.armed).0
    }

    /// Feed a decoded server message
    pub fn on_message(&mut self, envelope: &Envelope<ServerMsg>) -> SyncStatus {
        if let Some(last) = self.last_envelope {
            if envelope.sequence != last + 1 {
                warn!(
                    expected = last + 1,
                    got = envelope.sequence,
                    "Message sequence gap, waiting for full snapshot"
                );
                self.awaiting_full = true;
            }
        }
        self.last_envelope = Some(envelope.sequence);

        match &envelope.message {
            ServerMsg::WorldStateFull(snapshot) => self.on_full(snapshot),
            ServerMsg::WorldStateDelta(delta) => self.on_delta(delta),
            ServerMsg::ServerCorrection(correction) => self.on_correction(&correction.ship),
            ServerMsg::MatchStart(_) => {
                self.armed = true;
                SyncStatus::Ignored
            }
            ServerMsg::IntermissionStart(_) => {
                self.armed = false;
                SyncStatus::Ignored
            }
            ServerMsg::ServerWelcome(welcome) => {
                *self = Self::from_welcome(welcome);
                self.last_envelope = Some(envelope.sequence);
                SyncStatus::NeedsFull
            }
            ServerMsg::ConnectionError(_)
            | ServerMsg::MatchEnd(_)
            | ServerMsg::PlayerDeath(_)
            | ServerMsg::PlayerRespawn(_)
            | ServerMsg::ChatMessage(_)
            | ServerMsg::PingRequest(_)
            | ServerMsg::PingResponse(_) => SyncStatus::Ignored,
        }
    }

    fn on_full(&mut self, snapshot: &WorldSnapshot) -> SyncStatus {
        self.awaiting_full = false;
        self.confirmed = Some(snapshot.clone());
        self.push_history(snapshot);
        match snapshot.ships.get(&self.ship_id) {
            Some(ship) => self.reconcile(ship.clone(), false),
            None => SyncStatus::Current,
        }
    }

    fn on_delta(&mut self, delta: &WorldDelta) -> SyncStatus {
        if self.awaiting_full {
            return SyncStatus::NeedsFull;
        }
        let Some(base) = self.confirmed.as_ref() else {
            self.awaiting_full = true;
            return SyncStatus::NeedsFull;
        };
        if base.tick != delta.base_tick {
            debug!(have = base.tick, need = delta.base_tick, "Delta base mismatch");
            self.awaiting_full = true;
            return SyncStatus::NeedsFull;
        }

        let next = snapshot::apply(base, delta);
        self.push_history(&next);
        let own = delta.ships.iter().find(|s| s.id == self.ship_id).cloned();
        self.confirmed = Some(next);
        match own {
            Some(ship) => self.reconcile(ship, false),
            None => SyncStatus::Current,
        }
    }

    fn on_correction(&mut self, ship: &Ship) -> SyncStatus {
        if ship.id != self.ship_id {
            return SyncStatus::Ignored;
        }
        self.reconcile(ship.clone(), true)
    }

    /// Compare server state against the prediction made for its acknowledged
    /// command; roll back and replay when they disagree or when forced.
    fn reconcile(&mut self, server: Ship, force: bool) -> SyncStatus {
        let ack = server.ack_sequence;
        if ack < self.last_ack && !force {
            return SyncStatus::Current;
        }
        self.last_ack = self.last_ack.max(ack);

        let predicted = self
            .pending
            .iter()
            .find(|p| p.command.sequence == ack)
            .map(|p| p.predicted.clone());
        self.pending.retain(|p| p.command.sequence > ack);

        let diverged = match &predicted {
            Some(predicted) => !within_tolerance(predicted, &server),
            None => true,
        };

        if !server.alive {
            // nothing to predict for a wreck
            self.pending.clear();
            self.ship = Some(server);
            return SyncStatus::Current;
        }

        if !force && !diverged {
            return SyncStatus::Current;
        }
        if !force && predicted.is_none() && self.pending.is_empty() {
            self.ship = Some(server);
            return SyncStatus::Current;
        }

        let mut state = server;
        for pending in self.pending.iter_mut() {
            let mut from = state.clone();
            from.keys = pending.command.keys;
            from.ack_sequence = pending.command.sequence;
            state = advance_ship(&from, &self.layout, &self.tuning, self.armed).0;
            pending.predicted = state.clone();
        }
        self.ship = Some(state);

        if force || predicted.is_some() {
            self.rollbacks += 1;
            debug!(ack, replayed = self.pending.len(), "Rolled back local prediction");
        }
        SyncStatus::RolledBack
    }

    fn push_history(&mut self, snapshot: &WorldSnapshot) {
        if self.history.len() == 2 {
            self.history.pop_front();
        }
        self.history.push_back((snapshot.timestamp, snapshot.ships.clone()));
    }

    /// Remote ships at `render_time` (server millis), interpolated between
    /// the two most recent world states. The local ship is excluded.
    pub fn remote_ships(&self, render_time: u64) -> Vec<Ship> {
        let (older, newer) = match (self.history.front(), self.history.back()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Vec::new(),
        };
        let (t1, from) = older;
        let (t2, to) = newer;
        let alpha = if t2 > t1 {
            (render_time.saturating_sub(*t1) as f32 / (t2 - t1) as f32).clamp(0.0, 1.0)
        } else {
            1.0
        };

        to.values()
            .filter(|ship| ship.id != self.ship_id)
            .map(|ship| match from.get(&ship.id) {
                Some(previous) if previous.alive && ship.alive => lerp_ship(previous, ship, alpha),
                _ => ship.clone(),
            })
            .collect()
    }
}

fn within_tolerance(a: &Ship, b: &Ship) -> bool {
    (a.x - b.x).abs() <= POSITION_EPSILON
        && (a.y - b.y).abs() <= POSITION_EPSILON
        && (a.vel_x - b.vel_x).abs() <= VELOCITY_EPSILON
        && (a.vel_y - b.vel_y).abs() <= VELOCITY_EPSILON
        && angle_between(a.rotation, b.rotation).abs() <= ROTATION_EPSILON
        && (a.heat - b.heat).abs() <= HEAT_EPSILON
        && a.health == b.health
        && a.alive == b.alive
        && a.overheated == b.overheated
}

/// Signed shortest arc from `from` to `to`
fn angle_between(from: f32, to: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    (to - from + PI).rem_euclid(TAU) - PI
}

fn lerp_ship(from: &Ship, to: &Ship, alpha: f32) -> Ship {
    let mut out = to.clone();
    out.x = from.x + (to.x - from.x) * alpha;
    out.y = from.y + (to.y - from.y) * alpha;
    out.vel_x = from.vel_x + (to.vel_x - from.vel_x) * alpha;
    out.vel_y = from.vel_y + (to.vel_y - from.vel_y) * alpha;
    out.rotation =
        (from.rotation + angle_between(from.rotation, to.rotation) * alpha).rem_euclid(std::f32::consts::TAU);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::input::InputKeys;
    use crate::game::physics::quantize_position;
    use crate::game::world::World;
    use crate::ws::protocol::Correction;

    struct Harness {
        world: World,
        id: ShipId,
        predictor: ClientPredictor,
        sequence: u64,
    }

    impl Harness {
        fn new() -> Self {
            let mut world = World::new(5, 60);
            let id = world.spawn_ship("Ace");
            let predictor = ClientPredictor::new(id, world.layout().clone(), 60);
            let mut harness = Self {
                world,
                id,
                predictor,
                sequence: 0,
            };
            let full = ServerMsg::WorldStateFull(harness.world.snapshot(0));
            harness.deliver(full);
            harness
        }

        fn deliver(&mut self, message: ServerMsg) -> SyncStatus {
            let envelope = Envelope {
                timestamp: 0,
                sequence: self.sequence,
                message,
            };
            self.sequence += 1;
            self.predictor.on_message(&envelope)
        }

        fn command(n: u64) -> InputCommand {
            let keys = if n % 4 == 0 {
                InputKeys::THRUST | InputKeys::ROTATE_LEFT
            } else {
                InputKeys::THRUST
            };
            InputCommand::new(keys, n, 0)
        }

        fn server_process(&mut self, range: std::ops::RangeInclusive<u64>) {
            for n in range {
                self.world.apply_input(self.id, &Self::command(n));
                self.world.step(true);
            }
        }

        fn client_predict(&mut self, range: std::ops::RangeInclusive<u64>) {
            for n in range {
                self.predictor.apply_local(Self::command(n));
            }
        }
    }

    #[test]
    fn matching_prediction_needs_no_rollback() {
        let mut h = Harness::new();
        h.client_predict(1..=20);
        h.server_process(1..=10);

        let base = h.predictor.confirmed().unwrap().clone();
        let delta = snapshot::diff(&base, &h.world.snapshot(0));
        assert_eq!(h.deliver(ServerMsg::WorldStateDelta(delta)), SyncStatus::Current);
        assert_eq!(h.predictor.rollbacks(), 0);
        assert_eq!(h.predictor.pending_len(), 10);

        h.server_process(11..=20);
        assert_eq!(h.predictor.ship(), h.world.ship(h.id));
    }

    #[test]
    fn forced_correction_converges_after_replay() {
        let mut h = Harness::new();
        h.client_predict(1..=20);
        h.server_process(1..=10);

        // something the client could not foresee shoves the ship
        {
            let ship = h.world.ship_mut(h.id).unwrap();
            ship.x = quantize_position(ship.x + 40.0);
            ship.vel_y = quantize_position(ship.vel_y - 25.0);
        }
        let correction = Correction {
            tick: h.world.tick(),
            ship: h.world.ship(h.id).unwrap().clone(),
        };
        assert_eq!(
            h.deliver(ServerMsg::ServerCorrection(correction)),
            SyncStatus::RolledBack
        );
        assert_eq!(h.predictor.rollbacks(), 1);
        assert_eq!(h.predictor.pending_len(), 10);

        h.server_process(11..=20);
        let server = h.world.ship(h.id).unwrap();
        let predicted = h.predictor.ship().unwrap();
        assert!(within_tolerance(predicted, server));
        assert_eq!(predicted, server);
    }

    #[test]
    fn divergent_delta_triggers_rollback() {
        let mut h = Harness::new();
        h.client_predict(1..=12);
        h.server_process(1..=6);
        h.world.ship_mut(h.id).unwrap().x += 30.0;

        let base = h.predictor.confirmed().unwrap().clone();
        let delta = snapshot::diff(&base, &h.world.snapshot(0));
        assert_eq!(h.deliver(ServerMsg::WorldStateDelta(delta)), SyncStatus::RolledBack);
        assert_eq!(h.predictor.rollbacks(), 1);
        assert_eq!(h.predictor.pending_len(), 6);

        h.server_process(7..=12);
        assert_eq!(h.predictor.ship(), h.world.ship(h.id));
    }

    #[test]
    fn sequence_gap_waits_for_full_snapshot() {
        let mut h = Harness::new();
        h.server_process(1..=3);
        let base = h.predictor.confirmed().unwrap().clone();
        let delta = snapshot::diff(&base, &h.world.snapshot(0));

        h.sequence += 1; // lost frame
        assert_eq!(h.deliver(ServerMsg::WorldStateDelta(delta)), SyncStatus::NeedsFull);
        assert!(h.predictor.awaiting_full());

        h.deliver(ServerMsg::WorldStateFull(h.world.snapshot(0)));
        assert!(!h.predictor.awaiting_full());
        assert_eq!(h.predictor.confirmed().unwrap().tick, h.world.tick());
    }

    #[test]
    fn delta_against_wrong_base_is_rejected() {
        let mut h = Harness::new();
        h.server_process(1..=3);
        let stale_base = h.world.snapshot(0);
        h.server_process(4..=6);
        let delta = snapshot::diff(&stale_base, &h.world.snapshot(0));
        assert_eq!(h.deliver(ServerMsg::WorldStateDelta(delta)), SyncStatus::NeedsFull);
    }

    #[test]
    fn remote_ships_are_interpolated() {
        let mut world = World::open_arena(3, 60);
        let me = world.spawn_ship("Ace");
        let other = world.spawn_ship("Bee");
        let mut predictor = ClientPredictor::new(me, world.layout().clone(), 60);

        let mut first = world.snapshot(1_000);
        first.ships.get_mut(&other).unwrap().x = 100.0;
        let mut second = first.clone();
        second.timestamp = 1_100;
        second.tick += 6;
        second.ships.get_mut(&other).unwrap().x = 200.0;

        for (sequence, snap) in [first, second].into_iter().enumerate() {
            predictor.on_message(&Envelope {
                timestamp: snap.timestamp,
                sequence: sequence as u64,
                message: ServerMsg::WorldStateFull(snap),
            });
        }

        let remote = predictor.remote_ships(1_050);
        assert_eq!(remote.len(), 1);
        assert!((remote[0].x - 150.0).abs() < 0.001);
    }
}
