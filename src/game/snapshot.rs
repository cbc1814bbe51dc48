//! Snapshot diffing and the broadcast cadence

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::combat::{Projectile, ProjectileId};
use super::world::{Ship, ShipId};

// Dead zone for kinematic fields. Authoritative values sit on the
// quantization grid (0.01 px, 0.01 px/s, 0.0001 rad) so half a step
// separates "unchanged" from "moved by at least one quantum".
const POSITION_DEAD_ZONE: f32 = 0.005;
const VELOCITY_DEAD_ZONE: f32 = 0.005;
const ROTATION_DEAD_ZONE: f32 = 0.000_05;

/// Full authoritative state at a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub timestamp: u64,
    #[serde(with = "entity_list")]
    pub ships: BTreeMap<ShipId, Ship>,
    #[serde(with = "entity_list")]
    pub projectiles: BTreeMap<ProjectileId, Projectile>,
}

/// Entities that carry their own map key
pub trait Keyed {
    fn key(&self) -> u32;
}

impl Keyed for Ship {
    fn key(&self) -> u32 {
        self.id
    }
}

impl Keyed for Projectile {
    fn key(&self) -> u32 {
        self.id
    }
}

/// Id-keyed maps go on the wire as plain arrays in id order. JSON object
/// keys are strings, which do not survive a round trip through a buffered
/// tagged enum as integers.
mod entity_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Keyed;

    pub fn serialize<S, V>(map: &BTreeMap<u32, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<u32, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de> + Keyed,
    {
        let entities = Vec::<V>::deserialize(deserializer)?;
        Ok(entities.into_iter().map(|e| (e.key(), e)).collect())
    }
}

/// Change set between two broadcast snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDelta {
    /// Tick of the snapshot this delta applies to
    pub base_tick: u64,
    pub tick: u64,
    pub timestamp: u64,
    pub ships: Vec<Ship>,
    pub removed_ships: Vec<ShipId>,
    pub projectiles: Vec<Projectile>,
    pub removed_projectiles: Vec<ProjectileId>,
}

impl WorldDelta {
    pub fn is_empty(&self) -> bool {
        self.ships.is_empty()
            && self.removed_ships.is_empty()
            && self.projectiles.is_empty()
            && self.removed_projectiles.is_empty()
    }
}

/// True when `current` moved outside the dead zone or any discrete field changed
pub fn ship_changed(base: &Ship, current: &Ship) -> bool {
    (base.x - current.x).abs() > POSITION_DEAD_ZONE
        || (base.y - current.y).abs() > POSITION_DEAD_ZONE
        || (base.vel_x - current.vel_x).abs() > VELOCITY_DEAD_ZONE
        || (base.vel_y - current.vel_y).abs() > VELOCITY_DEAD_ZONE
        || (base.rotation - current.rotation).abs() > ROTATION_DEAD_ZONE
        || (base.angular_velocity - current.angular_velocity).abs() > ROTATION_DEAD_ZONE
        || base.heat != current.heat
        || base.health != current.health
        || base.overheated != current.overheated
        || base.alive != current.alive
        || base.respawn_ticks != current.respawn_ticks
        || base.fire_cooldown != current.fire_cooldown
        || base.mine_hold != current.mine_hold
        || base.keys != current.keys
        || base.ack_sequence != current.ack_sequence
        || base.handle != current.handle
}

/// Diff two snapshots
pub fn diff(base: &WorldSnapshot, current: &WorldSnapshot) -> WorldDelta {
    let ships = current
        .ships
        .values()
        .filter(|ship| match base.ships.get(&ship.id) {
            Some(previous) => ship_changed(previous, ship),
            None => true,
        })
        .cloned()
        .collect();

    let removed_ships = base
        .ships
        .keys()
        .filter(|id| !current.ships.contains_key(id))
        .copied()
        .collect();

    let projectiles = current
        .projectiles
        .values()
        .filter(|p| base.projectiles.get(&p.id) != Some(*p))
        .cloned()
        .collect();

    let removed_projectiles = base
        .projectiles
        .keys()
        .filter(|id| !current.projectiles.contains_key(id))
        .copied()
        .collect();

    WorldDelta {
        base_tick: base.tick,
        tick: current.tick,
        timestamp: current.timestamp,
        ships,
        removed_ships,
        projectiles,
        removed_projectiles,
    }
}

/// Apply a delta to the snapshot it was diffed against
pub fn apply(base: &WorldSnapshot, delta: &WorldDelta) -> WorldSnapshot {
    let mut next = base.clone();
    next.tick = delta.tick;
    next.timestamp = delta.timestamp;

    for id in &delta.removed_ships {
        next.ships.remove(id);
    }
    for ship in &delta.ships {
        next.ships.insert(ship.id, ship.clone());
    }
    for id in &delta.removed_projectiles {
        next.projectiles.remove(id);
    }
    for projectile in &delta.projectiles {
        next.projectiles.insert(projectile.id, projectile.clone());
    }
    next
}

/// What to put on the wire this broadcast
#[derive(Debug, Clone)]
pub enum Broadcast {
    /// Periodic resync for everyone
    Full,
    Delta(WorldDelta),
}

/// Decides when to broadcast and diffs against the last broadcast snapshot
pub struct DeltaEncoder {
    /// Tick counter since last broadcast
    ticks_since_broadcast: u32,
    /// Broadcast interval in ticks
    broadcast_interval: u32,
    /// Ticks between forced full snapshots
    full_sync_interval: u64,
    last_full_tick: Option<u64>,
    /// Last snapshot put on the wire
    baseline: Option<WorldSnapshot>,
}

impl DeltaEncoder {
    pub fn new(broadcast_interval: u32, full_sync_interval: u64) -> Self {
        Self {
            ticks_since_broadcast: 0,
            broadcast_interval: broadcast_interval.max(1),
            full_sync_interval: full_sync_interval.max(1),
            last_full_tick: None,
            baseline: None,
        }
    }

    /// Check if this tick is a broadcast tick
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_broadcast += 1;
        if self.ticks_since_broadcast >= self.broadcast_interval {
            self.ticks_since_broadcast = 0;
            true
        } else {
            false
        }
    }

    /// Make the next encode a full snapshot for everyone
    pub fn force_full(&mut self) {
        self.last_full_tick = None;
    }

    /// Encode `snapshot` against the previous broadcast and make it the new baseline
    pub fn encode(&mut self, snapshot: &WorldSnapshot) -> Broadcast {
        let full_due = match (self.last_full_tick, &self.baseline) {
            (None, _) | (_, None) => true,
            (Some(last), Some(_)) => snapshot.tick.saturating_sub(last) >= self.full_sync_interval,
        };

        let out = match (&self.baseline, full_due) {
            (Some(base), false) => Broadcast::Delta(diff(base, snapshot)),
            _ => {
                self.last_full_tick = Some(snapshot.tick);
                Broadcast::Full
            }
        };

        self.baseline = Some(snapshot.clone());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::input::{InputCommand, InputKeys};
    use crate::game::world::World;

    fn busy_world() -> (World, Vec<ShipId>) {
        let mut world = World::new(11, 60);
        let ids: Vec<ShipId> = ["Ace", "Bee", "Cat"]
            .iter()
            .map(|h| world.spawn_ship(h))
            .collect();
        (world, ids)
    }

    #[test]
    fn delta_reproduces_next_broadcast_snapshot() {
        let (mut world, ids) = busy_world();
        let mut previous = world.snapshot(0);

        for tick in 0..900u64 {
            for (n, id) in ids.iter().enumerate() {
                let keys = match (tick / 20 + n as u64) % 5 {
                    0 => InputKeys::THRUST | InputKeys::FIRE,
                    1 => InputKeys::ROTATE_LEFT,
                    2 => InputKeys::MINE,
                    3 => InputKeys::THRUST | InputKeys::ROTATE_RIGHT,
                    _ => InputKeys::NONE,
                };
                world.apply_input(*id, &InputCommand::new(keys, tick + 1, 0));
            }
            world.step(true);
            if tick == 450 {
                world.remove_ship(ids[2]);
            }

            if tick % 3 == 2 {
                let current = world.snapshot(tick * 16);
                let delta = diff(&previous, &current);
                assert_eq!(apply(&previous, &delta), current);
                previous = current;
            }
        }
    }

    #[test]
    fn idle_ships_are_left_out() {
        let (mut world, _) = busy_world();
        // let spawn settle
        for _ in 0..3 {
            world.step(false);
        }
        let base = world.snapshot(0);
        world.step(false);
        let delta = diff(&base, &world.snapshot(1));
        assert!(delta.ships.is_empty());
        assert!(delta.is_empty());
    }

    #[test]
    fn removed_entities_are_listed_by_id() {
        let (mut world, ids) = busy_world();
        let base = world.snapshot(0);
        world.remove_ship(ids[1]);
        world.step(false);
        let delta = diff(&base, &world.snapshot(0));
        assert_eq!(delta.removed_ships, vec![ids[1]]);
    }

    #[test]
    fn encoder_sends_every_third_tick_and_full_periodically() {
        let (mut world, _) = busy_world();
        let mut encoder = DeltaEncoder::new(3, 30);
        let mut sent = Vec::new();

        for _ in 0..60 {
            world.step(false);
            if encoder.should_send() {
                let snapshot = world.snapshot(0);
                let full = matches!(encoder.encode(&snapshot), Broadcast::Full);
                sent.push((snapshot.tick, full));
            }
        }

        assert_eq!(sent.len(), 20);
        assert_eq!(sent[0], (3, true));
        assert_eq!(sent[1], (6, false));
        let fulls: Vec<u64> = sent.iter().filter(|(_, f)| *f).map(|(t, _)| *t).collect();
        assert_eq!(fulls, vec![3, 33]);

        encoder.force_full();
        assert!(matches!(encoder.encode(&world.snapshot(0)), Broadcast::Full));
    }
}
