//! Authoritative world state
//!
//! `World` is an explicit value owned by the tick loop. Nothing else holds a
//! mutable reference to it; other components see `WorldSnapshot`s.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::combat::{self, Projectile, ProjectileId, WeaponDischarge, MAX_HEALTH, RESPAWN_SECS};
use super::input::{InputCommand, InputKeys};
use super::physics::{self, ArenaLayout, Obstacle, Tuning, SHIP_RADIUS};
use super::snapshot::WorldSnapshot;

pub type ShipId = u32;

const OBSTACLE_COUNT: usize = 8;
/// Commands a ship may have waiting; older ones are dropped past this
const MAX_PENDING_INPUTS: usize = 16;
const SPAWN_ATTEMPTS: usize = 32;

/// A player's controllable body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ship {
    pub id: ShipId,
    pub handle: String,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    /// Heading in radians, 0..TAU
    pub rotation: f32,
    pub angular_velocity: f32,
    /// 0..=100
    pub heat: f32,
    pub health: f32,
    pub overheated: bool,
    pub alive: bool,
    /// Ticks until respawn while dead
    pub respawn_ticks: u32,
    /// Ticks until the gun can fire again
    pub fire_cooldown: u32,
    /// Ticks the mine key has been held
    pub mine_hold: u32,
    /// Keys latched from the last consumed command
    pub keys: InputKeys,
    /// Sequence of the last applied command
    pub ack_sequence: u64,
}

impl Ship {
    pub fn spawn(id: ShipId, handle: String, x: f32, y: f32, rotation: f32) -> Self {
        let mut ship = Self {
            id,
            handle,
            x,
            y,
            vel_x: 0.0,
            vel_y: 0.0,
            rotation,
            angular_velocity: 0.0,
            heat: 0.0,
            health: MAX_HEALTH,
            overheated: false,
            alive: true,
            respawn_ticks: 0,
            fire_cooldown: 0,
            mine_hold: 0,
            keys: InputKeys::NONE,
            ack_sequence: 0,
        };
        physics::quantize_ship(&mut ship);
        ship
    }

    /// Inputs only steer ships that are alive and not overheated
    pub fn controls_enabled(&self) -> bool {
        self.alive && !self.overheated
    }
}

/// Result of queueing a command for a ship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Queued but ignored by the kernel until the ship cools down
    Overheated,
    ShipDead,
    UnknownShip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathCause {
    Bullet,
    Mine,
}

/// Something that happened during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    Hit {
        shooter: ShipId,
        target: ShipId,
        damage: f32,
    },
    Death {
        victim: ShipId,
        killer: Option<ShipId>,
        cause: DeathCause,
    },
    Respawn {
        ship: ShipId,
        x: f32,
        y: f32,
    },
}

/// Single advance of one ship without interaction with others.
/// Shared by the world step and client-side prediction.
pub fn advance_ship(
    ship: &Ship,
    layout: &ArenaLayout,
    tuning: &Tuning,
    armed: bool,
) -> (Ship, Option<WeaponDischarge>) {
    let mut next = physics::integrate_ship(ship, tuning);
    let discharge = combat::update_weapons(&mut next, tuning, armed);
    if next.alive {
        for obstacle in &layout.obstacles {
            physics::collide_with_obstacle(&mut next, obstacle);
        }
        physics::confine_to_arena(&mut next, layout);
    }
    physics::quantize_ship(&mut next);
    (next, discharge)
}

/// The authoritative simulation state
pub struct World {
    tick: u64,
    ships: BTreeMap<ShipId, Ship>,
    projectiles: BTreeMap<ProjectileId, Projectile>,
    /// Accepted commands not yet simulated, one consumed per tick
    pending_inputs: HashMap<ShipId, VecDeque<InputCommand>>,
    layout: ArenaLayout,
    tuning: Tuning,
    rng: ChaCha8Rng,
    next_ship_id: ShipId,
    next_projectile_id: ProjectileId,
}

impl World {
    pub fn new(seed: u64, tick_rate: u32) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut layout = ArenaLayout::default();
        layout.obstacles = generate_obstacles(&mut rng, &layout);

        Self {
            tick: 0,
            ships: BTreeMap::new(),
            projectiles: BTreeMap::new(),
            pending_inputs: HashMap::new(),
            layout,
            tuning: Tuning::new(tick_rate),
            rng,
            next_ship_id: 1,
            next_projectile_id: 1,
        }
    }

    /// Empty arena without obstacles
    pub fn open_arena(seed: u64, tick_rate: u32) -> Self {
        let mut world = Self::new(seed, tick_rate);
        world.layout.obstacles.clear();
        world
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn ship(&self, id: ShipId) -> Option<&Ship> {
        self.ships.get(&id)
    }

    pub fn ships(&self) -> impl Iterator<Item = &Ship> {
        self.ships.values()
    }

    pub fn ship_count(&self) -> usize {
        self.ships.len()
    }

    pub fn projectiles(&self) -> impl Iterator<Item = &Projectile> {
        self.projectiles.values()
    }

    /// Create a ship at a free spawn point
    pub fn spawn_ship(&mut self, handle: &str) -> ShipId {
        let id = self.next_ship_id;
        self.next_ship_id += 1;
        let (x, y, rotation) = self.spawn_point();
        self.ships
            .insert(id, Ship::spawn(id, handle.to_string(), x, y, rotation));
        id
    }

    pub fn remove_ship(&mut self, id: ShipId) -> Option<Ship> {
        self.projectiles.retain(|_, p| p.owner != id);
        self.pending_inputs.remove(&id);
        self.ships.remove(&id)
    }

    /// Queue a command for its ship. Every command drives exactly one
    /// simulated tick, in arrival order, so a press and release that land
    /// in the same tick both take effect.
    pub fn apply_input(&mut self, id: ShipId, command: &InputCommand) -> ApplyOutcome {
        let Some(ship) = self.ships.get(&id) else {
            return ApplyOutcome::UnknownShip;
        };
        let queue = self.pending_inputs.entry(id).or_default();
        queue.push_back(*command);
        if queue.len() > MAX_PENDING_INPUTS {
            queue.pop_front();
        }

        if !ship.alive {
            ApplyOutcome::ShipDead
        } else if ship.overheated {
            ApplyOutcome::Overheated
        } else {
            ApplyOutcome::Applied
        }
    }

    /// Release all keys, used when the owner drops off
    pub fn clear_controls(&mut self, id: ShipId) {
        self.pending_inputs.remove(&id);
        if let Some(ship) = self.ships.get_mut(&id) {
            ship.keys = InputKeys::NONE;
            ship.mine_hold = 0;
        }
    }

    /// Commands waiting for a ship
    pub fn pending_inputs(&self, id: ShipId) -> usize {
        self.pending_inputs.get(&id).map_or(0, VecDeque::len)
    }

    /// Latch the oldest waiting command. Without one the ship keeps its keys.
    fn latch_next_input(&mut self, id: ShipId) {
        let Some(command) = self.pending_inputs.get_mut(&id).and_then(VecDeque::pop_front) else {
            return;
        };
        if let Some(ship) = self.ships.get_mut(&id) {
            ship.keys = command.keys;
            ship.ack_sequence = command.sequence;
        }
    }

    /// Advance the world one tick. `armed` is false outside combat phases.
    pub fn step(&mut self, armed: bool) -> Vec<WorldEvent> {
        let mut events = Vec::new();
        let mut discharges = Vec::new();

        // Ships, in id order
        let ids: Vec<ShipId> = self.ships.keys().copied().collect();
        for id in &ids {
            self.latch_next_input(*id);
            let Some(ship) = self.ships.get(id) else {
                continue;
            };

            if !ship.alive {
                let mut dead = ship.clone();
                dead.respawn_ticks = dead.respawn_ticks.saturating_sub(1);
                if dead.respawn_ticks == 0 {
                    let (x, y, rotation) = self.spawn_point();
                    let mut reborn = Ship::spawn(*id, dead.handle.clone(), x, y, rotation);
                    reborn.keys = dead.keys;
                    reborn.ack_sequence = dead.ack_sequence;
                    events.push(WorldEvent::Respawn {
                        ship: *id,
                        x: reborn.x,
                        y: reborn.y,
                    });
                    self.ships.insert(*id, reborn);
                } else {
                    self.ships.insert(*id, dead);
                }
                continue;
            }

            let (next, discharge) = advance_ship(ship, &self.layout, &self.tuning, armed);
            if let Some(discharge) = discharge {
                discharges.push((*id, discharge));
            }
            self.ships.insert(*id, next);
        }

        self.resolve_ship_collisions(&ids);

        for (owner, discharge) in discharges {
            let Some(ship) = self.ships.get(&owner) else {
                continue;
            };
            let id = self.next_projectile_id;
            self.next_projectile_id += 1;
            let projectile = match discharge {
                WeaponDischarge::Bullet => Projectile::bullet(id, ship),
                WeaponDischarge::Mine { damage } => Projectile::mine(id, ship, damage),
            };
            self.projectiles.insert(id, projectile);
        }

        self.step_projectiles(&mut events);

        for ship in self.ships.values_mut() {
            physics::quantize_ship(ship);
        }
        self.tick += 1;
        events
    }

    fn resolve_ship_collisions(&mut self, ids: &[ShipId]) {
        for (i, a_id) in ids.iter().enumerate() {
            for b_id in &ids[i + 1..] {
                let (Some(a), Some(b)) = (self.ships.get(a_id), self.ships.get(b_id)) else {
                    continue;
                };
                let (mut a, mut b) = (a.clone(), b.clone());
                if physics::collide_ships(&mut a, &mut b) {
                    physics::confine_to_arena(&mut a, &self.layout);
                    physics::confine_to_arena(&mut b, &self.layout);
                    self.ships.insert(*a_id, a);
                    self.ships.insert(*b_id, b);
                }
            }
        }
    }

    fn step_projectiles(&mut self, events: &mut Vec<WorldEvent>) {
        let mut spent = Vec::new();

        for projectile in self.projectiles.values_mut() {
            projectile.integrate(&self.tuning);

            let blocked = self
                .layout
                .obstacles
                .iter()
                .any(|o| projectile.check_hit(o.x, o.y, o.radius));
            if blocked {
                spent.push(projectile.id);
                continue;
            }

            let target = self
                .ships
                .values_mut()
                .filter(|s| s.alive && s.id != projectile.owner)
                .find(|s| projectile.check_hit(s.x, s.y, SHIP_RADIUS));

            if let Some(target) = target {
                let damage = projectile.damage();
                let lethal = combat::apply_damage(target, damage);
                events.push(WorldEvent::Hit {
                    shooter: projectile.owner,
                    target: target.id,
                    damage,
                });
                if lethal {
                    target.alive = false;
                    target.respawn_ticks = self.tuning.ticks(RESPAWN_SECS);
                    target.vel_x = 0.0;
                    target.vel_y = 0.0;
                    target.angular_velocity = 0.0;
                    target.mine_hold = 0;
                    events.push(WorldEvent::Death {
                        victim: target.id,
                        killer: Some(projectile.owner),
                        cause: match projectile.kind {
                            combat::ProjectileKind::Bullet => DeathCause::Bullet,
                            combat::ProjectileKind::Mine { .. } => DeathCause::Mine,
                        },
                    });
                }
                spent.push(projectile.id);
                continue;
            }

            if projectile.expired(&self.tuning) {
                spent.push(projectile.id);
            }
        }

        for id in spent {
            self.projectiles.remove(&id);
        }
    }

    /// Pick a spawn point clear of obstacles and other ships
    fn spawn_point(&mut self) -> (f32, f32, f32) {
        let margin = SHIP_RADIUS * 4.0;
        let mut candidate = (self.layout.width / 2.0, self.layout.height / 2.0);
        for _ in 0..SPAWN_ATTEMPTS {
            let x = self.rng.gen_range(margin..self.layout.width - margin);
            let y = self.rng.gen_range(margin..self.layout.height - margin);
            candidate = (x, y);
            let clear_of_rocks = self.layout.obstacles.iter().all(|o| {
                let (dx, dy) = (x - o.x, y - o.y);
                dx * dx + dy * dy > (o.radius + margin).powi(2)
            });
            let clear_of_ships = self.ships.values().filter(|s| s.alive).all(|s| {
                let (dx, dy) = (x - s.x, y - s.y);
                dx * dx + dy * dy > margin * margin
            });
            if clear_of_rocks && clear_of_ships {
                break;
            }
        }
        let rotation = self.rng.gen_range(0.0..std::f32::consts::TAU);
        (candidate.0, candidate.1, rotation)
    }

    /// Immutable copy of the current state
    pub fn snapshot(&self, timestamp: u64) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            timestamp,
            ships: self.ships.clone(),
            projectiles: self.projectiles.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn ship_mut(&mut self, id: ShipId) -> Option<&mut Ship> {
        self.ships.get_mut(&id)
    }
}

fn generate_obstacles(rng: &mut ChaCha8Rng, layout: &ArenaLayout) -> Vec<Obstacle> {
    (0..OBSTACLE_COUNT)
        .map(|_| {
            let radius = rng.gen_range(30.0..80.0_f32).round();
            Obstacle {
                x: rng.gen_range(radius + 100.0..layout.width - radius - 100.0).round(),
                y: rng.gen_range(radius + 100.0..layout.height - radius - 100.0).round(),
                radius,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::combat::BULLET_DAMAGE;

    fn duel() -> (World, ShipId, ShipId) {
        let mut world = World::open_arena(7, 60);
        let a = world.spawn_ship("Ace");
        let b = world.spawn_ship("Bee");
        {
            let ship = world.ship_mut(a).unwrap();
            ship.x = 500.0;
            ship.y = 500.0;
            ship.rotation = 0.0;
        }
        {
            let ship = world.ship_mut(b).unwrap();
            ship.x = 545.0;
            ship.y = 500.0;
        }
        (world, a, b)
    }

    fn press(world: &mut World, id: ShipId, keys: InputKeys, sequence: u64) {
        world.apply_input(id, &InputCommand::new(keys, sequence, 0));
    }

    #[test]
    fn identical_inputs_produce_identical_worlds() {
        let script: Vec<InputKeys> = (0..600)
            .map(|i| match i % 7 {
                0 | 1 => InputKeys::THRUST,
                2 => InputKeys::THRUST | InputKeys::ROTATE_LEFT,
                3 => InputKeys::FIRE,
                4 => InputKeys::MINE,
                5 => InputKeys::ROTATE_RIGHT | InputKeys::FIRE,
                _ => InputKeys::NONE,
            })
            .collect();

        let run = || {
            let mut world = World::new(42, 60);
            let a = world.spawn_ship("Ace");
            let b = world.spawn_ship("Bee");
            let mut snapshots = Vec::new();
            for (i, keys) in script.iter().enumerate() {
                press(&mut world, a, *keys, i as u64 + 1);
                press(&mut world, b, script[(i * 3) % script.len()], i as u64 + 1);
                world.step(true);
                snapshots.push(world.snapshot(0));
            }
            snapshots
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn bullet_hit_costs_ten_health() {
        let (mut world, a, b) = duel();
        press(&mut world, a, InputKeys::FIRE, 1);
        let mut hit = None;
        for _ in 0..3 {
            let events = world.step(true);
            press(&mut world, a, InputKeys::NONE, 2);
            if let Some(event) = events.into_iter().find(|e| matches!(e, WorldEvent::Hit { .. })) {
                hit = Some(event);
            }
        }
        assert_eq!(
            hit,
            Some(WorldEvent::Hit {
                shooter: a,
                target: b,
                damage: BULLET_DAMAGE
            })
        );
        assert_eq!(world.ship(b).unwrap().health, 90.0);
        assert_eq!(world.projectiles().count(), 0);
    }

    #[test]
    fn queued_commands_each_drive_one_tick() {
        let (mut world, a, _) = duel();
        press(&mut world, a, InputKeys::FIRE, 1);
        press(&mut world, a, InputKeys::NONE, 2);
        assert_eq!(world.pending_inputs(a), 2);

        world.step(true);
        assert_eq!(world.ship(a).unwrap().ack_sequence, 1);
        assert_eq!(world.projectiles().count(), 1);

        world.step(true);
        let ship = world.ship(a).unwrap();
        assert_eq!(ship.ack_sequence, 2);
        assert_eq!(ship.keys, InputKeys::NONE);
        assert_eq!(world.pending_inputs(a), 0);
    }

    #[test]
    fn lethal_hit_kills_then_respawns() {
        let (mut world, a, b) = duel();
        world.ship_mut(b).unwrap().health = 10.0;
        press(&mut world, a, InputKeys::FIRE, 1);

        let mut events = Vec::new();
        for _ in 0..3 {
            events.extend(world.step(true));
        }
        assert!(events.contains(&WorldEvent::Death {
            victim: b,
            killer: Some(a),
            cause: DeathCause::Bullet
        }));
        assert!(!world.ship(b).unwrap().alive);

        let respawn_ticks = world.tuning().ticks(RESPAWN_SECS);
        let mut respawned = false;
        for _ in 0..respawn_ticks {
            respawned |= world
                .step(false)
                .iter()
                .any(|e| matches!(e, WorldEvent::Respawn { ship, .. } if *ship == b));
        }
        assert!(respawned);
        let ship = world.ship(b).unwrap();
        assert!(ship.alive);
        assert_eq!(ship.health, MAX_HEALTH);
    }

    #[test]
    fn disarmed_world_fires_nothing() {
        let (mut world, a, _) = duel();
        press(&mut world, a, InputKeys::FIRE, 1);
        world.step(false);
        assert_eq!(world.projectiles().count(), 0);
    }

    #[test]
    fn inputs_against_dead_ship_are_reported() {
        let (mut world, _, b) = duel();
        world.ship_mut(b).unwrap().alive = false;
        let outcome = world.apply_input(b, &InputCommand::new(InputKeys::THRUST, 1, 0));
        assert_eq!(outcome, ApplyOutcome::ShipDead);
        assert_eq!(world.apply_input(99, &InputCommand::new(InputKeys::THRUST, 1, 0)), ApplyOutcome::UnknownShip);
    }

    #[test]
    fn removing_ship_removes_its_projectiles() {
        let (mut world, a, _) = duel();
        world.ship_mut(a).unwrap().rotation = std::f32::consts::PI;
        press(&mut world, a, InputKeys::FIRE, 1);
        world.step(true);
        assert_eq!(world.projectiles().count(), 1);
        world.remove_ship(a);
        assert_eq!(world.projectiles().count(), 0);
    }
}
