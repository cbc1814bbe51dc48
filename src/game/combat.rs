//! Combat system - weapons, projectiles, damage

use serde::{Deserialize, Serialize};

use super::input::InputKeys;
use super::physics::{self, quantize_position, Tuning, SHIP_RADIUS};
use super::world::{Ship, ShipId};

pub type ProjectileId = u32;

pub const MAX_HEALTH: f32 = 100.0;
/// Bullets take 10% of a full shield per hit
pub const BULLET_DAMAGE: f32 = MAX_HEALTH * 0.10;
pub const BULLET_SPEED: f32 = 600.0;
pub const BULLET_RANGE: f32 = 400.0;
pub const BULLET_RADIUS: f32 = 2.0;
pub const FIRE_COOLDOWN_SECS: f32 = 0.2;
pub const HEAT_PER_SHOT: f32 = 4.0;

pub const MINE_RADIUS: f32 = 8.0;
pub const MINE_LIFETIME_SECS: f32 = 20.0;
/// Hold time to reach full charge
pub const MINE_FULL_CHARGE_SECS: f32 = 1.5;
/// Holding past full charge bleeds it off over this long
pub const MINE_CHARGE_DECAY_SECS: f32 = 3.0;
pub const MINE_MIN_DAMAGE_PCT: f32 = 1.0;
pub const MINE_MAX_DAMAGE_PCT: f32 = 50.0;
pub const HEAT_PER_MINE: f32 = 15.0;

pub const RESPAWN_SECS: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectileKind {
    Bullet,
    Mine { damage: f32 },
}

/// Active projectile in the world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projectile {
    pub id: ProjectileId,
    pub owner: ShipId,
    pub kind: ProjectileKind,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    /// Distance covered since launch (px)
    pub traveled: f32,
    /// Ticks since launch
    pub age: u32,
}

impl Projectile {
    /// Bullet leaving the nose of `ship`
    pub fn bullet(id: ProjectileId, ship: &Ship) -> Self {
        let (dir_x, dir_y) = (ship.rotation.cos(), ship.rotation.sin());
        Self {
            id,
            owner: ship.id,
            kind: ProjectileKind::Bullet,
            x: quantize_position(ship.x + dir_x * SHIP_RADIUS),
            y: quantize_position(ship.y + dir_y * SHIP_RADIUS),
            vel_x: quantize_position(ship.vel_x + dir_x * BULLET_SPEED),
            vel_y: quantize_position(ship.vel_y + dir_y * BULLET_SPEED),
            traveled: 0.0,
            age: 0,
        }
    }

    /// Stationary mine dropped behind `ship`
    pub fn mine(id: ProjectileId, ship: &Ship, damage: f32) -> Self {
        let (dir_x, dir_y) = (ship.rotation.cos(), ship.rotation.sin());
        Self {
            id,
            owner: ship.id,
            kind: ProjectileKind::Mine { damage },
            x: quantize_position(ship.x - dir_x * (SHIP_RADIUS + MINE_RADIUS)),
            y: quantize_position(ship.y - dir_y * (SHIP_RADIUS + MINE_RADIUS)),
            vel_x: 0.0,
            vel_y: 0.0,
            traveled: 0.0,
            age: 0,
        }
    }

    pub fn radius(&self) -> f32 {
        match self.kind {
            ProjectileKind::Bullet => BULLET_RADIUS,
            ProjectileKind::Mine { .. } => MINE_RADIUS,
        }
    }

    pub fn damage(&self) -> f32 {
        match self.kind {
            ProjectileKind::Bullet => BULLET_DAMAGE,
            ProjectileKind::Mine { damage } => damage,
        }
    }

    /// Move one tick
    pub fn integrate(&mut self, tuning: &Tuning) {
        let dx = self.vel_x * tuning.dt;
        let dy = self.vel_y * tuning.dt;
        self.x = quantize_position(self.x + dx);
        self.y = quantize_position(self.y + dy);
        self.traveled = quantize_position(self.traveled + (dx * dx + dy * dy).sqrt());
        self.age += 1;
    }

    /// Past max range (bullets) or lifetime (mines)
    pub fn expired(&self, tuning: &Tuning) -> bool {
        match self.kind {
            ProjectileKind::Bullet => self.traveled >= BULLET_RANGE,
            ProjectileKind::Mine { .. } => self.age >= tuning.ticks(MINE_LIFETIME_SECS),
        }
    }

    /// Check collision with a circular target
    pub fn check_hit(&self, target_x: f32, target_y: f32, target_radius: f32) -> bool {
        let dx = self.x - target_x;
        let dy = self.y - target_y;
        let combined = self.radius() + target_radius;
        dx * dx + dy * dy <= combined * combined
    }
}

/// What a ship asked its weapons to do this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeaponDischarge {
    Bullet,
    Mine { damage: f32 },
}

/// Mine damage as a share of max health for a hold of `hold_ticks`.
/// Rises from 1% to 50% over the charge time, then decays back while held.
pub fn mine_damage(hold_ticks: u32, tuning: &Tuning) -> f32 {
    let held = hold_ticks as f32 * tuning.dt;
    let charge = if held <= MINE_FULL_CHARGE_SECS {
        held / MINE_FULL_CHARGE_SECS
    } else {
        1.0 - (held - MINE_FULL_CHARGE_SECS) / MINE_CHARGE_DECAY_SECS
    }
    .clamp(0.0, 1.0);

    let pct = MINE_MIN_DAMAGE_PCT + (MINE_MAX_DAMAGE_PCT - MINE_MIN_DAMAGE_PCT) * charge;
    physics::quantize(MAX_HEALTH * pct / 100.0, 100.0)
}

/// Run the weapon state machine for one ship. Cooldown always ticks down;
/// firing and mine charging need live controls and an armed arena.
pub fn update_weapons(ship: &mut Ship, tuning: &Tuning, armed: bool) -> Option<WeaponDischarge> {
    ship.fire_cooldown = ship.fire_cooldown.saturating_sub(1);

    if !ship.alive {
        return None;
    }
    if !ship.controls_enabled() || !armed {
        ship.mine_hold = 0;
        return None;
    }

    let keys = ship.keys;
    let mut discharge = None;

    if keys.contains(InputKeys::FIRE) && ship.fire_cooldown == 0 {
        ship.fire_cooldown = tuning.ticks(FIRE_COOLDOWN_SECS);
        ship.heat += HEAT_PER_SHOT;
        discharge = Some(WeaponDischarge::Bullet);
    } else if keys.contains(InputKeys::MINE) {
        ship.mine_hold += 1;
    } else if ship.mine_hold > 0 {
        let damage = mine_damage(ship.mine_hold, tuning);
        ship.mine_hold = 0;
        ship.heat += HEAT_PER_MINE;
        discharge = Some(WeaponDischarge::Mine { damage });
    }

    physics::update_overheat(ship);
    discharge
}

/// Apply damage to health, returns true when this hit was lethal
pub fn apply_damage(ship: &mut Ship, damage: f32) -> bool {
    if !ship.alive {
        return false;
    }
    ship.health = physics::quantize((ship.health - damage).max(0.0), 100.0);
    ship.health <= 0.0
}
