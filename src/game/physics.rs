//! Deterministic ship kinematics over a fixed timestep
//!
//! Everything here is a pure function of explicit state so the authoritative
//! loop and the client predictor run identical code. Ships are processed in
//! ascending id order by callers and every tick ends with `quantize_ship`,
//! which keeps snapshots exactly reproducible on the wire.

use serde::{Deserialize, Serialize};

use crate::util::time::{secs_to_ticks, tick_delta};

use super::input::InputKeys;
use super::world::Ship;

/// Circumradius of the ship triangle (px)
pub const SHIP_RADIUS: f32 = 15.0;
/// Mass per px² of hull
pub const SHIP_DENSITY: f32 = 0.01;
/// Force applied along the heading while thrusting
pub const THRUST_FORCE: f32 = 600.0;
/// Fraction of linear velocity removed per second
pub const LINEAR_DAMPING: f32 = 0.4;
/// Angular velocity set by the rotation keys (rad/s)
pub const ROTATION_SPEED: f32 = 4.0;
pub const MAX_SPEED: f32 = 350.0;
/// Below this speed a ship is put to rest
pub const REST_SPEED: f32 = 1.0;
/// Ship/ship and ship/wall bounce factor
pub const RESTITUTION: f32 = 0.6;

pub const MAX_HEAT: f32 = 100.0;
/// Overheated ships regain control once heat drops below this
pub const OVERHEAT_RECOVERY: f32 = 50.0;
pub const HEAT_PER_THRUST_SECOND: f32 = 25.0;
pub const HEAT_DECAY_PER_SECOND: f32 = 10.0;

// Wire quantization steps. Values on this grid survive JSON exactly.
const POSITION_SCALE: f32 = 100.0;
const VELOCITY_SCALE: f32 = 100.0;
const ROTATION_SCALE: f32 = 10_000.0;
const HEAT_SCALE: f32 = 100.0;

/// Per-tick constants derived from the tick rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub tick_rate: u32,
    pub dt: f32,
}

impl Tuning {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            tick_rate,
            dt: tick_delta(tick_rate),
        }
    }

    pub fn ticks(&self, secs: f32) -> u32 {
        secs_to_ticks(secs, self.tick_rate)
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self::new(60)
    }
}

/// Static circular rock
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

/// Arena bounds and obstacles, fixed for the lifetime of a world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaLayout {
    pub width: f32,
    pub height: f32,
    pub obstacles: Vec<Obstacle>,
}

impl Default for ArenaLayout {
    fn default() -> Self {
        Self {
            width: 2_000.0,
            height: 2_000.0,
            obstacles: Vec::new(),
        }
    }
}

/// Mass of a ship hull: equilateral triangle inscribed in `SHIP_RADIUS`
pub fn ship_mass() -> f32 {
    let area = 3.0 * 3.0_f32.sqrt() / 4.0 * SHIP_RADIUS * SHIP_RADIUS;
    area * SHIP_DENSITY
}

/// Keys the kernel honours this tick. Dead or overheated ships get none.
pub fn effective_keys(ship: &Ship) -> InputKeys {
    if ship.controls_enabled() {
        ship.keys
    } else {
        InputKeys::NONE
    }
}

/// Advance one ship by one tick: rotation, thrust, damping, heat.
pub fn integrate_ship(ship: &Ship, tuning: &Tuning) -> Ship {
    let mut next = ship.clone();
    if !next.alive {
        return next;
    }

    let dt = tuning.dt;
    let keys = effective_keys(ship);

    // Rotation keys set angular velocity directly
    next.angular_velocity = match (
        keys.contains(InputKeys::ROTATE_LEFT),
        keys.contains(InputKeys::ROTATE_RIGHT),
    ) {
        (true, false) => -ROTATION_SPEED,
        (false, true) => ROTATION_SPEED,
        _ => 0.0,
    };
    next.rotation = (next.rotation + next.angular_velocity * dt).rem_euclid(std::f32::consts::TAU);

    if keys.contains(InputKeys::THRUST) {
        let accel = THRUST_FORCE / ship_mass();
        next.vel_x += next.rotation.cos() * accel * dt;
        next.vel_y += next.rotation.sin() * accel * dt;
        next.heat += HEAT_PER_THRUST_SECOND * dt;
    }

    let damping = (1.0 - LINEAR_DAMPING * dt).max(0.0);
    next.vel_x *= damping;
    next.vel_y *= damping;

    let speed = (next.vel_x * next.vel_x + next.vel_y * next.vel_y).sqrt();
    if speed > MAX_SPEED {
        let scale = MAX_SPEED / speed;
        next.vel_x *= scale;
        next.vel_y *= scale;
    } else if speed < REST_SPEED && !keys.contains(InputKeys::THRUST) {
        next.vel_x = 0.0;
        next.vel_y = 0.0;
    }

    next.x += next.vel_x * dt;
    next.y += next.vel_y * dt;

    next.heat = (next.heat - HEAT_DECAY_PER_SECOND * dt).max(0.0);
    update_overheat(&mut next);
    next
}

/// Apply the overheat hysteresis after heat changed
pub fn update_overheat(ship: &mut Ship) {
    if ship.heat >= MAX_HEAT {
        ship.heat = MAX_HEAT;
        ship.overheated = true;
    } else if ship.overheated && ship.heat < OVERHEAT_RECOVERY {
        ship.overheated = false;
    }
}

/// Keep a ship inside the arena, bouncing off the walls
pub fn confine_to_arena(ship: &mut Ship, layout: &ArenaLayout) {
    let (min_x, max_x) = (SHIP_RADIUS, layout.width - SHIP_RADIUS);
    let (min_y, max_y) = (SHIP_RADIUS, layout.height - SHIP_RADIUS);

    if ship.x < min_x {
        ship.x = min_x;
        ship.vel_x = ship.vel_x.abs() * RESTITUTION;
    } else if ship.x > max_x {
        ship.x = max_x;
        ship.vel_x = -ship.vel_x.abs() * RESTITUTION;
    }

    if ship.y < min_y {
        ship.y = min_y;
        ship.vel_y = ship.vel_y.abs() * RESTITUTION;
    } else if ship.y > max_y {
        ship.y = max_y;
        ship.vel_y = -ship.vel_y.abs() * RESTITUTION;
    }
}

/// Push a ship out of an obstacle and reflect its inbound velocity.
/// Returns true when they touched.
pub fn collide_with_obstacle(ship: &mut Ship, obstacle: &Obstacle) -> bool {
    let dx = ship.x - obstacle.x;
    let dy = ship.y - obstacle.y;
    let combined = SHIP_RADIUS + obstacle.radius;
    let dist_sq = dx * dx + dy * dy;
    if dist_sq >= combined * combined {
        return false;
    }

    let dist = dist_sq.sqrt();
    let (nx, ny) = if dist < 0.001 { (1.0, 0.0) } else { (dx / dist, dy / dist) };

    ship.x = obstacle.x + nx * combined;
    ship.y = obstacle.y + ny * combined;

    let inbound = ship.vel_x * nx + ship.vel_y * ny;
    if inbound < 0.0 {
        let impulse = (1.0 + RESTITUTION) * inbound;
        ship.vel_x -= impulse * nx;
        ship.vel_y -= impulse * ny;
    }
    true
}

/// Resolve overlap between two equal-mass ships.
/// Returns true when they touched.
pub fn collide_ships(a: &mut Ship, b: &mut Ship) -> bool {
    if !a.alive || !b.alive {
        return false;
    }

    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let combined = SHIP_RADIUS * 2.0;
    let dist_sq = dx * dx + dy * dy;
    if dist_sq >= combined * combined {
        return false;
    }

    let dist = dist_sq.sqrt();
    let (nx, ny) = if dist < 0.001 { (1.0, 0.0) } else { (dx / dist, dy / dist) };

    // Push apart by half the overlap each
    let push = (combined - dist) / 2.0;
    a.x -= nx * push;
    a.y -= ny * push;
    b.x += nx * push;
    b.y += ny * push;

    let closing = (b.vel_x - a.vel_x) * nx + (b.vel_y - a.vel_y) * ny;
    if closing < 0.0 {
        let impulse = -(1.0 + RESTITUTION) * closing / 2.0;
        a.vel_x -= impulse * nx;
        a.vel_y -= impulse * ny;
        b.vel_x += impulse * nx;
        b.vel_y += impulse * ny;
    }
    true
}

/// Snap a value onto a grid of `1 / scale`
pub fn quantize(value: f32, scale: f32) -> f32 {
    (value * scale).round() / scale
}

/// Snap all continuous ship fields onto the wire grid
pub fn quantize_ship(ship: &mut Ship) {
    ship.x = quantize(ship.x, POSITION_SCALE);
    ship.y = quantize(ship.y, POSITION_SCALE);
    ship.vel_x = quantize(ship.vel_x, VELOCITY_SCALE);
    ship.vel_y = quantize(ship.vel_y, VELOCITY_SCALE);
    ship.rotation = quantize(ship.rotation, ROTATION_SCALE);
    ship.angular_velocity = quantize(ship.angular_velocity, ROTATION_SCALE);
    ship.heat = quantize(ship.heat, HEAT_SCALE);
    ship.health = quantize(ship.health, HEAT_SCALE);
}

pub fn quantize_position(value: f32) -> f32 {
    quantize(value, POSITION_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ship_at(x: f32, y: f32) -> Ship {
        Ship::spawn(1, "Ace".to_string(), x, y, 0.0)
    }

    #[test]
    fn thrust_accelerates_along_heading() {
        let tuning = Tuning::default();
        let mut ship = ship_at(500.0, 500.0);
        ship.keys = InputKeys::THRUST;

        let next = integrate_ship(&ship, &tuning);
        assert!(next.vel_x > 0.0);
        assert_eq!(next.vel_y, 0.0);
        assert!(next.x > 500.0);
        assert!(next.heat > 0.0);
    }

    #[test]
    fn rotation_keys_set_angular_velocity_directly() {
        let tuning = Tuning::default();
        let mut ship = ship_at(500.0, 500.0);
        ship.keys = InputKeys::ROTATE_RIGHT;

        let next = integrate_ship(&ship, &tuning);
        assert_eq!(next.angular_velocity, ROTATION_SPEED);
        assert!((next.rotation - ROTATION_SPEED * tuning.dt).abs() < 1e-6);

        ship.keys = InputKeys::ROTATE_LEFT | InputKeys::ROTATE_RIGHT;
        assert_eq!(integrate_ship(&ship, &tuning).angular_velocity, 0.0);
    }

    #[test]
    fn damping_brings_drifting_ship_to_rest() {
        let tuning = Tuning::default();
        let mut ship = ship_at(500.0, 500.0);
        ship.vel_x = 50.0;

        for _ in 0..3_000 {
            ship = integrate_ship(&ship, &tuning);
            quantize_ship(&mut ship);
        }
        assert_eq!(ship.vel_x, 0.0);
    }

    #[test]
    fn overheat_hysteresis() {
        let mut ship = ship_at(0.0, 0.0);
        ship.heat = 100.0;
        update_overheat(&mut ship);
        assert!(ship.overheated);

        ship.heat = 60.0;
        update_overheat(&mut ship);
        assert!(ship.overheated);

        ship.heat = 49.0;
        update_overheat(&mut ship);
        assert!(!ship.overheated);
    }

    #[test]
    fn walls_bounce_ships_back_inside() {
        let layout = ArenaLayout::default();
        let mut ship = ship_at(-10.0, 100.0);
        ship.vel_x = -100.0;
        confine_to_arena(&mut ship, &layout);
        assert_eq!(ship.x, SHIP_RADIUS);
        assert!(ship.vel_x > 0.0);
    }

    #[test]
    fn head_on_ships_separate_and_exchange_momentum() {
        let mut a = ship_at(100.0, 100.0);
        let mut b = ship_at(120.0, 100.0);
        a.vel_x = 50.0;
        b.vel_x = -50.0;

        assert!(collide_ships(&mut a, &mut b));
        assert!(b.x - a.x >= SHIP_RADIUS * 2.0 - 1e-3);
        assert!(a.vel_x < 0.0);
        assert!(b.vel_x > 0.0);
        assert!((a.vel_x + b.vel_x).abs() < 1e-3);
    }

    #[test]
    fn obstacle_reflects_inbound_velocity() {
        let rock = Obstacle {
            x: 100.0,
            y: 100.0,
            radius: 30.0,
        };
        let mut ship = ship_at(60.0, 100.0);
        ship.vel_x = 80.0;
        assert!(collide_with_obstacle(&mut ship, &rock));
        assert!(ship.vel_x < 0.0);
        assert!((ship.x - (100.0 - 45.0)).abs() < 1e-3);
    }

    #[test]
    fn quantize_is_idempotent() {
        let v = quantize(123.456_78, 100.0);
        assert_eq!(quantize(v, 100.0), v);
    }
}
