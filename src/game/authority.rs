//! Authoritative tick loop
//!
//! One task owns the `World`, the session state machine and the retention
//! table. Connection tasks talk to it through `LoopHandle`: inputs go
//! through the `InputGate`, control requests (join, leave, chat) through a
//! command channel, and everything outbound leaves through the
//! `Broadcaster`. Each tick runs in a fixed order:
//!
//! 1. control commands
//! 2. queued inputs, in arrival order
//! 3. corrections for rate-limited connections
//! 4. world step
//! 5. death and respawn bookkeeping
//! 6. phase clock and relegation
//! 7. retention expiry
//! 8. world broadcast on broadcast ticks

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broadcast::Broadcaster;
use super::input::{ConnectionId, InputGate, InputQueue};
use super::snapshot::DeltaEncoder;
use super::world::{ApplyOutcome, ShipId, World, WorldEvent};
use crate::config::Config;
use crate::session::{JoinError, PhaseKind, SessionEvent, SessionManager};
use crate::util::time::{tick_millis, unix_millis, Timer};
use crate::ws::protocol::{
    ChatLine, ConnectRequest, Correction, DeathNotice, ErrorCode, PhaseInfo, RespawnNotice,
    ServerMsg, Welcome,
};
use crate::ws::supervisor::{RetainedSession, RetentionTable};

pub const MAX_CHAT_LEN: usize = 200;

const COMMAND_CAPACITY: usize = 256;

/// Why a connection left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    HeartbeatTimeout,
    ProtocolError,
}

/// Control requests from connection tasks
#[derive(Debug)]
pub enum LoopCommand {
    Join {
        connection: ConnectionId,
        request: ConnectRequest,
        reply: oneshot::Sender<Result<Welcome, JoinError>>,
    },
    Disconnect {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
    Chat {
        connection: ConnectionId,
        text: String,
    },
}

/// Published once per tick for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub tick: u64,
    pub phase: PhaseKind,
    pub phase_remaining_ms: u64,
    pub ships: usize,
    pub retained: usize,
    pub overruns: u64,
    pub last_tick_micros: u64,
}

/// Cloneable access to a running loop
#[derive(Clone)]
pub struct LoopHandle {
    commands: mpsc::Sender<LoopCommand>,
    pub gate: Arc<InputGate>,
    pub broadcaster: Arc<Broadcaster>,
    status: Arc<RwLock<LoopStatus>>,
}

impl LoopHandle {
    /// Ask the loop to admit a connection. The loop sends `SERVER_WELCOME`
    /// or `CONNECTION_ERROR` itself; the result tells the caller which.
    pub async fn join(&self, connection: ConnectionId, request: ConnectRequest) -> Result<Welcome, JoinError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(LoopCommand::Join {
                connection,
                request,
                reply,
            })
            .await
            .map_err(|_| JoinError::Unavailable)?;
        response.await.map_err(|_| JoinError::Unavailable)?
    }

    pub async fn disconnect(&self, connection: ConnectionId, reason: DisconnectReason) {
        let _ = self
            .commands
            .send(LoopCommand::Disconnect { connection, reason })
            .await;
    }

    pub async fn chat(&self, connection: ConnectionId, text: String) {
        let _ = self.commands.send(LoopCommand::Chat { connection, text }).await;
    }

    pub fn status(&self) -> LoopStatus {
        self.status.read().clone()
    }
}

/// A connection bound to a ship
#[derive(Debug, Clone)]
struct LiveSession {
    handle: String,
    session_id: Uuid,
    ship_id: ShipId,
}

pub struct AuthoritativeLoop {
    config: Arc<Config>,
    world: World,
    inputs: InputQueue,
    gate: Arc<InputGate>,
    broadcaster: Arc<Broadcaster>,
    encoder: DeltaEncoder,
    session: SessionManager,
    retention: RetentionTable,
    commands: mpsc::Receiver<LoopCommand>,
    live: HashMap<ConnectionId, LiveSession>,
    status: Arc<RwLock<LoopStatus>>,
    overruns: u64,
}

impl AuthoritativeLoop {
    pub fn new(config: Arc<Config>) -> (Self, LoopHandle) {
        let (gate, inputs) = InputGate::new(&config);
        let gate = Arc::new(gate);
        let broadcaster = Arc::new(Broadcaster::new(config.outbox_capacity));
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        let session = SessionManager::new(&config, 0);
        let status = Arc::new(RwLock::new(LoopStatus {
            tick: 0,
            phase: session.phase(),
            phase_remaining_ms: session.remaining_ms(0),
            ships: 0,
            retained: 0,
            overruns: 0,
            last_tick_micros: 0,
        }));

        let handle = LoopHandle {
            commands: command_tx,
            gate: gate.clone(),
            broadcaster: broadcaster.clone(),
            status: status.clone(),
        };

        let game_loop = Self {
            world: World::new(config.world_seed, config.tick_rate),
            inputs,
            gate,
            broadcaster,
            encoder: DeltaEncoder::new(config.ticks_per_broadcast(), config.ticks_per_full_sync()),
            session,
            retention: RetentionTable::new(config.retention_window_secs),
            commands,
            live: HashMap::new(),
            status,
            overruns: 0,
            config,
        };

        (game_loop, handle)
    }

    /// Run the fixed-rate loop until every handle is dropped
    pub async fn run(mut self) {
        info!(
            tick_rate = self.config.tick_rate,
            broadcast_rate = self.config.broadcast_rate,
            "Authoritative loop started"
        );

        let tick_duration = self.config.tick_duration();
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            let timer = Timer::new();
            if !self.tick() {
                break;
            }
            let elapsed = timer.elapsed();
            if elapsed > tick_duration {
                self.overruns += 1;
                warn!(
                    tick = self.world.tick(),
                    elapsed_micros = elapsed.as_micros() as u64,
                    "Tick overran its budget"
                );
            }
            self.publish_status(timer.elapsed_micros());
        }

        info!(tick = self.world.tick(), "Authoritative loop stopped");
    }

    fn now_ms(&self) -> u64 {
        tick_millis(self.world.tick(), self.config.tick_rate)
    }

    /// Advance one tick. Returns false once the command channel is gone.
    pub fn tick(&mut self) -> bool {
        let open = self.drain_commands();
        self.apply_inputs();
        self.send_rate_corrections();

        let armed = self.session.phase() == PhaseKind::Active;
        let events = self.world.step(armed);
        let now = self.now_ms();

        self.handle_world_events(events, now);
        let phase_events = self.session.advance(now);
        self.handle_session_events(phase_events);
        self.expire_retained(now);

        if self.encoder.should_send() {
            let snapshot = self.world.snapshot(unix_millis());
            let broadcast = self.encoder.encode(&snapshot);
            self.broadcaster.publish_world(&broadcast, &snapshot);
        }
        open
    }

    fn publish_status(&self, last_tick_micros: u64) {
        let now = self.now_ms();
        *self.status.write() = LoopStatus {
            tick: self.world.tick(),
            phase: self.session.phase(),
            phase_remaining_ms: self.session.remaining_ms(now),
            ships: self.world.ship_count(),
            retained: self.retention.len(),
            overruns: self.overruns,
            last_tick_micros,
        };
    }

    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Join {
                connection,
                request,
                reply,
            } => {
                let result = self.join(connection, &request);
                let _ = reply.send(result);
            }
            LoopCommand::Disconnect { connection, reason } => self.disconnect(connection, reason),
            LoopCommand::Chat { connection, text } => self.chat(connection, &text),
        }
    }

    /// Admit a connection: fresh reservation, resume from retention, or
    /// takeover of a live session holding the same token.
    fn join(&mut self, connection: ConnectionId, request: &ConnectRequest) -> Result<Welcome, JoinError> {
        let handle = request.handle.as_str();
        let result = match request.resume_token {
            Some(token) if self.session.is_reserved(handle) => self.resume(connection, handle, token),
            _ => self.admit_new(connection, handle),
        };

        match result {
            Ok(welcome) => {
                self.broadcaster.activate(connection);
                if let Err(e) = self
                    .broadcaster
                    .send_to(connection, &ServerMsg::ServerWelcome(welcome.clone()))
                {
                    warn!(connection, error = %e, "Failed to queue welcome");
                }
                info!(
                    connection,
                    handle = %welcome.handle,
                    ship_id = welcome.ship_id,
                    resumed = welcome.resumed,
                    "Player joined"
                );
                Ok(welcome)
            }
            Err(e) => {
                debug!(connection, handle = %handle, error = %e, "Join refused");
                self.broadcaster.close(connection, e.code(), e.to_string());
                Err(e)
            }
        }
    }

    fn admit_new(&mut self, connection: ConnectionId, handle: &str) -> Result<Welcome, JoinError> {
        let session_id = self.session.reserve(handle, unix_millis())?;
        let ship_id = self.world.spawn_ship(handle);
        self.session.attach_ship(handle, ship_id, self.now_ms());
        Ok(self.bind(connection, handle, session_id, ship_id, false))
    }

    fn resume(&mut self, connection: ConnectionId, handle: &str, token: Uuid) -> Result<Welcome, JoinError> {
        let now = self.now_ms();

        if self.retention.contains(handle) {
            let retained = self.retention.resume(handle, token, now)?;
            self.session.reactivate(handle);
            return Ok(self.bind(connection, handle, retained.session_id, retained.ship_id, true));
        }

        let holder = self
            .live
            .iter()
            .find(|(_, live)| live.handle == handle)
            .map(|(conn, live)| (*conn, live.clone()));
        if let Some((previous, live)) = holder {
            if live.session_id != token {
                return Err(JoinError::HandleConflict(handle.to_string()));
            }
            info!(handle = %handle, previous, connection, "Session taken over by new connection");
            self.live.remove(&previous);
            self.gate.release(previous);
            self.broadcaster.close(
                previous,
                ErrorCode::SessionReplaced,
                "session resumed on another connection",
            );
            return Ok(self.bind(connection, handle, live.session_id, live.ship_id, true));
        }

        match self.session.record(handle) {
            Some(record) if record.session_id == token => Err(JoinError::SessionExpired(handle.to_string())),
            _ => Err(JoinError::HandleConflict(handle.to_string())),
        }
    }

    fn bind(
        &mut self,
        connection: ConnectionId,
        handle: &str,
        session_id: Uuid,
        ship_id: ShipId,
        resumed: bool,
    ) -> Welcome {
        self.gate.bind(connection, ship_id);
        self.live.insert(
            connection,
            LiveSession {
                handle: handle.to_string(),
                session_id,
                ship_id,
            },
        );

        Welcome {
            session_id,
            ship_id,
            handle: handle.to_string(),
            resumed,
            tick: self.world.tick(),
            tick_rate: self.config.tick_rate,
            broadcast_rate: self.config.broadcast_rate,
            phase: self.session.phase(),
            phase_remaining_ms: self.session.remaining_ms(self.now_ms()),
            arena: self.world.layout().clone(),
        }
    }

    /// Drop the transport but keep the ship for the retention window
    fn disconnect(&mut self, connection: ConnectionId, reason: DisconnectReason) {
        self.gate.release(connection);
        self.broadcaster.unregister(connection);

        let Some(live) = self.live.remove(&connection) else {
            return;
        };
        self.world.clear_controls(live.ship_id);
        info!(connection, handle = %live.handle, ?reason, "Player disconnected, retaining ship");
        self.retention.retain(RetainedSession {
            handle: live.handle,
            session_id: live.session_id,
            ship_id: live.ship_id,
            disconnected_at: self.now_ms(),
        });
    }

    fn chat(&mut self, connection: ConnectionId, text: &str) {
        let Some(live) = self.live.get(&connection) else {
            return;
        };
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
            debug!(connection, "Chat message rejected by length");
            return;
        }
        if !self.session.can_chat(&live.handle) {
            debug!(connection, handle = %live.handle, "Chat not permitted");
            return;
        }
        self.broadcaster.send_all(&ServerMsg::ChatMessage(ChatLine {
            handle: live.handle.clone(),
            text: text.to_string(),
        }));
    }

    fn apply_inputs(&mut self) {
        for queued in self.inputs.drain() {
            // commands from a connection that has since gone away
            let current = self.live.get(&queued.connection).map(|l| l.ship_id);
            if current != Some(queued.ship) {
                continue;
            }
            // queued on the ship, simulated one per tick in arrival order
            match self.world.apply_input(queued.ship, &queued.command) {
                ApplyOutcome::Applied | ApplyOutcome::Overheated | ApplyOutcome::ShipDead => {}
                ApplyOutcome::UnknownShip => {
                    debug!(connection = queued.connection, ship_id = queued.ship, "Input for missing ship")
                }
            }
        }
    }

    fn send_rate_corrections(&mut self) {
        for (connection, ship_id) in self.gate.take_rate_flags() {
            debug!(connection, "Input rate exceeded, sending correction");
            self.send_correction(connection, ship_id);
        }
    }

    fn send_correction(&self, connection: ConnectionId, ship_id: ShipId) {
        let Some(ship) = self.world.ship(ship_id) else {
            return;
        };
        let correction = ServerMsg::ServerCorrection(Correction {
            tick: self.world.tick(),
            ship: ship.clone(),
        });
        if let Err(e) = self.broadcaster.send_to(connection, &correction) {
            debug!(connection, error = %e, "Correction not delivered");
        }
    }

    fn connection_for_ship(&self, ship_id: ShipId) -> Option<ConnectionId> {
        self.live
            .iter()
            .find(|(_, live)| live.ship_id == ship_id)
            .map(|(conn, _)| *conn)
    }

    fn handle_of(&self, ship_id: ShipId) -> Option<String> {
        self.world.ship(ship_id).map(|s| s.handle.clone())
    }

    fn handle_world_events(&mut self, events: Vec<WorldEvent>, now: u64) {
        let tick = self.world.tick();
        for event in events {
            match event {
                WorldEvent::Hit {
                    shooter,
                    target,
                    damage,
                } => debug!(tick, shooter, target, damage, "Hit"),
                WorldEvent::Death {
                    victim,
                    killer,
                    cause,
                } => {
                    let Some(handle) = self.handle_of(victim) else {
                        continue;
                    };
                    let killer_handle = killer.filter(|k| *k != victim).and_then(|k| self.handle_of(k));
                    self.session.record_death(&handle, now);
                    if let Some(killer_handle) = &killer_handle {
                        self.session.record_kill(killer_handle);
                    }
                    info!(tick, victim = %handle, killer = ?killer_handle, ?cause, "Player died");
                    self.broadcaster.send_all(&ServerMsg::PlayerDeath(DeathNotice {
                        tick,
                        ship_id: victim,
                        handle,
                        killer: killer_handle,
                        cause,
                    }));
                }
                WorldEvent::Respawn { ship, x, y } => {
                    let Some(handle) = self.handle_of(ship) else {
                        continue;
                    };
                    self.session.record_spawn(&handle, now);
                    self.broadcaster.send_all(&ServerMsg::PlayerRespawn(RespawnNotice {
                        tick,
                        ship_id: ship,
                        handle,
                        x,
                        y,
                    }));
                    if let Some(connection) = self.connection_for_ship(ship) {
                        self.send_correction(connection, ship);
                    }
                }
            }
        }
    }

    fn handle_session_events(&mut self, events: Vec<SessionEvent>) {
        let tick = self.world.tick();
        for event in events {
            match event {
                SessionEvent::MatchStarted { duration_ms } => {
                    self.broadcaster.send_all(&ServerMsg::MatchStart(PhaseInfo {
                        phase: PhaseKind::Active,
                        duration_ms,
                        tick,
                    }));
                }
                SessionEvent::MatchEnded(summary) => {
                    self.broadcaster.send_all(&ServerMsg::MatchEnd(summary));
                }
                SessionEvent::IntermissionStarted { duration_ms } => {
                    self.broadcaster.send_all(&ServerMsg::IntermissionStart(PhaseInfo {
                        phase: PhaseKind::Intermission,
                        duration_ms,
                        tick,
                    }));
                }
                SessionEvent::Relegated { handle, .. } => self.relegate(&handle),
            }
        }
    }

    /// End a session for good. The handle stays reserved.
    fn relegate(&mut self, handle: &str) {
        let connection = self
            .live
            .iter()
            .find(|(_, live)| live.handle == handle)
            .map(|(conn, _)| *conn);

        let ship_id = match connection.and_then(|c| self.live.remove(&c)) {
            Some(live) => Some(live.ship_id),
            None => self.retention.remove(handle).map(|r| r.ship_id),
        };

        if let Some(connection) = connection {
            self.gate.release(connection);
            self.broadcaster.close(
                connection,
                ErrorCode::Relegated,
                "placed in the bottom tier for too many consecutive matches",
            );
        }
        if let Some(ship_id) = ship_id {
            self.world.remove_ship(ship_id);
        }
        info!(handle = %handle, "Player relegated");
    }

    fn expire_retained(&mut self, now: u64) {
        for expired in self.retention.expire(now) {
            self.world.remove_ship(expired.ship_id);
            self.session.mark_inactive(&expired.handle, now);
            info!(handle = %expired.handle, "Retention window passed, ship removed");
        }
    }
}
