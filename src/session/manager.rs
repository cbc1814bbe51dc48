//! Session lifecycle: handle reservation, the match/intermission clock,
//! scoring and relegation.
//!
//! All times are milliseconds on the simulation clock supplied by the tick
//! loop, so phase changes line up exactly with tick boundaries.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::game::world::ShipId;
use crate::ws::protocol::ErrorCode;

pub const MAX_HANDLE_LEN: usize = 16;

const KILL_POINTS: i64 = 100;
const DEATH_POINTS: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseKind {
    Active,
    Intermission,
}

/// Why a join was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("handle must be 1-16 characters of letters, digits, '_' or '-'")]
    InvalidHandle,
    #[error("handle `{0}` is already reserved")]
    HandleConflict(String),
    #[error("session for `{0}` is no longer resumable")]
    SessionExpired(String),
    #[error("server is shutting down")]
    Unavailable,
}

impl JoinError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidHandle => ErrorCode::InvalidHandle,
            Self::HandleConflict(_) => ErrorCode::HandleConflict,
            Self::SessionExpired(_) => ErrorCode::SessionExpired,
            Self::Unavailable => ErrorCode::ServerUnavailable,
        }
    }
}

/// A reserved player identity. Records are never removed.
#[derive(Debug, Clone)]
pub struct HandleRecord {
    pub handle: String,
    /// Unix millis at reservation
    pub reserved_at: u64,
    pub session_id: Uuid,
    pub ship_id: Option<ShipId>,
    /// Has a live or retained session
    pub active: bool,
    /// Session ended for good (relegated); the handle stays reserved
    pub terminated: bool,
    pub completed_active_phases: u32,
    pub bottom_streak: u32,
    /// Sim millis since the ship has been alive, while it is
    alive_since: Option<u64>,
}

/// Per-phase tallies
#[derive(Debug, Clone, Copy, Default)]
struct PhaseStats {
    kills: u32,
    deaths: u32,
    survived_ms: u64,
}

impl PhaseStats {
    fn score(&self) -> i64 {
        self.kills as i64 * KILL_POINTS - self.deaths as i64 * DEATH_POINTS
            + (self.survived_ms / 1_000) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub placement: u32,
    pub handle: String,
    pub score: i64,
    pub kills: u32,
    pub deaths: u32,
    pub survived_secs: u64,
}

/// Result of one ACTIVE phase (`MATCH_END` payload)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_number: u64,
    pub rankings: Vec<Ranking>,
    pub bottom_tier: Vec<String>,
    pub relegated: Vec<String>,
}

/// Phase changes and their consequences
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MatchStarted { duration_ms: u64 },
    MatchEnded(MatchSummary),
    IntermissionStarted { duration_ms: u64 },
    Relegated { handle: String, session_id: Uuid },
}

/// How many of the ranked players form the bottom tier
pub trait BottomTierPolicy: Send + Sync {
    fn bottom_tier_size(&self, players: usize) -> usize;
}

/// Step table: the last row whose `min_players` is met wins.
/// A row's size is either a fixed count or a divisor of the player count.
#[derive(Debug, Clone)]
pub struct TierTable {
    rows: Vec<(usize, TierSize)>,
}

#[derive(Debug, Clone, Copy)]
pub enum TierSize {
    Fixed(usize),
    PerPlayers(usize),
}

impl TierTable {
    pub fn new(mut rows: Vec<(usize, TierSize)>) -> Self {
        rows.sort_by_key(|(min, _)| *min);
        Self { rows }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new(vec![
            (0, TierSize::Fixed(0)),
            (2, TierSize::Fixed(1)),
            (6, TierSize::Fixed(2)),
            (12, TierSize::PerPlayers(5)),
        ])
    }
}

impl BottomTierPolicy for TierTable {
    fn bottom_tier_size(&self, players: usize) -> usize {
        let size = self
            .rows
            .iter()
            .rev()
            .find(|(min, _)| players >= *min)
            .map(|(_, size)| match size {
                TierSize::Fixed(n) => *n,
                TierSize::PerPlayers(d) => players / (*d).max(1),
            })
            .unwrap_or(0);
        // someone always stays out of the bottom tier
        size.min(players.saturating_sub(1))
    }
}

/// Owns every handle reservation and the phase state machine
pub struct SessionManager {
    phase: PhaseKind,
    phase_started_ms: u64,
    phase_deadline_ms: u64,
    active_ms: u64,
    intermission_ms: u64,
    lookback: u32,
    matches_played: u64,
    handles: HashMap<String, HandleRecord>,
    stats: HashMap<String, PhaseStats>,
    /// Handles with a session when the current ACTIVE phase began
    present_at_start: HashSet<String>,
    /// Handles that held a session at some point during the current ACTIVE phase
    participants: HashSet<String>,
    policy: Box<dyn BottomTierPolicy>,
}

impl SessionManager {
    /// Starts in ACTIVE at `now_ms`
    pub fn new(config: &Config, now_ms: u64) -> Self {
        Self::with_policy(config, now_ms, Box::new(TierTable::default()))
    }

    pub fn with_policy(config: &Config, now_ms: u64, policy: Box<dyn BottomTierPolicy>) -> Self {
        let active_ms = config.match_duration_secs * 1_000;
        Self {
            phase: PhaseKind::Active,
            phase_started_ms: now_ms,
            phase_deadline_ms: now_ms + active_ms,
            active_ms,
            intermission_ms: config.intermission_duration_secs * 1_000,
            lookback: config.relegation_lookback,
            matches_played: 0,
            handles: HashMap::new(),
            stats: HashMap::new(),
            present_at_start: HashSet::new(),
            participants: HashSet::new(),
            policy,
        }
    }

    pub fn phase(&self) -> PhaseKind {
        self.phase
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.phase_deadline_ms.saturating_sub(now_ms)
    }

    pub fn record(&self, handle: &str) -> Option<&HandleRecord> {
        self.handles.get(handle)
    }

    pub fn is_reserved(&self, handle: &str) -> bool {
        self.handles.contains_key(handle)
    }

    pub fn reserved_count(&self) -> usize {
        self.handles.len()
    }

    /// Reserve a fresh handle for the lifetime of the process
    pub fn reserve(&mut self, handle: &str, unix_ms: u64) -> Result<Uuid, JoinError> {
        if !valid_handle(handle) {
            return Err(JoinError::InvalidHandle);
        }
        if self.handles.contains_key(handle) {
            return Err(JoinError::HandleConflict(handle.to_string()));
        }

        let session_id = Uuid::new_v4();
        self.handles.insert(
            handle.to_string(),
            HandleRecord {
                handle: handle.to_string(),
                reserved_at: unix_ms,
                session_id,
                ship_id: None,
                active: true,
                terminated: false,
                completed_active_phases: 0,
                bottom_streak: 0,
                alive_since: None,
            },
        );
        if self.phase == PhaseKind::Active {
            self.participants.insert(handle.to_string());
        }
        info!(handle = %handle, "Handle reserved");
        Ok(session_id)
    }

    /// Bind the spawned ship and start its survival clock
    pub fn attach_ship(&mut self, handle: &str, ship_id: ShipId, now_ms: u64) {
        if let Some(record) = self.handles.get_mut(handle) {
            record.ship_id = Some(ship_id);
            record.alive_since = Some(now_ms);
        }
    }

    /// Mark a retained session live again after a reconnect
    pub fn reactivate(&mut self, handle: &str) {
        if let Some(record) = self.handles.get_mut(handle) {
            if !record.terminated {
                record.active = true;
                if self.phase == PhaseKind::Active {
                    self.participants.insert(handle.to_string());
                }
            }
        }
    }

    /// Retention expired: the ship is gone, the handle stays reserved
    pub fn mark_inactive(&mut self, handle: &str, now_ms: u64) {
        self.close_survival(handle, now_ms);
        if let Some(record) = self.handles.get_mut(handle) {
            record.active = false;
            record.ship_id = None;
        }
    }

    pub fn record_kill(&mut self, handle: &str) {
        if self.phase == PhaseKind::Active {
            self.stats.entry(handle.to_string()).or_default().kills += 1;
        }
    }

    pub fn record_death(&mut self, handle: &str, now_ms: u64) {
        self.close_survival(handle, now_ms);
        if self.phase == PhaseKind::Active {
            self.stats.entry(handle.to_string()).or_default().deaths += 1;
        }
    }

    pub fn record_spawn(&mut self, handle: &str, now_ms: u64) {
        if let Some(record) = self.handles.get_mut(handle) {
            if record.active {
                record.alive_since = Some(now_ms);
            }
        }
    }

    fn close_survival(&mut self, handle: &str, now_ms: u64) {
        let Some(record) = self.handles.get_mut(handle) else {
            return;
        };
        if let Some(since) = record.alive_since.take() {
            if self.phase == PhaseKind::Active {
                let from = since.max(self.phase_started_ms);
                self.stats.entry(handle.to_string()).or_default().survived_ms +=
                    now_ms.saturating_sub(from);
            }
        }
    }

    /// Chat is writable during intermission by handles that finished an ACTIVE phase
    pub fn can_chat(&self, handle: &str) -> bool {
        self.phase == PhaseKind::Intermission
            && self
                .handles
                .get(handle)
                .is_some_and(|r| r.active && !r.terminated && r.completed_active_phases >= 1)
    }

    /// Run the phase clock up to `now_ms`
    pub fn advance(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while now_ms >= self.phase_deadline_ms {
            let boundary = self.phase_deadline_ms;
            match self.phase {
                PhaseKind::Active => {
                    self.finish_active(boundary, &mut events);
                    self.phase = PhaseKind::Intermission;
                    self.phase_started_ms = boundary;
                    self.phase_deadline_ms = boundary + self.intermission_ms;
                    events.push(SessionEvent::IntermissionStarted {
                        duration_ms: self.intermission_ms,
                    });
                }
                PhaseKind::Intermission => {
                    self.start_active(boundary);
                    events.push(SessionEvent::MatchStarted {
                        duration_ms: self.active_ms,
                    });
                }
            }
        }
        events
    }

    fn start_active(&mut self, at_ms: u64) {
        self.phase = PhaseKind::Active;
        self.phase_started_ms = at_ms;
        self.phase_deadline_ms = at_ms + self.active_ms;
        self.stats.clear();
        self.present_at_start.clear();
        self.participants.clear();

        for record in self.handles.values_mut().filter(|r| r.active && !r.terminated) {
            self.present_at_start.insert(record.handle.clone());
            self.participants.insert(record.handle.clone());
            if record.alive_since.is_some() {
                record.alive_since = Some(at_ms);
            }
        }
        info!(match_number = self.matches_played + 1, "Match started");
    }

    fn finish_active(&mut self, at_ms: u64, events: &mut Vec<SessionEvent>) {
        self.matches_played += 1;

        let still_here: Vec<String> = self
            .participants
            .iter()
            .filter(|h| self.handles.get(*h).is_some_and(|r| r.active && !r.terminated))
            .cloned()
            .collect();

        for handle in &still_here {
            let alive = self
                .handles
                .get(handle)
                .is_some_and(|r| r.alive_since.is_some());
            self.close_survival(handle, at_ms);
            // survival keeps counting into the next ACTIVE phase
            if alive {
                if let Some(record) = self.handles.get_mut(handle) {
                    record.alive_since = Some(at_ms);
                }
            }
        }

        let mut ranked: Vec<Ranking> = still_here
            .iter()
            .map(|handle| {
                let stats = self.stats.get(handle).copied().unwrap_or_default();
                Ranking {
                    placement: 0,
                    handle: handle.clone(),
                    score: stats.score(),
                    kills: stats.kills,
                    deaths: stats.deaths,
                    survived_secs: stats.survived_ms / 1_000,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.handle.cmp(&b.handle)));
        for (i, ranking) in ranked.iter_mut().enumerate() {
            ranking.placement = i as u32 + 1;
        }

        let tier_size = self.policy.bottom_tier_size(ranked.len()).min(ranked.len());
        let bottom_tier: Vec<String> = ranked[ranked.len() - tier_size..]
            .iter()
            .map(|r| r.handle.clone())
            .collect();

        let mut relegated = Vec::new();
        let mut relegations = Vec::new();
        for handle in &still_here {
            let Some(record) = self.handles.get_mut(handle) else {
                continue;
            };
            if self.present_at_start.contains(handle) {
                record.completed_active_phases += 1;
            }
            if bottom_tier.contains(handle) {
                record.bottom_streak += 1;
                if record.bottom_streak >= self.lookback {
                    record.terminated = true;
                    record.active = false;
                    record.bottom_streak = 0;
                    record.alive_since = None;
                    relegated.push(handle.clone());
                    relegations.push(SessionEvent::Relegated {
                        handle: handle.clone(),
                        session_id: record.session_id,
                    });
                }
            } else {
                record.bottom_streak = 0;
            }
        }
        relegated.sort();

        info!(
            match_number = self.matches_played,
            players = ranked.len(),
            relegated = relegated.len(),
            "Match ended"
        );

        events.push(SessionEvent::MatchEnded(MatchSummary {
            match_number: self.matches_played,
            rankings: ranked,
            bottom_tier,
            relegated,
        }));
        events.extend(relegations);
    }
}

/// 1-16 characters of ASCII letters, digits, '_' or '-'
pub fn valid_handle(handle: &str) -> bool {
    !handle.is_empty()
        && handle.len() <= MAX_HANDLE_LEN
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
