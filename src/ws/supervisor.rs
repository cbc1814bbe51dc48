//! Connection liveness and the reconnect grace window

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::game::world::ShipId;
use crate::session::JoinError;

/// What the heartbeat timer asks the connection task to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing(u64),
    Disconnect,
}

/// Tracks outstanding pings for one connection. A ping counts as missed if
/// the next interval fires before its response arrives.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    miss_limit: u32,
    missed: u32,
    outstanding: Option<u64>,
    /// Last measured round trip
    rtt_ms: Option<u64>,
}

impl HeartbeatMonitor {
    pub fn new(miss_limit: u32) -> Self {
        Self {
            miss_limit: miss_limit.max(1),
            missed: 0,
            outstanding: None,
            rtt_ms: None,
        }
    }

    /// Heartbeat interval elapsed at `now_ms`
    pub fn on_interval(&mut self, now_ms: u64) -> HeartbeatAction {
        if self.outstanding.is_some() {
            self.missed += 1;
            if self.missed >= self.miss_limit {
                return HeartbeatAction::Disconnect;
            }
        }
        self.outstanding = Some(now_ms);
        HeartbeatAction::SendPing(now_ms)
    }

    /// `PING_RESPONSE` echoing `t` arrived at `now_ms`. Stale echoes are ignored.
    pub fn on_response(&mut self, t: u64, now_ms: u64) -> bool {
        if self.outstanding != Some(t) {
            return false;
        }
        self.outstanding = None;
        self.missed = 0;
        self.rtt_ms = Some(now_ms.saturating_sub(t));
        true
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        self.rtt_ms
    }
}

/// A ship kept in the world after its connection dropped
#[derive(Debug, Clone, PartialEq)]
pub struct RetainedSession {
    pub handle: String,
    pub session_id: Uuid,
    pub ship_id: ShipId,
    /// Loop clock millis at disconnect
    pub disconnected_at: u64,
}

/// Sessions awaiting reconnect, keyed by handle
#[derive(Debug)]
pub struct RetentionTable {
    window_ms: u64,
    sessions: HashMap<String, RetainedSession>,
}

impl RetentionTable {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_ms: window_secs * 1_000,
            sessions: HashMap::new(),
        }
    }

    pub fn retain(&mut self, session: RetainedSession) {
        debug!(handle = %session.handle, ship_id = session.ship_id, "Retaining session");
        self.sessions.insert(session.handle.clone(), session);
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.sessions.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Take a retained session back. The token must match the session id
    /// handed out in the original welcome.
    pub fn resume(&mut self, handle: &str, token: Uuid, now_ms: u64) -> Result<RetainedSession, JoinError> {
        let Some(session) = self.sessions.get(handle) else {
            return Err(JoinError::HandleConflict(handle.to_string()));
        };
        if session.session_id != token {
            return Err(JoinError::HandleConflict(handle.to_string()));
        }
        if now_ms.saturating_sub(session.disconnected_at) > self.window_ms {
            return Err(JoinError::SessionExpired(handle.to_string()));
        }
        self.sessions
            .remove(handle)
            .ok_or_else(|| JoinError::HandleConflict(handle.to_string()))
    }

    /// Remove and return sessions whose window has passed
    pub fn expire(&mut self, now_ms: u64) -> Vec<RetainedSession> {
        let window = self.window_ms;
        let mut expired: Vec<RetainedSession> = Vec::new();
        self.sessions.retain(|_, session| {
            if now_ms.saturating_sub(session.disconnected_at) > window {
                expired.push(session.clone());
                false
            } else {
                true
            }
        });
        expired.sort_by_key(|s| s.ship_id);
        expired
    }

    pub fn remove(&mut self, handle: &str) -> Option<RetainedSession> {
        self.sessions.remove(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_missed_pings_disconnect() {
        let mut hb = HeartbeatMonitor::new(3);
        assert_eq!(hb.on_interval(0), HeartbeatAction::SendPing(0));
        assert_eq!(hb.on_interval(1_000), HeartbeatAction::SendPing(1_000));
        assert_eq!(hb.on_interval(2_000), HeartbeatAction::SendPing(2_000));
        assert_eq!(hb.missed(), 2);
        assert_eq!(hb.on_interval(3_000), HeartbeatAction::Disconnect);
    }

    #[test]
    fn response_resets_miss_count() {
        let mut hb = HeartbeatMonitor::new(3);
        hb.on_interval(0);
        hb.on_interval(1_000);
        assert!(!hb.on_response(0, 1_050));
        assert!(hb.on_response(1_000, 1_040));
        assert_eq!(hb.missed(), 0);
        assert_eq!(hb.rtt_ms(), Some(40));

        for t in [2_000, 3_000, 4_000] {
            assert!(matches!(hb.on_interval(t), HeartbeatAction::SendPing(_)));
        }
    }

    fn retained(handle: &str, token: Uuid, at: u64) -> RetainedSession {
        RetainedSession {
            handle: handle.to_string(),
            session_id: token,
            ship_id: 4,
            disconnected_at: at,
        }
    }

    #[test]
    fn resume_inside_window_returns_the_ship() {
        let mut table = RetentionTable::new(30);
        let token = Uuid::new_v4();
        table.retain(retained("Ace", token, 1_000));

        assert_eq!(
            table.resume("Ace", Uuid::new_v4(), 2_000),
            Err(JoinError::HandleConflict("Ace".to_string()))
        );
        let session = table.resume("Ace", token, 31_000).unwrap();
        assert_eq!(session.ship_id, 4);
        assert!(table.is_empty());
    }

    #[test]
    fn sessions_expire_after_window() {
        let mut table = RetentionTable::new(30);
        let token = Uuid::new_v4();
        table.retain(retained("Ace", token, 0));

        assert!(table.expire(30_000).is_empty());
        let expired = table.expire(30_001);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].handle, "Ace");
        assert!(!table.contains("Ace"));
    }

    #[test]
    fn late_resume_reports_expiry() {
        let mut table = RetentionTable::new(30);
        let token = Uuid::new_v4();
        table.retain(retained("Ace", token, 0));
        assert_eq!(
            table.resume("Ace", token, 30_001),
            Err(JoinError::SessionExpired("Ace".to_string()))
        );
    }
}
