//! Per-connection outboxes fed by the tick loop
//!
//! Each connection gets a bounded channel drained by its socket writer. The
//! loop never blocks on a slow client: a full outbox drops the message,
//! leaves a hole in that connection's sequence, and schedules a full
//! snapshot for it instead.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::input::ConnectionId;
use super::snapshot::{Broadcast, WorldSnapshot};
use crate::util::time::unix_millis;
use crate::ws::protocol::{encode, ErrorCode, ErrorPayload, ServerMsg};

/// Frame for a socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    /// Flush and close the socket
    Close,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("connection is not registered")]
    UnknownConnection,
    #[error("outbox full")]
    Backpressure,
    #[error("outbox closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(String),
}

struct Outbox {
    sender: mpsc::Sender<Outbound>,
    next_sequence: u64,
    /// Next world broadcast must be a full snapshot
    needs_full: bool,
    /// Welcomed and receiving world state
    joined: bool,
}

impl Outbox {
    fn push(&mut self, msg: &ServerMsg) -> Result<(), BroadcastError> {
        let text = encode(msg, unix_millis(), self.next_sequence)
            .map_err(|e| BroadcastError::Encode(e.to_string()))?;
        match self.sender.try_send(Outbound::Text(text)) {
            Ok(()) => {
                self.next_sequence += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // the sequence number is spent so the receiver sees the gap
                self.next_sequence += 1;
                self.needs_full = true;
                Err(BroadcastError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BroadcastError::Closed),
        }
    }
}

/// Fan-out of server messages to every connection
pub struct Broadcaster {
    outboxes: DashMap<ConnectionId, Outbox>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            outboxes: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open an outbox; the caller's writer drains the receiver
    pub fn register(&self, connection: ConnectionId) -> mpsc::Receiver<Outbound> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.outboxes.insert(
            connection,
            Outbox {
                sender,
                next_sequence: 0,
                needs_full: true,
                joined: false,
            },
        );
        receiver
    }

    /// Start delivering world state, beginning with a full snapshot
    pub fn activate(&self, connection: ConnectionId) {
        if let Some(mut outbox) = self.outboxes.get_mut(&connection) {
            outbox.joined = true;
            outbox.needs_full = true;
        }
    }

    pub fn unregister(&self, connection: ConnectionId) {
        self.outboxes.remove(&connection);
    }

    pub fn is_registered(&self, connection: ConnectionId) -> bool {
        self.outboxes.contains_key(&connection)
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    pub fn send_to(&self, connection: ConnectionId, msg: &ServerMsg) -> Result<(), BroadcastError> {
        let mut outbox = self
            .outboxes
            .get_mut(&connection)
            .ok_or(BroadcastError::UnknownConnection)?;
        outbox.push(msg)
    }

    /// Send to every joined connection. Failures are per connection.
    pub fn send_all(&self, msg: &ServerMsg) {
        for mut entry in self.outboxes.iter_mut() {
            if !entry.joined {
                continue;
            }
            let connection = *entry.key();
            if let Err(e) = entry.push(msg) {
                debug!(connection, kind = ?msg.kind(), error = %e, "Dropped broadcast");
            }
        }
    }

    /// Deliver one world broadcast. Connections that missed a frame (or just
    /// joined) get the full snapshot; everyone else gets the delta.
    pub fn publish_world(&self, broadcast: &Broadcast, snapshot: &WorldSnapshot) {
        let mut full_frame = None;
        let mut delta_frame = None;

        for mut entry in self.outboxes.iter_mut() {
            if !entry.joined {
                continue;
            }
            let full = entry.needs_full || matches!(broadcast, Broadcast::Full);
            let msg = match (full, broadcast) {
                (false, Broadcast::Delta(delta)) => delta_frame
                    .get_or_insert_with(|| ServerMsg::WorldStateDelta(delta.clone())),
                _ => full_frame.get_or_insert_with(|| ServerMsg::WorldStateFull(snapshot.clone())),
            };

            let connection = *entry.key();
            match entry.push(msg) {
                Ok(()) => {
                    if full {
                        entry.needs_full = false;
                    }
                }
                Err(BroadcastError::Backpressure) => {
                    warn!(connection, tick = snapshot.tick, "Outbox full, resyncing with full snapshot");
                }
                Err(e) => debug!(connection, error = %e, "World broadcast failed"),
            }
        }
    }

    /// Send `CONNECTION_ERROR`, ask the writer to close, and drop the outbox
    pub fn close(&self, connection: ConnectionId, code: ErrorCode, message: impl Into<String>) {
        let Some((_, mut outbox)) = self.outboxes.remove(&connection) else {
            return;
        };
        let error = ServerMsg::ConnectionError(ErrorPayload {
            code,
            message: message.into(),
        });
        if let Err(e) = outbox.push(&error) {
            debug!(connection, error = %e, "Could not deliver connection error");
        }
        // a dropped sender also ends the writer, so a full outbox is fine here
        let _ = outbox.sender.try_send(Outbound::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::World;
    use crate::game::snapshot::DeltaEncoder;
    use crate::ws::protocol::{decode_server, Ping};

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    fn decoded(frames: &[Outbound]) -> Vec<(u64, ServerMsg)> {
        frames
            .iter()
            .filter_map(|f| match f {
                Outbound::Text(text) => {
                    let env = decode_server(text).unwrap();
                    Some((env.sequence, env.message))
                }
                Outbound::Close => None,
            })
            .collect()
    }

    #[test]
    fn sequence_numbers_increase_per_connection() {
        let broadcaster = Broadcaster::new(16);
        let mut rx = broadcaster.register(1);
        broadcaster.activate(1);
        for t in 0..3 {
            broadcaster.send_all(&ServerMsg::PingRequest(Ping { t }));
        }
        let seqs: Vec<u64> = decoded(&drain(&mut rx)).iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn pending_connections_do_not_receive_world_state() {
        let broadcaster = Broadcaster::new(16);
        let mut rx = broadcaster.register(1);
        let mut world = World::new(1, 60);
        world.spawn_ship("Ace");
        let snapshot = world.snapshot(0);

        broadcaster.publish_world(&Broadcast::Full, &snapshot);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn new_joiner_gets_full_then_deltas() {
        let broadcaster = Broadcaster::new(16);
        let mut world = World::new(1, 60);
        world.spawn_ship("Ace");
        let mut encoder = DeltaEncoder::new(1, 1_000);

        let mut early = broadcaster.register(1);
        broadcaster.activate(1);
        world.step(false);
        let snap = world.snapshot(0);
        broadcaster.publish_world(&encoder.encode(&snap), &snap);

        let mut late = broadcaster.register(2);
        broadcaster.activate(2);
        world.step(false);
        let snap = world.snapshot(0);
        let out = encoder.encode(&snap);
        assert!(matches!(out, Broadcast::Delta(_)));
        broadcaster.publish_world(&out, &snap);

        let early = decoded(&drain(&mut early));
        assert!(matches!(early[0].1, ServerMsg::WorldStateFull(_)));
        assert!(matches!(early[1].1, ServerMsg::WorldStateDelta(_)));

        let late = decoded(&drain(&mut late));
        assert_eq!(late.len(), 1);
        assert!(matches!(late[0].1, ServerMsg::WorldStateFull(_)));
    }

    #[test]
    fn full_outbox_drops_and_schedules_resync() {
        let broadcaster = Broadcaster::new(2);
        let mut rx = broadcaster.register(1);
        broadcaster.activate(1);

        let mut world = World::new(1, 60);
        world.spawn_ship("Ace");
        let mut encoder = DeltaEncoder::new(1, 1_000);

        for _ in 0..4 {
            world.step(false);
            let snap = world.snapshot(0);
            broadcaster.publish_world(&encoder.encode(&snap), &snap);
        }
        // two frames fit; the rest were dropped
        assert_eq!(drain(&mut rx).len(), 2);

        world.step(false);
        let snap = world.snapshot(0);
        let out = encoder.encode(&snap);
        assert!(matches!(out, Broadcast::Delta(_)));
        broadcaster.publish_world(&out, &snap);

        let frames = decoded(&drain(&mut rx));
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].1, ServerMsg::WorldStateFull(_)));
        // the two dropped frames left a hole in the sequence
        assert_eq!(frames[0].0, 4);
    }

    #[test]
    fn dropped_message_leaves_a_sequence_gap() {
        let broadcaster = Broadcaster::new(1);
        let mut rx = broadcaster.register(1);
        broadcaster.activate(1);

        assert_eq!(broadcaster.send_to(1, &ServerMsg::PingRequest(Ping { t: 1 })), Ok(()));
        assert_eq!(
            broadcaster.send_to(1, &ServerMsg::PingRequest(Ping { t: 2 })),
            Err(BroadcastError::Backpressure)
        );
        let first = decoded(&drain(&mut rx));
        broadcaster.send_to(1, &ServerMsg::PingRequest(Ping { t: 3 })).unwrap();
        let second = decoded(&drain(&mut rx));

        assert_eq!(first[0].0, 0);
        assert_eq!(second[0].0, 2);
    }

    #[test]
    fn close_sends_error_then_close_frame() {
        let broadcaster = Broadcaster::new(4);
        let mut rx = broadcaster.register(7);
        broadcaster.close(7, ErrorCode::Relegated, "bottom tier three matches running");

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Outbound::Close);
        match &decoded(&frames)[0].1 {
            ServerMsg::ConnectionError(payload) => assert_eq!(payload.code, ErrorCode::Relegated),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!broadcaster.is_registered(7));
        assert_eq!(
            broadcaster.send_to(7, &ServerMsg::PingRequest(Ping { t: 0 })),
            Err(BroadcastError::UnknownConnection)
        );
    }
}
