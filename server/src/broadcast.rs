//! Broadcast engine
//!
//! Applies one state change to a room and pushes the resulting snapshot to
//! every member, all under the room's write lock. Holding the lock across the
//! fan-out is what keeps broadcasts for a room in the order the server
//! received the changes.

use crate::registry::{RegistryError, SessionRegistry};
use crate::room::{Outbound, Room};
use log::{debug, error, warn};
use shared::{encode, Packet, RoomId, SessionId, SnakeState};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

pub struct BroadcastEngine {
    registry: Arc<SessionRegistry>,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Creates a session in `room_id` and announces it to the room
    pub async fn join(
        &self,
        room_id: RoomId,
        outbound: Outbound,
    ) -> Result<(SessionId, SnakeState), RegistryError> {
        self.registry
            .create_session(room_id, outbound, announce)
            .await
    }

    pub async fn apply_move(
        &self,
        room_id: RoomId,
        id: SessionId,
        snake: SnakeState,
    ) -> Result<(), RegistryError> {
        self.registry
            .apply_move(room_id, id, snake, announce)
            .await?;
        Ok(())
    }

    pub async fn apply_score(
        &self,
        room_id: RoomId,
        id: SessionId,
        score: u32,
    ) -> Result<(), RegistryError> {
        self.registry
            .apply_score(room_id, id, score, announce)
            .await?;
        Ok(())
    }

    /// Removes a session and tells the rest of the room
    ///
    /// Returns false if the session was already gone, e.g. dropped during an
    /// earlier fan-out.
    pub async fn leave(&self, room_id: RoomId, id: SessionId) -> Result<bool, RegistryError> {
        self.registry.remove_session(room_id, id, announce).await
    }

    /// Relays a chat line to everyone in the room but the sender
    pub async fn relay_chat(
        &self,
        room_id: RoomId,
        from: SessionId,
        text: String,
    ) -> Result<(), RegistryError> {
        let mut room = self.registry.lock_room(room_id).await?;
        if !room.contains(from) {
            return Ok(());
        }

        let frame = match encode(&Packet::ChatRelay { from, text }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping chat from session {}: {}", from, e);
                return Ok(());
            }
        };

        let failed: Vec<SessionId> = room
            .recipients()
            .filter(|(id, _)| *id != from)
            .filter_map(|(id, outbound)| offer(id, outbound, frame.clone()))
            .collect();
        drop_recipients(&mut room, &failed);
        Ok(())
    }
}

fn announce(room: &mut Room) {
    deliver_snapshot(room);
}

/// Sends every member its personalized view of the room
///
/// Recipients whose queue is full or closed are removed from the room; the
/// rest still get the frame. Returns the number of removed sessions.
fn deliver_snapshot(room: &mut Room) -> usize {
    let snapshot = room.snapshot();
    let mut failed = Vec::new();

    for (id, outbound) in room.recipients() {
        let frame = match encode(&Packet::Broadcast(snapshot.for_recipient(id))) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode snapshot for session {}: {}", id, e);
                continue;
            }
        };
        if let Some(id) = offer(id, outbound, frame) {
            failed.push(id);
        }
    }

    debug!(
        "Room {}: snapshot delivered to {} session(s)",
        room.id(),
        room.len() - failed.len()
    );
    drop_recipients(room, &failed);
    failed.len()
}

/// Queues a frame without waiting; returns the id back if delivery failed
fn offer(id: SessionId, outbound: &Outbound, frame: Vec<u8>) -> Option<SessionId> {
    match outbound.try_send(frame) {
        Ok(()) => None,
        Err(TrySendError::Full(_)) => {
            warn!("Session {} is not keeping up, disconnecting", id);
            Some(id)
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Session {} already closed its outbound queue", id);
            Some(id)
        }
    }
}

fn drop_recipients(room: &mut Room, failed: &[SessionId]) {
    for id in failed {
        // Dropping the session drops its queue sender, which ends the
        // connection's write loop.
        room.remove(*id);
    }
}
