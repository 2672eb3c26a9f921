//! Session registry: every room and the sessions in it
//!
//! Each room sits behind its own lock, so activity in one room never waits on
//! another. Snapshot assembly takes the room's read lock; joins, leaves and
//! mutations take the write lock. No operation holds two room locks at once.

use crate::room::{spawn_snake, Outbound, PlayerSession, Room};
use shared::{Grid, RoomId, SessionId, SnakeState, WorldSnapshot};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{RwLock, RwLockWriteGuard};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown room {0}")]
    UnknownRoom(RoomId),
}

pub struct SessionRegistry {
    rooms: Vec<RwLock<Room>>,
    grid: Grid,
    next_session_id: AtomicU32,
}

impl SessionRegistry {
    /// Pre-allocates `room_count` empty rooms with ids `0..room_count`
    pub fn new(room_count: u32, grid: Grid, food_count: usize) -> Self {
        Self {
            rooms: (0..room_count)
                .map(|id| RwLock::new(Room::new(id, grid, food_count)))
                .collect(),
            grid,
            next_session_id: AtomicU32::new(1),
        }
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        (0..self.rooms.len() as RoomId).collect()
    }

    pub fn has_room(&self, room_id: RoomId) -> bool {
        (room_id as usize) < self.rooms.len()
    }

    fn room(&self, room_id: RoomId) -> Result<&RwLock<Room>, RegistryError> {
        self.rooms
            .get(room_id as usize)
            .ok_or(RegistryError::UnknownRoom(room_id))
    }

    /// Exclusive access to one room, for work that must finish before anyone
    /// else touches the room
    pub(crate) async fn lock_room(
        &self,
        room_id: RoomId,
    ) -> Result<RwLockWriteGuard<'_, Room>, RegistryError> {
        Ok(self.room(room_id)?.write().await)
    }

    fn new_session(&self, outbound: Outbound) -> PlayerSession {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        PlayerSession::new(id, spawn_snake(&self.grid), outbound)
    }

    /// Adds a session with a fresh id and spawn to `room_id`
    ///
    /// `on_change` runs on the updated room before its lock is released.
    pub async fn create_session(
        &self,
        room_id: RoomId,
        outbound: Outbound,
        on_change: impl FnOnce(&mut Room),
    ) -> Result<(SessionId, SnakeState), RegistryError> {
        let mut room = self.lock_room(room_id).await?;
        let session = self.new_session(outbound);
        let created = (session.id, session.snake.clone());
        room.join(session);
        on_change(&mut *room);
        Ok(created)
    }

    /// Returns false, without running `on_change`, for a session not in the room
    pub async fn apply_move(
        &self,
        room_id: RoomId,
        id: SessionId,
        snake: SnakeState,
        on_change: impl FnOnce(&mut Room),
    ) -> Result<bool, RegistryError> {
        let mut room = self.lock_room(room_id).await?;
        let applied = room.apply_move(id, snake);
        if applied {
            on_change(&mut *room);
        }
        Ok(applied)
    }

    /// Lower scores than the current one are ignored
    pub async fn apply_score(
        &self,
        room_id: RoomId,
        id: SessionId,
        score: u32,
        on_change: impl FnOnce(&mut Room),
    ) -> Result<bool, RegistryError> {
        let mut room = self.lock_room(room_id).await?;
        let applied = room.apply_score(id, score);
        if applied {
            on_change(&mut *room);
        }
        Ok(applied)
    }

    /// Returns whether the session was still registered
    ///
    /// `on_change` only runs if someone is left in the room.
    pub async fn remove_session(
        &self,
        room_id: RoomId,
        id: SessionId,
        on_change: impl FnOnce(&mut Room),
    ) -> Result<bool, RegistryError> {
        let mut room = self.lock_room(room_id).await?;
        if room.remove(id).is_none() {
            return Ok(false);
        }
        if !room.is_empty() {
            on_change(&mut *room);
        }
        Ok(true)
    }

    /// Current view of a room, leaving out `requester`'s own snake
    pub async fn snapshot(
        &self,
        room_id: RoomId,
        requester: Option<SessionId>,
    ) -> Result<WorldSnapshot, RegistryError> {
        let room = self.room(room_id)?.read().await;
        Ok(match requester {
            Some(id) => room.snapshot_for(id),
            None => room.snapshot(),
        })
    }

    pub async fn session_count(&self, room_id: RoomId) -> Result<usize, RegistryError> {
        Ok(self.room(room_id)?.read().await.len())
    }

    /// Room with the fewest sessions, lowest id on ties
    pub async fn least_populated_room(&self) -> RoomId {
        let mut best: Option<(RoomId, usize)> = None;
        for (index, room) in self.rooms.iter().enumerate() {
            let count = room.read().await.len();
            if best.map_or(true, |(_, fewest)| count < fewest) {
                best = Some((index as RoomId, count));
            }
        }
        best.map(|(id, _)| id).unwrap_or(0)
    }
}
