//! Per-room player state
//!
//! A room owns the sessions assigned to it, the room-wide top score and the
//! apples on its board. Every method here is synchronous; callers hold the
//! room's lock for the duration of a mutation and the broadcast that follows.

use log::{debug, info};
use shared::{Grid, Position, RoomId, SessionId, SnakeState, WorldSnapshot};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Encoded frames queued for delivery to one connection
pub type Outbound = mpsc::Sender<Vec<u8>>;

/// Server-side state of one connected player
#[derive(Debug)]
pub struct PlayerSession {
    pub id: SessionId,
    pub snake: SnakeState,
    /// Never decreases for the lifetime of the session
    pub score: u32,
    outbound: Outbound,
}

impl PlayerSession {
    pub fn new(id: SessionId, spawn: SnakeState, outbound: Outbound) -> Self {
        Self {
            id,
            snake: spawn,
            score: 0,
            outbound,
        }
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }
}

/// One partition of the game world
///
/// Players in different rooms never see each other. Rooms are created once at
/// startup and live as long as the server; they only ever empty out.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    grid: Grid,
    food_count: usize,
    sessions: HashMap<SessionId, PlayerSession>,
    top_score: u32,
    apples: Vec<Position>,
}

impl Room {
    pub fn new(id: RoomId, grid: Grid, food_count: usize) -> Self {
        let mut room = Self {
            id,
            grid,
            food_count,
            sessions: HashMap::new(),
            top_score: 0,
            apples: Vec::with_capacity(food_count),
        };
        room.replenish_apples();
        room
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn session(&self, id: SessionId) -> Option<&PlayerSession> {
        self.sessions.get(&id)
    }

    pub fn top_score(&self) -> u32 {
        self.top_score
    }

    pub fn apples(&self) -> &[Position] {
        &self.apples
    }

    /// Adds a freshly created session to the room
    pub fn join(&mut self, session: PlayerSession) {
        info!(
            "Session {} joined room {} at {:?}",
            session.id,
            self.id,
            session.snake.head()
        );
        self.sessions.insert(session.id, session);
    }

    /// Replaces the session's snake with the client-reported one
    ///
    /// If the new head lands on an apple the apple is eaten: the session
    /// scores a point and a replacement apple is spawned. Returns false for
    /// an unknown session.
    pub fn apply_move(&mut self, id: SessionId, snake: SnakeState) -> bool {
        let head = snake.head();
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        session.snake = snake;

        if let Some(index) = self.apples.iter().position(|apple| *apple == head) {
            self.apples.swap_remove(index);
            session.score = session.score.saturating_add(1);
            self.top_score = self.top_score.max(session.score);
            debug!(
                "Session {} ate apple at {:?} in room {}, score {}",
                id, head, self.id, session.score
            );
            self.replenish_apples();
        }

        true
    }

    /// Records a client-reported score
    ///
    /// Reports lower than the current score are ignored. Returns false for an
    /// unknown session.
    pub fn apply_score(&mut self, id: SessionId, score: u32) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };

        if score < session.score {
            debug!(
                "Ignoring score {} from session {} (current {})",
                score, id, session.score
            );
        } else {
            session.score = score;
            self.top_score = self.top_score.max(score);
        }

        true
    }

    /// Removes a session, returning it if it was still present
    ///
    /// Safe to call more than once. The top score is forgotten once the room
    /// is empty.
    pub fn remove(&mut self, id: SessionId) -> Option<PlayerSession> {
        let session = self.sessions.remove(&id)?;
        info!("Session {} left room {}", id, self.id);
        if self.sessions.is_empty() {
            self.top_score = 0;
        }
        Some(session)
    }

    /// Builds a fresh snapshot of every session in the room
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            snakes: self
                .sessions
                .values()
                .map(|s| (s.id, s.snake.clone()))
                .collect(),
            scores: self.sessions.values().map(|s| (s.id, s.score)).collect(),
            top_score: self.top_score,
            apples: self.apples.clone(),
        }
    }

    /// Snapshot as seen by `requester`: everyone but its own snake
    pub fn snapshot_for(&self, requester: SessionId) -> WorldSnapshot {
        self.snapshot().for_recipient(requester)
    }

    /// Session ids with their outbound queues, for fan-out
    pub fn recipients(&self) -> impl Iterator<Item = (SessionId, &Outbound)> {
        self.sessions.values().map(|s| (s.id, &s.outbound))
    }

    fn replenish_apples(&mut self) {
        let mut rng = rand::thread_rng();
        while self.apples.len() < self.food_count {
            let cell = self.grid.random_cell(&mut rng);
            self.apples.push(cell);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_apples(&mut self, apples: Vec<Position>) {
        self.apples = apples;
    }
}

/// Picks a random spawn cell on the grid
pub fn spawn_snake(grid: &Grid) -> SnakeState {
    let mut rng = rand::thread_rng();
    SnakeState::single(grid.random_cell(&mut rng))
}
