use log::debug;
use shared::{Direction, Grid, Packet, Position, RoomId, SessionId, SnakeState, WorldSnapshot};
use std::collections::VecDeque;

/// Locally predicted snake of this client
///
/// The server trusts whatever this reports, so the client alone decides
/// where its snake goes and when it grows.
#[derive(Debug, Clone)]
pub struct LocalSnake {
    grid: Grid,
    body: VecDeque<Position>,
    direction: Direction,
    score: u32,
}

impl LocalSnake {
    pub fn new(grid: Grid, spawn: Position, direction: Direction) -> Self {
        Self {
            grid,
            body: VecDeque::from([grid.normalize(spawn)]),
            direction,
            score: 0,
        }
    }

    pub fn head(&self) -> Position {
        self.body[0]
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    /// Changes heading; turning straight back is refused
    pub fn turn(&mut self, direction: Direction) -> bool {
        if direction == self.direction.opposite() {
            return false;
        }
        self.direction = direction;
        true
    }

    /// Moves one cell. Landing on an apple grows the snake and scores a
    /// point; returns whether that happened.
    pub fn advance(&mut self, apples: &[Position]) -> bool {
        let next = self.grid.step(self.head(), self.direction);
        self.body.push_front(next);

        if apples.contains(&next) {
            self.score += 1;
            debug!("Ate apple at {:?}, score {}", next, self.score);
            true
        } else {
            self.body.pop_back();
            false
        }
    }

    pub fn state(&self) -> SnakeState {
        SnakeState::from_parts(self.head(), self.body.iter().skip(1).copied())
    }
}

/// Everything the client knows about its room
#[derive(Debug)]
pub struct ClientGameState {
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub local: LocalSnake,
    /// Most recent server view; never contains our own snake
    pub world: WorldSnapshot,
    pub chat: Vec<(SessionId, String)>,
    pub notices: Vec<String>,
}

impl ClientGameState {
    pub fn new(session_id: SessionId, room_id: RoomId, grid: Grid, spawn: &SnakeState) -> Self {
        Self {
            session_id,
            room_id,
            local: LocalSnake::new(grid, spawn.head(), Direction::East),
            world: WorldSnapshot::default(),
            chat: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn apples(&self) -> &[Position] {
        &self.world.apples
    }

    /// Folds one server packet into the local view
    pub fn apply_server_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Broadcast(snapshot) => self.world = snapshot,
            Packet::ChatRelay { from, text } => self.chat.push((from, text)),
            Packet::Eviction { message } => self.notices.push(message),
            Packet::Disconnected { reason } => self.notices.push(reason),
            other => debug!("Ignoring {} after join", other.name()),
        }
    }

    /// Top score as last reported by the server, or our own if higher
    pub fn top_score(&self) -> u32 {
        self.world.top_score.max(self.local.score())
    }
}
