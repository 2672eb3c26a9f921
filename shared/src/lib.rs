//! Types and wire protocol shared by the game server, the load balancer and
//! the headless client.

pub mod codec;

pub use codec::{
    decode, encode, write_packet, CodecError, DecodeError, FrameDecoder, PacketReader, ReadError,
    FRAME_HEADER_LEN, MAX_FRAME_SIZE,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_ROWS: i32 = 20;
pub const DEFAULT_COLS: i32 = 20;

/// Liveness probe sent by the balancer, outside the framed protocol.
pub const PROBE_TOKEN: &[u8; 4] = b"PING";
/// Reply to [`PROBE_TOKEN`].
pub const PROBE_ACK: &[u8; 4] = b"PONG";

pub type RoomId = u32;

/// Opaque identifier handed out by the server when a session is created.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub row: i32,
    pub col: i32,
}

impl Position {
    pub fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
        }
    }

    /// (row, col) offset of a single step.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (-1, 0),
            Direction::South => (1, 0),
            Direction::East => (0, 1),
            Direction::West => (0, -1),
        }
    }
}

/// What happens to a position that leaves the grid.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Toroidal: leaving one edge re-enters on the opposite edge.
    Wrap,
    /// Positions are pinned to the nearest edge cell.
    Clamp,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub rows: i32,
    pub cols: i32,
    pub boundary: Boundary,
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            boundary: Boundary::Wrap,
        }
    }
}

impl Grid {
    pub fn new(rows: i32, cols: i32, boundary: Boundary) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
            boundary,
        }
    }

    pub fn contains(&self, pos: Position) -> bool {
        (0..self.rows).contains(&pos.row) && (0..self.cols).contains(&pos.col)
    }

    pub fn normalize(&self, pos: Position) -> Position {
        match self.boundary {
            Boundary::Wrap => Position::new(pos.row.rem_euclid(self.rows), pos.col.rem_euclid(self.cols)),
            Boundary::Clamp => Position::new(
                pos.row.clamp(0, self.rows - 1),
                pos.col.clamp(0, self.cols - 1),
            ),
        }
    }

    pub fn step(&self, pos: Position, direction: Direction) -> Position {
        let (dr, dc) = direction.delta();
        self.normalize(Position::new(pos.row + dr, pos.col + dc))
    }

    pub fn random_cell<R: Rng + ?Sized>(&self, rng: &mut R) -> Position {
        Position::new(rng.gen_range(0..self.rows), rng.gen_range(0..self.cols))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("a snake must have at least one segment")]
pub struct EmptySnake;

/// Head-first list of cells occupied by a snake. Never empty.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(try_from = "Vec<Position>", into = "Vec<Position>")]
pub struct SnakeState(Vec<Position>);

impl SnakeState {
    pub fn new(body: Vec<Position>) -> Result<Self, EmptySnake> {
        if body.is_empty() {
            Err(EmptySnake)
        } else {
            Ok(Self(body))
        }
    }

    pub fn single(pos: Position) -> Self {
        Self(vec![pos])
    }

    pub fn from_parts(head: Position, tail: impl IntoIterator<Item = Position>) -> Self {
        let mut body = vec![head];
        body.extend(tail);
        Self(body)
    }

    pub fn head(&self) -> Position {
        self.0[0]
    }

    pub fn body(&self) -> &[Position] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<Position>> for SnakeState {
    type Error = EmptySnake;

    fn try_from(body: Vec<Position>) -> Result<Self, Self::Error> {
        SnakeState::new(body)
    }
}

impl From<SnakeState> for Vec<Position> {
    fn from(snake: SnakeState) -> Self {
        snake.0
    }
}

/// View of a room pushed to clients after every state change.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WorldSnapshot {
    /// Opponents only: the recipient's own snake is left out.
    pub snakes: HashMap<SessionId, SnakeState>,
    pub scores: HashMap<SessionId, u32>,
    pub top_score: u32,
    pub apples: Vec<Position>,
}

impl WorldSnapshot {
    /// Copy of this snapshot personalized for `recipient`.
    pub fn for_recipient(&self, recipient: SessionId) -> WorldSnapshot {
        let mut view = self.clone();
        view.snakes.remove(&recipient);
        view
    }
}

/// Every message exchanged on a game connection.
///
/// The variant order is the wire tag; append new variants at the end.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    RoomList {
        rooms: Vec<RoomId>,
    },
    RoomSelect {
        room_id: RoomId,
    },
    Welcome {
        session_id: SessionId,
        room_id: RoomId,
        grid: Grid,
        spawn: SnakeState,
    },
    Move {
        snake: SnakeState,
    },
    Score {
        score: u32,
    },
    Chat {
        text: String,
    },
    ChatRelay {
        from: SessionId,
        text: String,
    },
    Broadcast(WorldSnapshot),
    Eviction {
        message: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Number of [`Packet`] variants, i.e. the first tag that is not valid.
pub const PACKET_TAG_COUNT: u32 = 10;

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::RoomList { .. } => "room_list",
            Packet::RoomSelect { .. } => "room_select",
            Packet::Welcome { .. } => "welcome",
            Packet::Move { .. } => "move",
            Packet::Score { .. } => "score",
            Packet::Chat { .. } => "chat",
            Packet::ChatRelay { .. } => "chat_relay",
            Packet::Broadcast(_) => "broadcast",
            Packet::Eviction { .. } => "eviction",
            Packet::Disconnected { .. } => "disconnected",
        }
    }
}
