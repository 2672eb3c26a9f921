use shared::Grid;
use std::time::Duration;

/// Startup configuration for one game server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of pre-allocated rooms, ids `0..room_count`
    pub room_count: u32,
    pub grid: Grid,
    /// Apples kept on the board of every room; 0 disables food
    pub food_count: usize,
    /// Join the least populated room instead of offering the room list
    pub auto_room: bool,
    /// Drop the connection on the first undecodable frame
    pub strict_decode: bool,
    pub handshake_timeout: Duration,
    /// How long a fresh connection may take to identify itself as a probe
    pub probe_window: Duration,
    /// Outbound frames buffered per connection before it is dropped as too slow
    pub outbound_queue: usize,
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            room_count: 5,
            grid: Grid::default(),
            food_count: 5,
            auto_room: false,
            strict_decode: false,
            handshake_timeout: Duration::from_secs(10),
            probe_window: Duration::from_millis(150),
            outbound_queue: 64,
            send_timeout: Duration::from_secs(1),
        }
    }
}
