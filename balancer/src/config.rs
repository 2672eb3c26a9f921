use std::time::Duration;

/// Shortest period any background loop ticks at; a zero interval is raised
/// to this
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// How the router picks a backend for a new client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Rotate through the pool, skipping backends that are down or full
    RoundRobin,
    /// Random candidate, replaced by the least loaded backend when the
    /// candidate is overloaded relative to the pool average
    LeastLoaded,
}

/// Startup configuration for one load balancer process.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Game server addresses, in pool order
    pub backends: Vec<String>,
    /// Clients one backend accepts before new arrivals are queued
    pub capacity: usize,
    pub policy: Policy,
    pub overload_multiplier: f64,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    /// Number of `"N..."` notices sent before an evicted client is closed
    pub countdown_steps: u32,
    pub countdown_step: Duration,
    pub queue_poll: Duration,
    pub load_report_interval: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            backends: vec![
                "127.0.0.1:5555".to_string(),
                "127.0.0.1:5556".to_string(),
                "127.0.0.1:5557".to_string(),
            ],
            capacity: 4,
            policy: Policy::LeastLoaded,
            overload_multiplier: 1.5,
            health_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            countdown_steps: 5,
            countdown_step: Duration::from_secs(1),
            queue_poll: Duration::from_secs(1),
            load_report_interval: Duration::from_secs(10),
        }
    }
}
