//! Health monitor: periodic liveness probes against every backend

use crate::config::MIN_TICK;
use crate::router::Router;
use log::{debug, info, warn};
use shared::{PROBE_ACK, PROBE_TOKEN};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Connects, sends `PING` and expects `PONG`, all within `limit`
pub async fn probe(address: &str, limit: Duration) -> bool {
    let exchange = async {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(PROBE_TOKEN).await?;
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        Ok::<_, std::io::Error>(reply == *PROBE_ACK)
    };

    match timeout(limit, exchange).await {
        Ok(Ok(acknowledged)) => acknowledged,
        Ok(Err(e)) => {
            debug!("Probe of {} failed: {}", address, e);
            false
        }
        Err(_) => {
            debug!("Probe of {} timed out", address);
            false
        }
    }
}

/// Probes every backend once and applies the health transitions
///
/// A backend going down has its clients evicted; one coming back is simply
/// available again and the queue drainer is woken.
pub async fn sweep(router: &Router, limit: Duration) {
    let pool = router.pool();
    for index in 0..pool.len() {
        let Ok(address) = pool.address(index) else {
            continue;
        };
        let alive = probe(address, limit).await;

        let was_healthy = match pool.set_healthy(index, alive).await {
            Ok(was_healthy) => was_healthy,
            Err(e) => {
                warn!("Health update failed: {}", e);
                continue;
            }
        };

        match (was_healthy, alive) {
            (true, false) => {
                warn!("Backend {} ({}) is down", index, address);
                if let Err(e) = router.evict(index).await {
                    warn!("Evicting clients of backend {} failed: {}", index, e);
                }
            }
            (false, true) => {
                info!("Backend {} ({}) has reconnected", index, address);
                router.notify_capacity();
            }
            _ => {}
        }
    }
}

/// Sweeps the pool every `every`, indefinitely
pub async fn run_health_monitor(router: Arc<Router>, every: Duration, limit: Duration) {
    let mut ticker = interval(every.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        sweep(&router, limit).await;
    }
}
