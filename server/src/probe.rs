//! Liveness probe responder
//!
//! The balancer's health monitor opens a plain connection, writes `PING` and
//! expects `PONG` before the server closes. Game clients stay silent until
//! they see the room list, so a connection that has not produced `PING`
//! within the probe window is treated as a game client.

use log::debug;
use shared::{PROBE_ACK, PROBE_TOKEN};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};

/// Answers the probe if this connection is one. Returns true when it was.
pub async fn answer_probe(stream: &mut TcpStream, window: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + window;
    let mut token = [0u8; 4];

    loop {
        let peeked = match timeout_at(deadline, stream.peek(&mut token)).await {
            Ok(result) => result?,
            Err(_) => return Ok(false),
        };

        if peeked == 0 || token[..peeked] != PROBE_TOKEN[..peeked] {
            return Ok(false);
        }

        if peeked == PROBE_TOKEN.len() {
            stream.read_exact(&mut token).await?;
            stream.write_all(PROBE_ACK).await?;
            stream.shutdown().await?;
            debug!("Answered liveness probe");
            return Ok(true);
        }

        // Part of the token has arrived; give the rest a moment.
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(Duration::from_millis(5)).await;
    }
}
