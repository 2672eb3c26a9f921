//! Countdown notices sent to clients whose backend went down

use log::debug;
use shared::{write_packet, Packet};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::time::sleep;

pub const FINAL_NOTICE: &str = "Connection closed.";

#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    pub steps: u32,
    pub step: Duration,
}

impl Countdown {
    pub fn announcement(&self) -> String {
        format!(
            "Server is down. Connection will close in {} seconds.",
            self.steps
        )
    }

    /// Sends the announcement, one notice per step and the final notice
    ///
    /// Delivery is best effort: once a write fails the remaining step
    /// notices are skipped. Returns how many notices were written.
    pub async fn run<W>(&self, writer: &mut W) -> usize
    where
        W: AsyncWrite + Unpin,
    {
        let mut sent = 0;
        if notify(writer, self.announcement()).await {
            sent += 1;
            for remaining in (1..=self.steps).rev() {
                sleep(self.step).await;
                if !notify(writer, format!("{}...", remaining)).await {
                    break;
                }
                sent += 1;
            }
        }

        if notify(writer, FINAL_NOTICE.to_string()).await {
            sent += 1;
        }
        sent
    }
}

async fn notify<W>(writer: &mut W, message: String) -> bool
where
    W: AsyncWrite + Unpin,
{
    match write_packet(writer, &Packet::Eviction { message }).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Eviction notice not delivered: {}", e);
            false
        }
    }
}
