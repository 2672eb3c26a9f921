//! Pipe forwarder: byte relay between a client and its backend
//!
//! One spliced pair runs two relay tasks, one per direction, plus the
//! coordinating task that owns the pair and watches for eviction. Whichever
//! finishes first tears the whole pair down.

use crate::backend::{BackendPool, ClientId};
use crate::eviction::Countdown;
use log::{debug, info, warn};
use shared::{FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RELAY_BUFFER_SIZE: usize = 4096;
/// How long an eviction waits for an in-flight frame to reach the client
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// A client's slot on one backend
///
/// Releasing frees the slot and wakes the queue drainer. It may be called
/// from either relay direction and from the coordinator; only the first call
/// has any effect.
pub struct Attachment {
    pool: Arc<BackendPool>,
    backend: usize,
    client: ClientId,
    capacity_freed: Arc<Notify>,
    released: AtomicBool,
}

impl Attachment {
    pub fn new(
        pool: Arc<BackendPool>,
        backend: usize,
        client: ClientId,
        capacity_freed: Arc<Notify>,
    ) -> Self {
        Self {
            pool,
            backend,
            client,
            capacity_freed,
            released: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> usize {
        self.backend
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Frees the slot and tells the drainer
    pub async fn release(&self) {
        if self.detach().await {
            self.capacity_freed.notify_one();
        }
    }

    /// Frees the slot without waking the drainer, for a client that is about
    /// to be queued again
    pub async fn abandon(&self) {
        self.detach().await;
    }

    async fn detach(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.pool.detach(self.backend, self.client).await {
            warn!("Detaching client {}: {}", self.client, e);
        }
        true
    }
}

/// How a spliced pair ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    ClientClosed,
    BackendClosed,
    Evicted,
}

/// Relays bytes between `client` and `backend` until either side closes or
/// the backend is evicted, then closes both connections
///
/// Backend-to-client traffic is relayed in whole frames, so the eviction
/// countdown never lands in the middle of a game frame.
pub async fn forward(
    client: TcpStream,
    peer: SocketAddr,
    backend: TcpStream,
    attachment: Attachment,
    evicted: oneshot::Receiver<()>,
    countdown: Countdown,
) -> PipeEnd {
    let attachment = Arc::new(attachment);
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();
    let shared_write = Arc::new(Mutex::new(client_write));

    let mut upstream = tokio::spawn(relay_upstream(
        client_read,
        backend_write,
        Arc::clone(&attachment),
    ));
    let mut downstream = tokio::spawn(relay_downstream(
        backend_read,
        Arc::clone(&shared_write),
        Arc::clone(&attachment),
    ));

    let end = tokio::select! {
        _ = &mut upstream => PipeEnd::ClientClosed,
        _ = &mut downstream => PipeEnd::BackendClosed,
        signal = evicted => match signal {
            Ok(()) => PipeEnd::Evicted,
            // Detached by one of the relays; let the select pick which.
            Err(_) => tokio::select! {
                _ = &mut upstream => PipeEnd::ClientClosed,
                _ = &mut downstream => PipeEnd::BackendClosed,
            },
        },
    };

    stop(upstream).await;

    // Downstream only writes while holding the lock, so once we own it no
    // frame is half written.
    let (mut client_write, settled) = match timeout(SETTLE_TIMEOUT, shared_write.lock()).await {
        Ok(guard) => {
            stop(downstream).await;
            (guard, true)
        }
        Err(_) => {
            stop(downstream).await;
            (shared_write.lock().await, false)
        }
    };

    if end == PipeEnd::Evicted {
        if settled {
            info!(
                "Evicting client {} ({}) from backend {}",
                attachment.client(),
                peer,
                attachment.backend()
            );
            countdown.run(&mut *client_write).await;
        } else {
            warn!(
                "Client {} ({}) stalled mid-frame, evicting without countdown",
                attachment.client(),
                peer
            );
        }
    }
    let _ = client_write.shutdown().await;
    attachment.release().await;

    debug!("Pipe for client {} ({}) closed: {:?}", attachment.client(), peer, end);
    end
}

/// Aborts a relay task and waits for it, unless it already completed
async fn stop(relay: JoinHandle<()>) {
    if relay.is_finished() {
        return;
    }
    relay.abort();
    let _ = relay.await;
}

/// Length of the longest prefix of `bytes` made of whole frames
///
/// Errors with the declared length when a header exceeds the frame limit.
fn whole_frames(bytes: &[u8]) -> Result<usize, usize> {
    let mut offset = 0;
    while let Some(header) = bytes.get(offset..offset + FRAME_HEADER_LEN) {
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(len);
        }
        let next = offset + FRAME_HEADER_LEN + len;
        if next > bytes.len() {
            break;
        }
        offset = next;
    }
    Ok(offset)
}

async fn relay_upstream(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    attachment: Arc<Attachment>,
) {
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    loop {
        match from.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = to.write_all(&buffer[..n]).await {
                    debug!("Client {} upstream write failed: {}", attachment.client(), e);
                    break;
                }
            }
            Err(e) => {
                debug!("Client {} upstream read failed: {}", attachment.client(), e);
                break;
            }
        }
    }
    let _ = to.shutdown().await;
    attachment.release().await;
}

async fn relay_downstream(
    mut from: OwnedReadHalf,
    to: Arc<Mutex<OwnedWriteHalf>>,
    attachment: Arc<Attachment>,
) {
    let mut pending = Vec::with_capacity(RELAY_BUFFER_SIZE);
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match from.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Client {} downstream read failed: {}", attachment.client(), e);
                break;
            }
        };
        pending.extend_from_slice(&buffer[..n]);

        let ready = match whole_frames(&pending) {
            Ok(ready) => ready,
            Err(len) => {
                warn!(
                    "Backend {} sent a {} byte frame to client {}, closing",
                    attachment.backend(),
                    len,
                    attachment.client()
                );
                break;
            }
        };
        if ready == 0 {
            continue;
        }

        let mut to = to.lock().await;
        if let Err(e) = to.write_all(&pending[..ready]).await {
            debug!(
                "Client {} downstream write failed: {}",
                attachment.client(),
                e
            );
            break;
        }
        drop(to);
        pending.drain(..ready);
    }
    attachment.release().await;
}
