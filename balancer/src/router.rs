//! Connection router: backend assignment, the overflow queue and eviction

use crate::backend::{BackendPool, BalancerError, ClientId};
use crate::config::{BalancerConfig, MIN_TICK};
use crate::eviction::Countdown;
use crate::pipe::{forward, Attachment};
use crate::policy::Selector;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};

/// A client connection waiting for a backend slot
#[derive(Debug)]
pub struct QueuedClient {
    pub id: ClientId,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    pub queued_at: Instant,
}

#[derive(Default)]
struct OverflowQueue {
    clients: VecDeque<QueuedClient>,
    /// Set while the drainer holds a client it popped off the front
    draining: bool,
}

pub struct Router {
    pool: Arc<BackendPool>,
    selector: Selector,
    queue: Mutex<OverflowQueue>,
    capacity_freed: Arc<Notify>,
    next_client_id: AtomicU64,
    connect_timeout: Duration,
    countdown: Countdown,
}

impl Router {
    pub fn new(config: &BalancerConfig) -> Result<Self, BalancerError> {
        Ok(Self {
            pool: Arc::new(BackendPool::new(config.backends.clone(), config.capacity)?),
            selector: Selector::new(config.policy, config.overload_multiplier),
            queue: Mutex::new(OverflowQueue::default()),
            capacity_freed: Arc::new(Notify::new()),
            next_client_id: AtomicU64::new(1),
            connect_timeout: config.connect_timeout,
            countdown: Countdown {
                steps: config.countdown_steps,
                step: config.countdown_step,
            },
        })
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.clients.len()
    }

    /// Wakes the queue drainer
    pub fn notify_capacity(&self) {
        self.capacity_freed.notify_one();
    }

    /// Places a newly accepted client on a backend, or queues it
    ///
    /// Clients that arrive while others are already waiting go to the back
    /// of the queue.
    pub async fn assign(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let client = QueuedClient {
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            peer,
            stream,
            queued_at: Instant::now(),
        };

        {
            let mut queue = self.queue.lock().await;
            if !queue.clients.is_empty() || queue.draining {
                info!(
                    "Client {} ({}) queued behind {} waiting client(s)",
                    client.id,
                    peer,
                    queue.clients.len()
                );
                queue.clients.push_back(client);
                return;
            }
        }

        if let Err(client) = self.try_place(client).await {
            info!("All backends full, client {} ({}) queued", client.id, peer);
            self.queue.lock().await.clients.push_back(client);
        }
    }

    /// Attaches the client to a backend chosen by the policy and starts its
    /// pipe. Hands the client back if no backend has room.
    async fn try_place(self: &Arc<Self>, client: QueuedClient) -> Result<(), QueuedClient> {
        for _ in 0..self.pool.len() {
            let views = self.pool.views().await;
            let choice = {
                let mut rng = rand::thread_rng();
                self.selector.choose(&views, &mut rng)
            };
            let Some(index) = choice else {
                return Err(client);
            };

            match self.pool.try_attach(index, client.id).await {
                Ok(Some(evicted)) => {
                    tokio::spawn(Arc::clone(self).splice(client, index, evicted));
                    return Ok(());
                }
                Ok(None) => debug!("Backend {} filled up during selection, retrying", index),
                Err(e) => {
                    warn!("Selection produced {}", e);
                    return Err(client);
                }
            }
        }
        Err(client)
    }

    /// Connects to the backend and relays until the pair closes
    ///
    /// A backend that refuses or times out costs the client its slot, not
    /// its place: it goes back into the queue for the next drain.
    async fn splice(self: Arc<Self>, client: QueuedClient, index: usize, evicted: oneshot::Receiver<()>) {
        let attachment = Attachment::new(
            Arc::clone(&self.pool),
            index,
            client.id,
            Arc::clone(&self.capacity_freed),
        );

        let backend = match self.connect_backend(index).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Client {} ({}): {}, requeueing", client.id, client.peer, e);
                attachment.abandon().await;
                self.queue.lock().await.clients.push_back(client);
                return;
            }
        };

        info!(
            "Forwarding client {} ({}) to backend {} after {:?}",
            client.id,
            client.peer,
            index,
            client.queued_at.elapsed()
        );
        forward(
            client.stream,
            client.peer,
            backend,
            attachment,
            evicted,
            self.countdown,
        )
        .await;
    }

    async fn connect_backend(&self, index: usize) -> Result<TcpStream, BalancerError> {
        let address = self.pool.address(index)?;
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(BalancerError::Connect {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(BalancerError::ConnectTimeout {
                address: address.to_string(),
            }),
        }
    }

    /// Forcibly disconnects every client attached to the backend
    ///
    /// Each pipe sends its countdown and closes. A second call finds no
    /// clients left. Returns the number of clients signalled.
    pub async fn evict(&self, index: usize) -> Result<usize, BalancerError> {
        let attached = self.pool.drain_attached(index).await?;
        let count = attached.len();
        for (client, signal) in attached {
            if signal.send(()).is_err() {
                debug!("Client {} pipe already gone", client);
            }
        }
        if count > 0 {
            warn!("Evicted {} client(s) from backend {}", count, index);
        }
        Ok(count)
    }

    /// Assigns queued clients in arrival order until the queue is empty or
    /// no backend has room. Returns the number placed.
    pub async fn drain_queue(self: &Arc<Self>) -> usize {
        let mut placed = 0;
        loop {
            let client = {
                let mut queue = self.queue.lock().await;
                match queue.clients.pop_front() {
                    Some(client) => {
                        queue.draining = true;
                        client
                    }
                    None => {
                        queue.draining = false;
                        return placed;
                    }
                }
            };

            if !is_alive(&client.stream).await {
                info!(
                    "Queued client {} ({}) disconnected while waiting",
                    client.id, client.peer
                );
                self.queue.lock().await.draining = false;
                continue;
            }

            match self.try_place(client).await {
                Ok(()) => {
                    placed += 1;
                    self.queue.lock().await.draining = false;
                }
                Err(client) => {
                    let mut queue = self.queue.lock().await;
                    queue.clients.push_front(client);
                    queue.draining = false;
                    return placed;
                }
            }
        }
    }

    /// Drains the queue whenever capacity frees up, and on every poll tick
    pub async fn run_queue_drainer(self: Arc<Self>, poll: Duration) {
        let mut ticker = interval(poll.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let ticked = tokio::select! {
                _ = self.capacity_freed.notified() => false,
                _ = ticker.tick() => true,
            };

            let placed = self.drain_queue().await;
            if placed > 0 {
                debug!("Drained {} queued client(s)", placed);
            }
            if ticked {
                self.prune_queue().await;
            }
        }
    }

    /// Drops queued clients that hung up while waiting, anywhere in the
    /// queue, keeping the rest in arrival order. Returns how many went.
    pub async fn prune_queue(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let before = queue.clients.len();
        let mut kept = VecDeque::with_capacity(before);
        for client in queue.clients.drain(..) {
            if is_alive(&client.stream).await {
                kept.push_back(client);
            } else {
                info!(
                    "Queued client {} ({}) disconnected while waiting",
                    client.id, client.peer
                );
            }
        }
        queue.clients = kept;
        before - queue.clients.len()
    }

    /// Periodically logs backend health and load
    pub async fn run_load_monitor(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let views = self.pool.views().await;
            for view in &views {
                info!(
                    "Backend {} ({}): {}, {}/{} clients",
                    view.index,
                    view.address,
                    if view.healthy { "up" } else { "down" },
                    view.load,
                    view.capacity
                );
            }

            let waiting = self.queue_len().await;
            if waiting > 0 {
                info!("{} client(s) waiting for a backend", waiting);
                if views.iter().any(|v| v.has_room()) {
                    self.notify_capacity();
                }
            }
        }
    }
}

/// Whether a queued connection is still open
///
/// Queued clients have nothing to say yet, so a peek that does not complete
/// straight away means the connection is idle but alive.
async fn is_alive(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match timeout(Duration::from_millis(1), stream.peek(&mut probe)).await {
        Err(_) => true,
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use shared::{encode, Packet};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Backend that echoes everything back
    async fn echo_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr.to_string()
    }

    async fn front_door() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn config(backends: Vec<String>, capacity: usize) -> BalancerConfig {
        BalancerConfig {
            backends,
            capacity,
            policy: Policy::RoundRobin,
            connect_timeout: Duration::from_millis(500),
            countdown_steps: 2,
            countdown_step: Duration::from_millis(5),
            ..BalancerConfig::default()
        }
    }

    /// Connects a client through `router` and returns the client end
    async fn connect(router: &Arc<Router>, door: &TcpListener, addr: SocketAddr) -> TcpStream {
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = door.accept().await.unwrap();
        router.assign(accepted, peer).await;
        client
    }

    /// Sends one frame through the pipe and expects it echoed back
    async fn echo(client: &mut TcpStream, text: &str) {
        let frame = encode(&Packet::Chat {
            text: text.to_string(),
        })
        .unwrap();
        client.write_all(&frame).await.unwrap();
        let mut buf = vec![0u8; frame.len()];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, frame);
    }

    async fn wait_for_load(router: &Router, index: usize, load: usize) {
        for _ in 0..200 {
            if router.pool().view(index).await.unwrap().load == load {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("backend {} never reached load {}", index, load);
    }

    #[tokio::test]
    async fn test_assign_splices_to_backend() {
        let router = Arc::new(Router::new(&config(vec![echo_backend().await], 4)).unwrap());
        let (door, addr) = front_door().await;

        let mut client = connect(&router, &door, addr).await;
        echo(&mut client, "ping through").await;
        assert_eq!(router.pool().view(0).await.unwrap().load, 1);
        assert_eq!(router.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_full_pool_queues_then_drains_in_order() {
        let router = Arc::new(Router::new(&config(vec![echo_backend().await], 1)).unwrap());
        let (door, addr) = front_door().await;

        let first = connect(&router, &door, addr).await;
        wait_for_load(&router, 0, 1).await;
        let mut second = connect(&router, &door, addr).await;
        let mut third = connect(&router, &door, addr).await;
        assert_eq!(router.queue_len().await, 2);

        drop(first);
        wait_for_load(&router, 0, 0).await;
        assert_eq!(router.drain_queue().await, 1);
        assert_eq!(router.queue_len().await, 1);
        echo(&mut second, "second").await;

        drop(second);
        wait_for_load(&router, 0, 0).await;
        assert_eq!(router.drain_queue().await, 1);
        echo(&mut third, "third").await;
    }

    #[tokio::test]
    async fn test_dead_queue_entries_are_skipped() {
        let router = Arc::new(Router::new(&config(vec![echo_backend().await], 1)).unwrap());
        let (door, addr) = front_door().await;

        let first = connect(&router, &door, addr).await;
        wait_for_load(&router, 0, 1).await;
        let gone = connect(&router, &door, addr).await;
        let mut live = connect(&router, &door, addr).await;
        drop(gone);

        drop(first);
        wait_for_load(&router, 0, 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.drain_queue().await, 1);
        assert_eq!(router.queue_len().await, 0);
        echo(&mut live, "still here").await;
    }

    #[tokio::test]
    async fn test_prune_drops_hung_up_clients_while_full() {
        let router = Arc::new(Router::new(&config(vec![echo_backend().await], 1)).unwrap());
        let (door, addr) = front_door().await;

        let mut first = connect(&router, &door, addr).await;
        wait_for_load(&router, 0, 1).await;
        let a = connect(&router, &door, addr).await;
        let gone = connect(&router, &door, addr).await;
        let b = connect(&router, &door, addr).await;
        assert_eq!(router.queue_len().await, 3);

        drop(gone);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.drain_queue().await, 0);
        assert_eq!(router.prune_queue().await, 1);
        assert_eq!(router.queue_len().await, 2);
        echo(&mut first, "still placed").await;

        // Survivors keep their order: `a` is placed before `b`.
        let a_addr = a.local_addr().unwrap();
        drop(first);
        wait_for_load(&router, 0, 0).await;
        assert_eq!(router.drain_queue().await, 1);
        let queue = router.queue.lock().await;
        assert_eq!(queue.clients.len(), 1);
        assert_eq!(queue.clients[0].peer, b.local_addr().unwrap());
        assert_ne!(queue.clients[0].peer, a_addr);
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let router = Arc::new(Router::new(&config(vec![echo_backend().await], 4)).unwrap());
        let (door, addr) = front_door().await;

        let mut a = connect(&router, &door, addr).await;
        let mut b = connect(&router, &door, addr).await;
        echo(&mut a, "a").await;
        echo(&mut b, "b").await;

        assert_eq!(router.evict(0).await.unwrap(), 2);
        assert_eq!(router.evict(0).await.unwrap(), 0);
        assert!(router.evict(3).await.is_err());

        for client in [&mut a, &mut b] {
            let mut rest = Vec::new();
            timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
                .await
                .unwrap()
                .unwrap();
            assert!(!rest.is_empty());
        }
        assert_eq!(router.pool().view(0).await.unwrap().load, 0);
    }

    #[tokio::test]
    async fn test_refused_backend_requeues_client() {
        // Bind and drop to get a port nothing listens on.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let router = Arc::new(Router::new(&config(vec![dead], 4)).unwrap());
        let (door, addr) = front_door().await;

        let _client = connect(&router, &door, addr).await;
        for _ in 0..200 {
            if router.queue_len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(router.queue_len().await, 1);
        assert_eq!(router.pool().view(0).await.unwrap().load, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_loops_keep_running() {
        let router = Arc::new(Router::new(&config(vec![echo_backend().await], 1)).unwrap());
        let drainer = tokio::spawn(Arc::clone(&router).run_queue_drainer(Duration::ZERO));
        let monitor = tokio::spawn(Arc::clone(&router).run_load_monitor(Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());
        assert!(!monitor.is_finished());
        drainer.abort();
        monitor.abort();
    }

    #[tokio::test]
    async fn test_is_alive() {
        let (door, addr) = front_door().await;
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = door.accept().await.unwrap();
        assert!(is_alive(&accepted).await);

        drop(client);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!is_alive(&accepted).await);
    }
}
