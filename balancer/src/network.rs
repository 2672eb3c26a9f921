//! Load balancer network layer: front-door listener and background tasks

use crate::config::BalancerConfig;
use crate::health::run_health_monitor;
use crate::router::Router;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Aborts the background tasks when the balancer stops running
struct BackgroundTasks(Vec<JoinHandle<()>>);

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

pub struct LoadBalancer {
    listener: TcpListener,
    router: Arc<Router>,
    config: BalancerConfig,
}

impl LoadBalancer {
    pub async fn new(
        addr: &str,
        config: BalancerConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let router = Arc::new(Router::new(&config)?);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Load balancer listening on {} in front of {} backend(s), {} clients each",
            listener.local_addr()?,
            config.backends.len(),
            config.capacity
        );

        Ok(LoadBalancer {
            listener,
            router,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Starts the health monitor, queue drainer and load monitor, then
    /// accepts clients until cancelled
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let _tasks = BackgroundTasks(vec![
            tokio::spawn(run_health_monitor(
                Arc::clone(&self.router),
                self.config.health_interval,
                self.config.probe_timeout,
            )),
            tokio::spawn(Arc::clone(&self.router).run_queue_drainer(self.config.queue_poll)),
            tokio::spawn(
                Arc::clone(&self.router).run_load_monitor(self.config.load_report_interval),
            ),
        ]);

        info!("Load balancer started with {:?} policy", self.config.policy);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!("Client connected: {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let router = Arc::clone(&self.router);
                    tokio::spawn(async move { router.assign(stream, peer).await });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}
