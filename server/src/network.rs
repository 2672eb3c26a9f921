//! Server network layer: TCP listener and per-connection task dispatch

use crate::broadcast::BroadcastEngine;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::registry::SessionRegistry;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Game server accepting player connections and liveness probes on one port
pub struct Server {
    listener: TcpListener,
    engine: Arc<BroadcastEngine>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub async fn new(addr: &str, config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Server listening on {} with {} room(s) of {}x{}",
            listener.local_addr()?,
            config.room_count,
            config.grid.rows,
            config.grid.cols
        );

        let registry = Arc::new(SessionRegistry::new(
            config.room_count,
            config.grid,
            config.food_count,
        ));

        Ok(Server {
            listener,
            engine: Arc::new(BroadcastEngine::new(registry)),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(self.engine.registry())
    }

    /// Accepts connections until the task is cancelled
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Server started successfully");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&self.engine),
                        Arc::clone(&self.config),
                    ));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{write_packet, Packet, PacketReader, PROBE_ACK, PROBE_TOKEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<SessionRegistry>) {
        let server = Server::new("127.0.0.1:0", config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, registry)
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let server = Server::new("127.0.0.1:0", ServerConfig::default())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.registry().room_ids().len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        assert!(Server::new("not-an-address", ServerConfig::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_probe_and_player_share_the_port() {
        let (addr, registry) = spawn_server(ServerConfig {
            probe_window: Duration::from_millis(30),
            ..ServerConfig::default()
        })
        .await;

        let mut probe = TcpStream::connect(addr).await.unwrap();
        probe.write_all(PROBE_TOKEN).await.unwrap();
        let mut reply = Vec::new();
        probe.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, PROBE_ACK);

        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = PacketReader::new(read_half);
        match reader.next_packet().await.unwrap() {
            Some(Packet::RoomList { rooms }) => assert_eq!(rooms, vec![0, 1, 2, 3, 4]),
            other => panic!("expected room list, got {:?}", other),
        }
        write_packet(&mut write_half, &Packet::RoomSelect { room_id: 3 })
            .await
            .unwrap();
        assert!(matches!(
            reader.next_packet().await.unwrap(),
            Some(Packet::Welcome { room_id: 3, .. })
        ));
        assert_eq!(registry.session_count(3).await, Ok(1));
    }
}
