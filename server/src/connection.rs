//! Per-connection handling: probe check, room handshake and the active
//! session loop
//!
//! Each accepted connection walks `Connected -> RoomAssigned -> Active ->
//! Disconnected`. The active loop runs in its own task; the caller awaits it
//! and then removes the session, so cleanup happens on every exit path,
//! panics included.

use crate::broadcast::BroadcastEngine;
use crate::config::ServerConfig;
use crate::probe::answer_probe;
use log::{debug, error, info, warn};
use shared::{
    write_packet, CodecError, DecodeError, Grid, Packet, PacketReader, RoomId, SessionId,
    SnakeState,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    RoomAssigned,
    Active,
    Disconnected,
}

/// Why an active session ended
#[derive(Debug)]
pub enum SessionEnd {
    ClientClosed,
    ReadFailed(std::io::Error),
    DecodeFailed(DecodeError),
    WriteFailed(CodecError),
    WriteTimedOut,
    /// The broadcast engine dropped the session's outbound queue
    Evicted,
    Panicked,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ClientClosed => write!(f, "client closed the connection"),
            SessionEnd::ReadFailed(e) => write!(f, "read failed: {}", e),
            SessionEnd::DecodeFailed(e) => write!(f, "undecodable frame: {}", e),
            SessionEnd::WriteFailed(e) => write!(f, "write failed: {}", e),
            SessionEnd::WriteTimedOut => write!(f, "write timed out"),
            SessionEnd::Evicted => write!(f, "dropped by broadcast"),
            SessionEnd::Panicked => write!(f, "session task panicked"),
        }
    }
}

struct Connection {
    peer: SocketAddr,
    state: ConnectionState,
    reader: PacketReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        debug!("{}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }
}

/// Drives one accepted connection until it is closed
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<BroadcastEngine>,
    config: Arc<ServerConfig>,
) {
    match answer_probe(&mut stream, config.probe_window).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            debug!("{}: dropped during probe check: {}", peer, e);
            return;
        }
    }

    let (read_half, write_half) = stream.into_split();
    let mut conn = Connection {
        peer,
        state: ConnectionState::Connected,
        reader: PacketReader::new(read_half),
        writer: write_half,
    };

    let room_id = match choose_room(&mut conn, &engine, &config).await {
        Ok(Some(room_id)) => room_id,
        Ok(None) => {
            conn.transition(ConnectionState::Disconnected);
            return;
        }
        Err(e) => {
            warn!("{}: handshake failed: {}", peer, e);
            return;
        }
    };
    conn.transition(ConnectionState::RoomAssigned);

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
    let (session_id, spawn) = match engine.join(room_id, outbound_tx).await {
        Ok(created) => created,
        Err(e) => {
            error!("{}: could not join room {}: {}", peer, room_id, e);
            return;
        }
    };
    info!(
        "{}: session {} active in room {}",
        peer, session_id, room_id
    );

    let session = ActiveSession {
        room_id,
        session_id,
        grid: engine.registry().grid(),
        spawn,
        engine: Arc::clone(&engine),
        config: Arc::clone(&config),
    };
    let end = match tokio::spawn(session.run(conn, outbound_rx)).await {
        Ok(end) => end,
        Err(e) => {
            error!("{}: session {} task failed: {}", peer, session_id, e);
            SessionEnd::Panicked
        }
    };

    if let Err(e) = engine.leave(room_id, session_id).await {
        error!("{}: cleanup of session {} failed: {}", peer, session_id, e);
    }
    info!(
        "{}: session {} disconnected from room {} ({})",
        peer, session_id, room_id, end
    );
}

/// Runs the room handshake. `Ok(None)` means the client was refused or left.
async fn choose_room(
    conn: &mut Connection,
    engine: &BroadcastEngine,
    config: &ServerConfig,
) -> Result<Option<RoomId>, CodecError> {
    let registry = engine.registry();
    if config.auto_room {
        return Ok(Some(registry.least_populated_room().await));
    }

    write_packet(
        &mut conn.writer,
        &Packet::RoomList {
            rooms: registry.room_ids(),
        },
    )
    .await?;

    let reply = timeout(config.handshake_timeout, conn.reader.next_packet()).await;
    let refusal = match reply {
        Ok(Ok(Some(Packet::RoomSelect { room_id }))) if registry.has_room(room_id) => {
            return Ok(Some(room_id));
        }
        Ok(Ok(Some(Packet::RoomSelect { room_id }))) => format!("unknown room {}", room_id),
        Ok(Ok(Some(other))) => format!("expected room selection, got {}", other.name()),
        Ok(Ok(None)) => {
            debug!("{}: left before choosing a room", conn.peer);
            return Ok(None);
        }
        Ok(Err(e)) => format!("invalid room selection: {}", e),
        Err(_) => "room selection timed out".to_string(),
    };

    info!("{}: refused: {}", conn.peer, refusal);
    let _ = write_packet(&mut conn.writer, &Packet::Disconnected { reason: refusal }).await;
    let _ = conn.writer.shutdown().await;
    Ok(None)
}

struct ActiveSession {
    room_id: RoomId,
    session_id: SessionId,
    grid: Grid,
    spawn: SnakeState,
    engine: Arc<BroadcastEngine>,
    config: Arc<ServerConfig>,
}

impl ActiveSession {
    async fn run(self, mut conn: Connection, mut outbound: mpsc::Receiver<Vec<u8>>) -> SessionEnd {
        let welcome = Packet::Welcome {
            session_id: self.session_id,
            room_id: self.room_id,
            grid: self.grid,
            spawn: self.spawn.clone(),
        };
        if let Err(e) = write_packet(&mut conn.writer, &welcome).await {
            return SessionEnd::WriteFailed(e);
        }
        conn.transition(ConnectionState::Active);

        let end = loop {
            // Our own queue goes out before the next buffered frame is
            // handled, or a burst of input would fill it with our own echoes.
            match outbound.try_recv() {
                Ok(frame) => match self.send(&mut conn.writer, &frame).await {
                    Some(end) => break end,
                    None => continue,
                },
                Err(TryRecvError::Disconnected) => break SessionEnd::Evicted,
                Err(TryRecvError::Empty) => {}
            }

            match conn.reader.next_frame() {
                Ok(Some(packet)) => {
                    self.handle_packet(packet).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() || self.config.strict_decode => {
                    break SessionEnd::DecodeFailed(e);
                }
                Err(e) => {
                    warn!(
                        "{}: skipping bad frame from session {}: {}",
                        conn.peer, self.session_id, e
                    );
                    continue;
                }
            }

            tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Some(end) = self.send(&mut conn.writer, &frame).await {
                            break end;
                        }
                    }
                    None => break SessionEnd::Evicted,
                },
                read = conn.reader.fill() => match read {
                    Ok(0) => break SessionEnd::ClientClosed,
                    Ok(_) => {}
                    Err(e) => break SessionEnd::ReadFailed(e),
                },
            }
        };

        conn.transition(ConnectionState::Disconnected);
        let _ = conn.writer.shutdown().await;
        end
    }

    /// Writes one queued frame; `Some` ends the session
    async fn send(&self, writer: &mut OwnedWriteHalf, frame: &[u8]) -> Option<SessionEnd> {
        match timeout(self.config.send_timeout, write_frame(writer, frame)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(SessionEnd::WriteFailed(e)),
            Err(_) => Some(SessionEnd::WriteTimedOut),
        }
    }

    async fn handle_packet(&self, packet: Packet) {
        let result = match packet {
            Packet::Move { snake } => {
                self.engine
                    .apply_move(self.room_id, self.session_id, snake)
                    .await
            }
            Packet::Score { score } => {
                self.engine
                    .apply_score(self.room_id, self.session_id, score)
                    .await
            }
            Packet::Chat { text } => {
                self.engine
                    .relay_chat(self.room_id, self.session_id, text)
                    .await
            }
            other => {
                debug!(
                    "Session {} sent {} while active, ignoring",
                    self.session_id,
                    other.name()
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Session {}: {}", self.session_id, e);
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), CodecError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use shared::{Position, WorldSnapshot};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct Harness {
        addr: SocketAddr,
        engine: Arc<BroadcastEngine>,
    }

    async fn start(config: ServerConfig) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(SessionRegistry::new(
            config.room_count,
            config.grid,
            config.food_count,
        ));
        let engine = Arc::new(BroadcastEngine::new(registry));
        let config = Arc::new(config);

        let accept_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    Arc::clone(&accept_engine),
                    Arc::clone(&config),
                ));
            }
        });

        Harness { addr, engine }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            room_count: 2,
            food_count: 0,
            probe_window: Duration::from_millis(20),
            handshake_timeout: Duration::from_millis(300),
            ..ServerConfig::default()
        }
    }

    async fn recv(reader: &mut PacketReader<OwnedReadHalf>) -> Packet {
        timeout(Duration::from_secs(2), reader.next_packet())
            .await
            .expect("timed out waiting for a packet")
            .unwrap()
            .expect("connection closed")
    }

    async fn join(addr: SocketAddr, room_id: RoomId) -> (PacketReader<OwnedReadHalf>, OwnedWriteHalf, SessionId) {
        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = PacketReader::new(read_half);

        assert_eq!(recv(&mut reader).await, Packet::RoomList { rooms: vec![0, 1] });
        write_packet(&mut write_half, &Packet::RoomSelect { room_id })
            .await
            .unwrap();

        match recv(&mut reader).await {
            Packet::Welcome {
                session_id,
                room_id: joined,
                ..
            } => {
                assert_eq!(joined, room_id);
                (reader, write_half, session_id)
            }
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    async fn snapshot_matching(
        reader: &mut PacketReader<OwnedReadHalf>,
        accept: impl Fn(&WorldSnapshot) -> bool,
    ) -> WorldSnapshot {
        loop {
            if let Packet::Broadcast(snapshot) = recv(reader).await {
                if accept(&snapshot) {
                    return snapshot;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_room_is_refused() {
        let harness = start(test_config()).await;
        let (read_half, mut write_half) = TcpStream::connect(harness.addr).await.unwrap().into_split();
        let mut reader = PacketReader::new(read_half);

        recv(&mut reader).await;
        write_packet(&mut write_half, &Packet::RoomSelect { room_id: 42 })
            .await
            .unwrap();

        match recv(&mut reader).await {
            Packet::Disconnected { reason } => assert!(reason.contains("42")),
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(reader.next_packet().await.unwrap(), None);
        for room in 0..2 {
            assert_eq!(harness.engine.registry().session_count(room).await, Ok(0));
        }
    }

    #[tokio::test]
    async fn test_silent_handshake_times_out() {
        let harness = start(test_config()).await;
        let (read_half, _write_half) = TcpStream::connect(harness.addr).await.unwrap().into_split();
        let mut reader = PacketReader::new(read_half);

        recv(&mut reader).await;
        match recv(&mut reader).await {
            Packet::Disconnected { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auto_room_skips_room_list() {
        let harness = start(ServerConfig {
            auto_room: true,
            ..test_config()
        })
        .await;
        let (read_half, _write_half) = TcpStream::connect(harness.addr).await.unwrap().into_split();
        let mut reader = PacketReader::new(read_half);

        match recv(&mut reader).await {
            Packet::Welcome { room_id, .. } => assert_eq!(room_id, 0),
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_frame_is_skipped() {
        let harness = start(test_config()).await;
        let (mut reader1, _w1, id1) = join(harness.addr, 0).await;
        let (_reader2, mut writer2, id2) = join(harness.addr, 0).await;

        // Unknown tag, then a valid move.
        let mut bogus = 4u32.to_le_bytes().to_vec();
        bogus.extend_from_slice(&99u32.to_le_bytes());
        writer2.write_all(&bogus).await.unwrap();
        let snake = SnakeState::single(Position::new(3, 8));
        write_packet(&mut writer2, &Packet::Move { snake: snake.clone() })
            .await
            .unwrap();

        let snapshot = snapshot_matching(&mut reader1, |s| s.snakes.get(&id2) == Some(&snake)).await;
        assert!(!snapshot.snakes.contains_key(&id1));
    }

    #[tokio::test]
    async fn test_strict_decode_drops_connection() {
        let harness = start(ServerConfig {
            strict_decode: true,
            ..test_config()
        })
        .await;
        let (mut reader, mut writer, _) = join(harness.addr, 1).await;

        let mut bogus = 4u32.to_le_bytes().to_vec();
        bogus.extend_from_slice(&99u32.to_le_bytes());
        writer.write_all(&bogus).await.unwrap();

        loop {
            match timeout(Duration::from_secs(2), reader.next_packet()).await.unwrap() {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.engine.registry().session_count(1).await, Ok(0));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_session() {
        let harness = start(test_config()).await;
        let (mut reader1, _w1, _) = join(harness.addr, 0).await;
        let (reader2, writer2, id2) = join(harness.addr, 0).await;

        snapshot_matching(&mut reader1, |s| s.snakes.contains_key(&id2)).await;
        drop(reader2);
        drop(writer2);

        snapshot_matching(&mut reader1, |s| !s.scores.contains_key(&id2)).await;
        assert_eq!(harness.engine.registry().session_count(0).await, Ok(1));
    }

    #[tokio::test]
    async fn test_probe_does_not_create_session() {
        let harness = start(test_config()).await;
        let mut stream = TcpStream::connect(harness.addr).await.unwrap();
        stream.write_all(shared::PROBE_TOKEN).await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, shared::PROBE_ACK);
        assert_eq!(harness.engine.registry().session_count(0).await, Ok(0));
    }

    #[tokio::test]
    async fn test_input_burst_keeps_sender_connected() {
        let harness = start(test_config()).await;
        let (mut reader, mut writer, id) = join(harness.addr, 0).await;

        let mut burst = Vec::new();
        for col in 0..3000 {
            let snake = SnakeState::single(Position::new(1, col % 20));
            burst.extend(shared::encode(&Packet::Move { snake }).unwrap());
        }
        burst.extend(shared::encode(&Packet::Score { score: 7 }).unwrap());
        writer.write_all(&burst).await.unwrap();

        snapshot_matching(&mut reader, |s| s.scores.get(&id) == Some(&7)).await;
        assert_eq!(harness.engine.registry().session_count(0).await, Ok(1));
    }

    #[test]
    fn test_session_end_messages() {
        assert_eq!(SessionEnd::Evicted.to_string(), "dropped by broadcast");
        let frame_error = SessionEnd::DecodeFailed(DecodeError::UnknownTag(12));
        assert!(frame_error.to_string().contains("12"));
    }
}
