use log::{debug, info, warn};
use shared::{
    write_packet, Grid, Packet, PacketReader, ReadError, RoomId, SessionId, SnakeState,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// What the server told us when the session started
#[derive(Debug, Clone, PartialEq)]
pub struct JoinInfo {
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub grid: Grid,
    pub spawn: SnakeState,
}

/// TCP connection to a game server, directly or through the load balancer
pub struct GameClient {
    reader: PacketReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl GameClient {
    pub async fn connect(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        Ok(GameClient {
            reader: PacketReader::new(read_half),
            writer: write_half,
        })
    }

    /// Completes the room handshake
    ///
    /// Answers the room list with `choice`, or the first room offered. A
    /// server running with automatic room assignment skips straight to the
    /// welcome, which is accepted as well. Waits as long as it takes, since
    /// a queued client hears nothing until a backend frees up.
    pub async fn join(
        &mut self,
        choice: Option<RoomId>,
    ) -> Result<JoinInfo, Box<dyn std::error::Error>> {
        loop {
            let packet = match self.reader.next_packet().await? {
                Some(packet) => packet,
                None => return Err("connection closed before joining a room".into()),
            };

            match packet {
                Packet::RoomList { rooms } => {
                    let room_id = match choice.or_else(|| rooms.first().copied()) {
                        Some(room_id) => room_id,
                        None => return Err("server offered no rooms".into()),
                    };
                    debug!("Rooms offered: {:?}, choosing {}", rooms, room_id);
                    write_packet(&mut self.writer, &Packet::RoomSelect { room_id }).await?;
                }
                Packet::Welcome {
                    session_id,
                    room_id,
                    grid,
                    spawn,
                } => {
                    info!(
                        "Joined room {} as session {} at {:?}",
                        room_id,
                        session_id,
                        spawn.head()
                    );
                    return Ok(JoinInfo {
                        session_id,
                        room_id,
                        grid,
                        spawn,
                    });
                }
                Packet::Disconnected { reason } => {
                    return Err(format!("refused by server: {}", reason).into());
                }
                Packet::Eviction { message } => warn!("{}", message),
                other => debug!("Ignoring {} during handshake", other.name()),
            }
        }
    }

    pub async fn send_move(&mut self, snake: &SnakeState) -> Result<(), Box<dyn std::error::Error>> {
        let packet = Packet::Move {
            snake: snake.clone(),
        };
        write_packet(&mut self.writer, &packet).await?;
        Ok(())
    }

    pub async fn send_score(&mut self, score: u32) -> Result<(), Box<dyn std::error::Error>> {
        write_packet(&mut self.writer, &Packet::Score { score }).await?;
        Ok(())
    }

    pub async fn send_chat(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        let packet = Packet::Chat {
            text: text.to_string(),
        };
        write_packet(&mut self.writer, &packet).await?;
        Ok(())
    }

    /// Next packet from the server; `Ok(None)` once the server closes
    ///
    /// Safe to use as a `tokio::select!` branch.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, ReadError> {
        self.reader.next_packet().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Position;
    use tokio::net::TcpListener;

    /// Accepts one connection and hands its halves to `script`
    async fn fake_server<F, Fut>(script: F) -> String
    where
        F: FnOnce(PacketReader<OwnedReadHalf>, OwnedWriteHalf) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            script(PacketReader::new(read_half), write_half).await;
        });
        addr
    }

    fn welcome(room_id: RoomId) -> Packet {
        Packet::Welcome {
            session_id: SessionId(1),
            room_id,
            grid: Grid::default(),
            spawn: SnakeState::single(Position::new(2, 3)),
        }
    }

    #[tokio::test]
    async fn test_join_answers_room_list() {
        let addr = fake_server(|mut reader, mut writer| async move {
            write_packet(&mut writer, &Packet::RoomList { rooms: vec![0, 1, 2] })
                .await
                .unwrap();
            let chosen = match reader.next_packet().await.unwrap() {
                Some(Packet::RoomSelect { room_id }) => room_id,
                other => panic!("expected room select, got {:?}", other),
            };
            write_packet(&mut writer, &welcome(chosen)).await.unwrap();
        })
        .await;

        let mut client = GameClient::connect(&addr).await.unwrap();
        let info = client.join(Some(2)).await.unwrap();
        assert_eq!(info.room_id, 2);
        assert_eq!(info.spawn.head(), Position::new(2, 3));
    }

    #[tokio::test]
    async fn test_join_defaults_to_first_room() {
        let addr = fake_server(|mut reader, mut writer| async move {
            write_packet(&mut writer, &Packet::RoomList { rooms: vec![4, 5] })
                .await
                .unwrap();
            if let Ok(Some(Packet::RoomSelect { room_id })) = reader.next_packet().await {
                write_packet(&mut writer, &welcome(room_id)).await.unwrap();
            }
        })
        .await;

        let mut client = GameClient::connect(&addr).await.unwrap();
        assert_eq!(client.join(None).await.unwrap().room_id, 4);
    }

    #[tokio::test]
    async fn test_join_accepts_direct_welcome() {
        let addr = fake_server(|_reader, mut writer| async move {
            write_packet(&mut writer, &welcome(0)).await.unwrap();
        })
        .await;

        let mut client = GameClient::connect(&addr).await.unwrap();
        assert_eq!(client.join(Some(3)).await.unwrap().room_id, 0);
    }

    #[tokio::test]
    async fn test_join_refused() {
        let addr = fake_server(|_reader, mut writer| async move {
            write_packet(
                &mut writer,
                &Packet::Disconnected {
                    reason: "unknown room 9".to_string(),
                },
            )
            .await
            .unwrap();
        })
        .await;

        let mut client = GameClient::connect(&addr).await.unwrap();
        let err = client.join(Some(9)).await.unwrap_err();
        assert!(err.to_string().contains("unknown room 9"));
    }

    #[tokio::test]
    async fn test_sends_game_frames() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let addr = fake_server(|mut reader, _writer| async move {
            let mut received = Vec::new();
            while let Ok(Some(packet)) = reader.next_packet().await {
                received.push(packet);
            }
            let _ = tx.send(received);
        })
        .await;

        let mut client = GameClient::connect(&addr).await.unwrap();
        let snake = SnakeState::single(Position::new(1, 1));
        client.send_move(&snake).await.unwrap();
        client.send_score(2).await.unwrap();
        client.send_chat("gg").await.unwrap();
        drop(client);

        assert_eq!(
            rx.await.unwrap(),
            vec![
                Packet::Move { snake },
                Packet::Score { score: 2 },
                Packet::Chat {
                    text: "gg".to_string()
                },
            ]
        );
    }
}
