use clap::Parser;
use client::game::ClientGameState;
use client::network::GameClient;
use log::{info, warn};
use rand::Rng;
use shared::{Direction, Packet};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

const DIRECTIONS: [Direction; 4] = [
    Direction::North,
    Direction::South,
    Direction::East,
    Direction::West,
];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Load balancer or game server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Room to join; defaults to the first room offered
    #[arg(short, long)]
    room: Option<u32>,

    /// Milliseconds between moves
    #[arg(short, long, default_value = "200")]
    tick_ms: u64,

    /// Chance per tick of turning in a random direction
    #[arg(long, default_value = "0.2")]
    turn_chance: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Starting bot against {}", args.server);

    let mut client = GameClient::connect(&args.server).await?;
    let joined = client.join(args.room).await?;
    let mut state = ClientGameState::new(
        joined.session_id,
        joined.room_id,
        joined.grid,
        &joined.spawn,
    );

    let mut ticker = interval(Duration::from_millis(args.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let turn_chance = args.turn_chance.clamp(0.0, 1.0);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let turn = {
                    let mut rng = rand::thread_rng();
                    rng.gen_bool(turn_chance)
                        .then(|| DIRECTIONS[rng.gen_range(0..DIRECTIONS.len())])
                };
                if let Some(direction) = turn {
                    state.local.turn(direction);
                }

                let ate = state.local.advance(&state.world.apples);
                client.send_move(&state.local.state()).await?;
                if ate {
                    client.send_score(state.local.score()).await?;
                    info!("Score {} (room best {})", state.local.score(), state.top_score());
                }
            }
            packet = client.next_packet() => match packet? {
                Some(Packet::Eviction { message }) => {
                    warn!("{}", message);
                    state.apply_server_packet(Packet::Eviction { message });
                }
                Some(Packet::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                    break;
                }
                Some(Packet::ChatRelay { from, text }) => {
                    info!("[{}] {}", from, text);
                    state.apply_server_packet(Packet::ChatRelay { from, text });
                }
                Some(packet) => state.apply_server_packet(packet),
                None => {
                    info!("Server closed the connection");
                    break;
                }
            },
        }
    }

    Ok(())
}
