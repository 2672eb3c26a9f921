use clap::{Parser, ValueEnum};
use log::info;
use server::config::ServerConfig;
use server::network::Server;
use shared::{Boundary, Grid};
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BoundaryArg {
    Wrap,
    Clamp,
}

impl From<BoundaryArg> for Boundary {
    fn from(arg: BoundaryArg) -> Self {
        match arg {
            BoundaryArg::Wrap => Boundary::Wrap,
            BoundaryArg::Clamp => Boundary::Clamp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "5555")]
    port: u16,

    /// Number of rooms
    #[arg(short, long, default_value = "5")]
    rooms: u32,

    #[arg(long, default_value = "20")]
    rows: i32,

    #[arg(long, default_value = "20")]
    cols: i32,

    /// What happens at the edge of the grid
    #[arg(long, value_enum, default_value = "wrap")]
    boundary: BoundaryArg,

    /// Apples per room, 0 disables food
    #[arg(long, default_value = "5")]
    food: usize,

    /// Put players in the least populated room instead of offering a choice
    #[arg(long)]
    auto_room: bool,

    /// Disconnect clients on the first undecodable frame
    #[arg(long)]
    strict_decode: bool,

    #[arg(long, default_value = "10000")]
    handshake_timeout_ms: u64,

    /// How long a new connection has to send a liveness probe
    #[arg(long, default_value = "150")]
    probe_window_ms: u64,

    /// Frames buffered per client before it is dropped as too slow
    #[arg(long, default_value = "64")]
    outbound_queue: usize,

    #[arg(long, default_value = "1000")]
    send_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            room_count: self.rooms,
            grid: Grid::new(self.rows, self.cols, self.boundary.into()),
            food_count: self.food,
            auto_room: self.auto_room,
            strict_decode: self.strict_decode,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            probe_window: Duration::from_millis(self.probe_window_ms),
            outbound_queue: self.outbound_queue,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);
    let server = Server::new(&address, args.config()).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
