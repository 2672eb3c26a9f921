use balancer::config::{BalancerConfig, Policy};
use balancer::network::LoadBalancer;
use clap::{Parser, ValueEnum};
use log::info;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    RoundRobin,
    LeastLoaded,
}

impl From<PolicyArg> for Policy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::RoundRobin => Policy::RoundRobin,
            PolicyArg::LeastLoaded => Policy::LeastLoaded,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port clients connect to
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Game server address, repeat for each backend
    #[arg(
        short,
        long = "backend",
        default_values_t = [
            "127.0.0.1:5555".to_string(),
            "127.0.0.1:5556".to_string(),
            "127.0.0.1:5557".to_string(),
        ]
    )]
    backends: Vec<String>,

    /// Clients per backend before new arrivals are queued
    #[arg(short, long, default_value = "4")]
    capacity: usize,

    #[arg(long, value_enum, default_value = "least-loaded")]
    policy: PolicyArg,

    /// Load above this multiple of the pool average counts as overloaded
    #[arg(long, default_value = "1.5")]
    overload: f64,

    #[arg(long, default_value = "5")]
    health_interval_secs: u64,

    #[arg(long, default_value = "2000")]
    probe_timeout_ms: u64,

    #[arg(long, default_value = "2000")]
    connect_timeout_ms: u64,

    /// Countdown notices sent to clients of a failed backend
    #[arg(long, default_value = "5")]
    countdown: u32,

    #[arg(long, default_value = "1000")]
    countdown_step_ms: u64,

    #[arg(long, default_value = "1000")]
    queue_poll_ms: u64,

    #[arg(long, default_value = "10")]
    load_report_secs: u64,
}

impl Args {
    fn config(&self) -> BalancerConfig {
        BalancerConfig {
            backends: self.backends.clone(),
            capacity: self.capacity,
            policy: self.policy.into(),
            overload_multiplier: self.overload,
            health_interval: Duration::from_secs(self.health_interval_secs.max(1)),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            countdown_steps: self.countdown,
            countdown_step: Duration::from_millis(self.countdown_step_ms),
            queue_poll: Duration::from_millis(self.queue_poll_ms.max(1)),
            load_report_interval: Duration::from_secs(self.load_report_secs.max(1)),
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
    let balancer = LoadBalancer::new(&address, args.config()).await?;

    tokio::select! {
        result = balancer.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
