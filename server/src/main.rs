use clap::Parser;
use log::{debug, error, info, warn};
use server::client_manager::Recipients;
use server::network::{Server, ServerHooks};
use shared::chat::ChatLine;
use shared::config::DEFAULT_PORT;
use shared::simulator::{LossyTransport, SimulatorConfig};
use shared::{transport, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Simulated outbound packet loss (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    loss_rate: f64,

    /// Seed for the loss simulator
    #[arg(long)]
    seed: Option<u64>,

    /// Seconds between statistics reports
    #[arg(long, default_value = "10")]
    stats_interval: u64,
}

/// Runs a chat relay: every line a client sends is forwarded reliably to all
/// other clients.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let mut config = ServerConfig::new(bind_addr);
    config.max_clients = args.max_clients;

    let hooks = ServerHooks::new()
        .on_accept(|addr| {
            info!("Accepting connection from {}", addr);
            true
        })
        .on_disconnect(|client_id, reason| info!("Client {} left: {}", client_id, reason));

    let server = if args.loss_rate > 0.0 {
        let seed = args.seed.unwrap_or_else(rand::random);
        info!(
            "Simulating {:.1}% outbound loss (seed {})",
            args.loss_rate * 100.0,
            seed
        );
        let socket = transport::bind(config.bind_addr, config.poll_timeout)?;
        let lossy = LossyTransport::new(
            socket,
            SimulatorConfig {
                loss_rate: args.loss_rate,
                duplicate_rate: 0.0,
                seed,
            },
        );
        Server::with_transport(lossy, config, hooks)?
    } else {
        Server::initialize(config, hooks)?
    };
    let server = Arc::new(server);

    let relay = {
        let server = Arc::clone(&server);
        tokio::task::spawn_blocking(move || relay_messages(&server))
    };

    let mut stats_timer = interval(Duration::from_secs(args.stats_interval.max(1)));
    stats_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick since it fires immediately
    stats_timer.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = stats_timer.tick() => report_stats(&server),
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.close();
    relay.await?;

    Ok(())
}

/// Forwards delivered messages until the server closes.
fn relay_messages(server: &Server) {
    while server.exists() {
        let Some(message) = server.wait_message(Duration::from_millis(100)) else {
            continue;
        };

        let text = String::from_utf8_lossy(&message.data).into_owned();
        info!("Client {}: {}", message.peer_id, text);

        let line = ChatLine {
            from: message.peer_id,
            text,
        };
        let frame = match line.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode chat line: {}", e);
                continue;
            }
        };

        match server.send(Recipients::AllExcept(&[message.peer_id]), &frame, true) {
            Ok(count) => debug!("Relayed line from {} to {} clients", message.peer_id, count),
            Err(e) => warn!("Relay from client {} failed: {}", message.peer_id, e),
        }
    }
}

fn report_stats(server: &Server) {
    let ids = server.client_ids();
    info!("{} clients connected", ids.len());

    for client_id in ids {
        if let Some(stats) = server.stats(client_id) {
            info!(
                "Client {}: sent {}, retransmitted {}, delivered {}, buffered {}, duplicates {}, requests {}",
                client_id,
                stats.sent,
                stats.retransmitted,
                stats.delivered,
                stats.buffered,
                stats.duplicates,
                stats.requests_sent
            );
        }
    }
}
