use clap::Parser;
use client::network::{Client, DisconnectHook, SessionState};
use log::{error, info};
use shared::chat::ChatLine;
use shared::simulator::{LossyTransport, SimulatorConfig};
use shared::{transport, ClientConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Send lines unreliably
    #[arg(short = 'u', long)]
    unreliable: bool,

    /// Simulated outbound packet loss (0.0 - 1.0)
    #[arg(short = 'l', long, default_value = "0.0")]
    loss_rate: f64,

    /// Seed for the loss simulator
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let server_addr: SocketAddr = args.server.parse()?;
    let config = ClientConfig::new(server_addr);
    let hook: DisconnectHook = Box::new(|reason| info!("Session ended: {}", reason));

    let client = if args.loss_rate > 0.0 {
        let seed = args.seed.unwrap_or_else(rand::random);
        info!(
            "Simulating {:.1}% outbound loss (seed {})",
            args.loss_rate * 100.0,
            seed
        );
        let socket = transport::bind(transport::any_local_for(server_addr), config.poll_timeout)?;
        let lossy = LossyTransport::new(
            socket,
            SimulatorConfig {
                loss_rate: args.loss_rate,
                duplicate_rate: 0.0,
                seed,
            },
        );
        Client::with_transport(lossy, config, Some(hook))?
    } else {
        Client::initialize(config, Some(hook))?
    };
    let client = Arc::new(client);

    println!(
        "Connected as client {}. Type a line and press Enter, Ctrl+D quits.",
        client.id()
    );

    let printer = {
        let client = Arc::clone(&client);
        tokio::task::spawn_blocking(move || print_messages(&client))
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session_check = interval(Duration::from_millis(200));
    session_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = client.send(line.as_bytes(), !args.unreliable) {
                    error!("Send failed: {}", e);
                    break;
                }
            }
            _ = session_check.tick() => {
                if client.state() == SessionState::Disconnected {
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    // close() blocks while the Disconnect is confirmed.
    let closer = Arc::clone(&client);
    tokio::task::spawn_blocking(move || closer.close()).await?;
    printer.await?;

    let stats = client.stats();
    info!(
        "Sent {}, retransmitted {}, delivered {}",
        stats.sent, stats.retransmitted, stats.delivered
    );

    Ok(())
}

/// Prints relayed lines until the session ends.
fn print_messages(client: &Client) {
    loop {
        match client.wait_message(Duration::from_millis(100)) {
            Some(message) => match ChatLine::decode(&message.data) {
                Ok(line) => println!("[{}] {}", line.from, line.text),
                Err(_) => println!("[server] {}", String::from_utf8_lossy(&message.data)),
            },
            None if client.state() == SessionState::Disconnected => break,
            None => {}
        }
    }
}
