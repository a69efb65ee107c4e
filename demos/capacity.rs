//! Admission control demo: one seat, two consumers
//!
//! Run with: cargo run --example capacity
//!
//! Starts a producer with max_clients=1 and two consumers. The first takes
//! the seat; the second receives the capacity notice and is torn down, then
//! keeps retrying on its reconnect delay until the seat frees up.

use std::sync::Arc;
use std::time::Duration;

use meshcast_rs::client::{ClientConfig, ClientEvent, RelayClient};
use meshcast_rs::media::MediaCommand;
use meshcast_rs::server::{RelayServer, ServerConfig, StreamSettings};
use meshcast_rs::transport::{Identity, MemoryHub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshcast_rs=info".parse()?),
        )
        .init();

    let hub = MemoryHub::new();

    let server_config = ServerConfig::default()
        .nickname("OneSeat")
        .settings(StreamSettings::default().max_clients(1))
        .announce_interval(Duration::from_secs(2))
        .encoder_start_grace(Duration::from_millis(100))
        .encoder_command(MediaCommand::new(
            "sh",
            ["-c", "while true; do printf x; sleep 0.5; done"],
        ));

    let server = RelayServer::new(hub.endpoint(&Identity::generate()), server_config)?;
    let registry = Arc::clone(server.registry());
    tokio::spawn(async move { server.run().await });

    for name in ["first", "second"] {
        let config = ClientConfig::default()
            .reconnect_delay(Duration::from_secs(5))
            .decoder_command(MediaCommand::new("sh", ["-c", "cat > /dev/null"]));
        let (client, mut events) = RelayClient::new(hub.endpoint(&Identity::generate()), config)?;
        tokio::spawn(async move { client.run().await });
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::Connected { nickname } => {
                        println!("[{}] connected to {}", name, nickname)
                    }
                    ClientEvent::Refused => println!("[{}] refused: no free seat", name),
                    other => println!("[{}] {:?}", name, other),
                }
            }
        });
        // Let the first consumer win the seat deterministically
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                println!("sessions: {}", registry.session_count().await);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                return Ok(());
            }
        }
    }
}
