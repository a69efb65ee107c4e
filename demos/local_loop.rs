//! Producer and consumer in one process, wired over the in-memory hub
//!
//! Run with: cargo run --example local_loop [RESOLUTION]
//!
//! Examples:
//!   cargo run --example local_loop              # streams at 1280x720
//!   cargo run --example local_loop 640x360      # streams at 640x360
//!
//! By default the media processes are shell stand-ins (a byte generator and
//! a byte sink) so the demo runs anywhere. Set MESHCAST_REAL_CODECS=1 to use
//! the built-in ffmpeg/ffplay commands instead; that needs a Wayland session
//! with PipeWire screen capture and both binaries on PATH.

use std::sync::Arc;
use std::time::Duration;

use meshcast_rs::client::{ClientConfig, RelayClient};
use meshcast_rs::media::MediaCommand;
use meshcast_rs::server::{parse_resolution, RelayServer, ServerConfig, StreamSettings};
use meshcast_rs::transport::{Identity, MemoryHub};

fn print_usage() {
    eprintln!("Usage: local_loop [RESOLUTION]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  RESOLUTION    WIDTHxHEIGHT (default: 1280x720)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let (width, height) = match args.get(1) {
        Some(arg) => match parse_resolution(arg) {
            Ok(resolution) => resolution,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => (1280, 720),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshcast_rs=debug".parse()?),
        )
        .init();

    let real_codecs = std::env::var_os("MESHCAST_REAL_CODECS").is_some();

    let hub = MemoryHub::new();

    let mut server_config = ServerConfig::default()
        .nickname("LocalLoop")
        .settings(StreamSettings::default().resolution(width, height))
        .announce_interval(Duration::from_secs(5))
        .encoder_start_grace(Duration::from_millis(100));
    let mut client_config = ClientConfig::default().reconnect_delay(Duration::from_secs(3));

    if !real_codecs {
        server_config = server_config.encoder_command(MediaCommand::new(
            "sh",
            [
                "-c",
                "while true; do printf 'meshcast demo payload '; sleep 0.5; done",
            ],
        ));
        client_config = client_config.decoder_command(MediaCommand::new("sh", ["-c", "cat > /dev/null"]));
    }

    let server = RelayServer::new(hub.endpoint(&Identity::generate()), server_config)?;
    let registry = Arc::clone(server.registry());
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("Server error: {}", e);
        }
    });

    let (client, mut events) = RelayClient::new(hub.endpoint(&Identity::generate()), client_config)?;
    tokio::spawn(async move {
        if let Err(e) = client.run().await {
            eprintln!("Client error: {}", e);
        }
    });

    let stats = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            for session in registry.session_stats().await {
                println!(
                    "session {}: {} bytes relayed, last pong {:?} ago",
                    session.link, session.bytes_sent, session.last_pong_age
                );
            }
        }
    });

    println!("Streaming at {}x{}. Press Ctrl+C to exit.", width, height);
    tokio::select! {
        _ = async {
            while let Some(event) = events.recv().await {
                println!("client: {:?}", event);
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    stats.abort();
    Ok(())
}
