use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, binds the listener and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Seconds a player has to fire before the turn passes
        #[clap(short, long, default_value = "30")]
        turn_secs: u64,
        /// Seconds between liveness pings
        #[clap(short, long, default_value = "10")]
        keep_alive_secs: u64,
        /// Maximum number of concurrent connections
        #[clap(short, long, default_value = "256")]
        max_connections: usize,
    }

    if std::env::var("RUST_LOG").is_err() {
        println!("Set RUST_LOG=info for detailed logging");
    }
    env_logger::init();

    let args = Args::parse();

    let keep_alive = Duration::from_secs(args.keep_alive_secs);
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        turn_duration: Duration::from_secs(args.turn_secs),
        keep_alive,
        idle_timeout: keep_alive * 3,
        max_connections: args.max_connections,
        ..ServerConfig::default()
    };

    let server = Server::bind(config).await?;

    // Handle shutdown gracefully
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.trigger();
        }
    });

    server.run().await?;
    Ok(())
}
