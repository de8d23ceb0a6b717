use clap::Parser;
use client::network::Client;
use log::info;
use shared::PlayerId;
use tokio::io::BufReader;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Player id sent in the upgrade request
    #[arg(short = 'i', long)]
    id: String,

    /// Display name; defaults to the id
    #[arg(short = 'n', long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let name = args.name.unwrap_or_else(|| args.id.clone());

    info!("Starting client...");
    info!("Commands: fire <x> <y>, say <text>, board, quit");

    let client = Client::connect(&args.server, PlayerId::new(args.id), &name).await?;
    client.run(BufReader::new(tokio::io::stdin())).await?;

    Ok(())
}
