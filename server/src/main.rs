use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use std::path::PathBuf;

/// Main-method of the application.
/// Loads configuration, applies command-line overrides, and runs the server
/// until it fails or Ctrl+C is pressed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// TOML configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Server IP address to bind to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Connect port that answers the handshake
        #[clap(short, long)]
        port: Option<u16>,
        /// Maximum number of connected users
        #[clap(short, long)]
        max_users: Option<usize>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.connect_port = port;
    }
    if let Some(max_users) = args.max_users {
        config.max_users = max_users;
    }
    config.validate()?;

    let mut server = Server::new(config).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
