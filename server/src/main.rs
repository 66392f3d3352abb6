use clap::Parser;
use log::error;
use server::network::{Server, ServerConfig};
use shared::backend::{BackendConfig, HttpBackend};
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Backend-assigned id of this server instance
    #[clap(long)]
    server_id: i64,

    /// Public IP address advertised to clients
    #[clap(long, default_value = "127.0.0.1")]
    server_ip: String,

    /// UDP port to bind and advertise
    #[clap(short, long, default_value = "9000")]
    port: u16,

    /// Use the local development backend instead of the live one
    #[clap(long)]
    local_backend: bool,

    /// Base URL of the live backend
    #[clap(long, default_value = "https://backend.example.com")]
    backend_url: String,

    /// Seconds to wait for both players before aborting the match
    #[clap(long, default_value = "60")]
    waiting_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    let backend_config = if args.local_backend {
        BackendConfig::local()
    } else {
        BackendConfig::live(&args.backend_url)
    };
    let backend = Arc::new(HttpBackend::new(backend_config)?);

    let config = ServerConfig {
        server_id: args.server_id,
        public_ip: args.server_ip.clone(),
        port: args.port,
        waiting_timeout: Duration::from_secs(args.waiting_timeout_secs),
    };

    let bind_addr = format!("0.0.0.0:{}", args.port);
    let mut server = Server::new(&bind_addr, config, backend).await?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
