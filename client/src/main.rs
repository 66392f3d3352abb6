use clap::Parser;
use client::matchmaking::{
    CancelHandle, LocalMatchmaker, MatchmakingCoordinator, MatchmakingError,
};
use client::network::Client;
use log::{error, info};
use shared::backend::{BackendConfig, BackendGateway, HttpBackend};
use std::sync::Arc;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Account username
    #[clap(short, long)]
    username: String,

    /// Account password
    #[clap(short, long)]
    password: String,

    /// IP of the match server to request from the matchmaker
    #[clap(long, default_value = "127.0.0.1")]
    server_ip: String,

    /// Port of the match server to request from the matchmaker
    #[clap(long, default_value = "9000")]
    server_port: u16,

    /// Use the local development backend instead of the live one
    #[clap(long)]
    local_backend: bool,

    /// Base URL of the live backend
    #[clap(long, default_value = "https://backend.example.com")]
    backend_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let backend_config = if args.local_backend {
        BackendConfig::local()
    } else {
        BackendConfig::live(&args.backend_url)
    };
    let backend: Arc<dyn BackendGateway> = Arc::new(HttpBackend::new(backend_config)?);

    let user = backend.sign_in(&args.username, &args.password).await?;
    info!("Signed in as {} ({})", user.username, user.player_name);

    let mut client = Client::new(Arc::clone(&backend), user.clone());
    client.start_liveness_monitor();

    let matchmaker = Arc::new(LocalMatchmaker::new(&args.server_ip, args.server_port));
    let mut coordinator = MatchmakingCoordinator::new(matchmaker, Arc::clone(&backend));

    let cancel = CancelHandle::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Cancelling matchmaking...");
                cancel.cancel();
            }
        });
    }

    let assignment = match coordinator
        .find_match(&user.session_token, &user.username, &cancel)
        .await
    {
        Ok(assignment) => assignment,
        Err(MatchmakingError::Cancelled) => {
            info!("Matchmaking cancelled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    info!("Match found at {}:{}", assignment.ip, assignment.port);

    if let Err(e) = client.run_match(&assignment).await {
        error!("Match session error: {}", e);
        return Err(e.into());
    }

    info!("Match over");
    Ok(())
}
