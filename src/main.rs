use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use rtmp_streams::server::listener::Server;
use rtmp_streams::server::session::Session;
use rtmp_streams::utils::types::{Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Using default configuration, could not load {}: {}", args.config, e);
        Config::default()
    });

    let mut server = Server::bind(&args.bind).await?;
    let mut clients = server
        .clients()
        .ok_or_else(|| anyhow!("client feed already taken"))?;
    let mut errs = server
        .errs()
        .ok_or_else(|| anyhow!("error feed already taken"))?;
    info!("RTMP server listening on {:?}", server.local_addr());

    let server = Arc::new(server);
    let accept = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.accept().await }
    });

    let connections = Arc::new(Semaphore::new(config.max_connections));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            client = clients.recv() => {
                let Some(client) = client else {
                    info!("Client feed closed");
                    break;
                };
                let permit = match Arc::clone(&connections).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Connection limit reached, dropping {}", client.addr());
                        continue;
                    }
                };

                let config = config.clone();
                tokio::spawn(async move {
                    let addr = client.addr();
                    if let Err(e) = Session::new(client, config).run().await {
                        error!("Session error for {}: {}", addr, e);
                    }
                    drop(permit);
                });
            }
            Some(e) = errs.recv() => {
                if e.is_fatal() {
                    error!("Server stopped: {}", e);
                    break;
                }
                warn!("Server error: {}", e);
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    server.close().await;
    accept.await?;
    info!("Server closed");
    Ok(())
}
