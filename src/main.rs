use std::sync::Arc;
use std::time::Duration;

use config::Config;
use dotenv::dotenv;
use engine::FfmpegEngine;
use log::{info, warn};
use registry::{Registry, RegistryConfig};
use server_inner::ServerInner;
use tonic::transport::Server;

pub mod service {
    tonic::include_proto!("streamer");
}

mod config;
mod diagnostics;
mod engine;
mod error;
mod profile;
mod registry;
mod server_inner;
mod session;
mod supervisor;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    let engine = Arc::new(FfmpegEngine::new(config.engine_path.clone()));
    let registry = Registry::new(RegistryConfig::from(&config), engine);
    let server = ServerInner::new(registry.clone());

    info!(
        "listening on {} (engine {}, ingest {})",
        config.listen_addr,
        config.engine_path.display(),
        config.ingest_base
    );
    Server::builder()
        .add_service(service::streamer_server::StreamerServer::new(server))
        .serve_with_shutdown(config.listen_addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if registry.shutdown().await > 0 {
        // engines still running when the runtime drops are killed outright
        let drained = tokio::time::timeout(config.kill_grace, async {
            while !registry.list_active().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("engines still running after {:?}", config.kill_grace);
        }
    }
    Ok(())
}
