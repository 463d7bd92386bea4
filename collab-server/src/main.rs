//! Collaboration server: runs the session manager behind a WebSocket
//! listener.
//!
//! Configuration comes from `COLLAB_*` environment variables (see
//! [`ServerConfig::from_env`]); logging is controlled with `RUST_LOG`.

use std::process::ExitCode;
use std::sync::Arc;

use collab_session::{
    CollabServer, MemoryChatStore, MemoryDocumentStore, ServerConfig, SessionManager,
};
use log::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let manager = Arc::new(
        SessionManager::new(config.max_participants_per_session)
            .with_document_store(Arc::new(MemoryDocumentStore::new()))
            .with_chat_store(Arc::new(MemoryChatStore::new())),
    );
    let server = CollabServer::with_manager(config, manager);
    info!("Starting collaboration server on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    ExitCode::SUCCESS
}
