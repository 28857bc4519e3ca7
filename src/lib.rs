pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use error::{HistoryError, Result};
pub use logic::{
    BranchVerification, HistoryService, HistoryWalker, StructureSetup, StructureSetupResult,
};
pub use model::*;
pub use store::{InMemoryStore, PostgresStore, Store};

use std::sync::Arc;
use tokio::net::TcpListener;

use crate::api::{routes::create_router, AppState};
use crate::config::{AppConfig, HistoryConfig, StorageBackend};

/// Build the configured store and serve the HTTP API until shutdown
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.server_address()).await?;
    log::info!("Miller history server listening on http://{}", listener.local_addr()?);

    match config.storage.backend {
        StorageBackend::Memory => {
            let store = InMemoryStore::with_lock_timeout(config.history.transaction_timeout());
            serve(listener, Arc::new(store), config.history.clone()).await
        }
        StorageBackend::Postgres => {
            log::info!("Connecting to PostgreSQL...");
            let store = PostgresStore::new(
                &config.database_url()?,
                config.max_connections(),
                config.history.transaction_timeout(),
            )
            .await?;
            store.migrate().await?;
            log::info!("Database ready with history graph schema");
            serve(listener, Arc::new(store), config.history.clone()).await
        }
    }
}

/// Serve the API over an already-bound listener
pub async fn serve<S: Store + 'static>(
    listener: TcpListener,
    store: Arc<S>,
    history: HistoryConfig,
) -> anyhow::Result<()> {
    // Load seed data for demonstration (optional)
    if std::env::var("LOAD_SEED_DATA").unwrap_or_default() == "true" {
        log::info!("Loading seed data...");
        seed::load_seed_data(&*store).await?;
    }

    let app = create_router().with_state(AppState::new(store, history));
    axum::serve(listener, app).await?;

    Ok(())
}
