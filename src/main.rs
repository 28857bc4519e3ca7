use env_logger::Builder;
use log::LevelFilter;
use miller_history::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Info by default, sqlx quieted; RUST_LOG still overrides
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={}:{}, storage={:?}",
        config.server.host,
        config.server.port,
        config.storage.backend
    );

    miller_history::run_server(config).await
}
