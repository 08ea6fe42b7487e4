use core_config::tracing::{init_tracing, install_color_eyre};
use relay_api::config::AppConfig;
use tracing::info;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Install color-eyre first for colored error output (before any fallible operations)
    install_color_eyre();

    let config = AppConfig::from_env()?;
    init_tracing(&config.environment);

    info!(
        name = %config.name,
        version = %config.version,
        environment = ?config.environment,
        "Starting relay API"
    );

    relay_api::run(config).await
}
