use anyhow::Result;
use dog_jobs::{AppContext, JobsService};
use dog_server::{config_path, Container, DogConfig, LogHandler, CONFIG_PATH_VAR, ENV_PREFIX};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(true)
        .init();

    let path = config_path(std::env::args().nth(1), std::env::var(CONFIG_PATH_VAR).ok());
    let mut config = DogConfig::load(path.as_deref())?;
    let overrides = config.apply_env(ENV_PREFIX, std::env::vars());
    info!(
        "[dog-server] config loaded from {} ({} env override(s))",
        path.as_ref().map_or("defaults".to_string(), |p| p.display().to_string()),
        overrides
    );

    let ctx = AppContext::new(config.into_value());

    let mut container = Container::new();
    container.register("jobs", JobsService::new().with_default_handler(LogHandler))?;

    container
        .run(&ctx, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await
}
