use relayr::config::Config;
use relayr::server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::load();

    let directive = match config.tracing_directive() {
        Ok(directive) => directive,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();

    info!("Starting relayr HLS proxy");

    if config.healthcheck {
        match run_healthcheck(&config).await {
            Ok(()) => return,
            Err(e) => {
                error!("healthcheck failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    info!("Configuration: {:?}", config);

    if let Err(e) = server::start(config).await {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    }
}

/// Probe the configured server's health endpoint and exit accordingly.
async fn run_healthcheck(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let host = match config.host.trim() {
        "" | "0.0.0.0" => "127.0.0.1",
        host => host,
    };
    let url = format!("http://{}:{}/health", host, config.port);

    let response = reqwest::get(&url).await?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(format!("healthcheck failed: status {}", response.status()).into());
    }
    Ok(())
}
