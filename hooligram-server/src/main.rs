use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (HOOLIGRAM_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("HOOLIGRAM_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("hooligram_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    // Aborts with a usage error when PORT is missing.
    let config = hooligram_server::config::ServerConfig::parse();
    tracing::info!("Starting Hooligram server on {}", config.web_addr());
    if let Some(ref tcp_addr) = config.tcp_addr {
        tracing::info!("JSON-lines TCP transport enabled on {tcp_addr}");
    }
    if config.twilio_api_key.is_none() {
        tracing::warn!("TWILIO_API_KEY not set; phone verification requests will fail");
    }

    let server = hooligram_server::server::Server::new(config);
    server.run().await
}
