//! Server configuration, from command-line flags or the environment.

use clap::Parser;

/// Default base URL of the Authy-compatible verification API.
pub const DEFAULT_AUTHY_URL: &str = "https://api.authy.com";

#[derive(Debug, Clone, Parser)]
#[command(name = "hooligram-server", version, about = "Hooligram messaging server")]
pub struct ServerConfig {
    /// Port for the HTTP/WebSocket listener.
    #[arg(long, env = "PORT")]
    pub port: u16,

    /// Interface the HTTP/WebSocket listener binds to.
    #[arg(long, env = "HOOLIGRAM_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Optional plain TCP listener speaking newline-delimited JSON actions.
    #[arg(long, env = "HOOLIGRAM_TCP_ADDR")]
    pub tcp_addr: Option<String>,

    /// SQLite database path. In-memory when unset.
    #[arg(long, env = "HOOLIGRAM_DB")]
    pub db_path: Option<String>,

    /// API key for the SMS verification provider.
    #[arg(long, env = "TWILIO_API_KEY", hide_env_values = true)]
    pub twilio_api_key: Option<String>,

    /// Base URL of the SMS verification provider.
    #[arg(long, env = "AUTHY_URL", default_value = DEFAULT_AUTHY_URL)]
    pub authy_url: String,

    /// Per-connection outbound queue size. A connection whose queue fills
    /// up is considered stuck and is dropped.
    #[arg(long, env = "HOOLIGRAM_OUTBOX_CAPACITY", default_value_t = 4096)]
    pub outbox_capacity: usize,
}

impl ServerConfig {
    /// Address of the HTTP/WebSocket listener.
    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind: "127.0.0.1".to_string(),
            tcp_addr: None,
            db_path: None,
            twilio_api_key: None,
            authy_url: DEFAULT_AUTHY_URL.to_string(),
            outbox_capacity: 4096,
        }
    }
}
