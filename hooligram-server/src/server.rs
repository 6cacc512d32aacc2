//! Server bootstrap and shared state.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::{self, dispatch::Handlers};
use crate::db::Db;
use crate::delivery::{self, DeliveryQueue, DeliveryReceiver};
use crate::registry::Registry;
use crate::sms::SmsVerifier;

/// State shared by every connection task.
pub struct SharedState {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    /// Single SQLite connection; every call holds the lock for one statement
    /// (or one transaction).
    pub db: Mutex<Db>,
    pub sms: SmsVerifier,
    pub deliveries: DeliveryQueue,
    pub handlers: Handlers,
}

impl SharedState {
    pub fn new(config: ServerConfig, db: Db, sms: SmsVerifier, deliveries: DeliveryQueue) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            db: Mutex::new(db),
            sms,
            deliveries,
            handlers: Handlers::standard(),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    sms: Option<SmsVerifier>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, sms: None }
    }

    /// Create a server with a custom SMS verifier (for testing).
    pub fn with_verifier(config: ServerConfig, sms: SmsVerifier) -> Self {
        Self { config, sms: Some(sms) }
    }

    /// Build SharedState, opening the database. Also returns the receiving
    /// end of the delivery queue, which the caller hands to the dispatcher.
    fn build_state(&self) -> Result<(Arc<SharedState>, DeliveryReceiver)> {
        let db = match &self.config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {path}");
                Db::open(path).map_err(|e| anyhow::anyhow!("Failed to open database: {e}"))?
            }
            None => {
                tracing::info!("No database path configured, using in-memory storage");
                Db::open_memory().map_err(|e| anyhow::anyhow!("Failed to open database: {e}"))?
            }
        };

        let sms = match &self.sms {
            Some(sms) => sms.clone(),
            None => SmsVerifier::from_config(self.config.twilio_api_key.as_deref(), &self.config.authy_url)
                .map_err(|e| anyhow::anyhow!("Failed to build SMS client: {e}"))?,
        };

        let (queue, rx) = delivery::channel();
        let state = SharedState::new(self.config.clone(), db, sms, queue);
        Ok((Arc::new(state), rx))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let (state, jobs) = self.build_state()?;
        delivery::spawn(Arc::clone(&state.registry), jobs);

        if let Some(ref addr) = self.config.tcp_addr {
            let listener = TcpListener::bind(addr).await?;
            tracing::info!("JSON-lines TCP listener on {addr}");
            tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        }

        let web_addr = self.config.web_addr();
        let listener = TcpListener::bind(&web_addr).await?;
        tracing::info!("HTTP/WebSocket listener on {web_addr}");
        axum::serve(listener, crate::web::router(state)).await?;
        Ok(())
    }

    /// Start the TCP transport and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let addr = self.config.tcp_addr.clone().unwrap_or_else(|| "127.0.0.1:0".to_string());
        let listener = TcpListener::bind(&addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let (state, jobs) = self.build_state()?;
        delivery::spawn(Arc::clone(&state.registry), jobs);

        let handle = tokio::spawn(accept_loop(listener, state));
        Ok((addr, handle))
    }

    /// Start both the TCP transport and the HTTP/WebSocket listener (for testing).
    /// Returns (tcp_addr, web_addr, handle).
    pub async fn start_with_web(self) -> Result<(SocketAddr, SocketAddr, JoinHandle<Result<()>>)> {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await?;
        let tcp_addr = tcp_listener.local_addr()?;
        let web_listener = TcpListener::bind("127.0.0.1:0").await?;
        let web_addr = web_listener.local_addr()?;
        tracing::info!("TCP on {tcp_addr}, HTTP/WebSocket on {web_addr}");

        let (state, jobs) = self.build_state()?;
        delivery::spawn(Arc::clone(&state.registry), jobs);

        let router = crate::web::router(Arc::clone(&state));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(web_listener, router).await {
                tracing::error!("HTTP server error: {e}");
            }
        });
        let handle = tokio::spawn(accept_loop(tcp_listener, state));
        Ok((tcp_addr, web_addr, handle))
    }
}

/// Pause after a failed accept so a persistent error (such as EMFILE)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A source of incoming connections for [`accept_loop`].
pub(crate) trait Listener: Send + 'static {
    type Io: Send + 'static;

    fn next_conn(&mut self) -> impl Future<Output = io::Result<Self::Io>> + Send;

    fn serve(stream: Self::Io, state: Arc<SharedState>) -> impl Future<Output = Result<()>> + Send + 'static;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    async fn next_conn(&mut self) -> io::Result<TcpStream> {
        self.accept().await.map(|(stream, _addr)| stream)
    }

    async fn serve(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
        connection::handle(stream, state).await
    }
}

/// Accept connections forever. Accept errors are logged and retried.
async fn accept_loop<L: Listener>(mut listener: L, state: Arc<SharedState>) -> Result<()> {
    loop {
        let stream = match listener.next_conn().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = L::serve(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}
