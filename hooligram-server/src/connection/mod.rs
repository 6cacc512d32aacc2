//! Per-client connection handler.
//!
//! Each connection, TCP or WebSocket, runs one read loop that decodes
//! frames and hands them to the [`dispatch::Handlers`] table, plus one
//! writer task that drains the connection's outbox. Responses are written
//! in the order requests arrive, one per request.
//!
//! The handlers are split by area:
//! - [`authorization`]: sign-in with a confirmed code
//! - [`verification`]: requesting and submitting SMS codes
//! - [`group`]: create, add member, leave
//! - [`messaging`]: sending a message to a group

pub mod authorization;
pub mod dispatch;
pub mod group;
pub mod messaging;
pub mod verification;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::db::{Client, Db};
use crate::protocol::{Action, MAX_FRAME_LEN, ProtocolError, decode_frame};
use crate::registry::{ConnId, Outbox, Registry, RegistryError};
use crate::server::SharedState;
use crate::sms::SmsError;

/// How long a closing connection waits for its writer to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Failure of a collaborator while handling a request. Reported to the
/// client as `"server error"`; the detail only goes to the log.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Sms(#[from] SmsError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Handler-side view of one live connection.
pub struct Session {
    id: ConnId,
    outbox: Outbox,
    state: Arc<SharedState>,
    healthy: AtomicBool,
}

impl Session {
    pub fn new(id: ConnId, outbox: Outbox, state: Arc<SharedState>) -> Self {
        Self {
            id,
            outbox,
            state,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// False once a write to this connection's outbox has failed.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Queue a raw line. A full or closed outbox marks the session dead.
    pub fn send(&self, line: String) {
        if self.outbox.try_send(line).is_err() {
            tracing::warn!(conn_id = self.id, "Send buffer full or closed");
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    pub fn reply(&self, action: &Action) {
        match action.encode() {
            Ok(line) => self.send(line),
            Err(e) => tracing::error!(conn_id = self.id, kind = %action.kind, "Failed to encode action: {e}"),
        }
    }

    /// Identity cached on this connection, confirmed or not.
    pub fn client(&self) -> Result<Option<Client>, RegistryError> {
        self.registry().identity(self.id)
    }

    /// Identity of this connection, only if it is signed in.
    pub fn signed_in_client(&self) -> Result<Option<Client>, RegistryError> {
        if !self.registry().is_signed_in(self.id)? {
            return Ok(None);
        }
        self.client()
    }

    /// Run a storage call with the database locked.
    pub fn db<T>(&self, f: impl FnOnce(&Db) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let db = self.state.db.lock();
        f(&db)
    }
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?.to_string();
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, peer, state).await
}

/// Handle a generic async stream (WebSocket bridge, tests).
pub async fn handle_generic<S>(stream: S, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, "stream".to_string(), state).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    peer: String,
    state: Arc<SharedState>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(state.config.outbox_capacity.max(1));
    let registration = state.registry.register(tx.clone());
    let conn_id = registration.id();
    tracing::info!(conn_id, %peer, "New connection");

    let mut write_half = writer;
    let mut write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                tracing::warn!(conn_id, "Write error: {e}");
                break;
            }
            // Drain whatever else is queued before flushing
            let mut batch_count = 0;
            while let Ok(queued) = rx.try_recv() {
                if let Err(e) = write_half.write_all(queued.as_bytes()).await {
                    tracing::warn!(conn_id, "Write error: {e}");
                    return;
                }
                batch_count += 1;
                if batch_count >= 64 {
                    break;
                }
            }
            if let Err(e) = write_half.flush().await {
                tracing::warn!(conn_id, "Flush error: {e}");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let session = Session::new(conn_id, tx, state.clone());
    let mut line = Vec::new();

    loop {
        if !session.is_healthy() {
            tracing::info!(conn_id, "Send channel unhealthy, disconnecting");
            break;
        }

        line.clear();
        let read = (&mut reader)
            .take(MAX_FRAME_LEN as u64 + 2)
            .read_until(b'\n', &mut line)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id, "Read error: {e}");
                break;
            }
        }

        let complete = line.ends_with(b"\n");
        if frame_len(&line) > MAX_FRAME_LEN {
            tracing::warn!(conn_id, len = line.len(), "Frame too long, dropping");
            if !complete && !discard_line(&mut reader).await.unwrap_or(false) {
                break;
            }
            session.reply(&Action::error(&ProtocolError::Malformed("frame too long".to_string())));
            continue;
        }

        let frame = match decode_frame(&line) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(conn_id, code = e.code(), "Rejected frame: {e}");
                session.reply(&Action::error(&e));
                continue;
            }
        };

        tracing::debug!(conn_id, kind = %frame.kind, "Frame received");
        state.handlers.dispatch(&session, frame).await;
    }

    tracing::info!(conn_id, "Connection closed");
    drop(registration);
    drop(session);
    if tokio::time::timeout(WRITER_DRAIN, &mut write_handle).await.is_err() {
        write_handle.abort();
    }
    Ok(())
}

/// Length of a line without its `\n` or `\r\n` terminator.
fn frame_len(line: &[u8]) -> usize {
    let mut len = line.len();
    if line[..len].ends_with(b"\n") {
        len -= 1;
    }
    if line[..len].ends_with(b"\r") {
        len -= 1;
    }
    len
}

/// Skip the rest of the current line. Returns false on EOF.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<bool> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(true);
        }
        let len = buf.len();
        reader.consume(len);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ServerConfig;
    use crate::delivery::{self, DeliveryReceiver};
    use crate::registry::Registration;
    use crate::sms::SmsVerifier;

    /// A session with no read loop behind it, for driving handlers directly.
    pub struct TestSession {
        pub session: Session,
        pub outbox: mpsc::Receiver<String>,
        pub deliveries: DeliveryReceiver,
        _registration: Registration,
    }

    impl TestSession {
        /// Decode every response written so far.
        pub fn drain(&mut self) -> Vec<Action> {
            let mut actions = Vec::new();
            while let Ok(line) = self.outbox.try_recv() {
                actions.push(serde_json::from_str(line.trim_end()).unwrap());
            }
            actions
        }
    }

    pub fn state_with(sms: SmsVerifier) -> (Arc<SharedState>, DeliveryReceiver) {
        let (queue, rx) = delivery::channel();
        let db = Db::open_memory().unwrap();
        let state = SharedState::new(ServerConfig::default(), db, sms, queue);
        (Arc::new(state), rx)
    }

    /// A session on a fresh server whose SMS provider knows `+1 5551234` (code 1234).
    pub fn session() -> TestSession {
        let (state, deliveries) = state_with(SmsVerifier::static_codes([("15551234", "1234")]));
        let mut test = attach(&state);
        test.deliveries = deliveries;
        test
    }

    /// Another session on an existing server. Its delivery receiver is a dummy.
    pub fn attach(state: &Arc<SharedState>) -> TestSession {
        let (tx, outbox) = mpsc::channel(64);
        let registration = state.registry.register(tx.clone());
        let session = Session::new(registration.id(), tx, state.clone());
        let (_, deliveries) = delivery::channel();
        TestSession { session, outbox, deliveries, _registration: registration }
    }

    /// Create a client and sign it in on this session.
    pub fn sign_in(test: &TestSession, phone: &str) -> Client {
        let client = test
            .session
            .db(|db| {
                let client = db.find_or_create_client("1", phone)?;
                db.update_verification_code(client.id, "1234")?;
                db.get_client(client.id).map(|c| c.unwrap_or(client))
            })
            .unwrap();
        test.session.registry().sign_in(test.session.id(), client.clone()).unwrap();
        client
    }
}
