//! Test harness: a server on an ephemeral port and a JSON-lines client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use hooligram_server::config::ServerConfig;
use hooligram_server::protocol::Action;
use hooligram_server::server::Server;
use hooligram_server::sms::SmsVerifier;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Numbers the static SMS provider knows, with their codes.
pub const CODES: [(&str, &str); 4] = [
    ("15550001", "1111"),
    ("15550002", "2222"),
    ("15550003", "3333"),
    ("15550004", "4444"),
];

pub fn verifier() -> SmsVerifier {
    SmsVerifier::static_codes(CODES)
}

pub async fn start_server() -> SocketAddr {
    let server = Server::with_verifier(ServerConfig::default(), verifier());
    let (addr, _handle) = server.start().await.unwrap();
    addr
}

pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self { lines: BufReader::new(read).lines(), writer }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn send(&mut self, kind: &str, payload: Value) {
        let frame = json!({ "type": kind, "payload": payload });
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn recv(&mut self) -> Action {
        let line = timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Whether a frame arrives within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Action> {
        match timeout(wait, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Some(serde_json::from_str(&line).unwrap()),
            _ => None,
        }
    }

    pub async fn request(&mut self, kind: &str, payload: Value) -> Action {
        self.send(kind, payload).await;
        self.recv().await
    }

    /// Request a code and submit it. Returns the client id.
    pub async fn verify(&mut self, phone: &str) -> i64 {
        let code = CODES
            .iter()
            .find(|(number, _)| *number == format!("1{phone}"))
            .map(|(_, code)| *code)
            .expect("number not known to the test SMS provider");

        let action = self
            .request(
                "VERIFICATION_REQUEST_CODE_REQUEST",
                json!({ "country_code": "1", "phone_number": phone }),
            )
            .await;
        assert_eq!(action.kind, "VERIFICATION_REQUEST_CODE_SUCCESS", "{action:?}");

        let action = self.request("VERIFICATION_SUBMIT_CODE_REQUEST", json!({ "code": code })).await;
        assert_eq!(action.kind, "VERIFICATION_SUBMIT_CODE_SUCCESS", "{action:?}");
        action.payload["id"].as_i64().unwrap()
    }

    /// Send a message to a group this client belongs to. The sender's own
    /// copy of the delivery may arrive before or after its success, so both
    /// frames are read. Returns (success, delivery).
    pub async fn send_message(&mut self, group_id: i64, content: &str) -> (Action, Action) {
        self.send("MESSAGING_SEND_REQUEST", json!({ "group_id": group_id, "content": content }))
            .await;
        let first = self.recv().await;
        let second = self.recv().await;
        if first.kind == "MESSAGING_DELIVER" { (second, first) } else { (first, second) }
    }
}
