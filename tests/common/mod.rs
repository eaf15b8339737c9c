//! Shared harness: a session served over an in-memory pipe

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use quaymail::mailservice::r#impl::InMemoryMailService;
use quaymail::{BoxedStream, Connection, Encryptor, Error, HandshakeFailure, Mail, Phase, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Hands the stream straight back, so the client keeps talking plain text
pub struct PassthroughEncryptor;

#[async_trait]
impl Encryptor for PassthroughEncryptor {
    async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, HandshakeFailure> {
        Ok(stream)
    }
}

/// Fails every handshake; `keep_stream` decides whether the stream survives
pub struct RejectingEncryptor {
    pub keep_stream: bool,
}

#[async_trait]
impl Encryptor for RejectingEncryptor {
    async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, HandshakeFailure> {
        Err(HandshakeFailure {
            error: Error::Handshake("no shared cipher".to_string()),
            stream: if self.keep_stream { Some(stream) } else { None },
        })
    }
}

pub fn mail(n: u32) -> Mail {
    Mail::new(
        format!("sender{}@example.com", n),
        "testuser@example.com",
        format!("Message {}", n),
        Utc.with_ymd_and_hms(2024, 10, 8, 12, 0, n).unwrap(),
        format!("Body of message {}", n),
    )
}

/// `testuser` / `testpass` with three messages in INBOX and an empty Archive
pub async fn mail_service() -> InMemoryMailService {
    let service = InMemoryMailService::with_cost(4);
    service.add_user("testuser", "testpass").await.unwrap();
    for n in 1..=3 {
        service.deliver("testuser", "INBOX", mail(n)).await.unwrap();
    }
    service.create_folder("testuser", "Archive").await.unwrap();
    service
}

pub struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl TestClient {
    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next line without its CRLF; empty once the server has closed
    pub async fn recv(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end_matches(&['\r', '\n'][..]).to_string()
    }

    pub async fn expect(&mut self, expected: &str) {
        assert_eq!(self.recv().await, expected);
    }

    pub async fn assert_closed(&mut self) {
        assert_eq!(self.recv().await, "");
    }
}

pub type SessionHandle = JoinHandle<(quaymail::Result<()>, Phase)>;

/// Start a session and consume its greeting
pub async fn start_session<E: Encryptor + 'static>(
    service: InMemoryMailService,
    encryptor: E,
    idle_timeout: Duration,
) -> (TestClient, SessionHandle) {
    let (server, client) = tokio::io::duplex(16 * 1024);
    let connection = Connection::from_stream(server, None);
    let mut session = Session::new(
        connection,
        Arc::new(service),
        Arc::new(encryptor),
        idle_timeout,
    )
    .with_server_name("testmail");

    let handle = tokio::spawn(async move {
        let result = session.poll_for_requests().await;
        (result, session.phase())
    });

    let (reader, writer) = tokio::io::split(client);
    let mut client = TestClient {
        reader: BufReader::new(reader),
        writer,
    };
    client
        .expect("* OK [CAPABILITY STARTTLS CAPABILITY] testmail ready")
        .await;
    (client, handle)
}

/// Session already past STARTTLS and LOGIN
pub async fn authenticated_session() -> (TestClient, SessionHandle) {
    let (mut client, handle) =
        start_session(mail_service().await, PassthroughEncryptor, IDLE_TIMEOUT).await;
    client.send("a1 STARTTLS").await;
    client.expect("a1 OK Begin TLS negotiation now").await;
    client.expect("* OK TLS negotiation completed").await;
    client.send("a2 LOGIN testuser testpass").await;
    client.expect("* OK LOGIN completed").await;
    (client, handle)
}

/// Authenticated session with INBOX selected
pub async fn selected_session() -> (TestClient, SessionHandle) {
    let (mut client, handle) = authenticated_session().await;
    client.send("a3 SELECT INBOX").await;
    client.expect("* 3 EXISTS").await;
    client.expect("a3 OK SELECT completed").await;
    (client, handle)
}
