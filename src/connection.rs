//! Connection abstraction for plain and TLS streams
//!
//! A [`Connection`] owns exactly one byte stream and exposes the same
//! operations whether that stream is clear text or encrypted. Upgrading
//! consumes the plaintext connection and hands back a new TLS one built around
//! the same socket, so a half-upgraded handle can never be used.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::time::{self, Instant, Sleep};

use crate::error::{Error, Result};
use crate::protocol::Response;
use crate::tls::{Encryptor, HandshakeFailure};

/// Longest request line accepted, terminator included
pub const MAX_LINE_LEN: usize = 8192;

/// Any bidirectional byte stream a connection can sit on
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Whether traffic on a connection is encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Plain,
    Tls,
}

/// Split reader/writer with BufReader/BufWriter over one stream
struct Channel {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: BufWriter<WriteHalf<BoxedStream>>,
}

impl Channel {
    fn new(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        }
    }

    fn into_stream(self) -> BoxedStream {
        let read_half = self.reader.into_inner();
        let write_half = self.writer.into_inner();
        read_half.unsplit(write_half)
    }
}

/// Watchdog that closes a connection after a period without client input.
///
/// There is only ever one underlying timer; rearming moves its deadline.
pub struct IdleTimer {
    duration: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            sleep: Box::pin(time::sleep(duration)),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Push the deadline out to a full `duration` from now.
    pub fn rearm(&mut self) {
        let deadline = Instant::now() + self.duration;
        self.sleep.as_mut().reset(deadline);
    }

    async fn expired(&mut self) {
        self.sleep.as_mut().await
    }
}

/// A client connection, plain TCP or TLS-wrapped
pub struct Connection {
    security: Security,
    // `None` once closed
    channel: Option<Channel>,
    peer_addr: Option<SocketAddr>,
    idle_timer: Option<IdleTimer>,
}

/// A failed [`Connection::upgrade_to_tls`].
///
/// `connection` holds the original plaintext connection when the stream
/// survived the failed handshake.
#[derive(Debug)]
pub struct UpgradeFailure {
    pub error: Error,
    pub connection: Option<Connection>,
}

impl Connection {
    /// Create a new plain TCP connection
    pub fn plain(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self::from_stream(stream, Some(peer_addr)))
    }

    /// Create a plain connection over an arbitrary stream
    pub fn from_stream<S: AsyncStream + 'static>(stream: S, peer_addr: Option<SocketAddr>) -> Self {
        Self::with_channel(Security::Plain, Box::new(stream), peer_addr, None)
    }

    fn with_channel(
        security: Security,
        stream: BoxedStream,
        peer_addr: Option<SocketAddr>,
        idle_timer: Option<IdleTimer>,
    ) -> Self {
        Self {
            security,
            channel: Some(Channel::new(stream)),
            peer_addr,
            idle_timer,
        }
    }

    pub fn security(&self) -> Security {
        self.security
    }

    /// Check if this connection is using TLS
    pub fn is_tls(&self) -> bool {
        self.security == Security::Tls
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Get the peer address of the underlying TCP stream
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Start the idle timer, replacing any previous one.
    pub fn arm_idle_timer(&mut self, duration: Duration) {
        self.idle_timer = Some(IdleTimer::new(duration));
    }

    pub fn rearm_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.as_mut() {
            timer.rearm();
        }
    }

    pub fn idle_timer(&self) -> Option<&IdleTimer> {
        self.idle_timer.as_ref()
    }

    /// Upgrade a plain connection to TLS
    ///
    /// The handshake runs over the same socket. On success the returned
    /// connection replaces this one; the idle timer carries over.
    ///
    /// # Errors
    ///
    /// Returns an [`UpgradeFailure`] if:
    /// - The connection is already using TLS or is closed (connection returned untouched)
    /// - The TLS handshake fails (connection returned if the stream survived)
    /// - The idle timer fires mid-handshake ([`Error::Aborted`], no connection)
    pub async fn upgrade_to_tls(
        mut self,
        encryptor: &dyn Encryptor,
    ) -> std::result::Result<Connection, UpgradeFailure> {
        if self.is_tls() {
            return Err(UpgradeFailure {
                error: Error::Handshake("connection already using TLS".to_string()),
                connection: Some(self),
            });
        }

        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => {
                return Err(UpgradeFailure {
                    error: Error::Aborted,
                    connection: Some(self),
                })
            }
        };

        let pipelined = channel.reader.buffer().len();
        if pipelined > 0 {
            log::warn!(
                "Discarding {} plaintext bytes received after STARTTLS from {:?}",
                pipelined,
                self.peer_addr
            );
        }

        let handshake = encryptor.accept(channel.into_stream());
        let outcome = match self.idle_timer.as_mut() {
            Some(timer) => {
                tokio::select! {
                    biased;
                    accepted = handshake => Some(accepted),
                    _ = timer.expired() => None,
                }
            }
            None => Some(handshake.await),
        };

        let accepted = match outcome {
            Some(accepted) => accepted,
            None => {
                log::info!(
                    "Idle timeout elapsed during TLS negotiation with {:?}, dropping connection",
                    self.peer_addr
                );
                return Err(UpgradeFailure {
                    error: Error::Aborted,
                    connection: None,
                });
            }
        };

        match accepted {
            Ok(stream) => Ok(Connection::with_channel(
                Security::Tls,
                stream,
                self.peer_addr,
                self.idle_timer,
            )),
            Err(HandshakeFailure { error, stream }) => {
                let peer_addr = self.peer_addr;
                let idle_timer = self.idle_timer;
                Err(UpgradeFailure {
                    error,
                    connection: stream.map(|stream| {
                        Connection::with_channel(Security::Plain, stream, peer_addr, idle_timer)
                    }),
                })
            }
        }
    }

    /// Read one CRLF-terminated line, without the terminator.
    ///
    /// When an idle timer is armed and fires first, the connection is closed
    /// and the read fails with [`Error::Aborted`]. A line longer than
    /// [`MAX_LINE_LEN`] also closes the connection.
    pub async fn read_line(&mut self) -> Result<String> {
        let channel = self.channel.as_mut().ok_or(Error::Aborted)?;
        let mut buf = Vec::new();
        let mut limited = (&mut channel.reader).take(MAX_LINE_LEN as u64);

        let outcome = match self.idle_timer.as_mut() {
            Some(timer) => {
                tokio::select! {
                    biased;
                    read = limited.read_until(b'\n', &mut buf) => Some(read),
                    _ = timer.expired() => None,
                }
            }
            None => Some(limited.read_until(b'\n', &mut buf).await),
        };

        if buf.len() >= MAX_LINE_LEN && !buf.ends_with(b"\n") {
            log::warn!(
                "Request line from {:?} exceeds {} bytes, closing connection",
                self.peer_addr,
                MAX_LINE_LEN
            );
            self.close().await;
            return Err(Error::LineTooLong(MAX_LINE_LEN));
        }

        match outcome {
            None => {
                log::info!("Idle timeout elapsed for {:?}, closing connection", self.peer_addr);
                self.close().await;
                Err(Error::Aborted)
            }
            Some(Ok(0)) => Err(Error::Disconnected),
            // EOF in the middle of a line
            Some(Ok(_)) if !buf.ends_with(b"\n") => Err(Error::Disconnected),
            Some(Ok(_)) => {
                buf.pop();
                if buf.ends_with(b"\r") {
                    buf.pop();
                }
                Ok(String::from_utf8_lossy(&buf).into_owned())
            }
            Some(Err(e)) => Err(Error::Io(e)),
        }
    }

    /// Write raw bytes to the connection
    pub async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(Error::Aborted)?;
        channel.writer.write_all(buf).await?;
        channel.writer.flush().await?;
        Ok(())
    }

    /// Write a response to the connection
    pub async fn write_response(&mut self, response: &Response) -> Result<()> {
        self.send(response.to_string().as_bytes()).await
    }

    /// Shut the connection down and release the socket. Safe to call more
    /// than once; errors are logged, never returned.
    pub async fn close(&mut self) {
        self.idle_timer = None;
        let mut channel = match self.channel.take() {
            Some(channel) => channel,
            None => return,
        };

        if let Err(e) = channel.writer.shutdown().await {
            if already_closed(&e) {
                log::debug!("Connection to {:?} was already closed: {}", self.peer_addr, e);
            } else {
                log::warn!("Error shutting down connection to {:?}: {}", self.peer_addr, e);
            }
        }
        drop(channel);
        log::debug!("Closed connection to {:?}", self.peer_addr);
    }
}

fn already_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("security", &self.security)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}
