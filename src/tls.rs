//! Server-side TLS negotiation for STARTTLS
//!
//! The session only needs "turn this byte stream into an encrypted one", so
//! that is all [`Encryptor`] asks of an implementation.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connection::BoxedStream;
use crate::error::{Error, Result};

/// Performs the server side of a TLS handshake over an existing stream
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Run the handshake over `stream` and return the encrypted stream.
    ///
    /// On failure, implementations hand `stream` back inside the
    /// [`HandshakeFailure`] when it is still usable as plain text.
    async fn accept(&self, stream: BoxedStream) -> std::result::Result<BoxedStream, HandshakeFailure>;
}

pub struct HandshakeFailure {
    pub error: Error,
    pub stream: Option<BoxedStream>,
}

impl fmt::Debug for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeFailure")
            .field("error", &self.error)
            .field("stream_recovered", &self.stream.is_some())
            .finish()
    }
}

/// [`Encryptor`] backed by the platform TLS library
#[derive(Clone)]
pub struct NativeTlsEncryptor {
    acceptor: tokio_native_tls::TlsAcceptor,
}

impl NativeTlsEncryptor {
    pub fn new(acceptor: native_tls::TlsAcceptor) -> Self {
        Self {
            acceptor: tokio_native_tls::TlsAcceptor::from(acceptor),
        }
    }

    /// Build from a PEM certificate chain and a PEM PKCS#8 private key.
    /// Only TLS 1.2 and newer are offered.
    pub fn from_pem(cert: &[u8], key: &[u8]) -> Result<Self> {
        let identity = native_tls::Identity::from_pkcs8(cert, key)?;
        let acceptor = native_tls::TlsAcceptor::builder(identity)
            .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
            .build()?;
        Ok(Self::new(acceptor))
    }
}

#[async_trait]
impl Encryptor for NativeTlsEncryptor {
    async fn accept(&self, stream: BoxedStream) -> std::result::Result<BoxedStream, HandshakeFailure> {
        let shared = Arc::new(Mutex::new(stream));
        let result = self.acceptor.accept(Reclaimable(Arc::clone(&shared))).await;

        match result {
            Ok(tls_stream) => Ok(Box::new(tls_stream)),
            Err(e) => Err(HandshakeFailure {
                error: Error::Handshake(e.to_string()),
                stream: reclaim(shared),
            }),
        }
    }
}

/// Lends a stream to the TLS acceptor while keeping a handle to the socket,
/// so a failed handshake can give the plaintext stream back.
struct Reclaimable(Arc<Mutex<BoxedStream>>);

impl Reclaimable {
    fn lock(&self) -> io::Result<MutexGuard<'_, BoxedStream>> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stream lock poisoned"))
    }
}

impl AsyncRead for Reclaimable {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut stream = self.lock()?;
        Pin::new(&mut *stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Reclaimable {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut stream = self.lock()?;
        Pin::new(&mut *stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.lock()?;
        Pin::new(&mut *stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.lock()?;
        Pin::new(&mut *stream).poll_shutdown(cx)
    }
}

/// The acceptor drops its handle when the handshake fails; anything else
/// still holding one means the stream cannot be recovered.
fn reclaim(shared: Arc<Mutex<BoxedStream>>) -> Option<BoxedStream> {
    match Arc::try_unwrap(shared) {
        Ok(mutex) => mutex.into_inner().ok(),
        Err(_) => {
            log::warn!("TLS acceptor still holds the stream, dropping connection");
            None
        }
    }
}
