//! Error types for the IMAP server

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed its end of the connection.
    #[error("Client disconnected")]
    Disconnected,

    /// The operation was cut short because the transport had been closed
    /// (idle timeout, logout, or an earlier failure).
    #[error("Operation aborted: transport closed")]
    Aborted,

    /// The peer sent more than this many bytes without a line terminator.
    #[error("Request line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("{command} is not permitted in the {phase} phase")]
    BadSequence { command: String, phase: String },

    #[error("Unsupported fetch attribute: {0}")]
    UnsupportedAttribute(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error means the client went away rather than that
    /// something broke.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected | Error::Aborted => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// True for errors that leave the transport unusable and so end the session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Disconnected | Error::Aborted | Error::LineTooLong(_)
        )
    }
}
