//! Quaymail - a minimal async IMAP server core
//!
//! This library provides the transport (plain TCP with an in-place STARTTLS
//! upgrade), the per-connection session state machine and the command
//! parser, on top of a pluggable mail service.

pub mod config;
pub mod connection;
pub mod error;
pub mod mailservice;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;
pub mod types;

pub use config::ServerConfig;
pub use connection::{BoxedStream, Connection, Security};
pub use error::{Error, Result};
pub use mailservice::{MailContext, MailService};
pub use server::ImapServer;
pub use session::{Phase, Session};
pub use tls::{Encryptor, HandshakeFailure, NativeTlsEncryptor};
pub use types::*;
