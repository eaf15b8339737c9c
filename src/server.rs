//! IMAP server accept loop

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mailservice::MailService;
use crate::session::{Session, DEFAULT_SERVER_NAME};
use crate::tls::Encryptor;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MAX_SESSIONS: usize = 256;

/// Accepts plain connections and runs a [`Session`] for each on its own task
#[derive(Clone)]
pub struct ImapServer {
    service: Arc<dyn MailService>,
    encryptor: Arc<dyn Encryptor>,
    server_name: String,
    idle_timeout: Duration,
    sessions: Arc<Semaphore>,
}

impl ImapServer {
    pub fn new<M, E>(service: M, encryptor: E) -> Self
    where
        M: MailService + 'static,
        E: Encryptor + 'static,
    {
        Self {
            service: Arc::new(service),
            encryptor: Arc::new(encryptor),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sessions: Arc::new(Semaphore::new(DEFAULT_MAX_SESSIONS)),
        }
    }

    /// Apply the display name, idle timeout and session limit from `config`
    pub fn with_config(self, config: &ServerConfig) -> Self {
        self.with_server_name(config.server.display_name.clone())
            .with_idle_timeout(config.idle_timeout())
            .with_max_sessions(config.thread_pool.max_sessions)
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Connections beyond `max` wait in the listen backlog until a session ends
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.sessions = Arc::new(Semaphore::new(max));
        self
    }

    /// Bind to `addr` and serve until the listener fails
    pub async fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("IMAP server listening on {}", listener.local_addr()?);
        self.listen_on(listener).await
    }

    /// Serve on an existing listener (useful for testing)
    pub async fn listen_on(&self, listener: TcpListener) -> Result<()> {
        loop {
            let permit = Arc::clone(&self.sessions)
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("Session limiter closed: {}", e)))?;

            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            log::debug!("Accepted connection from {}", addr);

            let connection = match Connection::plain(stream) {
                Ok(connection) => connection,
                Err(e) => {
                    log::error!("Failed to set up connection from {}: {}", addr, e);
                    continue;
                }
            };

            let mut session = Session::new(
                connection,
                Arc::clone(&self.service),
                Arc::clone(&self.encryptor),
                self.idle_timeout,
            )
            .with_server_name(self.server_name.clone());

            tokio::spawn(async move {
                if let Err(e) = session.poll_for_requests().await {
                    log::error!("[{}] Session error: {}", session.id(), e);
                }
                drop(permit);
            });
        }
    }
}
