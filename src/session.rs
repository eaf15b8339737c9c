//! Session management for IMAP connections
//!
//! A [`Session`] owns one client connection from greeting to logout. It reads
//! one line at a time, checks the command against the current [`Phase`],
//! runs it, and writes the reply before reading the next line.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, UpgradeFailure};
use crate::error::{Error, Result};
use crate::mailservice::{MailContext, MailService};
use crate::protocol::{self, Command, CommandKind, FetchAttribute, Response};
use crate::tls::Encryptor;
use crate::types::*;

pub const DEFAULT_SERVER_NAME: &str = "quaymail";

/// Where a session is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connected,
    Encrypted,
    Authenticated,
    Selected,
    Fetching,
    LoggedOut,
    Disconnected,
}

impl Phase {
    /// Commands accepted in this phase, in the order CAPABILITY lists them.
    pub fn permitted(self) -> &'static [CommandKind] {
        match self {
            Phase::Connected => &[CommandKind::StartTls, CommandKind::Capability],
            Phase::Encrypted => &[CommandKind::Login, CommandKind::Capability],
            Phase::Authenticated => &[CommandKind::Select, CommandKind::Logout, CommandKind::Capability],
            Phase::Selected | Phase::Fetching => &[CommandKind::Fetch, CommandKind::Logout],
            Phase::LoggedOut | Phase::Disconnected => &[],
        }
    }

    pub fn permits(self, kind: CommandKind) -> bool {
        self.permitted().contains(&kind)
    }

    /// Phases in which the session holds a mail context
    pub fn is_authenticated(self) -> bool {
        matches!(self, Phase::Authenticated | Phase::Selected | Phase::Fetching)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::LoggedOut | Phase::Disconnected)
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Connected => "connected",
            Phase::Encrypted => "encrypted",
            Phase::Authenticated => "authenticated",
            Phase::Selected => "selected",
            Phase::Fetching => "fetching",
            Phase::LoggedOut => "logged out",
            Phase::Disconnected => "disconnected",
        }
    }

    fn capability_list(self) -> String {
        self.permitted()
            .iter()
            .map(|kind| kind.keyword())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// IMAP session state and connection handler
pub struct Session {
    id: Uuid,
    phase: Phase,
    // Taken out for the duration of a TLS upgrade
    connection: Option<Connection>,
    idle_timeout: Duration,
    server_name: String,

    service: Arc<dyn MailService>,
    encryptor: Arc<dyn Encryptor>,

    // Present exactly while `phase.is_authenticated()`
    mail: Option<Box<dyn MailContext>>,
    selected_mailbox: Option<MailboxName>,
}

impl Session {
    pub fn new(
        connection: Connection,
        service: Arc<dyn MailService>,
        encryptor: Arc<dyn Encryptor>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: Phase::Connected,
            connection: Some(connection),
            idle_timeout,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            service,
            encryptor,
            mail: None,
            selected_mailbox: None,
        }
    }

    /// Name used in the greeting and farewell lines
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn selected_mailbox(&self) -> Option<&str> {
        self.selected_mailbox.as_deref()
    }

    /// Serve the client until it logs out, disconnects or idles out.
    ///
    /// A client going away is not an error. Only transport faults are
    /// returned; the connection is closed either way.
    pub async fn poll_for_requests(&mut self) -> Result<()> {
        let peer = self.connection.as_ref().and_then(Connection::peer_addr);
        info!("[{}] Session started for {:?}", self.id, peer);

        let result = self.run().await;

        if let Some(connection) = self.connection.as_mut() {
            connection.close().await;
        }
        if self.phase != Phase::LoggedOut {
            self.enter(Phase::Disconnected);
        }
        info!("[{}] Session ended", self.id);
        result
    }

    async fn run(&mut self) -> Result<()> {
        let idle_timeout = self.idle_timeout;
        self.connection_mut()?.arm_idle_timer(idle_timeout);

        let greeting = Response::Ok {
            tag: None,
            message: format!(
                "[CAPABILITY {}] {} ready",
                Phase::Connected.capability_list(),
                self.server_name
            ),
        };

        let mut step = self.send(&greeting).await;
        while step.is_ok() && !self.phase.is_terminal() {
            step = match self.read_request_line().await {
                Ok(line) => self.handle_line(&line).await,
                Err(e) => Err(e),
            };
        }

        match step {
            Ok(()) => Ok(()),
            Err(e) if e.is_disconnect() => {
                info!("[{}] Client disconnected: {}", self.id, e);
                Ok(())
            }
            Err(e) => {
                error!("[{}] Session terminated by transport error: {}", self.id, e);
                Err(e)
            }
        }
    }

    async fn read_request_line(&mut self) -> Result<String> {
        let connection = self.connection_mut()?;
        let line = connection.read_line().await?;
        connection.rearm_idle_timer();
        Ok(line)
    }

    /// Handle one client line. Only transport errors come back out.
    async fn handle_line(&mut self, line: &str) -> Result<()> {
        debug!("[{}] C: {}", self.id, redact(line));

        let request = protocol::parse(line);
        let tag = request.tag;
        let kind = request.command.kind();

        if !self.phase.permits(kind) {
            let rejection = Error::BadSequence {
                command: kind.to_string(),
                phase: self.phase.to_string(),
            };
            warn!("[{}] {}", self.id, rejection);
            return self.send(&Response::bad_sequence(tag)).await;
        }

        match self.execute(tag.clone(), request.command).await {
            Err(e) if !e.is_transport() => {
                error!("[{}] {} failed: {}", self.id, kind, e);
                self.send(&Response::No {
                    tag,
                    message: format!("{} failed: {}", kind, e),
                })
                .await
            }
            result => result,
        }
    }

    async fn execute(&mut self, tag: Option<String>, command: Command) -> Result<()> {
        match command {
            Command::StartTls => self.handle_starttls(tag).await,
            Command::Capability => self.handle_capability().await,
            Command::Login { credentials } => self.handle_login(credentials).await,
            Command::Select { mailbox } => self.handle_select(tag, mailbox).await,
            Command::Fetch {
                request_id,
                item_set,
                attribute,
            } => self.handle_fetch(request_id, &item_set, &attribute).await,
            Command::Logout => self.handle_logout(tag).await,
            Command::Malformed { kind, reason } => {
                warn!("[{}] Malformed {}: {}", self.id, kind, reason);
                self.send(&Response::Bad { tag, message: reason }).await
            }
            Command::Unknown => self.send(&Response::bad_sequence(tag)).await,
        }
    }

    async fn handle_starttls(&mut self, tag: Option<String>) -> Result<()> {
        self.send(&Response::Ok {
            tag: tag.clone(),
            message: "Begin TLS negotiation now".to_string(),
        })
        .await?;

        let connection = self.connection.take().ok_or(Error::Aborted)?;
        match connection.upgrade_to_tls(self.encryptor.as_ref()).await {
            Ok(upgraded) => {
                self.connection = Some(upgraded);
                self.enter(Phase::Encrypted);
                info!("[{}] Connection upgraded to TLS", self.id);
                self.send(&Response::Ok {
                    tag: None,
                    message: "TLS negotiation completed".to_string(),
                })
                .await
            }
            Err(UpgradeFailure {
                error,
                connection: Some(connection),
            }) => {
                warn!("[{}] TLS negotiation failed: {}", self.id, error);
                self.connection = Some(connection);
                self.send(&Response::No {
                    tag,
                    message: error.to_string(),
                })
                .await
            }
            Err(UpgradeFailure {
                error,
                connection: None,
            }) => {
                if error.is_disconnect() {
                    info!("[{}] Connection closed during TLS negotiation: {}", self.id, error);
                } else {
                    error!("[{}] TLS negotiation failed, connection lost: {}", self.id, error);
                }
                self.enter(Phase::Disconnected);
                Err(Error::Aborted)
            }
        }
    }

    async fn handle_capability(&mut self) -> Result<()> {
        let response = Response::Untagged {
            message: format!("CAPABILITY {}", self.phase.capability_list()),
        };
        self.send(&response).await
    }

    async fn handle_login(&mut self, credentials: Credentials) -> Result<()> {
        match self
            .service
            .login(&credentials.username, &credentials.password)
            .await
        {
            Ok(context) => {
                info!("[{}] {} logged in", self.id, credentials.username);
                self.mail = Some(context);
                self.enter(Phase::Authenticated);
                self.send(&Response::Ok {
                    tag: None,
                    message: "LOGIN completed".to_string(),
                })
                .await
            }
            Err(Error::Authentication(reason)) => {
                info!(
                    "[{}] Login rejected for {}: {}",
                    self.id, credentials.username, reason
                );
                self.send(&Response::Bad {
                    tag: None,
                    message: format!("LOGIN rejected: {}", reason),
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_select(&mut self, tag: Option<String>, mailbox: MailboxName) -> Result<()> {
        let context = mail_context(&self.mail, self.phase)?;
        let found = context.fetch_folder(&mailbox, &MailFilter::default()).await;

        match found {
            Ok(messages) => {
                debug!("[{}] Selected {} ({} messages)", self.id, mailbox, messages.len());
                self.selected_mailbox = Some(mailbox);
                self.enter(Phase::Selected);
                self.send(&Response::Untagged {
                    message: format!("{} EXISTS", messages.len()),
                })
                .await?;
                self.send(&Response::Ok {
                    tag,
                    message: "SELECT completed".to_string(),
                })
                .await
            }
            Err(Error::NotFound(_)) => {
                self.send(&Response::No {
                    tag,
                    message: format!("Mailbox does not exist: {}", mailbox),
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// Renders every requested message before writing anything, so a failure
    /// leaves no partial output.
    async fn handle_fetch(
        &mut self,
        request_id: String,
        item_set: &std::collections::BTreeSet<u32>,
        attribute: &str,
    ) -> Result<()> {
        let attribute: FetchAttribute = match attribute.parse() {
            Ok(attribute) => attribute,
            Err(e) => {
                warn!("[{}] {}", self.id, e);
                return self
                    .send(&Response::Bad {
                        tag: Some(request_id),
                        message: e.to_string(),
                    })
                    .await;
            }
        };

        let mailbox = self
            .selected_mailbox
            .clone()
            .ok_or_else(|| Error::Internal("no mailbox selected".to_string()))?;
        let context = mail_context(&self.mail, self.phase)?;
        let messages = context.fetch_folder(&mailbox, &MailFilter::default()).await?;

        let mut lines = Vec::with_capacity(item_set.len());
        for &index in item_set {
            match index.checked_sub(1).and_then(|i| messages.get(i as usize)) {
                Some(mail) => lines.push(Response::Untagged {
                    message: attribute.render(index, mail),
                }),
                None => warn!(
                    "[{}] FETCH {}: message {} is outside 1..={}, skipping",
                    self.id,
                    request_id,
                    index,
                    messages.len()
                ),
            }
        }

        self.enter(Phase::Fetching);
        for line in &lines {
            self.send(line).await?;
        }
        self.send(&Response::Ok {
            tag: Some(request_id),
            message: "FETCH completed".to_string(),
        })
        .await
    }

    async fn handle_logout(&mut self, tag: Option<String>) -> Result<()> {
        self.send(&Response::Bye {
            message: format!("{} logging out", self.server_name),
        })
        .await?;
        self.send(&Response::Ok {
            tag,
            message: "LOGOUT completed".to_string(),
        })
        .await?;

        self.enter(Phase::LoggedOut);
        self.connection_mut()?.close().await;
        Ok(())
    }

    /// Move to `phase`, dropping the mail context when leaving the
    /// authenticated phases.
    fn enter(&mut self, phase: Phase) {
        if !phase.is_authenticated() {
            self.mail = None;
            self.selected_mailbox = None;
        }
        if phase != self.phase {
            debug!("[{}] {} -> {}", self.id, self.phase, phase);
        }
        self.phase = phase;
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(Error::Aborted)
    }

    async fn send(&mut self, response: &Response) -> Result<()> {
        debug!("[{}] S: {}", self.id, response.to_string().trim_end());
        self.connection_mut()?.write_response(response).await
    }
}

// Takes the field rather than `&self`: `Session` is not `Sync`.
fn mail_context(mail: &Option<Box<dyn MailContext>>, phase: Phase) -> Result<&dyn MailContext> {
    mail.as_deref()
        .ok_or_else(|| Error::Internal(format!("no mail context in the {} phase", phase)))
}

/// Mask the password of a LOGIN line for logging
fn redact(line: &str) -> String {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() >= 3 && tokens[1] == CommandKind::Login.keyword() {
        format!("{} LOGIN {} ****", tokens[0], tokens[2])
    } else {
        line.to_string()
    }
}
