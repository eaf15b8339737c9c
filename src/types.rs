//! Core types used throughout the IMAP server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mailbox name
pub type MailboxName = String;

/// Username
pub type Username = String;

/// A stored message as the mail service hands it out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub body: String,
}

impl Mail {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        sent_at: DateTime<Utc>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            sent_at,
            body: body.into(),
        }
    }
}

/// User credentials for authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Username,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Passwords stay out of logs and panic messages.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Narrows the messages returned by a folder lookup.
///
/// The default filter matches every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailFilter {
    pub sender: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl MailFilter {
    pub fn matches(&self, mail: &Mail) -> bool {
        if let Some(sender) = &self.sender {
            if !mail.sender.eq_ignore_ascii_case(sender) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if mail.sent_at < since {
                return false;
            }
        }
        true
    }
}
