//! Mail service traits and implementations
//!
//! The mail service is the session's only way to reach stored mail: it checks
//! credentials and, on success, hands out a [`MailContext`] scoped to that
//! user. The session owns the context until it logs out or disconnects.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

pub mod r#impl;

/// Credential verification and entry point to a user's mail
#[async_trait]
pub trait MailService: Send + Sync {
    /// Verify the credentials and open the user's mail.
    ///
    /// Bad credentials yield [`crate::Error::Authentication`].
    async fn login(&self, username: &str, password: &str) -> Result<Box<dyn MailContext>>;
}

/// Access to one authenticated user's folders
#[async_trait]
pub trait MailContext: Send + Sync {
    fn username(&self) -> &str;

    /// Messages in `folder` that pass `filter`, in delivery order.
    ///
    /// An unknown folder yields [`crate::Error::NotFound`].
    async fn fetch_folder(&self, folder: &str, filter: &MailFilter) -> Result<Vec<Mail>>;
}
