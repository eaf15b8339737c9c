//! In-memory mail service implementation

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::mailservice::{MailContext, MailService};
use crate::types::*;

const INBOX: &str = "INBOX";

struct Account {
    password_hash: String,
    folders: HashMap<MailboxName, Vec<Mail>>,
}

type Accounts = Arc<RwLock<HashMap<Username, Account>>>;

/// INBOX is matched case-insensitively, every other folder exactly.
fn folder_key(name: &str) -> String {
    if name.eq_ignore_ascii_case(INBOX) {
        INBOX.to_string()
    } else {
        name.to_string()
    }
}

/// Mail service keeping accounts and folders in memory.
///
/// Passwords are stored as bcrypt hashes. Every account starts with an
/// empty INBOX.
pub struct InMemoryMailService {
    accounts: Accounts,
    cost: u32,
}

impl InMemoryMailService {
    pub fn new() -> Self {
        Self::with_cost(bcrypt::DEFAULT_COST)
    }

    /// Use a specific bcrypt cost (lower is faster, for tests)
    pub fn with_cost(cost: u32) -> Self {
        Self {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            cost,
        }
    }

    pub async fn add_user(&self, username: &str, password: &str) -> Result<()> {
        let password = password.to_string();
        let cost = self.cost;
        let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| Error::Internal(format!("Password hashing task failed: {}", e)))?
            .map_err(|e| Error::Internal(format!("Failed to hash password: {}", e)))?;

        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(username) {
            return Err(Error::Internal(format!("User already exists: {}", username)));
        }

        let mut folders = HashMap::new();
        folders.insert(INBOX.to_string(), Vec::new());
        accounts.insert(
            username.to_string(),
            Account {
                password_hash,
                folders,
            },
        );
        log::debug!("Created account {}", username);
        Ok(())
    }

    pub async fn create_folder(&self, username: &str, folder: &str) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| Error::NotFound(format!("user {}", username)))?;
        account.folders.entry(folder_key(folder)).or_default();
        Ok(())
    }

    /// Append `mail` to the end of `folder`
    pub async fn deliver(&self, username: &str, folder: &str, mail: Mail) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| Error::NotFound(format!("user {}", username)))?;
        let messages = account
            .folders
            .get_mut(&folder_key(folder))
            .ok_or_else(|| Error::NotFound(format!("folder {}", folder)))?;
        messages.push(mail);
        Ok(())
    }
}

impl Default for InMemoryMailService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailService for InMemoryMailService {
    async fn login(&self, username: &str, password: &str) -> Result<Box<dyn MailContext>> {
        let password_hash = {
            let accounts = self.accounts.read().await;
            match accounts.get(username) {
                Some(account) => account.password_hash.clone(),
                None => return Err(Error::Authentication("invalid credentials".to_string())),
            }
        };

        let password = password.to_string();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
            .await
            .map_err(|e| Error::Internal(format!("Password check task failed: {}", e)))?
            .map_err(|e| Error::Internal(format!("Failed to verify password: {}", e)))?;

        if !valid {
            return Err(Error::Authentication("invalid credentials".to_string()));
        }

        Ok(Box::new(InMemoryMailContext {
            username: username.to_string(),
            accounts: Arc::clone(&self.accounts),
        }))
    }
}

struct InMemoryMailContext {
    username: Username,
    accounts: Accounts,
}

#[async_trait]
impl MailContext for InMemoryMailContext {
    fn username(&self) -> &str {
        &self.username
    }

    async fn fetch_folder(&self, folder: &str, filter: &MailFilter) -> Result<Vec<Mail>> {
        let accounts = self.accounts.read().await;
        let account = accounts
            .get(&self.username)
            .ok_or_else(|| Error::NotFound(format!("user {}", self.username)))?;
        let messages = account
            .folders
            .get(&folder_key(folder))
            .ok_or_else(|| Error::NotFound(format!("folder {}", folder)))?;

        Ok(messages
            .iter()
            .filter(|mail| filter.matches(mail))
            .cloned()
            .collect())
    }
}
