//! Local user accounts and the authentication seam.
//!
//! Accounts are stored one per line as `name:password:role`. Accounts with
//! the `ldap` role are verified by a directory service, which this switch
//! does not ship, so they never authenticate locally.

use crate::error::{Result, SwitchError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Role of accounts delegated to a directory service.
pub const ROLE_LDAP: &str = "ldap";

/// Default role of local accounts.
pub const ROLE_GUEST: &str = "guest";

/// One account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub password: String,
    pub role: String,
}

impl User {
    /// Creates a local guest account.
    pub fn new(name: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            password: password.to_string(),
            role: ROLE_GUEST.to_string(),
        }
    }

    /// Parses a `name:password[:role]` line.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim().splitn(3, ':');
        let name = fields.next().filter(|n| !n.is_empty())?;
        let password = fields.next()?;
        let role = fields
            .next()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(ROLE_GUEST);
        Some(Self {
            name: name.to_string(),
            password: password.to_string(),
            role: role.to_string(),
        })
    }

    /// Stored line form.
    pub fn to_line(&self) -> String {
        format!("{}:{}:{}", self.name, self.password, self.role)
    }
}

/// Credential check used by the tunnel listener.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the account name if the credential is valid.
    async fn check(&self, name: &str, password: &str) -> Option<String>;
}

/// In-memory account table backed by a text file.
#[derive(Default)]
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account or updates password and role of an existing one.
    pub fn add(&self, user: User) {
        debug!(name = %user.name, role = %user.role, "user added");
        self.users.write().insert(user.name.clone(), user);
    }

    /// Removes an account.
    pub fn remove(&self, name: &str) -> Option<User> {
        self.users.write().remove(name)
    }

    /// Account called `name`.
    pub fn get(&self, name: &str) -> Option<User> {
        self.users.read().get(name).cloned()
    }

    /// Accounts sorted by name.
    pub fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// Returns true if there are no accounts.
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Loads accounts from `path`. Blank lines and `#` comments are skipped;
    /// a malformed line fails the whole load.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let mut loaded = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let user = User::parse_line(line).ok_or_else(|| {
                SwitchError::invalid_record(path, format!("line {}: expected name:password:role", number + 1))
            })?;
            loaded.push(user);
        }

        let count = loaded.len();
        for user in loaded {
            self.add(user);
        }
        info!(path = %path.display(), count, "users loaded");
        Ok(count)
    }

    /// Writes local accounts to `path`; directory accounts are not saved.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut content = String::new();
        for user in self.list() {
            if user.role == ROLE_LDAP {
                continue;
            }
            content.push_str(&user.to_line());
            content.push('\n');
        }
        fs::write(path, content)?;
        Ok(())
    }
}

#[async_trait]
impl Authenticator for UserStore {
    async fn check(&self, name: &str, password: &str) -> Option<String> {
        let user = self.get(name)?;
        if user.role == ROLE_LDAP {
            warn!(name, "directory authentication is not available");
            return None;
        }
        (user.password == password).then_some(user.name)
    }
}
