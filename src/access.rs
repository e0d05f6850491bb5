//! Who may push.
//!
//! The gateway asks a single question of the host: does this identity hold
//! administrative capability? Authentication happens before that, in the
//! HTTP layer, and produces an [`Identity`].

use std::collections::HashMap;
use std::fmt;

use crate::config::AuthConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    pub fn user(name: impl Into<String>) -> Self {
        Identity::User(name.into())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => f.write_str("anonymous"),
            Identity::User(name) => f.write_str(name),
        }
    }
}

pub trait AccessControl: Send + Sync {
    fn is_administrator(&self, identity: &Identity) -> bool;
}

impl<F> AccessControl for F
where
    F: Fn(&Identity) -> bool + Send + Sync,
{
    fn is_administrator(&self, identity: &Identity) -> bool {
        self(identity)
    }
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    admin: bool,
}

/// Accounts from the `[auth]` config section. Checks Basic credentials and
/// answers the administrator question.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessControl {
    accounts: HashMap<String, Account>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        let mut access = Self::new();
        for user in &auth.users {
            access = access.with_user(&user.username, &user.password, user.admin);
        }
        access
    }

    pub fn with_user(mut self, username: &str, password: &str, admin: bool) -> Self {
        self.accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                admin,
            },
        );
        self
    }

    /// The identity for a username/password pair, or `None` if they don't match
    pub fn authenticate(&self, username: &str, password: &str) -> Option<Identity> {
        self.accounts
            .get(username)
            .filter(|account| account.password == password)
            .map(|_| Identity::user(username))
    }
}

impl AccessControl for StaticAccessControl {
    fn is_administrator(&self, identity: &Identity) -> bool {
        match identity {
            Identity::Anonymous => false,
            Identity::User(name) => self.accounts.get(name).is_some_and(|a| a.admin),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_access() {
        let access = StaticAccessControl::new()
            .with_user("admin", "secret", true)
            .with_user("dev", "pw", false);

        assert_eq!(access.authenticate("admin", "secret"), Some(Identity::user("admin")));
        assert_eq!(access.authenticate("admin", "wrong"), None);
        assert_eq!(access.authenticate("nobody", "secret"), None);

        assert!(access.is_administrator(&Identity::user("admin")));
        assert!(!access.is_administrator(&Identity::user("dev")));
        assert!(!access.is_administrator(&Identity::user("nobody")));
        assert!(!access.is_administrator(&Identity::Anonymous));
    }

    #[test]
    fn test_closure_predicate() {
        let only_root = |identity: &Identity| identity == &Identity::user("root");
        assert!(only_root.is_administrator(&Identity::user("root")));
        assert!(!AccessControl::is_administrator(&only_root, &Identity::Anonymous));
    }
}
