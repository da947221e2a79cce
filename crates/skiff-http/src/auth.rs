//! Credential verification behind the login/register form targets.
//!
//! The store is injected at startup and threaded through the parser's
//! POST handling; nothing in the serving path knows what backs it.

use std::collections::HashMap;
use std::sync::Mutex;

/// Verification seam consumed by the request parser.
pub trait CredentialStore: Send + Sync {
    /// `is_login` distinguishes a login attempt from a registration.
    /// Returns whether the request may proceed to the welcome page.
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool;
}

/// In-memory user table. Registration inserts, login compares; a taken
/// username rejects a second registration.
pub struct MemoryCredentials {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// `capacity` mirrors the backing store's configured pool size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            users: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Seed the table, mainly for tests and demos.
    pub fn with_users<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let users = entries
            .into_iter()
            .map(|(u, p)| (u.into(), p.into()))
            .collect();
        Self {
            users: Mutex::new(users),
        }
    }
}

impl Default for MemoryCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentials {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        let mut users = self.users.lock().unwrap();
        let ok = if is_login {
            users.get(username).is_some_and(|stored| stored == password)
        } else if users.contains_key(username) {
            false
        } else {
            users.insert(username.to_string(), password.to_string());
            true
        };
        log::debug!(
            "verify user={} login={} -> {}",
            username,
            is_login,
            ok
        );
        ok
    }
}
