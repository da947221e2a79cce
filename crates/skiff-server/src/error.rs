//! Startup-time error types. Per-connection failures are isolated and
//! handled inline; only construction of shared resources can fail here.

use core::fmt;

use nix::errno::Errno;

use crate::config::ConfigError;

#[derive(Debug)]
pub enum ServerError {
    /// Rejected configuration value.
    Config(ConfigError),

    /// A socket/epoll/eventfd setup call failed.
    Setup { op: &'static str, errno: Errno },
}

impl ServerError {
    pub(crate) fn setup(op: &'static str, errno: Errno) -> Self {
        Self::Setup { op, errno }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{}", e),
            ServerError::Setup { op, errno } => write!(f, "{} failed: {}", op, errno),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}
