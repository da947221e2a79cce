//! Server configuration.
//!
//! Compile-time defaults with runtime environment overrides, builder
//! methods for programmatic use.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Command-line flags (applied by the binary)
//! 2. `SKIFF_*` environment variables
//! 3. Library defaults

use std::str::FromStr;

/// Library defaults.
pub mod defaults {
    pub const PORT: u16 = 8080;
    pub const TRIG_MODE: u8 = 3;
    pub const TIMEOUT_MS: i64 = 60_000;
    pub const LINGER: bool = false;
    pub const WORKERS: usize = 6;
    pub const MAX_CONNECTIONS: usize = 65_536;
    pub const MAX_EVENTS: usize = 1024;
    pub const CREDENTIAL_SLOTS: usize = 12;
    pub const DOC_ROOT: &str = "./resources";
    pub const LOG_ENABLED: bool = true;
    pub const LOG_LEVEL: u8 = 1;
    pub const LOG_QUEUE_DEPTH: usize = 1024;
}

fn env_get<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_get_bool(name: &str, default: bool) -> bool {
    env_get(name, default as usize) != 0
}

/// All knobs the server recognizes.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port; 0 asks the kernel for an ephemeral port.
    pub port: u16,
    /// Trigger-mode matrix: 0 = both level-triggered, 1 = connections
    /// edge-triggered, 2 = listener edge-triggered, 3 = both.
    pub trig_mode: u8,
    /// Idle-connection timeout; zero or negative disables timers.
    pub timeout_ms: i64,
    /// Graceful linger on the listening socket (`SO_LINGER {1, 1}`).
    pub linger: bool,
    /// Worker pool size.
    pub workers: usize,
    /// Connection-table capacity; accepts beyond it are rejected.
    pub max_connections: usize,
    /// Epoll event batch size per wait.
    pub max_events: usize,
    /// Pool-size hint handed to the credential store.
    pub credential_slots: usize,
    /// Static document root.
    pub doc_root: String,
    pub log_enabled: bool,
    /// 0 = debug, 1 = info, 2 = warn, 3+ = error.
    pub log_level: u8,
    /// Bounded depth of the async log queue.
    pub log_queue_depth: usize,
}

impl ServerConfig {
    /// Pure defaults, no environment consulted. Useful for tests.
    pub fn new() -> Self {
        Self {
            port: defaults::PORT,
            trig_mode: defaults::TRIG_MODE,
            timeout_ms: defaults::TIMEOUT_MS,
            linger: defaults::LINGER,
            workers: defaults::WORKERS,
            max_connections: defaults::MAX_CONNECTIONS,
            max_events: defaults::MAX_EVENTS,
            credential_slots: defaults::CREDENTIAL_SLOTS,
            doc_root: defaults::DOC_ROOT.to_string(),
            log_enabled: defaults::LOG_ENABLED,
            log_level: defaults::LOG_LEVEL,
            log_queue_depth: defaults::LOG_QUEUE_DEPTH,
        }
    }

    /// Defaults with `SKIFF_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            port: env_get("SKIFF_PORT", defaults::PORT),
            trig_mode: env_get("SKIFF_TRIG_MODE", defaults::TRIG_MODE),
            timeout_ms: env_get("SKIFF_TIMEOUT_MS", defaults::TIMEOUT_MS),
            linger: env_get_bool("SKIFF_LINGER", defaults::LINGER),
            workers: env_get("SKIFF_WORKERS", defaults::WORKERS),
            max_connections: env_get("SKIFF_MAX_CONNECTIONS", defaults::MAX_CONNECTIONS),
            max_events: env_get("SKIFF_MAX_EVENTS", defaults::MAX_EVENTS),
            credential_slots: env_get("SKIFF_CREDENTIAL_SLOTS", defaults::CREDENTIAL_SLOTS),
            doc_root: env_get("SKIFF_DOC_ROOT", defaults::DOC_ROOT.to_string()),
            log_enabled: env_get_bool("SKIFF_LOG", defaults::LOG_ENABLED),
            log_level: env_get("SKIFF_LOG_LEVEL", defaults::LOG_LEVEL),
            log_queue_depth: env_get("SKIFF_LOG_QUEUE", defaults::LOG_QUEUE_DEPTH),
        }
    }

    // Builder methods

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn trig_mode(mut self, mode: u8) -> Self {
        self.trig_mode = mode;
        self
    }

    pub fn timeout_ms(mut self, ms: i64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn linger(mut self, linger: bool) -> Self {
        self.linger = linger;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn credential_slots(mut self, n: usize) -> Self {
        self.credential_slots = n;
        self
    }

    pub fn doc_root<S: Into<String>>(mut self, root: S) -> Self {
        self.doc_root = root.into();
        self
    }

    pub fn log_enabled(mut self, enabled: bool) -> Self {
        self.log_enabled = enabled;
        self
    }

    pub fn log_level(mut self, level: u8) -> Self {
        self.log_level = level;
        self
    }

    pub fn log_queue_depth(mut self, depth: usize) -> Self {
        self.log_queue_depth = depth;
        self
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port != 0 && self.port < 1024 {
            return Err(ConfigError::InvalidValue(
                "port must be 0 (ephemeral) or >= 1024",
            ));
        }
        if self.trig_mode > 3 {
            return Err(ConfigError::InvalidValue("trig_mode must be 0..=3"));
        }
        if self.workers == 0 || self.workers > 256 {
            return Err(ConfigError::InvalidValue("workers must be in 1..=256"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be > 0"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.doc_root.is_empty() {
            return Err(ConfigError::InvalidValue("doc_root must not be empty"));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
