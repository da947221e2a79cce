//! # skiff-server
//!
//! The reactor side of skiff. One thread owns the epoll instance, the
//! connection table, and the timer heap; a fixed worker pool runs the
//! per-connection read/process/write cycles. Workers report outcomes
//! back over a queue; they never mutate shared serving state
//! themselves.

pub mod config;
pub mod epoll;
pub mod error;
pub mod listener;
pub mod server;
pub mod waker;

pub use config::{ConfigError, ServerConfig};
pub use error::ServerError;
pub use server::{Server, ServerHandle};
