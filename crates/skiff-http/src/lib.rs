//! # skiff-http
//!
//! The HTTP/1.1 side of skiff: the incremental request parser, the
//! response builder with memory-mapped file bodies, the per-socket
//! connection state machine, and the credential-store seam used by the
//! login/register form flow.
//!
//! Everything here runs inside worker tasks. The reactor in
//! `skiff-server` owns registration, timers, and the connection table;
//! this crate only ever touches one connection's own state.

pub mod auth;
pub mod conn;
pub mod request;
pub mod response;

pub use auth::{CredentialStore, MemoryCredentials};
pub use conn::{ConnState, Connection, SocketError, WriteStatus};
pub use request::{HttpRequest, ParseState, ParseStatus};
pub use response::{HttpResponse, MappedFile};
