//! # skiff-core
//!
//! Leaf building blocks for the skiff HTTP server: the growable I/O
//! buffer, the idle-connection timer heap, and the fixed worker pool.
//! Nothing in this crate knows about HTTP or epoll.

pub mod buffer;
pub mod pool;
pub mod timer;

pub use buffer::Buffer;
pub use pool::WorkerPool;
pub use timer::TimerHeap;
