//! Per-socket connection state machine.
//!
//! One `Connection` owns one accepted socket, its read/write buffers,
//! a parser and a response. Workers drive it through
//! `read → process → write`; the reactor decides what happens next from
//! the returned outcome. All socket operations are non-blocking, so a
//! "would block" is a scheduling event, never an error.
//!
//! ```text
//! Idle ──read──► Reading ──process──► Writing ──write──┐
//!   ▲                │ (incomplete: re-arm read)        │
//!   └── keep-alive ──┴──────────────────────────────────┤
//!                                            close ─────┘
//! ```

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use skiff_core::Buffer;

use crate::auth::CredentialStore;
use crate::request::{HttpRequest, ParseStatus};
use crate::response::HttpResponse;

/// Keep draining the socket in one task while this much remains
/// (edge-triggered batching threshold).
const WRITE_CONTINUE_THRESHOLD: usize = 10240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Reading,
    Processing,
    Writing,
    Closed,
}

/// Fatal read conditions. "Would block" is not one of them.
#[derive(Debug, PartialEq, Eq)]
pub enum SocketError {
    PeerClosed,
    Io(Errno),
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// Both segments exhausted.
    Complete,
    /// Kernel buffer full mid-transfer; re-arm for write-readiness and
    /// resume with the preserved offsets.
    Blocked,
    Error(Errno),
}

pub struct Connection {
    fd: RawFd,
    id: u64,
    peer: SocketAddr,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    /// Offset into the mapped body segment already transmitted.
    body_off: usize,
    keep_alive: bool,
    edge_triggered: bool,
    state: ConnState,
    closed: bool,
}

impl Connection {
    /// Takes ownership of `fd` (already non-blocking); it is closed
    /// exactly once, on `close` or drop.
    pub fn new(fd: RawFd, id: u64, peer: SocketAddr, edge_triggered: bool) -> Self {
        assert!(fd >= 0);
        log::info!("client[{}] ({}) connected", id, peer);
        Self {
            fd,
            id,
            peer,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            body_off: 0,
            keep_alive: false,
            edge_triggered,
            state: ConnState::Idle,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Unsent bytes across both response segments.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.body_remaining()
    }

    fn body_remaining(&self) -> usize {
        self.response
            .file()
            .map_or(0, |file| file.len() - self.body_off)
    }

    /// Drain the socket into the read buffer. Edge-triggered sockets
    /// are read until the kernel reports empty. Returns the bytes
    /// appended; zero means nothing was ready.
    pub fn read(&mut self) -> Result<usize, SocketError> {
        self.state = ConnState::Reading;
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => return Err(SocketError::PeerClosed),
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered {
                        break;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(SocketError::Io(errno)),
            }
        }
        Ok(total)
    }

    /// Run the parser and, on a full (or malformed) request, build the
    /// response into the write segments. Returns true when there is a
    /// response to transmit, false when more data is needed.
    pub fn process(&mut self, src_dir: &str, store: &dyn CredentialStore) -> bool {
        self.state = ConnState::Processing;
        if self.read_buf.readable_bytes() == 0 {
            self.state = ConnState::Reading;
            return false;
        }
        match self.request.parse(&mut self.read_buf, store) {
            ParseStatus::Incomplete => {
                self.state = ConnState::Reading;
                return false;
            }
            ParseStatus::Complete => {
                self.keep_alive = self.request.is_keep_alive();
                self.response
                    .init(src_dir, self.request.path(), self.keep_alive, None);
            }
            ParseStatus::BadRequest => {
                self.keep_alive = false;
                self.response
                    .init(src_dir, self.request.path(), false, Some(400));
            }
        }
        self.request.reset();
        self.body_off = 0;
        self.response.make(&mut self.write_buf);
        log::debug!(
            "client[{}] response {} ({} bytes)",
            self.id,
            self.response.status_code(),
            self.to_write_bytes()
        );
        self.state = ConnState::Writing;
        true
    }

    /// Gather-write both segments, preserving offsets across calls.
    /// `Complete` only when header and body are both exhausted.
    pub fn write(&mut self) -> WriteStatus {
        loop {
            if self.to_write_bytes() == 0 {
                return WriteStatus::Complete;
            }
            let header_len = self.write_buf.readable_bytes();
            let header_ptr = self.write_buf.peek().as_ptr();
            let (body_ptr, body_len) = match self.response.file() {
                Some(file) if self.body_off < file.len() => (
                    unsafe { file.as_slice().as_ptr().add(self.body_off) },
                    file.len() - self.body_off,
                ),
                _ => (std::ptr::null(), 0),
            };
            let iov = [
                libc::iovec {
                    iov_base: header_ptr as *mut libc::c_void,
                    iov_len: header_len,
                },
                libc::iovec {
                    iov_base: body_ptr as *mut libc::c_void,
                    iov_len: body_len,
                },
            ];
            let iovcnt = if body_len > 0 { 2 } else { 1 };
            let n = unsafe { libc::writev(self.fd, iov.as_ptr(), iovcnt) };
            if n < 0 {
                return match Errno::last() {
                    Errno::EAGAIN => WriteStatus::Blocked,
                    Errno::EINTR => continue,
                    errno => WriteStatus::Error(errno),
                };
            }
            let n = n as usize;
            if n > header_len {
                // Header done, part of the body went out with it.
                self.body_off += n - header_len;
                if header_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(n);
            }
            if self.to_write_bytes() == 0 {
                return WriteStatus::Complete;
            }
            if !self.edge_triggered && self.to_write_bytes() <= WRITE_CONTINUE_THRESHOLD {
                return WriteStatus::Blocked;
            }
        }
    }

    /// After a fully-sent response on a keep-alive socket: release the
    /// mapping and return to `Idle`, ready to parse the next request.
    pub fn finish_response(&mut self) {
        self.response.unmap();
        self.write_buf.retrieve_all();
        self.body_off = 0;
        self.state = ConnState::Idle;
    }

    /// Release the mapping and close the socket. Idempotent.
    pub fn close(&mut self) {
        self.response.unmap();
        if !self.closed {
            self.closed = true;
            self.state = ConnState::Closed;
            unsafe {
                libc::close(self.fd);
            }
            log::info!("client[{}] ({}) disconnected", self.id, self.peer);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
