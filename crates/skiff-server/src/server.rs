//! The reactor event loop.
//!
//! One thread owns everything shared: the epoll instance, the
//! connection table, and the timer heap. Readiness on a connection
//! dispatches a read or write cycle onto the worker pool; the worker
//! finishes by pushing an [`Outcome`] onto the reactor's queue and
//! ringing its eventfd. The reactor alone re-arms interest sets,
//! refreshes timers, and evicts; workers never touch any of it.
//!
//! Connections are registered single-shot (`EPOLLONESHOT`), so a
//! connection produces no further readiness until its outcome has been
//! processed and the interest set explicitly reset. Together with the
//! per-connection mutex this guarantees at most one worker drives a
//! given connection at any instant.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use nix::errno::Errno;

use skiff_core::{TimerHeap, WorkerPool};
use skiff_http::auth::CredentialStore;
use skiff_http::conn::{Connection, SocketError, WriteStatus};

use crate::config::ServerConfig;
use crate::epoll::{ev, Epoller};
use crate::error::ServerError;
use crate::listener::Listener;
use crate::waker::Waker;

/// Reserved epoll tokens; connection ids start above them.
const LISTENER_TOKEN: u64 = 0;
const WAKER_TOKEN: u64 = 1;
const FIRST_CONN_ID: u64 = 2;

/// Fixed response for accepts beyond the connection-table capacity.
const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 12\r\n\r\nServer busy!";

/// What a worker reports after driving one connection cycle. Only the
/// reactor acts on these.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    RearmRead(u64),
    RearmWrite(u64),
    Close(u64),
}

/// State shared between the reactor and its workers.
struct Shared {
    outcomes: ArrayQueue<Outcome>,
    waker: Waker,
    running: AtomicBool,
    document_root: String,
    credentials: Arc<dyn CredentialStore>,
}

impl Shared {
    /// Queue an outcome and wake the reactor. The queue is sized to the
    /// connection table, and single-shot dispatch admits at most one
    /// in-flight outcome per connection, so pushes only fail while the
    /// reactor is already draining; spin until it frees a slot.
    fn report(&self, outcome: Outcome) {
        let mut pending = outcome;
        while let Err(back) = self.outcomes.push(pending) {
            pending = back;
            self.waker.ring();
            std::thread::yield_now();
        }
        self.waker.ring();
    }
}

/// Cloneable handle for stopping the reactor from another thread (or a
/// signal handler: `stop` only touches an atomic and an eventfd).
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.waker.ring();
    }
}

pub struct Server {
    timeout: Option<Duration>,
    max_connections: usize,
    listen_events: u32,
    conn_events: u32,
    listener: Listener,
    epoller: Epoller,
    timers: TimerHeap,
    pool: WorkerPool,
    users: HashMap<u64, Arc<Mutex<Connection>>>,
    next_id: u64,
    shared: Arc<Shared>,
}

impl Server {
    /// Validate the configuration and build every shared resource.
    /// Failure here is fatal; nothing after `run` is.
    pub fn new(
        config: ServerConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let (listen_events, conn_events) = trigger_events(config.trig_mode);

        let listener = Listener::bind(config.port, config.linger)?;
        let epoller =
            Epoller::new(config.max_events).map_err(|e| ServerError::setup("epoll_create", e))?;
        let waker = Waker::new().map_err(|e| ServerError::setup("eventfd", e))?;

        epoller
            .add(listener.fd(), LISTENER_TOKEN, ev::IN | listen_events)
            .map_err(|e| ServerError::setup("epoll_ctl(listener)", e))?;
        epoller
            .add(waker.fd(), WAKER_TOKEN, ev::IN)
            .map_err(|e| ServerError::setup("epoll_ctl(waker)", e))?;

        let shared = Arc::new(Shared {
            outcomes: ArrayQueue::new(config.max_connections),
            waker,
            running: AtomicBool::new(true),
            document_root: config.doc_root.trim_end_matches('/').to_string(),
            credentials,
        });

        log::info!("========== server init ==========");
        log::info!("port: {}, linger: {}", listener.port(), config.linger);
        log::info!(
            "listen mode: {}, conn mode: {}",
            if listen_events & ev::ET != 0 { "ET" } else { "LT" },
            if conn_events & ev::ET != 0 { "ET" } else { "LT" },
        );
        log::info!("document root: {}", shared.document_root);
        log::info!(
            "workers: {}, credential slots: {}, max connections: {}",
            config.workers,
            config.credential_slots,
            config.max_connections,
        );

        Ok(Self {
            timeout: if config.timeout_ms > 0 {
                Some(Duration::from_millis(config.timeout_ms as u64))
            } else {
                None
            },
            max_connections: config.max_connections,
            listen_events,
            conn_events,
            listener,
            epoller,
            timers: TimerHeap::new(),
            pool: WorkerPool::new(config.workers),
            users: HashMap::new(),
            next_id: FIRST_CONN_ID,
            shared,
        })
    }

    /// The actually-bound listen port.
    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run until stopped. The reactor blocks only in `epoll_wait`, up
    /// to the next timer deadline.
    pub fn run(&mut self) {
        log::info!("========== server start ==========");
        while self.shared.running.load(Ordering::Acquire) {
            let timeout_ms = self.drive_timers();
            match self.epoller.wait(timeout_ms) {
                Ok(n) => {
                    for i in 0..n {
                        let (token, events) = self.epoller.event(i);
                        self.dispatch(token, events);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    log::error!("epoll_wait failed: {}", errno);
                    break;
                }
            }
            self.drain_outcomes();
        }
        self.shutdown();
    }

    /// Evict every connection idle past its deadline, then return the
    /// epoll timeout until the next deadline (-1 = none).
    fn drive_timers(&mut self) -> i32 {
        if self.timeout.is_none() {
            return -1;
        }
        let now = Instant::now();
        let mut expired = Vec::new();
        self.timers.pop_expired(now, |id| expired.push(id));
        for id in expired {
            log::debug!("client[{}] idle timeout", id);
            self.evict(id);
        }
        match self.timers.next_deadline(Instant::now()) {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        }
    }

    fn dispatch(&mut self, token: u64, events: u32) {
        match token {
            LISTENER_TOKEN => self.accept_clients(),
            WAKER_TOKEN => self.shared.waker.drain(),
            id => {
                if !self.users.contains_key(&id) {
                    // Stale event for an evicted connection.
                    return;
                }
                if events & (ev::RDHUP | ev::HUP | ev::ERR) != 0 {
                    self.evict(id);
                } else if events & ev::IN != 0 {
                    self.extend_time(id);
                    self.submit_read(id);
                } else if events & ev::OUT != 0 {
                    self.extend_time(id);
                    self.submit_write(id);
                } else {
                    log::warn!("client[{}] unexpected readiness 0x{:x}", id, events);
                }
            }
        }
    }

    /// Accept until the backlog is drained (edge-triggered listener) or
    /// once (level-triggered; the next wait redelivers).
    fn accept_clients(&mut self) {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.listener.fd(),
                    &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                return;
            }
            if self.users.len() >= self.max_connections {
                log::warn!("connection table full ({}), rejecting", self.users.len());
                reject_busy(fd);
                return;
            }
            self.add_client(fd, addr);
            if self.listen_events & ev::ET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: libc::sockaddr_in) {
        let id = self.next_id;
        self.next_id += 1;
        let peer = SocketAddr::from((
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        ));
        let conn = Connection::new(fd, id, peer, self.conn_events & ev::ET != 0);
        self.users.insert(id, Arc::new(Mutex::new(conn)));
        if let Some(timeout) = self.timeout {
            self.timers.add(id, timeout);
        }
        if let Err(errno) = self.epoller.add(fd, id, ev::IN | self.conn_events) {
            log::error!("client[{}] epoll add failed: {}", id, errno);
            self.evict(id);
            return;
        }
        log::debug!("{} connections active", self.users.len());
    }

    /// Refresh the idle deadline on any dispatch for the connection.
    fn extend_time(&mut self, id: u64) {
        if let Some(timeout) = self.timeout {
            if self.timers.contains(id) {
                self.timers.adjust(id, timeout);
            }
        }
    }

    fn submit_read(&self, id: u64) {
        let Some(conn) = self.users.get(&id) else {
            return;
        };
        let conn = Arc::clone(conn);
        let shared = Arc::clone(&self.shared);
        self.pool.submit(move || {
            let outcome = {
                let mut c = conn.lock().unwrap();
                if c.is_closed() {
                    return;
                }
                match c.read() {
                    Err(SocketError::PeerClosed) => Outcome::Close(c.id()),
                    Err(SocketError::Io(errno)) => {
                        log::debug!("client[{}] read error: {}", c.id(), errno);
                        Outcome::Close(c.id())
                    }
                    Ok(_) => {
                        if c.process(&shared.document_root, shared.credentials.as_ref()) {
                            Outcome::RearmWrite(c.id())
                        } else {
                            Outcome::RearmRead(c.id())
                        }
                    }
                }
            };
            shared.report(outcome);
        });
    }

    fn submit_write(&self, id: u64) {
        let Some(conn) = self.users.get(&id) else {
            return;
        };
        let conn = Arc::clone(conn);
        let shared = Arc::clone(&self.shared);
        self.pool.submit(move || {
            let outcome = {
                let mut c = conn.lock().unwrap();
                if c.is_closed() {
                    return;
                }
                match c.write() {
                    WriteStatus::Complete => {
                        if c.is_keep_alive() {
                            // Reusable: reset, then try any pipelined
                            // bytes already buffered.
                            c.finish_response();
                            if c.process(&shared.document_root, shared.credentials.as_ref()) {
                                Outcome::RearmWrite(c.id())
                            } else {
                                Outcome::RearmRead(c.id())
                            }
                        } else {
                            Outcome::Close(c.id())
                        }
                    }
                    WriteStatus::Blocked => Outcome::RearmWrite(c.id()),
                    WriteStatus::Error(errno) => {
                        log::debug!("client[{}] write error: {}", c.id(), errno);
                        Outcome::Close(c.id())
                    }
                }
            };
            shared.report(outcome);
        });
    }

    /// Apply worker outcomes on the reactor thread. Ids already evicted
    /// resolve to nothing and are ignored.
    fn drain_outcomes(&mut self) {
        while let Some(outcome) = self.shared.outcomes.pop() {
            match outcome {
                Outcome::RearmRead(id) => self.rearm(id, ev::IN),
                Outcome::RearmWrite(id) => self.rearm(id, ev::OUT),
                Outcome::Close(id) => self.evict(id),
            }
        }
    }

    fn rearm(&mut self, id: u64, interest: u32) {
        let Some(conn) = self.users.get(&id) else {
            return;
        };
        let fd = conn.lock().unwrap().fd();
        if let Err(errno) = self.epoller.modify(fd, id, interest | self.conn_events) {
            log::error!("client[{}] re-arm failed: {}", id, errno);
            self.evict(id);
        }
    }

    /// Remove from the table, drop the timer, deregister, close. Safe
    /// against double eviction and against an in-flight worker: taking
    /// the connection mutex waits the worker out, and the fd is closed
    /// only after that.
    fn evict(&mut self, id: u64) {
        let Some(conn) = self.users.remove(&id) else {
            return;
        };
        self.timers.remove(id);
        let mut c = conn.lock().unwrap();
        let _ = self.epoller.delete(c.fd());
        c.close();
    }

    fn shutdown(&mut self) {
        log::info!(
            "server stopping, {} connections open",
            self.users.len()
        );
        let ids: Vec<u64> = self.users.keys().copied().collect();
        for id in ids {
            self.evict(id);
        }
        self.pool.shutdown();
    }
}

/// The trigger-mode matrix. Connections always carry single-shot and
/// peer-close notification; the listener never carries single-shot.
fn trigger_events(mode: u8) -> (u32, u32) {
    let mut listen = ev::RDHUP;
    let mut conn = ev::ONESHOT | ev::RDHUP;
    match mode {
        0 => {}
        1 => conn |= ev::ET,
        2 => listen |= ev::ET,
        _ => {
            listen |= ev::ET;
            conn |= ev::ET;
        }
    }
    (listen, conn)
}

/// Over-capacity accepts get a fixed busy response on the raw socket
/// and are closed without ever becoming a `Connection`.
fn reject_busy(fd: RawFd) {
    let sent = unsafe {
        libc::send(
            fd,
            BUSY_RESPONSE.as_ptr() as *const libc::c_void,
            BUSY_RESPONSE.len(),
            0,
        )
    };
    if sent < 0 {
        log::warn!("busy reject send failed: {}", Errno::last());
    }
    unsafe {
        libc::close(fd);
    }
}
