//! Thin wrapper around the epoll readiness facility.
//!
//! Registrations carry a caller-chosen `u64` token (a connection id,
//! never a raw fd) in the event payload. Only the reactor thread holds
//! an `Epoller`.

use std::os::unix::io::RawFd;

use nix::errno::Errno;

/// Event masks, re-exported as `u32` to match `epoll_event.events`.
pub mod ev {
    pub const IN: u32 = libc::EPOLLIN as u32;
    pub const OUT: u32 = libc::EPOLLOUT as u32;
    pub const ET: u32 = libc::EPOLLET as u32;
    pub const ONESHOT: u32 = libc::EPOLLONESHOT as u32;
    pub const RDHUP: u32 = libc::EPOLLRDHUP as u32;
    pub const HUP: u32 = libc::EPOLLHUP as u32;
    pub const ERR: u32 = libc::EPOLLERR as u32;
}

pub struct Epoller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Epoller {
    pub fn new(max_events: usize) -> Result<Self, Errno> {
        assert!(max_events > 0);
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Errno::last());
        }
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, events: u32) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    /// Re-arm a registration with a fresh interest set (the single-shot
    /// discipline: every completed cycle ends here).
    pub fn modify(&self, fd: RawFd, token: u64, events: u32) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    pub fn delete(&self, fd: RawFd) -> Result<(), Errno> {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, events: u32) -> Result<(), Errno> {
        let mut event = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if ret < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    /// Block up to `timeout_ms` (-1 = no deadline) and return how many
    /// events are ready in the batch.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<usize, Errno> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(Errno::last());
        }
        Ok(n as usize)
    }

    /// `(token, readiness)` of the i-th event from the last `wait`.
    pub fn event(&self, i: usize) -> (u64, u32) {
        assert!(i < self.events.len());
        let event = self.events[i];
        (event.u64, event.events)
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
