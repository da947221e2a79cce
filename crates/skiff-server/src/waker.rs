//! Eventfd wakeup for the reactor.
//!
//! Workers ring it after queueing an outcome so the reactor leaves
//! `epoll_wait` before its timer deadline. Contract: `ring` never
//! blocks, and rings coalesce (the eventfd counter accumulates until
//! one `drain` resets it).

use std::os::unix::io::RawFd;

use nix::errno::Errno;

pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Errno::last());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake the reactor. Failure only means the counter is already at
    /// its maximum, i.e. a wakeup is pending anyway.
    pub fn ring(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Reset the counter after waking.
    pub fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(self.fd, &mut value as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoll::{ev, Epoller};

    #[test]
    fn test_ring_wakes_epoll() {
        let mut ep = Epoller::new(4).unwrap();
        let waker = Waker::new().unwrap();
        ep.add(waker.fd(), 99, ev::IN).unwrap();

        assert_eq!(ep.wait(0).unwrap(), 0);
        waker.ring();
        waker.ring();
        let n = ep.wait(1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(ep.event(0).0, 99);

        // Rings coalesce; one drain clears them all.
        waker.drain();
        assert_eq!(ep.wait(0).unwrap(), 0);
    }
}
