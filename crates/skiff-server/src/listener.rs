//! Listening-socket setup.
//!
//! Raw socket calls wrapped once at startup: `SO_REUSEADDR`, optional
//! graceful linger, bind, listen, non-blocking mode. The accepted-socket
//! side lives in the reactor's accept loop.

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::error::ServerError;

const BACKLOG: libc::c_int = 4096;

pub struct Listener {
    fd: RawFd,
    port: u16,
}

impl Listener {
    /// Bind `0.0.0.0:port` and start listening. With `port` 0 the
    /// kernel picks; `port()` reports the actual one.
    pub fn bind(port: u16, linger: bool) -> Result<Self, ServerError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(ServerError::setup("socket", Errno::last()));
        }

        let guard = FdGuard(fd);

        if linger {
            // Graceful close: block up to a second flushing unsent data.
            let opt = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &opt)
                .map_err(|e| ServerError::setup("setsockopt(SO_LINGER)", e))?;
        }

        let reuse: libc::c_int = 1;
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &reuse)
            .map_err(|e| ServerError::setup("setsockopt(SO_REUSEADDR)", e))?;

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        addr.sin_port = port.to_be();

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ServerError::setup("bind", Errno::last()));
        }

        if unsafe { libc::listen(fd, BACKLOG) } < 0 {
            return Err(ServerError::setup("listen", Errno::last()));
        }

        set_nonblocking(fd).map_err(|e| ServerError::setup("fcntl(O_NONBLOCK)", e))?;

        let port = local_port(fd).map_err(|e| ServerError::setup("getsockname", e))?;

        std::mem::forget(guard);
        Ok(Self { fd, port })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Closes the fd on early-return paths during setup.
struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> Result<(), Errno> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Errno::last());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

fn local_port(fd: RawFd) -> Result<u16, Errno> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(u16::from_be(addr.sin_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_bind_reports_port() {
        let listener = Listener::bind(0, false).unwrap();
        assert!(listener.port() >= 1024);
        assert!(listener.fd() >= 0);
    }

    #[test]
    fn test_listener_accepts_tcp_connect() {
        let listener = Listener::bind(0, true).unwrap();
        let stream = std::net::TcpStream::connect(("127.0.0.1", listener.port()));
        assert!(stream.is_ok());
    }
}
