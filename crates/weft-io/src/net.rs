//! TCP listener and stream over the hooked syscalls.
//!
//! Inside a fiber these behave like blocking `std::net` sockets while only
//! the fiber waits. Off a fiber (or with hooking disabled) the calls fall
//! through to the real nonblocking syscalls, so these types are mainly
//! useful on an `IoManager` worker.

use crate::fd_table::fd_table;
use crate::hook;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::time::Duration;
use weft_runtime::IoEvent;

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {other}"),
        )),
    }
}

fn check(ret: i32) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn domain_of(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

pub struct FiberListener {
    fd: RawFd,
}

impl FiberListener {
    pub fn bind(addr: SocketAddr) -> io::Result<FiberListener> {
        let fd = hook::socket(
            domain_of(&addr),
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        );
        check(fd)?;
        let listener = FiberListener { fd };
        unsafe {
            let opt: i32 = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            );
        }
        let (storage, len) = sockaddr_from(&addr);
        check(unsafe {
            libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len)
        })?;
        check(unsafe { libc::listen(fd, 1024) })?;
        Ok(listener)
    }

    /// Block the fiber until a client connects.
    pub fn accept(&self) -> io::Result<(FiberStream, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client = hook::accept(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        check(client)?;
        let peer = sockaddr_to(&storage)?;
        Ok((FiberStream { fd: client }, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.fd)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for FiberListener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

pub struct FiberStream {
    fd: RawFd,
}

impl FiberStream {
    /// Connect with the configured default timeout.
    pub fn connect(addr: SocketAddr) -> io::Result<FiberStream> {
        Self::connect_inner(addr, None)
    }

    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<FiberStream> {
        Self::connect_inner(addr, Some(timeout.as_millis() as u64))
    }

    fn connect_inner(addr: SocketAddr, timeout_ms: Option<u64>) -> io::Result<FiberStream> {
        let fd = hook::socket(
            domain_of(&addr),
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        );
        check(fd)?;
        let stream = FiberStream { fd };
        let (storage, len) = sockaddr_from(&addr);
        let ret = match timeout_ms {
            Some(ms) => hook::connect_with_timeout(
                fd,
                &storage as *const _ as *const libc::sockaddr,
                len,
                Some(ms),
            ),
            None => hook::connect(fd, &storage as *const _ as *const libc::sockaddr, len),
        };
        check(ret)?;
        Ok(stream)
    }

    pub fn from_raw(fd: RawFd) -> FiberStream {
        fd_table().get(fd, true);
        FiberStream { fd }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        check(unsafe {
            libc::getpeername(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        sockaddr_to(&storage)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.fd)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        hook::set_timeout(self.fd, IoEvent::Read, timeout.map(|d| d.as_millis() as u64));
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        hook::set_timeout(self.fd, IoEvent::Write, timeout.map(|d| d.as_millis() as u64));
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        let opt: i32 = on as i32;
        check(unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &opt as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    check(unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    sockaddr_to(&storage)
}

impl Read for FiberStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }
}

impl Read for &FiberStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = hook::recv(self.fd, buf, 0);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for FiberStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FiberStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = hook::send(self.fd, buf, 0);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FiberStream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8042".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage).unwrap(), addr);
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9100".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage).unwrap(), addr);
    }

    #[test]
    fn bind_reports_local_addr() {
        let listener = FiberListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }
}
