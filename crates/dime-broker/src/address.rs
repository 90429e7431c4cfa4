use std::io;
use std::net::{SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::os::fd::FromRawFd;
use std::path::PathBuf;

use crate::error::BrokerError;

/// Default TCP port when a `tcp://` URI omits one, matching the reference
/// server.
pub const DEFAULT_TCP_PORT: u16 = 5000;

/// Default local-domain socket path on POSIX when no address is given.
pub const DEFAULT_UNIX_PATH: &str = "/tmp/dime.sock";

/// A bindable address, parsed from the `<proto>://<hostname>[:<port>]`
/// grammar. `ipc` and `unix` are the same transport (a local-domain stream
/// socket); the name is only kept apart for display.
#[derive(Debug, Clone)]
pub enum Address {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Address {
    /// Parses a URI of the form `ipc://`, `unix://`, `tcp://` or `sctp://`.
    /// `sctp` parses successfully but is rejected by the caller at bind time
    /// since there's no portable SCTP support in the standard library.
    pub fn parse(uri: &str) -> Result<Self, BrokerError> {
        let (proto, rest) = uri.split_once("://").ok_or_else(|| {
            BrokerError::UnsupportedAddress(uri.to_owned(), "missing <proto>:// prefix")
        })?;

        match proto {
            "ipc" | "unix" => Ok(Self::Unix(PathBuf::from(rest))),
            "tcp" => {
                let (host, port) = match rest.rsplit_once(':') {
                    Some((host, port)) => {
                        let port: u16 = port.parse().map_err(|_| {
                            BrokerError::UnsupportedAddress(uri.to_owned(), "invalid port")
                        })?;
                        (host, port)
                    }
                    None => (rest, DEFAULT_TCP_PORT),
                };
                let addr = (host, port)
                    .to_socket_addrs()
                    .map_err(|_| BrokerError::UnsupportedAddress(uri.to_owned(), "unresolvable host"))?
                    .next()
                    .ok_or_else(|| BrokerError::UnsupportedAddress(uri.to_owned(), "host resolved to nothing"))?;
                Ok(Self::Tcp(addr))
            }
            "sctp" => Err(BrokerError::UnsupportedAddress(uri.to_owned(), "sctp is not supported")),
            _ => Err(BrokerError::UnsupportedAddress(uri.to_owned(), "unknown protocol")),
        }
    }

    /// The default address for this platform: a local-domain socket at
    /// [`DEFAULT_UNIX_PATH`] on POSIX.
    pub fn default_for_platform() -> Self {
        Self::Unix(PathBuf::from(DEFAULT_UNIX_PATH))
    }
}

/// Binds a TCP listener. For an IPv6 address, clears `IPV6_V6ONLY` before
/// binding so IPv4-mapped peers can connect too ("dual-stack"); for IPv4 this
/// is just a plain bind. Built on raw `libc` calls since `std` offers no way
/// to set socket options before `bind`.
pub(crate) fn bind_tcp_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    match addr {
        SocketAddr::V4(_) => std::net::TcpListener::bind(addr),
        SocketAddr::V6(addr) => bind_dualstack_v6(addr),
    }
}

fn bind_dualstack_v6(addr: SocketAddrV6) -> io::Result<std::net::TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let setsockopt_flag = |opt: libc::c_int, name: libc::c_int, value: libc::c_int| {
            libc::setsockopt(
                fd,
                opt,
                name,
                std::ptr::from_ref(&value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        setsockopt_flag(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0);
        setsockopt_flag(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);

        let mut sin6: libc::sockaddr_in6 = std::mem::zeroed();
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_port = addr.port().to_be();
        sin6.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
        sin6.sin6_scope_id = addr.scope_id();

        let bind_ret = libc::bind(
            fd,
            std::ptr::from_ref(&sin6).cast(),
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        );
        if bind_ret != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, 1024) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(std::net::TcpListener::from_raw_fd(fd))
    }
}
