//! OS stream listeners: fresh binding and adoption of inherited fds.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info};

use crate::address::{Address, Network};
use crate::error::{GraceError, Result};

/// A bound, listening stream socket.
///
/// Only stream listeners can be handed across a re-exec, so these are the
/// only kinds the registry accepts.
#[derive(Debug)]
pub enum Listener {
    Tcp(std::net::TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind and listen on `address`.
    ///
    /// TCP sockets are created with `SO_REUSEADDR`; `tcp6` sockets are
    /// IPv6-only. Every socket is close-on-exec until exported for handoff.
    pub fn bind(address: &Address) -> Result<Self> {
        let listener = match address.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => bind_tcp(address).map(Listener::Tcp),
            Network::Unix => bind_unix(address, Type::STREAM).map(Listener::Unix),
            Network::UnixPacket => bind_unix(address, Type::SEQPACKET).map(Listener::Unix),
        }
        .map_err(|source| GraceError::Listen {
            address: address.canonical(),
            source,
        })?;

        info!(
            address = %address,
            local = %listener.describe(),
            "Listener bound"
        );
        Ok(listener)
    }

    /// Adopt a listening socket inherited from the parent process at `fd`.
    ///
    /// No new socket is created: the descriptor is wrapped as-is. It is
    /// marked close-on-exec so unrelated children do not inherit it.
    pub(crate) fn adopt(fd: RawFd) -> Result<Self> {
        if !validate_fd(fd) {
            return Err(GraceError::inherited_fd(fd, "not an open socket"));
        }

        // SAFETY: fstat confirmed `fd` is an open socket, and offsets are only
        // exported by the parent for descriptors it placed in this process.
        // Each offset is taken from the inherited table at most once.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        socket
            .set_cloexec(true)
            .map_err(|e| GraceError::inherited_fd(fd, e.to_string()))?;

        let local = socket
            .local_addr()
            .map_err(|e| GraceError::inherited_fd(fd, e.to_string()))?;

        let listener = if local.as_socket().is_some() {
            Listener::Tcp(socket.into())
        } else if local.domain() == Domain::UNIX {
            Listener::Unix(socket.into())
        } else {
            return Err(GraceError::inherited_fd(fd, "unsupported socket family"));
        };

        debug!(fd, local = %listener.describe(), "Adopted inherited listener");
        Ok(listener)
    }

    /// Duplicate the underlying socket. Both handles refer to the same
    /// listening socket.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Listener::Tcp(l) => l.try_clone().map(Listener::Tcp),
            Listener::Unix(l) => l.try_clone().map(Listener::Unix),
        }
    }

    /// Duplicate the descriptor to the lowest free fd `>= min`, close-on-exec.
    pub(crate) fn dup_above(&self, min: RawFd) -> io::Result<OwnedFd> {
        let fd = unsafe { libc::fcntl(self.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    /// Local TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Human-readable local endpoint, for logs.
    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Listener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix:?".to_string()),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
        }
    }
}

impl From<std::net::TcpListener> for Listener {
    fn from(listener: std::net::TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

impl From<UnixListener> for Listener {
    fn from(listener: UnixListener) -> Self {
        Listener::Unix(listener)
    }
}

fn bind_tcp(address: &Address) -> io::Result<std::net::TcpListener> {
    let target = address
        .addr()
        .to_socket_addrs()?
        .find(|candidate| match address.network {
            Network::Tcp4 => candidate.is_ipv4(),
            Network::Tcp6 => candidate.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", address.network, address.addr()),
            )
        })?;

    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if address.network == Network::Tcp6 {
        socket.set_only_v6(true)?;
    }
    socket.bind(&target.into())?;
    socket.listen(libc::SOMAXCONN)?;
    Ok(socket.into())
}

fn bind_unix(address: &Address, ty: Type) -> io::Result<UnixListener> {
    let path = address.sock_path().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "missing unix socket path")
    })?;

    let socket = Socket::new(Domain::UNIX, ty, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(libc::SOMAXCONN)?;
    Ok(socket.into())
}

/// Validate that a file descriptor is an open socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
