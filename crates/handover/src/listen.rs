//! Listening sockets shared by every generation.

use std::fmt;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;

use crate::error::{SupervisorError, SupervisorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

/// Parsed `--listen` value.
///
/// Accepted forms: `tcp://host:port`, `tcp4://…`, `tcp6://…`,
/// `unix:///path`, `fd://N`, and bare `host:port` (tcp).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp { family: Family, host: String, port: u16 },
    Unix(PathBuf),
    Fd(RawFd),
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://").unwrap_or(("tcp", s));
        match scheme {
            "tcp" => parse_host_port(rest, Family::Any),
            "tcp4" => parse_host_port(rest, Family::V4),
            "tcp6" => parse_host_port(rest, Family::V6),
            "unix" if !rest.is_empty() => Ok(ListenAddr::Unix(PathBuf::from(rest))),
            "unix" => Err(format!("missing socket path in '{s}'")),
            "fd" => rest
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .map(ListenAddr::Fd)
                .ok_or_else(|| format!("invalid descriptor number in '{s}'")),
            other => Err(format!("unsupported scheme '{other}'")),
        }
    }
}

fn parse_host_port(s: &str, family: Family) -> Result<ListenAddr, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in '{s}'"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(ListenAddr::Tcp {
        family,
        host: host.to_string(),
        port,
    })
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp { family, host, port } => {
                let scheme = match family {
                    Family::Any => "tcp",
                    Family::V4 => "tcp4",
                    Family::V6 => "tcp6",
                };
                if host.contains(':') {
                    write!(f, "{scheme}://[{host}]:{port}")
                } else {
                    write!(f, "{scheme}://{host}:{port}")
                }
            }
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenAddr::Fd(fd) => write!(f, "fd://{fd}"),
        }
    }
}

impl ListenAddr {
    /// Open the socket described by this address.
    pub fn open(&self) -> SupervisorResult<OwnedFd> {
        let listen_err = |source| SupervisorError::Listen {
            addr: self.to_string(),
            source,
        };
        match self {
            ListenAddr::Tcp { family, host, port } => {
                let addrs = resolve(*family, host, *port).map_err(listen_err)?;
                let listener = TcpListener::bind(addrs.as_slice()).map_err(listen_err)?;
                Ok(OwnedFd::from(listener))
            }
            ListenAddr::Unix(path) => {
                let listener = UnixListener::bind(path).map_err(listen_err)?;
                Ok(OwnedFd::from(listener))
            }
            ListenAddr::Fd(fd) => adopt_fd(*fd).map_err(listen_err),
        }
    }
}

fn resolve(family: Family, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    let host = match (host, family) {
        ("", Family::V6) => "::",
        ("", _) => "0.0.0.0",
        (h, _) => h,
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()?
        .filter(|a| match family {
            Family::Any => true,
            Family::V4 => a.is_ipv4(),
            Family::V6 => a.is_ipv6(),
        })
        .collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no {family:?} address for {host}"),
        ));
    }
    Ok(addrs)
}

/// Take ownership of an already-open descriptor given on the command line.
fn adopt_fd(fd: RawFd) -> std::io::Result<OwnedFd> {
    // SAFETY: F_GETFD only reads the descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd is open; only the close-on-exec flag is changed.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: the operator handed this descriptor to the supervisor; nothing
    // else in this process owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// One listening descriptor and where it came from.
#[derive(Debug)]
pub struct Listener {
    pub label: String,
    fd: OwnedFd,
}

impl Listener {
    pub fn new(label: impl Into<String>, fd: OwnedFd) -> Self {
        Self {
            label: label.into(),
            fd,
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// The listening descriptors handed to every generation.
///
/// Owned by the manager for its whole lifetime and closed exactly once by
/// [`Listeners::release`] (or on drop).
#[derive(Debug, Default)]
pub struct Listeners {
    inner: Vec<Listener>,
}

impl Listeners {
    /// Open every address, or adopt the descriptors passed to the supervisor
    /// through socket activation when present.
    pub fn open(addrs: &[ListenAddr]) -> SupervisorResult<Self> {
        let inherited = socket_activation::listen_fds()?;
        if !inherited.is_empty() {
            if inherited.len() != addrs.len() {
                return Err(SupervisorError::Config(format!(
                    "doesn't have a matching number of LISTEN_FDS: {} != {}",
                    addrs.len(),
                    inherited.len()
                )));
            }
            let inner = addrs
                .iter()
                .zip(inherited)
                .map(|(addr, fd)| Listener::new(format!("{addr} (inherited)"), fd))
                .collect();
            return Ok(Self { inner });
        }

        let inner = addrs
            .iter()
            .map(|addr| addr.open().map(|fd| Listener::new(addr.to_string(), fd)))
            .collect::<SupervisorResult<Vec<_>>>()?;
        Ok(Self { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.inner.iter().map(|l| l.label.as_str()).collect()
    }

    /// Raw descriptor numbers in acquisition order.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.inner.iter().map(|l| l.fd.as_raw_fd()).collect()
    }

    /// Close every descriptor.
    pub fn release(self) -> usize {
        let count = self.inner.len();
        drop(self.inner);
        info!(count, "released listening sockets");
        count
    }
}
