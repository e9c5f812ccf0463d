//! Listening sockets handed over by a server-starter style process manager.
//!
//! The manager binds the sockets, keeps them open across restarts, and passes
//! them to each new worker as file descriptors. The mapping is published in the
//! `SERVER_STARTER_PORT` environment variable as `;`-separated `addr=fd`
//! entries, where `addr` is a port, a `host:port` pair, or a unix socket path:
//!
//! ```text
//! SERVER_STARTER_PORT=8080=3;127.0.0.1:9090=4;/tmp/app.sock=5
//! ```

use std::collections::HashSet;
use std::io;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::warn;

/// Environment variable carrying the inherited socket table.
pub const SERVER_STARTER_PORT_ENV: &str = "SERVER_STARTER_PORT";

/// Errors from socket inheritance.
#[derive(Debug, Error)]
pub enum InheritError {
    #[error("SERVER_STARTER_PORT is not set")]
    NotFound,

    #[error("malformed SERVER_STARTER_PORT entry: {0:?}")]
    Malformed(String),

    #[error("no inherited TCP listeners available")]
    NoListeners,

    #[error("socket inheritance is not supported on this platform")]
    Unsupported,

    #[error("failed to adopt inherited fd {fd}: {source}")]
    Adopt {
        fd: i32,
        #[source]
        source: io::Error,
    },
}

/// One entry of the inherited socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedSocket {
    /// Address as published by the manager.
    pub addr: String,
    /// Inherited file descriptor.
    pub fd: i32,
}

impl InheritedSocket {
    /// Unix socket entries are published as absolute paths.
    pub fn is_unix(&self) -> bool {
        self.addr.starts_with('/')
    }
}

/// Parse the value of `SERVER_STARTER_PORT`.
pub fn parse_server_starter_port(value: &str) -> Result<Vec<InheritedSocket>, InheritError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (addr, fd) = entry
                .rsplit_once('=')
                .ok_or_else(|| InheritError::Malformed(entry.to_string()))?;
            let fd = fd
                .trim()
                .parse::<i32>()
                .map_err(|_| InheritError::Malformed(entry.to_string()))?;
            if addr.is_empty() || fd < 0 {
                return Err(InheritError::Malformed(entry.to_string()));
            }
            Ok(InheritedSocket {
                addr: addr.to_string(),
                fd,
            })
        })
        .collect()
}

/// Adopt every inherited TCP listener, in table order.
///
/// Must be called from within a tokio runtime.
pub fn listen_all() -> Result<Vec<TcpListener>, InheritError> {
    let value = std::env::var(SERVER_STARTER_PORT_ENV).map_err(|_| InheritError::NotFound)?;
    adopt_all(&parse_server_starter_port(&value)?)
}

/// Adopt the TCP entries of the table. A descriptor listed more than once is
/// adopted for its first entry only, so each fd has a single owner.
fn adopt_all(sockets: &[InheritedSocket]) -> Result<Vec<TcpListener>, InheritError> {
    let mut seen = HashSet::new();
    let mut listeners = Vec::new();
    for socket in sockets.iter().filter(|socket| !socket.is_unix()) {
        if !seen.insert(socket.fd) {
            warn!(addr = %socket.addr, fd = socket.fd, "Skipping repeated inherited fd");
            continue;
        }
        listeners.push(adopt(socket)?);
    }

    if listeners.is_empty() {
        return Err(InheritError::NoListeners);
    }
    Ok(listeners)
}

/// Adopt only the first inherited TCP listener.
pub fn listen_first() -> Result<TcpListener, InheritError> {
    listen_all()?
        .into_iter()
        .next()
        .ok_or(InheritError::NoListeners)
}

#[cfg(unix)]
fn adopt(socket: &InheritedSocket) -> Result<TcpListener, InheritError> {
    use std::os::fd::FromRawFd;

    let fd = socket.fd;
    // SAFETY: the descriptor is handed to this process by the manager, and
    // `adopt_all` passes each fd here at most once.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .map_err(|source| InheritError::Adopt { fd, source })?;
    TcpListener::from_std(std_listener).map_err(|source| InheritError::Adopt { fd, source })
}

#[cfg(not(unix))]
fn adopt(_socket: &InheritedSocket) -> Result<TcpListener, InheritError> {
    Err(InheritError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiple_entries() {
        let sockets = parse_server_starter_port("8080=3;127.0.0.1:9090=4;/tmp/app.sock=5").unwrap();
        assert_eq!(
            sockets,
            vec![
                InheritedSocket {
                    addr: "8080".to_string(),
                    fd: 3
                },
                InheritedSocket {
                    addr: "127.0.0.1:9090".to_string(),
                    fd: 4
                },
                InheritedSocket {
                    addr: "/tmp/app.sock".to_string(),
                    fd: 5
                },
            ]
        );
        assert!(!sockets[0].is_unix());
        assert!(sockets[2].is_unix());
    }

    #[test]
    fn test_parse_ipv6_entry_uses_last_equals() {
        let sockets = parse_server_starter_port("[::1]:8080=7;").unwrap();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].addr, "[::1]:8080");
        assert_eq!(sockets[0].fd, 7);
    }

    #[test]
    fn test_parse_empty_is_empty() {
        assert!(parse_server_starter_port("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_server_starter_port("8080"),
            Err(InheritError::Malformed(_))
        ));
        assert!(matches!(
            parse_server_starter_port("8080=abc"),
            Err(InheritError::Malformed(_))
        ));
        assert!(matches!(
            parse_server_starter_port("=3"),
            Err(InheritError::Malformed(_))
        ));
    }

    #[test]
    fn test_unix_only_table_has_no_listeners() {
        let sockets = parse_server_starter_port("/tmp/a.sock=5;/tmp/b.sock=6").unwrap();
        assert!(matches!(adopt_all(&sockets), Err(InheritError::NoListeners)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_repeated_fd_is_adopted_once() {
        use std::os::fd::IntoRawFd;

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let fd = std_listener.into_raw_fd();

        let table = format!("{}={fd};{addr}={fd}", addr.port());
        let listeners = adopt_all(&parse_server_starter_port(&table).unwrap()).unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].local_addr().unwrap(), addr);
    }
}
