//! Traffic inspectors.
//!
//! An [`Inspector`] is picked once at startup and shared by every relay. It
//! turns the raw chunks a relay copies into [`Dump`] records:
//!
//! - `hex`: canonical hex dump of every chunk, both directions
//! - `pg`: PostgreSQL frontend messages (startup, simple query, parse)
//! - `mysql`: MySQL client packets (handshake response, query, prepare)
//!
//! Per-connection state lives in [`SessionValues`], owned by the relay.

mod hex;
mod mysql;
mod postgres;

use std::fmt;

pub use hex::hex_dump;

/// Which way a chunk travelled through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToRemote => "client_to_remote",
            Direction::RemoteToClient => "remote_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values learned over the lifetime of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionValues {
    pub username: Option<String>,
    pub database: Option<String>,
}

/// A record produced by an inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dump {
    /// Hex dump of a whole chunk.
    Hex(String),
    /// A SQL statement sent by the client.
    Query(String),
}

/// The traffic inspector variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Inspector {
    #[default]
    Hex,
    Postgres,
    Mysql,
}

impl Inspector {
    /// Map a configuration token to an inspector. Unknown or empty tokens
    /// fall back to [`Inspector::Hex`].
    pub fn from_config(token: &str) -> Self {
        match token.trim() {
            "hex" => Inspector::Hex,
            "pg" => Inspector::Postgres,
            "mysql" => Inspector::Mysql,
            _ => Inspector::Hex,
        }
    }

    /// Configuration token for this inspector.
    pub fn as_str(&self) -> &'static str {
        match self {
            Inspector::Hex => "hex",
            Inspector::Postgres => "pg",
            Inspector::Mysql => "mysql",
        }
    }

    /// Inspect one chunk.
    pub fn inspect(
        &self,
        direction: Direction,
        data: &[u8],
        session: &mut SessionValues,
    ) -> Vec<Dump> {
        if data.is_empty() {
            return Vec::new();
        }
        match self {
            Inspector::Hex => vec![Dump::Hex(hex_dump(data))],
            Inspector::Postgres => match direction {
                Direction::ClientToRemote => postgres::inspect_frontend(data, session),
                Direction::RemoteToClient => Vec::new(),
            },
            Inspector::Mysql => match direction {
                Direction::ClientToRemote => mysql::inspect_client(data, session),
                Direction::RemoteToClient => Vec::new(),
            },
        }
    }
}

impl fmt::Display for Inspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read a NUL-terminated string starting at `pos`, returning it and the
/// position just past the terminator.
fn read_cstr(data: &[u8], pos: usize) -> Option<(String, usize)> {
    let rest = data.get(pos..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    let value = String::from_utf8_lossy(&rest[..end]).into_owned();
    Some((value, pos + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("hex", Inspector::Hex)]
    #[case("pg", Inspector::Postgres)]
    #[case("mysql", Inspector::Mysql)]
    #[case(" pg ", Inspector::Postgres)]
    #[case("", Inspector::Hex)]
    #[case("postgres", Inspector::Hex)]
    #[case("MYSQL", Inspector::Hex)]
    fn test_from_config(#[case] token: &str, #[case] expected: Inspector) {
        assert_eq!(Inspector::from_config(token), expected);
    }

    #[test]
    fn test_default_is_hex() {
        assert_eq!(Inspector::default(), Inspector::Hex);
    }

    #[test]
    fn test_empty_chunk_produces_nothing() {
        let mut session = SessionValues::default();
        for inspector in [Inspector::Hex, Inspector::Postgres, Inspector::Mysql] {
            assert!(inspector
                .inspect(Direction::ClientToRemote, &[], &mut session)
                .is_empty());
        }
    }

    #[test]
    fn test_sql_inspectors_ignore_server_traffic() {
        let mut session = SessionValues::default();
        let data = b"Q\0\0\0\x0dSELECT 1;\0";
        assert!(Inspector::Postgres
            .inspect(Direction::RemoteToClient, data, &mut session)
            .is_empty());
        assert!(Inspector::Mysql
            .inspect(Direction::RemoteToClient, data, &mut session)
            .is_empty());
    }

    #[test]
    fn test_hex_dumps_both_directions() {
        let mut session = SessionValues::default();
        for direction in [Direction::ClientToRemote, Direction::RemoteToClient] {
            let dumps = Inspector::Hex.inspect(direction, b"ok", &mut session);
            assert_eq!(dumps.len(), 1);
            assert!(matches!(&dumps[0], Dump::Hex(text) if text.contains("6f 6b")));
        }
    }

    #[test]
    fn test_read_cstr() {
        let data = b"user\0alice\0";
        assert_eq!(read_cstr(data, 0), Some(("user".to_string(), 5)));
        assert_eq!(read_cstr(data, 5), Some(("alice".to_string(), 11)));
        assert_eq!(read_cstr(data, 11), None);
        assert_eq!(read_cstr(b"open", 0), None);
    }
}
