//! Per-connection relays.
//!
//! A [`Relay`] receives a fully established [`ConnectionPair`] and owns both
//! sockets from then on. Taking the pair by value means both connections are
//! closed by the time `relay` returns.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::inspector::{Direction, Dump, Inspector, SessionValues};

/// Read buffer per direction.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// An accepted client connection and the upstream connection dialed for it.
#[derive(Debug)]
pub struct ConnectionPair {
    /// Accepted client connection.
    pub client: TcpStream,
    /// Connection to the remote address.
    pub upstream: TcpStream,
    /// Peer address of the client.
    pub client_addr: SocketAddr,
    /// Local address the client connected to.
    pub listen_addr: SocketAddr,
    /// Configured remote address.
    pub remote_addr: SocketAddr,
}

/// Runs one connection pair to completion.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    async fn relay(&self, pair: ConnectionPair, inspector: Inspector);
}

/// Fields attached to every event logged for one connection.
#[derive(Debug, Clone)]
struct ConnFields {
    conn_id: Uuid,
    client_addr: SocketAddr,
    listen_addr: SocketAddr,
    remote_addr: SocketAddr,
}

/// Copies bytes in both directions and logs what the inspector makes of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Proxy;

impl Proxy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Relay for Proxy {
    async fn relay(&self, pair: ConnectionPair, inspector: Inspector) {
        let fields = ConnFields {
            conn_id: Uuid::now_v7(),
            client_addr: pair.client_addr,
            listen_addr: pair.listen_addr,
            remote_addr: pair.remote_addr,
        };

        info!(
            conn_id = %fields.conn_id,
            client_addr = %fields.client_addr,
            proxy_listen_addr = %fields.listen_addr,
            remote_addr = %fields.remote_addr,
            dumper = %inspector,
            "Connection opened"
        );

        let (client_read, client_write) = pair.client.into_split();
        let (upstream_read, upstream_write) = pair.upstream.into_split();

        let to_remote = pump(
            client_read,
            upstream_write,
            Direction::ClientToRemote,
            inspector,
            &fields,
        );
        let to_client = pump(
            upstream_read,
            client_write,
            Direction::RemoteToClient,
            inspector,
            &fields,
        );

        let (to_remote, to_client) = tokio::join!(to_remote, to_client);

        if let Err(e) = &to_remote.result {
            debug!(conn_id = %fields.conn_id, direction = %Direction::ClientToRemote, error = %e, "Relay error");
        }
        if let Err(e) = &to_client.result {
            debug!(conn_id = %fields.conn_id, direction = %Direction::RemoteToClient, error = %e, "Relay error");
        }

        info!(
            conn_id = %fields.conn_id,
            client_addr = %fields.client_addr,
            bytes_to_remote = to_remote.bytes,
            bytes_to_client = to_client.bytes,
            "Connection closed"
        );
    }
}

struct PumpOutcome {
    bytes: u64,
    result: io::Result<()>,
}

/// Copy one direction until EOF or error, then half-close the writer.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    inspector: Inspector,
    fields: &ConnFields,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = SessionValues::default();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let result = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            for dump in inspector.inspect(direction, chunk, &mut session) {
                log_dump(fields, direction, &session, dump);
            }
            writer.write_all(chunk).await?;
            bytes += n as u64;
        }
        writer.shutdown().await
    }
    .await;

    PumpOutcome { bytes, result }
}

fn log_dump(fields: &ConnFields, direction: Direction, session: &SessionValues, dump: Dump) {
    match dump {
        Dump::Hex(text) => info!(
            conn_id = %fields.conn_id,
            client_addr = %fields.client_addr,
            proxy_listen_addr = %fields.listen_addr,
            remote_addr = %fields.remote_addr,
            direction = %direction,
            dump = %text,
            "Traffic dump"
        ),
        Dump::Query(query) => info!(
            conn_id = %fields.conn_id,
            client_addr = %fields.client_addr,
            proxy_listen_addr = %fields.listen_addr,
            remote_addr = %fields.remote_addr,
            username = session.username.as_deref().unwrap_or_default(),
            database = session.database.as_deref().unwrap_or_default(),
            query = %query,
            "Query"
        ),
    }
}
