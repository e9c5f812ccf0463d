//! Error types for the relay server.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::inherit::InheritError;

/// Errors that escape [`Acceptor::start`](crate::Acceptor::start) or address
/// resolution. Per-connection failures never show up here; they are logged
/// inside the connection task.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// No usable socket was handed over by the process manager.
    #[error("failed to inherit listener: {0}")]
    Inherit(#[from] InheritError),

    /// Accept failed with an error that is neither transient nor caused by
    /// the listener being closed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// An address could not be resolved to a socket address.
    #[error("failed to resolve {addr}: {detail}")]
    Resolve { addr: String, detail: String },

    /// `start` was called more than once on the same acceptor.
    #[error("acceptor already started")]
    AlreadyStarted,
}

impl ServerError {
    /// Short machine-readable reason, used as a log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ServerError::Bind { .. } => "bind_failed",
            ServerError::Inherit(_) => "inherit_failed",
            ServerError::Accept(_) => "accept_failed",
            ServerError::Resolve { .. } => "resolve_failed",
            ServerError::AlreadyStarted => "already_started",
        }
    }
}
