//! Connection acceptance and shutdown coordination.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Acceptor -> ConnectionDispatcher -> dial remote -> Relay
//!              |                 |
//!     ShutdownCoordinator <- InFlightSet
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let acceptor = Arc::new(Acceptor::new(config, Arc::new(Proxy::new())));
//! let shutdown = acceptor.shutdown();
//!
//! let server = tokio::spawn({
//!     let acceptor = Arc::clone(&acceptor);
//!     async move { acceptor.start().await }
//! });
//!
//! shutdown.request_graceful_shutdown();
//! shutdown.wait().await;
//! ```

mod acceptor;
mod dispatcher;
mod shutdown;

pub use acceptor::Acceptor;
pub use shutdown::{InFlightGuard, InFlightSet, ShutdownCoordinator};
