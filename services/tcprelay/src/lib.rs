pub mod config;
pub mod error;
pub mod inherit;
pub mod inspector;
pub mod relay;
pub mod server;

pub use config::{AddressConfig, Config, ListenSource, ServerConfig};
pub use error::ServerError;
pub use inherit::InheritError;
pub use inspector::{Direction, Dump, Inspector, SessionValues};
pub use relay::{ConnectionPair, Proxy, Relay};
pub use server::{Acceptor, InFlightGuard, InFlightSet, ShutdownCoordinator};
