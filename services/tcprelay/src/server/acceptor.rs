//! Listening socket ownership and the accept loop.

use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

use super::dispatcher::ConnectionDispatcher;
use super::shutdown::ShutdownCoordinator;
use crate::config::{ListenSource, ServerConfig};
use crate::error::ServerError;
use crate::inherit;
use crate::relay::Relay;

/// What the accept loop does with a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptDisposition {
    /// Transient condition; accept again.
    Retry,
    /// The socket was closed underneath the loop.
    ListenerClosed,
    /// Anything else ends the loop with an error.
    Fatal,
}

/// Classify an accept error by its kind and OS error code.
pub(crate) fn classify_accept_error(err: &io::Error) -> AcceptDisposition {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => return AcceptDisposition::Retry,
        _ => {}
    }

    #[cfg(unix)]
    {
        match err.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO) => {
                return AcceptDisposition::Retry;
            }
            Some(libc::EBADF | libc::ENOTSOCK | libc::EINVAL) => {
                return AcceptDisposition::ListenerClosed;
            }
            _ => {}
        }
    }

    AcceptDisposition::Fatal
}

enum AcceptEvent {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    CloseRequested,
}

/// Owns the listening socket and dispatches every accepted connection to its
/// own task.
pub struct Acceptor {
    config: ServerConfig,
    dispatcher: ConnectionDispatcher,
    shutdown: ShutdownCoordinator,
    started: AtomicBool,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl Acceptor {
    /// Create an acceptor. Nothing is bound until [`start`](Self::start).
    pub fn new(config: ServerConfig, relay: Arc<dyn Relay>) -> Self {
        Self {
            dispatcher: ConnectionDispatcher::new(
                config.addresses.remote,
                config.inspector,
                relay,
            ),
            config,
            shutdown: ShutdownCoordinator::new(),
            started: AtomicBool::new(false),
            local_addr: watch::Sender::new(None),
        }
    }

    /// Handle for requesting shutdown and waiting for drain.
    pub fn shutdown(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Wait until the socket is bound and return its local address, or `None`
    /// if the accept loop ended without one.
    pub async fn ready(&self) -> Option<SocketAddr> {
        let mut local_addr = self.local_addr.subscribe();
        let stopped = self.shutdown.listener_stopped();
        tokio::pin!(stopped);
        loop {
            let current = *local_addr.borrow_and_update();
            if current.is_some() {
                return current;
            }
            tokio::select! {
                changed = local_addr.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = &mut stopped => return *local_addr.borrow(),
            }
        }
    }

    /// Acquire the listening socket and run the accept loop.
    ///
    /// Returns `Ok(())` when the loop ends because shutdown was requested and
    /// an error when the socket cannot be acquired or accept fails in a way
    /// that is neither transient nor a closed listener. Only one call per
    /// acceptor is allowed.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }

        // Released on every exit path, unwinding and cancellation included.
        let _stopped = StoppedGuard {
            shutdown: &self.shutdown,
        };

        let listener = self.acquire_listener().await?;
        let local_addr = listener.local_addr().ok();
        self.local_addr.send_replace(local_addr);
        info!(
            listen_addr = ?local_addr,
            remote_addr = %self.config.addresses.remote,
            dumper = %self.config.inspector,
            "Listener started"
        );

        let result = self.accept_loop(&listener).await;
        drop(listener);
        info!(
            listen_addr = ?local_addr,
            in_flight = self.shutdown.in_flight(),
            "Listener closed"
        );
        result
    }

    async fn acquire_listener(&self) -> Result<TcpListener, ServerError> {
        match self.config.listen_source {
            ListenSource::Bind(addr) => TcpListener::bind(addr).await.map_err(|source| {
                error!(listen_addr = %addr, error = %source, "Listener bind failed");
                ServerError::Bind { addr, source }
            }),
            ListenSource::Inherited => inherit::listen_first().map_err(|e| {
                error!(error = %e, "Inherited listener unavailable");
                ServerError::Inherit(e)
            }),
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), ServerError> {
        let close_requested = self.shutdown.listener_close_requested();
        tokio::pin!(close_requested);

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut close_requested => AcceptEvent::CloseRequested,
                accepted = listener.accept() => AcceptEvent::Accepted(accepted),
            };

            match event {
                AcceptEvent::Accepted(Ok((stream, peer_addr))) => {
                    self.spawn_handler(stream, peer_addr);
                }
                AcceptEvent::CloseRequested => {
                    self.log_planned_stop();
                    return Ok(());
                }
                AcceptEvent::Accepted(Err(e)) => {
                    if let ControlFlow::Break(result) = self.on_accept_error(e) {
                        return result;
                    }
                }
            }
        }
    }

    /// Decide whether the loop survives a failed `accept`.
    fn on_accept_error(&self, e: io::Error) -> ControlFlow<Result<(), ServerError>> {
        match classify_accept_error(&e) {
            AcceptDisposition::Retry => {
                debug!(error = %e, "Transient accept error, retrying");
                ControlFlow::Continue(())
            }
            AcceptDisposition::ListenerClosed => {
                self.log_planned_stop();
                ControlFlow::Break(Ok(()))
            }
            AcceptDisposition::Fatal => {
                error!(error = %e, "Listener accept failed");
                ControlFlow::Break(Err(ServerError::Accept(e)))
            }
        }
    }

    fn spawn_handler(&self, stream: TcpStream, peer_addr: SocketAddr) {
        // Registered before the spawn so a concurrent wait cannot miss it.
        let guard = self.shutdown.in_flight_set().track();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(
            async move {
                let _guard = guard;
                dispatcher.dispatch(stream, peer_addr).await;
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }

    fn log_planned_stop(&self) {
        if self.shutdown.is_cancelled() {
            info!("Accept loop stopped for shutdown");
        } else {
            info!(
                in_flight = self.shutdown.in_flight(),
                "Accept loop stopped, draining connections"
            );
        }
    }
}

struct StoppedGuard<'a> {
    shutdown: &'a ShutdownCoordinator,
}

impl Drop for StoppedGuard<'_> {
    fn drop(&mut self) {
        self.shutdown.mark_stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressConfig;
    use crate::inspector::Inspector;
    use crate::relay::ConnectionPair;

    struct NoopRelay;

    #[async_trait::async_trait]
    impl Relay for NoopRelay {
        async fn relay(&self, _pair: ConnectionPair, _inspector: Inspector) {}
    }

    fn acceptor() -> Acceptor {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let addresses = AddressConfig::new(addr, addr);
        Acceptor::new(
            ServerConfig::bind(addresses, Inspector::Hex),
            Arc::new(NoopRelay),
        )
    }

    #[test]
    fn test_fatal_accept_error_ends_loop_with_error() {
        let acceptor = acceptor();
        match acceptor.on_accept_error(io::Error::other("boom")) {
            ControlFlow::Break(Err(ServerError::Accept(e))) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stopped_guard_releases_waiters() {
        let acceptor = acceptor();
        drop(StoppedGuard {
            shutdown: &acceptor.shutdown,
        });
        assert!(
            acceptor
                .shutdown
                .wait_timeout(std::time::Duration::from_secs(1))
                .await
        );
    }

    #[test]
    fn test_transient_accept_error_keeps_looping() {
        let acceptor = acceptor();
        assert!(matches!(
            acceptor.on_accept_error(io::Error::from(io::ErrorKind::ConnectionAborted)),
            ControlFlow::Continue(())
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_closed_listener_ends_loop_cleanly() {
        let acceptor = acceptor();
        assert!(matches!(
            acceptor.on_accept_error(io::Error::from_raw_os_error(libc::EBADF)),
            ControlFlow::Break(Ok(()))
        ));
    }

    #[test]
    fn test_classify_transient_kinds() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
        ] {
            assert_eq!(
                classify_accept_error(&io::Error::from(kind)),
                AcceptDisposition::Retry,
                "{kind:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_os_codes() {
        let os = io::Error::from_raw_os_error;
        assert_eq!(classify_accept_error(&os(libc::EMFILE)), AcceptDisposition::Retry);
        assert_eq!(classify_accept_error(&os(libc::ENFILE)), AcceptDisposition::Retry);
        assert_eq!(classify_accept_error(&os(libc::ECONNABORTED)), AcceptDisposition::Retry);
        assert_eq!(
            classify_accept_error(&os(libc::EBADF)),
            AcceptDisposition::ListenerClosed
        );
        assert_eq!(
            classify_accept_error(&os(libc::EINVAL)),
            AcceptDisposition::ListenerClosed
        );
        assert_eq!(classify_accept_error(&os(libc::EACCES)), AcceptDisposition::Fatal);
    }

    #[test]
    fn test_classify_unknown_is_fatal() {
        assert_eq!(
            classify_accept_error(&io::Error::other("boom")),
            AcceptDisposition::Fatal
        );
    }
}
