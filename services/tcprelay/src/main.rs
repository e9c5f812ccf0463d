//! tcprelay
//!
//! Accepts TCP connections on a local address, dials a fixed remote address
//! for each one, and relays bytes between them while dumping the traffic
//! (hex, PostgreSQL or MySQL).
//!
//! Signals:
//! - `SIGHUP`: stop accepting and drain in-flight connections
//! - `SIGINT` / `SIGTERM`: hard stop of the accept loop; connections still
//!   run to completion

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcprelay::{Acceptor, Config, Proxy, ServerError, ShutdownCoordinator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TCPRELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    info!("Starting tcprelay");
    info!(
        listen_addr = %config.listen_addr,
        remote_addr = %config.remote_addr,
        dumper = %config.dumper,
        use_server_starter = config.use_server_starter,
        "Configuration loaded"
    );

    let server_config = config.server_config().await?;
    let acceptor = Arc::new(Acceptor::new(server_config, Arc::new(Proxy::new())));
    let shutdown = acceptor.shutdown();

    let mut server: JoinHandle<Result<(), ServerError>> = tokio::spawn({
        let acceptor = Arc::clone(&acceptor);
        async move { acceptor.start().await }
    });

    let result = tokio::select! {
        result = &mut server => result,
        () = handle_signals(shutdown.clone()) => server.await,
    };

    match &config.shutdown_timeout {
        Some(timeout) => {
            if !shutdown.wait_timeout(*timeout).await {
                warn!(
                    in_flight = shutdown.in_flight(),
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout, connections still active"
                );
            }
        }
        None => shutdown.wait().await,
    }

    match result {
        Ok(Ok(())) => {
            info!("tcprelay stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, reason = e.reason_code(), "Server exited with error");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Server task panicked");
            Err(e.into())
        }
    }
}

/// Translate process signals into shutdown requests. Returns once a hard
/// shutdown has been requested.
#[cfg(unix)]
async fn handle_signals(shutdown: ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut hangup), Ok(mut interrupt), Ok(mut terminate)) = (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        error!("Failed to install signal handlers");
        return std::future::pending().await;
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(signal = "SIGHUP", "Received shutdown signal");
                shutdown.request_graceful_shutdown();
            }
            _ = interrupt.recv() => {
                info!(signal = "SIGINT", "Received shutdown signal");
                shutdown.request_hard_shutdown();
                return;
            }
            _ = terminate.recv() => {
                info!(signal = "SIGTERM", "Received shutdown signal");
                shutdown.request_hard_shutdown();
                return;
            }
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(shutdown: ShutdownCoordinator) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received shutdown signal");
        shutdown.request_hard_shutdown();
    } else {
        std::future::pending::<()>().await;
    }
}
