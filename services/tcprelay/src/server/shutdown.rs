//! Shutdown coordination.
//!
//! Two independent switches control the accept loop:
//!
//! - the lifecycle signal, which flips once from active to cancelled and
//!   marks a hard stop
//! - the listener-close signal, which makes the accept loop drop the socket
//!
//! A hard shutdown flips both. A graceful shutdown only closes the listener,
//! so the loop can tell a drain apart from a hard stop. Neither one touches
//! connection handlers that are already running; they finish on their own and
//! are counted by [`InFlightSet`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Counts connection handlers that have been spawned and not yet finished.
#[derive(Debug, Default)]
pub struct InFlightSet {
    active: AtomicUsize,
    zero_notify: Notify,
}

impl InFlightSet {
    /// Register a handler. The returned guard unregisters it on drop, so the
    /// count drops exactly once per handler whichever way the handler exits.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            set: Arc::clone(self),
        }
    }

    /// Number of handlers currently running.
    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no handler is running.
    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.zero_notify.notified();
            tokio::pin!(notified);
            // Register before checking so a decrement in between is not missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "in-flight count underflow");
        if previous == 1 {
            self.zero_notify.notify_waiters();
        }
    }
}

/// Keeps one handler registered in an [`InFlightSet`] while alive.
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<InFlightSet>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.release();
    }
}

#[derive(Debug)]
struct Inner {
    /// `true` once a hard shutdown was requested.
    lifecycle: watch::Sender<bool>,
    /// `true` once the listener should be closed.
    listener_close: watch::Sender<bool>,
    /// `true` once the accept loop has exited and released the socket.
    stopped: watch::Sender<bool>,
    in_flight: Arc<InFlightSet>,
}

/// Shared handle for stopping an [`Acceptor`](crate::Acceptor) and waiting for
/// its connections to drain. Clones refer to the same state.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: watch::Sender::new(false),
                listener_close: watch::Sender::new(false),
                stopped: watch::Sender::new(false),
                in_flight: Arc::new(InFlightSet::default()),
            }),
        }
    }

    /// Cancel the lifecycle signal and close the listener. In-flight handlers
    /// keep running. Calling it again is a no-op.
    pub fn request_hard_shutdown(&self) {
        if set_once(&self.inner.lifecycle) {
            info!(
                in_flight = self.in_flight(),
                "Hard shutdown requested"
            );
            self.close_listener();
        }
    }

    /// Close the listener without cancelling the lifecycle signal, letting
    /// in-flight handlers drain. No-op after a hard shutdown or a previous
    /// graceful one.
    pub fn request_graceful_shutdown(&self) {
        if self.is_cancelled() {
            return;
        }
        if self.close_listener() {
            info!(
                in_flight = self.in_flight(),
                "Graceful shutdown requested"
            );
        }
    }

    /// Wait until the accept loop has exited and every handler has finished.
    pub async fn wait(&self) {
        self.listener_stopped().await;
        // No handler can be registered once the loop is gone.
        self.inner.in_flight.wait_for_zero().await;
    }

    /// [`wait`](Self::wait) with an upper bound. Returns `false` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Wait until the accept loop has exited.
    pub async fn listener_stopped(&self) {
        wait_set(&self.inner.stopped).await;
    }

    /// Whether the lifecycle signal has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.lifecycle.borrow()
    }

    /// Observe the lifecycle signal. The value turns `true` on hard shutdown.
    pub fn lifecycle(&self) -> watch::Receiver<bool> {
        self.inner.lifecycle.subscribe()
    }

    /// Number of connection handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count()
    }

    pub(crate) fn in_flight_set(&self) -> &Arc<InFlightSet> {
        &self.inner.in_flight
    }

    /// Resolves once the listener should be closed.
    pub(crate) fn listener_close_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.listener_close.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Mark the accept loop as gone. Returns `true` on the first call only.
    pub(crate) fn mark_stopped(&self) -> bool {
        set_once(&self.inner.stopped)
    }

    fn close_listener(&self) -> bool {
        let first = set_once(&self.inner.listener_close);
        if first {
            debug!("Listener close requested");
        }
        first
    }
}

/// Flip a boolean signal to `true`. Only the caller that performs the
/// transition gets `true` back.
fn set_once(signal: &watch::Sender<bool>) -> bool {
    signal.send_if_modified(|value| !std::mem::replace(value, true))
}

async fn wait_set(signal: &watch::Sender<bool>) {
    let mut rx = signal.subscribe();
    // The sender lives as long as `signal` is borrowed, so this cannot fail.
    let _ = rx.wait_for(|value| *value).await;
}
