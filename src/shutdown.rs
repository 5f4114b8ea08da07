use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::logger::Logger;

/// Shared stop flag plus the active-connection counter. One instance per
/// process, threaded through every listener and worker instead of living
/// in globals. The flag is set once and never cleared.
pub struct Shutdown {
    stop: AtomicBool,
    active: AtomicI64,
    stop_tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop: AtomicBool::new(false),
            active: AtomicI64::new(0),
            stop_tx,
        }
    }

    pub fn begin(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// A receiver that resolves when `begin` is called, for use inside
    /// `select!` against blocking accepts and reads.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn active_connections(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Claims a slot in the active-connection count. The slot is released
    /// when the guard drops, on every exit path.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            shutdown: Arc::clone(self),
        }
    }

    /// Blocks until every tracked connection has finished, polling on a
    /// short interval and reporting the remaining count every 5 seconds.
    pub async fn wait_for_drain(&self, logger: &Logger) {
        let mut ticks: u64 = 0;
        loop {
            let active = self.active_connections();
            if active == 0 {
                break;
            }
            if ticks % 50 == 0 {
                logger.log(&format!("{} connection(s) still active", active));
            }
            time::sleep(Duration::from_millis(100)).await;
            ticks += 1;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionGuard {
    shutdown: Arc<Shutdown>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shutdown.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Flips the stop flag on the first SIGINT/SIGTERM. Later signals are
/// only logged; the drain still has to run its course.
pub fn install_signal_handler(shutdown: Arc<Shutdown>, logger: Logger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        logger.log("Shutdown requested - waiting for active connections to drain");
        shutdown.begin();
        loop {
            wait_for_signal().await;
            logger.log("Still draining - shutdown already in progress");
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
