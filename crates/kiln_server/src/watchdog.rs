//! Shutdown watchdog.
//!
//! Armed around [`crate::Server::force_shutdown`]. If teardown hangs (a
//! stuck interface, a world that never finishes saving) the watchdog fires
//! and, by default, kills the process.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

/// Runs an action unless disarmed before the timeout.
#[derive(Debug)]
pub struct ShutdownWatchdog {
    disarm: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ShutdownWatchdog {
    /// Arms a watchdog that logs and exits the process with status 1.
    pub fn arm(timeout: Duration) -> io::Result<Self> {
        Self::arm_with(timeout, move || {
            tracing::error!(?timeout, "Shutdown did not finish in time, forcing exit");
            std::process::exit(1);
        })
    }

    /// Arms a watchdog that runs `action` on timeout.
    pub fn arm_with(timeout: Duration, action: impl FnOnce() + Send + 'static) -> io::Result<Self> {
        let (tx, rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("kiln-watchdog".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                    action();
                }
            })?;
        Ok(Self {
            disarm: Some(tx),
            thread: Some(thread),
        })
    }

    /// Cancels the watchdog and waits for its thread.
    pub fn disarm(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Watchdog action panicked");
            }
        }
    }
}

impl Drop for ShutdownWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fires_after_timeout() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let watchdog = ShutdownWatchdog::arm_with(Duration::from_millis(20), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(200));
        watchdog.disarm();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disarm_prevents_action() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let watchdog = ShutdownWatchdog::arm_with(Duration::from_secs(10), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        watchdog.disarm();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_disarms() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        drop(
            ShutdownWatchdog::arm_with(Duration::from_secs(10), move || {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap(),
        );
        assert!(!fired.load(Ordering::SeqCst));
    }
}
