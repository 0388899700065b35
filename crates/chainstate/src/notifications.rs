//! Callbacks from the engine to the rest of the node, and the shared
//! shutdown flag polled at every step boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blockd_consensus::{hash256_to_hex, Hash256};
use crossbeam_channel::{bounded, Receiver, Sender};

pub trait Notifications: Send + Sync {
    fn block_tip(&self, _hash: &Hash256, _height: i32, _initial_download: bool) {}

    fn header_tip(&self, _hash: &Hash256, _height: i32) {}

    /// A flush failed; the node may continue but state on disk is stale.
    fn flush_error(&self, message: &str);

    /// Unrecoverable; the node must shut down.
    fn fatal_error(&self, message: &str);
}

/// Logs every event and requests shutdown on fatal errors.
pub struct LoggingNotifications {
    interrupt: SignalInterrupt,
}

impl LoggingNotifications {
    pub fn new(interrupt: SignalInterrupt) -> Self {
        Self { interrupt }
    }
}

impl Notifications for LoggingNotifications {
    fn block_tip(&self, hash: &Hash256, height: i32, initial_download: bool) {
        blockd_log::log_debug!(
            "UpdateTip: new best={} height={} ibd={}",
            hash256_to_hex(hash),
            height,
            initial_download
        );
    }

    fn flush_error(&self, message: &str) {
        blockd_log::log_error!("flush error: {message}");
    }

    fn fatal_error(&self, message: &str) {
        blockd_log::log_error!("fatal error: {message}");
        self.interrupt.request();
    }
}

struct InterruptInner {
    flag: AtomicBool,
    subscribers: Mutex<Vec<Sender<()>>>,
}

/// Cloneable shutdown flag. Subscribers get one message when it is raised.
#[derive(Clone)]
pub struct SignalInterrupt {
    inner: Arc<InterruptInner>,
}

impl Default for SignalInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalInterrupt {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InterruptInner {
                flag: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn request(&self) {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribers = std::mem::take(
            &mut *self
                .inner
                .subscribers
                .lock()
                .expect("interrupt subscribers lock"),
        );
        for subscriber in subscribers {
            let _ = subscriber.try_send(());
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// Receiver that fires once the flag is raised (immediately if it
    /// already is).
    pub fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("interrupt subscribers lock");
        if self.is_set() {
            let _ = tx.try_send(());
        } else {
            subscribers.push(tx);
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_fire_once() {
        let interrupt = SignalInterrupt::new();
        let early = interrupt.subscribe();
        assert!(early.try_recv().is_err());
        interrupt.request();
        interrupt.request();
        assert!(early.try_recv().is_ok());
        assert!(early.try_recv().is_err());
        let late = interrupt.subscribe();
        assert!(late.try_recv().is_ok());
        assert!(interrupt.clone().is_set());
        interrupt.reset();
        assert!(!interrupt.is_set());
    }

    #[test]
    fn fatal_error_requests_shutdown() {
        let interrupt = SignalInterrupt::new();
        let notifications = LoggingNotifications::new(interrupt.clone());
        notifications.flush_error("disk busy");
        assert!(!interrupt.is_set());
        notifications.fatal_error("Disk space is too low!");
        assert!(interrupt.is_set());
    }
}
