//! Keeps the host process alive while sessions exist

use parking_lot::Mutex;

use crate::registry::ServerHost;

/// Host facility that stops the process from being suspended
pub trait KeepAlive: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Keep-alive for hosts without a suspend mechanism; only logs
#[derive(Debug, Default)]
pub struct LoggingKeepAlive;

impl KeepAlive for LoggingKeepAlive {
    fn acquire(&self) {
        log::info!("Sessions active, holding keep-alive");
    }

    fn release(&self) {
        log::info!("No sessions left, keep-alive released");
    }
}

/// Holds a [`KeepAlive`] exactly while the registry has sessions.
///
/// Acquires on a transition from zero to non-zero and releases on the
/// transition back; repeated counts on the same side are ignored.
pub struct SessionCountLock<K: KeepAlive> {
    keep_alive: K,
    held: Mutex<bool>,
}

impl<K: KeepAlive> SessionCountLock<K> {
    pub fn new(keep_alive: K) -> Self {
        Self {
            keep_alive,
            held: Mutex::new(false),
        }
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

impl<K: KeepAlive> ServerHost for SessionCountLock<K> {
    fn on_session_count_changed(&self, count: usize) {
        let mut held = self.held.lock();
        if count > 0 && !*held {
            self.keep_alive.acquire();
            *held = true;
        } else if count == 0 && *held {
            self.keep_alive.release();
            *held = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingKeepAlive {
        calls: Mutex<Vec<&'static str>>,
    }

    impl KeepAlive for Arc<CountingKeepAlive> {
        fn acquire(&self) {
            self.calls.lock().push("acquire");
        }

        fn release(&self) {
            self.calls.lock().push("release");
        }
    }

    #[test]
    fn test_acquires_and_releases_on_transitions_only() {
        let keep_alive = Arc::new(CountingKeepAlive::default());
        let lock = SessionCountLock::new(keep_alive.clone());

        lock.on_session_count_changed(1);
        lock.on_session_count_changed(2);
        lock.on_session_count_changed(1);
        assert!(lock.is_held());
        lock.on_session_count_changed(0);
        lock.on_session_count_changed(0);
        assert!(!lock.is_held());
        lock.on_session_count_changed(3);

        assert_eq!(
            *keep_alive.calls.lock(),
            vec!["acquire", "release", "acquire"]
        );
    }

    #[test]
    fn test_zero_before_any_session_is_ignored() {
        let keep_alive = Arc::new(CountingKeepAlive::default());
        let lock = SessionCountLock::new(keep_alive.clone());

        lock.on_session_count_changed(0);

        assert!(keep_alive.calls.lock().is_empty());
        assert!(!lock.is_held());
    }
}
