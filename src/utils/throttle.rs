//! Log throttling
//!
//! Capture sources and viewer sessions can fail on every tick (unplugged
//! device, dead socket). The throttler lets the first occurrence through and
//! then suppresses the same key for an interval, counting what it swallowed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Limits how often the same message key is logged
///
/// ```rust
/// use clip_relay::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("capture_error"));
/// assert!(!throttler.should_log("capture_error"));
/// assert_eq!(throttler.suppressed("capture_error"), 1);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if the message should be logged now.
    ///
    /// A `true` result resets the suppressed counter for the key.
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), but returns how many messages
    /// were suppressed since the last one that got through.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Number of messages currently being held back for `key`
    pub fn suppressed(&self, key: &str) -> u64 {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.suppressed)
            .unwrap_or(0)
    }

    /// Forget a key, so the next error after a recovery is logged immediately
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            tracing::warn!(suppressed, $($arg)*);
        }
    };
}

/// Throttled `tracing::error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            tracing::error!(suppressed, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));
        assert_eq!(throttler.suppressed("test_key"), 2);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.check("test_key"), Some(2));
        assert_eq!(throttler.suppressed("test_key"), 0);
    }

    #[test]
    fn test_different_keys() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key1"));
        assert!(throttler.should_log("key2"));
        assert!(!throttler.should_log("key1"));
        assert!(!throttler.should_log("key2"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("test_key"));
        assert!(!throttler.should_log("test_key"));
        throttler.clear("test_key");
        assert!(throttler.should_log("test_key"));

        throttler.clear_all();
        assert!(throttler.is_empty());
    }

    #[test]
    fn test_macros_compile_and_throttle() {
        let throttler = LogThrottler::with_secs(10);
        for i in 0..3 {
            crate::warn_throttled!(throttler, "macro", "attempt {} failed", i);
        }
        assert_eq!(throttler.suppressed("macro"), 2);
    }
}
