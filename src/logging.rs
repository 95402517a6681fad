//! Rate-limited error logging.
//!
//! A flapping broker can make a connector hit the same error log site many
//! times a second. `RateLimitedLog` suppresses repeats of the same call site
//! within a rolling window so that one noisy broker cannot flood the log;
//! each call site gets its own last-fired timestamp, keyed by a `&'static str`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

pub struct RateLimitedLog {
    window: Duration,
    last_fired: Mutex<HashMap<&'static str, Instant>>,
}

impl RateLimitedLog {
    pub fn new(window: Duration) -> RateLimitedLog {
        RateLimitedLog {
            window,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the given call site should log now (and records that
    /// it did); returns false if it fired within the window already.
    pub fn should_log(&self, site: &'static str) -> bool {
        let now = Instant::now();
        let mut last_fired = self.last_fired.lock().expect("RateLimitedLog poisoned");
        match last_fired.get(site) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                last_fired.insert(site, now);
                true
            }
        }
    }
}

impl Default for RateLimitedLog {
    fn default() -> RateLimitedLog {
        RateLimitedLog::new(Duration::from_secs(30))
    }
}

/// Logs `$body` through `slog::error!` at most once per rate-limit window
/// for the given `$site` key.
#[macro_export]
macro_rules! log_rate_limited {
    ($rl:expr, $site:expr, $logger:expr, $($body:tt)+) => {
        if $rl.should_log($site) {
            ::slog::error!($logger, $($body)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_within_window() {
        let rl = RateLimitedLog::new(Duration::from_secs(60));
        assert!(rl.should_log("site-a"));
        assert!(!rl.should_log("site-a"));
        assert!(rl.should_log("site-b"), "different site is independent");
    }

    #[test]
    fn allows_after_window() {
        let rl = RateLimitedLog::new(Duration::from_millis(10));
        assert!(rl.should_log("site-a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(rl.should_log("site-a"));
    }
}
