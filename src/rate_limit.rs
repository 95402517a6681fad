//! Rate/backoff control: the per-topic send rate limiter and the
//! pause-event backoff generator, using `rand` for jittered delays.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::config::RateNamedConfig;

/// `(interval_ms, max_count)` sliding-window limiter, reset whenever a
/// message's timestamp falls in a new interval.
#[derive(Clone, Copy, Debug)]
enum EffectiveRate {
    Unlimited,
    Limited { interval_ms: u64, max_count: u64 },
}

impl From<&RateNamedConfig> for EffectiveRate {
    fn from(c: &RateNamedConfig) -> EffectiveRate {
        match c {
            RateNamedConfig::Unlimited(_) => EffectiveRate::Unlimited,
            RateNamedConfig::Limited { interval_ms, count } => EffectiveRate::Limited {
                interval_ms: *interval_ms,
                max_count: *count,
            },
        }
    }
}

struct Window {
    interval_start_ms: i64,
    count: u64,
}

pub struct TopicRateLimiter {
    default: EffectiveRate,
    overrides: HashMap<String, EffectiveRate>,
    windows: HashMap<String, Window>,
}

impl TopicRateLimiter {
    pub fn new(default: &RateNamedConfig, overrides: &HashMap<String, RateNamedConfig>) -> TopicRateLimiter {
        TopicRateLimiter {
            default: default.into(),
            overrides: overrides.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            windows: HashMap::new(),
        }
    }

    /// Returns true if a message with the given topic/creation-timestamp
    /// should be rate-limited (discarded).
    pub fn is_rate_limited(&mut self, topic: &str, timestamp_ms: i64) -> bool {
        let rate = self.overrides.get(topic).copied().unwrap_or(self.default);
        let (interval_ms, max_count) = match rate {
            EffectiveRate::Unlimited => return false,
            EffectiveRate::Limited { interval_ms, max_count } => (interval_ms, max_count),
        };
        // count == 0 means "always rate limited".
        if max_count == 0 {
            return true;
        }
        if interval_ms == 0 {
            return false;
        }
        let interval_ms_i = interval_ms as i64;
        let window = self.windows.entry(topic.to_string()).or_insert(Window {
            interval_start_ms: timestamp_ms - (timestamp_ms % interval_ms_i),
            count: 0,
        });
        let current_interval_start = timestamp_ms - (timestamp_ms % interval_ms_i);
        if current_interval_start != window.interval_start_ms {
            window.interval_start_ms = current_interval_start;
            window.count = 0;
        }
        window.count += 1;
        window.count > max_count
    }
}

/// Bounded exponential backoff with randomised jitter, used both for the
/// bootstrap metadata-fetch retry loop and the pause-event rate limiter.
pub struct Backoff {
    initial: Duration,
    max_doublings: u32,
    min: Duration,
    doublings: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max_doublings: u32, min: Duration) -> Backoff {
        Backoff {
            initial,
            max_doublings,
            min,
            doublings: 0,
        }
    }

    /// The next delay to sleep for, with the doubling counter advanced and
    /// +/-25% jitter applied, floored at `min`.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let doublings = self.doublings.min(self.max_doublings);
        let base = self.initial.saturating_mul(1u32.checked_shl(doublings).unwrap_or(u32::MAX));
        if self.doublings < self.max_doublings {
            self.doublings += 1;
        }
        let base = base.max(self.min);
        let jitter_frac = rng.gen_range(-0.25..=0.25);
        let jittered_nanos = (base.as_nanos() as f64 * (1.0 + jitter_frac)).max(self.min.as_nanos() as f64);
        Duration::from_nanos(jittered_nanos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn unlimited_never_limits() {
        let mut limiter = TopicRateLimiter::new(&RateNamedConfig::Unlimited(crate::config::UnlimitedTag::Unlimited), &HashMap::new());
        for i in 0..1000 {
            assert!(!limiter.is_rate_limited("t", i));
        }
    }

    #[test]
    fn zero_count_always_limits() {
        let mut limiter = TopicRateLimiter::new(
            &RateNamedConfig::Limited { interval_ms: 1000, count: 0 },
            &HashMap::new(),
        );
        assert!(limiter.is_rate_limited("t", 0));
    }

    #[test]
    fn resets_on_new_interval() {
        let mut limiter = TopicRateLimiter::new(
            &RateNamedConfig::Limited { interval_ms: 1000, count: 2 },
            &HashMap::new(),
        );
        assert!(!limiter.is_rate_limited("t", 0));
        assert!(!limiter.is_rate_limited("t", 10));
        assert!(limiter.is_rate_limited("t", 20)); // 3rd in the same window
        assert!(!limiter.is_rate_limited("t", 1500)); // new window
    }

    #[test]
    fn backoff_stays_bounded_and_above_min() {
        let mut backoff = Backoff::new(Duration::from_millis(10), 3, Duration::from_millis(5));
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let mut last = Duration::from_millis(0);
        for _ in 0..10 {
            let delay = backoff.next_delay(&mut rng);
            assert!(delay >= Duration::from_millis(5));
            last = delay;
        }
        // After max_doublings, delay should plateau around initial * 2^max_doublings.
        assert!(last <= Duration::from_millis(10 * 8 * 2)); // generous upper bound incl. jitter
    }
}
