use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use oproxy_common::clock::unix_millis;
use oproxy_common::RateLimitScope;

pub const GLOBAL_KEY: &str = "global";
pub const SWEEP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Ip,
    Token,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Global => "global",
            LimitScope::Ip => "ip",
            LimitScope::Token => "token",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denial {
    pub scope: LimitScope,
    pub retry_after_secs: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    stamps: VecDeque<u64>,
    last_activity: u64,
}

struct Window {
    config: RateLimitScope,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Window {
    fn new(config: RateLimitScope) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Sliding-window admission: drop expired stamps, deny at capacity,
    /// otherwise record `now` and permit.
    fn consume_at(&self, key: &str, config: &RateLimitScope, now_ms: u64) -> Result<u32, u64> {
        if !config.enabled {
            return Ok(config.max_requests);
        }
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_default();
        bucket.last_activity = now_ms;

        if now_ms >= config.window_ms {
            let floor = now_ms - config.window_ms;
            while bucket.stamps.front().is_some_and(|stamp| *stamp <= floor) {
                bucket.stamps.pop_front();
            }
        }

        if bucket.stamps.len() >= config.max_requests as usize {
            let oldest = *bucket.stamps.front().unwrap_or(&now_ms);
            let wait_ms = (oldest + config.window_ms).saturating_sub(now_ms);
            return Err(wait_ms.div_ceil(1000));
        }

        bucket.stamps.push_back(now_ms);
        Ok(config.max_requests - bucket.stamps.len() as u32)
    }

    fn sweep_at(&self, now_ms: u64) {
        let horizon = self.config.window_ms.saturating_mul(2);
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, bucket| now_ms.saturating_sub(bucket.last_activity) <= horizon);
    }
}

/// Three independent sliding windows, checked global -> ip -> token; the
/// first denial wins.
pub struct RateLimiter {
    global: Window,
    ip: Window,
    token: Window,
}

impl RateLimiter {
    pub fn new(
        global: RateLimitScope,
        ip: RateLimitScope,
        token: RateLimitScope,
    ) -> Self {
        Self {
            global: Window::new(global),
            ip: Window::new(ip),
            token: Window::new(token),
        }
    }

    pub fn check(
        &self,
        ip: &str,
        token_id: Option<&str>,
        token_override: Option<RateLimitScope>,
    ) -> Result<(), Denial> {
        self.check_at(ip, token_id, token_override, unix_millis())
    }

    pub fn check_at(
        &self,
        ip: &str,
        token_id: Option<&str>,
        token_override: Option<RateLimitScope>,
        now_ms: u64,
    ) -> Result<(), Denial> {
        let global_cfg = self.global.config;
        if let Err(retry) = self.global.consume_at(GLOBAL_KEY, &global_cfg, now_ms) {
            return Err(Denial {
                scope: LimitScope::Global,
                retry_after_secs: retry,
            });
        }

        let ip_cfg = self.ip.config;
        if let Err(retry) = self.ip.consume_at(ip, &ip_cfg, now_ms) {
            return Err(Denial {
                scope: LimitScope::Ip,
                retry_after_secs: retry,
            });
        }

        if let Some(token_id) = token_id {
            let token_cfg = token_override.unwrap_or(self.token.config);
            if let Err(retry) = self.token.consume_at(token_id, &token_cfg, now_ms) {
                return Err(Denial {
                    scope: LimitScope::Token,
                    retry_after_secs: retry,
                });
            }
        }

        Ok(())
    }

    /// Periodic cleanup of buckets idle past twice their window.
    pub fn sweep(&self) {
        let now = unix_millis();
        self.global.sweep_at(now);
        self.ip.sweep_at(now);
        self.token.sweep_at(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(max: u32, window_ms: u64) -> RateLimitScope {
        RateLimitScope::new(true, max, window_ms)
    }

    fn off() -> RateLimitScope {
        RateLimitScope::new(false, 0, 0)
    }

    #[test]
    fn window_allows_up_to_cap_then_denies() {
        let limiter = RateLimiter::new(scope(3, 1000), off(), off());
        assert!(limiter.check_at("c", None, None, 0).is_ok());
        assert!(limiter.check_at("c", None, None, 100).is_ok());
        assert!(limiter.check_at("c", None, None, 200).is_ok());
        let denial = limiter.check_at("c", None, None, 300).unwrap_err();
        assert_eq!(denial.scope, LimitScope::Global);
        // oldest=0, window=1000 -> wait 700ms -> ceil to 1s
        assert_eq!(denial.retry_after_secs, 1);
    }

    #[test]
    fn window_slides_as_stamps_expire() {
        let limiter = RateLimiter::new(scope(2, 1000), off(), off());
        assert!(limiter.check_at("c", None, None, 0).is_ok());
        assert!(limiter.check_at("c", None, None, 500).is_ok());
        assert!(limiter.check_at("c", None, None, 900).is_err());
        // The stamp at t=0 has aged out.
        assert!(limiter.check_at("c", None, None, 1001).is_ok());
    }

    #[test]
    fn ip_buckets_are_independent() {
        let limiter = RateLimiter::new(off(), scope(1, 1000), off());
        assert!(limiter.check_at("1.1.1.1", None, None, 0).is_ok());
        assert!(limiter.check_at("2.2.2.2", None, None, 0).is_ok());
        let denial = limiter.check_at("1.1.1.1", None, None, 10).unwrap_err();
        assert_eq!(denial.scope, LimitScope::Ip);
    }

    #[test]
    fn token_window_only_applies_with_a_token() {
        let limiter = RateLimiter::new(off(), off(), scope(1, 1000));
        assert!(limiter.check_at("ip", None, None, 0).is_ok());
        assert!(limiter.check_at("ip", None, None, 1).is_ok());
        assert!(limiter.check_at("ip", Some("t1"), None, 2).is_ok());
        let denial = limiter.check_at("ip", Some("t1"), None, 3).unwrap_err();
        assert_eq!(denial.scope, LimitScope::Token);
    }

    #[test]
    fn per_token_override_replaces_window_config() {
        let limiter = RateLimiter::new(off(), off(), scope(100, 1000));
        let tight = scope(1, 1000);
        assert!(limiter.check_at("ip", Some("t1"), Some(tight), 0).is_ok());
        assert!(limiter.check_at("ip", Some("t1"), Some(tight), 1).is_err());
    }

    #[test]
    fn first_denial_wins_in_scope_order() {
        let limiter = RateLimiter::new(scope(1, 1000), scope(1, 1000), off());
        assert!(limiter.check_at("ip", None, None, 0).is_ok());
        let denial = limiter.check_at("ip", None, None, 1).unwrap_err();
        assert_eq!(denial.scope, LimitScope::Global);
    }

    #[test]
    fn disabled_windows_never_deny() {
        let limiter = RateLimiter::new(off(), off(), off());
        for t in 0..100 {
            assert!(limiter.check_at("ip", Some("t"), None, t).is_ok());
        }
    }

    #[test]
    fn soundness_within_any_window() {
        // Cap 5 per 1000ms; fire at every 50ms for 3 windows and count
        // how many are allowed inside each window.
        let limiter = RateLimiter::new(scope(5, 1000), off(), off());
        let mut allowed_at = Vec::new();
        for t in (0..3000).step_by(50) {
            if limiter.check_at("c", None, None, t).is_ok() {
                allowed_at.push(t);
            }
        }
        for start in (0..2000).step_by(50) {
            let in_window = allowed_at
                .iter()
                .filter(|t| **t > start && **t <= start + 1000)
                .count();
            assert!(in_window <= 5, "window at {start} admitted {in_window}");
        }
    }
}
