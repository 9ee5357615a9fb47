//! Auth-failure rate limiting
//!
//! Failed credential checks are counted per remote identity over a sliding
//! window. Reaching `max_attempts` inside the window locks the identity out;
//! while locked, attempts are rejected before any credential is looked at.
//! Each further lockout doubles the previous one (capped at `max_lockout`)
//! until a successful authentication clears the identity's history.
//!
//! All state changes happen under one mutex, so concurrent failures from the
//! same identity are applied one after another and never lose an increment.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::config::RateLimitConfig;

/// Hard cap on tracked identities
const MAX_TRACKED_IDENTITIES: usize = 10_000;

/// Per-identity failure history
#[derive(Debug)]
struct AttemptState {
    /// Failure timestamps inside the current window
    failures: VecDeque<Instant>,
    /// End of the active lockout, if any
    locked_until: Option<Instant>,
    /// Lockout growth for repeated violations
    backoff: ExponentialBackoff,
    /// Last time this identity failed
    last_failure: Instant,
}

/// Sliding-window limiter for failed authentication attempts
#[derive(Debug)]
pub struct AuthRateLimiter {
    config: RateLimitConfig,
    state: Mutex<HashMap<String, AttemptState>>,
}

impl AuthRateLimiter {
    /// Create a limiter from config
    pub fn new(config: RateLimitConfig) -> Self {
        AuthRateLimiter {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter key for a peer address; `None` when the peer is exempt
    pub fn identity_for(&self, ip: IpAddr) -> Option<String> {
        if self.config.exempt_loopback && ip.is_loopback() {
            None
        } else {
            Some(ip.to_string())
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.lockout)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.config.max_lockout.max(self.config.lockout))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Whether `identity` may attempt authentication now
    ///
    /// Returns the remaining cooldown when locked out.
    pub fn check(&self, identity: &str) -> Result<(), Duration> {
        self.check_at(identity, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock
    pub fn check_at(&self, identity: &str, now: Instant) -> Result<(), Duration> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.get(identity).and_then(|s| s.locked_until) {
            Some(until) if until > now => Err(until - now),
            _ => Ok(()),
        }
    }

    /// Record a failed attempt; returns the lockout if this failure triggered one
    pub fn record_failure(&self, identity: &str) -> Option<Duration> {
        self.record_failure_at(identity, Instant::now())
    }

    /// [`record_failure`](Self::record_failure) against an explicit clock
    pub fn record_failure_at(&self, identity: &str, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if !state.contains_key(identity) && state.len() >= MAX_TRACKED_IDENTITIES {
            self.prune_locked(&mut state, now);
        }

        let entry = state
            .entry(identity.to_string())
            .or_insert_with(|| AttemptState {
                failures: VecDeque::new(),
                locked_until: None,
                backoff: self.new_backoff(),
                last_failure: now,
            });

        let cutoff = now.checked_sub(self.config.window);
        while let Some(&oldest) = entry.failures.front() {
            if cutoff.is_some_and(|c| oldest <= c) {
                entry.failures.pop_front();
            } else {
                break;
            }
        }

        entry.failures.push_back(now);
        entry.last_failure = now;

        if entry.failures.len() < self.config.max_attempts.max(1) as usize {
            return None;
        }

        let lockout = entry
            .backoff
            .next_backoff()
            .map(|d| Duration::from_millis(d.as_millis() as u64))
            .unwrap_or(self.config.max_lockout);
        entry.locked_until = Some(now + lockout);
        entry.failures.clear();

        tracing::warn!(
            identity = %identity,
            lockout_ms = lockout.as_millis() as u64,
            "auth rate limit triggered"
        );
        Some(lockout)
    }

    /// Successful authentication clears the identity's history and backoff level
    pub fn record_success(&self, identity: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.remove(identity);
    }

    /// Drop identities with no active lockout and no failure in the window
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune_locked(&mut state, Instant::now());
    }

    fn prune_locked(&self, state: &mut HashMap<String, AttemptState>, now: Instant) {
        // Keep the backoff level alive for a full max lockout after the last failure
        let idle = self.config.window + self.config.max_lockout;
        state.retain(|_, s| {
            let locked = s.locked_until.is_some_and(|until| until > now);
            locked || now.saturating_duration_since(s.last_failure) < idle
        });
    }

    /// Number of tracked identities
    pub fn tracked(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AuthRateLimiter {
        AuthRateLimiter::new(RateLimitConfig::default())
    }

    fn fail_n(limiter: &AuthRateLimiter, id: &str, n: u32, now: Instant) -> Option<Duration> {
        let mut last = None;
        for _ in 0..n {
            last = limiter.record_failure_at(id, now);
        }
        last
    }

    #[test]
    fn test_fifth_failure_locks_and_sixth_attempt_is_rejected() {
        let limiter = limiter();
        let now = Instant::now();

        for i in 0..4 {
            assert!(limiter.record_failure_at("1.2.3.4", now).is_none(), "failure {}", i + 1);
            assert!(limiter.check_at("1.2.3.4", now).is_ok());
        }

        let lockout = limiter.record_failure_at("1.2.3.4", now).unwrap();
        assert_eq!(lockout, Duration::from_secs(30));

        let remaining = limiter.check_at("1.2.3.4", now + Duration::from_secs(1)).unwrap_err();
        assert_eq!(remaining, Duration::from_secs(29));
    }

    #[test]
    fn test_evaluation_resumes_after_cooldown() {
        let limiter = limiter();
        let now = Instant::now();
        fail_n(&limiter, "a", 5, now);

        assert!(limiter.check_at("a", now + Duration::from_secs(29)).is_err());
        assert!(limiter.check_at("a", now + Duration::from_secs(30)).is_ok());

        // The window restarts after a lockout
        let later = now + Duration::from_secs(31);
        assert!(limiter.record_failure_at("a", later).is_none());
        assert!(limiter.check_at("a", later).is_ok());
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let limiter = limiter();
        let start = Instant::now();
        fail_n(&limiter, "a", 4, start);

        let after_window = start + Duration::from_secs(61);
        assert!(limiter.record_failure_at("a", after_window).is_none());
        assert!(limiter.check_at("a", after_window).is_ok());
    }

    #[test]
    fn test_lockout_grows_exponentially_and_caps() {
        let limiter = limiter();
        let mut now = Instant::now();
        let mut lockouts = Vec::new();

        for _ in 0..7 {
            let lockout = fail_n(&limiter, "a", 5, now).unwrap();
            lockouts.push(lockout.as_secs());
            now += lockout;
        }

        assert_eq!(lockouts, vec![30, 60, 120, 240, 480, 900, 900]);
    }

    #[test]
    fn test_success_resets_backoff_level() {
        let limiter = limiter();
        let now = Instant::now();
        fail_n(&limiter, "a", 5, now);
        let later = now + Duration::from_secs(30);
        assert_eq!(fail_n(&limiter, "a", 5, later), Some(Duration::from_secs(60)));

        limiter.record_success("a");
        assert!(limiter.check_at("a", later).is_ok());
        assert_eq!(fail_n(&limiter, "a", 5, later), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter();
        let now = Instant::now();
        fail_n(&limiter, "a", 5, now);
        assert!(limiter.check_at("a", now).is_err());
        assert!(limiter.check_at("b", now).is_ok());
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let limiter = std::sync::Arc::new(limiter());
        let now = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.record_failure_at("a", now))
            })
            .collect();
        let locks = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();

        assert_eq!(locks, 1);
        assert!(limiter.check_at("a", now).is_err());
    }

    #[test]
    fn test_loopback_exemption() {
        let config = RateLimitConfig {
            exempt_loopback: true,
            ..RateLimitConfig::default()
        };
        let limiter = AuthRateLimiter::new(config);
        assert!(limiter.identity_for("127.0.0.1".parse().unwrap()).is_none());
        assert_eq!(
            limiter.identity_for("10.0.0.5".parse().unwrap()).as_deref(),
            Some("10.0.0.5")
        );

        let strict = AuthRateLimiter::new(RateLimitConfig::default());
        assert!(strict.identity_for("::1".parse().unwrap()).is_some());
    }

    #[test]
    fn test_cleanup_keeps_locked_identities() {
        let limiter = limiter();
        fail_n(&limiter, "locked", 5, Instant::now());
        limiter.record_failure("recent");
        limiter.cleanup();
        assert_eq!(limiter.tracked(), 2);
    }
}
