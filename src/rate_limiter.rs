//! Token-bucket throttle for outbound exchange requests.
//!
//! Bursts up to `max_tokens`, sustains `refill_per_sec`. Waiters poll on a fixed
//! sleep instead of being woken on refill.

use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::{CancelToken, Cancelled};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_tokens: u32,
    pub refill_per_sec: u32,
    pub poll_interval_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        // Binance allows ~20 req/s per IP; stay below it.
        Self {
            max_tokens: 15,
            refill_per_sec: 15,
            poll_interval_ms: 50,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(BucketState {
                tokens: cfg.max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.cfg
    }

    /// Blocks until a token is available and consumes it.
    pub fn wait(&self) {
        // A fresh token is never cancelled, so this cannot fail.
        let _ = self.wait_cancellable(&CancelToken::new());
    }

    /// Like [`RateLimiter::wait`], but gives up once `cancel` is set.
    pub fn wait_cancellable(&self, cancel: &CancelToken) -> Result<(), Cancelled> {
        let mut polls = 0u64;
        loop {
            cancel.check()?;
            if self.try_acquire() {
                break;
            }
            polls += 1;
            sleep(self.poll_interval());
        }
        if polls > 0 {
            debug!(
                component = "rate_limiter",
                event = "rate_limiter.throttled",
                polls,
                poll_interval_ms = self.cfg.poll_interval_ms
            );
        }
        Ok(())
    }

    /// Refills, then takes one token if any is available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&self) -> u32 {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let to_add = (elapsed * f64::from(self.cfg.refill_per_sec)).floor() as u64;
        if to_add > 0 {
            let refilled = u64::from(state.tokens).saturating_add(to_add);
            state.tokens = refilled.min(u64::from(self.cfg.max_tokens)) as u32;
            state.last_refill = now;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        // Token accounting stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cfg.poll_interval_ms.max(1))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn limiter(max_tokens: u32, refill_per_sec: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_tokens,
            refill_per_sec,
            poll_interval_ms: 5,
        })
    }

    #[test]
    fn burst_up_to_capacity_is_immediate() {
        let rl = limiter(5, 0);
        let started = Instant::now();
        for _ in 0..5 {
            rl.wait();
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!rl.try_acquire());
    }

    #[test]
    fn sustained_rate_is_bounded_by_refill() {
        // N = 10 waits at R = 5: at least ceil((10 - 5) / 5) = 1 second.
        let rl = limiter(5, 5);
        let started = Instant::now();
        for _ in 0..10 {
            rl.wait();
        }
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn tokens_never_exceed_capacity_after_idle() {
        let rl = limiter(3, 100);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(rl.available_tokens(), 3);
    }

    #[test]
    fn concurrent_callers_never_overdraw_the_bucket() {
        let rl = Arc::new(limiter(4, 0));
        let acquired = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                let acquired = Arc::clone(&acquired);
                thread::spawn(move || {
                    if rl.try_acquire() {
                        acquired.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(acquired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn cancelled_wait_returns_without_consuming() {
        let rl = limiter(1, 1);
        rl.wait();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(rl.wait_cancellable(&cancel), Err(Cancelled));
    }
}
