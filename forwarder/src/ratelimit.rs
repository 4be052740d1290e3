//! Token-bucket admission check.
//!
//! One shared limiter for the whole listener; no per-client
//! partitioning. The bucket is expressed in virtual time (the GCRA
//! formulation of a token bucket): a single atomic carries the
//! theoretical arrival time of the next conforming request, so the hot
//! path is one compare-and-swap and never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Stand-in emission interval when the refill rate is zero or negative:
/// long enough that the bucket never refills in practice, small enough
/// that a full burst of tolerance still fits in a `u64` of nanoseconds.
const NEVER_NANOS: u64 = 1_000_000_000_000_000;

pub struct RateLimiter {
    bucket: Option<Bucket>,
}

impl RateLimiter {
    /// A disabled limiter admits everything.
    pub fn new(enabled: bool, rps: f64, burst: u64) -> Self {
        Self {
            bucket: enabled.then(|| Bucket::new(rps, burst)),
        }
    }

    pub fn allow(&self) -> bool {
        match &self.bucket {
            Some(bucket) => bucket.admit(),
            None => true,
        }
    }
}

struct Bucket {
    /// Nanoseconds of virtual time one request costs (1/rate).
    interval: u64,
    /// How far the schedule may run ahead of the clock: `(burst - 1)`
    /// intervals, so a fresh bucket admits exactly `burst` requests
    /// back to back.
    tolerance: u64,
    burst: u64,
    /// Theoretical arrival time of the next conforming request, in
    /// nanoseconds since `epoch`.
    schedule: AtomicU64,
    epoch: Instant,
}

impl Bucket {
    fn new(rps: f64, burst: u64) -> Self {
        let interval = if rps > 0.0 {
            (1_000_000_000f64 / rps) as u64
        } else {
            NEVER_NANOS
        };

        Self {
            interval,
            tolerance: interval.saturating_mul(burst.saturating_sub(1)),
            burst,
            schedule: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn admit(&self) -> bool {
        if self.burst == 0 {
            return false;
        }
        let now = self.epoch.elapsed().as_nanos() as u64;

        loop {
            let scheduled = self.schedule.load(Ordering::Relaxed);
            // A schedule in the past collapses to the present; unused
            // capacity does not accumulate beyond the burst.
            let conforming = scheduled.max(now);
            if conforming - now > self.tolerance {
                return false;
            }

            let next = conforming.saturating_add(self.interval);
            if self
                .schedule
                .compare_exchange_weak(scheduled, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(false, 0.0, 0);
        for _ in 0..10_000 {
            assert!(limiter.allow());
        }
    }

    #[test]
    fn admits_up_to_burst() {
        let limiter = RateLimiter::new(true, 0.0, 5);
        for _ in 0..5 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
    }

    #[test]
    fn zero_burst_rejects_all() {
        let limiter = RateLimiter::new(true, 1000.0, 0);
        assert!(!limiter.allow());
    }

    #[test]
    fn fractional_rates_are_respected() {
        // Half a request per second: a burst of 2, then nothing until
        // two more seconds have passed.
        let limiter = RateLimiter::new(true, 0.5, 2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(true, 1000.0, 1);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.allow());
    }

    #[test]
    fn concurrent_acquires_never_exceed_burst() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(true, 0.0, 100));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                (0..50).filter(|_| limiter.allow()).count()
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}
