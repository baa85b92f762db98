//! Token bucket rate limiter shared by all workers.

use std::{sync::Mutex, time::Duration};

use tokio::time::{Instant, sleep};

/// Token bucket with a dynamically updatable rate.
///
/// The bucket maintains a floating point token count.
/// Tokens refill continuously at `rate` per second, capped by the burst size.
/// Emitting a request consumes one token.
/// If there is not enough token balance, the waiter sleeps until at least one
/// token should be available, in bounded slices so a concurrent
/// [`RateLimiter::set_rate`] is observed before the next grant rather than
/// after the stale sleep would have ended. Waiter state is never reset by a
/// rate change.
///
/// The burst size is derived from the rate as `max(1, floor(rate / 10))`.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

/// Upper bound on a single sleep so rate changes propagate promptly.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

fn burst_for(rate: f64) -> f64 {
    (rate / 10.0).floor().max(1.0)
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        let rate = rate.max(1.0);
        let capacity = burst_for(rate);
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                capacity,
                tokens: capacity,
                last: Instant::now(),
            }),
        }
    }

    /// Installs a new rate and the derived burst. In-flight waiters pick the
    /// new rate up on their next refill pass.
    pub fn set_rate(&self, rate: f64) {
        let rate = rate.max(1.0);
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.rate = rate;
        bucket.capacity = burst_for(rate);
        bucket.tokens = bucket.tokens.min(bucket.capacity);
    }

    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    /// Blocks until one token is available, then consumes it.
    ///
    /// Not cancellation-aware by itself; callers race it against their
    /// shutdown guard.
    pub async fn wait(&self) {
        loop {
            let wait = {
                let mut bucket = self.lock();
                bucket.refill(Instant::now());

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }

                let missing = 1.0 - bucket.tokens;
                Duration::from_secs_f64(missing / bucket.rate)
            };

            let wait = wait.min(MAX_WAIT_SLICE);
            // Guard against sleeping for zero when we still need to wait.
            let wait = if wait.is_zero() {
                Duration::from_nanos(1)
            } else {
                wait
            };

            sleep(wait).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let dt = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + dt * self.rate).min(self.capacity);
    }
}
