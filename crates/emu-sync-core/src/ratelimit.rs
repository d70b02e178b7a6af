//! Shared token-bucket throughput limiter
//!
//! One [`RateLimiter`] is shared by every concurrent transfer, so the cap
//! applies to aggregate throughput rather than to each stream separately.

use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Largest read a [`Throttled`] stream performs in one call
pub const MAX_CHUNK: usize = 64 * 1024;

/// Token bucket holding at most one second of throughput.
///
/// Consumers reserve tokens up front; when the bucket runs dry the balance
/// goes negative and each consumer sleeps off its own share of the debt.
/// Later consumers see the debt and wait longer, which keeps the aggregate
/// rate at `rate` no matter how many streams share the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `bytes_per_sec` bytes per second.
    ///
    /// The bucket starts full. A rate of zero is treated as one byte per
    /// second rather than blocking forever.
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1);
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                available: rate as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Block until `n` bytes of capacity are available, then debit them.
    pub fn consume(&self, n: usize) {
        if n == 0 {
            return;
        }
        let wait = {
            let mut bucket = self
                .bucket
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last).as_secs_f64();
            bucket.last = now;
            let rate = self.rate as f64;
            bucket.available = (bucket.available + elapsed * rate).min(rate);
            bucket.available -= n as f64;
            if bucket.available >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.available / rate)
        };
        // Sleep outside the lock so sibling streams can queue their debt
        thread::sleep(wait);
    }
}

/// A reader whose throughput is charged against a shared [`RateLimiter`]
#[derive(Debug)]
pub struct Throttled<R> {
    inner: R,
    limiter: Arc<RateLimiter>,
}

impl<R: Read> Throttled<R> {
    pub fn new(inner: R, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

impl<R: Read> Read for Throttled<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let cap = buf.len().min(MAX_CHUNK);
        let n = self.inner.read(&mut buf[..cap])?;
        self.limiter.consume(n);
        Ok(n)
    }
}

/// Wrap `reader` in a throttle when a limiter is configured.
pub fn maybe_throttle<'a, R: Read + Send + 'a>(
    reader: R,
    limiter: Option<&Arc<RateLimiter>>,
) -> Box<dyn Read + Send + 'a> {
    match limiter {
        Some(limiter) => Box::new(Throttled::new(reader, Arc::clone(limiter))),
        None => Box::new(reader),
    }
}
