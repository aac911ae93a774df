//! Per-route token-bucket rate limiter fed by service response headers.
//!
//! Buckets are keyed by token + route template so every credential gets
//! its own budget per route. A bucket's mutex is held from acquire until
//! the response headers are handed back, serializing concurrent calls on
//! the same `(token, route)`. A `Retry-After` marked global pauses every
//! bucket in the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Slack added to every rate-limit sleep so we never race the reset.
pub const EXTRA_DELAY: Duration = Duration::from_millis(250);

const HEADER_GLOBAL: &str = "X-RateLimit-Global";
const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
const HEADER_RESET: &str = "X-RateLimit-Reset";
const HEADER_RETRY_AFTER: &str = "Retry-After";

#[derive(Debug)]
struct Bucket {
    remaining: u64,
    reset_at: Option<Instant>,
}

/// Holds a bucket locked between [`Limiter::acquire`] and
/// [`Limiter::release`]. Dropping the permit unlocks without updating
/// bucket state.
pub struct Permit {
    bucket: OwnedMutexGuard<Bucket>,
}

#[derive(Debug, Default)]
pub struct Limiter {
    global_pause: StdMutex<Option<Instant>>,
    buckets: StdMutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl Limiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a slot for one request on `bucket_key`, sleeping through any
    /// active global pause or exhausted-bucket reset window first.
    pub async fn acquire(&self, bucket_key: &str) -> Permit {
        let pause = *self.global_pause.lock().unwrap();
        if let Some(at) = pause {
            if at > Instant::now() {
                debug!(bucket = bucket_key, "waiting out global rate limit");
                sleep_until(at + EXTRA_DELAY).await;
            }
        }

        let bucket = {
            let mut buckets = self.buckets.lock().unwrap();
            buckets
                .entry(bucket_key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket {
                        remaining: 1,
                        reset_at: None,
                    }))
                })
                .clone()
        };
        let mut guard = bucket.lock_owned().await;

        if guard.remaining == 0 {
            if let Some(reset) = guard.reset_at {
                if reset > Instant::now() {
                    debug!(bucket = bucket_key, "bucket exhausted, waiting for reset");
                    sleep_until(reset + EXTRA_DELAY).await;
                }
            }
        }
        if guard.remaining > 0 {
            guard.remaining -= 1;
        }

        Permit { bucket: guard }
    }

    /// Returns the slot, folding the response's rate-limit headers into
    /// the bucket. `None` headers mean the request never completed; the
    /// bucket is unlocked untouched.
    pub fn release(&self, permit: Permit, headers: Option<&HeaderMap>) {
        let mut bucket = permit.bucket;
        let Some(headers) = headers else {
            return;
        };

        if let Some(seconds) = header_value(headers, HEADER_RETRY_AFTER).and_then(|v| v.parse::<u64>().ok()) {
            let at = Instant::now() + Duration::from_secs(seconds);
            let global = header_value(headers, HEADER_GLOBAL).is_some_and(|v| !v.is_empty());
            if global {
                debug!(seconds, "global rate limit hit");
                *self.global_pause.lock().unwrap() = Some(at);
            } else {
                bucket.reset_at = Some(at);
            }
        } else if let Some(unix) = header_value(headers, HEADER_RESET).and_then(|v| v.parse::<f64>().ok()) {
            bucket.reset_at = instant_at_unix(unix).map(|at| at + EXTRA_DELAY);
        }

        if let Some(remaining) = header_value(headers, HEADER_REMAINING).and_then(|v| v.parse::<u64>().ok()) {
            bucket.remaining = remaining;
        }
    }
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Maps a unix timestamp from a reset header onto the monotonic clock.
/// A timestamp already in the past imposes no wait.
fn instant_at_unix(unix: f64) -> Option<Instant> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
    let delta = unix - now;
    if delta <= 0.0 {
        None
    } else {
        Some(Instant::now() + Duration::from_secs_f64(delta))
    }
}
