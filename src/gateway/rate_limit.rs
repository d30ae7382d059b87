//! Keyed fixed-window rate limiting.
//!
//! Keys are free-form strings. The gateway uses `api:<caller>` or
//! `gateway:<server>` for tool calls and `login:<ip>` for authentication attempts.
//! Buckets are created on first use and live for the life of the process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
}

/// Shared quota tracker. Construct one per concern and share it behind an `Arc`.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        // Counters stay meaningful even if a holder panicked.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admits the call if `key` has used fewer than `limit` calls in the current window.
    pub fn allow(&self, key: &str, limit: u32, window: Duration) -> bool {
        self.check_and_record(key, limit, window).is_ok()
    }

    /// Like [`allow`](Self::allow), but a rejection carries the time left until
    /// the window resets.
    pub fn check_and_record(&self, key: &str, limit: u32, window: Duration) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets();

        if let Some(bucket) = buckets.get_mut(key) {
            let elapsed = now.saturating_duration_since(bucket.window_start);
            if elapsed < window {
                if bucket.count >= limit {
                    return Err(window - elapsed);
                }
                bucket.count += 1;
                return Ok(());
            }
        }

        if limit == 0 {
            return Err(window);
        }
        buckets.insert(
            key.to_string(),
            Bucket {
                count: 1,
                window_start: now,
            },
        );
        Ok(())
    }

    /// Reports whether `key` is currently over quota without recording a call.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> Result<(), Duration> {
        let now = Instant::now();
        let buckets = self.buckets();
        match buckets.get(key) {
            Some(bucket) => {
                let elapsed = now.saturating_duration_since(bucket.window_start);
                if elapsed < window && bucket.count >= limit {
                    Err(window - elapsed)
                } else {
                    Ok(())
                }
            }
            None if limit == 0 => Err(window),
            None => Ok(()),
        }
    }

    /// Calls recorded for `key` in its current window.
    pub fn usage(&self, key: &str) -> Option<u32> {
        self.buckets().get(key).map(|b| b.count)
    }
}
