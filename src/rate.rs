//! Global transfer rate limiting.
//!
//! One token bucket per direction, shared by every torrent in the engine.
//! Buckets are only ever touched from the owning task's loop, so they need
//! no internal synchronization; peer sessions consult them through the
//! torrent on each send/receive boundary.

use std::time::Instant;

#[cfg(test)]
use std::time::Duration;

/// A token bucket: capacity refills continuously at the configured rate and
/// is spent as bytes move. An empty bucket defers the transfer, it never
/// drops it.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens the bucket holds; also the refill rate in bytes per
    /// second.
    rate: u64,
    /// Currently available tokens.
    tokens: f64,
    /// When the bucket was last refilled.
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            // start full so the first transfers aren't delayed
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        self.last_refill = now;
    }

    /// Attempts to spend `bytes` tokens. Returns true when the claim fits;
    /// on false nothing is spent and the caller should mark itself
    /// send-blocked until [`TokenBucket::next_refill_in`].
    pub fn try_claim(&mut self, bytes: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

}

/// The engine's shared pair of buckets. `None` in a direction means that
/// direction is unlimited.
#[derive(Debug, Default)]
pub struct RateLimiter {
    download: Option<TokenBucket>,
    upload: Option<TokenBucket>,
}

impl RateLimiter {
    pub fn new(download: Option<u64>, upload: Option<u64>) -> Self {
        Self {
            download: download.map(TokenBucket::new),
            upload: upload.map(TokenBucket::new),
        }
    }

    /// Claims download budget; an unlimited direction always succeeds.
    pub fn claim_download(&mut self, bytes: u64) -> bool {
        match &mut self.download {
            Some(bucket) => bucket.try_claim(bytes, Instant::now()),
            None => true,
        }
    }

    /// Claims upload budget; an unlimited direction always succeeds.
    pub fn claim_upload(&mut self, bytes: u64) -> bool {
        match &mut self.upload {
            Some(bucket) => bucket.try_claim(bytes, Instant::now()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_drain_the_bucket() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(100);
        assert!(bucket.try_claim(60, now));
        assert!(bucket.try_claim(40, now));
        // the bucket is empty now, at the same instant
        assert!(!bucket.try_claim(1, now));
    }

    #[test]
    fn test_refill_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1000);
        assert!(bucket.try_claim(1000, start));
        assert!(!bucket.try_claim(500, start));

        // half a second later, half the rate has refilled
        let later = start + Duration::from_millis(500);
        assert!(bucket.try_claim(500, later));
        assert!(!bucket.try_claim(100, later));
    }

    #[test]
    fn test_refill_caps_at_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100);
        // a long idle period must not bank more than one second of rate
        let much_later = start + Duration::from_secs(3600);
        assert!(bucket.try_claim(100, much_later));
        assert!(!bucket.try_claim(1, much_later));
    }

    #[test]
    fn test_unlimited_directions() {
        let mut limiter = RateLimiter::new(None, Some(1));
        assert!(limiter.claim_download(u64::MAX / 2));
        assert!(limiter.claim_upload(1));
        assert!(!limiter.claim_upload(u64::MAX / 2));
    }
}
