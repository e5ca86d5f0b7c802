use std::time::{Duration, Instant};

/// Token bucket metering bytes per second. Callers acquire what they are
/// about to copy and sleep for the returned duration; a single large
/// acquisition may run the bucket into debt that later calls pay off.
pub struct RateLimiter {
  bytes_per_sec: u64,
  available: f64,
  last_refill: Instant,
}

impl RateLimiter {
  /// A rate of 0 disables limiting.
  pub fn new(bytes_per_sec: u64) -> Self {
    RateLimiter {
      bytes_per_sec,
      available: bytes_per_sec as f64,
      last_refill: Instant::now(),
    }
  }

  pub fn is_unlimited(&self) -> bool {
    self.bytes_per_sec == 0
  }

  fn refill(&mut self, now: Instant) {
    let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
    self.available =
      (self.available + elapsed * self.bytes_per_sec as f64).min(self.bytes_per_sec as f64);
    self.last_refill = now;
  }

  /// Takes `bytes` from the bucket, returning how long to wait before using them.
  pub fn acquire(&mut self, bytes: u64) -> Duration {
    self.acquire_at(bytes, Instant::now())
  }

  fn acquire_at(&mut self, bytes: u64, now: Instant) -> Duration {
    if self.is_unlimited() {
      return Duration::ZERO;
    }
    self.refill(now);
    self.available -= bytes as f64;
    if self.available >= 0.0 {
      Duration::ZERO
    } else {
      Duration::from_secs_f64(-self.available / self.bytes_per_sec as f64)
    }
  }
}
