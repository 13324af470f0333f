//! Dial-side recovery state: exponential backoff between connect attempts
//! and a breaker that pauses dialing entirely after a failure streak.

use std::time::{Duration, Instant};

use rand::Rng;

// ---------------------------------------------------------------------------
// Exponential backoff with jitter
// ---------------------------------------------------------------------------

pub(crate) struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^attempt`, capped, with
    /// ±25% jitter so a restarted fleet does not dial in lockstep.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let exp = self.base.as_secs_f64() * f64::from(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = rng.gen_range(0.75..1.25);
        Duration::from_secs_f64(capped * jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Dial breaker
// ---------------------------------------------------------------------------

/// After `failure_threshold` consecutive dial failures the breaker opens and
/// `can_dial` stays false for `open_for`. The first dial after that window is
/// a probe: one more failure re-opens immediately, one success closes.
pub(crate) struct DialBreaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probing: bool,
    pub failure_threshold: u32,
    pub open_for: Duration,
}

impl DialBreaker {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
            probing: false,
            failure_threshold: 8,
            open_for: Duration::from_secs(30),
        }
    }

    pub fn can_dial(&mut self) -> bool {
        match self.opened_at {
            None => true,
            Some(at) => {
                if at.elapsed() >= self.open_for {
                    self.probing = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probing = false;
    }

    pub fn record_failure(&mut self) {
        if self.probing {
            // failed probe: straight back to open
            self.opened_at = Some(Instant::now());
            self.probing = false;
            return;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some() && !self.probing
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = SmallRng::seed_from_u64(1);
        let d0 = b.next_delay(&mut rng);
        let d3 = {
            b.next_delay(&mut rng);
            b.next_delay(&mut rng);
            b.next_delay(&mut rng)
        };
        assert!(d0 < Duration::from_secs(2));
        assert!(d3 > d0);
        for _ in 0..20 {
            let d = b.next_delay(&mut rng);
            assert!(d <= Duration::from_secs_f64(30.0 * 1.25));
        }
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = SmallRng::seed_from_u64(2);
        for _ in 0..6 {
            b.next_delay(&mut rng);
        }
        b.reset();
        assert!(b.next_delay(&mut rng) < Duration::from_secs(2));
    }

    #[test]
    fn breaker_opens_after_streak() {
        let mut br = DialBreaker::new();
        assert!(br.can_dial());
        for _ in 0..8 {
            br.record_failure();
        }
        assert!(br.is_open());
        assert!(!br.can_dial());
    }

    #[test]
    fn breaker_probe_failure_reopens() {
        let mut br = DialBreaker {
            open_for: Duration::from_millis(1),
            ..DialBreaker::new()
        };
        for _ in 0..8 {
            br.record_failure();
        }
        std::thread::sleep(Duration::from_millis(2));
        assert!(br.can_dial()); // probe allowed
        br.record_failure();
        assert!(!br.can_dial()); // straight back to open
    }

    #[test]
    fn breaker_probe_success_closes() {
        let mut br = DialBreaker {
            open_for: Duration::from_millis(1),
            ..DialBreaker::new()
        };
        for _ in 0..8 {
            br.record_failure();
        }
        std::thread::sleep(Duration::from_millis(2));
        assert!(br.can_dial());
        br.record_success();
        assert!(br.can_dial());
        assert!(!br.is_open());
    }
}
