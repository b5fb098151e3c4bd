use std::time::Duration;

/// Exponential reconnect delay: the Nth consecutive retry waits
/// `min(base * 2^(N-1), cap)`. The reported attempt stops at `ceiling`, the
/// exponent keeps growing until the cap is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    ceiling: u32,
    attempt: u32,
    exponent: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration, ceiling: u32) -> Self {
        Self {
            base,
            cap: cap.max(base),
            ceiling,
            attempt: 0,
            exponent: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn at_ceiling(&self) -> bool {
        self.attempt >= self.ceiling
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay for the next reconnect; advances the attempt counter up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.exponent);
        if delay < self.cap {
            self.exponent += 1;
        }
        self.attempt = (self.attempt + 1).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.exponent = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nth_delay_doubles_until_cap() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(10), 8);
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000, 10_000]
        );
    }

    #[test]
    fn low_ceiling_still_grows_delay_to_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 3);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
        assert_eq!(backoff.attempt(), 3);
        assert!(backoff.at_ceiling());
    }

    #[test]
    fn attempt_never_exceeds_ceiling() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 3);
        for _ in 0..20 {
            backoff.next_delay();
            assert!(backoff.attempt() <= 3);
        }
        assert!(backoff.at_ceiling());
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempts_saturate_at_cap() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 64);
        assert_eq!(backoff.delay_for(40), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(63), Duration::from_secs(30));
    }
}
