use std::time::Duration;

/// Reconnection delay: starts at `initial`, doubles after every failed
/// attempt, never exceeds `max`, and goes back to `initial` once a
/// connection succeeds.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    /// Delay for the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempt += 1;
        delay
    }

    /// Consecutive attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_doubles_up_to_cap() {
        let mut b = Backoff::default();
        let seq: Vec<Duration> = (0..8).map(|_| b.next_delay()).collect();
        assert_eq!(
            seq,
            vec![ms(1000), ms(2000), ms(4000), ms(8000), ms(16000), ms(30000), ms(30000), ms(30000)]
        );
        assert_eq!(b.attempt(), 8);
    }

    #[test]
    fn test_reset_after_success() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), ms(1000));
        assert_eq!(b.next_delay(), ms(2000));
    }

    #[test]
    fn test_max_below_initial_is_raised() {
        let mut b = Backoff::new(ms(500), ms(100));
        assert_eq!(b.next_delay(), ms(500));
        assert_eq!(b.next_delay(), ms(500));
    }
}
