use std::time::Duration;

use rand::Rng;

const DEFAULT_FACTOR: f64 = 2.0;

/// Exponentially growing delays: `base * factor^(attempt - 1)`, optionally jittered and always
/// capped at `max`.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<Duration> = Exponential::new(Duration::from_millis(100), Duration::from_secs(1))
///     .max_attempts(4)
///     .collect();
/// assert_eq!(delays.len(), 4);
/// assert_eq!(delays[3], Duration::from_millis(800));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    max: Duration,
    factor: f64,
    /// Between 0.0 and 1.0; the delay is scaled by a random value in `[1 - jitter, 1 + jitter]`.
    jitter: f64,
    /// `None` retries forever.
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: DEFAULT_FACTOR,
            jitter: 0.0,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u16 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay(&self, attempt: u16) -> Duration {
        // attempt is at least 1 here, powi(-1) would shrink the base.
        let exponent = i32::from(attempt.max(1) - 1);
        let mut delay_ms = self.base.as_millis() as f64 * self.factor.powi(exponent);

        if self.jitter > 0.0 {
            delay_ms *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }

        if !delay_ms.is_finite() || delay_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(delay_ms as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.attempt >= max_attempts
        {
            return None;
        }

        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}
