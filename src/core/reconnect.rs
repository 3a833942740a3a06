use crate::core::config::AutoReconnectOptions;
use std::time::Duration;

impl AutoReconnectOptions {
    /// Compute the delay before reconnect attempt `attempt` (0-based).
    ///
    /// `jitter` must be a uniform sample from `[0, 1)`; the socket draws it
    /// from its own long-lived PRNG. When `initial_override` is given and
    /// this is the first attempt, it is used verbatim. The result is always
    /// clamped to `max_delay`.
    pub fn delay_for(
        &self,
        attempt: u32,
        jitter: f64,
        initial_override: Option<Duration>,
    ) -> Duration {
        let millis = match initial_override {
            Some(initial) if attempt == 0 => initial.as_millis() as u64,
            _ => {
                let base = (self.initial_delay.as_millis() as f64
                    + self.randomness.as_millis() as f64 * jitter)
                    .round();
                // Saturating float->int cast keeps huge exponents at the cap.
                (base * self.multiplier.powf(f64::from(attempt))).round() as u64
            }
        };

        Duration::from_millis(millis.min(self.max_delay.as_millis() as u64))
    }
}
