//! Delay schedule between retries of one outbound call.
//!
//! The default schedule is exponential: the delay is multiplied after each
//! retry, capped at `max_delay`. A server-provided hint (`Retry-After`)
//! replaces the schedule's value for that retry but still counts as an
//! attempt, so hints can never extend the number of retries.
use std::time::Duration;

use crate::config::ResilienceConfig;

pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Retries handed out so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.backoff_multiplier,
        )
    }

    /// Returns the delay before the next retry and advances the schedule.
    /// `hint` wins over the schedule when present.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let scheduled = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        hint.unwrap_or(scheduled)
    }

    /// Returns true once `max` retries have been handed out.
    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}
