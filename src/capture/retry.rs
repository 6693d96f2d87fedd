// Retry and rate-limit policy for the frame scheduler.
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::errors::GuidedFixError;

/// What the scheduler should do after an analysis failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Try again on a later tick.
    Retry,
    /// The budget is spent; surface a recoverable error.
    Exhausted { failures: u32 },
    /// Not worth retrying. Only configuration-level errors land here.
    Fatal,
}

pub struct RetryController {
    max_failures: u32,
    max_backoff: u32,
    min_spacing: Duration,
    failure_count: u32,
    backoff: u32,
}

impl RetryController {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_failures: config.max_consecutive_failures.max(1),
            max_backoff: config.max_backoff_multiplier.max(1),
            min_spacing: Duration::from_millis(config.min_spacing_ms),
            failure_count: 0,
            backoff: 1,
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        // Halve back toward the configured cadence.
        self.backoff = (self.backoff / 2).max(1);
    }

    pub fn record_failure(&mut self, err: &GuidedFixError) -> FailureVerdict {
        match err {
            // Rate limits slow the cadence and never count toward exhaustion.
            GuidedFixError::RateLimited { retry_after_secs } => {
                self.backoff = (self.backoff * 2).min(self.max_backoff);
                if let Some(secs) = retry_after_secs {
                    let wanted = Duration::from_secs(*secs).as_millis();
                    let base = self.min_spacing.as_millis().max(1);
                    let needed = wanted.div_ceil(base) as u32;
                    self.backoff = self.backoff.max(needed).min(self.max_backoff);
                }
                FailureVerdict::Retry
            }
            e if e.is_transient() => {
                self.failure_count += 1;
                if self.failure_count >= self.max_failures {
                    let failures = self.failure_count;
                    self.failure_count = 0;
                    FailureVerdict::Exhausted { failures }
                } else {
                    FailureVerdict::Retry
                }
            }
            _ => FailureVerdict::Fatal,
        }
    }

    /// Minimum spacing between analyses, widened by any rate-limit backoff.
    pub fn effective_spacing(&self) -> Duration {
        self.min_spacing * self.backoff
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}
