use std::time::Duration;

use rand::Rng;

use crate::core::config::Settings;
use crate::db::types::FailureKind;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) jitter_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RetryDecision {
    Continue { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        let submission = settings.submission();
        Self {
            max_attempts: submission.max_attempts,
            base_delay: Duration::from_secs(submission.retry_base_delay_seconds),
            max_delay: Duration::from_secs(submission.retry_max_delay_seconds),
            jitter_ratio: submission.retry_jitter_ratio,
        }
    }

    pub(crate) fn decide(&self, kind: FailureKind, attempt_count: u32) -> RetryDecision {
        self.decide_with(kind, attempt_count, &mut rand::thread_rng())
    }

    /// `attempt_count` is the number of attempts already started, including the failed one.
    pub(crate) fn decide_with<R: Rng + ?Sized>(
        &self,
        kind: FailureKind,
        attempt_count: u32,
        rng: &mut R,
    ) -> RetryDecision {
        if kind == FailureKind::Permanent || attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Continue { delay: self.jittered(self.backoff(attempt_count), rng) }
    }

    /// Un-jittered delay after the `attempt_count`-th attempt: base * 2^(n-1), capped.
    pub(crate) fn backoff(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(30);
        self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }

    fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = rng.gen_range((1.0 - self.jitter_ratio)..=(1.0 + self.jitter_ratio));
        delay.mul_f64(factor).min(self.max_delay)
    }
}
