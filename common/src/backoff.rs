use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry schedule used for worker restarts and target daemon reconnects.
///
/// Delays double from `base_ms` up to `max_ms`, with up to `jitter_ms` of
/// random delay added. `max_attempts == 0` means retry forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
    /// A run that lasted at least this long resets the attempt counter.
    pub cooldown_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base_ms: 1_000,
            max_ms: 60_000,
            jitter_ms: 250,
            max_attempts: 5,
            cooldown_ms: 120_000,
        }
    }
}

impl BackoffPolicy {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffResult {
    /// Wait for the given duration and then try again.
    StartAfter(Duration),
    /// The attempt budget is spent.
    Stop,
}

/// Tracks consecutive failed attempts against a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    attempts: u32,
    running_since: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        ExponentialBackoff {
            policy,
            attempts: 0,
            running_since: None,
        }
    }

    /// Number of failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.running_since = None;
    }

    /// Mark the start of a successful run. If the run lasts past the
    /// cool-down period, the next failure starts from the base delay again.
    pub fn start_run(&mut self) {
        self.running_since = Some(Instant::now());
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one.
    pub fn end_attempt_failed(&mut self) -> BackoffResult {
        if let Some(since) = self.running_since.take()
            && since.elapsed() >= self.policy.cooldown()
        {
            self.attempts = 0;
        }

        self.attempts = self.attempts.saturating_add(1);
        if self.policy.max_attempts != 0 && self.attempts > self.policy.max_attempts {
            return BackoffResult::Stop;
        }
        BackoffResult::StartAfter(self.delay_for(self.attempts))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let exp = self.policy.base_ms.saturating_mul(1u64 << shift);
        let capped = exp.min(self.policy.max_ms);
        let jitter = if self.policy.jitter_ms > 0 {
            rand::rng().random_range(0..=self.policy.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}
