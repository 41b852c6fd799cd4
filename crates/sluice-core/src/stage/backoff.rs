//! Backoff policy applied when a stage reports `ComeBackLater`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use super::{StageId, StageKnobs};

/// Growth policy for consecutive backoff waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackoffStrategy {
    /// Every wait is the initial backoff time.
    Constant,
    /// Wait `k` grows as `initial * k`.
    Linear,
    /// Wait `k` grows as `initial * 2^(k-1)`.
    Exponential,
}

impl BackoffStrategy {
    /// Wait before retry `attempt` (1-based).
    #[must_use]
    pub fn delay(self, initial: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Constant => initial,
            BackoffStrategy::Linear => initial.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                initial.saturating_mul(factor)
            }
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Constant => write!(f, "constant"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constant" => Ok(BackoffStrategy::Constant),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!(
                "unknown backoff strategy '{other}' (expected constant, linear or exponential)"
            )),
        }
    }
}

/// Backoff progress of one worker on one stage.
///
/// Created when a worker picks up a stage and discarded when it yields the
/// stage back to the scheduler. A `Success` resets it.
#[derive(Debug, Clone)]
pub struct BackoffState {
    stage: StageId,
    strategy: BackoffStrategy,
    initial: Duration,
    checkin: Duration,
    tries: u32,
    attempt: u32,
    last_delay: Duration,
}

impl BackoffState {
    /// Starts a fresh backoff sequence from the stage's knobs.
    #[must_use]
    pub fn new(stage: StageId, knobs: &StageKnobs) -> Self {
        Self {
            stage,
            strategy: knobs.backoff_strategy,
            initial: knobs.initial_backoff,
            checkin: knobs.checkin_time,
            tries: knobs.backoff_tries,
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Advances to the next attempt and returns how long to wait before it.
    ///
    /// Returns `None` once `tries` escalations have been used; the worker
    /// must then yield the stage. Waits never exceed the check-in time.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.tries {
            return None;
        }
        self.attempt += 1;
        let delay = self.strategy.delay(self.initial, self.attempt);
        self.last_delay = if self.checkin.is_zero() {
            delay
        } else {
            delay.min(self.checkin)
        };
        Some(self.last_delay)
    }

    /// Clears the attempt counter after useful work.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Stage this state belongs to.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Number of escalations used so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Most recent wait handed out.
    #[must_use]
    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }

    /// True once no escalations remain.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.tries
    }
}
