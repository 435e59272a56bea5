// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

//! Attempt-budgeted exponential backoff with optional jitter.

use std::time::Duration;

use rand::thread_rng;
use rand::Rng;

/// The default backoff for routing retries (region refresh, leader probe).
pub const DEFAULT_REGION_BACKOFF: Backoff = Backoff::equal_jitter_backoff(2, 500, 10);

/// A deterministic variant for callers that need reproducible pacing.
pub const DEFAULT_NO_JITTER_BACKOFF: Backoff = Backoff::no_jitter_backoff(2, 500, 10);

/// When a request is retried, we can backoff for some time to avoid
/// saturating the cluster with failing requests.
///
/// `Backoff` is an object which determines how long to wait for.
#[derive(Clone, Debug)]
pub struct Backoff {
    kind: BackoffKind,
    current_attempts: u32,
    max_attempts: u32,
    base_delay_ms: u64,
    current_delay_ms: u64,
    max_delay_ms: u64,
}

impl Backoff {
    /// The number of attempts made so far.
    pub fn current_attempts(&self) -> u32 {
        self.current_attempts
    }

    /// True if no delay is ever returned.
    pub fn is_none(&self) -> bool {
        self.kind == BackoffKind::None
    }

    /// Returns the delay to wait before the next attempt, or `None` if the
    /// attempt budget is exhausted.
    pub fn next_delay_duration(&mut self) -> Option<Duration> {
        if self.current_attempts >= self.max_attempts {
            return None;
        }
        self.current_attempts += 1;

        match self.kind {
            BackoffKind::None => None,
            BackoffKind::NoJitter => {
                let delay_ms = self.saturating_exp_delay();
                self.current_delay_ms = delay_ms;
                Some(Duration::from_millis(delay_ms))
            }
            BackoffKind::FullJitter => {
                let cap_ms = self.saturating_exp_delay();
                self.current_delay_ms = cap_ms;
                let delay_ms = thread_rng().gen_range(0..=cap_ms);
                Some(Duration::from_millis(delay_ms))
            }
            BackoffKind::EqualJitter => {
                let cap_ms = self.saturating_exp_delay();
                self.current_delay_ms = cap_ms;
                let half = cap_ms / 2;
                let delay_ms = half + thread_rng().gen_range(0..=half.max(1));
                Some(Duration::from_millis(delay_ms))
            }
            BackoffKind::DecorrelatedJitter => {
                let delay_ms = self
                    .max_delay_ms
                    .min(thread_rng().gen_range(self.base_delay_ms..=(self.current_delay_ms * 3).max(self.base_delay_ms + 1)));
                self.current_delay_ms = delay_ms.max(self.base_delay_ms);
                Some(Duration::from_millis(delay_ms))
            }
        }
    }

    /// Forget past growth so the next delay starts from the base again. Used
    /// after a successful topology refresh.
    pub fn reset(&mut self) {
        self.current_delay_ms = self.base_delay_ms;
    }

    fn saturating_exp_delay(&self) -> u64 {
        // first call sees current_attempts == 1
        let exponent = self.current_attempts.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// No backoff at all: the first `next_delay_duration` returns `None`.
    pub const fn no_backoff() -> Backoff {
        Backoff {
            kind: BackoffKind::None,
            current_attempts: 0,
            max_attempts: 0,
            base_delay_ms: 0,
            current_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Deterministic exponential backoff: `base * 2^attempt`, capped.
    pub const fn no_jitter_backoff(
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_attempts: u32,
    ) -> Backoff {
        Backoff {
            kind: BackoffKind::NoJitter,
            current_attempts: 0,
            max_attempts,
            base_delay_ms,
            current_delay_ms: base_delay_ms,
            max_delay_ms,
        }
    }

    /// Exponential backoff with the delay drawn uniformly from
    /// `[0, base * 2^attempt]`.
    pub const fn full_jitter_backoff(
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_attempts: u32,
    ) -> Backoff {
        Backoff {
            kind: BackoffKind::FullJitter,
            current_attempts: 0,
            max_attempts,
            base_delay_ms,
            current_delay_ms: base_delay_ms,
            max_delay_ms,
        }
    }

    /// Exponential backoff with half the delay fixed and half jittered.
    pub const fn equal_jitter_backoff(
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_attempts: u32,
    ) -> Backoff {
        Backoff {
            kind: BackoffKind::EqualJitter,
            current_attempts: 0,
            max_attempts,
            base_delay_ms,
            current_delay_ms: base_delay_ms,
            max_delay_ms,
        }
    }

    /// Decorrelated jitter: each delay is drawn from
    /// `[base, 3 * previous_delay]`, capped.
    pub const fn decorrelated_jitter_backoff(
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_attempts: u32,
    ) -> Backoff {
        Backoff {
            kind: BackoffKind::DecorrelatedJitter,
            current_attempts: 0,
            max_attempts,
            base_delay_ms,
            current_delay_ms: base_delay_ms,
            max_delay_ms,
        }
    }
}

/// The pattern for computing backoff times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackoffKind {
    None,
    NoJitter,
    FullJitter,
    EqualJitter,
    DecorrelatedJitter,
}
