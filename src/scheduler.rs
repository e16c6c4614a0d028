//! Concurrency and resource model: `QTimer::singleShot` becomes a scheduler
//! interface with `schedule_at`/`cancel`, deterministic in tests via a mock clock.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::SchedulerError;

/// Opaque handle to a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

/// A monotonic instant, abstracted so tests can drive it manually instead of
/// depending on wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(pub u64);

impl Instant {
    pub fn advance(self, d: Duration) -> Self {
        Instant(self.0 + d.as_millis() as u64)
    }
}

/// The event-loop/timer primitive every per-state deadline is built on. The
/// concrete event loop is injected; this core only needs to be able to set a
/// deadline and find out later whether it fired.
pub trait Scheduler {
    fn now(&self) -> Instant;
    fn schedule_at(&mut self, at: Instant) -> Token;
    /// Cancels a pending timer; errors if `token` already fired or was never
    /// scheduled by this instance.
    fn cancel(&mut self, token: Token) -> Result<(), SchedulerError>;
    /// Returns the tokens whose deadline is now in the past, removing them from
    /// the pending set (idempotent: calling twice only returns each token once).
    fn poll_expired(&mut self) -> Vec<Token>;
}

/// A deterministic, manually-advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    now: u64,
    next_token: u64,
    pending: BTreeMap<u64, u64>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, d: Duration) {
        self.now += d.as_millis() as u64;
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        Instant(self.now)
    }

    fn schedule_at(&mut self, at: Instant) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        self.pending.insert(token, at.0);
        Token(token)
    }

    fn cancel(&mut self, token: Token) -> Result<(), SchedulerError> {
        if self.pending.remove(&token.0).is_none() {
            return Err(SchedulerError::UnknownToken);
        }
        Ok(())
    }

    fn poll_expired(&mut self) -> Vec<Token> {
        let now = self.now;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(&token, _)| token)
            .collect();
        for token in &expired {
            self.pending.remove(token);
        }
        expired.into_iter().map(Token).collect()
    }
}

/// A single offloaded CPU task's outcome, delivered via exactly one resume event.
/// Cancellation is cooperative: the scheduler flags the task and discards the
/// result on arrival if it was cancelled before completion.
pub struct OffloadedTask<T> {
    result: Option<T>,
    cancelled: bool,
}

impl<T> OffloadedTask<T> {
    pub fn completed(result: T) -> Self {
        Self { result: Some(result), cancelled: false }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Takes the result, or `None` if this task was cancelled before arrival.
    pub fn take(self) -> Option<T> {
        if self.cancelled {
            None
        } else {
            self.result
        }
    }
}
