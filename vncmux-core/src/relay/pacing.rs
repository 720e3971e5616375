//! Frame pacing.
//!
//! Each tick gets a [`TickBudget`] measured from that tick's actual
//! start. The time left after the copy step is spent servicing the
//! upstream, so waiting for the next tick and processing protocol
//! traffic are the same activity. Budgets never carry over: a slow
//! tick is followed by a normal one, not by a burst of short ones.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::RelayError;

/// Something that can block for up to a timeout while handling events.
#[async_trait]
pub trait EventSource: Send {
    /// Wait at most `timeout` and return how many events were handled.
    async fn wait_for_events(&mut self, timeout: Duration) -> Result<usize, RelayError>;
}

// ── FramePacer ───────────────────────────────────────────────────

/// Produces one [`TickBudget`] per tick at a fixed target rate.
#[derive(Debug, Clone, Copy)]
pub struct FramePacer {
    interval: Duration,
}

impl FramePacer {
    /// A pacer for `fps` frames per second. Zero is treated as 1.
    pub fn from_fps(fps: u32) -> Self {
        let fps = u64::from(fps.max(1));
        Self {
            interval: Duration::from_nanos(1_000_000_000 / fps),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the budget for a new tick, now.
    pub fn begin_tick(&self) -> TickBudget {
        TickBudget {
            started: Instant::now(),
            interval: self.interval,
        }
    }
}

// ── TickBudget ───────────────────────────────────────────────────

/// The time allotted to one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickBudget {
    started: Instant,
    interval: Duration,
}

/// What happened while a budget was spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaceOutcome {
    /// Events handled by the source.
    pub events: usize,
    /// Number of `wait_for_events` calls.
    pub polls: u32,
    /// The budget was already gone before pacing started.
    pub overrun: bool,
}

impl TickBudget {
    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.interval
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, or `None` once the budget is used up.
    pub fn remaining(&self) -> Option<Duration> {
        self.interval
            .checked_sub(self.elapsed())
            .filter(|left| !left.is_zero())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_none()
    }

    /// Spend the rest of the budget servicing `source`.
    ///
    /// Every call is bounded by the time remaining, so the tick ends on
    /// schedule however busy the source is. A source that returns early
    /// without events makes the tick sleep out its budget instead of
    /// spinning. An exhausted budget gets exactly one non-blocking call.
    pub async fn service<S>(&self, source: &mut S) -> Result<PaceOutcome, RelayError>
    where
        S: EventSource + ?Sized,
    {
        if self.is_exhausted() {
            let events = source.wait_for_events(Duration::ZERO).await?;
            return Ok(PaceOutcome {
                events,
                polls: 1,
                overrun: true,
            });
        }

        let mut outcome = PaceOutcome::default();
        while let Some(remaining) = self.remaining() {
            let events = source.wait_for_events(remaining).await?;
            outcome.polls += 1;
            outcome.events += events;
            if events == 0 && !self.is_exhausted() {
                tokio::time::sleep_until(self.deadline()).await;
            }
        }
        Ok(outcome)
    }
}

// ── Tests ────────────────────────────────────────────────────────
