// Clock and tick source
// Ticks are aligned to interval boundaries (minute boundaries by default) and
// drive both the dispatch cycle and lease expiry observation.

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic tests and replays
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Truncate a timestamp to the start of its minute
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_interval(ts, 60)
}

/// Truncate a timestamp to the start of its `interval_seconds` window
pub fn truncate_to_interval(ts: DateTime<Utc>, interval_seconds: u64) -> DateTime<Utc> {
    let interval = TimeDelta::seconds(interval_seconds.max(1) as i64);
    ts.duration_trunc(interval).unwrap_or(ts)
}

/// Emits logical ticks. `None` means the source is exhausted.
#[async_trait]
pub trait TickSource: Send {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>>;
}

/// Tick source that sleeps until the next interval boundary
pub struct IntervalTickSource {
    interval_seconds: u64,
    clock: Arc<dyn Clock>,
}

impl IntervalTickSource {
    pub fn new(interval_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval_seconds: interval_seconds.max(1),
            clock,
        }
    }

    /// Time left until the next boundary strictly after `now`
    fn until_next_boundary(&self, now: DateTime<Utc>) -> (DateTime<Utc>, Duration) {
        let boundary = truncate_to_interval(now, self.interval_seconds)
            + TimeDelta::seconds(self.interval_seconds as i64);
        let wait = (boundary - now).to_std().unwrap_or(Duration::ZERO);
        (boundary, wait)
    }
}

#[async_trait]
impl TickSource for IntervalTickSource {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        let (boundary, wait) = self.until_next_boundary(self.clock.now());
        debug!(
            next_tick = %boundary,
            wait_ms = wait.as_millis() as u64,
            "Waiting for next tick boundary"
        );
        tokio::time::sleep(wait).await;
        Some(boundary)
    }
}

/// Tick source fed through a channel (manual triggering, tests)
pub struct ChannelTickSource {
    rx: mpsc::Receiver<DateTime<Utc>>,
}

impl ChannelTickSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<DateTime<Utc>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl TickSource for ChannelTickSource {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        self.rx.recv().await
    }
}
