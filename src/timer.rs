//! Timer primitives (spec §4.4).
//!
//! Production code drives these from `tokio`'s runtime clock; tests drive
//! them with `tokio::time`'s paused virtual clock
//! (`#[tokio::test(start_paused = true)]` + `tokio::time::advance`), which is
//! the idiomatic Rust stand-in for spec §9's injectable delayed-task queue —
//! no bespoke scheduler trait is introduced.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, Sleep};

/// `tries -> seconds` lookup used by both the reconnect and rejoin timers.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

const RECONNECT_TABLE_SECS: [f64; 9] = [0.01, 0.05, 0.10, 0.15, 0.20, 0.25, 0.50, 1.00, 2.00];
const RECONNECT_SATURATION_SECS: f64 = 5.0;

const REJOIN_TABLE_SECS: [u64; 3] = [1, 2, 5];
const REJOIN_SATURATION_SECS: u64 = 10;

/// Default socket reconnect back-off: stepped, saturating at 5s from the
/// 10th attempt onward.
pub fn default_reconnect_backoff() -> BackoffFn {
    Arc::new(|tries| {
        let secs = RECONNECT_TABLE_SECS
            .get(tries.saturating_sub(1) as usize)
            .copied()
            .unwrap_or(RECONNECT_SATURATION_SECS);
        Duration::from_secs_f64(secs)
    })
}

/// Default channel rejoin back-off: stepped, saturating at 10s from the 4th
/// attempt onward.
pub fn default_rejoin_backoff() -> BackoffFn {
    Arc::new(|tries| {
        let secs = REJOIN_TABLE_SECS
            .get(tries.saturating_sub(1) as usize)
            .copied()
            .unwrap_or(REJOIN_SATURATION_SECS);
        Duration::from_secs(secs)
    })
}

/// A stepped back-off timer used by both the socket's reconnect loop and a
/// channel's rejoin loop.
pub(crate) struct BackoffTimer {
    strategy: BackoffFn,
    tries: u32,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl BackoffTimer {
    pub(crate) fn new(strategy: BackoffFn) -> Self {
        Self {
            strategy,
            tries: 0,
            sleep: None,
        }
    }

    /// Schedules the next expiry based on the current try count, then
    /// increments it.
    pub(crate) fn schedule(&mut self) {
        self.tries += 1;
        let duration = (self.strategy)(self.tries);
        self.sleep = Some(Box::pin(tokio::time::sleep(duration)));
    }

    /// Cancels any in-flight expiry and resets the try counter. After this
    /// call, `poll_expired` never resolves until `schedule` is called again
    /// — satisfies spec §8's timer-hygiene property.
    pub(crate) fn reset(&mut self) {
        self.tries = 0;
        self.sleep = None;
    }

    pub(crate) fn tries(&self) -> u32 {
        self.tries
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.sleep.is_some()
    }

    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.sleep.as_mut() {
            Some(sleep) => match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.sleep = None;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }

    /// Waits for the current expiry. Pending forever if nothing is
    /// scheduled — callers must race this against other futures.
    pub(crate) async fn expired(&mut self) {
        std::future::poll_fn(|cx| self.poll_expired(cx)).await
    }
}

/// Fixed-interval repeating timer (spec §4.4's `HeartbeatTimer`).
///
/// `start` is idempotent: calling it while already running replaces the
/// prior timer, restarting the phase.
pub(crate) struct HeartbeatTimer {
    interval: Duration,
    ticker: Option<Pin<Box<Interval>>>,
}

impl HeartbeatTimer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            ticker: None,
        }
    }

    pub(crate) fn start(&mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of `tokio::time::interval` fires immediately;
        // consume it so `is_valid` callers see a timer whose *next* firing
        // is a full interval away, matching "every heartbeat_interval".
        interval.reset();
        self.ticker = Some(Box::pin(interval));
    }

    pub(crate) fn stop(&mut self) {
        self.ticker = None;
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.ticker.is_some()
    }

    pub(crate) fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.ticker.as_mut() {
            Some(ticker) => ticker.as_mut().poll_tick(cx).map(|_| ()),
            None => Poll::Pending,
        }
    }

    /// Pending forever if the timer is stopped.
    pub(crate) async fn tick(&mut self) {
        std::future::poll_fn(|cx| self.poll_tick(cx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_matches_table_then_saturates() {
        let f = default_reconnect_backoff();
        assert_eq!(f(1), Duration::from_secs_f64(0.01));
        assert_eq!(f(9), Duration::from_secs_f64(2.00));
        assert_eq!(f(10), Duration::from_secs_f64(5.0));
        assert_eq!(f(100), Duration::from_secs_f64(5.0));
    }

    #[test]
    fn rejoin_backoff_matches_table_then_saturates() {
        let f = default_rejoin_backoff();
        assert_eq!(f(1), Duration::from_secs(1));
        assert_eq!(f(3), Duration::from_secs(5));
        assert_eq!(f(4), Duration::from_secs(10));
        assert_eq!(f(50), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_timer_does_not_fire_after_reset() {
        let mut timer = BackoffTimer::new(default_reconnect_backoff());
        timer.schedule();
        timer.reset();

        tokio::time::advance(Duration::from_secs(60)).await;

        // Polling once more must still be Pending: nothing is scheduled.
        let ready = std::future::poll_fn(|cx| Poll::Ready(timer.poll_expired(cx).is_ready()))
            .await;
        assert!(!ready);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_timer_fires_after_scheduled_duration() {
        let mut timer = BackoffTimer::new(default_reconnect_backoff());
        timer.schedule(); // tries = 1 -> 10ms

        tokio::time::advance(Duration::from_millis(11)).await;
        timer.expired().await;
        assert_eq!(timer.tries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timer_start_is_idempotent() {
        let mut timer = HeartbeatTimer::new(Duration::from_secs(30));
        timer.start();
        assert!(timer.is_valid());
        timer.start();
        assert!(timer.is_valid());
        timer.stop();
        assert!(!timer.is_valid());
    }
}
