//! §4.1 `BackoffTimer`: a one-shot timer producing jittered exponential
//! delays with reset.

use rand::Rng;
use std::time::Duration;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::sleep,
};
use tracing::trace;

const INITIAL_MS: u64 = 1_000;
const MULTIPLIER: f64 = 1.6;
const MAX_MS: u64 = 120_000;
const JITTER: f64 = 0.2;
/// Host timer APIs with a signed 32-bit range bound delays to `~(1<<31)` ms
/// (§9 "Timer precision").
const MAX_TIMER_MS: u64 = 1 << 31;

/// A one-shot, resettable, jittered exponential backoff timer.
///
/// `runOnce` schedules a callback after `delay = min(max, initial *
/// multiplier^n) * uniform(1-jitter, 1+jitter)` and increments `n`. `reset`
/// clears `n` and the pending delay basis, but does not cancel a timer that
/// is already running -- only `stop` does that.
pub struct BackoffTimer {
    attempt: u32,
    task: Option<JoinHandle<()>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl BackoffTimer {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            task: None,
            cancel: None,
        }
    }

    /// The delay that the *next* `run_once` call would use, absent jitter.
    pub fn next_delay_base(&self) -> Duration {
        let scaled = (INITIAL_MS as f64) * MULTIPLIER.powi(self.attempt as i32);
        Duration::from_millis(scaled.min(MAX_MS as f64).min(MAX_TIMER_MS as f64) as u64)
    }

    fn jittered(base: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }

    /// Schedule `cb` to run after the next jittered delay, advancing the
    /// exponent. Spawns onto the current tokio runtime (the single logical
    /// executor per channel owns that runtime per §5).
    pub fn run_once<F>(&mut self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = Self::jittered(self.next_delay_base());
        self.attempt = self.attempt.saturating_add(1);

        let (tx, rx) = oneshot::channel();
        self.cancel = Some(tx);
        trace!(?delay, attempt = self.attempt, "backoff: scheduling");

        self.task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => cb(),
                _ = rx => trace!("backoff: cancelled before firing"),
            }
        }));
    }

    /// Cancel a pending timer, if any.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.task = None;
    }

    /// Reset the exponent and delay basis back to `initial`. Per §4.1, this
    /// does *not* cancel an in-flight timer; call `stop` first if that is
    /// also desired.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Default for BackoffTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
