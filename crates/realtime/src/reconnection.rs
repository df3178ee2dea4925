//! Reconnection policy with exponential backoff.
//!
//! The scheduler is plain state (attempt counter plus the pending timer's
//! cancellation token). The timer itself is a spawned task racing
//! `tokio::time::sleep` against the token; see [`spawn_timer`].

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ReconnectConfig;

/// Outcome of asking the scheduler for the next retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RetryDecision {
    /// Attempt budget used up.
    Exhausted,
    /// Retry number `attempt` (1-based) after `delay`.
    Retry { attempt: u32, delay: Duration },
}

#[derive(Debug)]
pub(crate) struct ReconnectScheduler {
    config: ReconnectConfig,
    attempt: u32,
    timer: Option<(u64, CancellationToken)>,
    next_timer_id: u64,
}

impl ReconnectScheduler {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            timer: None,
            next_timer_id: 0,
        }
    }

    /// Number of retries made since the last successful open.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decides whether another retry is allowed and, if so, bumps the
    /// attempt counter and computes the jittered delay.
    pub(crate) fn next_retry(&mut self) -> RetryDecision {
        let max = self.config.max_attempts;
        if max != 0 && self.attempt >= max {
            return RetryDecision::Exhausted;
        }
        let base = backoff_delay(&self.config, self.attempt);
        let sample = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let delay = apply_jitter(base, self.config.jitter, sample);
        self.attempt = self.attempt.saturating_add(1);
        RetryDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Resets the attempt counter after a successful open.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Registers a new pending timer, cancelling any previous one.
    /// Returns the timer id and its token.
    pub(crate) fn arm(&mut self) -> (u64, CancellationToken) {
        self.cancel();
        self.next_timer_id += 1;
        let token = CancellationToken::new();
        self.timer = Some((self.next_timer_id, token.clone()));
        (self.next_timer_id, token)
    }

    /// Claims the pending timer if `id` is still the current one.
    ///
    /// A superseded timer that fired anyway gets `false` and must do nothing.
    pub(crate) fn take_fired(&mut self, id: u64) -> bool {
        let current = self.timer.as_ref().is_some_and(|(t, _)| *t == id);
        if current {
            self.timer = None;
        }
        current
    }

    /// Cancels the pending timer, if any.
    pub(crate) fn cancel(&mut self) {
        if let Some((id, token)) = self.timer.take() {
            debug!(timer = id, "reconnect timer cancelled");
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn has_pending_timer(&self) -> bool {
        self.timer.is_some()
    }
}

/// Un-jittered delay before retry number `attempt + 1`:
/// `min(initial * multiplier^attempt, max)`.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exp = attempt.min(i32::MAX as u32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.multiplier.powi(exp);
    let capped = secs.min(config.max_delay.as_secs_f64());
    Duration::try_from_secs_f64(capped.max(0.0)).unwrap_or(config.max_delay)
}

/// Perturbs `delay` by `delay * jitter * sample`, `sample` in `[-1, 1]`,
/// clamped at zero.
pub fn apply_jitter(delay: Duration, jitter: f64, sample: f64) -> Duration {
    let base = delay.as_secs_f64();
    let jittered = base + base * jitter * sample.clamp(-1.0, 1.0);
    Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(Duration::MAX)
}

/// Spawns the retry timer. `on_fire` runs only if the token was not
/// cancelled before `delay` elapsed. The deadline counts from this call,
/// not from the first poll of the task.
pub(crate) fn spawn_timer<F>(delay: Duration, cancel: CancellationToken, on_fire: F)
where
    F: FnOnce() + Send + 'static,
{
    let deadline = tokio::time::sleep(delay);
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = deadline => {
                if !cancel.is_cancelled() {
                    on_fire();
                }
            }
        }
    });
}
