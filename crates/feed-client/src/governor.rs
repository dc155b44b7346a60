//! Admission control for upstream feed calls.
//!
//! A sliding 60-second window of call timestamps against a configured
//! per-minute quota. The governor knows nothing about what is being
//! fetched; the fetch orchestrator consults it before every batch.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Quota settings for one upstream feed.
#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    pub calls_per_minute: usize,
    /// Hard cap on a single batch regardless of headroom.
    pub max_batch: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: 100,
            max_batch: 50,
        }
    }
}

/// How the scheduler is currently pacing batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    /// Under half the quota: batches may grow to the configured cap.
    Aggressive,
    /// Mid-range usage: headroom-proportional sizing.
    Dynamic,
    /// At or above 80% usage: one call at a time.
    Throttled,
    /// The sizing formula bottomed out and was forced up to one.
    Minimum,
}

impl PacingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacingMode::Aggressive => "aggressive",
            PacingMode::Dynamic => "dynamic",
            PacingMode::Throttled => "throttled",
            PacingMode::Minimum => "minimum",
        }
    }
}

impl fmt::Display for PacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduling decision from the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub size: usize,
    pub mode: PacingMode,
}

/// Sliding-window rate governor. Cloning shares the window.
#[derive(Clone)]
pub struct RateGovernor {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    quota: usize,
    window: Duration,
    max_batch: usize,
}

impl RateGovernor {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            quota: config.calls_per_minute.max(1),
            window: Duration::from_secs(60),
            max_batch: config.max_batch.max(1),
        }
    }

    /// Fraction of the quota used within the current window.
    pub async fn usage(&self) -> f64 {
        self.window_count().await as f64 / self.quota as f64
    }

    /// Time until the next call is admissible. Zero while under quota;
    /// otherwise the time until the oldest timestamp ages out.
    pub async fn should_wait(&self) -> Duration {
        let mut ts = self.timestamps.lock().await;
        let now = Instant::now();
        Self::prune(&mut ts, now, self.window);
        if ts.len() < self.quota {
            return Duration::ZERO;
        }
        match ts.front() {
            Some(oldest) => (*oldest + self.window).duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Reserve a slot, sleeping until the window opens when at quota.
    pub async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();
            Self::prune(&mut ts, now, self.window);

            if ts.len() < self.quota {
                ts.push_back(now);
                return;
            }

            // wait until the oldest call falls out of the window
            let wait_until = match ts.front() {
                Some(oldest) => *oldest + self.window,
                None => now,
            };
            let sleep_dur = wait_until.duration_since(now) + Duration::from_millis(50);
            drop(ts);
            tracing::debug!(
                "Rate window full, waiting {:.1}s for a feed slot",
                sleep_dur.as_secs_f64()
            );
            tokio::time::sleep(sleep_dur).await;
        }
    }

    /// Record an issued call without the admission check, for callers that
    /// already waited out `should_wait()`.
    pub async fn record_call(&self) {
        let mut ts = self.timestamps.lock().await;
        let now = Instant::now();
        Self::prune(&mut ts, now, self.window);
        ts.push_back(now);
    }

    /// Size the next batch from current headroom:
    /// `max(1, floor(quota * (1 - usage) / 2))`, clamped to the remaining
    /// item count and the configured cap. Usage at or past 80% throttles
    /// to single calls; a formula that bottoms out at zero is forced to
    /// one and tagged minimum.
    pub async fn next_batch(&self, remaining: usize) -> BatchPlan {
        if remaining == 0 {
            return BatchPlan {
                size: 0,
                mode: PacingMode::Dynamic,
            };
        }
        let usage = self.window_count().await as f64 / self.quota as f64;
        if usage >= 0.80 {
            return BatchPlan {
                size: 1,
                mode: PacingMode::Throttled,
            };
        }
        let raw = (self.quota as f64 * (1.0 - usage) / 2.0).floor() as usize;
        if raw == 0 {
            return BatchPlan {
                size: 1,
                mode: PacingMode::Minimum,
            };
        }
        let mode = if usage < 0.50 {
            PacingMode::Aggressive
        } else {
            PacingMode::Dynamic
        };
        BatchPlan {
            size: raw.min(self.max_batch).min(remaining).max(1),
            mode,
        }
    }

    async fn window_count(&self) -> usize {
        let mut ts = self.timestamps.lock().await;
        Self::prune(&mut ts, Instant::now(), self.window);
        ts.len()
    }

    fn prune(ts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&front) = ts.front() {
            if now.duration_since(front) >= window {
                ts.pop_front();
            } else {
                break;
            }
        }
    }
}
