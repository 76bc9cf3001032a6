//! Aggregate preload progress.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreloadProgress {
    /// Loaded, loading and queued items.
    pub total: usize,
    pub loaded: usize,
    /// Whole percent; 100 when nothing is tracked.
    pub percentage: u8,
    pub estimated_time_remaining: Duration,
}

impl PreloadProgress {
    pub fn compute(loaded: usize, loading: usize, queued: usize, average: Duration) -> Self {
        let total = loaded + loading + queued;
        let percentage = if total == 0 {
            100
        } else {
            u8::try_from(loaded * 100 / total).unwrap_or(100)
        };
        let remaining = u32::try_from(total - loaded).unwrap_or(u32::MAX);
        Self {
            total,
            loaded,
            percentage,
            estimated_time_remaining: average.saturating_mul(remaining),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.loaded >= self.total
    }
}

/// Running (unwindowed) average of load durations.
#[derive(Debug, Default)]
pub(crate) struct LoadTimer {
    samples: u32,
    average: Duration,
}

impl LoadTimer {
    pub(crate) fn record(&mut self, elapsed: Duration) {
        let samples = self.samples.saturating_add(1);
        let previous = self.average.as_secs_f64() * f64::from(self.samples);
        self.average =
            Duration::from_secs_f64((previous + elapsed.as_secs_f64()) / f64::from(samples));
        self.samples = samples;
    }

    pub(crate) fn average(&self) -> Duration {
        self.average
    }
}

/// Follows the progress broadcast and keeps the latest snapshot.
#[derive(Debug)]
pub struct ProgressWatcher {
    receiver: broadcast::Receiver<PreloadProgress>,
    latest: PreloadProgress,
}

impl ProgressWatcher {
    pub(crate) fn new(
        receiver: broadcast::Receiver<PreloadProgress>,
        latest: PreloadProgress,
    ) -> Self {
        Self { receiver, latest }
    }

    pub fn latest(&self) -> PreloadProgress {
        self.latest
    }

    pub fn is_loading(&self) -> bool {
        !self.latest.is_complete()
    }

    /// Wait for the next update. Returns `None` once the preloader is gone.
    pub async fn changed(&mut self) -> Option<PreloadProgress> {
        loop {
            match self.receiver.recv().await {
                Ok(progress) => {
                    self.latest = progress;
                    return Some(progress);
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
