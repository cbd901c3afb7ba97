//! Call-outcome counters for a run.
//!
//! Besides cumulative totals, [`RunMetrics`] keeps a window that counts calls
//! since it was last popped. The window closes on call count, not elapsed time.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::controller::Stage;
use crate::provider::CallOutcome;

/// Counts accumulated since the previous closed window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounters {
    pub total: usize,
    pub rate_limited: usize,
    pub server_errors: usize,
}

/// Average and 95th percentile over every recorded call latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub average_ms: f64,
    pub p95_ms: f64,
}

/// Cumulative counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_rate_limited: usize,
    pub requests_server_error: usize,
    pub requests_other_error: usize,
    pub identity_results: usize,
    pub sector_results: usize,
    #[serde(skip)]
    pub db_write_time: Duration,
}

impl MetricsSnapshot {
    /// Share of rate-limited calls as a percentage.
    pub fn rate_limited_pct(&self) -> f64 {
        if self.requests_total == 0 {
            return 0.0;
        }
        self.requests_rate_limited as f64 / self.requests_total as f64 * 100.0
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    totals: MetricsSnapshot,
    window: WindowCounters,
    latencies_ms: Vec<f64>,
}

/// Thread-safe metrics shared by every worker of a run.
#[derive(Debug, Default)]
pub struct RunMetrics {
    inner: Mutex<MetricsInner>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, latency: Duration, outcome: CallOutcome) {
        let mut inner = self.lock();
        inner.totals.requests_total += 1;
        inner.window.total += 1;
        inner.latencies_ms.push(latency.as_secs_f64() * 1_000.0);

        match outcome {
            CallOutcome::Success => {}
            CallOutcome::RateLimited => {
                inner.totals.requests_rate_limited += 1;
                inner.window.rate_limited += 1;
            }
            CallOutcome::ServerError => {
                inner.totals.requests_server_error += 1;
                inner.window.server_errors += 1;
            }
            CallOutcome::Other => {
                inner.totals.requests_other_error += 1;
            }
        }
    }

    /// Closes the current window if it holds at least `min_total` calls,
    /// returning its counters and starting a fresh one. Smaller windows keep
    /// accumulating.
    pub fn pop_window(&self, min_total: usize) -> Option<WindowCounters> {
        let mut inner = self.lock();
        if inner.window.total == 0 || inner.window.total < min_total {
            return None;
        }
        Some(std::mem::take(&mut inner.window))
    }

    /// Counts of the still-open window.
    pub fn open_window(&self) -> WindowCounters {
        self.lock().window
    }

    pub fn record_stage_result(&self, stage: Stage) {
        let mut inner = self.lock();
        match stage {
            Stage::Identity => inner.totals.identity_results += 1,
            Stage::Sector => inner.totals.sector_results += 1,
        }
    }

    pub fn record_db_write(&self, elapsed: Duration) {
        self.lock().totals.db_write_time += elapsed;
    }

    pub fn latency(&self) -> LatencySummary {
        let inner = self.lock();
        if inner.latencies_ms.is_empty() {
            return LatencySummary::default();
        }

        let mut ordered = inner.latencies_ms.clone();
        drop(inner);
        ordered.sort_by(f64::total_cmp);

        let average_ms = ordered.iter().sum::<f64>() / ordered.len() as f64;
        LatencySummary {
            average_ms,
            p95_ms: nearest_rank(&ordered, 0.95),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().totals
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().expect("metrics lock is not poisoned")
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn nearest_rank(ordered: &[f64], percentile: f64) -> f64 {
    let rank = (percentile * ordered.len() as f64).ceil() as usize;
    ordered[rank.clamp(1, ordered.len()) - 1]
}
