//! Stage execution: the per-call pipeline and the dynamically sized pool.
//!
//! [`LookupPipeline::call`] wraps one provider operation with cooldown, stop
//! check, token bucket, pacing, outcome recording and bounded retry.
//! [`StageExecutor::run`] drains a stage's inputs through a
//! `FuturesUnordered` set whose admitted size is re-read from the
//! controller at every scheduling decision.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::controller::{AdaptiveController, Stage};
use crate::metrics::RunMetrics;
use crate::provider::{CallOutcome, LookupError, RequestGate};
use crate::retry::RetryPolicy;

const PROGRESS_EVERY: usize = 100;

/// Why an input ended a stage without a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum UnresolvedReason {
    /// No acceptable match was found.
    Unresolved,
    /// Detail was fetched but its sector is not in the vocabulary.
    SectorUnmapped,
    /// The stop flag was set before this input could complete.
    StoppedDueToThrottle,
    /// Attempts ran out and the last one was throttled.
    RateLimited,
    /// Attempts ran out on some other failure.
    FetchFailed(String),
    /// The replacement search found the stale ticker again.
    ReplacementSameAsOld,
    /// Every CUSIP of the ticker is now actively mapped to some other symbol.
    ConflictingIdentity,
}

impl UnresolvedReason {
    /// Reason recorded when a call ran out of attempts on `error`.
    pub fn exhausted(error: &LookupError) -> Self {
        match error.outcome() {
            CallOutcome::RateLimited => Self::RateLimited,
            _ => Self::FetchFailed(error.message().to_owned()),
        }
    }
}

impl Display for UnresolvedReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => f.write_str("unresolved"),
            Self::SectorUnmapped => f.write_str("sector_unmapped"),
            Self::StoppedDueToThrottle => f.write_str("stopped_due_to_throttle"),
            Self::RateLimited => f.write_str("rate_limited"),
            Self::FetchFailed(message) => write!(f, "fetch_failed:{message}"),
            Self::ReplacementSameAsOld => f.write_str("replacement_same_as_old"),
            Self::ConflictingIdentity => f.write_str("conflicting_active_identity"),
        }
    }
}

impl From<UnresolvedReason> for String {
    fn from(value: UnresolvedReason) -> Self {
        value.to_string()
    }
}

/// Terminal outcome of one input in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<V> {
    Resolved(V),
    Unresolved(UnresolvedReason),
}

impl<V> Resolution<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Unresolved(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&UnresolvedReason> {
        match self {
            Self::Resolved(_) => None,
            Self::Unresolved(reason) => Some(reason),
        }
    }
}

/// An input together with its terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult<I, V> {
    pub input: I,
    pub resolution: Resolution<V>,
}

/// Runs provider operations under the controller, limiter and retry policy.
#[derive(Debug, Clone)]
pub struct LookupPipeline {
    controller: Arc<AdaptiveController>,
    metrics: Arc<RunMetrics>,
    identity_retry: RetryPolicy,
    sector_retry: RetryPolicy,
    jitter_ms: RangeInclusive<u64>,
}

impl LookupPipeline {
    pub fn new(
        controller: Arc<AdaptiveController>,
        metrics: Arc<RunMetrics>,
        identity_retry: RetryPolicy,
        sector_retry: RetryPolicy,
    ) -> Self {
        Self {
            controller,
            metrics,
            identity_retry,
            sector_retry,
            jitter_ms: 30..=120,
        }
    }

    /// Replaces the random pacing added on top of the stage delay.
    pub fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        let min = min.as_millis() as u64;
        let max = (max.as_millis() as u64).max(min);
        self.jitter_ms = min..=max;
        self
    }

    pub fn retry_policy(&self, stage: Stage) -> &RetryPolicy {
        match stage {
            Stage::Identity => &self.identity_retry,
            Stage::Sector => &self.sector_retry,
        }
    }

    /// Performs `operation` with bounded retries.
    ///
    /// Each attempt waits out the cooldown, returns
    /// [`UnresolvedReason::StoppedDueToThrottle`] if the stop flag is set,
    /// takes a token, sleeps the live stage delay plus jitter, then calls.
    /// The classified outcome is recorded; a closed window is handed to the
    /// controller.
    pub async fn call<T, F, Fut>(&self, stage: Stage, mut operation: F) -> Result<T, UnresolvedReason>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LookupError>>,
    {
        let policy = *self.retry_policy(stage);
        let mut attempt = 0;

        loop {
            attempt += 1;

            self.controller.await_cooldown().await;
            if self.controller.is_stopped() {
                return Err(UnresolvedReason::StoppedDueToThrottle);
            }

            self.controller.limiter().acquire().await;
            let delay = self.controller.current_limits(stage).delay;
            tokio::time::sleep(delay + self.jitter()).await;

            let started = Instant::now();
            let result = operation().await;
            let outcome = match &result {
                Ok(_) => CallOutcome::Success,
                Err(error) => error.outcome(),
            };
            self.record(started.elapsed(), outcome);

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !policy.should_retry(attempt) {
                tracing::debug!(stage = %stage, attempt, error = %error, "attempts exhausted");
                return Err(UnresolvedReason::exhausted(&error));
            }

            let backoff = policy.delay_after(attempt, outcome);
            tracing::debug!(
                stage = %stage,
                attempt,
                ?outcome,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "lookup failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Gate for the extra requests a provider makes inside one call.
    pub fn gate(&self) -> PipelineGate<'_> {
        PipelineGate { pipeline: self }
    }

    fn record(&self, latency: Duration, outcome: CallOutcome) {
        self.metrics.record_call(latency, outcome);
        let window_size = self.controller.config().window_size;
        if let Some(window) = self.metrics.pop_window(window_size) {
            self.controller
                .observe_window(window.total, window.rate_limited);
        }
    }

    fn jitter(&self) -> Duration {
        Duration::from_millis(fastrand::u64(self.jitter_ms.clone()))
    }
}

/// Takes a token from the run's limiter for every admitted request and feeds
/// every recorded outcome into the run's metrics windows.
#[derive(Debug, Clone, Copy)]
pub struct PipelineGate<'a> {
    pipeline: &'a LookupPipeline,
}

impl RequestGate for PipelineGate<'_> {
    fn admit(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.pipeline.controller.limiter().acquire())
    }

    fn record(&self, latency: Duration, outcome: CallOutcome) {
        self.pipeline.record(latency, outcome);
    }
}

/// Drains one stage's inputs through a pool sized live by the controller.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    controller: Arc<AdaptiveController>,
    metrics: Arc<RunMetrics>,
}

impl StageExecutor {
    pub fn new(controller: Arc<AdaptiveController>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            controller,
            metrics,
        }
    }

    /// Runs `operation` over every input and returns exactly one result per
    /// input, in completion order.
    ///
    /// New work is admitted while inputs remain, the stop flag is unset and
    /// fewer operations are in flight than the stage's current worker
    /// ceiling. Once stopped, in-flight operations finish and the inputs that
    /// were never admitted come back as
    /// [`UnresolvedReason::StoppedDueToThrottle`].
    pub async fn run<I, V, F, Fut>(
        &self,
        stage: Stage,
        inputs: Vec<I>,
        mut operation: F,
    ) -> Vec<StageResult<I, V>>
    where
        I: Clone,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Resolution<V>>,
    {
        let total = inputs.len();
        let mut results = Vec::with_capacity(total);
        let mut pending = inputs.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut completed = 0;

        tracing::info!(stage = %stage, total, "stage started");

        loop {
            let ceiling = self.controller.current_limits(stage).workers;
            while !self.controller.is_stopped() && in_flight.len() < ceiling {
                let Some(input) = pending.next() else {
                    break;
                };
                let lookup = operation(input.clone());
                in_flight.push(async move {
                    StageResult {
                        input,
                        resolution: lookup.await,
                    }
                });
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            self.metrics.record_stage_result(stage);
            results.push(result);

            completed += 1;
            if completed % PROGRESS_EVERY == 0 || completed == total {
                tracing::info!(stage = %stage, completed, total, "stage progress");
            }
        }

        let skipped = pending.len();
        if skipped > 0 {
            tracing::warn!(stage = %stage, skipped, "stage stopped before all inputs were started");
        }
        results.extend(pending.map(|input| StageResult {
            input,
            resolution: Resolution::Unresolved(UnresolvedReason::StoppedDueToThrottle),
        }));

        results
    }
}
