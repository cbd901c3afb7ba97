//! One refresh run: candidates → identity stage → persist → sector stage →
//! persist → summary.

use std::collections::BTreeMap;
use std::sync::Arc;

use secmap_warehouse::{ApplyCounts, IdentityRow, SectorRow};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::EnrichConfig;
use crate::controller::{AdaptiveController, ControllerSnapshot, Stage};
use crate::domain::{Candidate, GicsSector, ResolvedIdentity};
use crate::error::EnrichError;
use crate::executor::{LookupPipeline, Resolution, StageExecutor, StageResult};
use crate::metrics::RunMetrics;
use crate::persist::BatchPersister;
use crate::provider::LookupProvider;
use crate::stages;
use crate::store::{ActiveSector, EnrichmentStore};

/// Per-stage change counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub changed: usize,
    pub unchanged: usize,
    pub unresolved: usize,
    pub deactivated: usize,
    pub inserted: usize,
}

impl StageCounts {
    fn applied(&mut self, counts: ApplyCounts) {
        self.deactivated = counts.deactivated;
        self.inserted = counts.inserted;
    }
}

/// Structured end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub elapsed_seconds: f64,
    pub candidates: usize,
    pub requests_total: usize,
    pub requests_429: usize,
    pub requests_5xx: usize,
    pub request_429_ratio_pct: f64,
    pub latency_avg_ms: f64,
    pub latency_p95_ms: f64,
    pub identity_throughput_per_sec: f64,
    pub sector_throughput_per_sec: f64,
    pub db_write_time_ms: f64,
    pub identity: StageCounts,
    pub sector: StageCounts,
    pub adaptive: ControllerSnapshot,
    /// `key: reason` for the first unresolved items.
    pub failure_preview: Vec<String>,
}

/// Upstream request totals shared by every job summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub requests_total: usize,
    pub requests_429: usize,
    pub requests_5xx: usize,
    pub request_429_ratio_pct: f64,
    pub latency_avg_ms: f64,
    pub latency_p95_ms: f64,
    pub db_write_time_ms: f64,
}

impl RequestStats {
    pub fn from_metrics(metrics: &RunMetrics) -> Self {
        let totals = metrics.snapshot();
        let latency = metrics.latency();
        Self {
            requests_total: totals.requests_total,
            requests_429: totals.requests_rate_limited,
            requests_5xx: totals.requests_server_error,
            request_429_ratio_pct: round_to(totals.rate_limited_pct(), 2),
            latency_avg_ms: round_to(latency.average_ms, 2),
            latency_p95_ms: round_to(latency.p95_ms, 2),
            db_write_time_ms: round_to(totals.db_write_time.as_secs_f64() * 1_000.0, 2),
        }
    }
}

/// Controller, metrics, pipeline and executor of one job, built from its
/// configuration.
pub(crate) struct LookupStack {
    pub(crate) controller: Arc<AdaptiveController>,
    pub(crate) metrics: Arc<RunMetrics>,
    pub(crate) pipeline: LookupPipeline,
    pub(crate) executor: StageExecutor,
}

impl LookupStack {
    pub(crate) fn new(config: &EnrichConfig) -> Self {
        let controller = Arc::new(AdaptiveController::with_limiter(config.controller.clone()));
        let metrics = Arc::new(RunMetrics::new());
        let (jitter_min, jitter_max) = config.pacing_jitter;
        let pipeline = LookupPipeline::new(
            Arc::clone(&controller),
            Arc::clone(&metrics),
            config.identity_retry,
            config.sector_retry,
        )
        .with_jitter(jitter_min, jitter_max);
        let executor = StageExecutor::new(Arc::clone(&controller), Arc::clone(&metrics));
        Self {
            controller,
            metrics,
            pipeline,
            executor,
        }
    }
}

/// Bounded list of failure lines.
pub(crate) struct FailurePreview {
    limit: usize,
    pub(crate) lines: Vec<String>,
}

impl FailurePreview {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            lines: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, key: &str, reason: impl std::fmt::Display) {
        if self.lines.len() < self.limit {
            self.lines.push(format!("{key}: {reason}"));
        }
    }
}

/// Identity stage outcome, reduced to what the sector stage and the store need.
#[derive(Debug, Default)]
struct IdentityOutcome {
    counts: StageCounts,
    changed_rows: Vec<IdentityRow>,
    /// CUSIP → canonical ticker of every resolved candidate.
    resolved: BTreeMap<String, String>,
    /// Sector stage input, one per distinct provider symbol, sorted.
    sector_inputs: Vec<ResolvedIdentity>,
}

/// Wires a store, a provider and a configuration into one run.
pub struct EnrichmentRun<'a> {
    config: EnrichConfig,
    store: &'a dyn EnrichmentStore,
    provider: &'a dyn LookupProvider,
}

impl<'a> EnrichmentRun<'a> {
    pub fn new(
        config: EnrichConfig,
        store: &'a dyn EnrichmentStore,
        provider: &'a dyn LookupProvider,
    ) -> Self {
        Self {
            config,
            store,
            provider,
        }
    }

    /// Runs both stages and persists their changes.
    ///
    /// Lookup failures end up in the summary. Only a store failure aborts the
    /// run; identity changes already written stay written.
    pub async fn execute(&self) -> Result<RunSummary, EnrichError> {
        self.config.validate()?;
        let config = &self.config;
        let run_id = Uuid::new_v4();
        let started_at = OffsetDateTime::now_utc();
        let run_started = Instant::now();

        let mut candidates = self
            .store
            .candidates(config.top_institutions)
            .map_err(EnrichError::StoreRead)?;
        if config.item_limit > 0 {
            candidates.truncate(config.item_limit);
        }
        let active_identities = self
            .store
            .active_identities()
            .map_err(EnrichError::StoreRead)?;
        let candidate_count = candidates.len();

        let LookupStack {
            controller,
            metrics,
            pipeline,
            executor,
        } = LookupStack::new(config);
        let persister = BatchPersister::new(self.store, &metrics, config.batch_size);
        let mut failures = FailurePreview::new(config.failure_preview_limit);

        tracing::info!(
            %run_id,
            candidates = candidate_count,
            dry_run = config.dry_run,
            identity_workers = config.controller.identity.workers.initial,
            sector_workers = config.controller.sector.workers.initial,
            global_rate = config.controller.rate.initial,
            burst = config.controller.burst,
            batch_size = config.batch_size,
            "refresh started"
        );

        let provider = self.provider;
        let identity_results = executor
            .run(Stage::Identity, candidates, |candidate| {
                stages::resolve_identity(&pipeline, provider, candidate)
            })
            .await;

        let mut identity =
            reduce_identity_results(identity_results, &active_identities, &mut failures);
        if config.dry_run {
            tracing::info!(changed = identity.counts.changed, "dry run, identity changes not written");
        } else if !identity.changed_rows.is_empty() {
            let rows = std::mem::take(&mut identity.changed_rows);
            let applied = persister
                .apply_identities(rows, &config.identity_provenance())
                .map_err(EnrichError::StoreWrite)?;
            identity.counts.applied(applied);
        }
        tracing::info!(
            changed = identity.counts.changed,
            unchanged = identity.counts.unchanged,
            unresolved = identity.counts.unresolved,
            deactivated = identity.counts.deactivated,
            inserted = identity.counts.inserted,
            "identity refresh complete"
        );

        let active_sectors = self
            .store
            .active_sectors()
            .map_err(EnrichError::StoreRead)?;
        let sector_inputs = std::mem::take(&mut identity.sector_inputs);
        let sector_results = executor
            .run(Stage::Sector, sector_inputs, |resolved| {
                stages::classify_identity(&pipeline, provider, resolved)
            })
            .await;

        let (mut sector_counts, sector_rows) = reduce_sector_results(
            sector_results,
            &identity.resolved,
            &active_sectors,
            &mut failures,
        );
        if config.dry_run {
            tracing::info!(changed = sector_counts.changed, "dry run, sector changes not written");
        } else if !sector_rows.is_empty() {
            let applied = persister
                .apply_sectors(sector_rows, &config.sector_provenance())
                .map_err(EnrichError::StoreWrite)?;
            sector_counts.applied(applied);
        }
        tracing::info!(
            changed = sector_counts.changed,
            unchanged = sector_counts.unchanged,
            unresolved = sector_counts.unresolved,
            deactivated = sector_counts.deactivated,
            inserted = sector_counts.inserted,
            failures_sampled = failures.lines.len(),
            "sector refresh complete"
        );

        let elapsed_seconds = run_started.elapsed().as_secs_f64().max(0.001);
        let totals = metrics.snapshot();
        let requests = RequestStats::from_metrics(&metrics);

        Ok(RunSummary {
            run_id,
            dry_run: config.dry_run,
            started_at,
            elapsed_seconds: round_to(elapsed_seconds, 2),
            candidates: candidate_count,
            requests_total: requests.requests_total,
            requests_429: requests.requests_429,
            requests_5xx: requests.requests_5xx,
            request_429_ratio_pct: requests.request_429_ratio_pct,
            latency_avg_ms: requests.latency_avg_ms,
            latency_p95_ms: requests.latency_p95_ms,
            identity_throughput_per_sec: round_to(
                totals.identity_results as f64 / elapsed_seconds,
                3,
            ),
            sector_throughput_per_sec: round_to(totals.sector_results as f64 / elapsed_seconds, 3),
            db_write_time_ms: requests.db_write_time_ms,
            identity: identity.counts,
            sector: sector_counts,
            adaptive: controller.snapshot(),
            failure_preview: failures.lines,
        })
    }
}

fn reduce_identity_results(
    results: Vec<StageResult<Candidate, ResolvedIdentity>>,
    active: &BTreeMap<String, String>,
    failures: &mut FailurePreview,
) -> IdentityOutcome {
    let mut outcome = IdentityOutcome::default();
    let mut provider_to_ticker = BTreeMap::new();

    for result in results {
        let cusip = result.input.cusip.as_str();
        let identity = match result.resolution {
            Resolution::Resolved(identity) => identity,
            Resolution::Unresolved(reason) => {
                outcome.counts.unresolved += 1;
                failures.push(cusip, reason);
                continue;
            }
        };

        let ticker = identity.ticker.as_str().to_owned();
        outcome.resolved.insert(cusip.to_owned(), ticker.clone());
        if active.get(cusip) == Some(&ticker) {
            outcome.counts.unchanged += 1;
        } else {
            outcome.counts.changed += 1;
            outcome.changed_rows.push(IdentityRow {
                cusip: cusip.to_owned(),
                ticker,
            });
        }
        provider_to_ticker.insert(identity.provider_symbol.clone(), identity);
    }

    outcome.sector_inputs = provider_to_ticker.into_values().collect();
    outcome
}

fn reduce_sector_results(
    results: Vec<StageResult<ResolvedIdentity, GicsSector>>,
    resolved: &BTreeMap<String, String>,
    active: &BTreeMap<String, ActiveSector>,
    failures: &mut FailurePreview,
) -> (StageCounts, Vec<SectorRow>) {
    let mut cusip_by_ticker: BTreeMap<&str, &str> = BTreeMap::new();
    for (cusip, ticker) in resolved {
        cusip_by_ticker.entry(ticker.as_str()).or_insert(cusip.as_str());
    }

    let mut counts = StageCounts::default();
    let mut rows = Vec::new();
    for result in results {
        let ticker = result.input.ticker.as_str();
        let sector = match result.resolution {
            Resolution::Resolved(sector) => sector,
            Resolution::Unresolved(reason) => {
                counts.unresolved += 1;
                failures.push(ticker, reason);
                continue;
            }
        };

        let unchanged = active.get(ticker).is_some_and(|current| {
            current.sector_code == sector.code && current.sector_label == sector.label
        });
        if unchanged {
            counts.unchanged += 1;
            continue;
        }

        counts.changed += 1;
        rows.push(SectorRow {
            ticker: ticker.to_owned(),
            cusip: cusip_by_ticker.get(ticker).map(|cusip| (*cusip).to_owned()),
            sector_code: sector.code.to_owned(),
            sector_label: sector.label.to_owned(),
        });
    }

    (counts, rows)
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10_f64.powi(places);
    (value * scale).round() / scale
}
